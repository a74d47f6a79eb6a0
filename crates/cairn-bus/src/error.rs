use std::io;

/// Errors produced by the task pool and message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The task manager has been stopped and accepts no new work.
    #[error("task manager is stopped")]
    Stopped,

    /// The worker runtime could not be created.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience alias used throughout the bus crate.
pub type Result<T> = std::result::Result<T, BusError>;
