//! Asynchronous task pool and typed message bus for Cairn.
//!
//! The storage engine never calls replication or indexing directly. It
//! posts messages to a [`MessageManager`]; subscribers registered for the
//! message type run as independent jobs on the bounded [`TaskManager`] pool.
//! Job failures are contained and logged at the task boundary.

pub mod config;
pub mod error;
pub mod message;
pub mod task;

pub use config::BusConfig;
pub use error::BusError;
pub use message::{handler_fn, FnHandler, Handler, Message, MessageManager};
pub use task::{ScheduleHandle, TaskManager};
