use std::fmt;

use cairn_bus::Message;
use cairn_types::ContentHash;
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle and change notifications for a whole repository.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "guid", rename_all = "snake_case")]
pub enum RepositoryMessage {
    Opened(Uuid),
    Closed(Uuid),
    Removed(Uuid),
    /// Something changed in the repository; see the matching [`ContentEvent`].
    NewEvent(Uuid),
}

impl RepositoryMessage {
    pub fn guid(&self) -> Uuid {
        match self {
            Self::Opened(guid) | Self::Closed(guid) | Self::Removed(guid) | Self::NewEvent(guid) => {
                *guid
            }
        }
    }
}

impl fmt::Display for RepositoryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Opened(_) => "opened",
            Self::Closed(_) => "closed",
            Self::Removed(_) => "removed",
            Self::NewEvent(_) => "new-event",
        };
        write!(f, "repository {} {kind}", self.guid())
    }
}

impl Message for RepositoryMessage {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentEventKind {
    Stored,
    Deleted,
}

/// A single content item was stored in or deleted from a repository.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContentEvent {
    pub guid: Uuid,
    pub hash: ContentHash,
    pub kind: ContentEventKind,
}

impl Message for ContentEvent {}
