use thiserror::Error;
use watchparty_core::{BusError, StreamError, TorrentError};

use crate::{DatabaseError, PrimaryKey};

/// The errors surfaced by a room session
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CollabError {
    /// A bus or store call failed. Only retried when resubmitted.
    #[error("Network error: {0}")]
    TransientNetwork(String),
    #[error(transparent)]
    Torrent(#[from] TorrentError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("The name {0} is already used in this room")]
    NameConflict(String),
    /// The room was deleted or never existed
    #[error("Room not found")]
    NotFound,
    #[error("A name is required to send messages")]
    NameRequired,
    #[error("Invalid video source: {0}")]
    InvalidSource(String),
    #[error("Only the host can do this")]
    NotHost,
}

/// The last error of each mutable slice of a session, shown next to the
/// control that caused it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SessionErrors {
    pub video_source: Option<CollabError>,
    pub message: Option<MessageError>,
    pub display_name: Option<CollabError>,
    pub stream: Option<CollabError>,
    /// Seeding or fetching the room's content failed
    pub content: Option<CollabError>,
}

/// A message that could not be sent, kept so it can be resent or retracted
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    pub error: CollabError,
    /// The optimistic copy, if one was shown
    pub message_id: Option<PrimaryKey>,
    pub content: String,
}

impl CollabError {
    /// Returns true if the session can't recover from the error
    pub fn is_terminal(&self) -> bool {
        matches!(self, CollabError::NotFound)
    }

    /// Returns true if the content of the room can't be fetched and should be replaced
    pub fn is_content_unavailable(&self) -> bool {
        matches!(
            self,
            CollabError::Torrent(
                TorrentError::MetadataTimeout { .. } | TorrentError::ContentUnavailable(_)
            )
        )
    }
}

impl From<DatabaseError> for CollabError {
    fn from(value: DatabaseError) -> Self {
        match value {
            DatabaseError::NotFound { .. } => CollabError::NotFound,
            e => CollabError::TransientNetwork(e.to_string()),
        }
    }
}

impl From<BusError> for CollabError {
    fn from(value: BusError) -> Self {
        CollabError::TransientNetwork(value.to_string())
    }
}
