use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use watchparty_core::StreamFields;

mod data;
pub use data::*;

mod memory;
pub use memory::*;

mod pg;
pub use pg::*;

pub type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// An unknown or internal error happened with the database
    #[error(transparent)]
    Internal(Box<dyn std::error::Error + Send + Sync>),
    /// A resource already exists
    #[error("{resource} with {field} of value {value} already exists")]
    Conflict {
        /// The resource in question
        resource: &'static str,
        /// The field that is conflicting
        field: &'static str,
        /// The conflicting value
        value: String,
    },
    /// A resource in the database doesn't exist
    #[error("{resource}:{identifier} doesn't exist")]
    NotFound {
        resource: &'static str,
        identifier: &'static str,
    },
    /// The request would break an invariant of the stored data
    #[error("Invalid {resource}: {reason}")]
    Invalid {
        resource: &'static str,
        reason: String,
    },
}

/// Helper trait to reduce boilerplate
pub trait IntoDatabaseError {
    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError;
    fn any(self) -> DatabaseError;
}

/// Helper trait to reduce boilerplate
pub trait DatabaseResult {
    /// Turns the Result into a conflict error if it's Ok()
    fn conflict_or_ok(self, resource: &'static str, field: &'static str, value: &str)
        -> Result<()>;
}

impl<T> DatabaseResult for Result<T> {
    fn conflict_or_ok(
        self,
        resource: &'static str,
        field: &'static str,
        value: &str,
    ) -> Result<()> {
        match self {
            Ok(_) => Err(DatabaseError::Conflict {
                resource,
                field,
                value: value.to_string(),
            }),
            Err(e) => match e {
                DatabaseError::NotFound { .. } => Ok(()),
                e => Err(e),
            },
        }
    }
}

impl DatabaseError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DatabaseError::NotFound { .. })
    }
}

/// Represents the persistent store of rooms, participants and messages.
///
/// Expired rooms are treated as if they don't exist. Deleting a room
/// deletes its participants and messages.
#[async_trait]
pub trait Database: Send + Sync + 'static {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData>;
    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData>;
    /// Returns the most recently created room hosted by the auth identity.
    async fn room_by_host(&self, auth_id: &str) -> Result<RoomData>;
    async fn update_room(&self, updated_room: UpdatedRoom) -> Result<RoomData>;
    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()>;

    async fn participant_by_id(&self, participant_id: PrimaryKey) -> Result<ParticipantData>;
    async fn participant_by_auth(
        &self,
        room_id: PrimaryKey,
        auth_id: &str,
    ) -> Result<ParticipantData>;
    async fn participant_by_name(&self, room_id: PrimaryKey, name: &str)
        -> Result<ParticipantData>;
    /// Fails with a conflict if the auth identity already has a profile in the room.
    async fn create_participant(&self, new_participant: NewParticipant)
        -> Result<ParticipantData>;
    async fn update_participant(
        &self,
        updated_participant: UpdatedParticipant,
    ) -> Result<ParticipantData>;

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData>;
    /// Lists the messages of a room, oldest first.
    async fn list_messages(&self, room_id: PrimaryKey) -> Result<Vec<MessageData>>;
}

#[derive(Debug)]
pub struct NewRoom {
    pub video_source: String,
    /// The auth identity of the host
    pub host_id: String,
    pub expires_at: DateTime<Utc>,
}

/// A field-level room update. Fields that are `None` are left untouched.
#[derive(Debug, Default)]
pub struct UpdatedRoom {
    pub id: PrimaryKey,
    pub video_source: Option<String>,
    pub uploader_id: Option<Option<PrimaryKey>>,
    pub stream: Option<StreamFields>,
}

#[derive(Debug)]
pub struct NewParticipant {
    pub auth_id: String,
    pub room_id: PrimaryKey,
    pub name: String,
    pub is_host: bool,
}

#[derive(Debug)]
pub struct UpdatedParticipant {
    pub id: PrimaryKey,
    pub name: Option<String>,
}

/// A message to store. The id is chosen by the sender, so that the
/// optimistic copy and the broadcast copy can be matched.
#[derive(Debug)]
pub struct NewMessage {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub sender_id: PrimaryKey,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

impl UpdatedRoom {
    pub fn is_empty(&self) -> bool {
        self.video_source.is_none() && self.uploader_id.is_none() && self.stream.is_none()
    }

    /// Checks the update against the streaming invariant.
    pub fn validate(&self) -> Result<()> {
        match &self.stream {
            Some(stream) if !stream.is_valid() => Err(DatabaseError::Invalid {
                resource: "room",
                reason: "a live stream needs a streamer and a playback endpoint".to_string(),
            }),
            _ => Ok(()),
        }
    }

    /// Applies the update to a room.
    pub fn apply(self, room: &mut RoomData) {
        if let Some(video_source) = self.video_source {
            room.video_source = video_source;
        }

        if let Some(uploader_id) = self.uploader_id {
            room.uploader_id = uploader_id;
        }

        if let Some(stream) = self.stream {
            room.stream = stream;
        }
    }
}
