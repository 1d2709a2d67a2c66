use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use watchparty_core::StreamFields;

/// The type used for primary keys in the database.
pub type PrimaryKey = Uuid;

/// A watch party room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomData {
    pub id: PrimaryKey,
    /// A video URL or a content URI
    pub video_source: String,
    /// The participant seeding the content, if the source is a content URI
    pub uploader_id: Option<PrimaryKey>,
    /// The auth identity of the host
    pub host_id: Option<String>,
    #[serde(flatten)]
    pub stream: StreamFields,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A room-scoped profile of an auth identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantData {
    pub id: PrimaryKey,
    pub auth_id: String,
    pub room_id: PrimaryKey,
    /// Empty until the participant picks a name
    pub name: String,
    /// If this is true, the participant can delete the room
    pub is_host: bool,
    pub created_at: DateTime<Utc>,
}

/// A chat message, as stored and as broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageData {
    pub id: PrimaryKey,
    pub room_id: PrimaryKey,
    pub sender: SenderData,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderData {
    pub id: PrimaryKey,
    pub name: String,
}

impl RoomData {
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    pub fn is_hosted_by(&self, auth_id: &str) -> bool {
        self.host_id.as_deref() == Some(auth_id)
    }
}

impl ParticipantData {
    pub fn has_name(&self) -> bool {
        !self.name.trim().is_empty()
    }
}

impl From<&ParticipantData> for SenderData {
    fn from(participant: &ParticipantData) -> Self {
        Self {
            id: participant.id,
            name: participant.name.clone(),
        }
    }
}
