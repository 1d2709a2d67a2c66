use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use uuid::Uuid;
use watchparty_core::StreamFields;

use crate::{
    Database, DatabaseError, DatabaseResult, MessageData, NewMessage, NewParticipant, NewRoom,
    ParticipantData, PrimaryKey, Result, RoomData, SenderData, UpdatedParticipant, UpdatedRoom,
};

/// An in-process database, for tests and demos
#[derive(Default)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    unreachable: AtomicCell<bool>,
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<PrimaryKey, RoomData>,
    participants: HashMap<PrimaryKey, ParticipantData>,
    messages: Vec<StoredMessage>,
}

struct StoredMessage {
    id: PrimaryKey,
    room_id: PrimaryKey,
    sender_id: PrimaryKey,
    content: String,
    sent_at: chrono::DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
#[error("database is unreachable")]
struct Unreachable;

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, like a network partition between client and store.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable);
    }

    /// The number of rows across all tables.
    pub fn row_count(&self) -> usize {
        let tables = self.tables.lock();
        tables.rooms.len() + tables.participants.len() + tables.messages.len()
    }

    fn reach(&self) -> Result<()> {
        if self.unreachable.load() {
            return Err(DatabaseError::Internal(Box::new(Unreachable)));
        }

        Ok(())
    }
}

impl Tables {
    fn room(&self, room_id: PrimaryKey) -> Result<&RoomData> {
        self.rooms
            .get(&room_id)
            .filter(|r| !r.is_expired())
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })
    }

    fn participant(&self, participant_id: PrimaryKey) -> Result<&ParticipantData> {
        self.participants
            .get(&participant_id)
            .ok_or(DatabaseError::NotFound {
                resource: "participant",
                identifier: "id",
            })
    }

    fn message(&self, stored: &StoredMessage) -> Result<MessageData> {
        let sender = self.participant(stored.sender_id)?;

        Ok(MessageData {
            id: stored.id,
            room_id: stored.room_id,
            sender: SenderData::from(sender),
            content: stored.content.clone(),
            sent_at: stored.sent_at,
        })
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        self.reach()?;

        let room = RoomData {
            id: Uuid::new_v4(),
            video_source: new_room.video_source,
            uploader_id: None,
            host_id: Some(new_room.host_id),
            stream: StreamFields::cleared(),
            created_at: Utc::now(),
            expires_at: new_room.expires_at,
        };

        self.tables.lock().rooms.insert(room.id, room.clone());

        Ok(room)
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        self.reach()?;
        self.tables.lock().room(room_id).cloned()
    }

    async fn room_by_host(&self, auth_id: &str) -> Result<RoomData> {
        self.reach()?;

        self.tables
            .lock()
            .rooms
            .values()
            .filter(|r| r.is_hosted_by(auth_id) && !r.is_expired())
            .max_by_key(|r| r.created_at)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "host_id",
            })
    }

    async fn update_room(&self, updated_room: UpdatedRoom) -> Result<RoomData> {
        self.reach()?;
        updated_room.validate()?;

        let mut tables = self.tables.lock();
        tables.room(updated_room.id)?;

        let room = tables
            .rooms
            .get_mut(&updated_room.id)
            .ok_or(DatabaseError::NotFound {
                resource: "room",
                identifier: "id",
            })?;

        updated_room.apply(room);

        Ok(room.clone())
    }

    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()> {
        self.reach()?;

        let mut tables = self.tables.lock();
        tables.room(room_id)?;

        tables.rooms.remove(&room_id);
        tables.participants.retain(|_, p| p.room_id != room_id);
        tables.messages.retain(|m| m.room_id != room_id);

        Ok(())
    }

    async fn participant_by_id(&self, participant_id: PrimaryKey) -> Result<ParticipantData> {
        self.reach()?;
        self.tables.lock().participant(participant_id).cloned()
    }

    async fn participant_by_auth(
        &self,
        room_id: PrimaryKey,
        auth_id: &str,
    ) -> Result<ParticipantData> {
        self.reach()?;

        self.tables
            .lock()
            .participants
            .values()
            .find(|p| p.room_id == room_id && p.auth_id == auth_id)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "participant",
                identifier: "auth_id",
            })
    }

    async fn participant_by_name(
        &self,
        room_id: PrimaryKey,
        name: &str,
    ) -> Result<ParticipantData> {
        self.reach()?;

        self.tables
            .lock()
            .participants
            .values()
            .find(|p| p.room_id == room_id && p.name == name)
            .cloned()
            .ok_or(DatabaseError::NotFound {
                resource: "participant",
                identifier: "name",
            })
    }

    async fn create_participant(
        &self,
        new_participant: NewParticipant,
    ) -> Result<ParticipantData> {
        self.participant_by_auth(new_participant.room_id, &new_participant.auth_id)
            .await
            .conflict_or_ok("participant", "auth_id", &new_participant.auth_id)?;

        let mut tables = self.tables.lock();
        tables.room(new_participant.room_id)?;

        let participant = ParticipantData {
            id: Uuid::new_v4(),
            auth_id: new_participant.auth_id,
            room_id: new_participant.room_id,
            name: new_participant.name,
            is_host: new_participant.is_host,
            created_at: Utc::now(),
        };

        tables
            .participants
            .insert(participant.id, participant.clone());

        Ok(participant)
    }

    async fn update_participant(
        &self,
        updated_participant: UpdatedParticipant,
    ) -> Result<ParticipantData> {
        self.reach()?;

        let mut tables = self.tables.lock();

        let participant = tables
            .participants
            .get_mut(&updated_participant.id)
            .ok_or(DatabaseError::NotFound {
                resource: "participant",
                identifier: "id",
            })?;

        if let Some(name) = updated_participant.name {
            participant.name = name;
        }

        Ok(participant.clone())
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData> {
        self.reach()?;

        let mut tables = self.tables.lock();
        tables.room(new_message.room_id)?;
        tables.participant(new_message.sender_id)?;

        if tables.messages.iter().any(|m| m.id == new_message.id) {
            return Err(DatabaseError::Conflict {
                resource: "message",
                field: "id",
                value: new_message.id.to_string(),
            });
        }

        let stored = StoredMessage {
            id: new_message.id,
            room_id: new_message.room_id,
            sender_id: new_message.sender_id,
            content: new_message.content,
            sent_at: new_message.sent_at,
        };

        let message = tables.message(&stored)?;
        tables.messages.push(stored);

        Ok(message)
    }

    async fn list_messages(&self, room_id: PrimaryKey) -> Result<Vec<MessageData>> {
        self.reach()?;

        let tables = self.tables.lock();
        tables.room(room_id)?;

        let mut messages = tables
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .map(|m| tables.message(m))
            .collect::<Result<Vec<_>>>()?;

        messages.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn new_room(expires_in: Duration) -> NewRoom {
        NewRoom {
            video_source: "https://youtu.be/abc".to_string(),
            host_id: "auth-host".to_string(),
            expires_at: Utc::now() + expires_in,
        }
    }

    fn new_participant(room_id: PrimaryKey, auth_id: &str, name: &str) -> NewParticipant {
        NewParticipant {
            auth_id: auth_id.to_string(),
            room_id,
            name: name.to_string(),
            is_host: false,
        }
    }

    #[tokio::test]
    async fn test_expired_rooms_are_not_found() {
        let db = MemoryDatabase::new();
        let room = db.create_room(new_room(Duration::seconds(-1))).await.unwrap();

        let result = db.room_by_id(room.id).await;

        assert!(result.unwrap_err().is_not_found());
        assert!(db.room_by_host("auth-host").await.is_err());
    }

    #[tokio::test]
    async fn test_one_participant_per_auth_identity_and_room() {
        let db = MemoryDatabase::new();
        let room = db.create_room(new_room(Duration::days(1))).await.unwrap();

        db.create_participant(new_participant(room.id, "auth-a", "Ada"))
            .await
            .unwrap();

        let result = db
            .create_participant(new_participant(room.id, "auth-a", "Again"))
            .await;

        assert!(matches!(result, Err(DatabaseError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_participants_and_messages() {
        let db = MemoryDatabase::new();
        let room = db.create_room(new_room(Duration::days(1))).await.unwrap();
        let ada = db
            .create_participant(new_participant(room.id, "auth-a", "Ada"))
            .await
            .unwrap();

        db.create_message(NewMessage {
            id: Uuid::new_v4(),
            room_id: room.id,
            sender_id: ada.id,
            content: "hi".to_string(),
            sent_at: Utc::now(),
        })
        .await
        .unwrap();

        assert_eq!(db.list_messages(room.id).await.unwrap().len(), 1);

        db.delete_room(room.id).await.unwrap();

        assert_eq!(db.row_count(), 0);
        assert!(db.room_by_id(room.id).await.unwrap_err().is_not_found());
        assert!(db.delete_room(room.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_rejects_streams_without_playback_endpoint() {
        let db = MemoryDatabase::new();
        let room = db.create_room(new_room(Duration::days(1))).await.unwrap();

        let result = db
            .update_room(UpdatedRoom {
                id: room.id,
                stream: Some(StreamFields {
                    is_streaming: true,
                    current_streamer_id: Some(Uuid::new_v4()),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(DatabaseError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_every_call() {
        let db = MemoryDatabase::new();
        db.set_unreachable(true);

        let result = db.create_room(new_room(Duration::days(1))).await;

        assert!(matches!(result, Err(DatabaseError::Internal(_))));
    }
}
