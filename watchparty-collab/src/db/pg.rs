use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, query, query_as, Error as SqlxError, FromRow, PgPool};
use uuid::Uuid;
use watchparty_core::StreamFields;

use crate::{
    Database, DatabaseError, DatabaseResult, IntoDatabaseError, MessageData, NewMessage,
    NewParticipant, NewRoom, ParticipantData, PrimaryKey, Result, RoomData, SenderData,
    UpdatedParticipant, UpdatedRoom,
};

/// A postgres database implementation for watch party rooms
pub struct PgDatabase {
    pool: PgPool,
}

#[derive(FromRow)]
struct RoomRow {
    id: Uuid,
    video_source: String,
    uploader_id: Option<Uuid>,
    host_id: Option<String>,
    is_streaming: bool,
    current_streamer_id: Option<Uuid>,
    stream_session_id: Option<String>,
    stream_ingest_endpoint: Option<String>,
    stream_playback_endpoint: Option<String>,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct ParticipantRow {
    id: Uuid,
    auth_id: String,
    room_id: Uuid,
    name: String,
    is_host: bool,
    created_at: DateTime<Utc>,
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    room_id: Uuid,
    sender_id: Uuid,
    sender_name: String,
    content: String,
    sent_at: DateTime<Utc>,
}

const MESSAGE_SELECT: &str = "
    SELECT
        messages.id,
        messages.room_id,
        messages.sender_id,
        participants.name AS sender_name,
        messages.content,
        messages.sent_at
    FROM messages
        INNER JOIN participants ON messages.sender_id = participants.id";

impl PgDatabase {
    pub async fn new(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| e.any())?;

        Ok(Self { pool })
    }

    /// Applies the bundled migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| DatabaseError::Internal(Box::new(e)))
    }

    async fn message_by_id(&self, message_id: PrimaryKey) -> Result<MessageData> {
        query_as::<_, MessageRow>(&format!("{} WHERE messages.id = $1", MESSAGE_SELECT))
            .bind(message_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("message", "id"))
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn create_room(&self, new_room: NewRoom) -> Result<RoomData> {
        query_as::<_, RoomRow>(
            "INSERT INTO rooms (id, video_source, host_id, expires_at)
             VALUES ($1, $2, $3, $4) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_room.video_source)
        .bind(new_room.host_id)
        .bind(new_room.expires_at)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.any())
    }

    async fn room_by_id(&self, room_id: PrimaryKey) -> Result<RoomData> {
        query_as::<_, RoomRow>("SELECT * FROM rooms WHERE id = $1 AND expires_at > NOW()")
            .bind(room_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("room", "id"))
    }

    async fn room_by_host(&self, auth_id: &str) -> Result<RoomData> {
        query_as::<_, RoomRow>(
            "SELECT * FROM rooms WHERE host_id = $1 AND expires_at > NOW()
             ORDER BY created_at DESC LIMIT 1",
        )
        .bind(auth_id)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.not_found_or("room", "host_id"))
    }

    async fn update_room(&self, updated_room: UpdatedRoom) -> Result<RoomData> {
        updated_room.validate()?;

        let mut room = self.room_by_id(updated_room.id).await?;
        updated_room.apply(&mut room);

        query_as::<_, RoomRow>(
            "UPDATE rooms SET
                video_source = $1,
                uploader_id = $2,
                is_streaming = $3,
                current_streamer_id = $4,
                stream_session_id = $5,
                stream_ingest_endpoint = $6,
                stream_playback_endpoint = $7
             WHERE id = $8 RETURNING *",
        )
        .bind(room.video_source)
        .bind(room.uploader_id)
        .bind(room.stream.is_streaming)
        .bind(room.stream.current_streamer_id)
        .bind(room.stream.stream_session_id)
        .bind(room.stream.stream_ingest_endpoint)
        .bind(room.stream.stream_playback_endpoint)
        .bind(room.id)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.not_found_or("room", "id"))
    }

    async fn delete_room(&self, room_id: PrimaryKey) -> Result<()> {
        // Ensure room exists
        let _ = self.room_by_id(room_id).await?;

        query("DELETE FROM rooms WHERE id = $1")
            .bind(room_id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.any())
            .map(|_| ())
    }

    async fn participant_by_id(&self, participant_id: PrimaryKey) -> Result<ParticipantData> {
        query_as::<_, ParticipantRow>("SELECT * FROM participants WHERE id = $1")
            .bind(participant_id)
            .fetch_one(&self.pool)
            .await
            .map(Into::into)
            .map_err(|e| e.not_found_or("participant", "id"))
    }

    async fn participant_by_auth(
        &self,
        room_id: PrimaryKey,
        auth_id: &str,
    ) -> Result<ParticipantData> {
        query_as::<_, ParticipantRow>(
            "SELECT * FROM participants WHERE room_id = $1 AND auth_id = $2",
        )
        .bind(room_id)
        .bind(auth_id)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.not_found_or("participant", "auth_id"))
    }

    async fn participant_by_name(
        &self,
        room_id: PrimaryKey,
        name: &str,
    ) -> Result<ParticipantData> {
        query_as::<_, ParticipantRow>(
            "SELECT * FROM participants WHERE room_id = $1 AND name = $2 LIMIT 1",
        )
        .bind(room_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.not_found_or("participant", "name"))
    }

    async fn create_participant(
        &self,
        new_participant: NewParticipant,
    ) -> Result<ParticipantData> {
        self.participant_by_auth(new_participant.room_id, &new_participant.auth_id)
            .await
            .conflict_or_ok("participant", "auth_id", &new_participant.auth_id)?;

        query_as::<_, ParticipantRow>(
            "INSERT INTO participants (id, auth_id, room_id, name, is_host)
             VALUES ($1, $2, $3, $4, $5) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(new_participant.auth_id)
        .bind(new_participant.room_id)
        .bind(new_participant.name)
        .bind(new_participant.is_host)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.any())
    }

    async fn update_participant(
        &self,
        updated_participant: UpdatedParticipant,
    ) -> Result<ParticipantData> {
        let participant = self.participant_by_id(updated_participant.id).await?;

        query_as::<_, ParticipantRow>(
            "UPDATE participants SET name = $1 WHERE id = $2 RETURNING *",
        )
        .bind(updated_participant.name.unwrap_or(participant.name))
        .bind(updated_participant.id)
        .fetch_one(&self.pool)
        .await
        .map(Into::into)
        .map_err(|e| e.not_found_or("participant", "id"))
    }

    async fn create_message(&self, new_message: NewMessage) -> Result<MessageData> {
        // Ensure room exists and has not expired
        let _ = self.room_by_id(new_message.room_id).await?;

        self.message_by_id(new_message.id).await.conflict_or_ok(
            "message",
            "id",
            &new_message.id.to_string(),
        )?;

        query(
            "INSERT INTO messages (id, room_id, sender_id, content, sent_at)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(new_message.id)
        .bind(new_message.room_id)
        .bind(new_message.sender_id)
        .bind(new_message.content)
        .bind(new_message.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| e.any())?;

        self.message_by_id(new_message.id).await
    }

    async fn list_messages(&self, room_id: PrimaryKey) -> Result<Vec<MessageData>> {
        // Ensure room exists and has not expired
        let _ = self.room_by_id(room_id).await?;

        let rows = query_as::<_, MessageRow>(&format!(
            "{} WHERE messages.room_id = $1 ORDER BY messages.sent_at, messages.id",
            MESSAGE_SELECT
        ))
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.any())?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

impl From<RoomRow> for RoomData {
    fn from(row: RoomRow) -> Self {
        Self {
            id: row.id,
            video_source: row.video_source,
            uploader_id: row.uploader_id,
            host_id: row.host_id,
            stream: StreamFields {
                is_streaming: row.is_streaming,
                current_streamer_id: row.current_streamer_id,
                stream_session_id: row.stream_session_id,
                stream_ingest_endpoint: row.stream_ingest_endpoint,
                stream_playback_endpoint: row.stream_playback_endpoint,
            },
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

impl From<ParticipantRow> for ParticipantData {
    fn from(row: ParticipantRow) -> Self {
        Self {
            id: row.id,
            auth_id: row.auth_id,
            room_id: row.room_id,
            name: row.name,
            is_host: row.is_host,
            created_at: row.created_at,
        }
    }
}

impl From<MessageRow> for MessageData {
    fn from(row: MessageRow) -> Self {
        Self {
            id: row.id,
            room_id: row.room_id,
            sender: SenderData {
                id: row.sender_id,
                name: row.sender_name,
            },
            content: row.content,
            sent_at: row.sent_at,
        }
    }
}

impl IntoDatabaseError for SqlxError {
    fn any(self) -> DatabaseError {
        DatabaseError::Internal(Box::new(self))
    }

    fn not_found_or(self, resource: &'static str, identifier: &'static str) -> DatabaseError {
        match self {
            SqlxError::RowNotFound => DatabaseError::NotFound {
                resource,
                identifier,
            },
            e => Self::any(e),
        }
    }
}
