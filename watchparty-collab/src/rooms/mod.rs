mod error;
mod media;
mod session;

use std::sync::Arc;

use chrono::Utc;
use log::info;
use watchparty_core::{Bus, ParticipantId, RoomId};

use crate::{
    CollabContext, Database, NewParticipant, NewRoom, ParticipantData, RoomData, VideoSource,
};

pub use error::*;
pub use media::*;
pub use session::*;

pub struct RoomManager<Db, B> {
    context: CollabContext<Db, B>,
}

impl<Db, B> RoomManager<Db, B>
where
    Db: Database,
    B: Bus,
{
    pub fn new(context: &CollabContext<Db, B>) -> Self {
        Self {
            context: context.clone(),
        }
    }

    /// Creates a room hosted by `auth_id`, along with the host's profile.
    /// The room plays the configured default video if no source is given.
    pub async fn create_room(
        &self,
        auth_id: &str,
        name: &str,
        video_source: Option<&str>,
    ) -> Result<(RoomData, ParticipantData), CollabError> {
        let video_source = video_source
            .map(str::trim)
            .unwrap_or(self.context.config.default_video_source.as_str())
            .to_string();

        VideoSource::parse(&video_source).map_err(CollabError::InvalidSource)?;

        let room = self
            .context
            .database
            .create_room(NewRoom {
                video_source,
                host_id: auth_id.to_string(),
                expires_at: Utc::now() + self.context.config.room_lifetime_chrono(),
            })
            .await?;

        let host = self
            .context
            .database
            .create_participant(NewParticipant {
                auth_id: auth_id.to_string(),
                room_id: room.id,
                name: name.trim().to_string(),
                is_host: true,
            })
            .await?;

        info!("Created room {} for {}", room.id, auth_id);

        Ok((room, host))
    }

    /// Returns the room `auth_id` hosts, creating one if it has none.
    pub async fn open_or_create(&self, auth_id: &str) -> Result<RoomData, CollabError> {
        match self.context.database.room_by_host(auth_id).await {
            Ok(room) => Ok(room),
            Err(e) if e.is_not_found() => self
                .create_room(auth_id, "", None)
                .await
                .map(|(room, _)| room),
            Err(e) => Err(e.into()),
        }
    }

    /// Opens a session of a room for `auth_id`, creating its profile on the first visit.
    pub async fn join(
        &self,
        room_id: RoomId,
        auth_id: &str,
    ) -> Result<Arc<RoomSession<Db, B>>, CollabError> {
        let database = &self.context.database;
        let room = database.room_by_id(room_id).await?;

        let participant = match database.participant_by_auth(room_id, auth_id).await {
            Ok(participant) => participant,
            Err(e) if e.is_not_found() => {
                database
                    .create_participant(NewParticipant {
                        auth_id: auth_id.to_string(),
                        room_id,
                        name: String::new(),
                        is_host: room.is_hosted_by(auth_id),
                    })
                    .await?
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(session) = self.session(participant.id) {
            return Ok(session);
        }

        let participant_id = participant.id;
        let session = RoomSession::open(&self.context, participant).await?;

        self.context
            .sessions
            .insert(participant_id, session.clone());

        Ok(session)
    }

    /// Returns the open session of a participant, if it is still alive.
    pub fn session(&self, participant_id: ParticipantId) -> Option<Arc<RoomSession<Db, B>>> {
        self.context
            .sessions
            .get(&participant_id)
            .map(|s| s.clone())
            .filter(|s| !s.is_terminated())
    }

    pub fn session_count(&self) -> usize {
        self.context.sessions.len()
    }
}
