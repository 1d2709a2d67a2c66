use std::fmt::Display;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The identity of a room, as assigned by the room store.
pub type RoomId = Uuid;
/// The identity of a room-scoped participant profile.
pub type ParticipantId = Uuid;

/// The realtime channels every room is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Chat messages
    Messages,
    /// Who is currently viewing the room
    Presence,
    /// Video source, playback and streaming field changes
    Updates,
}

/// A room-scoped topic on the realtime bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Topic {
    pub room_id: RoomId,
    pub channel: Channel,
}

/// The kinds of events published on the realtime bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A chat message was sent
    NewMessage,
    /// A participant played or paused the video
    PlaybackState,
    /// Room fields changed (video source, uploader, streaming fields)
    RoomUpdates,
    /// The room was deleted by its host
    RoomDeleted,
    /// A full snapshot of the presence state of a topic.
    /// Only ever emitted by the bus itself.
    PresenceSync,
}

/// A single event delivered to a subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub kind: EventKind,
    /// The participant that published the event, if it was published by one
    pub origin: Option<ParticipantId>,
    pub payload: Value,
}

impl Topic {
    pub fn new(room_id: RoomId, channel: Channel) -> Self {
        Self { room_id, channel }
    }

    pub fn messages(room_id: RoomId) -> Self {
        Self::new(room_id, Channel::Messages)
    }

    pub fn presence(room_id: RoomId) -> Self {
        Self::new(room_id, Channel::Presence)
    }

    pub fn updates(room_id: RoomId) -> Self {
        Self::new(room_id, Channel::Updates)
    }

    /// The wire name of the topic, e.g. `room:<id>:messages`
    pub fn name(&self) -> String {
        format!("room:{}:{}", self.room_id, self.channel.as_str())
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Messages => "messages",
            Channel::Presence => "presence",
            Channel::Updates => "updates",
        }
    }
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "new-message",
            EventKind::PlaybackState => "playback-state",
            EventKind::RoomUpdates => "room-updates",
            EventKind::RoomDeleted => "room-deleted",
            EventKind::PresenceSync => "presence-sync",
        }
    }
}

impl Delivery {
    /// Encodes a payload published by a participant.
    pub fn new<T>(kind: EventKind, origin: Option<ParticipantId>, payload: &T) -> serde_json::Result<Self>
    where
        T: Serialize,
    {
        Ok(Self {
            kind,
            origin,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decodes the payload into the type expected for its kind.
    pub fn decode<T>(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_value(self.payload.clone())
    }

    /// Returns true if the event was published by the given participant.
    /// Used to discard the reflection of a participant's own publish.
    pub fn is_from(&self, participant_id: ParticipantId) -> bool {
        self.origin == Some(participant_id)
    }
}

/// The playback state shared through `playback-state` events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    pub is_playing: bool,
    /// The playback position in seconds, if the publisher knew it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}
