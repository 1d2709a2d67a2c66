//! The reducers behind a room session's optimistic state.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;
use watchparty_core::{ContentUri, ParticipantId, Reducer, StreamFields};

use crate::{MessageData, PrimaryKey, RoomData, UpdatedRoom};

/// The mutable fields of a room
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomState {
    pub video_source: String,
    pub uploader_id: Option<ParticipantId>,
    pub stream: StreamFields,
}

/// A change to a video source, always written together with its uploader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChange {
    pub video_source: String,
    pub uploader_id: Option<ParticipantId>,
}

/// A change to some field groups of a room, broadcast as `room-updates`.
/// Groups that are `None` are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPatch {
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamFields>,
}

/// Folds room patches, last writer wins per field group.
pub struct RoomReducer;

/// Folds chat messages into a list ordered by send time.
pub struct MessageLog;

/// What a room plays
#[derive(Debug, Clone, PartialEq)]
pub enum VideoSource {
    /// A regular video URL, like a YouTube link
    Url(Url),
    /// Content distributed peer-to-peer
    Content(ContentUri),
}

impl From<RoomData> for RoomState {
    fn from(room: RoomData) -> Self {
        Self {
            video_source: room.video_source,
            uploader_id: room.uploader_id,
            stream: room.stream,
        }
    }
}

impl RoomPatch {
    pub fn source(video_source: impl Into<String>, uploader_id: Option<ParticipantId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: Some(SourceChange {
                video_source: video_source.into(),
                uploader_id,
            }),
            stream: None,
        }
    }

    pub fn stream(fields: StreamFields) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: None,
            stream: Some(fields),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_none() && self.stream.is_none()
    }

    /// The store update that persists this patch.
    pub fn to_update(&self, room_id: PrimaryKey) -> UpdatedRoom {
        UpdatedRoom {
            id: room_id,
            video_source: self.source.as_ref().map(|s| s.video_source.clone()),
            uploader_id: self.source.as_ref().map(|s| s.uploader_id),
            stream: self.stream.clone(),
        }
    }
}

impl Reducer for RoomReducer {
    type State = RoomState;
    type Delta = RoomPatch;
    type Key = Uuid;

    fn fold(mut state: Self::State, delta: &Self::Delta) -> Self::State {
        if let Some(source) = &delta.source {
            state.video_source = source.video_source.clone();
            state.uploader_id = source.uploader_id;
        }

        if let Some(stream) = &delta.stream {
            state.stream = stream.clone();
        }

        state
    }

    fn key(delta: &Self::Delta) -> Self::Key {
        delta.id
    }

    fn is_settled(state: &Self::State, delta: &Self::Delta) -> bool {
        let source_settled = delta.source.as_ref().map_or(true, |s| {
            state.video_source == s.video_source && state.uploader_id == s.uploader_id
        });
        let stream_settled = delta.stream.as_ref().map_or(true, |s| &state.stream == s);

        source_settled && stream_settled
    }

    /// A remote write to a field group overrides the pending local write to it.
    fn supersede(pending: &Self::Delta, remote: &Self::Delta) -> Option<Self::Delta> {
        if pending.id == remote.id {
            return None;
        }

        let remaining = RoomPatch {
            id: pending.id,
            source: pending.source.clone().filter(|_| remote.source.is_none()),
            stream: pending.stream.clone().filter(|_| remote.stream.is_none()),
        };

        (!remaining.is_empty()).then_some(remaining)
    }
}

impl Reducer for MessageLog {
    type State = Vec<MessageData>;
    type Delta = MessageData;
    type Key = PrimaryKey;

    fn fold(mut state: Self::State, delta: &Self::Delta) -> Self::State {
        if state.iter().any(|m| m.id == delta.id) {
            return state;
        }

        let index = state.partition_point(|m| (m.sent_at, m.id) < (delta.sent_at, delta.id));
        state.insert(index, delta.clone());

        state
    }

    fn key(delta: &Self::Delta) -> Self::Key {
        delta.id
    }

    fn is_settled(state: &Self::State, delta: &Self::Delta) -> bool {
        state.iter().any(|m| m.id == delta.id)
    }

    /// Messages are only ever appended, so a remote message never replaces a local one.
    fn supersede(pending: &Self::Delta, remote: &Self::Delta) -> Option<Self::Delta> {
        (pending.id != remote.id).then(|| pending.clone())
    }
}

impl VideoSource {
    /// Parses a video URL or a content URI.
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();

        if ContentUri::is_content_uri(input) {
            return ContentUri::parse(input)
                .map(VideoSource::Content)
                .map_err(|e| e.to_string());
        }

        let url = Url::parse(input).map_err(|e| format!("{}: {}", input, e))?;

        match url.scheme() {
            "http" | "https" => Ok(VideoSource::Url(url)),
            scheme => Err(format!("{} is not a supported scheme", scheme)),
        }
    }

    pub fn content_uri(&self) -> Option<&ContentUri> {
        match self {
            VideoSource::Content(uri) => Some(uri),
            VideoSource::Url(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use watchparty_core::Optimistic;

    use super::*;
    use crate::SenderData;

    fn message(seconds: i64, id: u128) -> MessageData {
        MessageData {
            id: Uuid::from_u128(id),
            room_id: Uuid::nil(),
            sender: SenderData {
                id: Uuid::nil(),
                name: "Ada".to_string(),
            },
            content: format!("message {}", id),
            sent_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(seconds),
        }
    }

    proptest! {
        #[test]
        fn local_sends_and_their_echoes_show_once(
            sends in prop::collection::vec((0i64..100, 0u128..1000), 1..20)
        ) {
            let mut log = Optimistic::<MessageLog>::new(vec![]);
            let messages: Vec<_> = sends.iter().map(|(s, id)| message(*s, *id)).collect();

            for m in &messages {
                log.apply_local(m.clone());
            }

            for m in &messages {
                log.apply_remote(m.clone());
            }

            let visible = log.visible();
            let mut ids: Vec<_> = visible.iter().map(|m| m.id).collect();
            ids.dedup();

            prop_assert_eq!(ids.len(), visible.len());
            prop_assert!(visible.windows(2).all(|w| (w[0].sent_at, w[0].id) <= (w[1].sent_at, w[1].id)));
        }

        #[test]
        fn message_order_does_not_depend_on_arrival(
            sends in prop::collection::vec((0i64..100, 0u128..1000), 1..20)
        ) {
            let messages: Vec<_> = sends.iter().map(|(s, id)| message(*s, *id)).collect();

            let forward = messages.iter().fold(vec![], MessageLog::fold);
            let backward = messages.iter().rev().fold(vec![], MessageLog::fold);

            prop_assert_eq!(forward, backward);
        }
    }

    #[test]
    fn test_remote_source_overrides_pending_local_source() {
        let mut room = Optimistic::<RoomReducer>::new(RoomState::default());

        let local = RoomPatch {
            id: Uuid::new_v4(),
            source: Some(SourceChange {
                video_source: "https://a".into(),
                uploader_id: None,
            }),
            stream: Some(StreamFields::cleared()),
        };

        room.apply_local(local);
        room.apply_remote(RoomPatch::source("https://b", None));

        let visible = room.visible();
        assert_eq!(visible.video_source, "https://b");
        assert_eq!(room.pending().len(), 1, "the stream group is still pending");
        assert!(room.pending()[0].source.is_none());
    }

    #[test]
    fn test_rebase_drops_patches_the_store_already_has() {
        let mut room = Optimistic::<RoomReducer>::new(RoomState::default());
        room.apply_local(RoomPatch::source("https://a", None));

        room.rebase(RoomState {
            video_source: "https://a".into(),
            ..Default::default()
        });

        assert!(room.pending().is_empty());
    }

    #[test]
    fn test_room_patch_only_carries_changed_groups() {
        let uploader = Uuid::new_v4();
        let patch = RoomPatch::source("https://a", Some(uploader));

        let json = serde_json::to_value(&patch).unwrap();

        assert_eq!(json["source"]["videoSource"], "https://a");
        assert_eq!(json["source"]["uploaderId"], uploader.to_string());
        assert!(json.get("stream").is_none());

        let decoded: RoomPatch = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, patch);
    }

    #[test]
    fn test_video_source_parsing() {
        assert!(matches!(
            VideoSource::parse("https://youtu.be/abc"),
            Ok(VideoSource::Url(_))
        ));
        assert!(matches!(
            VideoSource::parse(
                "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056&dn=movie.mp4"
            ),
            Ok(VideoSource::Content(_))
        ));
        assert!(VideoSource::parse("ftp://example.com/movie.mp4").is_err());
        assert!(VideoSource::parse("not a url").is_err());
        assert!(VideoSource::parse("magnet:?dn=nohash").is_err());
    }
}
