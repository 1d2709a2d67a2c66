use serde::{Deserialize, Serialize};

use crate::ParticipantId;

/// A relay-side endpoint pair for one live stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEndpoint {
    pub id: String,
    /// Where the publisher pushes media to
    pub ingest_url: String,
    /// Where viewers pull media from
    pub playback_url: String,
}

/// The streaming fields of a room.
///
/// When `is_streaming` is true, `current_streamer_id` and a non-empty
/// `stream_playback_endpoint` are always set. Use [StreamFields::live] and
/// [StreamFields::cleared] to build values that hold this.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamFields {
    pub is_streaming: bool,
    pub current_streamer_id: Option<ParticipantId>,
    pub stream_session_id: Option<String>,
    pub stream_ingest_endpoint: Option<String>,
    pub stream_playback_endpoint: Option<String>,
}

impl StreamFields {
    /// The fields of a room where `streamer` is live on `endpoint`.
    pub fn live(streamer: ParticipantId, endpoint: &IngestEndpoint) -> Self {
        Self {
            is_streaming: true,
            current_streamer_id: Some(streamer),
            ..Self::idle(Some(endpoint))
        }
    }

    /// The fields of a room nobody streams in.
    /// The endpoint is kept so the next publisher can reuse it.
    pub fn idle(endpoint: Option<&IngestEndpoint>) -> Self {
        Self {
            is_streaming: false,
            current_streamer_id: None,
            stream_session_id: endpoint.map(|e| e.id.clone()),
            stream_ingest_endpoint: endpoint.map(|e| e.ingest_url.clone()),
            stream_playback_endpoint: endpoint.map(|e| e.playback_url.clone()),
        }
    }

    /// The fields of a room with no stream and no endpoint.
    pub fn cleared() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        !self.is_streaming
            || (self.current_streamer_id.is_some()
                && self
                    .stream_playback_endpoint
                    .as_deref()
                    .is_some_and(|e| !e.is_empty()))
    }

    /// The endpoint stored in the fields, if all of its parts are present.
    pub fn endpoint(&self) -> Option<IngestEndpoint> {
        Some(IngestEndpoint {
            id: self.stream_session_id.clone()?,
            ingest_url: self.stream_ingest_endpoint.clone()?,
            playback_url: self.stream_playback_endpoint.clone()?,
        })
    }

    /// Returns true if someone other than `participant` is live.
    pub fn is_streamed_by_other(&self, participant: ParticipantId) -> bool {
        self.is_streaming && self.current_streamer_id != Some(participant)
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn endpoint() -> IngestEndpoint {
        IngestEndpoint {
            id: "input-1".into(),
            ingest_url: "https://relay.test/input-1/whip".into(),
            playback_url: "https://relay.test/input-1/whep".into(),
        }
    }

    #[test]
    fn test_constructors_hold_the_streaming_invariant() {
        let streamer = Uuid::new_v4();

        let live = StreamFields::live(streamer, &endpoint());
        assert!(live.is_valid());
        assert_eq!(live.endpoint(), Some(endpoint()));
        assert!(live.is_streamed_by_other(Uuid::new_v4()));
        assert!(!live.is_streamed_by_other(streamer));

        let idle = StreamFields::idle(Some(&endpoint()));
        assert!(idle.is_valid());
        assert!(!idle.is_streaming);
        assert_eq!(idle.endpoint(), Some(endpoint()));

        assert!(StreamFields::cleared().is_valid());
        assert_eq!(StreamFields::cleared().endpoint(), None);
    }

    #[test]
    fn test_streaming_without_playback_endpoint_is_invalid() {
        let fields = StreamFields {
            is_streaming: true,
            current_streamer_id: Some(Uuid::new_v4()),
            stream_playback_endpoint: Some(String::new()),
            ..Default::default()
        };

        assert!(!fields.is_valid());
    }
}
