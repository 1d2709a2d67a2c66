use url::Url;
use watchparty_core::{ContentUri, LocalFile, StreamHandle};

/// What a participant can currently play for the room's video source
#[derive(Debug, Clone, PartialEq)]
pub enum Media {
    /// Nothing resolved yet
    None,
    /// A regular video URL
    Url(Url),
    /// The uploader plays the file it seeds
    LocalFile { uri: ContentUri, file: LocalFile },
    /// Waiting for peers to deliver the content
    Fetching { uri: ContentUri },
    /// The content can be streamed through the local proxy
    Streamable(StreamHandle),
    /// Nobody can deliver the content
    Unavailable { uri: ContentUri, reason: String },
    /// The source could not be parsed
    Invalid { source: String, reason: String },
}

impl Media {
    /// Returns true if the source should be replaced by the participants,
    /// because the content behind it can't be played.
    pub fn needs_replacement(&self) -> bool {
        matches!(self, Media::Unavailable { .. })
    }

    /// The content URI this media is for, if any.
    pub fn content_uri(&self) -> Option<&ContentUri> {
        match self {
            Media::LocalFile { uri, .. }
            | Media::Fetching { uri }
            | Media::Unavailable { uri, .. } => Some(uri),
            Media::Streamable(handle) => Some(&handle.uri),
            _ => None,
        }
    }

    pub fn is_playable(&self) -> bool {
        matches!(
            self,
            Media::Url(_) | Media::LocalFile { .. } | Media::Streamable(_)
        )
    }
}
