use std::{fmt::Display, str::FromStr, sync::Arc};

use async_trait::async_trait;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

lazy_static! {
    /// Matches a hex (40 chars) or base32 (32 chars) BitTorrent info hash
    static ref INFO_HASH: Regex = Regex::new(r"^urn:btih:([0-9a-fA-F]{40}|[A-Za-z2-7]{32})$").unwrap();
}

/// A content-addressed reference to a file distributed peer-to-peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentUri {
    uri: String,
    info_hash: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentUriError {
    #[error("Not a magnet URI: {0}")]
    NotMagnet(String),
    #[error("Magnet URI has no valid info hash: {0}")]
    MissingInfoHash(String),
}

/// A local file handed to the transport for seeding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub name: String,
    /// The media type, used by players to pick a decoder
    pub mime: String,
    pub data: Arc<[u8]>,
}

/// A file of a transfer whose first content unit is locally available
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    pub name: String,
    pub length: u64,
    /// Where the local proxy serves the file from
    pub stream_url: Url,
}

/// Telemetry of a transfer at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferStats {
    /// Downloaded ratio between 0 and 1
    pub progress: f64,
    /// Bytes per second
    pub download_rate: f64,
    /// Bytes per second
    pub upload_rate: f64,
    pub peers: usize,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The transport cannot run in this environment, e.g. no background worker to proxy content
    #[error("Transport is unsupported: {0}")]
    Unsupported(String),
    /// The transport refused the content
    #[error("Transfer rejected: {0}")]
    Rejected(String),
    /// The transfer was destroyed while something was waiting on it
    #[error("Transfer was closed")]
    Closed,
    #[error("Transfer failed: {0}")]
    Io(String),
}

/// A content-addressed peer-to-peer transport, like a WebTorrent client.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Initialises the client and the local proxy exposing fetched content.
    async fn ensure_ready(&self) -> Result<(), TransportError>;

    /// Starts seeding a local file.
    async fn seed(&self, file: LocalFile) -> Result<Arc<dyn Transfer>, TransportError>;

    /// Starts fetching content. The returned transfer may not have metadata yet.
    async fn fetch(&self, uri: &ContentUri) -> Result<Arc<dyn Transfer>, TransportError>;
}

/// A single seed or download held by a [Transport].
#[async_trait]
pub trait Transfer: Send + Sync {
    fn uri(&self) -> &ContentUri;

    fn stats(&self) -> TransferStats;

    /// Resolves once the metadata (file list, piece layout) is known.
    /// This never resolves if no peer advertises the content.
    async fn metadata(&self) -> Result<(), TransportError>;

    /// The files that are streamable, i.e. have their first content unit locally.
    fn files(&self) -> Vec<ContentFile>;

    /// Releases every resource held by the transfer.
    async fn destroy(&self);
}

impl ContentUri {
    pub fn parse(input: &str) -> Result<Self, ContentUriError> {
        let url = Url::parse(input).map_err(|_| ContentUriError::NotMagnet(input.to_string()))?;

        if url.scheme() != "magnet" {
            return Err(ContentUriError::NotMagnet(input.to_string()));
        }

        let info_hash = url
            .query_pairs()
            .filter(|(key, _)| key == "xt")
            .find_map(|(_, value)| {
                INFO_HASH
                    .captures(&value)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str().to_lowercase())
            })
            .ok_or_else(|| ContentUriError::MissingInfoHash(input.to_string()))?;

        Ok(Self {
            uri: input.to_string(),
            info_hash,
        })
    }

    /// Builds a magnet URI for an info hash and a display name.
    pub fn from_info_hash(info_hash: &str, name: &str) -> Result<Self, ContentUriError> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("xt", &format!("urn:btih:{}", info_hash))
            .append_pair("dn", name)
            .finish();

        Self::parse(&format!("magnet:?{}", query))
    }

    /// Returns true if the input looks like a content URI rather than a location.
    pub fn is_content_uri(input: &str) -> bool {
        input.starts_with("magnet:")
    }

    /// The lowercase info hash identifying the content
    pub fn info_hash(&self) -> &str {
        &self.info_hash
    }

    pub fn as_str(&self) -> &str {
        &self.uri
    }
}

impl FromStr for ContentUri {
    type Err = ContentUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ContentUri {
    type Error = ContentUriError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContentUri> for String {
    fn from(value: ContentUri) -> Self {
        value.uri
    }
}

impl Display for ContentUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.uri)
    }
}
