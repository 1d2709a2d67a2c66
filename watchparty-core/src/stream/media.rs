use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::RoomId;

use super::IngestEndpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionStatus {
    Connected,
    Pending,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Relay request failed: {0}")]
    Request(String),
    #[error("Relay rejected the request with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Relay endpoint {0} does not exist")]
    NotFound(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The environment refused access to the capture surface
    #[error("Capture was denied: {0}")]
    Denied(String),
    #[error("No capture surface is available")]
    Unavailable,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Could not connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("Connection is closed")]
    Closed,
}

/// The service that provisions live stream endpoints and relays media.
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    async fn create_ingest_endpoint(&self, room_id: RoomId) -> Result<IngestEndpoint, RelayError>;

    /// Returns whether a publisher is connected to the endpoint.
    async fn connection_status(&self, endpoint_id: &str) -> Result<ConnectionStatus, RelayError>;

    async fn destroy_endpoint(&self, endpoint_id: &str) -> Result<(), RelayError>;
}

/// A source of local media, like a display surface.
#[async_trait]
pub trait Capture: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Arc<dyn MediaTrack>, CaptureError>;
}

/// A captured media track.
#[async_trait]
pub trait MediaTrack: Send + Sync {
    fn label(&self) -> &str;

    /// Resolves once the track has ended, whether through [MediaTrack::stop]
    /// or through the environment, e.g. an operating system "stop sharing" button.
    async fn ended(&self);

    fn is_ended(&self) -> bool;

    /// Ends the track. Idempotent.
    fn stop(&self);
}

/// Opens media connections to relay endpoints.
#[async_trait]
pub trait MediaLink: Send + Sync + 'static {
    /// Starts pushing a track to an ingest endpoint.
    async fn ingest(
        &self,
        url: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Box<dyn MediaConnection>, LinkError>;

    /// Starts pulling a live stream from a playback endpoint.
    async fn play(&self, url: &str) -> Result<Box<dyn MediaConnection>, LinkError>;
}

#[async_trait]
pub trait MediaConnection: Send + Sync {
    fn url(&self) -> &str;

    async fn close(&self);
}
