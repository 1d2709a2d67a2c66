//! Publishing and watching a room's relayed live stream.

mod fields;
mod media;

pub use fields::*;
pub use media::*;

use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{Config, ParticipantId, RoomId, Ticker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamState {
    NotStarted,
    /// Waiting for an ingest endpoint or the capture surface
    Provisioning,
    /// Pushing media, waiting for the relay to confirm the connection
    Ingesting,
    Live,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GuestState {
    Detached,
    Attached {
        streamer: ParticipantId,
        playback_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    pub state: StreamState,
    pub guest: GuestState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The published track ended outside of [LiveStreamManager::stop_publishing].
    /// The fields should be persisted and broadcast like an explicit stop.
    TrackEnded { fields: StreamFields },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Capture was denied: {0}")]
    CaptureDenied(String),
    #[error("Could not provision the stream: {0}")]
    Provisioning(String),
    #[error("Stream connection failed: {0}")]
    Connection(String),
    #[error("Already publishing")]
    AlreadyPublishing,
    #[error("Publishing was cancelled")]
    Cancelled,
    #[error("The captured track ended before the stream went live")]
    TrackEnded,
}

pub type StreamEvents = mpsc::UnboundedReceiver<StreamEvent>;

/// Drives a participant's side of a room's live stream, either as the
/// publisher or as a guest watching someone else.
///
/// Only one participant per room should publish at a time. That is not
/// enforced here.
#[derive(Clone)]
pub struct LiveStreamManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    room_id: RoomId,
    participant_id: ParticipantId,
    relay: Arc<dyn Relay>,
    capture: Arc<dyn Capture>,
    link: Arc<dyn MediaLink>,
    endpoint: Mutex<Option<IngestEndpoint>>,
    attempt: Mutex<Option<CancellationToken>>,
    publishing: Mutex<Option<Publishing>>,
    guest: tokio::sync::Mutex<Option<Guest>>,
    status: watch::Sender<StreamStatus>,
    events: mpsc::UnboundedSender<StreamEvent>,
}

struct Publishing {
    track: Arc<dyn MediaTrack>,
    connection: Box<dyn MediaConnection>,
    endpoint: IngestEndpoint,
    stopping: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

struct Guest {
    playback_url: String,
    connection: Box<dyn MediaConnection>,
}

/// The collaborators a [LiveStreamManager] drives
#[derive(Clone)]
pub struct MediaEnvironment {
    pub relay: Arc<dyn Relay>,
    pub capture: Arc<dyn Capture>,
    pub link: Arc<dyn MediaLink>,
}

impl LiveStreamManager {
    pub fn new(
        config: Config,
        room_id: RoomId,
        participant_id: ParticipantId,
        environment: MediaEnvironment,
    ) -> (Self, StreamEvents) {
        let (status, _) = watch::channel(StreamStatus {
            state: StreamState::NotStarted,
            guest: GuestState::Detached,
        });
        let (events, receiver) = mpsc::unbounded_channel();

        let inner = Inner {
            config,
            room_id,
            participant_id,
            relay: environment.relay,
            capture: environment.capture,
            link: environment.link,
            endpoint: Default::default(),
            attempt: Default::default(),
            publishing: Default::default(),
            guest: Default::default(),
            status,
            events,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Starts publishing a captured track, returning the fields to persist
    /// and broadcast once the relay confirms the connection.
    ///
    /// `existing` is the room's current endpoint, reused instead of provisioning a new one.
    pub async fn start_publishing(
        &self,
        existing: Option<IngestEndpoint>,
    ) -> Result<StreamFields, StreamError> {
        let token = {
            let mut attempt = self.inner.attempt.lock();

            if attempt.is_some() || self.inner.publishing.lock().is_some() {
                return Err(StreamError::AlreadyPublishing);
            }

            let token = CancellationToken::new();
            *attempt = Some(token.clone());
            token
        };

        self.inner.set_state_if_different(StreamState::Provisioning);

        let mut result = self.inner.establish(existing, &token).await;
        self.inner.attempt.lock().take();

        if token.is_cancelled() {
            if let Ok(publishing) = result {
                self.inner.teardown(publishing).await;
                result = Err(StreamError::Cancelled);
            }
        }

        match result {
            Ok(publishing) => {
                let fields = StreamFields::live(self.inner.participant_id, &publishing.endpoint);
                let track = publishing.track.clone();
                let stopping = publishing.stopping.clone();

                *self.inner.publishing.lock() = Some(publishing);
                self.inner.set_state_if_different(StreamState::Live);

                // Spawned once publishing is stored, so an ended track always finds it
                let watcher = spawn_track_watcher(Arc::downgrade(&self.inner), track, stopping);
                if let Some(publishing) = self.inner.publishing.lock().as_mut() {
                    publishing.watcher = Some(watcher);
                }

                info!("Room {} is live", self.inner.room_id);

                Ok(fields)
            }
            Err(error) => {
                warn!("Could not start publishing: {}", error);
                self.inner.set_state_if_different(StreamState::NotStarted);

                Err(error)
            }
        }
    }

    /// Stops publishing and returns the fields to persist and broadcast,
    /// or `None` if nothing was published. Idempotent.
    pub async fn stop_publishing(&self) -> Option<StreamFields> {
        if let Some(token) = self.inner.attempt.lock().take() {
            token.cancel();
        }

        let publishing = self.inner.publishing.lock().take();
        let fields = match publishing {
            Some(publishing) => Some(self.inner.teardown(publishing).await),
            None => None,
        };

        self.inner.set_state_if_different(StreamState::NotStarted);
        fields
    }

    /// Attaches to or detaches from the room's stream as a guest, following its fields.
    pub async fn sync_guest(&self, fields: &StreamFields) -> Result<(), StreamError> {
        let target = fields
            .is_streamed_by_other(self.inner.participant_id)
            .then(|| {
                fields
                    .current_streamer_id
                    .zip(fields.stream_playback_endpoint.clone())
            })
            .flatten()
            .filter(|(_, url)| !url.is_empty());

        let mut guest = self.inner.guest.lock().await;

        let Some((streamer, playback_url)) = target else {
            if let Some(previous) = guest.take() {
                self.inner.detach(previous).await;
            }

            return Ok(());
        };

        if guest
            .as_ref()
            .is_some_and(|g| g.playback_url == playback_url)
        {
            return Ok(());
        }

        if let Some(previous) = guest.take() {
            self.inner.detach(previous).await;
        }

        let connection = self
            .inner
            .link
            .play(&playback_url)
            .await
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        info!("Watching the stream of {} at {}", streamer, playback_url);

        *guest = Some(Guest {
            playback_url: playback_url.clone(),
            connection,
        });

        self.inner.status.send_modify(|status| {
            status.guest = GuestState::Attached {
                streamer,
                playback_url,
            }
        });

        Ok(())
    }

    /// Closes the guest playback connection, if any. Idempotent.
    pub async fn detach_guest(&self) {
        let previous = self.inner.guest.lock().await.take();

        if let Some(previous) = previous {
            self.inner.detach(previous).await;
        }
    }

    /// Destroys the room's endpoint at the relay.
    pub async fn release_endpoint(&self, endpoint: Option<IngestEndpoint>) {
        let cached = self.inner.endpoint.lock().take();

        if let Some(endpoint) = endpoint.or(cached) {
            match self.inner.relay.destroy_endpoint(&endpoint.id).await {
                Ok(_) => info!("Released stream endpoint {}", endpoint.id),
                Err(e) => warn!("Could not release stream endpoint {}: {}", endpoint.id, e),
            }
        }
    }

    /// Stops publishing and watching. Returns the fields to persist if publishing was stopped.
    pub async fn shutdown(&self) -> Option<StreamFields> {
        let fields = self.stop_publishing().await;
        self.detach_guest().await;

        fields
    }

    pub fn subscribe(&self) -> watch::Receiver<StreamStatus> {
        self.inner.status.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.inner.status.borrow().state
    }

    pub fn status(&self) -> StreamStatus {
        self.inner.status.borrow().clone()
    }
}

impl Inner {
    async fn establish(
        &self,
        existing: Option<IngestEndpoint>,
        token: &CancellationToken,
    ) -> Result<Publishing, StreamError> {
        let endpoint = self.endpoint(existing).await?;

        let track = self
            .capture
            .acquire()
            .await
            .map_err(|e| StreamError::CaptureDenied(e.to_string()))?;

        if token.is_cancelled() {
            track.stop();
            return Err(StreamError::Cancelled);
        }

        self.set_state_if_different(StreamState::Ingesting);

        let connection = match self.link.ingest(&endpoint.ingest_url, track.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                track.stop();
                return Err(StreamError::Connection(e.to_string()));
            }
        };

        if let Err(e) = self.await_connected(&endpoint, track.as_ref(), token).await {
            connection.close().await;
            track.stop();

            return Err(e);
        }

        Ok(Publishing {
            track,
            connection,
            endpoint,
            stopping: CancellationToken::new(),
            watcher: None,
        })
    }

    async fn endpoint(&self, existing: Option<IngestEndpoint>) -> Result<IngestEndpoint, StreamError> {
        let cached = self.endpoint.lock().clone();

        if let Some(endpoint) = existing.or(cached) {
            debug!("Reusing stream endpoint {}", endpoint.id);
            *self.endpoint.lock() = Some(endpoint.clone());

            return Ok(endpoint);
        }

        let endpoint = self
            .relay
            .create_ingest_endpoint(self.room_id)
            .await
            .map_err(|e| StreamError::Provisioning(e.to_string()))?;

        info!("Provisioned stream endpoint {}", endpoint.id);
        *self.endpoint.lock() = Some(endpoint.clone());

        Ok(endpoint)
    }

    /// Polls the relay until it confirms the ingest connection.
    /// Fails early if the track ends while waiting.
    async fn await_connected(
        &self,
        endpoint: &IngestEndpoint,
        track: &dyn MediaTrack,
        token: &CancellationToken,
    ) -> Result<(), StreamError> {
        let mut ticker = Ticker::delayed(self.config.connection_poll_interval, token.clone());

        let poll = async {
            while ticker.tick().await.is_some() {
                match self.relay.connection_status(&endpoint.id).await {
                    Ok(ConnectionStatus::Connected) => return Ok(()),
                    Ok(ConnectionStatus::Pending) => {
                        debug!("Stream endpoint {} is still pending", endpoint.id)
                    }
                    Err(e) => warn!("Could not poll stream endpoint {}: {}", endpoint.id, e),
                }
            }

            Err(StreamError::Cancelled)
        };

        let watched = async {
            tokio::select! {
                result = poll => result,
                _ = track.ended() => Err(StreamError::TrackEnded),
            }
        };

        timeout(self.config.connection_timeout, watched)
            .await
            .map_err(|_| {
                StreamError::Provisioning(format!(
                    "relay did not confirm the connection within {:?}",
                    self.config.connection_timeout
                ))
            })?
    }

    async fn teardown(&self, publishing: Publishing) -> StreamFields {
        publishing.stopping.cancel();
        publishing.track.stop();
        publishing.connection.close().await;

        if let Some(watcher) = publishing.watcher {
            if let Err(e) = watcher.await {
                warn!("Track watcher ended abnormally: {}", e);
            }
        }

        info!("Stopped publishing to {}", publishing.endpoint.id);

        StreamFields::idle(Some(&publishing.endpoint))
    }

    async fn detach(&self, guest: Guest) {
        guest.connection.close().await;
        self.status
            .send_modify(|status| status.guest = GuestState::Detached);

        info!("Stopped watching {}", guest.playback_url);
    }

    async fn on_track_ended(&self) {
        let publishing = self.publishing.lock().take();

        let Some(publishing) = publishing else {
            return;
        };

        warn!("Published track ended outside of the stop path");

        publishing.connection.close().await;
        self.set_state_if_different(StreamState::NotStarted);

        let fields = StreamFields::idle(Some(&publishing.endpoint));
        let _ = self.events.send(StreamEvent::TrackEnded { fields });
    }

    fn set_state_if_different(&self, state: StreamState) {
        let changed = self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }

            status.state = state;
            true
        });

        if changed {
            debug!("Stream state of room {} is now {:?}", self.room_id, state);
        }
    }
}

fn spawn_track_watcher(
    inner: Weak<Inner>,
    track: Arc<dyn MediaTrack>,
    stopping: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = stopping.cancelled() => {}
            _ = track.ended() => {
                if let Some(inner) = inner.upgrade() {
                    inner.on_track_ended().await;
                }
            }
        }
    })
}
