//! In-process stand-ins for the live relay, the capture surface and the
//! media connections between them.

use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use watchparty_core::{
    Capture, CaptureError, ConnectionStatus, IngestEndpoint, LinkError, MediaConnection,
    MediaLink, MediaTrack, Relay, RelayError, RoomId,
};

/// A relay that reports an ingest connection as pending for a number of
/// polls before confirming it.
pub struct LoopbackRelay {
    pending_polls: usize,
    endpoints: DashMap<String, LoopbackEndpoint>,
    fail_provisioning: AtomicCell<bool>,
    created: AtomicCell<usize>,
    polls: AtomicCell<usize>,
}

struct LoopbackEndpoint {
    endpoint: IngestEndpoint,
    ingesting: bool,
    pending_left: usize,
}

impl LoopbackRelay {
    pub fn new(pending_polls: usize) -> Arc<Self> {
        Arc::new(Self {
            pending_polls,
            endpoints: Default::default(),
            fail_provisioning: AtomicCell::new(false),
            created: AtomicCell::new(0),
            polls: AtomicCell::new(0),
        })
    }

    /// Makes endpoint creation fail, like an unreachable provisioning service.
    pub fn set_fail_provisioning(&self, fail: bool) {
        self.fail_provisioning.store(fail);
    }

    /// The number of endpoints created so far.
    pub fn created_count(&self) -> usize {
        self.created.load()
    }

    /// The number of status polls answered so far.
    pub fn poll_count(&self) -> usize {
        self.polls.load()
    }

    pub fn endpoint_exists(&self, id: &str) -> bool {
        self.endpoints.contains_key(id)
    }

    pub fn is_ingesting(&self, id: &str) -> bool {
        self.endpoints.get(id).is_some_and(|e| e.ingesting)
    }

    fn start_ingest(&self, ingest_url: &str) -> Option<String> {
        let mut entry = self
            .endpoints
            .iter_mut()
            .find(|e| e.endpoint.ingest_url == ingest_url)?;

        entry.ingesting = true;
        entry.pending_left = self.pending_polls;

        Some(entry.endpoint.id.clone())
    }

    fn stop_ingest(&self, id: &str) {
        if let Some(mut entry) = self.endpoints.get_mut(id) {
            entry.ingesting = false;
        }
    }

    fn is_playable(&self, playback_url: &str) -> bool {
        self.endpoints
            .iter()
            .any(|e| e.endpoint.playback_url == playback_url && e.ingesting)
    }
}

#[async_trait]
impl Relay for LoopbackRelay {
    async fn create_ingest_endpoint(&self, room_id: RoomId) -> Result<IngestEndpoint, RelayError> {
        if self.fail_provisioning.load() {
            return Err(RelayError::Request("provisioning service is unreachable".into()));
        }

        let number = self.created.fetch_add(1) + 1;
        let id = format!("{}-{}", room_id.simple(), number);

        let endpoint = IngestEndpoint {
            id: id.clone(),
            ingest_url: format!("loopback://{}/ingest", id),
            playback_url: format!("loopback://{}/playback", id),
        };

        self.endpoints.insert(
            id,
            LoopbackEndpoint {
                endpoint: endpoint.clone(),
                ingesting: false,
                pending_left: self.pending_polls,
            },
        );

        Ok(endpoint)
    }

    async fn connection_status(&self, endpoint_id: &str) -> Result<ConnectionStatus, RelayError> {
        self.polls.fetch_add(1);

        let mut entry = self
            .endpoints
            .get_mut(endpoint_id)
            .ok_or_else(|| RelayError::NotFound(endpoint_id.to_string()))?;

        if !entry.ingesting {
            return Ok(ConnectionStatus::Pending);
        }

        if entry.pending_left > 0 {
            entry.pending_left -= 1;
            return Ok(ConnectionStatus::Pending);
        }

        Ok(ConnectionStatus::Connected)
    }

    async fn destroy_endpoint(&self, endpoint_id: &str) -> Result<(), RelayError> {
        self.endpoints
            .remove(endpoint_id)
            .map(|_| ())
            .ok_or_else(|| RelayError::NotFound(endpoint_id.to_string()))
    }
}

/// A capture surface handing out tracks that tests can end from the outside.
#[derive(Default)]
pub struct LoopbackCapture {
    deny: AtomicCell<bool>,
    tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
}

impl LoopbackCapture {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every following acquisition fail, like a refused permission prompt.
    pub fn set_deny(&self, deny: bool) {
        self.deny.store(deny);
    }

    /// The most recently acquired track.
    pub fn last_track(&self) -> Option<Arc<LoopbackTrack>> {
        self.tracks.lock().last().cloned()
    }
}

#[async_trait]
impl Capture for LoopbackCapture {
    async fn acquire(&self) -> Result<Arc<dyn MediaTrack>, CaptureError> {
        if self.deny.load() {
            return Err(CaptureError::Denied("permission denied by the user".into()));
        }

        let mut tracks = self.tracks.lock();
        let track = Arc::new(LoopbackTrack {
            label: format!("screen-{}", tracks.len() + 1),
            ended: CancellationToken::new(),
        });

        tracks.push(track.clone());

        Ok(track)
    }
}

pub struct LoopbackTrack {
    label: String,
    ended: CancellationToken,
}

impl LoopbackTrack {
    /// Ends the track the way an operating system "stop sharing" button would.
    pub fn end_externally(&self) {
        info!("Track {} ended by the environment", self.label);
        self.ended.cancel();
    }
}

#[async_trait]
impl MediaTrack for LoopbackTrack {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ended(&self) {
        self.ended.cancelled().await
    }

    fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    fn stop(&self) {
        self.ended.cancel();
    }
}

/// Connects ingest and playback endpoints of a [LoopbackRelay].
pub struct LoopbackLink {
    relay: Arc<LoopbackRelay>,
    open: Arc<AtomicCell<usize>>,
}

impl LoopbackLink {
    pub fn new(relay: Arc<LoopbackRelay>) -> Arc<Self> {
        Arc::new(Self {
            relay,
            open: Default::default(),
        })
    }

    /// The number of connections that are not closed yet.
    pub fn open_connections(&self) -> usize {
        self.open.load()
    }

    fn connection(&self, url: &str, ingest_id: Option<String>) -> LoopbackConnection {
        self.open.fetch_add(1);

        LoopbackConnection {
            url: url.to_string(),
            ingest_id,
            relay: self.relay.clone(),
            open: self.open.clone(),
            closed: AtomicCell::new(false),
        }
    }
}

#[async_trait]
impl MediaLink for LoopbackLink {
    async fn ingest(
        &self,
        url: &str,
        track: Arc<dyn MediaTrack>,
    ) -> Result<Box<dyn MediaConnection>, LinkError> {
        if track.is_ended() {
            return Err(LinkError::Closed);
        }

        let id = self.relay.start_ingest(url).ok_or_else(|| LinkError::Connect {
            url: url.to_string(),
            reason: "no such ingest endpoint".to_string(),
        })?;

        debug!("Ingesting {} into {}", track.label(), id);

        Ok(Box::new(self.connection(url, Some(id))))
    }

    async fn play(&self, url: &str) -> Result<Box<dyn MediaConnection>, LinkError> {
        if !self.relay.is_playable(url) {
            return Err(LinkError::Connect {
                url: url.to_string(),
                reason: "nothing is being ingested".to_string(),
            });
        }

        Ok(Box::new(self.connection(url, None)))
    }
}

pub struct LoopbackConnection {
    url: String,
    ingest_id: Option<String>,
    relay: Arc<LoopbackRelay>,
    open: Arc<AtomicCell<usize>>,
    closed: AtomicCell<bool>,
}

#[async_trait]
impl MediaConnection for LoopbackConnection {
    fn url(&self) -> &str {
        &self.url
    }

    async fn close(&self) {
        if self.closed.swap(true) {
            return;
        }

        if let Some(id) = &self.ingest_id {
            self.relay.stop_ingest(id);
        }

        self.open.fetch_sub(1);
    }
}
