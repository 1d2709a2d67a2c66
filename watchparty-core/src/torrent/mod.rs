//! Lifecycle of the single peer-to-peer transfer a process may hold.

mod transport;

pub use transport::*;

use std::{sync::Arc, time::Duration};

use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::watch, time::timeout};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Config, Id, PeriodicTask, Ticker};

pub type SessionId = Id<TorrentSession>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    Seeding,
    Downloading,
}

/// The observable state of the active transfer
#[derive(Debug, Clone, PartialEq)]
pub struct TorrentSession {
    pub id: SessionId,
    pub uri: ContentUri,
    pub role: Role,
    pub progress: f64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peers: usize,
    /// True once the content can be streamed
    pub ready: bool,
    pub error: Option<String>,
}

/// A sample of transfer telemetry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TorrentProgress {
    pub ratio: f64,
    pub download_rate: f64,
    pub upload_rate: f64,
    pub peer_count: usize,
}

/// A reference to content that can be streamed through the local proxy
#[derive(Debug, Clone, PartialEq)]
pub struct StreamHandle {
    pub session: SessionId,
    pub uri: ContentUri,
    pub name: String,
    pub url: Url,
    pub ready: bool,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TorrentError {
    /// No transport client could be initialised to seed the file
    #[error("Could not seed file: {0}")]
    Seed(String),
    /// No peer advertised the content in time
    #[error("Timed out after {waited:?} waiting for metadata of {uri}")]
    MetadataTimeout { uri: ContentUri, waited: Duration },
    /// Metadata is known, but no content was delivered in time
    #[error("Content of {0} is unavailable")]
    ContentUnavailable(ContentUri),
    /// Another seed, download or stop replaced this transfer
    #[error("Transfer was superseded")]
    Superseded,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct ActiveTransfer {
    id: SessionId,
    uri: ContentUri,
    transfer: Arc<dyn Transfer>,
    token: CancellationToken,
    telemetry: Option<PeriodicTask>,
    stream: Option<StreamHandle>,
}

/// Owns the single active seed or download.
///
/// Starting a transfer always tears down the previous one first, so there
/// is never more than one active session.
pub struct TorrentManager {
    config: Config,
    transport: Arc<dyn Transport>,
    /// Serializes the start and stop of transfers
    lifecycle: tokio::sync::Mutex<()>,
    active: Mutex<Option<ActiveTransfer>>,
    session: Arc<watch::Sender<Option<TorrentSession>>>,
}

impl TorrentSession {
    fn new(id: SessionId, uri: ContentUri, role: Role) -> Self {
        Self {
            id,
            uri,
            role,
            progress: 0.,
            download_rate: 0.,
            upload_rate: 0.,
            peers: 0,
            ready: false,
            error: None,
        }
    }

    fn apply(&mut self, stats: TransferStats) {
        self.progress = stats.progress;
        self.download_rate = stats.download_rate;
        self.upload_rate = stats.upload_rate;
        self.peers = stats.peers;
    }

    pub fn progress(&self) -> TorrentProgress {
        TorrentProgress {
            ratio: self.progress,
            download_rate: self.download_rate,
            upload_rate: self.upload_rate,
            peer_count: self.peers,
        }
    }
}

impl TorrentManager {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        let (session, _) = watch::channel(None);

        Self {
            config,
            transport,
            lifecycle: Default::default(),
            active: Default::default(),
            session: Arc::new(session),
        }
    }

    /// Starts seeding a local file, replacing any active transfer.
    pub async fn seed(&self, file: LocalFile) -> Result<ContentUri, TorrentError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;

        self.transport
            .ensure_ready()
            .await
            .map_err(|e| TorrentError::Seed(e.to_string()))?;

        let name = file.name.clone();
        let transfer = self
            .transport
            .seed(file)
            .await
            .map_err(|e| TorrentError::Seed(e.to_string()))?;

        let id = SessionId::new();
        let uri = transfer.uri().clone();

        let stream = transfer.files().into_iter().next().map(|f| StreamHandle {
            session: id,
            uri: uri.clone(),
            name: f.name,
            url: f.stream_url,
            ready: true,
        });

        let mut session = TorrentSession::new(id, uri.clone(), Role::Seeding);
        session.ready = true;
        self.session.send_replace(Some(session));

        *self.active.lock() = Some(ActiveTransfer {
            id,
            uri: uri.clone(),
            transfer: transfer.clone(),
            token: CancellationToken::new(),
            telemetry: Some(self.spawn_telemetry(id, transfer)),
            stream,
        });

        info!("Seeding {} as {}", name, uri);

        Ok(uri)
    }

    /// Starts fetching content and waits until it can be streamed.
    ///
    /// Fails with [TorrentError::MetadataTimeout] if no peer advertises the
    /// content within the configured timeout, and with
    /// [TorrentError::Superseded] if another transfer replaces this one first.
    pub async fn download(&self, uri: &ContentUri) -> Result<StreamHandle, TorrentError> {
        let (id, transfer, token) = {
            let _lifecycle = self.lifecycle.lock().await;

            if let Some(handle) = self.reusable(uri) {
                return Ok(handle);
            }

            self.teardown().await;
            self.transport.ensure_ready().await?;

            let transfer = self.transport.fetch(uri).await?;
            let id = SessionId::new();
            let token = CancellationToken::new();

            self.session.send_replace(Some(TorrentSession::new(
                id,
                uri.clone(),
                Role::Downloading,
            )));

            *self.active.lock() = Some(ActiveTransfer {
                id,
                uri: uri.clone(),
                transfer: transfer.clone(),
                token: token.clone(),
                telemetry: None,
                stream: None,
            });

            (id, transfer, token)
        };

        info!("Downloading {}", uri);

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TorrentError::Superseded),
            result = self.wait_for_content(uri, transfer.as_ref(), &token) => result,
        };

        match result {
            Ok(file) => self.finish_download(id, transfer, file),
            Err(TorrentError::Superseded) => Err(TorrentError::Superseded),
            Err(error) => {
                warn!("Download of {} failed: {}", uri, error);
                self.abandon(id, &error).await;

                Err(error)
            }
        }
    }

    /// The telemetry of the active transfer, if any.
    pub fn progress(&self) -> Option<TorrentProgress> {
        self.session
            .borrow()
            .as_ref()
            .filter(|s| s.error.is_none())
            .map(|s| s.progress())
    }

    /// Returns a receiver of the active session, updated on every telemetry sample.
    pub fn subscribe(&self) -> watch::Receiver<Option<TorrentSession>> {
        self.session.subscribe()
    }

    /// Tears down the active transfer, if any. Idempotent.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Stops the active transfer only if it is for the given content.
    pub async fn stop_if_current(&self, uri: &ContentUri) {
        let _lifecycle = self.lifecycle.lock().await;

        if self.is_current(uri) {
            self.teardown().await;
        }
    }

    /// The number of transfers currently held, which is never more than one.
    pub fn active_session_count(&self) -> usize {
        self.active.lock().is_some() as usize
    }

    /// Returns true if the active transfer is for the given content.
    pub fn is_current(&self, uri: &ContentUri) -> bool {
        self.active.lock().as_ref().is_some_and(|a| &a.uri == uri)
    }

    /// The role of the active transfer, if any.
    pub fn role(&self) -> Option<Role> {
        self.session
            .borrow()
            .as_ref()
            .filter(|s| s.error.is_none())
            .map(|s| s.role)
    }

    async fn wait_for_content(
        &self,
        uri: &ContentUri,
        transfer: &dyn Transfer,
        token: &CancellationToken,
    ) -> Result<ContentFile, TorrentError> {
        let waited = self.config.metadata_timeout;

        timeout(waited, transfer.metadata())
            .await
            .map_err(|_| TorrentError::MetadataTimeout {
                uri: uri.clone(),
                waited,
            })??;

        info!("Metadata of {} is ready", uri);

        let mut ticker = Ticker::new(self.config.content_poll_interval, token.clone());
        let first_content = async {
            while ticker.tick().await.is_some() {
                if let Some(file) = transfer.files().into_iter().next() {
                    return Ok(file);
                }
            }

            Err(TorrentError::Superseded)
        };

        timeout(waited, first_content)
            .await
            .map_err(|_| TorrentError::ContentUnavailable(uri.clone()))?
    }

    fn finish_download(
        &self,
        id: SessionId,
        transfer: Arc<dyn Transfer>,
        file: ContentFile,
    ) -> Result<StreamHandle, TorrentError> {
        let mut guard = self.active.lock();

        let Some(active) = guard.as_mut().filter(|a| a.id == id) else {
            return Err(TorrentError::Superseded);
        };

        let handle = StreamHandle {
            session: id,
            uri: active.uri.clone(),
            name: file.name,
            url: file.stream_url,
            ready: true,
        };

        active.stream = Some(handle.clone());
        active.telemetry = Some(self.spawn_telemetry(id, transfer));

        self.session.send_if_modified(|session| match session {
            Some(session) if session.id == id => {
                session.ready = true;
                true
            }
            _ => false,
        });

        info!("{} is streamable at {}", handle.uri, handle.url);

        Ok(handle)
    }

    /// Releases a failed transfer, keeping the error observable.
    async fn abandon(&self, id: SessionId, error: &TorrentError) {
        let taken = {
            let mut active = self.active.lock();

            match active.as_ref() {
                Some(a) if a.id == id => active.take(),
                _ => None,
            }
        };

        if let Some(active) = taken {
            active.token.cancel();
            active.transfer.destroy().await;

            self.session.send_if_modified(|session| match session {
                Some(session) if session.id == id => {
                    session.error = Some(error.to_string());
                    true
                }
                _ => false,
            });
        }
    }

    fn reusable(&self, uri: &ContentUri) -> Option<StreamHandle> {
        self.active
            .lock()
            .as_ref()
            .filter(|a| &a.uri == uri)
            .and_then(|a| a.stream.clone())
    }

    async fn teardown(&self) {
        let taken = self.active.lock().take();

        if let Some(active) = taken {
            active.token.cancel();

            if let Some(telemetry) = active.telemetry {
                telemetry.shutdown().await;
            }

            active.transfer.destroy().await;
            info!("Stopped transfer of {}", active.uri);
        }

        self.session.send_replace(None);
    }

    fn spawn_telemetry(&self, id: SessionId, transfer: Arc<dyn Transfer>) -> PeriodicTask {
        let session = self.session.clone();

        PeriodicTask::spawn(self.config.telemetry_interval, move || {
            let stats = transfer.stats();

            session.send_if_modified(|session| match session {
                Some(session) if session.id == id => {
                    session.apply(stats);
                    true
                }
                _ => false,
            });
        })
    }
}
