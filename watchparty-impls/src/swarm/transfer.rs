use std::sync::Arc;

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use log::{debug, info};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;
use watchparty_core::{
    ContentFile, ContentUri, LocalFile, PeriodicTask, Transfer, TransferStats, TransportError,
};

use super::{stream_url, Swarm};

/// Counts a transfer as live until it is destroyed
pub struct Registration {
    live: Arc<AtomicCell<usize>>,
    released: AtomicCell<bool>,
}

impl Registration {
    pub fn new(live: Arc<AtomicCell<usize>>) -> Self {
        live.fetch_add(1);

        Self {
            live,
            released: AtomicCell::new(false),
        }
    }

    /// Returns false if it was already released.
    fn release(&self) -> bool {
        if self.released.swap(true) {
            return false;
        }

        self.live.fetch_sub(1);
        true
    }
}

pub struct SeedTransfer {
    uri: ContentUri,
    info_hash: String,
    file: LocalFile,
    swarm: Arc<Swarm>,
    proxy_base: Url,
    registration: Registration,
}

impl SeedTransfer {
    pub fn new(
        uri: ContentUri,
        info_hash: String,
        file: LocalFile,
        swarm: Arc<Swarm>,
        proxy_base: Url,
        registration: Registration,
    ) -> Self {
        Self {
            uri,
            info_hash,
            file,
            swarm,
            proxy_base,
            registration,
        }
    }
}

#[async_trait]
impl Transfer for SeedTransfer {
    fn uri(&self) -> &ContentUri {
        &self.uri
    }

    fn stats(&self) -> TransferStats {
        let peers = self.swarm.leecher_count(&self.info_hash);

        TransferStats {
            // Nothing is fetched when seeding
            progress: 0.,
            download_rate: 0.,
            upload_rate: peers as f64 * self.swarm.peer_rate(),
            peers,
        }
    }

    async fn metadata(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn files(&self) -> Vec<ContentFile> {
        stream_url(&self.proxy_base, &self.info_hash, &self.file.name)
            .map(|stream_url| ContentFile {
                name: self.file.name.clone(),
                length: self.file.data.len() as u64,
                stream_url,
            })
            .into_iter()
            .collect()
    }

    async fn destroy(&self) {
        if self.registration.release() {
            self.swarm.remove_seeder(&self.info_hash);
            info!("Stopped seeding {}", self.uri);
        }
    }
}

#[derive(Default)]
struct FetchState {
    /// The name and length of the content, once a seeder advertised it
    metadata: Option<(String, u64)>,
    received: u64,
    peers: usize,
    download_rate: f64,
}

pub struct FetchTransfer {
    uri: ContentUri,
    swarm: Arc<Swarm>,
    proxy_base: Url,
    state: Arc<Mutex<FetchState>>,
    metadata: watch::Receiver<bool>,
    closed: CancellationToken,
    pieces: Mutex<Option<PeriodicTask>>,
    registration: Registration,
}

impl FetchTransfer {
    pub fn start(
        uri: ContentUri,
        swarm: Arc<Swarm>,
        proxy_base: Url,
        registration: Registration,
    ) -> Self {
        let state: Arc<Mutex<FetchState>> = Default::default();
        let (metadata_sender, metadata) = watch::channel(false);

        swarm.add_leecher(uri.info_hash());

        let pieces = {
            let swarm = swarm.clone();
            let state = state.clone();
            let info_hash = uri.info_hash().to_string();

            PeriodicTask::spawn(swarm.piece_interval, move || {
                receive_piece(&swarm, &info_hash, &state, &metadata_sender)
            })
        };

        debug!("Fetching {}", uri);

        Self {
            uri,
            swarm,
            proxy_base,
            state,
            metadata,
            closed: CancellationToken::new(),
            pieces: Mutex::new(Some(pieces)),
            registration,
        }
    }
}

fn receive_piece(
    swarm: &Swarm,
    info_hash: &str,
    state: &Mutex<FetchState>,
    metadata: &watch::Sender<bool>,
) {
    let mut state = state.lock();

    let Some((name, length)) = swarm.lookup(info_hash) else {
        state.peers = 0;
        state.download_rate = 0.;
        return;
    };

    if state.metadata.is_none() {
        state.metadata = Some((name, length));
        metadata.send_replace(true);
    }

    let complete = state.received >= length;

    state.received = (state.received + swarm.piece_size).min(length);
    state.peers = 1;
    state.download_rate = if complete { 0. } else { swarm.peer_rate() };
}

#[async_trait]
impl Transfer for FetchTransfer {
    fn uri(&self) -> &ContentUri {
        &self.uri
    }

    fn stats(&self) -> TransferStats {
        let state = self.state.lock();

        let progress = match state.metadata {
            Some((_, length)) if length > 0 => state.received as f64 / length as f64,
            Some(_) => 1.,
            None => 0.,
        };

        TransferStats {
            progress,
            download_rate: state.download_rate,
            upload_rate: 0.,
            peers: state.peers,
        }
    }

    async fn metadata(&self) -> Result<(), TransportError> {
        let mut metadata = self.metadata.clone();

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = metadata.wait_for(|ready| *ready) => {
                result.map(|_| ()).map_err(|_| TransportError::Closed)
            }
        }
    }

    fn files(&self) -> Vec<ContentFile> {
        let state = self.state.lock();

        match &state.metadata {
            Some((name, length)) if state.received > 0 || *length == 0 => {
                stream_url(&self.proxy_base, self.uri.info_hash(), name)
                    .map(|stream_url| ContentFile {
                        name: name.clone(),
                        length: *length,
                        stream_url,
                    })
                    .into_iter()
                    .collect()
            }
            _ => vec![],
        }
    }

    async fn destroy(&self) {
        self.closed.cancel();

        let pieces = self.pieces.lock().take();
        if let Some(pieces) = pieces {
            pieces.shutdown().await;
        }

        if self.registration.release() {
            self.swarm.remove_leecher(self.uri.info_hash());
            debug!("Stopped fetching {}", self.uri);
        }
    }
}
