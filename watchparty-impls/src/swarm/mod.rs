//! An in-process, content-addressed peer-to-peer swarm.
//!
//! Every [SwarmTransport] created from the same [Swarm] can fetch what the
//! others seed. Content is delivered piece by piece over time, so downloads
//! go through the same metadata and first-piece waits as a real network.

mod transfer;

use transfer::*;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use crossbeam::atomic::AtomicCell;
use dashmap::DashMap;
use log::{info, warn};
use sha2::{Digest, Sha256};
use url::Url;
use watchparty_core::{ContentUri, LocalFile, Transfer, Transport, TransportError};

/// The shared network of seeders
pub struct Swarm {
    piece_size: u64,
    piece_interval: Duration,
    seeded: DashMap<String, SeededContent>,
    leechers: DashMap<String, usize>,
}

struct SeededContent {
    file: LocalFile,
    seeders: usize,
}

/// A participant's client on a [Swarm]
pub struct SwarmTransport {
    swarm: Arc<Swarm>,
    proxy_base: Url,
    has_worker: bool,
    ready: AtomicCell<bool>,
    live: Arc<AtomicCell<usize>>,
}

impl Swarm {
    pub fn new(piece_size: u64, piece_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            piece_size: piece_size.max(1),
            piece_interval,
            seeded: Default::default(),
            leechers: Default::default(),
        })
    }

    /// Creates a client that exposes fetched content under `proxy_base`.
    pub fn transport(self: &Arc<Self>, proxy_base: Url) -> SwarmTransport {
        SwarmTransport {
            swarm: self.clone(),
            proxy_base,
            has_worker: true,
            ready: AtomicCell::new(false),
            live: Default::default(),
        }
    }

    /// Creates a client in an environment without a background worker,
    /// which can never be initialised.
    pub fn transport_without_worker(self: &Arc<Self>, proxy_base: Url) -> SwarmTransport {
        SwarmTransport {
            has_worker: false,
            ..self.transport(proxy_base)
        }
    }

    /// Returns true if at least one client seeds the content.
    pub fn is_seeded(&self, info_hash: &str) -> bool {
        self.seeded.contains_key(info_hash)
    }

    fn add_seeder(&self, info_hash: &str, file: LocalFile) {
        self.seeded
            .entry(info_hash.to_string())
            .and_modify(|c| c.seeders += 1)
            .or_insert(SeededContent { file, seeders: 1 });
    }

    fn remove_seeder(&self, info_hash: &str) {
        let gone = match self.seeded.get_mut(info_hash) {
            Some(mut content) => {
                content.seeders = content.seeders.saturating_sub(1);
                content.seeders == 0
            }
            None => false,
        };

        if gone {
            self.seeded.remove(info_hash);
            info!("{} has no seeders left", info_hash);
        }
    }

    fn lookup(&self, info_hash: &str) -> Option<(String, u64)> {
        self.seeded
            .get(info_hash)
            .map(|c| (c.file.name.clone(), c.file.data.len() as u64))
    }

    fn add_leecher(&self, info_hash: &str) {
        *self.leechers.entry(info_hash.to_string()).or_default() += 1;
    }

    fn remove_leecher(&self, info_hash: &str) {
        if let Some(mut count) = self.leechers.get_mut(info_hash) {
            *count = count.saturating_sub(1);
        }
    }

    fn leecher_count(&self, info_hash: &str) -> usize {
        self.leechers.get(info_hash).map(|c| *c).unwrap_or_default()
    }

    /// The rate at which a single peer connection delivers content, in bytes per second
    fn peer_rate(&self) -> f64 {
        self.piece_size as f64 / self.piece_interval.as_secs_f64().max(f64::EPSILON)
    }
}

impl Default for Swarm {
    fn default() -> Self {
        Self {
            piece_size: 256 * 1024,
            piece_interval: Duration::from_millis(250),
            seeded: Default::default(),
            leechers: Default::default(),
        }
    }
}

impl SwarmTransport {
    /// The number of transfers this client holds that were not destroyed yet.
    pub fn live_transfers(&self) -> usize {
        self.live.load()
    }

    fn check_ready(&self) -> Result<(), TransportError> {
        if self.ready.load() {
            Ok(())
        } else {
            Err(TransportError::Unsupported(
                "transport client is not initialised".to_string(),
            ))
        }
    }

    fn registration(&self) -> Registration {
        Registration::new(self.live.clone())
    }
}

#[async_trait]
impl Transport for SwarmTransport {
    async fn ensure_ready(&self) -> Result<(), TransportError> {
        if !self.has_worker {
            warn!("Cannot start the transport client without a background worker");

            return Err(TransportError::Unsupported(
                "no background worker is available to proxy content".to_string(),
            ));
        }

        self.ready.store(true);
        Ok(())
    }

    async fn seed(&self, file: LocalFile) -> Result<Arc<dyn Transfer>, TransportError> {
        self.check_ready()?;

        let info_hash = info_hash(&file.data);
        let uri = ContentUri::from_info_hash(&info_hash, &file.name)
            .map_err(|e| TransportError::Rejected(e.to_string()))?;

        self.swarm.add_seeder(&info_hash, file.clone());

        Ok(Arc::new(SeedTransfer::new(
            uri,
            info_hash,
            file,
            self.swarm.clone(),
            self.proxy_base.clone(),
            self.registration(),
        )))
    }

    async fn fetch(&self, uri: &ContentUri) -> Result<Arc<dyn Transfer>, TransportError> {
        self.check_ready()?;

        Ok(Arc::new(FetchTransfer::start(
            uri.clone(),
            self.swarm.clone(),
            self.proxy_base.clone(),
            self.registration(),
        )))
    }
}

/// The info hash of some content: the first 20 bytes of its SHA-256 digest, hex encoded.
pub fn info_hash(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    hex::encode(&digest[..20])
}

fn stream_url(proxy_base: &Url, info_hash: &str, name: &str) -> Option<Url> {
    proxy_base.join(&format!("{}/{}", info_hash, name)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_is_content_addressed() {
        let a = info_hash(b"some video");
        let b = info_hash(b"some video");
        let c = info_hash(b"another video");

        assert_eq!(a.len(), 40);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_stream_url_is_under_the_proxy() {
        let base = Url::parse("http://localhost/webtorrent/").unwrap();
        let url = stream_url(&base, "abc", "my movie.mp4").unwrap();

        assert_eq!(url.as_str(), "http://localhost/webtorrent/abc/my%20movie.mp4");
    }
}
