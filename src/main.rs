//! Runs two participants through a watch party over in-process collaborators.
//!
//! Set `DATABASE_URL` to store the room in postgres instead of memory.

mod logging;

use std::{sync::Arc, time::Duration};

use colored::Colorize;
use log::{info, warn};
use tokio::time::timeout;
use url::Url;
use watchparty_collab::{Collab, Database, Media, MemoryDatabase, PgDatabase};
use watchparty_core::{format_speed, Config, LocalFile, MediaEnvironment};
use watchparty_impls::{LocalBus, LoopbackCapture, LoopbackLink, LoopbackRelay, Swarm};

/// The in-process collaborators every participant of the demo shares
struct Stage<Db> {
    config: Config,
    database: Arc<Db>,
    bus: Arc<LocalBus>,
    swarm: Arc<Swarm>,
    relay: Arc<LoopbackRelay>,
    proxy: Url,
}

impl<Db> Stage<Db>
where
    Db: Database,
{
    fn participant(&self) -> Collab<Db, LocalBus> {
        Collab::new(
            self.config.clone(),
            self.database.clone(),
            self.bus.clone(),
            Arc::new(self.swarm.transport(self.proxy.clone())),
            MediaEnvironment {
                relay: self.relay.clone(),
                capture: LoopbackCapture::new(),
                link: LoopbackLink::new(self.relay.clone()),
            },
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logger()?;

    println!("{}", "watchparty".bright_purple().bold());

    let config = Config::from_env();

    match std::env::var("DATABASE_URL") {
        Ok(url) => {
            info!("Connecting to database...");

            let database = PgDatabase::new(&url).await?;
            database.migrate().await?;

            run(config, Arc::new(database)).await
        }
        Err(_) => {
            info!("DATABASE_URL is not set, keeping rooms in memory");
            run(config, Arc::new(MemoryDatabase::new())).await
        }
    }
}

async fn run<Db>(config: Config, database: Arc<Db>) -> anyhow::Result<()>
where
    Db: Database,
{
    let stage = Stage {
        bus: LocalBus::new(&config),
        swarm: Swarm::new(64 * 1024, Duration::from_millis(50)),
        relay: LoopbackRelay::new(2),
        proxy: Url::parse("http://localhost:8080/webtorrent/")?,
        database,
        config,
    };

    let host = stage.participant();
    let guest = stage.participant();

    let (room, _) = host.rooms.create_room("host", "Host", None).await?;
    let host_session = host.rooms.join(room.id, "host").await?;
    let guest_session = guest.rooms.join(room.id, "guest").await?;

    guest_session.send_message("Hi!", Some("Guest")).await?;
    host_session.send_message("Welcome", None).await?;
    host_session.set_playing(true, Some(0.)).await?;

    let file = LocalFile {
        name: "demo.mp4".to_string(),
        mime: "video/mp4".to_string(),
        data: Arc::from(vec![0u8; 1024 * 1024].into_boxed_slice()),
    };

    let uri = host_session.upload_and_share_file(file).await?;
    info!("Shared {}", uri);

    let mut media = guest_session.media();
    let ready = match timeout(
        Duration::from_secs(30),
        media.wait_for(|m| m.is_playable() || m.needs_replacement()),
    )
    .await
    {
        Ok(Ok(media)) => Some(media.clone()),
        _ => None,
    };

    match ready {
        Some(Media::Streamable(handle)) => {
            info!("Guest streams {} from {}", handle.name, handle.url)
        }
        Some(other) => warn!("Guest can't play the shared file: {:?}", other),
        None => warn!("Guest gave up waiting for the shared file"),
    }

    if let Some(progress) = guest_session.torrent_progress() {
        info!(
            "Downloaded {:.0}% at {} from {} peers",
            progress.ratio * 100.,
            format_speed(progress.download_rate),
            progress.peer_count
        );
    }

    host_session.start_streaming().await?;
    info!("Guest stream: {:?}", guest_session.stream_state().borrow().guest);
    host_session.stop_streaming().await?;

    host_session.delete_room().await?;

    let mut terminated = guest_session.terminated();
    let ended = timeout(Duration::from_secs(5), terminated.wait_for(Option::is_some)).await;

    if let Ok(Ok(error)) = ended {
        info!("Guest left the room: {:?}", *error);
    }

    host.shutdown().await;
    guest.shutdown().await;

    Ok(())
}
