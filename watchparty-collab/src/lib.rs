//! Rooms on top of the watchparty core: the persistent room store, and the
//! session that keeps one participant's view of a room in sync.

mod db;
mod rooms;
mod state;

use std::sync::Arc;

use dashmap::DashMap;
use watchparty_core::{
    Bus, BusClient, Config, MediaEnvironment, ParticipantId, TorrentManager, Transport,
};

pub use db::*;
pub use rooms::*;
pub use state::*;

/// The watchparty collab system of one participant process, managing its
/// room sessions and the transfer they share.
pub struct Collab<Db, B> {
    context: CollabContext<Db, B>,

    pub rooms: RoomManager<Db, B>,
}

/// A type passed to the components of the collab system, to access the
/// store, the bus and the shared managers.
pub struct CollabContext<Db, B> {
    pub config: Config,
    pub database: Arc<Db>,
    pub bus: BusClient<B>,
    pub torrent: Arc<TorrentManager>,
    pub media: MediaEnvironment,

    pub sessions: Arc<DashMap<ParticipantId, Arc<RoomSession<Db, B>>>>,
}

impl<Db, B> Collab<Db, B>
where
    Db: Database,
    B: Bus,
{
    pub fn new(
        config: Config,
        database: Arc<Db>,
        bus: Arc<B>,
        transport: Arc<dyn Transport>,
        media: MediaEnvironment,
    ) -> Self {
        let torrent = Arc::new(TorrentManager::new(config.clone(), transport));

        let context = CollabContext {
            config,
            database,
            bus: BusClient::new(bus),
            torrent,
            media,

            sessions: Default::default(),
        };

        let room_manager = RoomManager::new(&context);

        Self {
            context,
            rooms: room_manager,
        }
    }

    pub fn torrent(&self) -> &Arc<TorrentManager> {
        &self.context.torrent
    }

    pub fn database(&self) -> &Arc<Db> {
        &self.context.database
    }

    /// Closes every open session.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self
            .context
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect();

        for session in sessions {
            session.close().await;
        }
    }
}

impl<Db, B> Clone for CollabContext<Db, B> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            database: self.database.clone(),
            bus: self.bus.clone(),
            torrent: self.torrent.clone(),
            media: self.media.clone(),
            sessions: self.sessions.clone(),
        }
    }
}
