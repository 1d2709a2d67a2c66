//! The synchronization and distribution core of a watch party room.
//!
//! Everything here talks to the outside world through the collaborator
//! traits ([Bus], [Transport], [Relay], [Capture], [MediaLink]), so the
//! managers can run against in-process implementations in tests.

mod bus;
mod config;
mod events;
mod presence;
mod reconcile;
mod stream;
mod ticker;
mod torrent;
mod util;

pub use bus::*;
pub use config::*;
pub use events::*;
pub use presence::*;
pub use reconcile::*;
pub use stream::*;
pub use ticker::*;
pub use torrent::*;
pub use util::*;
