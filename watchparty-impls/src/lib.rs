//! Implementations of the collaborators the watch party core consumes.

mod bus;
mod relay;
mod swarm;

pub use bus::*;
pub use relay::*;
pub use swarm::*;
