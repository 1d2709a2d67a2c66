mod http;
mod loopback;

pub use http::*;
pub use loopback::*;
