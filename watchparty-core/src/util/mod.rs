mod id;
mod speed;

pub use id::*;
pub use speed::*;
