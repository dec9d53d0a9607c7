pub mod block;
pub mod config;
pub mod model;

pub use block::{BlockFeedForward, BlockOutput, MoETBlock};
pub use config::{BlockPattern, MoETConfig};
pub use model::{MoET, MoETOutput};
