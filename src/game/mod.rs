pub mod cache;
pub mod clock;
pub mod compiler;
pub mod manager;
pub mod payout;
pub mod rng;
pub mod slice;

pub use compiler::{build_round_runtime, RoundRuntime};
pub use manager::{ClickResult, GameManager};
