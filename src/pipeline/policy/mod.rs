//! Retry/timeout policy engine used by every adapter call.

pub mod types;
pub mod engine;

pub use types::*;
pub use engine::*;
