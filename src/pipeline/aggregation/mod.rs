//! Turning perception outcomes into one structured result per request.

pub mod types;
pub mod aggregator;
pub mod assembler;

pub use types::*;
pub use aggregator::aggregate;
pub use assembler::{assemble, PERCEPTION_FAILED_FINDING};
