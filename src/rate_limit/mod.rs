//! Rate-limit-aware execution.
//!
//! The [`BucketManager`] owns per-bucket state, the global block and the
//! invalid-request counter. Remote API conventions are isolated in a
//! [`ResponseClassifier`]; state changes are published as [`DispatchEvent`]s.

mod bucket;
mod classifier;
mod events;
mod global;
mod invalid;
mod manager;
pub mod route;

pub use bucket::{Bucket, BucketState, BucketTicket, BucketTurn};
pub use classifier::{
    is_invalid_status, RateLimitHeaders, ResponseClassifier, StandardClassifier, Verdict,
};
pub use events::{spawn_event_logger, DispatchEvent, EVENT_CHANNEL_CAPACITY};
pub use global::GlobalBlock;
pub use invalid::{InvalidRequestCounter, InvalidTally};
pub use manager::{BucketManager, BucketSnapshot, DispatchStats};
