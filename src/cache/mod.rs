//! Redis cache layer.
//!
//! Key formats, value codec, store operations, change events, and the
//! descriptor-driven refresh orchestrator.

pub mod codec;
pub mod events;
pub mod keys;
pub mod refresh;
pub mod store;

pub use events::{ChangeEvent, EventKind, EventQueue};
pub use refresh::{CacheRefresher, RefreshConfig, RefreshDescriptor, RefreshStrategy};
pub use store::{BatchOutcome, CacheError, LockOutcome, RedisStore};
