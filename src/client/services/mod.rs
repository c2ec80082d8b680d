pub mod api;
pub mod cache;
pub mod reactions;
pub mod realtime;
pub mod registry;
pub mod router;
pub mod thread_sync;
pub mod transport;

pub use thread_sync::{FetchOptions, FetchRequest, SyncDeps, ThreadSync, ThreadSyncHandle, ThreadSnapshot};
