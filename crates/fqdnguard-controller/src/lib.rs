//! HTTPProxy controllers
//!
//! Keeps the reservation cache in line with what the API server has
//! persisted, maintains the cache-cleanup finalizer, and seeds the cache at
//! startup.

#![deny(missing_docs)]

pub mod bootstrap;
pub mod cache_sync;
pub mod events;
pub mod finalizer;
pub mod runner;
pub mod store;

pub use bootstrap::seed_cache;
pub use cache_sync::CacheSync;
pub use events::{EventTranslator, ProxyEvent};
pub use finalizer::{error_policy, reconcile, Context};
pub use runner::{build_cache_sync, build_finalizer_controller, ControllerFuture};
pub use store::{KubeProxyStore, ProxyStore};
