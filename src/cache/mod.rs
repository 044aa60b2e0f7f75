//! Partitioned response cache for offline support.
//!
//! This module provides:
//! - An ordered rule table classifying requests into static, API, image and dynamic partitions
//! - Cache-first, stale-while-revalidate and network-first strategies
//! - Partition lifecycle (create and pre-cache on install, drop old versions on activate)
//! - Basic offline mode (serve cached or generated responses when the network is unavailable)

mod classifier;
mod layer;
mod lifecycle;
mod storage;
mod traits;

pub use classifier::{Classifier, PartitionKind};
pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};
