//! Per-branch read-through caches and write locks.
//!
//! # Architecture
//!
//! ```text
//!                 LockRegistry (RefListener)
//!                          │  one per ref, created lazily
//!                          ▼
//!  ┌────────────────────────────────────────────────┐
//!  │ RefCacheManager                                │
//!  │   key locks     reentrant per thread, try-only │
//!  │   branch lock   shared: reads, exclusive: move │
//!  │   entries       key -> Option<StoreInfo>       │
//!  └────────────────────────────────────────────────┘
//!                          │ on miss
//!                          ▼
//!                  extract::lookup_key
//! ```

mod error;
mod info;
mod locks;
mod manager;
mod registry;

pub use error::{CacheError, CacheResult};
pub use info::StoreInfo;
pub use locks::KeyLockGuard;
pub use manager::RefCacheManager;
pub use registry::LockRegistry;
