//! Device/Host/Disk tier accounting and eviction
//!
//! Every proxy lives in exactly one tier, decided by how its data is currently
//! held:
//! - **Device**: live objects in accelerator memory
//! - **Host**: objects serialized into frames in process memory
//! - **Disk**: frames written to spill files
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       ProxifyHostFile                           │
//! │   insert() → ProxyManager::proxify(value)                       │
//! │                        ↓                                        │
//! │                  ProxyManager (re-entrant lock)                 │
//! │                        ↓                                        │
//! │     ┌──────────────────┼──────────────────┐                     │
//! │     │                  │                  │                     │
//! │  Device tier        Host tier          Disk tier                │
//! │  (alias-aware       (per-proxy         (per-proxy               │
//! │   buffer tally)      tally)             tally)                  │
//! │     │                  │                  │                     │
//! │     └─── evict ───────►└─── evict ───────►┘                     │
//! │   over device limit    over host limit                          │
//! │   → host frames        → spill file                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Victims are chosen least recently used first. Device eviction works on
//! whole buffers, so every proxy aliasing a buffer is demoted together.

mod manager;
mod policy;
mod registry;

pub use manager::ProxyManager;
pub use policy::{select_victims, AccessInfo, EvictionPlan};
pub use registry::TierRegistry;
