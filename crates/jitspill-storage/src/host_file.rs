//! Key-value store whose values are proxified on insert
//!
//! [`ProxifyHostFile`] is the outer surface of the crate. Every value stored
//! is walked by a [`Proxify`] implementation; device objects found in it are
//! wrapped in proxies and tracked by a [`ProxyManager`], which spills them to
//! host memory and disk as the configured limits are exceeded.

use jitspill_core::{CoreResult, SpillConfig};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use crate::proxy::{Proxify, Tier};
use crate::spill::SpillDirectory;
use crate::tiering_manager::ProxyManager;

/// Called by the allocator with the size of an allocation that failed.
///
/// Returns `true` if memory was freed and the allocation should be retried.
pub type OomCallback = Box<dyn Fn(u64) -> bool + Send + Sync>;

/// Device allocator that accepts an out-of-memory callback.
pub trait AllocatorHook: Send + Sync {
    /// Install `callback`. Returns `false` if the allocator cannot take one.
    fn set_oom_callback(&self, callback: OomCallback) -> bool;
}

/// Store of proxified values with just-in-time spilling.
pub struct ProxifyHostFile<K, V, P> {
    store: Mutex<HashMap<K, V>>,
    manager: Arc<ProxyManager>,
    discover: P,
    compatibility_mode: bool,
    spill_on_demand: bool,
    allocator: Option<Arc<dyn AllocatorHook>>,
    oom_installed: OnceCell<bool>,
}

impl<K, V, P> ProxifyHostFile<K, V, P>
where
    K: Eq + Hash + Clone,
    V: Clone,
    P: Proxify<V>,
{
    /// Create a store using the process-wide spill directory derived from
    /// `config`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigConflict` if another spill directory was already
    /// registered, or a validation error for zero limits.
    pub fn new(config: &SpillConfig, discover: P) -> CoreResult<Self> {
        config.validate()?;
        let spill = SpillDirectory::register(config.spill_directory()?, config.shared_filesystem)?;
        spill.set_compression(config.compression);
        Ok(Self::with_spill_directory(config, spill, discover))
    }

    /// Create a store that spills into `spill` instead of the process-wide
    /// directory.
    pub fn with_spill_directory(
        config: &SpillConfig,
        spill: Arc<SpillDirectory>,
        discover: P,
    ) -> Self {
        tracing::info!(
            device_memory_limit = config.device_memory_limit,
            memory_limit = config.memory_limit,
            spill_directory = %spill.root().display(),
            compatibility_mode = config.compatibility_mode,
            "Created proxify host file"
        );

        Self {
            store: Mutex::new(HashMap::new()),
            manager: ProxyManager::new(config.device_memory_limit, config.memory_limit, spill),
            discover,
            compatibility_mode: config.compatibility_mode,
            spill_on_demand: config.spill_on_demand,
            allocator: None,
            oom_installed: OnceCell::new(),
        }
    }

    /// Allocator that the spill-on-demand callback is installed into.
    pub fn with_allocator_hook(mut self, hook: Arc<dyn AllocatorHook>) -> Self {
        self.allocator = Some(hook);
        self
    }

    pub fn manager(&self) -> &Arc<ProxyManager> {
        &self.manager
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.store.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.store.lock().keys().cloned().collect()
    }

    /// Proxify `value` and store it under `key`.
    ///
    /// A value previously stored under `key` is dropped. Its proxies untrack
    /// themselves once no other key or caller holds them. Eviction errors
    /// raised while tracking the new value are returned and leave the key
    /// unset.
    pub fn insert(&self, key: K, value: V) -> CoreResult<()> {
        self.initialize_spill_on_demand_once();

        let mut store = self.store.lock();
        store.remove(&key);

        let value = self.manager.proxify(&self.discover, value)?;
        store.insert(key, value);
        Ok(())
    }

    /// Value stored under `key`.
    ///
    /// In compatibility mode proxies are unwrapped first, except explicit
    /// ones, and eviction runs again since unwrapping may un-spill data.
    pub fn get(&self, key: &K) -> CoreResult<Option<V>> {
        let value = match self.store.lock().get(key) {
            Some(value) => value.clone(),
            None => return Ok(None),
        };
        if !self.compatibility_mode {
            return Ok(Some(value));
        }

        let value = self.discover.unproxify(value, true)?;
        self.manager.maybe_evict(0)?;
        Ok(Some(value))
    }

    /// Remove `key` from the store.
    ///
    /// Proxies are not untracked here: they may still be referenced from
    /// elsewhere, and a proxy untracks itself once its last handle is dropped.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.store.lock().remove(key)
    }

    /// Spill 1% of the host limit to disk.
    ///
    /// Meant to be called repeatedly by a worker under host memory pressure.
    /// Returns `None` if nothing could be spilled.
    pub fn evict_host_fraction(&self) -> CoreResult<Option<u64>> {
        if self.manager.registry(Tier::Host).is_empty() {
            return Ok(None);
        }

        let nbytes = (self.manager.host_memory_limit() / 100).max(1);
        let freed = self.manager.evict(
            nbytes,
            || self.manager.access_snapshot(Tier::Host),
            |p| self.manager.demote_to_disk(p),
        )?;
        self.manager.maybe_evict(0)?;

        Ok((freed > 0).then_some(freed))
    }

    /// Whether the spill-on-demand callback was handed to the allocator.
    pub fn spill_on_demand_installed(&self) -> bool {
        self.oom_installed.get().copied().unwrap_or(false)
    }

    /// Install the out-of-memory callback into the allocator hook, at most once.
    ///
    /// A no-op when spill-on-demand is disabled or no hook was given.
    pub fn initialize_spill_on_demand_once(&self) {
        if !self.spill_on_demand {
            return;
        }
        self.oom_installed.get_or_init(|| {
            let Some(hook) = &self.allocator else {
                tracing::debug!("No allocator hook, spill-on-demand disabled");
                return false;
            };

            let installed = hook.set_oom_callback(oom_callback(Arc::downgrade(&self.manager)));
            if installed {
                tracing::info!("Installed spill-on-demand callback");
            } else {
                tracing::warn!("Allocator rejected the spill-on-demand callback");
            }
            installed
        });
    }
}

/// Spill device memory for an allocation of `nbytes` that failed.
fn oom_callback(manager: Weak<ProxyManager>) -> OomCallback {
    Box::new(move |nbytes| {
        let Some(manager) = manager.upgrade() else {
            return false;
        };

        let freed = manager.evict(
            nbytes,
            || manager.access_snapshot(Tier::Device),
            |p| manager.demote_to_host(p),
        );
        match freed {
            Ok(freed) if freed > 0 => true,
            Ok(_) => {
                tracing::warn!(
                    nbytes,
                    "Allocation failed and spill-on-demand found no device memory to spill"
                );
                false
            }
            Err(e) => {
                tracing::warn!(nbytes, error = %e, "Spill-on-demand failed");
                false
            }
        }
    })
}

impl<K, V, P> std::fmt::Debug for ProxifyHostFile<K, V, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxifyHostFile")
            .field("manager", &self.manager)
            .field("compatibility_mode", &self.compatibility_mode)
            .field("spill_on_demand", &self.spill_on_demand)
            .finish_non_exhaustive()
    }
}
