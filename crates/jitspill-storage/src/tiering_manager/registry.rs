use jitspill_core::{BufferId, CoreError, CoreResult, ProxyId};
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use crate::proxy::{proxy_id, Proxy, ProxyRef, Tier};

/// Strategy for turning tracked proxies into a byte tally.
trait UsageAccounting: Send {
    /// Account for a newly tracked proxy, returning the bytes added to the tally.
    fn on_add(&mut self, id: ProxyId, proxy: &dyn Proxy) -> u64;

    /// Forget a proxy, returning the bytes removed from the tally.
    fn on_remove(&mut self, id: ProxyId) -> u64;

    fn clear(&mut self);
}

/// Host and disk accounting: every proxy counts its own size.
///
/// The size is recorded at insertion so removal subtracts exactly what was added.
#[derive(Default)]
struct PerProxyAccounting {
    sizes: HashMap<ProxyId, u64>,
}

impl UsageAccounting for PerProxyAccounting {
    fn on_add(&mut self, id: ProxyId, proxy: &dyn Proxy) -> u64 {
        let size = proxy.size_of();
        self.sizes.insert(id, size);
        size
    }

    fn on_remove(&mut self, id: ProxyId) -> u64 {
        self.sizes.remove(&id).unwrap_or(0)
    }

    fn clear(&mut self) {
        self.sizes.clear();
    }
}

#[derive(Debug)]
struct BufferRefs {
    size: u64,
    proxies: HashSet<ProxyId>,
}

/// Device accounting: proxies may alias the same allocation.
///
/// An allocation is counted when its first proxy arrives and released when
/// its last proxy leaves.
#[derive(Default)]
struct AliasedAccounting {
    proxy_to_buffers: HashMap<ProxyId, HashSet<BufferId>>,
    buffer_to_proxies: HashMap<BufferId, BufferRefs>,
}

impl UsageAccounting for AliasedAccounting {
    fn on_add(&mut self, id: ProxyId, proxy: &dyn Proxy) -> u64 {
        let mut added = 0;
        let buffers = self.proxy_to_buffers.entry(id).or_default();

        for buffer in proxy.device_buffers() {
            if !buffers.insert(buffer.id) {
                continue;
            }
            let refs = self
                .buffer_to_proxies
                .entry(buffer.id)
                .or_insert_with(|| BufferRefs {
                    size: buffer.size,
                    proxies: HashSet::new(),
                });
            if refs.proxies.is_empty() {
                added += refs.size;
            }
            refs.proxies.insert(id);
        }
        added
    }

    fn on_remove(&mut self, id: ProxyId) -> u64 {
        let mut removed = 0;
        for buffer in self.proxy_to_buffers.remove(&id).unwrap_or_default() {
            if let Entry::Occupied(mut entry) = self.buffer_to_proxies.entry(buffer) {
                entry.get_mut().proxies.remove(&id);
                if entry.get().proxies.is_empty() {
                    removed += entry.remove().size;
                }
            }
        }
        removed
    }

    fn clear(&mut self) {
        self.proxy_to_buffers.clear();
        self.buffer_to_proxies.clear();
    }
}

struct RegistryInner {
    proxies: HashMap<ProxyId, Weak<dyn Proxy>>,
    usage: u64,
    accounting: Box<dyn UsageAccounting>,
}

impl RegistryInner {
    fn forget(&mut self, id: ProxyId) -> bool {
        if self.proxies.remove(&id).is_none() {
            return false;
        }
        let released = self.accounting.on_remove(id);
        self.usage = self.usage.saturating_sub(released);
        true
    }
}

/// Proxies resident in one tier and their aggregate memory usage.
///
/// Holds weak references only; a proxy that is dropped without being removed
/// stays counted until [`TierRegistry::prune`] notices.
pub struct TierRegistry {
    tier: Tier,
    inner: Mutex<RegistryInner>,
}

impl TierRegistry {
    /// Create an empty registry, alias-aware for the device tier.
    pub fn new(tier: Tier) -> Self {
        let accounting: Box<dyn UsageAccounting> = match tier {
            Tier::Device => Box::<AliasedAccounting>::default(),
            Tier::Host | Tier::Disk => Box::<PerProxyAccounting>::default(),
        };

        Self {
            tier,
            inner: Mutex::new(RegistryInner {
                proxies: HashMap::new(),
                usage: 0,
                accounting,
            }),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    /// Start tracking `proxy`.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the proxy is already tracked here.
    pub fn add(&self, proxy: &ProxyRef) -> CoreResult<()> {
        let id = proxy_id(proxy);
        let mut inner = self.inner.lock();

        if inner.proxies.contains_key(&id) {
            return Err(CoreError::already_exists("proxy", id.to_string()));
        }
        inner.proxies.insert(id, Arc::downgrade(proxy));
        let added = inner.accounting.on_add(id, proxy.as_ref());
        inner.usage += added;

        tracing::debug!(tier = %self.tier, proxy = %id, added, usage = inner.usage, "Tracking proxy");
        Ok(())
    }

    /// Stop tracking the proxy with identity `id`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the proxy is not tracked here.
    pub fn remove(&self, id: ProxyId) -> CoreResult<()> {
        let mut inner = self.inner.lock();

        if !inner.forget(id) {
            return Err(CoreError::not_found("proxy", id.to_string()));
        }
        tracing::debug!(tier = %self.tier, proxy = %id, usage = inner.usage, "Untracked proxy");

        self.reset_if_empty(&mut inner);
        Ok(())
    }

    /// All proxies that are still alive.
    pub fn proxies(&self) -> Vec<ProxyRef> {
        let inner = self.inner.lock();
        inner.proxies.values().filter_map(Weak::upgrade).collect()
    }

    /// Number of tracked identities, including dead ones not yet pruned.
    pub fn len(&self) -> usize {
        self.inner.lock().proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().proxies.is_empty()
    }

    /// Current byte tally.
    pub fn usage(&self) -> u64 {
        self.inner.lock().usage
    }

    pub fn contains(&self, id: ProxyId) -> bool {
        self.inner.lock().proxies.contains_key(&id)
    }

    /// Drop entries whose proxy no longer exists. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut inner = self.inner.lock();

        let dead: Vec<ProxyId> = inner
            .proxies
            .iter()
            .filter(|(_, weak)| weak.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            inner.forget(*id);
        }

        if !dead.is_empty() {
            tracing::warn!(tier = %self.tier, pruned = dead.len(), "Pruned dead proxies");
            self.reset_if_empty(&mut inner);
        }
        dead.len()
    }

    /// Tracked identities paired with the proxy they resolve to, if any.
    pub(crate) fn entries(&self) -> Vec<(ProxyId, Option<ProxyRef>)> {
        let inner = self.inner.lock();
        inner
            .proxies
            .iter()
            .map(|(id, weak)| (*id, weak.upgrade()))
            .collect()
    }

    fn reset_if_empty(&self, inner: &mut RegistryInner) {
        if inner.proxies.is_empty() {
            if inner.usage != 0 {
                tracing::warn!(
                    tier = %self.tier,
                    usage = inner.usage,
                    "Registry is empty but its tally is non-zero, resetting the tally"
                );
                inner.usage = 0;
            }
            inner.accounting.clear();
        }
    }
}

impl std::fmt::Debug for TierRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TierRegistry")
            .field("tier", &self.tier)
            .field("proxies", &inner.proxies.len())
            .field("usage", &inner.usage)
            .finish()
    }
}
