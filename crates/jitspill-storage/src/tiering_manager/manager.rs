use jitspill_core::{BufferId, CoreError, CoreResult, ProxyId};
use parking_lot::ReentrantMutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::policy::{select_victims, AccessInfo};
use super::TierRegistry;
use crate::proxy::{
    proxy_id, Proxify, ProxyRef, SerializedPayload, SerializerTag, Tier, HOST_SERIALIZERS,
};
use crate::spill::SpillDirectory;

/// Tracks every known proxy and the memory usage of each tier.
///
/// Proxies are held weakly and report their own location; the manager keeps
/// the tallies so usage never has to be recomputed from scratch. When a tier
/// goes over its limit the least recently used proxies are demoted:
/// - Device → Host: serialized into host frames
/// - Host → Disk: frames written to a spill file
///
/// # Example
///
/// ```no_run
/// use jitspill_storage::proxy_object::ProxyObject;
/// use jitspill_storage::spill::SpillDirectory;
/// use jitspill_storage::testing::TestArray;
/// use jitspill_storage::tiering_manager::ProxyManager;
/// use jitspill_storage::{Proxy, ProxyRef, Tier};
///
/// # fn example() -> jitspill_core::CoreResult<()> {
/// let spill = SpillDirectory::new("/tmp/spill", false)?;
/// let manager = ProxyManager::new(100, 1000, spill);
///
/// let proxy: ProxyRef = ProxyObject::new(TestArray::new(1, 40));
/// manager.add(&proxy, proxy.serializer())?;
/// assert_eq!(manager.usage(Tier::Device), 40);
/// # Ok(())
/// # }
/// ```
pub struct ProxyManager {
    lock: ReentrantMutex<()>,
    disk: TierRegistry,
    host: TierRegistry,
    dev: TierRegistry,
    device_memory_limit: u64,
    host_memory_limit: u64,
    spill: Arc<SpillDirectory>,
    me: Weak<ProxyManager>,
}

impl ProxyManager {
    /// Create a manager with fixed device and host limits (bytes).
    pub fn new(
        device_memory_limit: u64,
        memory_limit: u64,
        spill: Arc<SpillDirectory>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            lock: ReentrantMutex::new(()),
            disk: TierRegistry::new(Tier::Disk),
            host: TierRegistry::new(Tier::Host),
            dev: TierRegistry::new(Tier::Device),
            device_memory_limit,
            host_memory_limit: memory_limit,
            spill,
            me: me.clone(),
        })
    }

    pub fn device_memory_limit(&self) -> u64 {
        self.device_memory_limit
    }

    pub fn host_memory_limit(&self) -> u64 {
        self.host_memory_limit
    }

    pub fn spill_directory(&self) -> &Arc<SpillDirectory> {
        &self.spill
    }

    /// Registry backing `tier`.
    pub fn registry(&self, tier: Tier) -> &TierRegistry {
        match tier {
            Tier::Device => &self.dev,
            Tier::Host => &self.host,
            Tier::Disk => &self.disk,
        }
    }

    /// Byte tally of `tier`.
    pub fn usage(&self, tier: Tier) -> u64 {
        self.registry(tier).usage()
    }

    /// Number of tracked proxies across all tiers.
    pub fn len(&self) -> usize {
        let _guard = self.lock.lock();
        self.disk.len() + self.host.len() + self.dev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tier that currently tracks `id`.
    ///
    /// # Panics
    ///
    /// Panics if the proxy is tracked by more than one tier.
    pub fn locate(&self, id: ProxyId) -> Option<Tier> {
        let _guard = self.lock.lock();
        let mut found = None;
        for tier in Tier::ALL {
            if self.registry(tier).contains(id) {
                assert!(
                    found.is_none(),
                    "proxy {} tracked in both {:?} and {:?}",
                    id,
                    found,
                    tier
                );
                found = Some(tier);
            }
        }
        found
    }

    pub fn contains(&self, id: ProxyId) -> bool {
        self.locate(id).is_some()
    }

    /// Track `proxy` in the tier matching `serializer`, moving it if it is
    /// tracked elsewhere. A no-op if it is already in that tier.
    pub fn add(&self, proxy: &ProxyRef, serializer: Option<SerializerTag>) -> CoreResult<()> {
        self.add_to_tier(proxy, Tier::from_serializer(serializer))
    }

    /// Track `proxy` in `target`, moving it if it is tracked elsewhere.
    pub fn add_to_tier(&self, proxy: &ProxyRef, target: Tier) -> CoreResult<()> {
        let _guard = self.lock.lock();
        let id = proxy_id(proxy);

        match self.locate(id) {
            Some(current) if current == target => Ok(()),
            Some(current) => {
                self.registry(current).remove(id)?;
                self.registry(target).add(proxy)?;
                tracing::debug!(proxy = %id, from = %current, to = %target, "Moved proxy");
                Ok(())
            }
            None => self.registry(target).add(proxy),
        }
    }

    /// Stop tracking `proxy`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no tier tracks the proxy.
    pub fn remove(&self, proxy: &ProxyRef) -> CoreResult<()> {
        self.remove_id(proxy_id(proxy))
    }

    /// Stop tracking the proxy with identity `id`.
    pub fn remove_id(&self, id: ProxyId) -> CoreResult<()> {
        let _guard = self.lock.lock();
        match self.locate(id) {
            Some(tier) => self.registry(tier).remove(id),
            None => Err(CoreError::not_found("proxy", id.to_string())),
        }
    }

    /// Untrack `id` if any tier tracks it.
    pub(crate) fn forget(&self, id: ProxyId) {
        let _guard = self.lock.lock();
        if let Some(tier) = self.locate(id) {
            // Cannot fail: the registry was just seen to contain `id`.
            let _ = self.registry(tier).remove(id);
        }
    }

    /// Wrap the device objects in `value` and start tracking the new proxies,
    /// then evict if any tier went over its limit.
    pub fn proxify<V, P>(&self, discover: &P, value: V) -> CoreResult<V>
    where
        P: Proxify<V> + ?Sized,
    {
        let ret = {
            let _guard = self.lock.lock();
            let mut seen = P::Seen::default();
            let mut found: Vec<ProxyRef> = Vec::new();
            let ret = discover.proxify(value, &mut seen, &mut found)?;

            let last_access = Instant::now();
            for proxy in &found {
                proxy.set_last_access(last_access);
                if !self.contains(proxy_id(proxy)) {
                    proxy.attach_manager(self.me.clone());
                    self.add(proxy, proxy.serializer())?;
                }
            }
            ret
        };

        self.maybe_evict(0)?;
        Ok(ret)
    }

    /// Evictable units of `tier`.
    ///
    /// Device units are whole buffers: a buffer is as recent as its most
    /// recently used alias. Host and disk units are single proxies.
    pub fn access_snapshot(&self, tier: Tier) -> Vec<AccessInfo> {
        match tier {
            Tier::Device => self.dev_access_info(),
            Tier::Host | Tier::Disk => self.per_proxy_access_info(tier),
        }
    }

    fn dev_access_info(&self) -> Vec<AccessInfo> {
        let _guard = self.lock.lock();

        let mut buffer_to_proxies: BTreeMap<BufferId, (u64, Vec<ProxyRef>)> = BTreeMap::new();
        for proxy in self.dev.proxies() {
            for buffer in proxy.device_buffers() {
                buffer_to_proxies
                    .entry(buffer.id)
                    .or_insert_with(|| (buffer.size, Vec::new()))
                    .1
                    .push(Arc::clone(&proxy));
            }
        }

        buffer_to_proxies
            .into_values()
            .filter_map(|(size, proxies)| {
                let last_access = proxies.iter().map(|p| p.last_access()).max()?;
                Some(AccessInfo {
                    last_access,
                    size,
                    proxies,
                })
            })
            .collect()
    }

    fn per_proxy_access_info(&self, tier: Tier) -> Vec<AccessInfo> {
        let _guard = self.lock.lock();
        self.registry(tier)
            .proxies()
            .into_iter()
            .map(|proxy| AccessInfo {
                last_access: proxy.last_access(),
                size: proxy.size_of(),
                proxies: vec![proxy],
            })
            .collect()
    }

    /// Demote the least recently used units returned by `access` until at
    /// least `nbytes` are freed or nothing is left.
    ///
    /// Selection happens under the manager lock; `demote` runs outside it.
    /// Returns the estimated number of bytes freed.
    pub fn evict<A, D>(&self, nbytes: u64, access: A, mut demote: D) -> CoreResult<u64>
    where
        A: FnOnce() -> Vec<AccessInfo>,
        D: FnMut(&ProxyRef) -> CoreResult<()>,
    {
        let plan = {
            let _guard = self.lock.lock();
            select_victims(access(), nbytes)
        };

        tracing::debug!(
            requested = nbytes,
            freed = plan.freed,
            victims = plan.victims.len(),
            "Eviction planned"
        );

        for proxy in &plan.victims {
            demote(proxy)?;
        }
        Ok(plan.freed)
    }

    /// Serialize a device proxy into host frames and move it to the host tier.
    pub fn demote_to_host(&self, proxy: &ProxyRef) -> CoreResult<()> {
        proxy.serialize(&HOST_SERIALIZERS)?;
        self.add(proxy, proxy.serializer())
    }

    /// Write a proxy to a spill file and move it to the disk tier.
    ///
    /// Frames that are already host-serialized are written as they are,
    /// without a round trip through the live object. If another thread
    /// replaces the payload while the file is written, the file is deleted
    /// and the other thread's result stands.
    pub fn demote_to_disk(&self, proxy: &ProxyRef) -> CoreResult<()> {
        let (version, header, frames, fresh) = match proxy.serialized_versioned() {
            Some((version, SerializedPayload::Frames { header, frames }))
                if header.serializer.is_host() =>
            {
                (version, header, frames, false)
            }
            Some((_, SerializedPayload::Disk(_))) => {
                return self.add_to_tier(proxy, Tier::Disk);
            }
            _ => {
                proxy.serialize(&HOST_SERIALIZERS)?;
                match proxy.serialized_versioned() {
                    Some((version, SerializedPayload::Frames { header, frames })) => {
                        (version, header, frames, true)
                    }
                    _ => {
                        return Err(CoreError::invalid_state(format!(
                            "proxy {} did not serialize into host frames",
                            proxy_id(proxy)
                        )))
                    }
                }
            }
        };

        let disk = self.spill.dump(header, &frames, fresh)?;
        let path = disk.path.clone();
        if !proxy.replace_serialized(version, SerializedPayload::Disk(disk)) {
            tracing::debug!(
                proxy = %proxy_id(proxy),
                path = %path.display(),
                "Payload changed during spill, discarding spill file"
            );
            std::fs::remove_file(&path)?;
            return Ok(());
        }
        self.add(proxy, Some(SerializerTag::Disk))
    }

    /// Evict from the device until its usage plus `extra_dev_mem` fits the
    /// device limit. Returns the estimated bytes freed.
    pub fn maybe_evict_from_device(&self, extra_dev_mem: u64) -> CoreResult<u64> {
        let over = self
            .dev
            .usage()
            .saturating_add(extra_dev_mem)
            .saturating_sub(self.device_memory_limit);
        if over == 0 {
            return Ok(0);
        }

        tracing::info!(
            usage = self.dev.usage(),
            extra = extra_dev_mem,
            limit = self.device_memory_limit,
            "Spilling device → host"
        );
        let freed = self.evict(
            over,
            || self.access_snapshot(Tier::Device),
            |p| self.demote_to_host(p),
        )?;
        if freed < over {
            tracing::debug!(requested = over, freed, "Device tier remains over its limit");
        }
        Ok(freed)
    }

    /// Evict from the host until its usage plus `extra_host_mem` fits the
    /// host limit. Returns the estimated bytes freed.
    pub fn maybe_evict_from_host(&self, extra_host_mem: u64) -> CoreResult<u64> {
        let over = self
            .host
            .usage()
            .saturating_add(extra_host_mem)
            .saturating_sub(self.host_memory_limit);
        if over == 0 {
            return Ok(0);
        }

        tracing::info!(
            usage = self.host.usage(),
            extra = extra_host_mem,
            limit = self.host_memory_limit,
            "Spilling host → disk"
        );
        let freed = self.evict(
            over,
            || self.access_snapshot(Tier::Host),
            |p| self.demote_to_disk(p),
        )?;
        if freed < over {
            tracing::debug!(requested = over, freed, "Host tier remains over its limit");
        }
        Ok(freed)
    }

    /// Device eviction first, since spilling the device can push the host over.
    pub fn maybe_evict(&self, extra_dev_mem: u64) -> CoreResult<()> {
        self.maybe_evict_from_device(extra_dev_mem)?;
        self.maybe_evict_from_host(0)?;
        Ok(())
    }

    /// Drop dead proxies from every tier. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let _guard = self.lock.lock();
        Tier::ALL.iter().map(|t| self.registry(*t).prune()).sum()
    }

    /// Check that every tracked proxy sits in the tier its serializer says.
    ///
    /// Dead proxies are pruned first. Meant for tests and debugging.
    pub fn validate(&self) -> CoreResult<()> {
        let _guard = self.lock.lock();
        self.prune();

        for tier in Tier::ALL {
            for (id, proxy) in self.registry(tier).entries() {
                let proxy = proxy.ok_or_else(|| {
                    CoreError::invalid_state(format!("proxy {} in {} is dead", id, tier))
                })?;
                if proxy_id(&proxy) != id {
                    return Err(CoreError::invalid_state(format!(
                        "proxy {} tracked under identity {}",
                        proxy_id(&proxy),
                        id
                    )));
                }
                // Panics if tracked twice
                self.locate(id);

                let serializer = proxy.serializer();
                if Tier::from_serializer(serializer) != tier {
                    return Err(CoreError::invalid_state(format!(
                        "proxy {} with serializer {:?} tracked in {}",
                        id, serializer, tier
                    )));
                }
                if let Some(payload) = proxy.serialized() {
                    if Some(payload.serializer()) != serializer {
                        return Err(CoreError::invalid_state(format!(
                            "proxy {} header says {:?} but serializer is {:?}",
                            id,
                            payload.serializer(),
                            serializer
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Multi-line listing of every tracked proxy.
    pub fn pprint(&self) -> String {
        let _guard = self.lock.lock();
        let mut ret = format!("{}:", self);
        if self.is_empty() {
            ret.push_str(" Empty");
            return ret;
        }
        for tier in Tier::ALL {
            for proxy in self.registry(tier).proxies() {
                ret.push_str(&format!("\n  {:<4} - {}", tier.as_str(), proxy.describe()));
            }
        }
        ret
    }
}

impl fmt::Display for ProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let _guard = self.lock.lock();
        write!(
            f,
            "<ProxyManager dev_limit={} host_limit={} disk={}({}) host={}({}) dev={}({})>",
            self.device_memory_limit,
            self.host_memory_limit,
            self.disk.usage(),
            self.disk.len(),
            self.host.usage(),
            self.host.len(),
            self.dev.usage(),
            self.dev.len()
        )
    }
}

impl fmt::Debug for ProxyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
