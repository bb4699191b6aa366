use jitspill_core::ProxyId;
use std::collections::HashSet;
use std::time::Instant;

use crate::proxy::{proxy_id, ProxyRef};

/// One evictable unit of a tier: a device buffer or a host proxy.
#[derive(Clone)]
pub struct AccessInfo {
    /// Most recent access among `proxies`
    pub last_access: Instant,
    /// Bytes released by evicting the whole unit
    pub size: u64,
    /// Proxies that must all be demoted to release `size`
    pub proxies: Vec<ProxyRef>,
}

impl std::fmt::Debug for AccessInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessInfo")
            .field("last_access", &self.last_access)
            .field("size", &self.size)
            .field("proxies", &self.proxies.len())
            .finish()
    }
}

/// Victims chosen by [`select_victims`].
#[derive(Default)]
pub struct EvictionPlan {
    /// Sum of the sizes of the selected units. May exceed the bytes actually
    /// released when units share proxies.
    pub freed: u64,
    /// Proxies to demote, each listed once, coldest first
    pub victims: Vec<ProxyRef>,
}

/// Choose the least recently used units until at least `nbytes` are covered.
///
/// Units are ordered by access time; among equally cold units the larger one
/// goes first. Stops early once `nbytes` is reached, otherwise takes everything.
pub fn select_victims(mut access: Vec<AccessInfo>, nbytes: u64) -> EvictionPlan {
    access.sort_by(|a, b| {
        a.last_access
            .cmp(&b.last_access)
            .then_with(|| b.size.cmp(&a.size))
    });

    let mut freed = 0u64;
    let mut selected: Vec<ProxyRef> = Vec::new();
    for unit in access {
        selected.extend(unit.proxies);
        freed += unit.size;
        if freed >= nbytes {
            break;
        }
    }

    let mut seen: HashSet<ProxyId> = HashSet::with_capacity(selected.len());
    let victims = selected
        .into_iter()
        .filter(|p| seen.insert(proxy_id(p)))
        .collect();

    EvictionPlan { freed, victims }
}
