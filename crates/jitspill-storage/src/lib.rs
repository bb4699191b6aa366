//! Tiered device/host/disk memory accounting with just-in-time spilling.
//!
//! Values stored in a [`ProxifyHostFile`] have their device objects wrapped
//! in proxies. A [`ProxyManager`] tracks which tier each proxy occupies and
//! demotes the least recently used ones when a tier goes over its limit.

pub mod compression;
pub mod error;
pub mod host_file;
pub mod proxy;
pub mod proxy_object;
pub mod spill;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod tiering_manager;

pub use error::{Error, Result};
pub use host_file::{AllocatorHook, OomCallback, ProxifyHostFile};
pub use proxy::{
    proxy_id, DeviceBuffer, FrameHeader, Proxify, Proxy, ProxyRef, SerializedPayload,
    SerializerTag, Tier, HOST_SERIALIZERS,
};
pub use proxy_object::{DeviceObject, ProxyObject};
pub use spill::{Codec, DiskHeader, SpillDirectory};
pub use tiering_manager::{AccessInfo, EvictionPlan, ProxyManager, TierRegistry};
