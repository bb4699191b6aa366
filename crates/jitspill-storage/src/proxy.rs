//! Narrow interface between proxies and the tier bookkeeping
//!
//! A proxy stands in for a buffer that is either live on the device,
//! serialized into host frames, or spilled to a file. The tier manager only
//! ever sees proxies through the [`Proxy`] trait and holds them weakly.

use bytes::Bytes;
use jitspill_core::{BufferId, CoreResult, ProxyId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::spill::{Codec, DiskHeader};
use crate::tiering_manager::ProxyManager;

/// Shared handle to a proxy.
pub type ProxyRef = Arc<dyn Proxy>;

/// Serializer families a proxy may be demoted into when leaving the device.
pub const HOST_SERIALIZERS: [SerializerTag; 2] = [SerializerTag::Dask, SerializerTag::Pickle];

/// Memory tier a proxy currently occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Accelerator memory
    Device,
    /// Process memory
    Host,
    /// Spill files
    Disk,
}

impl Tier {
    /// All tiers, slowest first.
    pub const ALL: [Tier; 3] = [Tier::Disk, Tier::Host, Tier::Device];

    /// Tier that matches a proxy's serializer.
    ///
    /// Live proxies (no serializer) and device-native serializers map to the device.
    #[must_use]
    pub fn from_serializer(serializer: Option<SerializerTag>) -> Self {
        match serializer {
            Some(SerializerTag::Disk) => Tier::Disk,
            Some(SerializerTag::Dask | SerializerTag::Pickle) => Tier::Host,
            Some(SerializerTag::Cuda) | None => Tier::Device,
        }
    }

    /// Get string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Device => "dev",
            Self::Host => "host",
            Self::Disk => "disk",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Serialization family that currently holds a proxy's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerTag {
    /// Device-native serialization (data stays in device memory)
    Cuda,
    /// Host frames produced by the default serializer
    Dask,
    /// Host frames produced by the fallback serializer
    Pickle,
    /// Frames written to a spill file
    Disk,
}

impl SerializerTag {
    /// Whether this family keeps data in host memory.
    #[must_use]
    pub fn is_host(&self) -> bool {
        matches!(self, Self::Dask | Self::Pickle)
    }
}

/// A device allocation referenced by a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    /// Stable identity of the allocation
    pub id: BufferId,
    /// Size of the allocation in bytes
    pub size: u64,
}

impl DeviceBuffer {
    pub fn new(id: impl Into<BufferId>, size: u64) -> Self {
        Self {
            id: id.into(),
            size,
        }
    }
}

/// Header describing a list of serialized frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHeader {
    /// Family that produced the frames
    pub serializer: SerializerTag,
    /// Size of the object once deserialized
    pub nbytes: u64,
    /// Per-frame compression, `None` for raw frames
    #[serde(default)]
    pub compression: Vec<Option<Codec>>,
    /// Number of frames
    pub count: usize,
}

impl FrameHeader {
    /// Header for uncompressed frames.
    #[must_use]
    pub fn new(serializer: SerializerTag, nbytes: u64, frames: &[Bytes]) -> Self {
        Self {
            serializer,
            nbytes,
            compression: vec![None; frames.len()],
            count: frames.len(),
        }
    }
}

/// Serialized form of a proxy's data.
#[derive(Debug, Clone)]
pub enum SerializedPayload {
    /// Frames held in host memory
    Frames {
        header: FrameHeader,
        frames: Vec<Bytes>,
    },
    /// Frames written to a spill file
    Disk(DiskHeader),
}

impl SerializedPayload {
    /// Serializer tag recorded in the header.
    #[must_use]
    pub fn serializer(&self) -> SerializerTag {
        match self {
            Self::Frames { header, .. } => header.serializer,
            Self::Disk(header) => header.serializer,
        }
    }

    /// Size of the object once deserialized.
    #[must_use]
    pub fn nbytes(&self) -> u64 {
        match self {
            Self::Frames { header, .. } => header.nbytes,
            Self::Disk(header) => header.disk_sub_header.nbytes,
        }
    }

    /// Bytes this payload occupies where it currently lives.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        match self {
            Self::Frames { frames, .. } => frames.iter().map(|f| f.len() as u64).sum(),
            Self::Disk(header) => header.size,
        }
    }
}

/// Capabilities the tier manager needs from a proxy.
pub trait Proxy: Send + Sync {
    /// Serializer currently holding the data, `None` while the object is live.
    fn serializer(&self) -> Option<SerializerTag>;

    /// Device allocations the proxy depends on. Empty once demoted off the device.
    fn device_buffers(&self) -> Vec<DeviceBuffer>;

    /// Host-side size of the proxy in its current form.
    fn size_of(&self) -> u64;

    /// Monotonic time of the most recent access.
    fn last_access(&self) -> Instant;

    fn set_last_access(&self, at: Instant);

    /// Point the proxy at the manager that tracks it.
    fn attach_manager(&self, manager: Weak<ProxyManager>);

    /// Re-serialize into the first supported family of `serializers`.
    ///
    /// A no-op when the proxy is already held by one of them.
    fn serialize(&self, serializers: &[SerializerTag]) -> CoreResult<()>;

    /// Snapshot of the serialized payload, `None` while live.
    fn serialized(&self) -> Option<SerializedPayload> {
        self.serialized_versioned().map(|(_, payload)| payload)
    }

    /// Snapshot of the serialized payload together with its version.
    ///
    /// The version changes every time the payload is replaced.
    fn serialized_versioned(&self) -> Option<(u64, SerializedPayload)>;

    /// Install `payload` if the payload is still at `version`.
    ///
    /// Returns `false`, leaving the proxy untouched, if another thread
    /// replaced the payload in the meantime.
    fn replace_serialized(&self, version: u64, payload: SerializedPayload) -> bool;

    /// Explicit proxies are handed out as-is even in compatibility mode.
    fn is_explicit(&self) -> bool {
        false
    }

    fn describe(&self) -> String {
        match self.serializer() {
            Some(tag) => format!("<Proxy serializer={:?} size={}>", tag, self.size_of()),
            None => format!("<Proxy live size={}>", self.size_of()),
        }
    }
}

/// Identity of a proxy handle.
#[must_use]
pub fn proxy_id(proxy: &ProxyRef) -> ProxyId {
    ProxyId::from_ptr(Arc::as_ptr(proxy))
}

/// Walks caller values to find and wrap device objects.
pub trait Proxify<V>: Send + Sync {
    /// Memo of objects already wrapped during one walk.
    type Seen: Default;

    /// Wrap eligible leaves of `value` in proxies.
    ///
    /// Every proxy found in the result, new or pre-existing, is appended to
    /// `found`. Objects seen twice must map to the same proxy via `seen`.
    fn proxify(&self, value: V, seen: &mut Self::Seen, found: &mut Vec<ProxyRef>)
        -> CoreResult<V>;

    /// Replace proxies in `value` by the objects they wrap.
    fn unproxify(&self, value: V, skip_explicit: bool) -> CoreResult<V>;

    /// Proxies referenced by `value`.
    fn proxies(&self, value: &V) -> Vec<ProxyRef>;
}
