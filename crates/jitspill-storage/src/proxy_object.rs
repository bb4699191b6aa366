//! Proxy that owns a device object and spills it on request
//!
//! The payload is in one of three forms: the live object, host frames, or a
//! spill file. [`ProxyObject::get`] always hands back the live object,
//! un-spilling it first if needed.

use bytes::Bytes;
use jitspill_core::{CoreError, CoreResult, ProxyId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::proxy::{
    DeviceBuffer, FrameHeader, Proxy, ProxyRef, SerializedPayload, SerializerTag,
};
use crate::spill;
use crate::tiering_manager::ProxyManager;

/// An object whose memory lives on the device and that can be turned into
/// host frames and back.
pub trait DeviceObject: Send + Sync + Sized + 'static {
    /// Device allocations backing the object.
    fn device_buffers(&self) -> Vec<DeviceBuffer>;

    /// Size of the object in bytes.
    fn nbytes(&self) -> u64;

    fn to_frames(&self) -> CoreResult<Vec<Bytes>>;

    fn from_frames(frames: Vec<Bytes>) -> CoreResult<Self>;
}

enum Payload<T> {
    Live(Arc<T>),
    Serialized(SerializedPayload),
}

struct ProxyDetail<T> {
    payload: Payload<T>,
    version: u64,
    last_access: Instant,
    manager: Weak<ProxyManager>,
}

impl<T> ProxyDetail<T> {
    fn set_payload(&mut self, payload: Payload<T>) {
        self.payload = payload;
        self.version += 1;
    }
}

/// Stand-in for a device object that may be live, serialized or spilled.
pub struct ProxyObject<T: DeviceObject> {
    me: Weak<ProxyObject<T>>,
    explicit: bool,
    detail: Mutex<ProxyDetail<T>>,
}

impl<T: DeviceObject> ProxyObject<T> {
    /// Wrap a live object.
    pub fn new(obj: T) -> Arc<Self> {
        Self::build(obj, false)
    }

    /// Wrap a live object as an explicit proxy, which compatibility mode
    /// hands out without unwrapping.
    pub fn new_explicit(obj: T) -> Arc<Self> {
        Self::build(obj, true)
    }

    fn build(obj: T, explicit: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            explicit,
            detail: Mutex::new(ProxyDetail {
                payload: Payload::Live(Arc::new(obj)),
                version: 0,
                last_access: Instant::now(),
                manager: Weak::new(),
            }),
        })
    }

    pub fn id(&self) -> ProxyId {
        ProxyId::from_ptr(self as *const Self)
    }

    /// Whether the payload is currently serialized (host frames or disk).
    pub fn is_serialized(&self) -> bool {
        matches!(self.detail.lock().payload, Payload::Serialized(_))
    }

    /// Size of the wrapped object.
    pub fn nbytes(&self) -> u64 {
        match &self.detail.lock().payload {
            Payload::Live(obj) => obj.nbytes(),
            Payload::Serialized(payload) => payload.nbytes(),
        }
    }

    /// The live object, un-spilling it to the device if needed.
    ///
    /// Before un-spilling, the owning manager evicts enough device memory to
    /// make room for the incoming object. Afterwards the proxy is tracked on
    /// the device again.
    pub fn get(&self) -> CoreResult<Arc<T>> {
        let (manager, incoming) = {
            let mut detail = self.detail.lock();
            detail.last_access = Instant::now();
            match &detail.payload {
                Payload::Live(obj) => return Ok(Arc::clone(obj)),
                Payload::Serialized(payload) => (detail.manager.upgrade(), payload.nbytes()),
            }
        };

        if let Some(manager) = &manager {
            manager.maybe_evict(incoming)?;
        }

        let obj = {
            let mut detail = self.detail.lock();
            let obj = match &detail.payload {
                Payload::Live(obj) => Arc::clone(obj),
                Payload::Serialized(SerializedPayload::Frames { frames, .. }) => {
                    Arc::new(T::from_frames(frames.clone())?)
                }
                Payload::Serialized(SerializedPayload::Disk(header)) => {
                    let (_, frames) = spill::load(header)?;
                    Arc::new(T::from_frames(frames)?)
                }
            };
            detail.set_payload(Payload::Live(Arc::clone(&obj)));
            obj
        };

        if let (Some(manager), Some(me)) = (manager, self.me.upgrade()) {
            let me: ProxyRef = me;
            manager.add(&me, None)?;
        }
        tracing::debug!(proxy = %self.id(), "Un-spilled proxy");
        Ok(obj)
    }
}

impl<T: DeviceObject> Proxy for ProxyObject<T> {
    fn serializer(&self) -> Option<SerializerTag> {
        match &self.detail.lock().payload {
            Payload::Live(_) => None,
            Payload::Serialized(payload) => Some(payload.serializer()),
        }
    }

    fn device_buffers(&self) -> Vec<DeviceBuffer> {
        match &self.detail.lock().payload {
            Payload::Live(obj) => obj.device_buffers(),
            Payload::Serialized(_) => Vec::new(),
        }
    }

    fn size_of(&self) -> u64 {
        match &self.detail.lock().payload {
            Payload::Live(obj) => obj.nbytes(),
            Payload::Serialized(payload) => payload.footprint(),
        }
    }

    fn last_access(&self) -> Instant {
        self.detail.lock().last_access
    }

    fn set_last_access(&self, at: Instant) {
        self.detail.lock().last_access = at;
    }

    fn attach_manager(&self, manager: Weak<ProxyManager>) {
        self.detail.lock().manager = manager;
    }

    fn serialize(&self, serializers: &[SerializerTag]) -> CoreResult<()> {
        let target = serializers
            .iter()
            .copied()
            .find(SerializerTag::is_host)
            .ok_or_else(|| {
                CoreError::invalid_state(format!(
                    "no in-memory serializer among {:?}",
                    serializers
                ))
            })?;

        let mut detail = self.detail.lock();
        let payload = match &detail.payload {
            Payload::Serialized(payload) if serializers.contains(&payload.serializer()) => {
                return Ok(());
            }
            Payload::Serialized(SerializedPayload::Frames { header, frames }) => {
                SerializedPayload::Frames {
                    header: FrameHeader {
                        serializer: target,
                        ..header.clone()
                    },
                    frames: frames.clone(),
                }
            }
            Payload::Serialized(SerializedPayload::Disk(disk)) => {
                let (mut header, frames) = spill::load(disk)?;
                header.serializer = target;
                SerializedPayload::Frames { header, frames }
            }
            Payload::Live(obj) => {
                let frames = obj.to_frames()?;
                SerializedPayload::Frames {
                    header: FrameHeader::new(target, obj.nbytes(), &frames),
                    frames,
                }
            }
        };
        detail.set_payload(Payload::Serialized(payload));
        Ok(())
    }

    fn serialized_versioned(&self) -> Option<(u64, SerializedPayload)> {
        let detail = self.detail.lock();
        match &detail.payload {
            Payload::Live(_) => None,
            Payload::Serialized(payload) => Some((detail.version, payload.clone())),
        }
    }

    fn replace_serialized(&self, version: u64, payload: SerializedPayload) -> bool {
        let mut detail = self.detail.lock();
        if detail.version != version {
            return false;
        }
        detail.set_payload(Payload::Serialized(payload));
        true
    }

    fn is_explicit(&self) -> bool {
        self.explicit
    }
}

impl<T: DeviceObject> std::fmt::Debug for ProxyObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyObject")
            .field("id", &self.id())
            .field("serializer", &self.serializer())
            .field("explicit", &self.explicit)
            .finish()
    }
}

impl<T: DeviceObject> Drop for ProxyObject<T> {
    fn drop(&mut self) {
        let id = self.id();
        let detail = self.detail.get_mut();

        if let Payload::Serialized(SerializedPayload::Disk(header)) = &detail.payload {
            if let Err(e) = std::fs::remove_file(&header.path) {
                tracing::debug!(path = %header.path.display(), error = %e, "Spill file already gone");
            }
        }
        if let Some(manager) = detail.manager.upgrade() {
            manager.forget(id);
        }
    }
}
