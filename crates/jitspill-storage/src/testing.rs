//! In-memory stand-ins for device objects
//!
//! [`TestArray`] plays the role of an array backed by one or more device
//! buffers. Arrays built from the same buffers alias each other, which is what
//! the device tier's accounting has to cope with. [`TestValue`] and
//! [`TestProxify`] give the store something nested to walk.

use bytes::{BufMut, Bytes, BytesMut};
use jitspill_core::{BufferId, CoreError, CoreResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::proxy::{DeviceBuffer, Proxify, Proxy, ProxyRef};
use crate::proxy_object::{DeviceObject, ProxyObject};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Array whose data sits in simulated device buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestArray {
    object_id: u64,
    buffers: Vec<(BufferId, Bytes)>,
}

impl TestArray {
    /// Array over a single buffer of `size` bytes.
    pub fn new(buffer_id: u64, size: u64) -> Self {
        Self::with_buffers(&[(buffer_id, size)])
    }

    /// Array over several `(buffer id, size)` buffers.
    ///
    /// The same buffer id may appear more than once.
    pub fn with_buffers(buffers: &[(u64, u64)]) -> Self {
        Self {
            object_id: next_object_id(),
            buffers: buffers
                .iter()
                .map(|&(id, size)| (BufferId::from_raw(id), fill(id, size)))
                .collect(),
        }
    }

    /// A distinct array viewing the same buffers.
    pub fn alias(&self) -> Self {
        Self {
            object_id: next_object_id(),
            buffers: self.buffers.clone(),
        }
    }

    pub fn object_id(&self) -> u64 {
        self.object_id
    }
}

fn fill(id: u64, size: u64) -> Bytes {
    (0..size).map(|i| ((id + i) % 251) as u8).collect()
}

impl DeviceObject for TestArray {
    fn device_buffers(&self) -> Vec<DeviceBuffer> {
        self.buffers
            .iter()
            .map(|(id, data)| DeviceBuffer::new(*id, data.len() as u64))
            .collect()
    }

    fn nbytes(&self) -> u64 {
        self.buffers.iter().map(|(_, data)| data.len() as u64).sum()
    }

    /// Metadata frame (object id, then each buffer id) followed by one frame
    /// per buffer.
    fn to_frames(&self) -> CoreResult<Vec<Bytes>> {
        let mut meta = BytesMut::with_capacity(8 * (self.buffers.len() + 1));
        meta.put_u64_le(self.object_id);
        for (id, _) in &self.buffers {
            meta.put_u64_le(id.as_raw());
        }

        let mut frames = Vec::with_capacity(self.buffers.len() + 1);
        frames.push(meta.freeze());
        frames.extend(self.buffers.iter().map(|(_, data)| data.clone()));
        Ok(frames)
    }

    fn from_frames(frames: Vec<Bytes>) -> CoreResult<Self> {
        let mut frames = frames.into_iter();
        let meta = frames
            .next()
            .ok_or_else(|| CoreError::DeserializationError("missing metadata frame".into()))?;
        if meta.len() < 8 || meta.len() % 8 != 0 {
            return Err(CoreError::DeserializationError(format!(
                "bad metadata frame of {} bytes",
                meta.len()
            )));
        }

        let words: Vec<u64> = meta
            .chunks_exact(8)
            .map(|chunk| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                u64::from_le_bytes(buf)
            })
            .collect();

        let data: Vec<Bytes> = frames.collect();
        if data.len() != words.len() - 1 {
            return Err(CoreError::DeserializationError(format!(
                "expected {} data frames, got {}",
                words.len() - 1,
                data.len()
            )));
        }

        Ok(Self {
            object_id: words[0],
            buffers: words[1..]
                .iter()
                .map(|id| BufferId::from_raw(*id))
                .zip(data)
                .collect(),
        })
    }
}

/// Nested value stored in a [`crate::ProxifyHostFile`] during tests.
#[derive(Debug, Clone)]
pub enum TestValue {
    Int(i64),
    Array(TestArray),
    Proxy(Arc<ProxyObject<TestArray>>),
    List(Vec<TestValue>),
}

/// Wraps every [`TestArray`] found in a [`TestValue`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TestProxify;

impl Proxify<TestValue> for TestProxify {
    type Seen = HashMap<u64, Arc<ProxyObject<TestArray>>>;

    fn proxify(
        &self,
        value: TestValue,
        seen: &mut Self::Seen,
        found: &mut Vec<ProxyRef>,
    ) -> CoreResult<TestValue> {
        Ok(match value {
            TestValue::Array(array) => {
                let proxy = match seen.get(&array.object_id()) {
                    Some(proxy) => Arc::clone(proxy),
                    None => {
                        let proxy = ProxyObject::new(array.clone());
                        seen.insert(array.object_id(), Arc::clone(&proxy));
                        found.push(proxy.clone());
                        proxy
                    }
                };
                TestValue::Proxy(proxy)
            }
            TestValue::Proxy(proxy) => {
                found.push(proxy.clone());
                TestValue::Proxy(proxy)
            }
            TestValue::List(items) => TestValue::List(
                items
                    .into_iter()
                    .map(|item| self.proxify(item, seen, found))
                    .collect::<CoreResult<_>>()?,
            ),
            other => other,
        })
    }

    fn unproxify(&self, value: TestValue, skip_explicit: bool) -> CoreResult<TestValue> {
        Ok(match value {
            TestValue::Proxy(proxy) if skip_explicit && proxy.is_explicit() => {
                TestValue::Proxy(proxy)
            }
            TestValue::Proxy(proxy) => TestValue::Array(TestArray::clone(&*proxy.get()?)),
            TestValue::List(items) => TestValue::List(
                items
                    .into_iter()
                    .map(|item| self.unproxify(item, skip_explicit))
                    .collect::<CoreResult<_>>()?,
            ),
            other => other,
        })
    }

    fn proxies(&self, value: &TestValue) -> Vec<ProxyRef> {
        match value {
            TestValue::Proxy(proxy) => vec![proxy.clone() as ProxyRef],
            TestValue::List(items) => items.iter().flat_map(|item| self.proxies(item)).collect(),
            TestValue::Int(_) | TestValue::Array(_) => Vec::new(),
        }
    }
}
