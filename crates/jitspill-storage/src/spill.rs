//! Spill files on local disk
//!
//! Every spilled proxy becomes one file named `<prefix>-<counter>` inside a
//! single spill directory. The directory is fixed for the lifetime of the
//! process; the prefix is unique per run and the counter is shared by all
//! writers.
//!
//! File layout (all integers little-endian `u64`):
//!
//! ```text
//! ┌───────┬────────┬─────┬────────┬─────────┬─────┬─────────┐
//! │ count │ len[0] │ ... │ len[n] │ frame 0 │ ... │ frame n │
//! └───────┴────────┴─────┴────────┴─────────┴─────┴─────────┘
//! ```

use bytes::Bytes;
use jitspill_core::{CoreError, CoreResult};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::compression;
use crate::proxy::{FrameHeader, SerializerTag};

static GLOBAL_SPILL_DIRECTORY: OnceCell<Arc<SpillDirectory>> = OnceCell::new();

/// Compression applied to a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Gzip,
}

/// Header of a proxy whose frames live in a spill file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskHeader {
    /// Always [`SerializerTag::Disk`]
    pub serializer: SerializerTag,
    /// Location of the spill file
    pub path: PathBuf,
    /// Whether `path` is on a filesystem shared between workers
    #[serde(rename = "shared-filesystem")]
    pub shared_filesystem: bool,
    /// Header of the frames stored in the file
    #[serde(rename = "disk-sub-header")]
    pub disk_sub_header: FrameHeader,
    /// Bytes written to the file
    pub size: u64,
}

/// Process-wide directory that spill files are written to.
#[derive(Debug)]
pub struct SpillDirectory {
    root: PathBuf,
    prefix: String,
    counter: Mutex<u64>,
    shared_filesystem: AtomicBool,
    compression: AtomicBool,
}

impl SpillDirectory {
    /// Create a spill directory rooted at `root`, creating it if needed.
    ///
    /// Most callers want [`SpillDirectory::register`] instead, which hands out
    /// the single process-wide instance.
    pub fn new(root: impl Into<PathBuf>, shared_filesystem: bool) -> CoreResult<Arc<Self>> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        Ok(Arc::new(Self {
            root,
            prefix: format!("spilled-data-{}", Uuid::new_v4()),
            counter: Mutex::new(0),
            shared_filesystem: AtomicBool::new(shared_filesystem),
            compression: AtomicBool::new(true),
        }))
    }

    /// Register the process-wide spill directory.
    ///
    /// The first call fixes the root. Later calls must pass the same root and
    /// only refresh the shared-filesystem flag.
    ///
    /// # Errors
    ///
    /// Returns `ConfigConflict` if a different root was already registered.
    pub fn register(root: impl Into<PathBuf>, shared_filesystem: bool) -> CoreResult<Arc<Self>> {
        let root = root.into();
        let dir = GLOBAL_SPILL_DIRECTORY
            .get_or_try_init(|| Self::new(root.clone(), shared_filesystem))?;

        if dir.root != root {
            return Err(CoreError::config_conflict(format!(
                "cannot change the spill directory from {} to {}",
                dir.root.display(),
                root.display()
            )));
        }

        std::fs::create_dir_all(&dir.root)?;
        dir.set_shared_filesystem(shared_filesystem);
        tracing::debug!(root = %dir.root.display(), shared_filesystem, "Registered spill directory");
        Ok(Arc::clone(dir))
    }

    /// The process-wide spill directory, if one was registered.
    pub fn global() -> Option<Arc<Self>> {
        GLOBAL_SPILL_DIRECTORY.get().cloned()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn shared_filesystem(&self) -> bool {
        self.shared_filesystem.load(Ordering::Acquire)
    }

    pub fn set_shared_filesystem(&self, shared: bool) {
        self.shared_filesystem.store(shared, Ordering::Release);
    }

    pub fn compression(&self) -> bool {
        self.compression.load(Ordering::Acquire)
    }

    pub fn set_compression(&self, enabled: bool) {
        self.compression.store(enabled, Ordering::Release);
    }

    /// Generate a unique file path inside the spill directory.
    pub fn gen_file_path(&self) -> PathBuf {
        let mut counter = self.counter.lock();
        *counter += 1;
        self.root.join(format!("{}-{}", self.prefix, *counter))
    }

    /// Write `frames` to a new spill file.
    ///
    /// Raw frames are compressed first when `compress` is set and compression
    /// is enabled. Frames that are already compressed are written as-is.
    pub fn dump(
        &self,
        mut header: FrameHeader,
        frames: &[Bytes],
        compress: bool,
    ) -> CoreResult<DiskHeader> {
        let already_compressed = header.compression.iter().any(Option::is_some);

        let frames: Vec<Bytes> = if compress && self.compression() && !already_compressed {
            let mut codecs = Vec::with_capacity(frames.len());
            let mut out = Vec::with_capacity(frames.len());
            for frame in frames {
                let (codec, frame) = compression::maybe_compress(frame)?;
                codecs.push(codec);
                out.push(frame);
            }
            header.compression = codecs;
            out
        } else {
            if header.compression.len() != frames.len() {
                header.compression = vec![None; frames.len()];
            }
            frames.to_vec()
        };
        header.count = frames.len();

        let path = self.gen_file_path();
        let packed = pack_frames(&frames);
        std::fs::write(&path, &packed)?;

        tracing::debug!(path = %path.display(), bytes = packed.len(), "Wrote spill file");

        Ok(DiskHeader {
            serializer: SerializerTag::Disk,
            path,
            shared_filesystem: self.shared_filesystem(),
            disk_sub_header: header,
            size: packed.len() as u64,
        })
    }
}

/// Read a spill file back into frames and delete it.
///
/// A spill file can be read at most once.
pub fn load(header: &DiskHeader) -> CoreResult<(FrameHeader, Vec<Bytes>)> {
    let data = std::fs::read(&header.path)?;
    std::fs::remove_file(&header.path)?;

    let frames = unpack_frames(&data)?;
    let mut sub_header = header.disk_sub_header.clone();
    if frames.len() != sub_header.count {
        return Err(CoreError::DeserializationError(format!(
            "spill file {} holds {} frames, header says {}",
            header.path.display(),
            frames.len(),
            sub_header.count
        )));
    }

    let frames = if sub_header.compression.is_empty() {
        frames
    } else {
        frames
            .into_iter()
            .zip(sub_header.compression.iter().copied())
            .map(|(frame, codec)| compression::decompress(codec, frame))
            .collect::<CoreResult<Vec<_>>>()?
    };
    sub_header.compression = vec![None; frames.len()];

    Ok((sub_header, frames))
}

/// Pack frames into a single buffer.
pub fn pack_frames(frames: &[Bytes]) -> Vec<u8> {
    let data_len: usize = frames.iter().map(Bytes::len).sum();
    let mut out = Vec::with_capacity(8 * (frames.len() + 1) + data_len);

    out.extend_from_slice(&(frames.len() as u64).to_le_bytes());
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u64).to_le_bytes());
    }
    for frame in frames {
        out.extend_from_slice(frame);
    }
    out
}

/// Inverse of [`pack_frames`].
pub fn unpack_frames(data: &[u8]) -> CoreResult<Vec<Bytes>> {
    let truncated = || CoreError::DeserializationError("truncated spill file".to_string());

    let read_u64 = |offset: usize| -> CoreResult<u64> {
        let bytes = data.get(offset..offset + 8).ok_or_else(truncated)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    };

    let count = usize::try_from(read_u64(0)?).map_err(|_| truncated())?;
    let lengths = (0..count)
        .map(|i| read_u64(8 * (i + 1)).map(|len| len as usize))
        .collect::<CoreResult<Vec<_>>>()?;

    let data = Bytes::copy_from_slice(data);
    let mut offset = 8 * (count + 1);
    let mut frames = Vec::with_capacity(count);
    for len in lengths {
        let end = offset.checked_add(len).ok_or_else(truncated)?;
        if end > data.len() {
            return Err(truncated());
        }
        frames.push(data.slice(offset..end));
        offset = end;
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn frames() -> Vec<Bytes> {
        vec![
            Bytes::from_static(b"header-frame"),
            Bytes::from(vec![3u8; 16 * 1024]),
            Bytes::new(),
        ]
    }

    #[test]
    fn test_pack_unpack() {
        let frames = frames();
        let packed = pack_frames(&frames);
        assert_eq!(unpack_frames(&packed).unwrap(), frames);
    }

    #[test]
    fn test_unpack_truncated() {
        let mut packed = pack_frames(&frames());
        packed.truncate(packed.len() - 1);
        assert!(unpack_frames(&packed).is_err());
        assert!(unpack_frames(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_gen_file_path_is_unique() {
        let tmp = TempDir::new().unwrap();
        let dir = SpillDirectory::new(tmp.path(), false).unwrap();

        let a = dir.gen_file_path();
        let b = dir.gen_file_path();
        assert_ne!(a, b);
        assert!(a.starts_with(tmp.path()));
        assert_eq!(
            b.file_name().unwrap().to_str().unwrap(),
            format!("{}-2", dir.prefix())
        );
    }

    #[test]
    fn test_dump_and_load_deletes_file() {
        let tmp = TempDir::new().unwrap();
        let dir = SpillDirectory::new(tmp.path(), true).unwrap();
        let frames = frames();
        let header = FrameHeader::new(SerializerTag::Dask, 42, &frames);

        let disk = dir.dump(header.clone(), &frames, true).unwrap();
        assert_eq!(disk.serializer, SerializerTag::Disk);
        assert!(disk.shared_filesystem);
        assert!(disk.path.exists());
        assert_eq!(disk.disk_sub_header.compression[1], Some(Codec::Gzip));

        let (sub_header, restored) = load(&disk).unwrap();
        assert_eq!(restored, frames);
        assert_eq!(sub_header, header);
        assert!(!disk.path.exists());

        // Single-use
        assert!(load(&disk).is_err());
    }

    #[test]
    fn test_dump_without_compression() {
        let tmp = TempDir::new().unwrap();
        let dir = SpillDirectory::new(tmp.path(), false).unwrap();
        let frames = frames();
        let header = FrameHeader::new(SerializerTag::Pickle, 0, &frames);

        let disk = dir.dump(header, &frames, false).unwrap();
        assert!(disk.disk_sub_header.compression.iter().all(Option::is_none));
        assert_eq!(disk.size, pack_frames(&frames).len() as u64);
    }

    #[test]
    fn test_disk_header_json_keys() {
        let header = DiskHeader {
            serializer: SerializerTag::Disk,
            path: PathBuf::from("/tmp/x"),
            shared_filesystem: false,
            disk_sub_header: FrameHeader::new(SerializerTag::Dask, 0, &[]),
            size: 8,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["serializer"], "disk");
        assert_eq!(json["shared-filesystem"], false);
        assert_eq!(json["disk-sub-header"]["serializer"], "dask");
    }
}
