//! Client-side offset persistence for pull consumers.
//!
//! The broker is a stateless data pipe; offset tracking is the client's
//! responsibility. Stores are pluggable: in-memory for tests and ephemeral
//! consumers, file-backed for durable checkpoints.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::warn;

use crate::error::{ClientError, Result};

/// Capability set for offset persistence.
///
/// `load` returns `None` on first run (or when the stored state is
/// unreadable); `store` must be durable by the time it returns.
pub trait OffsetStore: Send + Sync {
    fn load(&self, consumer_name: &str, topic_id: u32) -> Result<Option<u64>>;
    fn store(&self, consumer_name: &str, topic_id: u32, offset: u64) -> Result<()>;
    fn delete(&self, consumer_name: &str, topic_id: u32) -> Result<()>;
}

/// In-memory offset store. Offsets are lost on process exit.
#[derive(Debug, Default)]
pub struct MemoryOffsetStore {
    offsets: RwLock<HashMap<(String, u32), u64>>,
}

impl MemoryOffsetStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl OffsetStore for MemoryOffsetStore {
    fn load(&self, consumer_name: &str, topic_id: u32) -> Result<Option<u64>> {
        let offsets = self
            .offsets
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(offsets.get(&(consumer_name.to_string(), topic_id)).copied())
    }

    fn store(&self, consumer_name: &str, topic_id: u32, offset: u64) -> Result<()> {
        let mut offsets = self
            .offsets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets.insert((consumer_name.to_string(), topic_id), offset);
        Ok(())
    }

    fn delete(&self, consumer_name: &str, topic_id: u32) -> Result<()> {
        let mut offsets = self
            .offsets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        offsets.remove(&(consumer_name.to_string(), topic_id));
        Ok(())
    }
}

/// File-backed offset store.
///
/// One file per `(consumer_name, topic_id)` under the base directory:
///
/// ```text
/// {base_dir}/{consumer_name}_{topic_id}.offset
/// ```
///
/// File content is the decimal ASCII offset followed by a newline. Writes go
/// to a sibling temp file, are fsynced, then atomically renamed into place,
/// so a crash never leaves a torn offset. A corrupt or absent file reads as
/// "no stored offset".
#[derive(Debug)]
pub struct FileOffsetStore {
    base_dir: PathBuf,
}

impl FileOffsetStore {
    /// Open (creating if needed) an offset store at `base_dir`.
    pub fn open(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(ClientError::Connection)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn offset_path(&self, consumer_name: &str, topic_id: u32) -> PathBuf {
        let safe_name: String = consumer_name
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.base_dir.join(format!("{}_{}.offset", safe_name, topic_id))
    }

    fn read_offset_file(path: &Path) -> Option<u64> {
        let mut file = File::open(path).ok()?;
        let mut content = String::new();
        file.read_to_string(&mut content).ok()?;
        match content.trim().parse() {
            Ok(offset) => Some(offset),
            Err(_) => {
                warn!(path = %path.display(), "corrupt offset file, treating as absent");
                None
            }
        }
    }
}

impl OffsetStore for FileOffsetStore {
    fn load(&self, consumer_name: &str, topic_id: u32) -> Result<Option<u64>> {
        let path = self.offset_path(consumer_name, topic_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Self::read_offset_file(&path))
    }

    fn store(&self, consumer_name: &str, topic_id: u32, offset: u64) -> Result<()> {
        let path = self.offset_path(consumer_name, topic_id);
        let tmp_path = path.with_extension("offset.tmp");

        let mut tmp = File::create(&tmp_path).map_err(ClientError::Connection)?;
        writeln!(tmp, "{}", offset).map_err(ClientError::Connection)?;
        tmp.sync_all().map_err(ClientError::Connection)?;
        drop(tmp);

        fs::rename(&tmp_path, &path).map_err(ClientError::Connection)?;
        Ok(())
    }

    fn delete(&self, consumer_name: &str, topic_id: u32) -> Result<()> {
        let path = self.offset_path(consumer_name, topic_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ClientError::Connection(e)),
        }
    }
}
