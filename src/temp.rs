//! Scratch directory for spill and fragment files.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::Result;

/// A uniquely named directory that hands out fresh spill paths and removes
/// itself (with everything left inside) when dropped. Removal failures are
/// logged, never propagated.
pub struct SpillDir {
    path: PathBuf,
    next_id: AtomicU64,
}

impl SpillDir {
    /// Create a spill directory under the platform temp dir.
    pub fn new() -> Result<Self> {
        Self::in_dir(std::env::temp_dir())
    }

    /// Create a spill directory under `base`. The directory name embeds the
    /// pid, a timestamp and a process-wide sequence number so stores never
    /// collide, not even ones created back to back.
    pub fn in_dir(base: impl AsRef<Path>) -> Result<Self> {
        static SEQ: AtomicU64 = AtomicU64::new(0);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = base.as_ref().join(format!(
            "kvshuffle_{}_{}_{}",
            std::process::id(),
            timestamp,
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path)?;
        Ok(Self {
            path,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Allocate a fresh, unique path inside the directory. The file itself
    /// is not created.
    pub fn fresh_path(&self) -> PathBuf {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.path.join(format!("spill_{id:06}.kv"))
    }
}

impl Drop for SpillDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            warn!("failed to remove spill dir {}: {e}", self.path.display());
        }
    }
}
