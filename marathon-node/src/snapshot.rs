//! Snapshot discovery and lookup.
//!
//! A snapshot is a directory containing a VM state blob and a memory image;
//! resuming from the pair skips the guest boot entirely. The store scans the
//! base directory once at startup and is read-only afterwards — new
//! snapshots are produced by operator tooling and picked up on restart.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// VM state blob file name inside a snapshot directory.
pub const STATE_FILE: &str = "vmstate.bin";

/// Guest memory image file name inside a snapshot directory.
pub const MEMORY_FILE: &str = "memory.bin";

/// Name of the snapshot used when none is requested.
pub const DEFAULT_SNAPSHOT: &str = "base";

/// A registered, validated snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Snapshot name (the subdirectory name).
    pub name: String,
    /// Snapshot directory.
    pub dir: PathBuf,
    /// Path to the VM state blob.
    pub vmstate_path: PathBuf,
    /// Path to the memory image.
    pub memory_path: PathBuf,
}

/// Name → snapshot mapping discovered at daemon startup.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    /// Registered snapshots by name.
    snapshots: HashMap<String, Snapshot>,
}

impl SnapshotStore {
    /// Scans `base_dir`, registering every subdirectory that holds a
    /// readable state blob and memory image. A missing base directory is
    /// created and yields an empty store.
    pub fn scan(base_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(base_dir)?;

        let mut snapshots = HashMap::new();
        for entry in fs::read_dir(base_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %dir.display(), "skipping snapshot with non-UTF-8 name");
                continue;
            };

            let vmstate_path = dir.join(STATE_FILE);
            let memory_path = dir.join(MEMORY_FILE);
            if !is_readable(&vmstate_path) || !is_readable(&memory_path) {
                debug!(name, "skipping incomplete snapshot directory");
                continue;
            }

            snapshots.insert(
                name.clone(),
                Snapshot {
                    name,
                    dir,
                    vmstate_path,
                    memory_path,
                },
            );
        }

        debug!(count = snapshots.len(), "snapshot scan complete");
        Ok(Self { snapshots })
    }

    /// Looks up a snapshot by name.
    pub fn get(&self, name: &str) -> Option<&Snapshot> {
        self.snapshots.get(name)
    }

    /// Returns the default snapshot, when present.
    pub fn get_default(&self) -> Option<&Snapshot> {
        self.get(DEFAULT_SNAPSHOT)
    }

    /// Returns the registered snapshot names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.snapshots.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// A snapshot file counts only if it exists and can actually be opened.
fn is_readable(path: &Path) -> bool {
    fs::File::open(path).is_ok()
}
