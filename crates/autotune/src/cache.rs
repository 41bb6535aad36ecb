//! Persistent plan registry.
//!
//! Entries are keyed by hardware fingerprint plus workload shape class and
//! stored as pretty JSON with sorted keys. Saving writes a sibling temporary
//! file and renames it over the target, so readers of the file see either
//! the old table or the new one.

use kernelplan_kernels::{CandidateConfiguration, Result, ShapeClass};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

const REGISTRY_VERSION: u32 = 1;

/// A previously chosen or measured configuration for one shape on one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRegistryEntry {
    pub shape: ShapeClass,
    pub hw_fingerprint: String,
    pub candidate: CandidateConfiguration,
    pub time_ns: f32,
    /// `true` when `time_ns` was measured rather than predicted.
    pub measured: bool,
    /// Unix seconds.
    pub timestamp: u64,
}

impl PlanRegistryEntry {
    pub fn new(
        shape: ShapeClass,
        hw_fingerprint: impl Into<String>,
        candidate: CandidateConfiguration,
        time_ns: f32,
        measured: bool,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            shape,
            hw_fingerprint: hw_fingerprint.into(),
            candidate,
            time_ns,
            measured,
            timestamp,
        }
    }

    pub fn key(&self) -> String {
        registry_key(&self.shape, &self.hw_fingerprint)
    }
}

pub fn registry_key(shape: &ShapeClass, hw_fingerprint: &str) -> String {
    format!("{}/{}", hw_fingerprint, shape.key())
}

#[derive(Debug, Default, Serialize)]
struct RegistryFile {
    version: u32,
    entries: BTreeMap<String, PlanRegistryEntry>,
}

/// Read side of [`RegistryFile`]; entries are checked one by one.
#[derive(Debug, Deserialize)]
struct StoredRegistry {
    version: u32,
    #[serde(default)]
    entries: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Default)]
pub struct PlanRegistry {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<String, PlanRegistryEntry>>,
}

impl PlanRegistry {
    /// Registry with no backing file.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`; a missing file is an empty registry. Entries that
    /// fail validation are dropped with a warning.
    pub fn open(path: &Path) -> Result<Self> {
        let mut entries = BTreeMap::new();
        if path.exists() {
            let data = fs::read(path)?;
            let file: StoredRegistry = serde_json::from_slice(&data)?;
            if file.version != REGISTRY_VERSION {
                warn!(version = file.version, expected = REGISTRY_VERSION, "registry version mismatch");
            }
            for (key, value) in file.entries {
                match serde_json::from_value::<PlanRegistryEntry>(value) {
                    Ok(entry) if entry.key() != key => {
                        warn!(%key, expected = %entry.key(), "registry entry under wrong key, dropped");
                    }
                    Ok(entry) if !(entry.time_ns.is_finite() && entry.time_ns >= 0.0) => {
                        warn!(%key, time_ns = entry.time_ns, "registry entry with invalid time, dropped");
                    }
                    Ok(entry) => {
                        entries.insert(key, entry);
                    }
                    Err(e) => warn!(%key, error = %e, "invalid registry entry, dropped"),
                }
            }
        }
        debug!(path = %path.display(), entries = entries.len(), "opened plan registry");
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, PlanRegistryEntry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, PlanRegistryEntry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Exact-match lookup; a miss is `None`, not an error.
    pub fn lookup(&self, shape: &ShapeClass, hw_fingerprint: &str) -> Option<PlanRegistryEntry> {
        self.read().get(&registry_key(shape, hw_fingerprint)).cloned()
    }

    /// Insert or replace.
    pub fn upsert(&self, entry: PlanRegistryEntry) {
        self.write().insert(entry.key(), entry);
    }

    /// Insert unless an existing entry for the same key is at least as fast.
    /// Returns whether the registry changed.
    pub fn upsert_if_better(&self, entry: PlanRegistryEntry) -> bool {
        let mut entries = self.write();
        let key = entry.key();
        match entries.get(&key) {
            Some(existing) if existing.time_ns <= entry.time_ns => false,
            _ => {
                entries.insert(key, entry);
                true
            }
        }
    }

    /// Every entry recorded for one device, in key order.
    pub fn entries_for(&self, hw_fingerprint: &str) -> Vec<PlanRegistryEntry> {
        self.read()
            .values()
            .filter(|e| e.hw_fingerprint == hw_fingerprint)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Persist to the path the registry was opened from. No-op in memory.
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Write through a uniquely named sibling temporary file, then rename.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir)?;
        let blob = {
            let entries = self.read();
            serde_json::to_vec_pretty(&RegistryFile {
                version: REGISTRY_VERSION,
                entries: entries.clone(),
            })?
        };
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&blob)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!(path = %path.display(), "saved plan registry");
        Ok(())
    }
}
