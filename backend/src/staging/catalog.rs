//! Disk catalog: an explicit arena of `(disk, slot) -> entry`.
//!
//! Every UV or image file the pipeline creates is registered here with an
//! AIPS-style `(name, class, seq)` triple. Sequence numbers are allocated per
//! `(disk, name, class)` so repeated imaging passes never overwrite each other.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::define_index_type;
use crate::error::{ErrorContext, PipelineError, PipelineResult};
use crate::tables;

define_index_type!(u32, DiskId);
define_index_type!(u32, SlotId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogKey {
    pub disk: DiskId,
    pub slot: SlotId,
}

impl std::fmt::Display for CatalogKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.disk, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Uv,
    Image,
}

impl FileKind {
    fn extension(&self) -> &'static str {
        match self {
            FileKind::Uv => "uv",
            FileKind::Image => "img",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub key: CatalogKey,
    pub name: String,
    pub class: String,
    pub seq: u32,
    pub kind: FileKind,
    pub path: PathBuf,
}

impl std::fmt::Display for CatalogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{} ({} disk {})",
            self.name,
            self.class,
            self.seq,
            self.kind.extension(),
            self.key.disk
        )
    }
}

#[derive(Default)]
struct CatalogData {
    disks: Vec<PathBuf>,
    entries: BTreeMap<CatalogKey, CatalogEntry>,
    next_slot: HashMap<DiskId, SlotId>,
    next_seq: HashMap<(DiskId, String, String), u32>,
}

/// Shared catalog handle. Clones refer to the same arena.
#[derive(Clone, Default)]
pub struct Catalog {
    inner: Arc<Mutex<CatalogData>>,
}

impl Catalog {
    /// Catalog over `disks`; the first path is disk 1.
    pub fn new(disks: Vec<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CatalogData {
                disks,
                ..Default::default()
            })),
        }
    }

    pub fn disk_count(&self) -> usize {
        self.inner.lock().disks.len()
    }

    pub fn disk_root(&self, disk: DiskId) -> Option<PathBuf> {
        let data = self.inner.lock();
        disk_root(&data.disks, disk).map(Path::to_path_buf)
    }

    /// Register a new file and return its entry. The file itself is not created.
    pub fn allocate(
        &self,
        disk: DiskId,
        name: &str,
        class: &str,
        kind: FileKind,
    ) -> PipelineResult<CatalogEntry> {
        let mut data = self.inner.lock();
        let root = disk_root(&data.disks, disk)
            .ok_or_else(|| {
                PipelineError::configuration(format!("no disk {} configured", disk))
                    .with_context(ErrorContext::new("catalog_allocate"))
            })?
            .to_path_buf();

        let name = sanitize(name);
        let class = sanitize(class);

        let slot = *data.next_slot.entry(disk).or_insert(SlotId(1));
        data.next_slot.insert(disk, slot.next());

        let seq_key = (disk, name.clone(), class.clone());
        let seq = data.next_seq.get(&seq_key).copied().unwrap_or(1);
        data.next_seq.insert(seq_key, seq + 1);

        let path = root.join(format!("{}.{}.{}.{}", name, class, seq, kind.extension()));
        let entry = CatalogEntry {
            key: CatalogKey { disk, slot },
            name,
            class,
            seq,
            kind,
            path,
        };
        debug!("Catalogued {} at {}", entry, entry.path.display());
        data.entries.insert(entry.key, entry.clone());
        Ok(entry)
    }

    pub fn get(&self, key: CatalogKey) -> Option<CatalogEntry> {
        self.inner.lock().entries.get(&key).cloned()
    }

    /// Drop the entry without touching the file.
    pub fn remove(&self, key: CatalogKey) -> Option<CatalogEntry> {
        self.inner.lock().entries.remove(&key)
    }

    /// Delete the file, its tables and the entry.
    pub fn zap(&self, key: CatalogKey) -> PipelineResult<()> {
        let Some(entry) = self.remove(key) else {
            return Ok(());
        };
        remove_file_if_exists(&entry.path)?;
        tables::remove_tables(&entry.path)?;
        debug!("Zapped {}", entry);
        Ok(())
    }

    /// Zap every entry of `class`, logging (not failing) on I/O errors.
    pub fn zap_class(&self, class: &str) -> usize {
        let keys: Vec<CatalogKey> = self
            .inner
            .lock()
            .entries
            .values()
            .filter(|e| e.class == class)
            .map(|e| e.key)
            .collect();
        let mut zapped = 0;
        for key in keys {
            match self.zap(key) {
                Ok(()) => zapped += 1,
                Err(e) => warn!("Failed to zap {}: {}", key, e),
            }
        }
        zapped
    }

    pub fn entries(&self) -> Vec<CatalogEntry> {
        self.inner.lock().entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.inner.lock();
        f.debug_struct("Catalog")
            .field("disks", &data.disks)
            .field("entries", &data.entries.len())
            .finish()
    }
}

fn disk_root(disks: &[PathBuf], disk: DiskId) -> Option<&Path> {
    let index = disk.value().checked_sub(1)? as usize;
    disks.get(index).map(PathBuf::as_path)
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "UNNAMED".to_string()
    } else {
        cleaned
    }
}

pub(crate) fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_assigns_slots_and_sequences() {
        let catalog = Catalog::new(vec![PathBuf::from("/ram"), PathBuf::from("/work")]);

        let a = catalog.allocate(DiskId(1), "PKS 1934", "raw", FileKind::Uv).unwrap();
        let b = catalog.allocate(DiskId(1), "PKS 1934", "raw", FileKind::Uv).unwrap();
        let c = catalog.allocate(DiskId(2), "PKS 1934", "raw", FileKind::Uv).unwrap();

        assert_eq!(a.key.slot, SlotId(1));
        assert_eq!(b.key.slot, SlotId(2));
        assert_eq!(c.key.slot, SlotId(1));
        assert_eq!((a.seq, b.seq, c.seq), (1, 2, 1));
        assert_eq!(a.path, PathBuf::from("/ram/PKS_1934.raw.1.uv"));
        assert_eq!(catalog.len(), 3);
    }

    #[test]
    fn test_unknown_disk_is_configuration_error() {
        let catalog = Catalog::new(vec![PathBuf::from("/ram")]);
        let err = catalog.allocate(DiskId(3), "x", "raw", FileKind::Uv).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert!(catalog.allocate(DiskId(0), "x", "raw", FileKind::Uv).is_err());
    }

    #[test]
    fn test_zap_removes_file_and_entry() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(vec![dir.path().to_path_buf()]);
        let entry = catalog.allocate(DiskId(1), "t", "merge", FileKind::Uv).unwrap();
        std::fs::write(&entry.path, b"data").unwrap();

        catalog.zap(entry.key).unwrap();
        assert!(!entry.path.exists());
        assert!(catalog.get(entry.key).is_none());
        // Zapping twice is harmless
        catalog.zap(entry.key).unwrap();
    }

    #[test]
    fn test_zap_class() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::new(vec![dir.path().to_path_buf()]);
        for _ in 0..3 {
            let e = catalog.allocate(DiskId(1), "t", "scans", FileKind::Uv).unwrap();
            std::fs::write(&e.path, b"x").unwrap();
        }
        catalog.allocate(DiskId(1), "t", "merge", FileKind::Uv).unwrap();

        assert_eq!(catalog.zap_class("scans"), 3);
        assert_eq!(catalog.len(), 1);
    }
}
