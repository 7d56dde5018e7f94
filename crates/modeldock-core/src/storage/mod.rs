//! Disk-space accounting, path allocation and file lifecycle for artifacts.
//!
//! Space is reserved atomically under one lock so two downloads never
//! over-commit the same free bytes. Data is written to `<target>.part` and
//! only renamed onto the target after an optional SHA-256 check, so a
//! partial artifact is never visible at its final path.

mod checksum;
mod sanitize;
mod space;
mod writer;

pub use checksum::{sha256_path, verify as verify_checksum};
pub use sanitize::sanitize_component;
pub use space::{FixedSpace, FsStats, SpaceProbe, Statvfs};
pub use writer::StorageWriter;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::types::ModelRef;

/// Temporary file suffix used before atomic rename.
pub const TEMP_SUFFIX: &str = ".part";

/// Path for the temp file: appends `.part` to the final path.
pub fn temp_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(TEMP_SUFFIX);
    PathBuf::from(o)
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("insufficient space: need {required} bytes, {available} available")]
    InsufficientSpace { required: u64, available: u64 },
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid artifact name: {0:?}")]
    InvalidName(String),
    #[error("{} is already being written by another task", .0.display())]
    TargetInUse(PathBuf),
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Identifies one reservation in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationId(u64);

/// Space held for one artifact, plus the paths it will be written to.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub id: ReservationId,
    pub target: PathBuf,
    pub temp: PathBuf,
}

/// Filesystem usage of the storage root plus bytes held by reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageUsage {
    pub total: u64,
    pub used: u64,
    pub free: u64,
    /// Reserved but not yet allocated on disk.
    pub reserved: u64,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    bytes: u64,
    /// Share of `bytes` already allocated on disk and so missing from the filesystem's free space.
    allocated: u64,
}

impl Entry {
    fn outstanding(&self) -> u64 {
        self.bytes.saturating_sub(self.allocated)
    }
}

#[derive(Debug, Default)]
struct Ledger {
    next_id: u64,
    entries: HashMap<ReservationId, (Entry, PathBuf)>,
    targets: HashSet<PathBuf>,
}

impl Ledger {
    fn others(&self, skip: Option<ReservationId>) -> impl Iterator<Item = &Entry> {
        self.entries
            .iter()
            .filter(move |(id, _)| Some(**id) != skip)
            .map(|(_, (e, _))| e)
    }

    /// Reserved bytes not yet allocated on disk.
    fn outstanding(&self, skip: Option<ReservationId>) -> u64 {
        self.others(skip).map(Entry::outstanding).sum()
    }

    /// All reserved bytes, counted against the quota.
    fn held(&self, skip: Option<ReservationId>) -> u64 {
        self.others(skip).map(|e| e.bytes).sum()
    }
}

pub struct StorageManager {
    root: PathBuf,
    min_free: u64,
    quota: Option<u64>,
    space: Arc<dyn SpaceProbe>,
    ledger: Mutex<Ledger>,
}

impl StorageManager {
    /// Create the manager, making sure the root directory exists.
    pub fn new(
        root: impl Into<PathBuf>,
        min_free: u64,
        quota: Option<u64>,
        space: Arc<dyn SpaceProbe>,
    ) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io("create", &root, e))?;
        Ok(Self {
            root,
            min_free,
            quota,
            space,
            ledger: Mutex::new(Ledger::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<source>/<model id>/<artifact>`, each component sanitized.
    pub fn allocate_path(&self, model: &ModelRef, file_name: &str) -> Result<PathBuf, StorageError> {
        let model_dir = sanitize_component(&model.id);
        let file = sanitize_component(file_name);
        if model_dir.is_empty() {
            return Err(StorageError::InvalidName(model.id.clone()));
        }
        if file.is_empty() {
            return Err(StorageError::InvalidName(file_name.to_string()));
        }
        Ok(self
            .root
            .join(model.source.as_str())
            .join(model_dir)
            .join(file))
    }

    /// Bytes a new reservation could take right now.
    pub fn available(&self) -> Result<u64, StorageError> {
        let stats = self.fs_stats()?;
        let ledger = self.ledger.lock();
        Ok(self.available_locked(&ledger, stats, None))
    }

    /// Room left for one reservation, ignoring `skip`'s own share.
    fn available_locked(&self, ledger: &Ledger, stats: FsStats, skip: Option<ReservationId>) -> u64 {
        let disk = self.disk_room_locked(ledger, stats, skip);
        match self.quota_room_locked(ledger, skip) {
            Some(q) => disk.min(q),
            None => disk,
        }
    }

    /// Free bytes not yet promised to another reservation.
    fn disk_room_locked(&self, ledger: &Ledger, stats: FsStats, skip: Option<ReservationId>) -> u64 {
        stats
            .free
            .saturating_sub(self.min_free)
            .saturating_sub(ledger.outstanding(skip))
    }

    /// `entry` fits when its unallocated share fits on disk and its full size fits the quota.
    fn check_room(
        &self,
        ledger: &Ledger,
        stats: FsStats,
        skip: Option<ReservationId>,
        entry: Entry,
    ) -> Result<(), StorageError> {
        let disk = self.disk_room_locked(ledger, stats, skip);
        if entry.outstanding() > disk {
            return Err(StorageError::InsufficientSpace {
                required: entry.outstanding(),
                available: disk,
            });
        }
        if let Some(room) = self.quota_room_locked(ledger, skip) {
            if entry.bytes > room {
                return Err(StorageError::InsufficientSpace {
                    required: entry.bytes,
                    available: room,
                });
            }
        }
        Ok(())
    }

    fn quota_room_locked(&self, ledger: &Ledger, skip: Option<ReservationId>) -> Option<u64> {
        self.quota.map(|q| q.saturating_sub(ledger.held(skip)))
    }

    fn fs_stats(&self) -> Result<FsStats, StorageError> {
        self.space
            .stats(&self.root)
            .map_err(|e| StorageError::io("statvfs", &self.root, e))
    }

    /// Reserve `bytes` for an artifact and allocate its paths. `bytes` may be 0
    /// when the size is unknown; grow it later with [`StorageManager::adjust`].
    pub fn reserve(
        &self,
        model: &ModelRef,
        file_name: &str,
        bytes: u64,
    ) -> Result<Reservation, StorageError> {
        let target = self.allocate_path(model, file_name)?;
        self.reserve_at(target, bytes, 0)
    }

    /// Reserve for a transfer that continues an earlier run. Whatever the
    /// existing `.part` file already occupies is not taken from free space again.
    pub fn reserve_resume(
        &self,
        model: &ModelRef,
        file_name: &str,
        bytes: u64,
    ) -> Result<Reservation, StorageError> {
        let target = self.allocate_path(model, file_name)?;
        let temp = temp_path(&target);
        let on_disk = match std::fs::metadata(&temp) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::io("stat", &temp, e)),
        };
        self.reserve_at(target, bytes, on_disk.min(bytes))
    }

    fn reserve_at(&self, target: PathBuf, bytes: u64, allocated: u64) -> Result<Reservation, StorageError> {
        let stats = self.fs_stats()?;
        let entry = Entry { bytes, allocated };
        let id = {
            let mut ledger = self.ledger.lock();
            if ledger.targets.contains(&target) {
                return Err(StorageError::TargetInUse(target));
            }
            self.check_room(&ledger, stats, None, entry)?;
            ledger.next_id += 1;
            let id = ReservationId(ledger.next_id);
            ledger.entries.insert(id, (entry, target.clone()));
            ledger.targets.insert(target.clone());
            id
        };
        if let Some(dir) = target.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                self.release_id(id);
                return Err(StorageError::io("create", dir, e));
            }
        }
        tracing::debug!(path = %target.display(), bytes, allocated, "storage reserved");
        Ok(Reservation {
            id,
            temp: temp_path(&target),
            target,
        })
    }

    /// Resize a reservation once the real size is known.
    pub fn adjust(&self, reservation: &Reservation, bytes: u64) -> Result<(), StorageError> {
        let stats = self.fs_stats()?;
        let mut ledger = self.ledger.lock();
        let Some(current) = ledger.entries.get(&reservation.id).map(|(e, _)| *e) else {
            return Ok(());
        };
        if bytes > current.bytes {
            let grown = Entry {
                bytes,
                allocated: current.allocated,
            };
            self.check_room(&ledger, stats, Some(reservation.id), grown)?;
        }
        if let Some((entry, _)) = ledger.entries.get_mut(&reservation.id) {
            entry.bytes = bytes;
            entry.allocated = entry.allocated.min(bytes);
        }
        Ok(())
    }

    /// Create or reopen the temp file. A fresh file is preallocated to `total`
    /// and its reservation then counts as allocated on disk.
    pub fn open_writer(
        &self,
        reservation: &Reservation,
        offset: u64,
        total: Option<u64>,
    ) -> Result<StorageWriter, StorageError> {
        if offset > 0 {
            return StorageWriter::open_existing(&reservation.temp);
        }
        let writer = StorageWriter::create(&reservation.temp, total)?;
        if let Some(total) = total {
            if let Some((entry, _)) = self.ledger.lock().entries.get_mut(&reservation.id) {
                entry.allocated = total.min(entry.bytes);
            }
        }
        Ok(writer)
    }

    /// Write one chunk of the artifact at `offset`.
    pub fn write_chunk(&self, writer: &StorageWriter, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        writer.write_at(offset, data)
    }

    /// Sync, verify the digest when one is known, then atomically rename onto the target.
    /// On mismatch the temp file stays for diagnostics.
    pub async fn finalize(
        &self,
        reservation: &Reservation,
        writer: StorageWriter,
        len: u64,
        expected_sha256: Option<&str>,
    ) -> Result<PathBuf, StorageError> {
        writer.set_len(len)?;
        writer.sync()?;
        if let Some(expected) = expected_sha256 {
            verify_checksum(reservation.temp.clone(), expected).await?;
        }
        writer.finalize(&reservation.target)?;
        tracing::info!(path = %reservation.target.display(), bytes = len, "artifact finalized");
        Ok(reservation.target.clone())
    }

    /// Delete partial data and return the reserved space.
    pub fn discard(&self, reservation: &Reservation) {
        match std::fs::remove_file(&reservation.temp) {
            Ok(()) => tracing::debug!(path = %reservation.temp.display(), "partial file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %reservation.temp.display(), "remove partial file: {}", e),
        }
        self.release(reservation);
    }

    /// Return a reservation's space. Idempotent.
    pub fn release(&self, reservation: &Reservation) {
        self.release_id(reservation.id);
    }

    fn release_id(&self, id: ReservationId) {
        let mut ledger = self.ledger.lock();
        if let Some((_, target)) = ledger.entries.remove(&id) {
            ledger.targets.remove(&target);
        }
    }

    pub fn usage(&self) -> Result<StorageUsage, StorageError> {
        let stats = self.fs_stats()?;
        let reserved = self.ledger.lock().outstanding(None);
        Ok(StorageUsage {
            total: stats.total,
            used: stats.used,
            free: stats.free,
            reserved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelSource;

    fn manager(dir: &Path, free: u64, min_free: u64, quota: Option<u64>) -> StorageManager {
        StorageManager::new(dir, min_free, quota, Arc::new(FixedSpace::with_free(free))).unwrap()
    }

    fn model(id: &str) -> ModelRef {
        ModelRef::new(id, ModelSource::RemoteHub)
    }

    #[test]
    fn temp_path_appends_part() {
        assert_eq!(temp_path(Path::new("/m/w.bin")), PathBuf::from("/m/w.bin.part"));
    }

    #[test]
    fn paths_are_namespaced_by_source_and_model() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1000, 0, None);
        let p = sm.allocate_path(&model("org/name"), "weights.bin").unwrap();
        assert_eq!(p, dir.path().join("remote-hub/org_name/weights.bin"));
        assert!(matches!(
            sm.allocate_path(&model(".."), "w.bin"),
            Err(StorageError::InvalidName(_))
        ));
    }

    #[test]
    fn reservations_cannot_overcommit() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1000, 100, None);
        let a = sm.reserve(&model("a"), "w", 600).unwrap();
        match sm.reserve(&model("b"), "w", 600) {
            Err(StorageError::InsufficientSpace {
                required,
                available,
            }) => {
                assert_eq!(required, 600);
                assert_eq!(available, 300);
            }
            other => panic!("expected InsufficientSpace, got {other:?}"),
        }
        sm.release(&a);
        sm.reserve(&model("b"), "w", 600).unwrap();
    }

    #[test]
    fn concurrent_reservations_stay_within_free_space() {
        let dir = tempfile::tempdir().unwrap();
        let sm = Arc::new(manager(dir.path(), 1000, 0, None));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let sm = Arc::clone(&sm);
                std::thread::spawn(move || sm.reserve(&model(&format!("m{i}")), "w", 100).is_ok())
            })
            .collect();
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(granted, 10);
        assert_eq!(sm.usage().unwrap().reserved, 1000);
    }

    #[test]
    fn same_target_cannot_be_reserved_twice() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1000, 0, None);
        let _a = sm.reserve(&model("a"), "w", 1).unwrap();
        assert!(matches!(
            sm.reserve(&model("a"), "w", 1),
            Err(StorageError::TargetInUse(_))
        ));
    }

    #[test]
    fn adjust_grows_within_quota() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 10_000, 0, Some(500));
        let r = sm.reserve(&model("a"), "w", 0).unwrap();
        sm.adjust(&r, 400).unwrap();
        assert!(matches!(
            sm.adjust(&r, 600),
            Err(StorageError::InsufficientSpace { .. })
        ));
        assert_eq!(sm.available().unwrap(), 100);
    }

    #[test]
    fn resumed_reservation_counts_only_what_the_part_file_lacks() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1000, 0, None);
        let first = sm.reserve(&model("a"), "w", 800).unwrap();
        sm.open_writer(&first, 0, Some(800)).unwrap();
        sm.release(&first);

        // The preallocated file already holds its 800 bytes.
        let resumed = sm.reserve_resume(&model("a"), "w", 800).unwrap();
        assert_eq!(sm.usage().unwrap().reserved, 0);
        sm.release(&resumed);

        std::fs::write(&first.temp, vec![0u8; 300]).unwrap();
        let resumed = sm.reserve_resume(&model("a"), "w", 800).unwrap();
        assert_eq!(sm.usage().unwrap().reserved, 500);
        sm.release(&resumed);

        std::fs::remove_file(&first.temp).unwrap();
        match sm.reserve_resume(&model("a"), "w", 1200) {
            Err(StorageError::InsufficientSpace {
                required,
                available,
            }) => assert_eq!((required, available), (1200, 1000)),
            other => panic!("expected InsufficientSpace, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn finalize_verifies_then_renames() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1 << 20, 0, None);
        let r = sm.reserve(&model("a"), "w.bin", 6).unwrap();
        let w = sm.open_writer(&r, 0, Some(6)).unwrap();
        sm.write_chunk(&w, 0, b"hello\n").unwrap();
        let sha = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";
        let path = sm.finalize(&r, w, 6, Some(sha)).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello\n");
        assert!(!r.temp.exists());
    }

    #[tokio::test]
    async fn checksum_mismatch_keeps_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1 << 20, 0, None);
        let r = sm.reserve(&model("a"), "w.bin", 4).unwrap();
        let w = sm.open_writer(&r, 0, Some(4)).unwrap();
        w.write_at(0, b"oops").unwrap();
        let err = sm.finalize(&r, w, 4, Some("00")).await.unwrap_err();
        assert!(matches!(err, StorageError::ChecksumMismatch { .. }));
        assert!(r.temp.exists());
        assert!(!r.target.exists());
    }

    #[test]
    fn discard_removes_partial_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        let sm = manager(dir.path(), 1000, 0, None);
        let r = sm.reserve(&model("a"), "w", 900).unwrap();
        let w = sm.open_writer(&r, 0, None).unwrap();
        w.write_at(0, b"x").unwrap();
        drop(w);
        sm.discard(&r);
        assert!(!r.temp.exists());
        assert_eq!(sm.available().unwrap(), 1000);
    }
}
