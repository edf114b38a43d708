//! Memory-mapped vector storage: an index file of fixed slots plus a data
//! file of variable-length encoded records, with a WAL sidecar for crash
//! recovery (spec §3, §4.2).

use super::guard::VectorSliceGuard;
use super::header::FileHeader;
use super::sharded_index::ShardedIndex;
use super::wal::{Wal, WalEntry};
use crate::error::{Error, Result};
use crate::point::{VectorId, VectorRecord};

use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Size of one index-file slot: id(16) + data_offset(8) + length(4) + flags(1)
/// + reserved(3).
const SLOT_LEN: usize = 32;
const TOMBSTONE_BIT: u8 = 0b0000_0001;

const INITIAL_SIZE: u64 = 1024 * 1024;
const MIN_GROWTH: u64 = 4 * 1024 * 1024;
const GROWTH_FACTOR: u64 = 2;

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

struct Slot {
    id: u128,
    data_offset: u64,
    length: u32,
    flags: u8,
}

impl Slot {
    fn encode(&self) -> [u8; SLOT_LEN] {
        let mut buf = [0u8; SLOT_LEN];
        buf[0..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.data_offset.to_le_bytes());
        buf[24..28].copy_from_slice(&self.length.to_le_bytes());
        buf[28] = self.flags;
        buf
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            id: u128::from_le_bytes(bytes[0..16].try_into().unwrap()),
            data_offset: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            length: u32::from_le_bytes(bytes[24..28].try_into().unwrap()),
            flags: bytes[28],
        }
    }

    fn is_tombstoned(&self) -> bool {
        self.flags & TOMBSTONE_BIT != 0
    }
}

/// Persistent, memory-mapped store of [`VectorRecord`]s.
pub struct VectorStore {
    path: PathBuf,
    dimension: usize,
    index: ShardedIndex,
    slot_file: File,
    slot_mmap: RwLock<MmapMut>,
    slot_count: AtomicUsize,
    data_file: File,
    data_mmap: RwLock<MmapMut>,
    next_data_offset: AtomicU64,
    remap_epoch: AtomicU64,
    wal: Mutex<Wal>,
}

impl VectorStore {
    fn slots_path(path: &Path) -> PathBuf {
        path.join("vectors.idx")
    }
    fn data_path(path: &Path) -> PathBuf {
        path.join("vectors.dat")
    }
    fn wal_path(path: &Path) -> PathBuf {
        path.join("vectors.wal")
    }

    /// Opens an existing store directory, or creates a new one.
    pub fn open(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;

        let slot_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(Self::slots_path(&path))?;
        if slot_file.metadata()?.len() == 0 {
            slot_file.set_len(INITIAL_SIZE)?;
            let mut mmap = unsafe { MmapMut::map_mut(&slot_file)? };
            mmap[0..FileHeader::len()].copy_from_slice(&FileHeader::new(now_secs()).encode());
            mmap.flush()?;
        }
        let slot_mmap = unsafe { MmapMut::map_mut(&slot_file)? };
        FileHeader::decode(&slot_mmap[0..FileHeader::len()])?;

        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(Self::data_path(&path))?;
        if data_file.metadata()?.len() == 0 {
            data_file.set_len(INITIAL_SIZE)?;
            let mut mmap = unsafe { MmapMut::map_mut(&data_file)? };
            mmap[0..FileHeader::len()].copy_from_slice(&FileHeader::new(now_secs()).encode());
            mmap.flush()?;
        }
        let data_mmap = unsafe { MmapMut::map_mut(&data_file)? };
        FileHeader::decode(&data_mmap[0..FileHeader::len()])?;

        let index = ShardedIndex::new();
        let mut slot_count = 0usize;
        let mut next_data_offset = FileHeader::len() as u64;

        {
            let mut offset = FileHeader::len();
            while offset + SLOT_LEN <= slot_mmap.len() {
                let raw = &slot_mmap[offset..offset + SLOT_LEN];
                if raw.iter().all(|&b| b == 0) {
                    break;
                }
                let slot = Slot::decode(raw);
                if !slot.is_tombstoned() {
                    index.insert(slot.id, slot_count);
                    next_data_offset = next_data_offset.max(slot.data_offset + u64::from(slot.length));
                }
                slot_count += 1;
                offset += SLOT_LEN;
            }
        }

        let mut store = Self {
            path: path.clone(),
            dimension,
            index,
            slot_file,
            slot_mmap: RwLock::new(slot_mmap),
            slot_count: AtomicUsize::new(slot_count),
            data_file,
            data_mmap: RwLock::new(data_mmap),
            next_data_offset: AtomicU64::new(next_data_offset),
            remap_epoch: AtomicU64::new(0),
            wal: Mutex::new(Wal::open(Self::wal_path(&path))?),
        };

        let replayed = Wal::replay(Self::wal_path(&path))?;
        for entry in replayed {
            match entry {
                WalEntry::Add { id, data } | WalEntry::Update { id, data } => {
                    if let Some(old_slot_index) = store.index.get(id) {
                        let mut old = store.read_slot(old_slot_index);
                        old.flags |= TOMBSTONE_BIT;
                        store.write_slot(old_slot_index, &old)?;
                    }
                    store.apply_put(VectorId::from_u128(id), &data)?;
                }
                WalEntry::Remove { id } => {
                    store.index.remove(id);
                }
            }
        }
        if !store.index.is_empty() || store.slot_count.load(Ordering::Relaxed) > 0 {
            store.wal.lock().truncate()?;
        }

        Ok(store)
    }

    fn ensure_data_capacity(&self, required_len: u64) -> Result<()> {
        let mut mmap = self.data_mmap.write();
        if (mmap.len() as u64) < required_len {
            mmap.flush()?;
            let current = mmap.len() as u64;
            let new_len = current
                .saturating_mul(GROWTH_FACTOR)
                .max(required_len.saturating_add(MIN_GROWTH))
                .max(required_len);
            self.data_file.set_len(new_len)?;
            *mmap = unsafe { MmapMut::map_mut(&self.data_file)? };
            self.remap_epoch.fetch_add(1, Ordering::Release);
        }
        Ok(())
    }

    fn ensure_slot_capacity(&self, slot_index: usize) -> Result<()> {
        let required_len = (FileHeader::len() + (slot_index + 1) * SLOT_LEN) as u64;
        let mut mmap = self.slot_mmap.write();
        if (mmap.len() as u64) < required_len {
            mmap.flush()?;
            let current = mmap.len() as u64;
            let new_len = current
                .saturating_mul(GROWTH_FACTOR)
                .max(required_len.saturating_add(MIN_GROWTH))
                .max(required_len);
            self.slot_file.set_len(new_len)?;
            *mmap = unsafe { MmapMut::map_mut(&self.slot_file)? };
        }
        Ok(())
    }

    fn write_slot(&self, slot_index: usize, slot: &Slot) -> Result<()> {
        self.ensure_slot_capacity(slot_index)?;
        let start = FileHeader::len() + slot_index * SLOT_LEN;
        let mut mmap = self.slot_mmap.write();
        mmap[start..start + SLOT_LEN].copy_from_slice(&slot.encode());
        Ok(())
    }

    fn read_slot(&self, slot_index: usize) -> Slot {
        let start = FileHeader::len() + slot_index * SLOT_LEN;
        let mmap = self.slot_mmap.read();
        Slot::decode(&mmap[start..start + SLOT_LEN])
    }

    /// Atomically claims a fresh data offset and slot index for a `data.len()`-byte
    /// record, without touching either mmap. Split out from the actual write so the
    /// WAL entry (which must name the real offsets) can be appended before any
    /// mutation of the mapped files.
    fn reserve_put(&self, data_len: usize) -> (u64, usize) {
        let offset = self.next_data_offset.fetch_add(data_len as u64, Ordering::SeqCst);
        let slot_index = self.slot_count.fetch_add(1, Ordering::SeqCst);
        (offset, slot_index)
    }

    fn slot_byte_offset(slot_index: usize) -> u64 {
        (FileHeader::len() + slot_index * SLOT_LEN) as u64
    }

    /// Writes `data` and its slot at the previously [`Self::reserve_put`]-claimed
    /// `offset`/`slot_index`, then publishes it in the in-memory index.
    fn commit_put(&mut self, id: VectorId, data: &[u8], offset: u64, slot_index: usize) -> Result<()> {
        self.ensure_data_capacity(offset + data.len() as u64)?;
        {
            let mut mmap = self.data_mmap.write();
            mmap[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        self.write_slot(
            slot_index,
            &Slot {
                id: id.0,
                data_offset: offset,
                length: data.len() as u32,
                flags: 0,
            },
        )?;
        self.index.insert(id.0, slot_index);
        Ok(())
    }

    /// Reserves and commits in one step, bypassing the WAL. Used only for WAL
    /// replay and defragmentation, where the caller already holds durability
    /// guarantees through other means.
    fn apply_put(&mut self, id: VectorId, data: &[u8]) -> Result<()> {
        let (offset, slot_index) = self.reserve_put(data.len());
        self.commit_put(id, data, offset, slot_index)
    }

    /// Inserts `record`, assigning it a fresh [`VectorId`] if it does not
    /// already have one, and returns that id.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DimensionMismatch`] if `record`'s dimension differs
    /// from the store's.
    pub fn add(&mut self, mut record: VectorRecord) -> Result<VectorId> {
        if record.dimension() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: record.dimension(),
            });
        }
        let id = record.id.unwrap_or_else(VectorId::new);
        record.id = Some(id);
        let bytes = record.to_binary()?;

        let (offset, slot_index) = self.reserve_put(bytes.len());
        self.wal.lock().append_add(id.0, &bytes, Self::slot_byte_offset(slot_index), offset)?;
        self.commit_put(id, &bytes, offset, slot_index)?;
        Ok(id)
    }

    /// Replaces the record stored under `id`, keeping the same identifier.
    /// The old slot's bytes are tombstoned; physical space is reclaimed only
    /// by [`Self::defragment`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `id` is not present.
    pub fn update(&mut self, id: VectorId, mut record: VectorRecord) -> Result<()> {
        if !self.index.contains(id.0) {
            return Err(Error::NotFound);
        }
        if record.dimension() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: record.dimension(),
            });
        }
        record.id = Some(id);
        let bytes = record.to_binary()?;

        let (offset, slot_index) = self.reserve_put(bytes.len());
        self.wal.lock().append_update(id.0, &bytes, Self::slot_byte_offset(slot_index), offset)?;
        if let Some(old_slot_index) = self.index.get(id.0) {
            let mut old = self.read_slot(old_slot_index);
            old.flags |= TOMBSTONE_BIT;
            self.write_slot(old_slot_index, &old)?;
        }
        self.commit_put(id, &bytes, offset, slot_index)?;
        Ok(())
    }

    /// Removes the record stored under `id`.
    ///
    /// Returns `true` if a record was present and removed.
    pub fn remove(&mut self, id: VectorId) -> Result<bool> {
        let Some(slot_index) = self.index.remove(id.0) else {
            return Ok(false);
        };
        let mut slot = self.read_slot(slot_index);
        self.wal.lock().append_delete(id.0, Self::slot_byte_offset(slot_index), slot.data_offset)?;
        slot.flags |= TOMBSTONE_BIT;
        self.write_slot(slot_index, &slot)?;
        Ok(true)
    }

    /// Fetches a copy of the record stored under `id`.
    pub fn get(&self, id: VectorId) -> Result<Option<VectorRecord>> {
        let Some(slot_index) = self.index.get(id.0) else {
            return Ok(None);
        };
        let slot = self.read_slot(slot_index);
        let mmap = self.data_mmap.read();
        let start = slot.data_offset as usize;
        let end = start + slot.length as usize;
        if end > mmap.len() {
            return Err(Error::CorruptHeader("slot points past end of data file".into()));
        }
        Ok(Some(VectorRecord::from_binary(&mmap[start..end])?))
    }

    /// Zero-copy view of just the `f32` components of the record stored
    /// under `id`, without decoding tags or text.
    pub fn get_values_ref(&self, id: VectorId) -> Result<Option<VectorSliceGuard<'_>>> {
        let Some(slot_index) = self.index.get(id.0) else {
            return Ok(None);
        };
        let slot = self.read_slot(slot_index);
        let mmap = self.data_mmap.read();
        // Record layout: id(16) + dimension(4) + values(dimension*4) + ...
        let values_start = slot.data_offset as usize + 20;
        let values_len = self.dimension * std::mem::size_of::<f32>();
        if values_start + values_len > mmap.len() {
            return Err(Error::CorruptHeader("slot points past end of data file".into()));
        }
        #[allow(clippy::cast_ptr_alignment)]
        let ptr = unsafe { mmap.as_ptr().add(values_start).cast::<f32>() };
        let epoch_at_creation = self.remap_epoch.load(Ordering::Acquire);
        Ok(Some(VectorSliceGuard {
            _guard: mmap,
            ptr,
            len: self.dimension,
            epoch_ptr: &self.remap_epoch,
            epoch_at_creation,
        }))
    }

    /// Returns `true` if `id` is currently present (not tombstoned).
    #[must_use]
    pub fn contains(&self, id: VectorId) -> bool {
        self.index.contains(id.0)
    }

    /// Number of live (non-tombstoned) records.
    #[must_use]
    pub fn count(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Returns every live record, in unspecified order.
    pub fn iterate_live(&self) -> Result<Vec<VectorRecord>> {
        let mut out = Vec::with_capacity(self.index.len());
        for (id, _) in self.index.entries() {
            if let Some(record) = self.get(VectorId::from_u128(id))? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Fraction of allocated slots that are tombstoned, in `[0, 1]`.
    #[must_use]
    pub fn fragmentation_ratio(&self) -> f64 {
        let total = self.slot_count.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let live = self.index.len();
        1.0 - (live as f64 / total as f64)
    }

    /// Rewrites up to `batch_limit` live records into fresh, tightly packed
    /// slots, reclaiming space held by tombstoned entries. Bounded per call
    /// so a caller can spread defragmentation across several ticks instead
    /// of pausing on one large pass.
    ///
    /// Returns the number of records relocated.
    pub fn defragment(&mut self, batch_limit: usize) -> Result<usize> {
        let mut relocated = 0usize;
        let ids: Vec<u128> = {
            let total = self.slot_count.load(Ordering::Relaxed);
            let mut stale = Vec::new();
            for slot_index in 0..total {
                let slot = self.read_slot(slot_index);
                if !slot.is_tombstoned() {
                    if let Some(current) = self.index.get(slot.id) {
                        if current == slot_index {
                            // still the authoritative slot for this id; only
                            // relocate if it isn't already at the tail of a
                            // compacted run (we relocate unconditionally up
                            // to batch_limit, simplest bounded strategy).
                            stale.push(slot.id);
                        }
                    }
                }
                if stale.len() >= batch_limit {
                    break;
                }
            }
            stale
        };

        for raw_id in ids {
            let id = VectorId::from_u128(raw_id);
            if let Some(record) = self.get(id)? {
                let bytes = record.to_binary()?;
                if let Some(old_slot_index) = self.index.get(raw_id) {
                    let mut old = self.read_slot(old_slot_index);
                    old.flags |= TOMBSTONE_BIT;
                    self.write_slot(old_slot_index, &old)?;
                }
                self.apply_put(id, &bytes)?;
                relocated += 1;
            }
        }
        Ok(relocated)
    }

    /// Flushes both memory maps, rewrites both headers' `modified_at`, and
    /// truncates the WAL, marking the store clean. Safe to call repeatedly.
    pub fn save(&mut self) -> Result<()> {
        let now = now_secs();
        {
            let mut mmap = self.slot_mmap.write();
            let mut header = FileHeader::decode(&mmap[0..FileHeader::len()])?;
            header.touch(now);
            mmap[0..FileHeader::len()].copy_from_slice(&header.encode());
            mmap.flush()?;
        }
        {
            let mut mmap = self.data_mmap.write();
            let mut header = FileHeader::decode(&mmap[0..FileHeader::len()])?;
            header.touch(now);
            mmap[0..FileHeader::len()].copy_from_slice(&header.encode());
            mmap.flush()?;
        }
        self.wal.lock().truncate()?;
        Ok(())
    }

    /// Reopens the store at `path`, replaying any WAL entries left by an
    /// unclean shutdown.
    pub fn load(path: impl AsRef<Path>, dimension: usize) -> Result<Self> {
        Self::open(path, dimension)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        if let Some(mut mmap) = self.slot_mmap.try_write() {
            if let Err(err) = mmap.flush() {
                tracing::error!(?err, "failed to flush slot mmap on drop");
            }
        }
        if let Some(mut mmap) = self.data_mmap.try_write() {
            if let Err(err) = mmap.flush() {
                tracing::error!(?err, "failed to flush data mmap on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(values: Vec<f32>) -> VectorRecord {
        VectorRecord::new(values)
    }

    #[test]
    fn add_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 3).unwrap();
        let id = store.add(rec(vec![1.0, 2.0, 3.0])).unwrap();
        let fetched = store.get(id).unwrap().unwrap();
        assert_eq!(fetched.values, vec![1.0, 2.0, 3.0]);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn remove_makes_it_disappear() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 2).unwrap();
        let id = store.add(rec(vec![1.0, 1.0])).unwrap();
        assert!(store.remove(id).unwrap());
        assert!(store.get(id).unwrap().is_none());
        assert!(!store.contains(id));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn remove_missing_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 2).unwrap();
        assert!(!store.remove(VectorId::new()).unwrap());
    }

    #[test]
    fn update_preserves_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 2).unwrap();
        let id = store.add(rec(vec![1.0, 1.0])).unwrap();
        store.update(id, rec(vec![9.0, 9.0])).unwrap();
        let fetched = store.get(id).unwrap().unwrap();
        assert_eq!(fetched.values, vec![9.0, 9.0]);
        assert_eq!(fetched.id, Some(id));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 3).unwrap();
        assert!(matches!(
            store.add(rec(vec![1.0, 2.0])),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn reopen_recovers_live_records() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = VectorStore::open(dir.path(), 2).unwrap();
            let id = store.add(rec(vec![4.0, 5.0])).unwrap();
            store.save().unwrap();
            id
        };
        let store = VectorStore::open(dir.path(), 2).unwrap();
        assert_eq!(store.get(id).unwrap().unwrap().values, vec![4.0, 5.0]);
    }

    #[test]
    fn reopen_replays_wal_without_save() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = VectorStore::open(dir.path(), 2).unwrap();
            store.add(rec(vec![1.0, 2.0])).unwrap()
        };
        // Dropped without calling save(); WAL entries should replay on reopen.
        let store = VectorStore::open(dir.path(), 2).unwrap();
        assert_eq!(store.count(), 1);
        assert!(store.get(id).unwrap().is_some());
    }

    #[test]
    fn zero_copy_values_match_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 4).unwrap();
        let id = store.add(rec(vec![1.0, 2.0, 3.0, 4.0])).unwrap();
        let guard = store.get_values_ref(id).unwrap().unwrap();
        assert_eq!(&*guard, &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn defragment_preserves_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 2).unwrap();
        let mut ids = Vec::new();
        for i in 0..10 {
            ids.push(store.add(rec(vec![i as f32, i as f32])).unwrap());
        }
        for id in ids.iter().step_by(2) {
            store.remove(*id).unwrap();
        }
        let relocated = store.defragment(100).unwrap();
        assert!(relocated > 0);
        for id in ids.iter().skip(1).step_by(2) {
            assert!(store.get(*id).unwrap().is_some());
        }
    }

    #[test]
    fn iterate_live_matches_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = VectorStore::open(dir.path(), 2).unwrap();
        for i in 0..5 {
            store.add(rec(vec![i as f32, 0.0])).unwrap();
        }
        let live = store.iterate_live().unwrap();
        assert_eq!(live.len(), store.count());
    }
}
