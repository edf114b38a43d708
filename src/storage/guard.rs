//! Zero-copy read guard over vector bytes living in a memory map.

use crate::error::{Error, Result};
use memmap2::MmapMut;
use parking_lot::RwLockReadGuard;
use std::sync::atomic::{AtomicU64, Ordering};

/// Borrowed view of one vector's `f32` components directly inside the
/// backing memory map. Holds a read lock on the map for its lifetime and
/// validates against a remap epoch on every access, since a concurrent
/// `ensure_capacity` remap invalidates any pointer taken before it.
pub struct VectorSliceGuard<'a> {
    pub(super) _guard: RwLockReadGuard<'a, MmapMut>,
    pub(super) ptr: *const f32,
    pub(super) len: usize,
    pub(super) epoch_ptr: &'a AtomicU64,
    pub(super) epoch_at_creation: u64,
}

// SAFETY: the guard exposes read-only data; the read lock pins the mapping
// and the epoch check rejects any pointer taken before a remap.
unsafe impl Send for VectorSliceGuard<'_> {}
unsafe impl Sync for VectorSliceGuard<'_> {}

impl VectorSliceGuard<'_> {
    /// Returns the guarded vector as a slice, or `Error::EpochMismatch` if
    /// the backing map was remapped since this guard was created.
    #[inline]
    pub fn as_slice(&self) -> Result<&[f32]> {
        let current = self.epoch_ptr.load(Ordering::Acquire);
        if current != self.epoch_at_creation {
            return Err(Error::EpochMismatch(
                "backing mmap was remapped; guard is stale".into(),
            ));
        }
        // SAFETY: ptr/len were derived from this same mapping at construction,
        // and the epoch check above proves no remap has happened since.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr, self.len) })
    }
}

impl std::ops::Deref for VectorSliceGuard<'_> {
    type Target = [f32];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice().expect("epoch mismatch in Deref")
    }
}
