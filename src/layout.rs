//! Binary layout of the shared Info and Data segments, and the wire-level
//! object names derived from a table name.
//!
//! Any process attaching to an existing table must agree on everything in
//! this module: the record field order, `KEY_SIZE`, `DATA_SIZE`, the A/B
//! buffering discipline and the name scheme. Segments use native alignment
//! with no extra padding assumptions, so all participants must be built for
//! the same ABI.
//!
//! Every mutable field is double buffered: readers use the half selected by
//! the committed `buffer_state`, writers stage into the other half and
//! publish by flipping the selector. The flip is a single-byte release
//! store, so a process dying mid-transaction leaves the committed half
//! untouched.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::Error;

/// Bucket key capacity, including the NUL terminator.
pub const KEY_SIZE: usize = 260;
/// Bucket value capacity in bytes.
pub const DATA_SIZE: usize = 2048;
/// Bucket count of a freshly created table.
pub const INITIAL_CAPACITY: usize = 10;
/// A committed `set` keeps `size / capacity` below this bound.
pub const MAX_LOAD_FACTOR: f64 = 0.6;

/// Occupancy of one bucket slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BucketState {
    Empty,
    Deleted,
    Occupied,
}

impl BucketState {
    /// Decode a raw state byte. Total: unknown bytes read as `Empty`, so a
    /// torn segment can never produce an invalid enum value.
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => BucketState::Deleted,
            2 => BucketState::Occupied,
            _ => BucketState::Empty,
        }
    }

    pub fn as_raw(self) -> u8 {
        match self {
            BucketState::Empty => 0,
            BucketState::Deleted => 1,
            BucketState::Occupied => 2,
        }
    }
}

/// Table metadata, one record per info segment.
///
/// A zero-filled segment is a valid (uninitialised) record; the creating
/// process calls [`InfoRecord::init`] before anyone relies on it.
#[repr(C)]
pub struct InfoRecord {
    buffer_state: AtomicU8,
    capacity: [usize; 2],
    size: [usize; 2],
    resize_count: [usize; 2],
}

impl InfoRecord {
    /// Write the initial table parameters into both halves. Creator only.
    pub fn init(&mut self, capacity: usize) {
        self.capacity = [capacity; 2];
        self.size = [0; 2];
        self.resize_count = [0; 2];
        self.buffer_state.store(0, Ordering::Release);
    }

    fn committed(&self) -> usize {
        (self.buffer_state.load(Ordering::Acquire) & 1) as usize
    }

    fn pending(&self) -> usize {
        self.committed() ^ 1
    }

    pub fn capacity(&self) -> usize {
        self.capacity[self.committed()]
    }

    pub fn size(&self) -> usize {
        self.size[self.committed()]
    }

    pub fn resize_count(&self) -> usize {
        self.resize_count[self.committed()]
    }

    /// Copy every committed field into the pending half, so a transaction
    /// that updates only some fields still commits a consistent record.
    pub fn stage(&mut self) {
        let c = self.committed();
        let p = c ^ 1;
        self.capacity[p] = self.capacity[c];
        self.size[p] = self.size[c];
        self.resize_count[p] = self.resize_count[c];
    }

    pub fn set_capacity(&mut self, value: usize) {
        let p = self.pending();
        self.capacity[p] = value;
    }

    pub fn set_size(&mut self, value: usize) {
        let p = self.pending();
        self.size[p] = value;
    }

    pub fn set_resize_count(&mut self, value: usize) {
        let p = self.pending();
        self.resize_count[p] = value;
    }

    /// Publish the pending half. The release store orders every staged
    /// write before the flip becomes observable.
    pub fn commit(&self) {
        self.buffer_state
            .store(self.pending() as u8, Ordering::Release);
    }
}

/// One bucket slot. The data segment is a flat array of these.
#[repr(C)]
pub struct BucketRecord {
    buffer_state: AtomicU8,
    state: [u8; 2],
    key: [[u8; KEY_SIZE]; 2],
    value: [[u8; DATA_SIZE]; 2],
    size: [usize; 2],
}

impl BucketRecord {
    fn committed(&self) -> usize {
        (self.buffer_state.load(Ordering::Acquire) & 1) as usize
    }

    fn pending(&self) -> usize {
        self.committed() ^ 1
    }

    pub fn state(&self) -> BucketState {
        BucketState::from_raw(self.state[self.committed()])
    }

    /// Committed key bytes, up to the NUL terminator.
    pub fn key_bytes(&self) -> &[u8] {
        let key = &self.key[self.committed()];
        let end = key.iter().position(|&b| b == 0).unwrap_or(KEY_SIZE);
        &key[..end]
    }

    /// Committed value bytes. The stored length is clamped to `DATA_SIZE`
    /// so a corrupt count cannot produce an out-of-bounds slice.
    pub fn value(&self) -> &[u8] {
        let c = self.committed();
        let len = self.size[c].min(DATA_SIZE);
        &self.value[c][..len]
    }

    pub fn key_matches(&self, key: &[u8]) -> bool {
        if key.len() >= KEY_SIZE {
            return false;
        }
        let stored = &self.key[self.committed()];
        stored[..key.len()] == *key && stored[key.len()] == 0
    }

    pub fn stage(&mut self) {
        let c = self.committed();
        let p = c ^ 1;
        self.state[p] = self.state[c];
        self.key[p] = self.key[c];
        self.value[p] = self.value[c];
        self.size[p] = self.size[c];
    }

    pub fn set_state(&mut self, state: BucketState) {
        let p = self.pending();
        self.state[p] = state.as_raw();
    }

    /// Stage a key into the pending half, NUL-terminated. The caller has
    /// already enforced `key.len() < KEY_SIZE - 1`.
    pub fn set_key(&mut self, key: &[u8]) {
        debug_assert!(key.len() < KEY_SIZE);
        let p = self.pending();
        self.key[p][..key.len()].copy_from_slice(key);
        self.key[p][key.len()] = 0;
    }

    /// Stage a value into the pending half. The caller has already enforced
    /// `value.len() < DATA_SIZE`.
    pub fn set_value(&mut self, value: &[u8]) {
        debug_assert!(value.len() <= DATA_SIZE);
        let p = self.pending();
        self.value[p][..value.len()].copy_from_slice(value);
        self.size[p] = value.len();
    }

    pub fn commit(&self) {
        self.buffer_state
            .store(self.pending() as u8, Ordering::Release);
    }
}

/// Name of the info segment for a table.
pub fn info_segment_name(table: &str) -> Result<String, Error> {
    check_segment_name(format!("ipckv_i_{}", table))
}

/// Name of the data segment for one generation of a table.
pub fn data_segment_name(generation: usize, table: &str) -> Result<String, Error> {
    check_segment_name(format!("ipckv_{}_{}", generation, table))
}

/// Name of the RW lock for one generation of a table. The lock layer
/// derives the semaphore and mutex object names from it.
pub fn rw_lock_name(generation: usize, table: &str) -> Result<String, Error> {
    let name = format!("{}_{}", generation, table);
    if name.len() > crate::lock::LOCK_NAME_MAX {
        return Err(Error::NameTooLong(name));
    }
    Ok(name)
}

fn check_segment_name(name: String) -> Result<String, Error> {
    if name.len() > crate::shm::SEGMENT_NAME_MAX {
        return Err(Error::NameTooLong(name));
    }
    Ok(name)
}
