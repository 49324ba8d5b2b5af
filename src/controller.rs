//! Typed views over the mapped Info and Data segments, and the per-process
//! controller composing them.
//!
//! The views mediate every access to shared state: getters return the
//! committed A/B half, setters stage into the pending half and are only
//! legal inside a transaction, and a commit is the single-byte selector
//! flip. Nothing outside this module touches the raw mappings.

use std::mem;

use crate::error::Error;
use crate::layout::{BucketRecord, BucketState, InfoRecord};
use crate::shm::SharedSegment;

/// Window onto the info segment of a table.
pub struct InfoView {
    seg: SharedSegment,
    txn: bool,
}

impl InfoView {
    pub fn new(seg: SharedSegment) -> Result<Self, Error> {
        if seg.len() < mem::size_of::<InfoRecord>() {
            return Err(Error::InvalidState("info segment is too small"));
        }
        Ok(Self { seg, txn: false })
    }

    fn record(&self) -> &InfoRecord {
        unsafe { &*(self.seg.as_ptr() as *const InfoRecord) }
    }

    fn record_mut(&mut self) -> &mut InfoRecord {
        unsafe { &mut *(self.seg.as_ptr() as *mut InfoRecord) }
    }

    /// Whether mapping this view created the underlying segment.
    pub fn created(&self) -> bool {
        self.seg.created()
    }

    /// Creator-only: write the initial parameters into both halves.
    pub fn init(&mut self, capacity: usize) {
        self.record_mut().init(capacity);
    }

    pub fn capacity(&self) -> usize {
        self.record().capacity()
    }

    pub fn size(&self) -> usize {
        self.record().size()
    }

    pub fn resize_count(&self) -> usize {
        self.record().resize_count()
    }

    /// Stage the committed record into the pending half. Restarting an
    /// already-open transaction restages, discarding earlier staged
    /// writes; failure paths therefore never poison the view.
    pub fn start_transaction(&mut self) {
        self.record_mut().stage();
        self.txn = true;
    }

    pub fn set_capacity(&mut self, value: usize) -> Result<(), Error> {
        self.require_txn()?;
        self.record_mut().set_capacity(value);
        Ok(())
    }

    pub fn set_size(&mut self, value: usize) -> Result<(), Error> {
        self.require_txn()?;
        self.record_mut().set_size(value);
        Ok(())
    }

    pub fn set_resize_count(&mut self, value: usize) -> Result<(), Error> {
        self.require_txn()?;
        self.record_mut().set_resize_count(value);
        Ok(())
    }

    pub fn commit(&mut self) -> Result<(), Error> {
        self.require_txn()?;
        self.record().commit();
        self.txn = false;
        Ok(())
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.seg
    }

    fn require_txn(&self) -> Result<(), Error> {
        if self.txn {
            Ok(())
        } else {
            Err(Error::InvalidState("no open info transaction"))
        }
    }
}

/// Window onto one generation's data segment: `capacity` bucket records.
pub struct DataView {
    seg: SharedSegment,
    capacity: usize,
    txn: Option<usize>,
}

impl DataView {
    pub fn new(seg: SharedSegment, capacity: usize) -> Result<Self, Error> {
        if seg.len() < capacity * mem::size_of::<BucketRecord>() {
            return Err(Error::InvalidState("data segment is too small"));
        }
        Ok(Self {
            seg,
            capacity,
            txn: None,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn bucket(&self, index: usize) -> Result<&BucketRecord, Error> {
        if index >= self.capacity {
            return Err(Error::InvalidState("bucket index out of range"));
        }
        Ok(unsafe { &*(self.seg.as_ptr() as *const BucketRecord).add(index) })
    }

    fn bucket_mut(&mut self, index: usize) -> Result<&mut BucketRecord, Error> {
        if index >= self.capacity {
            return Err(Error::InvalidState("bucket index out of range"));
        }
        Ok(unsafe { &mut *(self.seg.as_ptr() as *mut BucketRecord).add(index) })
    }

    pub fn state(&self, index: usize) -> Result<BucketState, Error> {
        Ok(self.bucket(index)?.state())
    }

    pub fn key_bytes(&self, index: usize) -> Result<&[u8], Error> {
        Ok(self.bucket(index)?.key_bytes())
    }

    pub fn value(&self, index: usize) -> Result<&[u8], Error> {
        Ok(self.bucket(index)?.value())
    }

    pub fn key_matches(&self, index: usize, key: &[u8]) -> Result<bool, Error> {
        Ok(self.bucket(index)?.key_matches(key))
    }

    /// Stage bucket `index` for mutation; see
    /// [`InfoView::start_transaction`] for the restage semantics.
    pub fn start_transaction(&mut self, index: usize) -> Result<(), Error> {
        self.bucket_mut(index)?.stage();
        self.txn = Some(index);
        Ok(())
    }

    pub fn set_state(&mut self, index: usize, state: BucketState) -> Result<(), Error> {
        self.require_txn(index)?;
        self.bucket_mut(index)?.set_state(state);
        Ok(())
    }

    pub fn set_key(&mut self, index: usize, key: &[u8]) -> Result<(), Error> {
        self.require_txn(index)?;
        self.bucket_mut(index)?.set_key(key);
        Ok(())
    }

    pub fn set_value(&mut self, index: usize, value: &[u8]) -> Result<(), Error> {
        self.require_txn(index)?;
        self.bucket_mut(index)?.set_value(value);
        Ok(())
    }

    pub fn commit(&mut self, index: usize) -> Result<(), Error> {
        self.require_txn(index)?;
        self.bucket(index)?.commit();
        self.txn = None;
        Ok(())
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.seg
    }

    fn require_txn(&self, index: usize) -> Result<(), Error> {
        if self.txn == Some(index) {
            Ok(())
        } else {
            Err(Error::InvalidState("no open transaction for this bucket"))
        }
    }
}

/// Per-process, non-shared holder of the mapped info segment and exactly
/// one generation's data segment.
pub struct Controller {
    info: InfoView,
    data: DataView,
}

impl Controller {
    pub fn new(info: InfoView, data: DataView) -> Self {
        Self { info, data }
    }

    pub fn info(&self) -> &InfoView {
        &self.info
    }

    pub fn info_mut(&mut self) -> &mut InfoView {
        &mut self.info
    }

    pub fn data(&self) -> &DataView {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DataView {
        &mut self.data
    }

    /// Install the data view of a newer generation; the caller decides
    /// what to do with the returned old view.
    pub fn swap_data(&mut self, new_data: DataView) -> DataView {
        mem::replace(&mut self.data, new_data)
    }
}
