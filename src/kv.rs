//! The public table façade.
//!
//! An [`IpcKv`] is a per-process handle onto a named table whose state
//! lives entirely in shared memory. Every operation acquires the
//! cross-process lock for the generation this handle last observed, then
//! runs a staleness check: if another process resized the table in the
//! meantime, the handle lazily re-maps the new data segment before doing
//! any work.

use std::mem;

use lazy_static::lazy_static;
use regex::Regex;

use crate::controller::{Controller, DataView, InfoView};
use crate::error::Error;
use crate::hash::{self, ProbeSequence};
use crate::layout::{
    self, BucketRecord, BucketState, InfoRecord, DATA_SIZE, INITIAL_CAPACITY, KEY_SIZE,
    MAX_LOAD_FACTOR,
};
use crate::lock::{self, IpcLock, LockMode};
use crate::shm::SharedSegment;

lazy_static! {
    // Table names are embedded into shared memory object names, where '/'
    // is a separator and a leading dot hides the file.
    static ref TABLE_NAME_REGEX: Regex = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap();
}

// Bound on waiting for the creating process to finish initialising a
// brand-new info segment we attached to.
const INIT_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);
const INIT_POLL_ATTEMPTS: u32 = 100;

/// A named, cross-process key/value table.
pub struct IpcKv {
    name: String,
    controller: Controller,
    cached_resize_count: usize,
}

impl IpcKv {
    /// Open the table `name`, creating it if this is the first opener on
    /// the host.
    pub fn open(name: &str) -> Result<Self, Error> {
        check_table_name(name)?;

        let info_name = layout::info_segment_name(name)?;
        let info_seg = SharedSegment::open_or_create(&info_name, mem::size_of::<InfoRecord>())?;
        let mut info = InfoView::new(info_seg)?;

        if info.created() {
            info.init(INITIAL_CAPACITY);
            log::info!("initialized table '{}'", name);
        } else {
            wait_for_init(&info, &info_name)?;
        }

        let generation = info.resize_count();
        let capacity = info.capacity();
        let data_seg = SharedSegment::open_or_create(
            &layout::data_segment_name(generation, name)?,
            capacity * mem::size_of::<BucketRecord>(),
        )?;
        let data = DataView::new(data_seg, capacity)?;

        Ok(Self {
            name: name.to_string(),
            controller: Controller::new(info, data),
            cached_resize_count: generation,
        })
    }

    /// Insert or overwrite `key`. Resizes first when the table is at or
    /// above the load factor bound.
    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), Error> {
        if value.len() >= DATA_SIZE {
            return Err(Error::ValueTooLong(value.len()));
        }
        if key.len() >= KEY_SIZE - 1 {
            return Err(Error::KeyTooLong(key.len()));
        }

        let _lock = self.lock(LockMode::Write)?;
        self.refresh_mapping()?;

        if self.load_factor() >= MAX_LOAD_FACTOR {
            self.resize()?;
        }

        let capacity = self.controller.data().capacity();
        let hash = hash::hash_key(key.as_bytes());
        for bucket in ProbeSequence::new(hash, capacity) {
            let state = self.controller.data().state(bucket)?;
            if state == BucketState::Occupied
                && !self.controller.data().key_matches(bucket, key.as_bytes())?
            {
                log::debug!("collision: '{}' -> bucket {}", key, bucket);
                continue;
            }

            let data = self.controller.data_mut();
            data.start_transaction(bucket)?;
            data.set_key(bucket, key.as_bytes())?;
            data.set_value(bucket, value)?;
            data.set_state(bucket, BucketState::Occupied)?;
            data.commit(bucket)?;

            if state != BucketState::Occupied {
                let info = self.controller.info_mut();
                info.start_transaction();
                let size = info.size();
                info.set_size(size + 1)?;
                info.commit()?;
            }
            return Ok(());
        }

        // Unreachable while the load factor invariant holds.
        Err(Error::InsertFailed)
    }

    /// Look up `key`, returning a copy of its committed value.
    pub fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let _lock = self.lock(LockMode::Read)?;
        self.refresh_mapping()?;

        let data = self.controller.data();
        let hash = hash::hash_key(key.as_bytes());
        for bucket in ProbeSequence::new(hash, data.capacity()) {
            match data.state(bucket)? {
                // An empty slot ends every probe chain the key could be
                // on; tombstones keep chains traversable.
                BucketState::Empty => return Ok(None),
                BucketState::Occupied if data.key_matches(bucket, key.as_bytes())? => {
                    return Ok(Some(data.value(bucket)?.to_vec()));
                }
                _ => {}
            }
        }
        Ok(None)
    }

    /// Remove `key`, leaving a tombstone. Returns whether a key was
    /// removed.
    pub fn remove(&mut self, key: &str) -> Result<bool, Error> {
        let _lock = self.lock(LockMode::Write)?;
        self.refresh_mapping()?;

        let capacity = self.controller.data().capacity();
        let hash = hash::hash_key(key.as_bytes());
        for bucket in ProbeSequence::new(hash, capacity) {
            match self.controller.data().state(bucket)? {
                BucketState::Empty => return Ok(false),
                BucketState::Occupied
                    if self.controller.data().key_matches(bucket, key.as_bytes())? =>
                {
                    let data = self.controller.data_mut();
                    data.start_transaction(bucket)?;
                    data.set_state(bucket, BucketState::Deleted)?;
                    data.commit(bucket)?;

                    let info = self.controller.info_mut();
                    info.start_transaction();
                    let size = info.size();
                    info.set_size(size.saturating_sub(1))?;
                    info.commit()?;
                    return Ok(true);
                }
                _ => {}
            }
        }
        Ok(false)
    }

    /// Drop every entry. Capacity and generation are unchanged.
    pub fn clear(&mut self) -> Result<(), Error> {
        let _lock = self.lock(LockMode::Write)?;
        self.refresh_mapping()?;

        let capacity = self.controller.data().capacity();
        let mut removed = 0;
        for bucket in 0..capacity {
            if self.controller.data().state(bucket)? != BucketState::Occupied {
                continue;
            }
            let data = self.controller.data_mut();
            data.start_transaction(bucket)?;
            data.set_state(bucket, BucketState::Deleted)?;
            data.commit(bucket)?;
            removed += 1;
        }

        // One combined transaction publishes the new count; this also
        // normalises a count left behind by a crashed writer.
        if removed > 0 || self.controller.info().size() != 0 {
            let info = self.controller.info_mut();
            info.start_transaction();
            info.set_size(0)?;
            info.commit()?;
        }
        Ok(())
    }

    /// Number of occupied buckets.
    pub fn size(&mut self) -> Result<usize, Error> {
        let _lock = self.lock(LockMode::Read)?;
        self.refresh_mapping()?;
        Ok(self.controller.info().size())
    }

    /// Diagnostic dump of the committed table state to stdout.
    pub fn print(&mut self) -> Result<(), Error> {
        let _lock = self.lock(LockMode::Read)?;
        self.refresh_mapping()?;

        let data = self.controller.data();
        for bucket in 0..data.capacity() {
            if data.state(bucket)? == BucketState::Occupied {
                println!(
                    "[{}] {} {:#x}",
                    bucket,
                    String::from_utf8_lossy(data.key_bytes(bucket)?),
                    data.value(bucket)?.len()
                );
            }
        }

        let info = self.controller.info();
        println!(
            "capacity {}, size {}, resizes {}, load factor {:.2}",
            info.capacity(),
            info.size(),
            info.resize_count(),
            self.load_factor()
        );
        Ok(())
    }

    /// Remove the table's named objects from the host. Existing handles
    /// in other processes keep working on their mappings but can no
    /// longer be re-opened by name; the caller is expected to be the last
    /// user.
    pub fn destroy(self) -> Result<(), Error> {
        let generation = self.controller.info().resize_count();

        crate::shm::unlink_segment(&layout::data_segment_name(generation, &self.name)?)?;
        if generation != self.cached_resize_count {
            // This handle still maps an older generation; its name is
            // normally gone already, but don't rely on the resizer.
            self.controller.data().segment().unlink()?;
        }
        self.controller.info().segment().unlink()?;
        lock::unlink_lock(&layout::rw_lock_name(generation, &self.name)?)?;
        Ok(())
    }

    fn lock(&self, mode: LockMode) -> Result<IpcLock, Error> {
        let lock_name = layout::rw_lock_name(self.cached_resize_count, &self.name)?;
        IpcLock::acquire(mode, &lock_name)
    }

    /// Staleness check: re-map the data segment if some other process
    /// advanced the generation since this handle last looked.
    fn refresh_mapping(&mut self) -> Result<(), Error> {
        let committed = self.controller.info().resize_count();
        if committed == self.cached_resize_count {
            return Ok(());
        }

        log::debug!(
            "table '{}' moved to generation {}, re-mapping",
            self.name,
            committed
        );

        let stale_lock = layout::rw_lock_name(self.cached_resize_count, &self.name)?;

        let capacity = self.controller.info().capacity();
        let seg = SharedSegment::open_or_create(
            &layout::data_segment_name(committed, &self.name)?,
            capacity * mem::size_of::<BucketRecord>(),
        )?;
        let data = DataView::new(seg, capacity)?;
        // The old view just unmaps; its name belongs to the resizer.
        drop(self.controller.swap_data(data));
        self.cached_resize_count = committed;

        // The resizer already removed the old generation's lock names; if
        // acquiring the stale lock above re-created them, take them down
        // again. Our held handle survives the unlink.
        let _ = lock::unlink_lock(&stale_lock);
        Ok(())
    }

    fn load_factor(&self) -> f64 {
        let info = self.controller.info();
        info.size() as f64 / info.capacity() as f64
    }

    /// Grow to the next prime above twice the capacity and move to the
    /// next generation. The caller holds the write lock.
    fn resize(&mut self) -> Result<(), Error> {
        let old_capacity = self.controller.info().capacity();
        let old_generation = self.controller.info().resize_count();
        let new_capacity = hash::next_prime(2 * old_capacity);
        let new_generation = old_generation + 1;

        log::info!(
            "resizing table '{}': {} -> {} buckets, generation {}",
            self.name,
            old_capacity,
            new_capacity,
            new_generation
        );

        // Stage the new parameters now; they publish only after every
        // entry is in place in the new segment, so readers on the old
        // generation never observe a claimed-but-empty table.
        self.controller.info_mut().start_transaction();
        self.controller.info_mut().set_capacity(new_capacity)?;
        self.controller.info_mut().set_resize_count(new_generation)?;

        let seg = SharedSegment::open_or_create(
            &layout::data_segment_name(new_generation, &self.name)?,
            new_capacity * mem::size_of::<BucketRecord>(),
        )?;
        let mut new_data = DataView::new(seg, new_capacity)?;

        for bucket in 0..old_capacity {
            if self.controller.data().state(bucket)? != BucketState::Occupied {
                continue;
            }
            let key = self.controller.data().key_bytes(bucket)?;
            let value = self.controller.data().value(bucket)?;
            insert_fresh(&mut new_data, key, value)?;
        }

        // Publication point.
        self.controller.info_mut().commit()?;

        let old_data = self.controller.swap_data(new_data);
        if let Err(err) = old_data.segment().unlink() {
            log::warn!("abandoning old data segment failed - {}", err);
        }
        drop(old_data);

        // Stale-generation waiters keep their handles; only the names go.
        if let Err(err) = lock::unlink_lock(&layout::rw_lock_name(old_generation, &self.name)?) {
            log::warn!("abandoning old lock failed - {}", err);
        }

        self.cached_resize_count = new_generation;
        Ok(())
    }
}

/// Insert into a freshly created segment during a resize. Every slot the
/// probe visits is `Empty` or `Occupied`; no tombstones exist yet.
fn insert_fresh(data: &mut DataView, key: &[u8], value: &[u8]) -> Result<(), Error> {
    let capacity = data.capacity();
    for bucket in ProbeSequence::new(hash::hash_key(key), capacity) {
        if data.state(bucket)? == BucketState::Occupied {
            continue;
        }
        data.start_transaction(bucket)?;
        data.set_key(bucket, key)?;
        data.set_value(bucket, value)?;
        data.set_state(bucket, BucketState::Occupied)?;
        data.commit(bucket)?;
        return Ok(());
    }
    Err(Error::InsertFailed)
}

fn wait_for_init(info: &InfoView, info_name: &str) -> Result<(), Error> {
    for _ in 0..INIT_POLL_ATTEMPTS {
        if info.capacity() != 0 {
            return Ok(());
        }
        std::thread::sleep(INIT_POLL_INTERVAL);
    }
    Err(Error::SegmentUnavailable {
        name: info_name.to_string(),
        msg: "creator never initialized the table".to_string(),
    })
}

fn check_table_name(name: &str) -> Result<(), Error> {
    if TABLE_NAME_REGEX.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_validation() {
        assert!(check_table_name("test").is_ok());
        assert!(check_table_name("demo-2.cache_A").is_ok());

        assert!(check_table_name("").is_err());
        assert!(check_table_name("has/slash").is_err());
        assert!(check_table_name(".hidden").is_err());
        assert!(check_table_name("white space").is_err());
    }
}
