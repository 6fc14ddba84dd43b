//! The `region` module owns the shared database: a fixed number of `i32` slots kept in a POSIX
//! shared memory object, preceded by the header of the chosen lock placement.
//!
//! Every process that maps the region sees the same slots. Writers go through [`WriteGuard`],
//! which holds the writer lock for as long as it lives. Readers call [`SharedRegion::read`]
//! without taking any lock: slots are word-sized atomics, so a read may observe a stale value
//! but never a torn one. The missing reader synchronization is part of what this crate
//! demonstrates, not an oversight.
use std::fs::File;
use std::io;
use std::slice;
use std::sync::atomic::{AtomicI32, Ordering};

use log::{debug, info};
use memmap2::MmapMut;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use rand::Rng;
use rand_distr::Uniform;
use thiserror::Error;

use crate::guard::WriteGuard;
use crate::locks::{LockStrategy, LockStrategySealed};
use crate::names::ObjectNames;
use crate::region::DatabaseError::*;

/// Number of slots used when nothing else is configured
pub const DEFAULT_CAPACITY: usize = 10;
/// Smallest value ever stored in a slot
pub const VALUE_MIN: i32 = 1;
/// Largest value ever stored in a slot
pub const VALUE_MAX: i32 = 20;

const SLOT_SIZE: usize = std::mem::size_of::<AtomicI32>();

/// `DatabaseError` enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// At least one worker is required.
    #[error("invalid worker count {0}, at least one worker is required")]
    InvalidWorkerCount(usize),
    /// The region needs at least one slot.
    #[error("invalid capacity {0}, the region needs at least one slot")]
    InvalidCapacity(usize),
    /// The object name is not a valid POSIX object name.
    #[error("invalid object name {0:?}, expected '/' followed by a name without '/'")]
    InvalidName(String),
    /// A named object could not be created or sized, e.g. a leftover from a crashed run.
    #[error("shared object {0} unavailable: {1}")]
    ResourceUnavailable(String, io::Error),
    /// Mapping the shared memory object failed.
    #[error("error mapping shared region: {0}")]
    MappingFailed(io::Error),
    /// A semaphore operation failed.
    #[error("semaphore operation failed: {0}")]
    SemaphoreFailed(io::Error),
    /// A blocking semaphore wait was interrupted by a signal.
    #[error("semaphore wait interrupted by a signal")]
    Interrupted,
    /// Slot index outside of the region.
    #[error("index {0} out of bounds for capacity {1}")]
    IndexOutOfBounds(usize, usize),
    /// Value outside of the stored domain.
    #[error("value {0} outside of [1, 20]")]
    ValueOutOfDomain(i32),
    /// A named object could not be removed.
    #[error("error removing shared object {0}: {1}")]
    UnlinkFailed(String, io::Error),
    /// A worker process could not be forked.
    #[error("error spawning worker {0}: {1}")]
    SpawnFailed(usize, nix::Error),
    /// The interrupt handler could not be installed.
    #[error("error installing interrupt handler: {0}")]
    SignalSetup(nix::Error),
    /// Reaping a worker failed.
    #[error("error waiting for workers: {0}")]
    WaitFailed(nix::Error),
    /// A report could not be written.
    #[error("error writing report: {0}")]
    ReportFailed(io::Error),
    /// The region was already torn down.
    #[error("region already torn down")]
    TornDown,
}

/// Draw a value uniformly from `[VALUE_MIN, VALUE_MAX]`
#[inline]
pub fn random_value<R: Rng + ?Sized>(rng: &mut R) -> i32 {
    rng.sample(Uniform::new_inclusive(VALUE_MIN, VALUE_MAX))
}

/// `SharedRegion` is the database shared between all worker processes.
///
/// Template parameters:
///   - `L` - where the writer semaphore lives, see [`crate::locks`]
///
/// Forked children inherit the mapping. Only the creating process should call
/// [`SharedRegion::destroy`]; dropping a region just unmaps it from the calling process.
pub struct SharedRegion<L: LockStrategy> {
    /// Names of the shared memory object and the semaphore
    names: ObjectNames,
    /// Number of slots
    capacity: usize,
    /// First slot inside `mmap`
    slots: *const AtomicI32,
    /// Writer lock
    lock: L,
    /// Shared read-write mapping of the whole object
    mmap: MmapMut,
    /// Descriptor of the shared memory object
    file: File,
}

// SAFETY: `slots` points into `mmap`, which is owned by the region, and is only accessed through
// atomics.
unsafe impl<L: LockStrategy> Send for SharedRegion<L> {}
unsafe impl<L: LockStrategy> Sync for SharedRegion<L> {}

impl<L: LockStrategy> SharedRegion<L> {
    /// Create the shared memory object under `names`, size it for `capacity` slots plus the lock
    /// header, map it and create the writer lock.
    ///
    /// Creation is exclusive: an object left behind by a previous run is reported as
    /// `ResourceUnavailable` rather than reused, see [`SharedRegion::purge`].
    pub fn create_and_map(names: ObjectNames, capacity: usize) -> Result<Self, DatabaseError> {
        if capacity == 0 {
            return Err(InvalidCapacity(capacity));
        }
        let size = L::HEADER_SIZE + capacity * SLOT_SIZE;

        let fd = shm_open(
            names.region(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP,
        )
        .map_err(|errno| ResourceUnavailable(names.region().into(), errno.into()))?;
        let file = File::from(fd);

        let (mmap, slots, lock) = match Self::map(&names, &file, size) {
            Ok(mapped) => mapped,
            Err(err) => {
                // don't leave a half-built object behind
                if let Err(unlink_err) = unlink_region(&names) {
                    debug!("{unlink_err}");
                }
                return Err(err);
            }
        };

        info!(
            "created region {} ({} slots, {} bytes, {} semaphore)",
            names.region(),
            capacity,
            size,
            L::PLACEMENT
        );

        Ok(SharedRegion {
            names,
            capacity,
            slots,
            lock,
            mmap,
            file,
        })
    }

    /// Size the object to exactly `size` bytes, map it and create the lock in its header.
    fn map(
        names: &ObjectNames,
        file: &File,
        size: usize,
    ) -> Result<(MmapMut, *const AtomicI32, L), DatabaseError> {
        file.set_len(size as u64)
            .map_err(|err| ResourceUnavailable(names.region().into(), err))?;

        let mut mmap = unsafe { MmapMut::map_mut(file).map_err(MappingFailed)? };
        let base = mmap.as_mut_ptr();
        // SAFETY: the mapping is page aligned and at least `HEADER_SIZE` bytes long
        let lock = unsafe { L::create(names, base)? };
        let slots = unsafe { base.add(L::HEADER_SIZE) } as *const AtomicI32;

        Ok((mmap, slots, lock))
    }

    /// Fill every slot with a random value from the stored domain.
    ///
    /// Meant to run once, in the creating process, before any worker is forked. Running it
    /// again overwrites every slot.
    pub fn initialize<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        for slot in self.slots() {
            slot.store(random_value(rng), Ordering::Relaxed);
        }
    }

    /// Read slot `index` without taking the writer lock.
    ///
    /// The value may already be outdated when it is returned.
    #[inline]
    pub fn read(&self, index: usize) -> Result<i32, DatabaseError> {
        Ok(self.slot(index)?.load(Ordering::Relaxed))
    }

    /// Copy every slot, without taking the writer lock
    pub fn snapshot(&self) -> Vec<i32> {
        self.slots()
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Block until the writer lock is acquired.
    ///
    /// The lock is released when the returned guard is dropped.
    #[inline]
    pub fn lock(&self) -> Result<WriteGuard<'_, L>, DatabaseError> {
        WriteGuard::new(self)
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Names this region was created under
    #[inline]
    pub fn names(&self) -> &ObjectNames {
        &self.names
    }

    /// Size in bytes of the shared memory object
    #[inline]
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub(crate) fn lock_strategy(&self) -> &L {
        &self.lock
    }

    #[inline]
    pub(crate) fn slot(&self, index: usize) -> Result<&AtomicI32, DatabaseError> {
        self.slots()
            .get(index)
            .ok_or(IndexOutOfBounds(index, self.capacity))
    }

    #[inline]
    fn slots(&self) -> &[AtomicI32] {
        // SAFETY: `slots` points to `capacity` initialized, aligned slots inside `mmap`
        unsafe { slice::from_raw_parts(self.slots, self.capacity) }
    }

    /// Tear the region down: release the lock, unmap, close the descriptor and remove the
    /// named objects.
    ///
    /// Other processes keep a valid mapping until they unmap it themselves. Every step is
    /// attempted and objects that are already gone are skipped, so racing with another cleanup
    /// is harmless. The first failure is returned.
    pub fn destroy(self) -> Result<(), DatabaseError> {
        let SharedRegion {
            names,
            lock,
            mmap,
            file,
            ..
        } = self;

        // the embedded semaphore lives in the mapping, de-initialize it before unmapping
        let lock_destroyed = lock.destroy(&names);
        drop(mmap);
        drop(file);
        let unlinked = unlink_region(&names);

        info!("removed region {}", names.region());
        lock_destroyed.and(unlinked)
    }

    /// Remove the objects a previous run left behind under `names`, without mapping them.
    ///
    /// Missing objects are skipped.
    pub fn purge(names: &ObjectNames) -> Result<(), DatabaseError> {
        let region = unlink_region(names);
        let lock = L::unlink(names);
        region.and(lock)
    }
}

fn unlink_region(names: &ObjectNames) -> Result<(), DatabaseError> {
    match shm_unlink(names.region()) {
        Ok(()) => Ok(()),
        Err(Errno::ENOENT) => {
            debug!("region {} already removed", names.region());
            Ok(())
        }
        Err(errno) => Err(UnlinkFailed(names.region().into(), errno.into())),
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::locks::{EmbeddedSemaphore, NamedSemaphore};
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::fs;

    fn names<L: LockStrategy>(test: &str) -> ObjectNames {
        let names = ObjectNames::new(format!(
            "/shmdb_region_{test}_{}_{}",
            L::PLACEMENT,
            std::process::id()
        ))
        .unwrap();
        SharedRegion::<L>::purge(&names).unwrap();
        names
    }

    fn assert_in_domain(values: &[i32]) {
        for value in values {
            assert!((VALUE_MIN..=VALUE_MAX).contains(value), "{value} escaped");
        }
    }

    fn initialize_fills_domain<L: LockStrategy>() {
        let mut rng = StdRng::seed_from_u64(7);
        for capacity in [1, 2, DEFAULT_CAPACITY, 257] {
            let names = names::<L>(&format!("init_{capacity}"));
            let mut region = SharedRegion::<L>::create_and_map(names.clone(), capacity).unwrap();
            assert_eq!(region.capacity(), capacity);
            assert_eq!(
                fs::metadata(names.region_path()).unwrap().len() as usize,
                L::HEADER_SIZE + capacity * SLOT_SIZE
            );

            region.initialize(&mut rng);
            let first = region.snapshot();
            assert_eq!(first.len(), capacity);
            assert_in_domain(&first);

            region.initialize(&mut rng);
            assert_in_domain(&region.snapshot());

            region.destroy().unwrap();
        }
    }

    #[test]
    fn initialize_fills_domain_named() {
        initialize_fills_domain::<NamedSemaphore>();
    }

    #[test]
    fn initialize_fills_domain_embedded() {
        initialize_fills_domain::<EmbeddedSemaphore>();
    }

    #[test]
    fn zero_capacity_touches_nothing() {
        let names = names::<NamedSemaphore>("zero");
        assert!(matches!(
            SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 0),
            Err(InvalidCapacity(0))
        ));
        assert!(!names.region_path().exists());
        assert!(!names.semaphore_path().exists());
    }

    #[test]
    fn reads_are_bounds_checked() {
        let names = names::<EmbeddedSemaphore>("bounds");
        let region = SharedRegion::<EmbeddedSemaphore>::create_and_map(names, 3).unwrap();
        assert!(region.read(2).is_ok());
        assert!(matches!(region.read(3), Err(IndexOutOfBounds(3, 3))));
        region.destroy().unwrap();
    }

    #[test]
    fn writes_go_through_the_guard() {
        let names = names::<NamedSemaphore>("guard");
        let mut region = SharedRegion::<NamedSemaphore>::create_and_map(names, 4).unwrap();
        region.initialize(&mut StdRng::seed_from_u64(1));
        let before = region.read(1).unwrap();

        {
            let guard = region.lock().unwrap();
            assert_eq!(guard.write(1, 20).unwrap(), before);
            assert!(matches!(guard.write(1, 21), Err(ValueOutOfDomain(21))));
            assert!(matches!(guard.write(1, 0), Err(ValueOutOfDomain(0))));
            assert!(matches!(guard.write(4, 5), Err(IndexOutOfBounds(4, 4))));
        }

        assert_eq!(region.read(1).unwrap(), 20);
        // the guard released the lock, taking it again must not block
        drop(region.lock().unwrap());
        region.destroy().unwrap();
    }

    #[test]
    fn second_creation_is_refused() {
        let names = names::<NamedSemaphore>("exclusive");
        let region = SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2).unwrap();
        assert!(matches!(
            SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2),
            Err(ResourceUnavailable(name, _)) if name == names.region()
        ));
        // the refused attempt must not have removed the live objects
        assert!(names.region_path().exists());
        assert!(names.semaphore_path().exists());
        region.destroy().unwrap();
    }

    #[test]
    fn leftover_semaphore_rolls_back_region() {
        let names = names::<NamedSemaphore>("rollback");
        let region = SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2).unwrap();
        // a crashed run that only left its semaphore behind
        SharedRegion::<EmbeddedSemaphore>::purge(&names).unwrap();
        drop(region);
        assert!(!names.region_path().exists());
        assert!(names.semaphore_path().exists());

        assert!(matches!(
            SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2),
            Err(ResourceUnavailable(name, _)) if name == names.semaphore()
        ));
        assert!(!names.region_path().exists());

        SharedRegion::<NamedSemaphore>::purge(&names).unwrap();
    }

    #[test]
    fn destroy_removes_objects_and_purge_is_idempotent() {
        let names = names::<NamedSemaphore>("destroy");
        let region = SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2).unwrap();
        assert!(names.region_path().exists());
        assert!(names.semaphore_path().exists());

        region.destroy().unwrap();
        assert!(!names.region_path().exists());
        assert!(!names.semaphore_path().exists());

        SharedRegion::<NamedSemaphore>::purge(&names).unwrap();
        SharedRegion::<NamedSemaphore>::purge(&names).unwrap();
    }

    #[test]
    fn purge_reclaims_crashed_run() {
        let names = names::<NamedSemaphore>("crashed");
        // dropping without destroy leaves the named objects behind, as a crash would
        drop(SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2).unwrap());
        assert!(names.region_path().exists());
        assert!(SharedRegion::<NamedSemaphore>::create_and_map(names.clone(), 2).is_err());

        SharedRegion::<NamedSemaphore>::purge(&names).unwrap();
        assert!(!names.region_path().exists());
        assert!(!names.semaphore_path().exists());

        SharedRegion::<NamedSemaphore>::create_and_map(names, 2)
            .unwrap()
            .destroy()
            .unwrap();
    }
}
