//! Writer lock placements.
//!
//! Writers serialize on a binary POSIX semaphore. It can live in two places:
//!
//! - [`NamedSemaphore`]: a separate named object (`sem_open`) that every process opens by name
//!   and that is removed from the namespace with `sem_unlink`.
//! - [`EmbeddedSemaphore`]: a `sem_t` stored in the header of the shared region itself,
//!   initialized once with process-shared semantics and de-initialized before the region is
//!   unmapped.
//!
//! # Safety
//! Holding the lock is not reentrant. A process must never `fork` while it holds the lock, the
//! child would inherit a lock it never acquired.

use std::ffi::CString;
use std::io;
use std::mem;
use std::ptr;
use std::sync::atomic::AtomicI32;

use log::debug;
use nix::errno::Errno;

use crate::names::ObjectNames;
use crate::region::DatabaseError;
use crate::region::DatabaseError::*;

/// Named semaphores are readable and writable by owner and group only.
const SEMAPHORE_MODE: libc::c_uint = 0o660;

/// The lock strategy decides where the writer semaphore lives.
///
/// Note: the implementations are sealed to avoid committing to a specific lock interface.
#[allow(private_bounds)]
pub trait LockStrategy: LockStrategySealed {}

/// Sealed trait with the lock operations
pub(crate) trait LockStrategySealed: Sized + Send + Sync {
    /// Human readable placement name, used in logs
    const PLACEMENT: &'static str;

    /// Bytes reserved in front of the data slots of the shared region.
    const HEADER_SIZE: usize;

    /// Create the semaphore with a count of one.
    ///
    /// # Safety
    /// `header` must point to `HEADER_SIZE` writable bytes of a shared mapping which is aligned
    /// for `libc::sem_t` and outlives the returned lock.
    unsafe fn create(names: &ObjectNames, header: *mut u8) -> Result<Self, DatabaseError>;

    /// Block until the count is one, then take it. Reports `Interrupted` on `EINTR`.
    fn acquire(&self) -> Result<(), DatabaseError>;

    /// Give the count back and wake one blocked acquirer.
    ///
    /// Must only be called after a matching `acquire`.
    fn release(&self) -> Result<(), DatabaseError>;

    /// Release every OS resource held by the lock. Called once, by the process which created it.
    fn destroy(self, names: &ObjectNames) -> Result<(), DatabaseError>;

    /// Remove the lock's named object, if it has one. Missing objects are not an error.
    fn unlink(names: &ObjectNames) -> Result<(), DatabaseError>;
}

/// Separately named semaphore, the `sem_open` flavour.
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
}

// SAFETY: POSIX semaphores are designed to be operated on concurrently from any thread or process.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Close this process' handle. The semaphore stays in the namespace.
    fn close(&mut self) -> Result<(), DatabaseError> {
        if self.sem.is_null() {
            return Ok(());
        }
        let rc = unsafe { libc::sem_close(self.sem) };
        self.sem = ptr::null_mut();
        match rc {
            0 => Ok(()),
            _ => Err(SemaphoreFailed(io::Error::last_os_error())),
        }
    }

    #[cfg(test)]
    fn value(&self) -> i32 {
        sem_value(self.sem)
    }
}

impl LockStrategySealed for NamedSemaphore {
    const PLACEMENT: &'static str = "named";
    const HEADER_SIZE: usize = 0;

    unsafe fn create(names: &ObjectNames, _header: *mut u8) -> Result<Self, DatabaseError> {
        let name =
            CString::new(names.semaphore()).map_err(|_| InvalidName(names.semaphore().into()))?;

        // O_EXCL: a leftover semaphore from a crashed run must not be silently reused, its
        // count may be stuck at zero.
        let sem = libc::sem_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL,
            SEMAPHORE_MODE,
            1 as libc::c_uint,
        );
        if sem == libc::SEM_FAILED {
            return Err(ResourceUnavailable(
                names.semaphore().into(),
                io::Error::last_os_error(),
            ));
        }

        Ok(NamedSemaphore { sem })
    }

    #[inline]
    fn acquire(&self) -> Result<(), DatabaseError> {
        sem_wait(self.sem)
    }

    #[inline]
    fn release(&self) -> Result<(), DatabaseError> {
        sem_post(self.sem)
    }

    fn destroy(mut self, names: &ObjectNames) -> Result<(), DatabaseError> {
        let closed = self.close();
        let unlinked = Self::unlink(names);
        closed.and(unlinked)
    }

    fn unlink(names: &ObjectNames) -> Result<(), DatabaseError> {
        let name =
            CString::new(names.semaphore()).map_err(|_| InvalidName(names.semaphore().into()))?;
        if unsafe { libc::sem_unlink(name.as_ptr()) } == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::ENOENT => {
                debug!("semaphore {} already removed", names.semaphore());
                Ok(())
            }
            errno => Err(UnlinkFailed(names.semaphore().into(), errno.into())),
        }
    }
}

impl LockStrategy for NamedSemaphore {}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            debug!("error closing semaphore: {err}");
        }
    }
}

/// Semaphore stored inside the shared region, the `sem_init(pshared = 1)` flavour.
///
/// It has no name of its own and disappears together with the region.
pub struct EmbeddedSemaphore {
    sem: *mut libc::sem_t,
}

// SAFETY: the semaphore is initialized as process-shared and lives in shared memory.
unsafe impl Send for EmbeddedSemaphore {}
unsafe impl Sync for EmbeddedSemaphore {}

impl EmbeddedSemaphore {
    #[cfg(test)]
    fn value(&self) -> i32 {
        sem_value(self.sem)
    }
}

impl LockStrategySealed for EmbeddedSemaphore {
    const PLACEMENT: &'static str = "embedded";

    // keep the slots that follow the semaphore aligned
    const HEADER_SIZE: usize = {
        let align = mem::align_of::<AtomicI32>();
        mem::size_of::<libc::sem_t>().div_ceil(align) * align
    };

    unsafe fn create(_names: &ObjectNames, header: *mut u8) -> Result<Self, DatabaseError> {
        let sem = header as *mut libc::sem_t;
        if libc::sem_init(sem, 1, 1) != 0 {
            return Err(SemaphoreFailed(io::Error::last_os_error()));
        }
        Ok(EmbeddedSemaphore { sem })
    }

    #[inline]
    fn acquire(&self) -> Result<(), DatabaseError> {
        sem_wait(self.sem)
    }

    #[inline]
    fn release(&self) -> Result<(), DatabaseError> {
        sem_post(self.sem)
    }

    fn destroy(self, _names: &ObjectNames) -> Result<(), DatabaseError> {
        match unsafe { libc::sem_destroy(self.sem) } {
            0 => Ok(()),
            _ => Err(SemaphoreFailed(io::Error::last_os_error())),
        }
    }

    fn unlink(_names: &ObjectNames) -> Result<(), DatabaseError> {
        Ok(())
    }
}

impl LockStrategy for EmbeddedSemaphore {}

#[inline]
fn sem_wait(sem: *mut libc::sem_t) -> Result<(), DatabaseError> {
    if unsafe { libc::sem_wait(sem) } == 0 {
        return Ok(());
    }
    match Errno::last() {
        Errno::EINTR => Err(Interrupted),
        errno => Err(SemaphoreFailed(errno.into())),
    }
}

#[inline]
fn sem_post(sem: *mut libc::sem_t) -> Result<(), DatabaseError> {
    match unsafe { libc::sem_post(sem) } {
        0 => Ok(()),
        _ => Err(SemaphoreFailed(io::Error::last_os_error())),
    }
}

#[cfg(test)]
fn sem_value(sem: *mut libc::sem_t) -> i32 {
    let mut value = -1;
    assert_eq!(unsafe { libc::sem_getvalue(sem, &mut value) }, 0);
    value
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use std::mem::MaybeUninit;

    fn names(test: &str) -> ObjectNames {
        let names = ObjectNames::new(format!("/shmdb_locks_{test}_{}", std::process::id())).unwrap();
        NamedSemaphore::unlink(&names).unwrap();
        names
    }

    #[test]
    fn named_semaphore_counts_between_zero_and_one() {
        let names = names("count");
        let lock = unsafe { NamedSemaphore::create(&names, ptr::null_mut()) }.unwrap();
        assert!(names.semaphore_path().exists());

        assert_eq!(lock.value(), 1);
        lock.acquire().unwrap();
        assert_eq!(lock.value(), 0);
        lock.release().unwrap();
        assert_eq!(lock.value(), 1);

        lock.destroy(&names).unwrap();
        assert!(!names.semaphore_path().exists());
    }

    #[test]
    fn named_semaphore_refuses_leftover() {
        let names = names("leftover");
        let first = unsafe { NamedSemaphore::create(&names, ptr::null_mut()) }.unwrap();

        assert!(matches!(
            unsafe { NamedSemaphore::create(&names, ptr::null_mut()) },
            Err(ResourceUnavailable(name, _)) if name == names.semaphore()
        ));

        first.destroy(&names).unwrap();
        assert!(unsafe { NamedSemaphore::create(&names, ptr::null_mut()) }
            .unwrap()
            .destroy(&names)
            .is_ok());
    }

    #[test]
    fn named_semaphore_unlink_is_idempotent() {
        let names = names("unlink");
        let lock = unsafe { NamedSemaphore::create(&names, ptr::null_mut()) }.unwrap();
        lock.destroy(&names).unwrap();
        assert!(NamedSemaphore::unlink(&names).is_ok());
        assert!(NamedSemaphore::unlink(&names).is_ok());
    }

    #[test]
    fn embedded_semaphore_in_caller_memory() {
        let names = names("embedded");
        let mut header = Box::new(MaybeUninit::<libc::sem_t>::uninit());
        let lock =
            unsafe { EmbeddedSemaphore::create(&names, header.as_mut_ptr() as *mut u8) }.unwrap();

        assert_eq!(lock.value(), 1);
        lock.acquire().unwrap();
        assert_eq!(lock.value(), 0);
        lock.release().unwrap();
        assert_eq!(lock.value(), 1);

        lock.destroy(&names).unwrap();
        assert!(!names.semaphore_path().exists());
    }

    #[test]
    fn embedded_header_keeps_slots_aligned() {
        assert!(EmbeddedSemaphore::HEADER_SIZE >= mem::size_of::<libc::sem_t>());
        assert_eq!(EmbeddedSemaphore::HEADER_SIZE % mem::align_of::<AtomicI32>(), 0);
        assert_eq!(NamedSemaphore::HEADER_SIZE, 0);
    }
}
