#[cfg(target_os = "linux")]
use std::path::PathBuf;
use std::process;

use crate::region::DatabaseError;
use crate::region::DatabaseError::*;

/// Prefix of the per-run shared memory object name
pub const DEFAULT_PREFIX: &str = "/shmdb";

const SEMAPHORE_SUFFIX: &str = "_writer";

/// Longest accepted name, leaving room for the `sem.` prefix glibc puts in front of named
/// semaphores and for `SEMAPHORE_SUFFIX` within `NAME_MAX` (255).
const MAX_NAME_LEN: usize = 255 - 4 - SEMAPHORE_SUFFIX.len();

/// `ObjectNames` holds the names under which unrelated processes rendezvous on the same
/// shared memory object and, for the named placement, the same writer semaphore.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectNames {
    region: String,
    semaphore: String,
}

impl ObjectNames {
    /// Create names from a POSIX object name such as `/shm_example`.
    ///
    /// The name must start with a single `/` and contain no other `/`.
    pub fn new(region: impl Into<String>) -> Result<Self, DatabaseError> {
        let region = region.into();
        let valid = region
            .strip_prefix('/')
            .is_some_and(|rest| !rest.is_empty() && !rest.contains('/') && !rest.contains('\0'))
            && region.len() <= MAX_NAME_LEN;
        if !valid {
            return Err(InvalidName(region));
        }

        let semaphore = format!("{region}{SEMAPHORE_SUFFIX}");
        Ok(ObjectNames { region, semaphore })
    }

    /// Names unique to the calling process, so a leftover object from a crashed run never
    /// collides with a fresh one.
    pub fn unique() -> Self {
        let region = format!("{DEFAULT_PREFIX}_{}", process::id());
        let semaphore = format!("{region}{SEMAPHORE_SUFFIX}");
        ObjectNames { region, semaphore }
    }

    /// Shared memory object name
    #[inline]
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Named semaphore name
    #[inline]
    pub fn semaphore(&self) -> &str {
        &self.semaphore
    }

    /// Location of the shared memory object in the filesystem (Linux mounts it on `/dev/shm`)
    #[cfg(target_os = "linux")]
    pub fn region_path(&self) -> PathBuf {
        PathBuf::from("/dev/shm").join(&self.region[1..])
    }

    /// Location of the named semaphore in the filesystem
    #[cfg(target_os = "linux")]
    pub fn semaphore_path(&self) -> PathBuf {
        PathBuf::from("/dev/shm").join(format!("sem.{}", &self.semaphore[1..]))
    }
}
