//! `shmdb` demonstrates readers and writers sharing a small database across processes.
//!
//! ## Features
//!
//! - **Shared memory database**: a fixed number of `i32` slots kept in a POSIX shared memory object and mapped into every worker process, see [`region`].
//!
//! - **Process-shared writer lock**: writers serialize on a binary POSIX semaphore, either a separately named one or one embedded in the region itself, see [`locks`]. Write access is scoped by [`guard::WriteGuard`].
//!
//! - **Unsynchronized readers**: readers never take the lock. Slots are word-sized atomics, so readers may see stale values but never torn ones.
//!
//! - **Cooperative shutdown**: `SIGINT` only raises a flag, see [`shutdown`]. The [`supervisor`] reaps its workers and removes the named objects once, outside of signal context.
#[cfg(not(unix))]
compile_error!("shmdb needs POSIX shared memory and semaphores");

pub mod guard;
pub mod locks;
pub mod names;
pub mod region;
pub mod shutdown;
pub mod supervisor;
pub mod worker;
