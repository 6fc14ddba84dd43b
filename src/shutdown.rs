//! Cooperative cancellation.
//!
//! The `SIGINT` handler does nothing but raise an atomic flag. Workers look at the flag between
//! steps and while they sleep; the supervisor looks at it while reaping workers and tears the
//! region down afterwards, in normal context rather than inside the handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::region::DatabaseError;
use crate::region::DatabaseError::*;

/// Raised by the interrupt handler, which can only reach statics.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn raise_interrupted(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Cancellation flag observed by workers and the supervisor.
#[derive(Clone, Debug)]
pub struct ShutdownFlag {
    source: Source,
}

#[derive(Clone, Debug)]
enum Source {
    /// Raised by `SIGINT`, per process
    Interrupt,
    /// Raised by hand, shared between clones within one process
    Manual(Arc<AtomicBool>),
}

impl ShutdownFlag {
    /// Install the `SIGINT` handler and return the flag it raises.
    ///
    /// The handler is installed without `SA_RESTART`: a blocked `sem_wait` or `waitpid` returns
    /// `EINTR` so its caller gets to look at the flag. Forked children inherit the handler and
    /// each process gets its own copy of the flag.
    pub fn on_interrupt() -> Result<Self, DatabaseError> {
        let action = SigAction::new(
            SigHandler::Handler(raise_interrupted),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic
        unsafe { sigaction(Signal::SIGINT, &action) }.map_err(SignalSetup)?;

        Ok(ShutdownFlag {
            source: Source::Interrupt,
        })
    }

    /// A flag that is only raised through [`ShutdownFlag::raise`]
    pub fn manual() -> Self {
        ShutdownFlag {
            source: Source::Manual(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Whether shutdown has been requested
    #[inline]
    pub fn is_raised(&self) -> bool {
        match &self.source {
            Source::Interrupt => INTERRUPTED.load(Ordering::SeqCst),
            Source::Manual(flag) => flag.load(Ordering::SeqCst),
        }
    }

    /// Request shutdown in the calling process
    pub fn raise(&self) {
        match &self.source {
            Source::Interrupt => INTERRUPTED.store(true, Ordering::SeqCst),
            Source::Manual(flag) => flag.store(true, Ordering::SeqCst),
        }
    }
}
