//! Worker roles and their loops.
//!
//! Writers pick a random slot, take the writer lock, replace the slot's value and sleep one
//! cadence unit. Readers pick a random slot, read it without any lock, print its factorial and
//! sleep two cadence units. Both report every step as one line of text.
use std::fmt;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use nix::unistd::{getpid, Pid};
use rand::Rng;

use crate::locks::LockStrategy;
use crate::region::DatabaseError::*;
use crate::region::{random_value, DatabaseError, SharedRegion};
use crate::shutdown::ShutdownFlag;

/// Largest value whose factorial is computed.
///
/// 20! = 2_432_902_008_176_640_000 is the largest factorial that fits in a `u64`. Raising this
/// limit would make `derive` overflow.
pub const FACTORIAL_LIMIT: i32 = 20;

/// Writer sleep between steps, in cadence units
pub const WRITER_INTERVAL_UNITS: u32 = 1;
/// Reader sleep between steps, in cadence units
pub const READER_INTERVAL_UNITS: u32 = 2;

/// Longest uninterrupted sleep, bounds how late a sleeping worker notices shutdown
pub(crate) const POLL_SLICE: Duration = Duration::from_millis(50);

/// What a worker does for its whole life
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Writer,
    Reader,
}

impl Role {
    /// Role of the worker spawned at `index`: even indices write, odd indices read.
    #[inline]
    pub fn for_index(index: usize) -> Role {
        if index % 2 == 0 {
            Role::Writer
        } else {
            Role::Reader
        }
    }

    /// Sleep between two steps, in cadence units
    #[inline]
    pub fn interval_units(self) -> u32 {
        match self {
            Role::Writer => WRITER_INTERVAL_UNITS,
            Role::Reader => READER_INTERVAL_UNITS,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Writer => f.write_str("Writer"),
            Role::Reader => f.write_str("Reader"),
        }
    }
}

/// Number of writers and readers among `workers` spawned workers
pub fn role_counts(workers: usize) -> (usize, usize) {
    (0..workers)
        .map(Role::for_index)
        .fold((0, 0), |(writers, readers), role| match role {
            Role::Writer => (writers + 1, readers),
            Role::Reader => (writers, readers + 1),
        })
}

/// Value a reader derives from what it observed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Derived {
    /// Exact factorial of the observed value
    Factorial(u64),
    /// The observed value is above `FACTORIAL_LIMIT`
    TooLarge,
    /// The observed value is negative
    Undefined,
}

/// Factorial of `value`, for `0 <= value <= FACTORIAL_LIMIT`.
///
/// Stored values never exceed 20, so `TooLarge` is unreachable while the region keeps its
/// domain; it is still reported rather than computed.
pub fn derive(value: i32) -> Derived {
    match value {
        v if v < 0 => Derived::Undefined,
        v if v > FACTORIAL_LIMIT => Derived::TooLarge,
        v => Derived::Factorial((1..=v as u64).product()),
    }
}

impl fmt::Display for Derived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Derived::Factorial(n) => write!(f, "factorial {n}"),
            Derived::TooLarge => f.write_str("factorial too large"),
            Derived::Undefined => f.write_str("factorial undefined"),
        }
    }
}

/// Timing of the worker loops.
///
/// Writers sleep `WRITER_INTERVAL_UNITS` units between steps, readers `READER_INTERVAL_UNITS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cadence {
    unit: Duration,
}

impl Cadence {
    /// Create a cadence with the given unit
    pub fn new(unit: Duration) -> Self {
        Cadence { unit }
    }

    /// Cadence unit
    #[inline]
    pub fn unit(&self) -> Duration {
        self.unit
    }

    /// Sleep between two steps of `role`
    #[inline]
    pub fn interval(&self, role: Role) -> Duration {
        self.unit * role.interval_units()
    }

    /// Sleep one interval of `role`, outside of any lock.
    ///
    /// Returns `false` as soon as `shutdown` is raised, `true` once the full interval elapsed.
    pub fn pause(&self, role: Role, shutdown: &ShutdownFlag) -> bool {
        let deadline = Instant::now() + self.interval(role);
        loop {
            if shutdown.is_raised() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(POLL_SLICE));
        }
    }
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::new(Duration::from_secs(1))
    }
}

/// One writer step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteReport {
    pub worker: Pid,
    pub index: usize,
    pub old: i32,
    pub new: i32,
}

impl fmt::Display for WriteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Writer {}: index {}, old value {}, new value {}",
            self.worker, self.index, self.old, self.new
        )
    }
}

/// One reader step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReadReport {
    pub worker: Pid,
    pub index: usize,
    pub value: i32,
    pub derived: Derived,
}

impl fmt::Display for ReadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Reader {}: index {}, value {}, {}",
            self.worker, self.index, self.value, self.derived
        )
    }
}

/// Observable outcome of a worker step
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Report {
    Write(WriteReport),
    Read(ReadReport),
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Write(report) => report.fmt(f),
            Report::Read(report) => report.fmt(f),
        }
    }
}

/// A writer or reader working on a mapped region.
pub struct Worker<'a, L: LockStrategy, R: Rng> {
    role: Role,
    region: &'a SharedRegion<L>,
    rng: R,
    cadence: Cadence,
    /// Stop after this many steps, `None` runs until shutdown
    iterations: Option<u64>,
    pid: Pid,
}

impl<'a, L: LockStrategy, R: Rng> Worker<'a, L, R> {
    /// Create a worker with the default cadence and no iteration cap
    pub fn new(role: Role, region: &'a SharedRegion<L>, rng: R) -> Self {
        Worker {
            role,
            region,
            rng,
            cadence: Cadence::default(),
            iterations: None,
            pid: getpid(),
        }
    }

    /// Use `cadence` for the sleeps between steps
    #[must_use]
    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    /// Stop after `iterations` steps
    #[must_use]
    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Role of this worker
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Perform one step of the worker's role, without sleeping
    pub fn step(&mut self) -> Result<Report, DatabaseError> {
        match self.role {
            Role::Writer => self.write_step().map(Report::Write),
            Role::Reader => self.read_step().map(Report::Read),
        }
    }

    fn write_step(&mut self) -> Result<WriteReport, DatabaseError> {
        let index = self.rng.gen_range(0..self.region.capacity());
        let new = random_value(&mut self.rng);

        let guard = self.region.lock()?;
        let old = guard.write(index, new)?;
        drop(guard);

        Ok(WriteReport {
            worker: self.pid,
            index,
            old,
            new,
        })
    }

    fn read_step(&mut self) -> Result<ReadReport, DatabaseError> {
        let index = self.rng.gen_range(0..self.region.capacity());
        // deliberately unsynchronized, the value may be stale
        let value = self.region.read(index)?;

        Ok(ReadReport {
            worker: self.pid,
            index,
            value,
            derived: derive(value),
        })
    }

    #[inline]
    fn exhausted(&self, steps: u64) -> bool {
        self.iterations.is_some_and(|cap| steps >= cap)
    }

    /// Loop until `shutdown` is raised or the iteration cap is reached, writing one report line
    /// per step to `out`. Returns the number of steps performed.
    ///
    /// A lock wait interrupted by a signal is retried once the flag has been checked; any other
    /// error ends the loop.
    pub fn run<W: Write>(
        &mut self,
        shutdown: &ShutdownFlag,
        out: &mut W,
    ) -> Result<u64, DatabaseError> {
        debug!("{} {} started", self.role, self.pid);

        let mut steps = 0;
        while !shutdown.is_raised() && !self.exhausted(steps) {
            let report = match self.step() {
                Ok(report) => report,
                Err(Interrupted) => continue,
                Err(err) => return Err(err),
            };
            writeln!(out, "{report}").map_err(ReportFailed)?;
            steps += 1;

            if self.exhausted(steps) || !self.cadence.pause(self.role, shutdown) {
                break;
            }
        }
        out.flush().map_err(ReportFailed)?;

        debug!("{} {} stopped after {} steps", self.role, self.pid, steps);
        Ok(steps)
    }
}
