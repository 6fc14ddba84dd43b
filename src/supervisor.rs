//! The `supervisor` module runs the whole scenario: it creates and initializes the region,
//! forks the workers, reaps them and finally tears the region down.
//!
//! The supervisor never works on the region itself. It is also the only process that removes
//! the named objects, after every worker has been reaped, so teardown happens once and outside of
//! signal context.
use std::io::{self, Write};
use std::process;
use std::thread;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, getpid, ForkResult, Pid};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::locks::{LockStrategy, LockStrategySealed};
use crate::names::ObjectNames;
use crate::region::DatabaseError::*;
use crate::region::{DatabaseError, SharedRegion, DEFAULT_CAPACITY};
use crate::shutdown::ShutdownFlag;
use crate::worker::{role_counts, Cadence, Role, Worker, POLL_SLICE};

/// Scenario configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker processes
    pub workers: usize,
    /// Number of slots in the region
    pub capacity: usize,
    /// Sleep cadence of the workers
    pub cadence: Cadence,
    /// Stop every worker after this many steps, `None` runs until interrupted
    pub iterations: Option<u64>,
    /// Rendezvous names of the shared objects
    pub names: ObjectNames,
    /// Remove leftover objects with the same names before creating the region
    pub reclaim_stale: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 1,
            capacity: DEFAULT_CAPACITY,
            cadence: Cadence::default(),
            iterations: None,
            names: ObjectNames::unique(),
            reclaim_stale: false,
        }
    }
}

impl Config {
    /// Configuration for `workers` workers, everything else default
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            ..Default::default()
        }
    }

    /// Sets the number of slots.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the worker cadence.
    #[must_use]
    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    /// Caps the number of steps per worker.
    #[must_use]
    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Sets the rendezvous names.
    #[must_use]
    pub fn with_names(mut self, names: ObjectNames) -> Self {
        self.names = names;
        self
    }

    /// Removes leftover objects before creating the region.
    #[must_use]
    pub fn with_reclaim_stale(mut self, reclaim_stale: bool) -> Self {
        self.reclaim_stale = reclaim_stale;
        self
    }
}

/// `Supervisor` owns the region for the lifetime of the scenario and the worker processes
/// working on it.
pub struct Supervisor<L: LockStrategy> {
    config: Config,
    /// `None` once torn down
    region: Option<SharedRegion<L>>,
    /// Spawned workers, in spawn order
    workers: Vec<(Pid, Role)>,
    shutdown: ShutdownFlag,
    /// Set once a raised shutdown flag has been passed on to the workers
    forwarded: bool,
}

impl<L: LockStrategy> Supervisor<L> {
    /// Validate `config`, then create, map and initialize the region.
    ///
    /// Nothing is created when the configuration is invalid.
    pub fn start(config: Config, shutdown: ShutdownFlag) -> Result<Self, DatabaseError> {
        if config.workers == 0 {
            return Err(InvalidWorkerCount(config.workers));
        }
        if config.capacity == 0 {
            return Err(InvalidCapacity(config.capacity));
        }

        if config.reclaim_stale {
            SharedRegion::<L>::purge(&config.names)?;
        }
        let mut region = SharedRegion::<L>::create_and_map(config.names.clone(), config.capacity)?;
        region.initialize(&mut StdRng::from_entropy());

        Ok(Supervisor {
            config,
            region: Some(region),
            workers: Vec::new(),
            shutdown,
            forwarded: false,
        })
    }

    /// Fork `config.workers` worker processes. Even spawn indices become writers, odd ones
    /// readers. Returns the number of workers spawned.
    ///
    /// Children run their loop and exit with status 0 when stopped, 1 on a fatal error; they
    /// never return from this call. Forking stops early once the shutdown flag is raised, and
    /// the workers spawned so far are interrupted. Fails with `TornDown` after
    /// [`Supervisor::teardown`].
    pub fn spawn(&mut self) -> Result<usize, DatabaseError> {
        let region = self.region.as_ref().ok_or(TornDown)?;

        // anything still buffered would be printed again by every child
        io::stdout().flush().map_err(ReportFailed)?;

        for index in 0..self.config.workers {
            if self.shutdown.is_raised() {
                info!(
                    "received interrupt after spawning {index} of {} workers",
                    self.config.workers
                );
                self.interrupt();
                self.forwarded = true;
                break;
            }

            let role = Role::for_index(index);
            // SAFETY: the child only runs its worker loop and exits
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let code = work(region, role, &self.config, &self.shutdown);
                    process::exit(code);
                }
                Ok(ForkResult::Parent { child }) => {
                    debug!("spawned {role} {child}");
                    self.workers.push((child, role));
                }
                Err(errno) => {
                    // don't leave the workers spawned so far running unsupervised
                    self.interrupt();
                    self.forwarded = true;
                    return Err(SpawnFailed(index, errno));
                }
            }
        }

        let (writers, readers) = role_counts(self.workers.len());
        info!(
            "spawned {} workers ({writers} writers, {readers} readers)",
            self.workers.len()
        );
        Ok(self.workers.len())
    }

    /// Reap every spawned worker, returning their exit statuses in spawn order.
    ///
    /// When the shutdown flag is raised, before or while waiting, `SIGINT` is forwarded to all
    /// workers once, in case it was only delivered to the supervisor. Until then workers are
    /// polled, so a flag raised between two waits is never missed.
    pub fn wait(&mut self) -> Result<Vec<(Pid, WaitStatus)>, DatabaseError> {
        let mut statuses = Vec::with_capacity(self.workers.len());

        for &(pid, role) in &self.workers {
            loop {
                if self.shutdown.is_raised() && !self.forwarded {
                    info!("received interrupt, stopping workers and cleaning up");
                    self.interrupt();
                    self.forwarded = true;
                }

                let flags = (!self.forwarded).then_some(WaitPidFlag::WNOHANG);
                match waitpid(pid, flags) {
                    Ok(WaitStatus::StillAlive) => thread::sleep(POLL_SLICE),
                    Ok(status) => {
                        match status {
                            WaitStatus::Exited(_, 0) => debug!("{role} {pid} exited"),
                            status => warn!("{role} {pid} ended abnormally: {status:?}"),
                        }
                        statuses.push((pid, status));
                        break;
                    }
                    Err(Errno::EINTR) => {}
                    Err(Errno::ECHILD) => {
                        debug!("{role} {pid} already reaped");
                        break;
                    }
                    Err(errno) => return Err(WaitFailed(errno)),
                }
            }
        }

        Ok(statuses)
    }

    /// Send `SIGINT` to every spawned worker. Workers that already exited are skipped.
    pub fn interrupt(&self) {
        for &(pid, role) in &self.workers {
            match kill(pid, Signal::SIGINT) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(errno) => warn!("failed to interrupt {role} {pid}: {errno}"),
            }
        }
    }

    /// Destroy the region and remove its named objects.
    ///
    /// Only call this once every worker has been reaped. Calling it again is a no-op.
    pub fn teardown(&mut self) -> Result<(), DatabaseError> {
        match self.region.take() {
            Some(region) => {
                info!("tearing down region {}", region.names().region());
                region.destroy()
            }
            None => {
                debug!("region already torn down");
                Ok(())
            }
        }
    }

    /// Spawn, reap and tear down. Teardown runs even when spawning or reaping fails.
    pub fn run(mut self) -> Result<Vec<(Pid, WaitStatus)>, DatabaseError> {
        let reaped = match self.spawn() {
            Ok(_) => self.wait(),
            Err(err) => {
                if let Err(wait_err) = self.wait() {
                    error!("{wait_err}");
                }
                Err(err)
            }
        };
        let torn_down = self.teardown();

        let statuses = reaped?;
        torn_down?;
        Ok(statuses)
    }

    /// Roles of the spawned workers, in spawn order
    pub fn roles(&self) -> Vec<Role> {
        self.workers.iter().map(|&(_, role)| role).collect()
    }

    /// Spawned workers, in spawn order
    pub fn workers(&self) -> &[(Pid, Role)] {
        &self.workers
    }

    /// The region, until it is torn down
    pub fn region(&self) -> Option<&SharedRegion<L>> {
        self.region.as_ref()
    }

    /// Configuration the supervisor was started with
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Body of a forked worker, returns its exit status.
fn work<L: LockStrategy>(
    region: &SharedRegion<L>,
    role: Role,
    config: &Config,
    shutdown: &ShutdownFlag,
) -> i32 {
    // every child needs its own sequence
    let rng = StdRng::from_entropy();
    let mut out = io::stdout().lock();

    let result = Worker::new(role, region, rng)
        .with_cadence(config.cadence)
        .with_iterations(config.iterations)
        .run(shutdown, &mut out);

    match result {
        Ok(_) => 0,
        Err(err) => {
            error!(
                "{role} {} ({} semaphore) failed: {err}",
                getpid(),
                L::PLACEMENT
            );
            1
        }
    }
}
