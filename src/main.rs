//! `shmdb` binary: spawn readers and writers over one shared database until interrupted.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, warn};
use nix::sys::wait::WaitStatus;

use shmdb::locks::{EmbeddedSemaphore, LockStrategy, NamedSemaphore};
use shmdb::names::ObjectNames;
use shmdb::region::{SharedRegion, DEFAULT_CAPACITY};
use shmdb::shutdown::ShutdownFlag;
use shmdb::supervisor::{Config, Supervisor};
use shmdb::worker::Cadence;

/// Readers and writers sharing a database in POSIX shared memory.
///
/// Even-numbered workers write random slots under a process-shared semaphore, odd-numbered ones
/// read random slots without it and print their factorial. Stop with Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "shmdb", version)]
struct Cli {
    /// Number of worker processes to spawn
    #[arg(
        value_parser = clap::value_parser!(u32).range(1..),
        required_unless_present = "purge"
    )]
    workers: Option<u32>,

    /// Number of slots in the database
    #[arg(long, default_value_t = DEFAULT_CAPACITY as u32, value_parser = clap::value_parser!(u32).range(1..))]
    capacity: u32,

    /// Where the writer semaphore lives
    #[arg(long, value_enum, default_value_t = Placement::Named)]
    lock: Placement,

    /// Shared memory object name, e.g. /shm_example [default: /shmdb_<pid>]
    #[arg(long)]
    name: Option<String>,

    /// Cadence unit in milliseconds; writers sleep one unit, readers two
    #[arg(long, default_value_t = 1000)]
    unit_ms: u64,

    /// Stop every worker after this many steps
    #[arg(long)]
    iterations: Option<u64>,

    /// Remove leftover objects with the same name before starting
    #[arg(long)]
    reclaim_stale: bool,

    /// Only remove leftover objects for --name, then exit
    #[arg(long, requires = "name", conflicts_with = "workers")]
    purge: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Placement {
    /// Separate named semaphore (sem_open)
    Named,
    /// Semaphore embedded in the shared region (sem_init)
    Embedded,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version are not usage errors
        Err(err) if !err.use_stderr() => err.exit(),
        Err(err) => {
            if let Err(print_err) = err.print() {
                error!("failed to print usage error ({print_err}): {err}");
            }
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("shmdb: {err:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every worker ended cleanly
fn run(cli: Cli) -> Result<bool> {
    let names = match &cli.name {
        Some(name) => ObjectNames::new(name.as_str())?,
        None => ObjectNames::unique(),
    };

    if cli.purge {
        return purge(&names);
    }

    let workers = cli
        .workers
        .context("the number of worker processes is required")?;
    let config = Config::new(workers as usize)
        .with_capacity(cli.capacity as usize)
        .with_cadence(Cadence::new(Duration::from_millis(cli.unit_ms)))
        .with_iterations(cli.iterations)
        .with_names(names)
        .with_reclaim_stale(cli.reclaim_stale);

    match cli.lock {
        Placement::Named => supervise::<NamedSemaphore>(config),
        Placement::Embedded => supervise::<EmbeddedSemaphore>(config),
    }
}

fn supervise<L: LockStrategy>(config: Config) -> Result<bool> {
    let shutdown = ShutdownFlag::on_interrupt()?;
    let region = config.names.region().to_owned();

    let statuses = Supervisor::<L>::start(config, shutdown)
        .with_context(|| format!("failed to set up shared region {region}"))?
        .run()?;

    let failed = statuses
        .iter()
        .filter(|(_, status)| !matches!(status, WaitStatus::Exited(_, 0)))
        .count();
    if failed > 0 {
        warn!("{failed} of {} workers failed", statuses.len());
    }
    Ok(failed == 0)
}

/// Remove the region and the named semaphore, whichever placement left them behind
fn purge(names: &ObjectNames) -> Result<bool> {
    SharedRegion::<NamedSemaphore>::purge(names)
        .with_context(|| format!("failed to remove objects of {}", names.region()))?;
    println!("Removed leftover objects of {}", names.region());
    Ok(true)
}
