#![cfg(target_os = "linux")]

use std::time::Duration;

use nix::sys::wait::WaitStatus;
use shmdb::locks::{EmbeddedSemaphore, LockStrategy, NamedSemaphore};
use shmdb::names::ObjectNames;
use shmdb::region::{SharedRegion, VALUE_MAX, VALUE_MIN};
use shmdb::shutdown::ShutdownFlag;
use shmdb::supervisor::{Config, Supervisor};
use shmdb::worker::{Cadence, Role};

fn names<L: LockStrategy>(test: &str) -> ObjectNames {
    let names =
        ObjectNames::new(format!("/shmdb_scenario_{test}_{}", std::process::id())).unwrap();
    SharedRegion::<L>::purge(&names).unwrap();
    names
}

fn config(workers: usize, names: &ObjectNames) -> Config {
    Config::new(workers)
        .with_capacity(10)
        .with_cadence(Cadence::new(Duration::from_millis(1)))
        .with_iterations(Some(25))
        .with_names(names.clone())
}

fn one_writer_one_reader<L: LockStrategy>(test: &str) {
    let names = names::<L>(test);
    let mut supervisor = Supervisor::<L>::start(config(2, &names), ShutdownFlag::manual()).unwrap();

    assert_eq!(supervisor.spawn().unwrap(), 2);
    assert_eq!(supervisor.roles(), vec![Role::Writer, Role::Reader]);

    let statuses = supervisor.wait().unwrap();
    assert_eq!(statuses.len(), 2);
    for (pid, status) in statuses {
        assert_eq!(status, WaitStatus::Exited(pid, 0));
    }

    let values = supervisor.region().unwrap().snapshot();
    assert_eq!(values.len(), 10);
    for value in values {
        assert!((VALUE_MIN..=VALUE_MAX).contains(&value));
    }

    supervisor.teardown().unwrap();
    assert!(!names.region_path().exists());
    assert!(!names.semaphore_path().exists());
    // a second teardown finds nothing left to do
    supervisor.teardown().unwrap();
}

fn odd_worker_count_favours_writers<L: LockStrategy>(test: &str) {
    let names = names::<L>(test);
    let mut supervisor =
        Supervisor::<L>::start(config(5, &names), ShutdownFlag::manual()).unwrap();

    assert_eq!(supervisor.spawn().unwrap(), 5);
    let roles = supervisor.roles();
    assert_eq!(roles.iter().filter(|&&role| role == Role::Writer).count(), 3);
    assert_eq!(roles.iter().filter(|&&role| role == Role::Reader).count(), 2);

    let statuses = supervisor.wait().unwrap();
    assert!(statuses
        .iter()
        .all(|(pid, status)| *status == WaitStatus::Exited(*pid, 0)));
    supervisor.teardown().unwrap();
}

fn run_tears_down<L: LockStrategy>(test: &str) {
    let names = names::<L>(test);
    let supervisor = Supervisor::<L>::start(config(3, &names), ShutdownFlag::manual()).unwrap();

    let statuses = supervisor.run().unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses
        .iter()
        .all(|(pid, status)| *status == WaitStatus::Exited(*pid, 0)));

    assert!(!names.region_path().exists());
    assert!(!names.semaphore_path().exists());
}

// forking scenarios run from a single test so that no other test thread holds stdout while the
// supervisor forks
#[test]
fn bounded_scenarios() {
    one_writer_one_reader::<NamedSemaphore>("pair_named");
    one_writer_one_reader::<EmbeddedSemaphore>("pair_embedded");
    odd_worker_count_favours_writers::<NamedSemaphore>("five_named");
    odd_worker_count_favours_writers::<EmbeddedSemaphore>("five_embedded");
    run_tears_down::<NamedSemaphore>("run_named");
    run_tears_down::<EmbeddedSemaphore>("run_embedded");
}
