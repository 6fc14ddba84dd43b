#![cfg(target_os = "linux")]

use std::time::Duration;

use nix::sys::signal::{raise, Signal};
use nix::sys::wait::WaitStatus;
use shmdb::locks::NamedSemaphore;
use shmdb::names::ObjectNames;
use shmdb::region::SharedRegion;
use shmdb::shutdown::ShutdownFlag;
use shmdb::supervisor::{Config, Supervisor};
use shmdb::worker::Cadence;

#[test]
fn interrupt_before_reaping_is_forwarded() {
    let names = ObjectNames::new(format!("/shmdb_before_wait_{}", std::process::id())).unwrap();
    SharedRegion::<NamedSemaphore>::purge(&names).unwrap();

    let shutdown = ShutdownFlag::on_interrupt().unwrap();
    let config = Config::new(2)
        .with_cadence(Cadence::new(Duration::from_millis(5)))
        .with_names(names.clone());
    let mut supervisor = Supervisor::<NamedSemaphore>::start(config, shutdown.clone()).unwrap();
    assert_eq!(supervisor.spawn().unwrap(), 2);

    // only the supervisor is signalled, the workers keep running until it passes it on
    raise(Signal::SIGINT).unwrap();
    assert!(shutdown.is_raised());

    let statuses = supervisor.wait().unwrap();
    assert_eq!(statuses.len(), 2);
    for (pid, status) in statuses {
        assert_eq!(status, WaitStatus::Exited(pid, 0));
    }

    supervisor.teardown().unwrap();
    assert!(!names.region_path().exists());
    assert!(!names.semaphore_path().exists());
}
