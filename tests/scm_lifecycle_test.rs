// tests/scm_lifecycle_test.rs

//! Exercises `ScmHandle` across its full lifecycle: a master creates the
//! region, a second handle in the same process stands in for a worker
//! attaching to it, and the two observe each other's writes through the
//! shared mapping the way separate processes would.

use brokerd::config::BrokerDocument;
use brokerd::core::scm::{ScmHandle, WorkerState};

fn broker_config(name: &str) -> brokerd::config::BrokerConfig {
    let toml = format!(
        "[[broker]]\nname = \"{name}\"\nport = 33000\nmin_workers = 2\nmax_workers = 4\nqueue_max = 3\n"
    );
    let doc: BrokerDocument = toml::from_str(&toml).unwrap();
    doc.brokers[0].clone()
}

#[test]
fn create_then_attach_share_the_same_header() {
    let name = "scm_lifecycle_create_attach";
    let config = broker_config(name);
    let master = ScmHandle::create(name, &config).unwrap();
    let worker_view = ScmHandle::attach(name).unwrap();

    assert_eq!(worker_view.layout().max_workers, 4);
    assert_eq!(worker_view.layout().queue_max, 3);

    master
        .worker_slot(0)
        .unwrap()
        .mark_spawned(12345);
    assert_eq!(worker_view.worker_slot(0).unwrap().pid(), 12345);
    assert_eq!(worker_view.worker_slot(0).unwrap().state(), WorkerState::Idle);

    ScmHandle::unlink(name).unwrap();
}

#[test]
fn creating_twice_fails_until_unlinked() {
    let name = "scm_lifecycle_create_twice";
    let config = broker_config(name);
    let _first = ScmHandle::create(name, &config).unwrap();

    assert!(ScmHandle::create(name, &config).is_err());

    ScmHandle::unlink(name).unwrap();
    let _second = ScmHandle::create(name, &config).unwrap();
    ScmHandle::unlink(name).unwrap();
}

#[test]
fn try_claim_is_exclusive_across_handles() {
    let name = "scm_lifecycle_claim";
    let config = broker_config(name);
    let master = ScmHandle::create(name, &config).unwrap();
    let worker_view = ScmHandle::attach(name).unwrap();

    master.worker_slot(1).unwrap().mark_spawned(42);
    assert!(worker_view.worker_slot(1).unwrap().try_claim(9, 0));
    // A second claim attempt, from the "other process"'s view, must see
    // the slot already busy and fail.
    assert!(!master.worker_slot(1).unwrap().try_claim(10, 0));
    assert_eq!(master.worker_slot(1).unwrap().session_id(), 9);

    ScmHandle::unlink(name).unwrap();
}

#[test]
fn owner_death_is_recovered_by_the_next_locker() {
    use nix::sys::wait::waitpid;
    use nix::unistd::{ForkResult, fork};

    let name = "scm_lifecycle_recovery";
    let config = broker_config(name);
    let scm = ScmHandle::create(name, &config).unwrap();

    // Fork a child that locks the slot's mutex and exits without
    // unlocking it, the way a crashed worker would leave the lock held.
    // SAFETY: the child only touches the mapped SCM region and libc
    // mutex calls before exiting; no other thread-unsafe state is shared.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let slot = scm.worker_slot(0).unwrap();
            let guard = unsafe { slot.lock().unwrap() };
            std::mem::forget(guard);
            std::process::exit(0);
        }
        ForkResult::Parent { child } => {
            waitpid(child, None).unwrap();
            let slot = scm.worker_slot(0).unwrap();
            let guard = unsafe { slot.lock().unwrap() };
            assert_eq!(guard.outcome, brokerd::core::scm::worker_slot::LockOutcome::Recovered);
        }
    }

    ScmHandle::unlink(name).unwrap();
}
