// src/core/dispatcher/selection.rs

//! The pure parts of the selection algorithm of §4.5: scanning the SCM
//! worker table for a candidate, independent of the async waiting
//! (sticky-wait, spawn-then-retry) the dispatcher layers on top.

use crate::core::errors::BrokerError;
use crate::core::scm::{ScmHandle, WorkerState};

/// What the selection scan found for a job with no (or no longer valid)
/// session affinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Candidate {
    /// An IDLE worker is available right now.
    Idle(usize),
    /// No IDLE worker, but the pool has room to grow.
    CanSpawn,
    /// No IDLE worker and the pool is already at `max_workers`.
    None,
}

/// Scans `0..active_slots` for the IDLE worker with the oldest
/// `last_access_time` ("warm-first", §4.5 item 2), falling back to
/// whether the pool can still grow.
pub fn find_candidate(
    scm: &ScmHandle,
    active_slots: usize,
    max_workers: usize,
    auto_add: bool,
) -> Result<Candidate, BrokerError> {
    let mut best: Option<(usize, u64)> = None;
    for i in 0..active_slots {
        let slot = scm.worker_slot(i)?;
        if slot.state() == WorkerState::Idle {
            let last_access = slot.last_access_time_secs();
            match best {
                Some((_, best_access)) if best_access <= last_access => {}
                _ => best = Some((i, last_access)),
            }
        }
    }
    if let Some((index, _)) = best {
        return Ok(Candidate::Idle(index));
    }
    if active_slots < max_workers && auto_add {
        Ok(Candidate::CanSpawn)
    } else {
        Ok(Candidate::None)
    }
}

/// True if `worker_index`'s slot is IDLE or BUSY-but-about-to-free (we
/// model "sticky-wait" as simply BUSY: the dispatcher polls until it goes
/// IDLE or the `sticky_timeout` elapses, per §4.5 item 1).
pub fn is_sticky_candidate(scm: &ScmHandle, worker_index: usize) -> Result<bool, BrokerError> {
    let slot = scm.worker_slot(worker_index)?;
    Ok(matches!(slot.state(), WorkerState::Idle | WorkerState::Busy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerDocument;
    use crate::core::scm::ScmHandle;

    fn test_config(name: &str) -> crate::config::BrokerConfig {
        toml::from_str::<BrokerDocument>(&format!(
            "[[broker]]\nname = \"{name}\"\nport = 30000\nmin_workers = 1\nmax_workers = 2\nqueue_max = 2\n"
        ))
        .unwrap()
        .brokers
        .remove(0)
    }

    #[test]
    fn prefers_oldest_idle_worker() {
        let name = format!("sel_test_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = ScmHandle::create(&name, &cfg).unwrap();

        let w0 = scm.worker_slot(0).unwrap();
        w0.mark_spawned(100);
        w0.mark_idle(500);
        let w1 = scm.worker_slot(1).unwrap();
        w1.mark_spawned(101);
        w1.mark_idle(200);

        let candidate = find_candidate(&scm, 2, 2, true).unwrap();
        assert_eq!(candidate, Candidate::Idle(1));
        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn reports_can_spawn_when_pool_has_room() {
        let name = format!("sel_test_spawn_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = ScmHandle::create(&name, &cfg).unwrap();
        let w0 = scm.worker_slot(0).unwrap();
        w0.mark_spawned(100);
        w0.try_claim(7, 10);

        let candidate = find_candidate(&scm, 1, 2, true).unwrap();
        assert_eq!(candidate, Candidate::CanSpawn);
        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn reports_none_when_pool_is_full_and_busy() {
        let name = format!("sel_test_full_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = ScmHandle::create(&name, &cfg).unwrap();
        for i in 0..2 {
            let slot = scm.worker_slot(i).unwrap();
            slot.mark_spawned(100 + i as i64);
            slot.try_claim(i as u64 + 1, 10);
        }
        let candidate = find_candidate(&scm, 2, 2, true).unwrap();
        assert_eq!(candidate, Candidate::None);
        ScmHandle::unlink(&name).unwrap();
    }
}
