// src/core/telemetry/mod.rs

//! The telemetry task of §4.9: once per tick, scans the worker table and
//! job queue and republishes roll-ups into the SCM header's atomics so
//! the admin CLI's status query never has to walk the worker table
//! itself. Read-only with respect to everything but its own EWMA state;
//! per §4.5's "Acceptor and telemetry threads send messages... rather
//! than mutating shared state", this task never claims or terminates a
//! worker, it only observes.

use crate::core::scm::{ScmHandle, WorkerState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

const TICK: Duration = Duration::from_secs(1);
/// Smoothing factor for the requests/sec EWMA; matches the broker's
/// other control-loop tick rate so a one-tick burst decays over a few
/// seconds rather than snapping instantly to zero.
const EWMA_ALPHA: f64 = 0.3;

pub struct Telemetry {
    scm: Arc<ScmHandle>,
    last_total_requests: u64,
    ewma_rps: f64,
}

impl Telemetry {
    pub fn new(scm: Arc<ScmHandle>) -> Self {
        Telemetry {
            scm,
            last_total_requests: 0,
            ewma_rps: 0.0,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick() {
                        warn!(error = %e, "telemetry tick failed");
                    }
                }
            }
        }
    }

    fn tick(&mut self) -> Result<(), crate::core::errors::BrokerError> {
        let layout = *self.scm.layout();
        let mut active = 0u32;
        let mut busy = 0u32;
        let mut total_requests = 0u64;

        for index in 0..layout.max_workers {
            let slot = self.scm.worker_slot(index)?;
            match slot.state() {
                WorkerState::Terminated => {}
                WorkerState::Idle => active += 1,
                WorkerState::Busy | WorkerState::CloseWait => {
                    active += 1;
                    busy += 1;
                }
            }
            total_requests += slot.num_requests();
        }

        let delta = total_requests.saturating_sub(self.last_total_requests) as f64;
        self.last_total_requests = total_requests;
        let instantaneous_rps = delta / TICK.as_secs_f64();
        self.ewma_rps = EWMA_ALPHA * instantaneous_rps + (1.0 - EWMA_ALPHA) * self.ewma_rps;

        // SAFETY: only `len()` is read, never the variable-length slot
        // storage; safe to call concurrently with the dispatcher's queue
        // operations.
        let queued = unsafe { self.scm.job_queue().len() };

        let header = self.scm.header();
        header.active_workers.store(active, Ordering::Relaxed);
        header.busy_workers.store(busy, Ordering::Relaxed);
        header.queued_jobs.store(queued, Ordering::Relaxed);
        header
            .requests_per_sec_milli
            .store((self.ewma_rps * 1000.0) as u64, Ordering::Relaxed);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerDocument;

    fn test_config(name: &str) -> crate::config::BrokerConfig {
        toml::from_str::<BrokerDocument>(&format!(
            "[[broker]]\nname = \"{name}\"\nport = 31000\nmin_workers = 1\nmax_workers = 2\nqueue_max = 4\n"
        ))
        .unwrap()
        .brokers
        .remove(0)
    }

    #[test]
    fn tick_reports_zero_for_a_freshly_created_scm() {
        let name = format!("telemetry_test_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = Arc::new(ScmHandle::create(&name, &cfg).unwrap());
        let mut telemetry = Telemetry::new(scm.clone());
        telemetry.tick().unwrap();
        assert_eq!(scm.header().active_workers.load(Ordering::Relaxed), 0);
        assert_eq!(scm.header().busy_workers.load(Ordering::Relaxed), 0);
        assert_eq!(scm.header().requests_per_sec_milli.load(Ordering::Relaxed), 0);
        ScmHandle::unlink(&name).unwrap();
    }

    #[test]
    fn tick_counts_idle_and_busy_workers() {
        let name = format!("telemetry_test_busy_{}", std::process::id());
        let cfg = test_config(&name);
        let _ = ScmHandle::unlink(&name);
        let scm = Arc::new(ScmHandle::create(&name, &cfg).unwrap());
        let slot0 = scm.worker_slot(0).unwrap();
        slot0.mark_spawned(111);
        slot0.try_claim(42, 0);
        let slot1 = scm.worker_slot(1).unwrap();
        slot1.mark_spawned(112);
        slot1.mark_idle(0);

        let mut telemetry = Telemetry::new(scm.clone());
        telemetry.tick().unwrap();
        assert_eq!(scm.header().active_workers.load(Ordering::Relaxed), 2);
        assert_eq!(scm.header().busy_workers.load(Ordering::Relaxed), 1);
        ScmHandle::unlink(&name).unwrap();
    }
}
