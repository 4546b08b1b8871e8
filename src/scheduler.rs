#![forbid(unsafe_code)]

// Virtual-user scheduler: realizes a staged ramp profile by reconciling the
// set of running worker tasks against the interpolated target on a short
// tick. Workers carry stable numeric identities so fixture selection stays
// deterministic across their iterations; excess workers finish their current
// iteration and exit when the target drops.

use crate::fixtures::FixtureSet;
use crate::metrics::Registry;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const TICK: Duration = Duration::from_millis(200);

/// One ramp segment: interpolate toward `target` over `duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

/// Ordered ramp shape. Interpolation is a pure function of explicit elapsed
/// time, so the shape is testable without any clock.
#[derive(Debug, Clone)]
pub struct StageProfile {
    pub start_vus: u64,
    pub stages: Vec<Stage>,
}

impl StageProfile {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    /// Concurrency target at `elapsed`: a linear ramp from the previous
    /// stage's target (or `start_vus`) to the current stage's target. At a
    /// stage boundary the value equals the finished stage's configured
    /// target exactly; past the final stage the target is zero.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        let mut from = self.start_vus;
        let mut offset = Duration::ZERO;
        for stage in &self.stages {
            let end = offset + stage.duration;
            if elapsed < end {
                let frac = (elapsed - offset).as_secs_f64() / stage.duration.as_secs_f64();
                let from = from as f64;
                let to = stage.target as f64;
                return (from + (to - from) * frac).round() as u64;
            }
            from = stage.target;
            offset = end;
        }
        if elapsed == offset && !self.stages.is_empty() {
            return from;
        }
        0
    }
}

/// Everything one virtual user needs: its stable identity plus shared
/// read-only handles. Cloned per iteration, which only bumps refcounts.
#[derive(Clone)]
pub struct WorkerContext {
    pub vu: u64,
    pub fixtures: Arc<FixtureSet>,
    pub metrics: Arc<Registry>,
}

impl WorkerContext {
    /// Deterministic fixture selection: worker K always lands on K mod len.
    pub fn fixture_index(&self, len: usize) -> Option<usize> {
        if len == 0 {
            None
        } else {
            Some(self.vu as usize % len)
        }
    }
}

/// Runs the iteration function under the given ramp profile until the
/// profile ends or `stop` flips. Returns once every worker has drained.
pub async fn run_profile<F, Fut>(
    profile: &StageProfile,
    iteration: F,
    fixtures: Arc<FixtureSet>,
    metrics: Arc<Registry>,
    stop: watch::Receiver<bool>,
) where
    F: Fn(WorkerContext) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let (target_tx, target_rx) = watch::channel(0u64);
    let total = profile.total_duration();
    let started = Instant::now();
    // Slot index doubles as the worker's stable identity; freed slots are
    // reused lowest-first so `vu % len` affinity survives ramp-downs.
    let mut workers: Vec<Option<JoinHandle<()>>> = Vec::new();
    let mut ticker = tokio::time::interval(TICK);

    loop {
        ticker.tick().await;
        if *stop.borrow() {
            info!("stop signal received, winding down virtual users");
            break;
        }
        let elapsed = started.elapsed();
        if elapsed >= total {
            break;
        }

        let desired = profile.target_at(elapsed);
        target_tx.send_replace(desired);

        for slot in workers.iter_mut() {
            if slot.as_ref().is_some_and(|h| h.is_finished()) {
                *slot = None;
            }
        }

        let mut active = workers.iter().flatten().count() as u64;
        while active < desired {
            let vu = next_free_slot(&mut workers);
            let ctx = WorkerContext {
                vu,
                fixtures: fixtures.clone(),
                metrics: metrics.clone(),
            };
            let handle = tokio::spawn(worker_loop(ctx, iteration.clone(), target_rx.clone()));
            workers[vu as usize] = Some(handle);
            active += 1;
        }
    }

    target_tx.send_replace(0);
    for handle in workers.into_iter().flatten() {
        let _ = handle.await;
    }
    info!("all virtual users drained");
}

fn next_free_slot(workers: &mut Vec<Option<JoinHandle<()>>>) -> u64 {
    match workers.iter().position(|slot| slot.is_none()) {
        Some(index) => index as u64,
        None => {
            workers.push(None);
            (workers.len() - 1) as u64
        }
    }
}

/// One virtual user: back-to-back iterations until the published target
/// drops below its identity. Iteration errors are recorded and swallowed;
/// the loop only ends on scale-down.
async fn worker_loop<F, Fut>(ctx: WorkerContext, iteration: F, target: watch::Receiver<u64>)
where
    F: Fn(WorkerContext) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    debug!("{}: virtual user started", ctx.vu);
    loop {
        if *target.borrow() <= ctx.vu {
            break;
        }
        match iteration(ctx.clone()).await {
            Ok(()) => {
                ctx.metrics.check("iteration_ok", true);
            }
            Err(e) => {
                ctx.metrics.check("iteration_ok", false);
                warn!("{}: iteration failed: {e:#}", ctx.vu);
            }
        }
    }
    debug!("{}: virtual user stopped", ctx.vu);
}
