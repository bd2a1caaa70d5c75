//! Periodic batch jobs.
//!
//! Each job (tile build, proximity tick, crossed-path materialization, wave
//! sweep, expiry sweep) runs on its own tokio interval against a shared
//! `Arc<PresenceEngine>`. Runs are CPU-bound, so they execute on the
//! blocking pool and leave the async workers to imports. A job is a single
//! writer for the state it owns, and its loop awaits each run before the
//! next tick, so two runs of the same job never overlap. A failed run is logged and the
//! next tick simply tries again; every write a job makes is an idempotent
//! upsert, so a run cut short by its budget leaves nothing half-applied.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::engine::PresenceEngine;
use crate::error::{Error, Result};
use crate::tiles::BuildBudget;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Default: 10s.
    pub tile_build_secs: u64,
    /// Default: 15s.
    pub proximity_tick_secs: u64,
    /// Default: 300s.
    pub crossed_paths_secs: u64,
    /// Default: 60s.
    pub wave_sweep_secs: u64,
    /// Default: 60s.
    pub expiry_sweep_secs: u64,
    /// Budget for a single tile build or proximity tick (default: 5000ms).
    pub job_timeout_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tile_build_secs: 10,
            proximity_tick_secs: 15,
            crossed_paths_secs: 300,
            wave_sweep_secs: 60,
            expiry_sweep_secs: 60,
            job_timeout_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<()> {
        for job in Job::ALL {
            if self.period(job).is_zero() {
                return Err(Error::Config(format!("scheduler period for {} must be positive", job.name())));
            }
        }
        if self.job_timeout_ms == 0 {
            return Err(Error::Config("scheduler.job_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn period(&self, job: Job) -> Duration {
        let secs = match job {
            Job::TileBuild => self.tile_build_secs,
            Job::ProximityTick => self.proximity_tick_secs,
            Job::CrossedPaths => self.crossed_paths_secs,
            Job::WaveSweep => self.wave_sweep_secs,
            Job::ExpirySweep => self.expiry_sweep_secs,
        };
        Duration::from_secs(secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    TileBuild,
    ProximityTick,
    CrossedPaths,
    WaveSweep,
    ExpirySweep,
}

impl Job {
    /// In dependency order: expiry first so the tile build sees the cells it
    /// emptied, proximity before materialization.
    pub const ALL: [Job; 5] = [Job::ExpirySweep, Job::ProximityTick, Job::TileBuild, Job::CrossedPaths, Job::WaveSweep];

    pub fn name(&self) -> &'static str {
        match self {
            Job::TileBuild => "tile-build",
            Job::ProximityTick => "proximity-tick",
            Job::CrossedPaths => "crossed-paths",
            Job::WaveSweep => "wave-sweep",
            Job::ExpirySweep => "expiry-sweep",
        }
    }
}

/// Run one job at `now`.
pub fn run_job(engine: &PresenceEngine, job: Job, now: i64, budget: &BuildBudget) -> Result<()> {
    match job {
        Job::TileBuild => {
            let report = engine.run_tile_build(now, budget)?;
            if !report.completed {
                warn!("[Scheduler] Tile build ran out of budget, next run rebuilds globally");
            }
        }
        Job::ProximityTick => {
            let report = engine.run_proximity_tick(now, budget)?;
            if !report.completed {
                warn!("[Scheduler] Proximity tick ran out of budget");
            }
        }
        Job::CrossedPaths => {
            engine.materialize_crossed_paths(now);
        }
        Job::WaveSweep => {
            let report = engine.sweep_waves(now);
            debug!("[Scheduler] Wave sweep: {:?}", report);
        }
        Job::ExpirySweep => {
            engine.expire_stale(now);
        }
    }
    Ok(())
}

/// Run every job once, in dependency order. Failures are logged and do not
/// stop the remaining jobs.
pub fn run_all(engine: &PresenceEngine, now: i64, budget: &BuildBudget) -> usize {
    let mut failures = 0;
    for job in Job::ALL {
        if let Err(e) = run_job(engine, job, now, budget) {
            warn!("[Scheduler] {} failed: {}", job.name(), e);
            failures += 1;
        }
    }
    failures
}

/// Running job loops. Dropping the handle leaves them running; call
/// [`SchedulerHandle::shutdown`] to stop them.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerHandle {
    /// Signal every loop to stop and wait for in-flight runs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("[Scheduler] Job task ended abnormally: {}", e);
            }
        }
        info!("[Scheduler] Stopped");
    }
}

/// Start one loop per job on the current tokio runtime.
pub fn spawn(engine: Arc<PresenceEngine>, config: SchedulerConfig) -> SchedulerHandle {
    let (shutdown, receiver) = watch::channel(false);
    let timeout = Duration::from_millis(config.job_timeout_ms);

    let tasks = Job::ALL
        .into_iter()
        .map(|job| {
            let engine = Arc::clone(&engine);
            let mut stop = receiver.clone();
            let period = config.period(job);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                debug!("[Scheduler] {} every {:?}", job.name(), period);

                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let engine = Arc::clone(&engine);
                            let run = tokio::task::spawn_blocking(move || {
                                let now = chrono::Utc::now().timestamp();
                                let budget = BuildBudget::unlimited().with_timeout(timeout);
                                run_job(&engine, job, now, &budget)
                            });
                            match run.await {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => warn!("[Scheduler] {} failed: {}, retrying next tick", job.name(), e),
                                Err(e) => warn!("[Scheduler] {} run aborted: {}, retrying next tick", job.name(), e),
                            }
                        }
                        changed = stop.changed() => {
                            if changed.is_err() || *stop.borrow() {
                                break;
                            }
                        }
                    }
                }
                debug!("[Scheduler] {} stopped", job.name());
            })
        })
        .collect();

    info!("[Scheduler] Started {} jobs", Job::ALL.len());
    SchedulerHandle { shutdown, tasks }
}
