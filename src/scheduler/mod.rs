//! Scheduler: three named periodic jobs (`index`, `enrich`, `maintenance`),
//! each its own `tokio::spawn` + `interval` loop with soft/hard timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::enrich::Enricher;
use crate::maintenance::Maintenance;
use crate::orchestrator::{Orchestrator, SubIndexer};

const SOFT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const HARD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const ENRICH_INTERVAL: Duration = Duration::from_secs(60 * 60);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    sub_indexers: Arc<Vec<SubIndexer>>,
    enricher: Arc<Enricher>,
    maintenance: Arc<Maintenance>,
    index_interval: Duration,
    trigger_immediate: bool,
}

impl Scheduler {
    pub fn new(
        orchestrator: Orchestrator,
        sub_indexers: Vec<SubIndexer>,
        enricher: Enricher,
        maintenance: Maintenance,
        index_interval_minutes: u64,
        trigger_immediate: bool,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            sub_indexers: Arc::new(sub_indexers),
            enricher: Arc::new(enricher),
            maintenance: Arc::new(maintenance),
            index_interval: Duration::from_secs(index_interval_minutes * 60),
            trigger_immediate,
        }
    }

    /// Spawns the three job loops and returns their handles; the caller owns
    /// the process lifetime and is expected to await all three (they never
    /// return under normal operation).
    pub fn spawn(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        handles.push(spawn_index_loop(
            self.orchestrator.clone(),
            self.sub_indexers.clone(),
            self.index_interval,
            self.trigger_immediate,
        ));
        handles.push(spawn_enrich_loop(self.enricher.clone()));
        handles.push(spawn_maintenance_loop(self.maintenance.clone()));

        handles
    }
}

fn spawn_index_loop(
    orchestrator: Arc<Orchestrator>,
    sub_indexers: Arc<Vec<SubIndexer>>,
    interval: Duration,
    trigger_immediate: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if trigger_immediate {
            run_index_tick(&orchestrator, &sub_indexers).await;
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // interval fires immediately once; consume it before the loop
        loop {
            ticker.tick().await;
            run_index_tick(&orchestrator, &sub_indexers).await;
        }
    })
}

/// Nests both deadlines around `task`: the soft one is expected to let the
/// in-flight unit of work (a batch, a fetch-and-merge pass) wind down on its
/// own; the hard one is the backstop that tears the whole future down —
/// including a task still running past its soft deadline — if it doesn't.
async fn with_soft_and_hard_timeout<F, T>(task: F) -> TimeoutOutcome<T>
where
    F: std::future::Future<Output = T>,
{
    match tokio::time::timeout(HARD_TIMEOUT, tokio::time::timeout(SOFT_TIMEOUT, task)).await {
        Ok(Ok(value)) => TimeoutOutcome::Completed(value),
        Ok(Err(_)) => TimeoutOutcome::SoftTimeout,
        Err(_) => TimeoutOutcome::HardTimeout,
    }
}

enum TimeoutOutcome<T> {
    Completed(T),
    SoftTimeout,
    HardTimeout,
}

async fn run_index_tick(orchestrator: &Arc<Orchestrator>, sub_indexers: &[SubIndexer]) {
    for sub in sub_indexers {
        match with_soft_and_hard_timeout(orchestrator.run_cycle_guarded(sub)).await {
            TimeoutOutcome::Completed(Ok(applied)) => {
                info!(indexer = sub.name, applied, "index tick complete")
            }
            TimeoutOutcome::Completed(Err(e)) => {
                error!(indexer = sub.name, error = %e, "index tick failed")
            }
            TimeoutOutcome::SoftTimeout => {
                warn!(indexer = sub.name, "index tick exceeded soft timeout, will resume next tick")
            }
            TimeoutOutcome::HardTimeout => {
                error!(indexer = sub.name, "index tick exceeded hard timeout, worker aborted")
            }
        }
    }
}

fn spawn_enrich_loop(enricher: Arc<Enricher>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(ENRICH_INTERVAL);
        loop {
            ticker.tick().await;
            match with_soft_and_hard_timeout(enricher.run_once()).await {
                TimeoutOutcome::Completed(_) => {}
                TimeoutOutcome::SoftTimeout => {
                    warn!("enrichment tick exceeded soft timeout, will resume next tick")
                }
                TimeoutOutcome::HardTimeout => error!("enrichment tick exceeded hard timeout, aborted"),
            }
        }
    })
}

fn spawn_maintenance_loop(maintenance: Arc<Maintenance>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            match with_soft_and_hard_timeout(maintenance.run_once()).await {
                TimeoutOutcome::Completed(_) => {}
                TimeoutOutcome::SoftTimeout => {
                    warn!("maintenance tick exceeded soft timeout, will resume next tick")
                }
                TimeoutOutcome::HardTimeout => error!("maintenance tick exceeded hard timeout, aborted"),
            }
        }
    })
}
