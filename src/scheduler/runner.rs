//! Background poll cycle

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use crate::alerts::{AlertEngine, AlertTransition, DispatchReport, EngineError, NotificationDispatcher};
use crate::data::{MonitoredEntity, StatusTick};
use crate::poller::{HealthSnapshot, HealthSource};
use crate::storage::persistence::store::SCHEDULER_KEY;
use crate::storage::{HistoryError, HistoryStore, PersistenceError, Store};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    /// Retries of a failed write before the staged state is dropped
    pub persist_retry_max: u32,
    pub persist_backoff_base: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            persist_retry_max: 3,
            persist_backoff_base: Duration::from_millis(200),
        }
    }
}

/// Durable cursor of the poll lane
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Checkpoint {
    last_snapshot_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Processed,
    /// Upstream document identical to the previous one
    Unchanged,
    /// Snapshot not newer than the last processed one
    Stale,
    FetchFailed,
}

/// Outcome of one poll cycle
#[derive(Debug)]
pub struct CycleReport {
    pub status: CycleStatus,
    pub ticks: usize,
    pub transitions: Vec<AlertTransition>,
    /// Entities whose tick was dropped because it could not be recorded
    pub discarded: Vec<String>,
    pub dispatch: DispatchReport,
}

impl CycleReport {
    fn new(status: CycleStatus) -> Self {
        Self {
            status,
            ticks: 0,
            transitions: Vec::new(),
            discarded: Vec::new(),
            dispatch: DispatchReport::default(),
        }
    }
}

/// Failure to record one tick
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Drives the poll lane
pub struct Scheduler {
    config: SchedulerConfig,
    entities: Vec<MonitoredEntity>,
    source: Arc<dyn HealthSource>,
    history: Arc<HistoryStore>,
    engine: Arc<AlertEngine>,
    dispatcher: Arc<NotificationDispatcher>,
    store: Store,
    last_snapshot_at: Mutex<Option<DateTime<Utc>>>,
    /// Serializes cycles, including manual ones
    lane: tokio::sync::Mutex<()>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        entities: Vec<MonitoredEntity>,
        source: Arc<dyn HealthSource>,
        history: Arc<HistoryStore>,
        engine: Arc<AlertEngine>,
        dispatcher: Arc<NotificationDispatcher>,
        store: Store,
    ) -> Self {
        Self {
            config,
            entities,
            source,
            history,
            engine,
            dispatcher,
            store,
            last_snapshot_at: Mutex::new(None),
            lane: tokio::sync::Mutex::new(()),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Restore the last processed snapshot time
    pub fn load(&self) -> Result<(), PersistenceError> {
        if let Some(checkpoint) = self.store.get::<Checkpoint>(SCHEDULER_KEY)? {
            *self.last_snapshot_at.lock() = checkpoint.last_snapshot_at;
        }
        Ok(())
    }

    pub fn last_snapshot_at(&self) -> Option<DateTime<Utc>> {
        *self.last_snapshot_at.lock()
    }

    /// Start the poll loop. The first cycle runs immediately.
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        tokio::spawn(async move {
            tracing::info!("Scheduler started with interval {:?}", self.config.poll_interval);

            let mut ticker = interval(self.config.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_cycle().await;
                    }
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Stop after the cycle in progress, if any
    pub async fn stop(&self) {
        let tx = self.shutdown_tx.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(()).await;
        }
    }

    /// Run one cycle
    pub async fn run_cycle(&self) -> CycleReport {
        let _lane = self.lane.lock().await;

        let snapshot = match self.source.fetch_if_changed().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return CycleReport::new(CycleStatus::Unchanged),
            Err(e) => {
                tracing::warn!(error = %e, "Status fetch failed, skipping cycle");
                return CycleReport::new(CycleStatus::FetchFailed);
            }
        };

        let last = self.last_snapshot_at();
        if last.is_some_and(|last| snapshot.taken_at <= last) {
            tracing::debug!(taken_at = %snapshot.taken_at, "Snapshot not newer than last, skipping");
            return CycleReport::new(CycleStatus::Stale);
        }

        self.process_snapshot(&snapshot).await
    }

    async fn process_snapshot(&self, snapshot: &HealthSnapshot) -> CycleReport {
        let ticks = snapshot.to_ticks(&self.entities);
        let mut report = CycleReport::new(CycleStatus::Processed);
        report.ticks = ticks.len();

        for tick in &ticks {
            match self.record_tick(tick).await {
                Ok(Some(transition)) => report.transitions.push(transition),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        entity_id = %tick.entity_id,
                        error = %e,
                        "Tick dropped, alert state left unchanged"
                    );
                    report.discarded.push(tick.entity_id.clone());
                }
            }
        }

        if report.discarded.is_empty() {
            self.advance_checkpoint(snapshot.taken_at).await;
        } else {
            // Leave the snapshot unprocessed so the next cycle retries the dropped ticks
            self.source.forget_last();
            tracing::warn!(
                taken_at = %snapshot.taken_at,
                discarded = ?report.discarded,
                "Snapshot left unprocessed"
            );
        }

        report.dispatch = self
            .dispatcher
            .dispatch(&report.transitions, snapshot.taken_at)
            .await;

        tracing::info!(
            taken_at = %snapshot.taken_at,
            ticks = report.ticks,
            transitions = report.transitions.len(),
            discarded = report.discarded.len(),
            failed_deliveries = report.dispatch.failed.len(),
            "Cycle complete"
        );
        report
    }

    /// Stage history and alert state, persist both, then install both.
    ///
    /// Nothing in memory changes unless every write succeeded.
    async fn record_tick(&self, tick: &StatusTick) -> Result<Option<AlertTransition>, CycleError> {
        // A tick can already be in history if a previous run stopped between writes
        let recorded = self
            .history
            .latest(&tick.entity_id)?
            .is_some_and(|latest| latest.at >= tick.at);
        let window = if recorded {
            None
        } else {
            Some(self.history.staged_window(&tick.entity_id, tick)?)
        };

        let staged = self.engine.stage(tick)?;
        if window.is_none() && staged.is_none() {
            return Ok(None);
        }

        self.with_retry(&tick.entity_id, || {
            if let Some(window) = &window {
                HistoryStore::persist_window(&self.store, &tick.entity_id, window)?;
            }
            if let Some(staged) = &staged {
                AlertEngine::persist_staged(&self.store, staged)?;
            }
            Ok(())
        })
        .await?;

        if window.is_some() {
            self.history.append(&tick.entity_id, tick.clone())?;
        }
        match staged {
            Some(staged) => Ok(self.engine.commit(staged)?),
            None => Ok(None),
        }
    }

    async fn advance_checkpoint(&self, taken_at: DateTime<Utc>) {
        let checkpoint = Checkpoint {
            last_snapshot_at: Some(taken_at),
        };
        let result = self
            .with_retry(SCHEDULER_KEY, || Ok(self.store.put(SCHEDULER_KEY, &checkpoint)?))
            .await;
        if let Err(e) = result {
            // Replays are absorbed by the engine's last tick time
            tracing::warn!(error = %e, "Failed to persist scheduler checkpoint");
        }
        *self.last_snapshot_at.lock() = Some(taken_at);
    }

    async fn with_retry<F>(&self, what: &str, op: F) -> Result<(), CycleError>
    where
        F: Fn() -> Result<(), CycleError>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match op() {
                Ok(()) => return Ok(()),
                Err(e) if attempts <= self.config.persist_retry_max => {
                    let delay = self
                        .config
                        .persist_backoff_base
                        .saturating_mul(1u32 << (attempts - 1).min(16));
                    tracing::warn!(
                        key = %what,
                        attempts,
                        error = %e,
                        "Persist failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
