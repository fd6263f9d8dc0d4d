//! Cron scheduler driving recurring instance launches

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{EngineError, StartOutcome, WorkflowEngine};
use crate::persistence::{ProcessStatus, ProcessStore, StoreError};

use super::spec::{OverlapPolicy, ScheduleSpec};

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often schedules are evaluated
    pub tick_interval: Duration,

    /// Upper bound on fires replayed per schedule per tick (catch-up safety)
    pub max_fires_per_tick: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_fires_per_tick: 32,
        }
    }
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// Schedule id already registered
    #[error("schedule already exists: {0}")]
    AlreadyExists(String),

    /// Schedule not found
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Cron expression failed to parse
    #[error("invalid cron expression {expression:?}: {message}")]
    InvalidCron { expression: String, message: String },

    /// Unknown timezone name
    #[error("invalid timezone: {0}")]
    InvalidTimeZone(String),

    /// Engine error while launching
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

struct ScheduleEntry {
    spec: ScheduleSpec,
    schedule: Schedule,
    tz: Tz,
    /// Fire time of the most recently handled fire (launched, skipped, or
    /// buffered). Fires at or before this are never re-evaluated.
    last_fire: Option<DateTime<Utc>>,
    /// Instance launched by the most recent non-skipped fire
    last_instance_id: Option<String>,
    /// Deferred fire under BufferOne
    buffered_fire: Option<DateTime<Utc>>,
}

/// Cron scheduler
///
/// Evaluates registered schedules on a tick loop and asks the engine to
/// launch instances for due fires. Launch ids are `{schedule_id}-{epoch}`
/// of the fire time, so re-requesting a fire after a restart is a no-op.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::scheduler::{Scheduler, ScheduleSpec, OverlapPolicy};
///
/// let scheduler = Scheduler::new(engine, SchedulerConfig::default());
/// scheduler.create_schedule(
///     "nightly-report",
///     ScheduleSpec::new("0 0 2 * * *", "daily_report", "reports", json!({}))
///         .with_overlap_policy(OverlapPolicy::Skip),
/// )?;
/// scheduler.start();
/// ```
pub struct Scheduler<S: ProcessStore> {
    engine: Arc<WorkflowEngine<S>>,
    config: SchedulerConfig,
    schedules: Arc<Mutex<HashMap<String, ScheduleEntry>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ProcessStore> Scheduler<S> {
    /// Create a new scheduler
    pub fn new(engine: Arc<WorkflowEngine<S>>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            config,
            schedules: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Register a schedule
    ///
    /// The cron expression and timezone are validated here, not at fire
    /// time. Fails with [`SchedulerError::AlreadyExists`] on a duplicate id.
    #[instrument(skip(self, spec))]
    pub fn create_schedule(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
    ) -> Result<(), SchedulerError> {
        let schedule =
            Schedule::from_str(&spec.cron_expression).map_err(|e| SchedulerError::InvalidCron {
                expression: spec.cron_expression.clone(),
                message: e.to_string(),
            })?;

        let tz: Tz = spec
            .time_zone
            .parse()
            .map_err(|_| SchedulerError::InvalidTimeZone(spec.time_zone.clone()))?;

        let mut schedules = self.schedules.lock();
        if schedules.contains_key(schedule_id) {
            return Err(SchedulerError::AlreadyExists(schedule_id.to_string()));
        }

        info!(
            %schedule_id,
            cron = %spec.cron_expression,
            workflow_type = %spec.workflow_type,
            policy = ?spec.overlap_policy,
            "Schedule registered"
        );

        schedules.insert(
            schedule_id.to_string(),
            ScheduleEntry {
                spec,
                schedule,
                tz,
                last_fire: None,
                last_instance_id: None,
                buffered_fire: None,
            },
        );

        Ok(())
    }

    /// Remove a schedule
    ///
    /// Instances it already launched keep running.
    pub fn delete_schedule(&self, schedule_id: &str) -> Result<(), SchedulerError> {
        self.schedules
            .lock()
            .remove(schedule_id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::ScheduleNotFound(schedule_id.to_string()))
    }

    /// Get registered schedule ids
    pub fn schedule_ids(&self) -> Vec<String> {
        self.schedules.lock().keys().cloned().collect()
    }

    /// Start the tick loop
    pub fn start(&self) {
        let engine = Arc::clone(&self.engine);
        let schedules = Arc::clone(&self.schedules);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.tick_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!("Scheduler started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) =
                            Self::tick(&engine, &schedules, &config, Utc::now()).await
                        {
                            error!("Scheduler tick failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// Stop the tick loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Evaluate all schedules at the given time
    ///
    /// Exposed for tests and for callers that drive time themselves.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<(), SchedulerError> {
        Self::tick(&self.engine, &self.schedules, &self.config, now).await
    }

    async fn tick(
        engine: &Arc<WorkflowEngine<S>>,
        schedules: &Arc<Mutex<HashMap<String, ScheduleEntry>>>,
        config: &SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerError> {
        // Snapshot the work under the lock, then launch without holding it.
        struct Pending {
            schedule_id: String,
            fires: Vec<DateTime<Utc>>,
            buffered: Option<DateTime<Utc>>,
            spec: ScheduleSpec,
            last_instance_id: Option<String>,
        }

        let pending: Vec<Pending> = {
            let mut map = schedules.lock();
            map.iter_mut()
                .map(|(id, entry)| {
                    let fires = due_fires(
                        &entry.schedule,
                        entry.tz,
                        entry.last_fire,
                        entry.spec.catch_up_window,
                        now,
                        config.max_fires_per_tick,
                    );
                    if let Some(last) = fires.last() {
                        entry.last_fire = Some(*last);
                    } else if entry.last_fire.is_none() {
                        // First evaluation anchors the schedule; earlier fire
                        // times are never backfilled without a catch-up window.
                        entry.last_fire = Some(now);
                    }
                    Pending {
                        schedule_id: id.clone(),
                        fires,
                        buffered: entry.buffered_fire,
                        spec: entry.spec.clone(),
                        last_instance_id: entry.last_instance_id.clone(),
                    }
                })
                .collect()
        };

        for mut item in pending {
            // A deferred fire launches once the previous instance finishes.
            if let Some(buffered) = item.buffered {
                let running =
                    previous_running(engine, item.last_instance_id.as_deref()).await?;
                if !running {
                    let instance_id =
                        Self::launch(engine, &item.schedule_id, &item.spec, buffered).await?;
                    let mut map = schedules.lock();
                    if let Some(entry) = map.get_mut(&item.schedule_id) {
                        entry.buffered_fire = None;
                        entry.last_instance_id = Some(instance_id.clone());
                    }
                    item.last_instance_id = Some(instance_id);
                }
            }

            for fire in item.fires {
                let running =
                    previous_running(engine, item.last_instance_id.as_deref()).await?;

                let launch = match item.spec.overlap_policy {
                    OverlapPolicy::AllowAll => true,
                    OverlapPolicy::Skip => {
                        if running {
                            debug!(
                                schedule_id = %item.schedule_id,
                                %fire,
                                "Fire skipped, previous instance still running"
                            );
                        }
                        !running
                    }
                    OverlapPolicy::BufferOne => {
                        if running {
                            debug!(
                                schedule_id = %item.schedule_id,
                                %fire,
                                "Fire buffered, previous instance still running"
                            );
                            let mut map = schedules.lock();
                            if let Some(entry) = map.get_mut(&item.schedule_id) {
                                entry.buffered_fire = Some(fire);
                            }
                        }
                        !running
                    }
                    OverlapPolicy::CancelOther => {
                        if running {
                            if let Some(prev) = item.last_instance_id.as_deref() {
                                match engine.terminate(prev, "superseded by schedule fire").await
                                {
                                    Ok(())
                                    | Err(EngineError::InstanceCompleted(_))
                                    | Err(EngineError::Store(StoreError::InstanceNotFound(
                                        _,
                                    ))) => {}
                                    Err(e) => return Err(e.into()),
                                }
                            }
                        }
                        true
                    }
                };

                if launch {
                    let instance_id =
                        Self::launch(engine, &item.schedule_id, &item.spec, fire).await?;
                    let mut map = schedules.lock();
                    if let Some(entry) = map.get_mut(&item.schedule_id) {
                        entry.last_instance_id = Some(instance_id.clone());
                    }
                    item.last_instance_id = Some(instance_id);
                }
            }
        }

        Ok(())
    }

    async fn launch(
        engine: &Arc<WorkflowEngine<S>>,
        schedule_id: &str,
        spec: &ScheduleSpec,
        fire: DateTime<Utc>,
    ) -> Result<String, SchedulerError> {
        let instance_id = format!("{schedule_id}-{}", fire.timestamp());

        match engine
            .start_by_type(
                &spec.workflow_type,
                &instance_id,
                &spec.task_queue,
                spec.input.clone(),
            )
            .await
        {
            Ok(StartOutcome::Started) => {
                info!(%schedule_id, %instance_id, %fire, "Schedule fire launched instance");
            }
            Ok(StartOutcome::AlreadyRunning) => {
                debug!(%schedule_id, %instance_id, "Fire already launched, absorbed");
            }
            Err(e) => {
                warn!(%schedule_id, %instance_id, "Schedule launch failed: {}", e);
                return Err(e.into());
            }
        }

        Ok(instance_id)
    }
}

/// Whether the given instance exists and is still running
async fn previous_running<S: ProcessStore>(
    engine: &Arc<WorkflowEngine<S>>,
    instance_id: Option<&str>,
) -> Result<bool, SchedulerError> {
    let Some(instance_id) = instance_id else {
        return Ok(false);
    };

    match engine.store().get_instance_status(instance_id).await {
        Ok(status) => Ok(status == ProcessStatus::Running),
        Err(StoreError::InstanceNotFound(_)) => Ok(false),
        Err(e) => Err(SchedulerError::Engine(e.into())),
    }
}

/// Compute due fire times for a schedule
///
/// Without a recorded last fire, evaluation starts at `now` minus the
/// catch-up window, or at `now` when no window is configured. Fires are
/// never backfilled past the window.
fn due_fires(
    schedule: &Schedule,
    tz: Tz,
    last_fire: Option<DateTime<Utc>>,
    catch_up_window: Option<Duration>,
    now: DateTime<Utc>,
    max_fires: usize,
) -> Vec<DateTime<Utc>> {
    let window_start = match catch_up_window {
        Some(window) => now - chrono::Duration::from_std(window).unwrap_or_default(),
        None => now,
    };

    let start = match last_fire {
        Some(last) => last.max(window_start),
        None => window_start,
    };

    let start_tz = start.with_timezone(&tz);
    let now_tz = now.with_timezone(&tz);

    schedule
        .after(&start_tz)
        .take_while(|t| *t <= now_tz)
        .take(max_fires)
        .map(|t| t.with_timezone(&Utc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryProcessStore;
    use crate::workflow::{Workflow, WorkflowAction, WorkflowContext};
    use chrono::TimeZone;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct ReportInput {
        name: String,
    }

    /// Stays running until its single activity completes; no worker runs in
    /// these tests, so launched instances remain Running.
    struct ReportWorkflow {
        done: bool,
    }

    impl Workflow for ReportWorkflow {
        const TYPE: &'static str = "daily_report";
        type Input = ReportInput;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self { done: false }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity(
                "build",
                "build_report",
                json!({}),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            self.done = true;
            vec![WorkflowAction::complete(json!({}))]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn is_completed(&self) -> bool {
            self.done
        }

        fn result(&self) -> Option<Self::Output> {
            self.done.then(|| json!({}))
        }
    }

    fn test_engine() -> Arc<WorkflowEngine<InMemoryProcessStore>> {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<ReportWorkflow>();
        Arc::new(engine)
    }

    fn test_spec(policy: OverlapPolicy) -> ScheduleSpec {
        // Every second
        ScheduleSpec::new(
            "* * * * * *",
            "daily_report",
            "reports",
            json!({ "name": "nightly" }),
        )
        .with_overlap_policy(policy)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_schedule_rejected() {
        let scheduler = Scheduler::new(test_engine(), SchedulerConfig::default());

        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::Skip))
            .unwrap();
        assert!(matches!(
            scheduler.create_schedule("nightly", test_spec(OverlapPolicy::Skip)),
            Err(SchedulerError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_cron_rejected_at_registration() {
        let scheduler = Scheduler::new(test_engine(), SchedulerConfig::default());

        let mut spec = test_spec(OverlapPolicy::Skip);
        spec.cron_expression = "not a cron".to_string();
        assert!(matches!(
            scheduler.create_schedule("bad", spec),
            Err(SchedulerError::InvalidCron { .. })
        ));

        let mut spec = test_spec(OverlapPolicy::Skip);
        spec.time_zone = "Mars/Olympus".to_string();
        assert!(matches!(
            scheduler.create_schedule("bad", spec),
            Err(SchedulerError::InvalidTimeZone(_))
        ));
    }

    #[tokio::test]
    async fn test_skip_policy_drops_overlapping_fire() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::Skip))
            .unwrap();

        // First evaluation anchors, second launches
        scheduler.tick_at(at(1)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 0);
        scheduler.tick_at(at(2)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 1);

        // First instance has no worker, stays Running; next fire is dropped
        scheduler.tick_at(at(3)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 1);
    }

    #[tokio::test]
    async fn test_allow_all_launches_unconditionally() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::AllowAll))
            .unwrap();

        scheduler.tick_at(at(1)).await.unwrap();
        scheduler.tick_at(at(2)).await.unwrap();
        scheduler.tick_at(at(3)).await.unwrap();
        scheduler.tick_at(at(4)).await.unwrap();

        assert_eq!(engine.store().instance_count(), 3);
    }

    #[tokio::test]
    async fn test_cancel_other_terminates_previous() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::CancelOther))
            .unwrap();

        scheduler.tick_at(at(1)).await.unwrap();
        scheduler.tick_at(at(2)).await.unwrap();
        scheduler.tick_at(at(3)).await.unwrap();

        assert_eq!(engine.store().instance_count(), 2);

        let first_id = format!("nightly-{}", at(2).timestamp());
        let status = engine.store().get_instance_status(&first_id).await.unwrap();
        assert_eq!(status, ProcessStatus::Terminated);

        let second_id = format!("nightly-{}", at(3).timestamp());
        let status = engine.store().get_instance_status(&second_id).await.unwrap();
        assert_eq!(status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_buffer_one_defers_single_fire() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::BufferOne))
            .unwrap();

        scheduler.tick_at(at(1)).await.unwrap();
        scheduler.tick_at(at(2)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 1);

        // Two overlapping fires: only the newest is buffered
        scheduler.tick_at(at(3)).await.unwrap();
        scheduler.tick_at(at(4)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 1);

        // Finish the first instance, then the buffered fire launches
        let first_id = format!("nightly-{}", at(2).timestamp());
        engine.terminate(&first_id, "test").await.unwrap();

        // A tick past the last fire with no new due fires still drains the buffer
        scheduler.tick_at(at(4)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 2);

        let buffered_id = format!("nightly-{}", at(4).timestamp());
        let status = engine
            .store()
            .get_instance_status(&buffered_id)
            .await
            .unwrap();
        assert_eq!(status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn test_missed_fires_dropped_without_catch_up() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::AllowAll))
            .unwrap();

        // First evaluation long after registration: no backfill
        scheduler.tick_at(at(100)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 0);

        scheduler.tick_at(at(101)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 1);
    }

    #[tokio::test]
    async fn test_catch_up_window_replays_missed_fires() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule(
                "nightly",
                test_spec(OverlapPolicy::AllowAll)
                    .with_catch_up_window(Duration::from_secs(3)),
            )
            .unwrap();

        // Fires at t-2, t-1, t fall inside the window and replay in order
        scheduler.tick_at(at(100)).await.unwrap();
        assert_eq!(engine.store().instance_count(), 3);

        for secs in [98, 99, 100] {
            let id = format!("nightly-{}", at(secs).timestamp());
            assert_eq!(
                engine.store().get_instance_status(&id).await.unwrap(),
                ProcessStatus::Running
            );
        }
    }

    #[tokio::test]
    async fn test_restart_does_not_relaunch_same_fire() {
        let engine = test_engine();
        let scheduler = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler
            .create_schedule(
                "nightly",
                test_spec(OverlapPolicy::AllowAll)
                    .with_catch_up_window(Duration::from_secs(2)),
            )
            .unwrap();

        scheduler.tick_at(at(10)).await.unwrap();
        let count = engine.store().instance_count();

        // A fresh scheduler (restart) covering the same fires is absorbed by
        // the deterministic instance ids
        let scheduler2 = Scheduler::new(Arc::clone(&engine), SchedulerConfig::default());
        scheduler2
            .create_schedule(
                "nightly",
                test_spec(OverlapPolicy::AllowAll)
                    .with_catch_up_window(Duration::from_secs(2)),
            )
            .unwrap();
        scheduler2.tick_at(at(10)).await.unwrap();

        assert_eq!(engine.store().instance_count(), count);
    }

    #[tokio::test]
    async fn test_delete_schedule() {
        let scheduler = Scheduler::new(test_engine(), SchedulerConfig::default());
        scheduler
            .create_schedule("nightly", test_spec(OverlapPolicy::Skip))
            .unwrap();

        scheduler.delete_schedule("nightly").unwrap();
        assert!(scheduler.schedule_ids().is_empty());
        assert!(matches!(
            scheduler.delete_schedule("nightly"),
            Err(SchedulerError::ScheduleNotFound(_))
        ));
    }
}
