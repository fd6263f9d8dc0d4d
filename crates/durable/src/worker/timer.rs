//! Timer service for durable timers and activity deadline sweeps
//!
//! Polls the timers table for due timers and delivers fires to the engine.
//! The same loop sweeps the task queue for pending tasks whose
//! schedule-to-start deadline elapsed before any worker claimed them, and
//! for claimed tasks that outlived their configured heartbeat timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{EngineError, WorkflowEngine};
use crate::persistence::ProcessStore;
use crate::workflow::TimeoutType;

/// Timer service configuration
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// How often to check for due timers and expired tasks
    pub poll_interval: Duration,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Background service that fires durable timers
///
/// Timer fires are delivered through the engine, so a fire that races a
/// concurrent decision pass or a duplicate fire after a crash is absorbed
/// by the engine's history checks.
pub struct TimerService<S: ProcessStore> {
    engine: Arc<WorkflowEngine<S>>,
    config: TimerServiceConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ProcessStore> TimerService<S> {
    /// Create a new timer service
    pub fn new(engine: Arc<WorkflowEngine<S>>, config: TimerServiceConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            engine,
            config,
            shutdown_tx,
            shutdown_rx,
            handle: Mutex::new(None),
        }
    }

    /// Start the background loop
    #[instrument(skip(self))]
    pub fn start(&self) {
        let engine = Arc::clone(&self.engine);
        let poll_interval = self.config.poll_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!("Timer service started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::tick(&engine).await {
                            error!("Timer tick failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("Timer service shutting down");
                        break;
                    }
                }
            }
        });

        *self.handle.lock() = Some(handle);
    }

    /// Stop the background loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Run one sweep over due timers and expired tasks
    ///
    /// Exposed for tests and for callers that drive time themselves.
    pub async fn tick(engine: &Arc<WorkflowEngine<S>>) -> Result<(), EngineError> {
        let store = engine.store();

        for timer in store.due_timers(chrono::Utc::now()).await? {
            debug!(
                instance_id = %timer.instance_id,
                timer_id = %timer.timer_id,
                "Firing timer"
            );

            match engine
                .on_timer_fired(&timer.instance_id, &timer.timer_id)
                .await
            {
                Ok(_) => {}
                // The instance finished between scheduling and firing.
                Err(EngineError::InstanceCompleted(_)) => {}
                Err(e) => {
                    warn!(
                        instance_id = %timer.instance_id,
                        timer_id = %timer.timer_id,
                        "Timer fire failed: {}", e
                    );
                    continue;
                }
            }

            store.complete_timer(timer.id).await?;
        }

        for expired in store.take_schedule_to_start_expired().await? {
            debug!(
                instance_id = %expired.instance_id,
                activity_id = %expired.activity_id,
                "Task expired before being claimed"
            );

            match engine
                .on_activity_timed_out(
                    &expired.instance_id,
                    &expired.activity_id,
                    TimeoutType::ScheduleToStart,
                )
                .await
            {
                Ok(_) | Err(EngineError::InstanceCompleted(_)) => {}
                Err(e) => warn!(
                    instance_id = %expired.instance_id,
                    activity_id = %expired.activity_id,
                    "Schedule-to-start expiry failed: {}", e
                ),
            }
        }

        for expired in store.take_heartbeat_expired().await? {
            debug!(
                instance_id = %expired.instance_id,
                activity_id = %expired.activity_id,
                "Claimed task stopped heartbeating"
            );

            match engine
                .on_activity_timed_out(
                    &expired.instance_id,
                    &expired.activity_id,
                    TimeoutType::Heartbeat,
                )
                .await
            {
                Ok(_) | Err(EngineError::InstanceCompleted(_)) => {}
                Err(e) => warn!(
                    instance_id = %expired.instance_id,
                    activity_id = %expired.activity_id,
                    "Heartbeat expiry failed: {}", e
                ),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryProcessStore, ProcessStatus};
    use crate::workflow::{Workflow, WorkflowAction, WorkflowContext};
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Empty {}

    struct ReminderWorkflow {
        reminded: bool,
    }

    impl Workflow for ReminderWorkflow {
        const TYPE: &'static str = "reminder";
        type Input = Empty;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self { reminded: false }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer(
                "remind",
                Duration::from_millis(0),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_timer_fired(
            &mut self,
            _ctx: &mut WorkflowContext,
            _timer_id: &str,
        ) -> Vec<WorkflowAction> {
            self.reminded = true;
            vec![WorkflowAction::complete(json!({"reminded": true}))]
        }

        fn is_completed(&self) -> bool {
            self.reminded
        }

        fn result(&self) -> Option<Self::Output> {
            self.reminded.then(|| json!({"reminded": true}))
        }
    }

    #[tokio::test]
    async fn test_tick_fires_due_timer() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<ReminderWorkflow>();
        let engine = Arc::new(engine);

        engine
            .start_workflow::<ReminderWorkflow>("rem_1", "reminders", Empty {})
            .await
            .unwrap();

        let status = engine.store().get_instance_status("rem_1").await.unwrap();
        assert_eq!(status, ProcessStatus::Running);

        // Zero-duration timer is already due
        TimerService::tick(&engine).await.unwrap();

        let status = engine.store().get_instance_status("rem_1").await.unwrap();
        assert_eq!(status, ProcessStatus::Completed);

        // Fired timers are gone; a second sweep is a no-op
        TimerService::tick(&engine).await.unwrap();
        assert!(engine
            .store()
            .due_timers(chrono::Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    struct ExportWorkflow {
        failed: Option<crate::workflow::WorkflowError>,
    }

    impl Workflow for ExportWorkflow {
        const TYPE: &'static str = "export";
        type Input = Empty;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self { failed: None }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::schedule_activity_with_options(
                "export",
                "export_report",
                json!({}),
                crate::workflow::ActivityOptions::default()
                    .with_heartbeat(Duration::from_millis(0)),
            )]
        }

        fn on_activity_completed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            _result: Value,
        ) -> Vec<WorkflowAction> {
            vec![]
        }

        fn on_activity_failed(
            &mut self,
            _ctx: &mut WorkflowContext,
            _activity_id: &str,
            error: &crate::activity::ActivityError,
        ) -> Vec<WorkflowAction> {
            let err = crate::workflow::WorkflowError::new(&error.message);
            self.failed = Some(err.clone());
            vec![WorkflowAction::fail(err)]
        }

        fn is_completed(&self) -> bool {
            self.failed.is_some()
        }

        fn result(&self) -> Option<Self::Output> {
            None
        }

        fn error(&self) -> Option<crate::workflow::WorkflowError> {
            self.failed.clone()
        }
    }

    #[tokio::test]
    async fn test_tick_times_out_silent_claimed_activity() {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<ExportWorkflow>();
        let engine = Arc::new(engine);

        engine
            .start_workflow::<ExportWorkflow>("exp_1", "exports", Empty {})
            .await
            .unwrap();

        // A worker claims the task and then goes silent
        let claimed = engine
            .store()
            .claim_tasks("worker-1", "exports", &["export_report".to_string()], 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        tokio::time::sleep(Duration::from_millis(10)).await;
        TimerService::tick(&engine).await.unwrap();

        let info = engine.store().get_instance("exp_1").await.unwrap();
        assert_eq!(info.status, ProcessStatus::Failed);
        assert_eq!(
            info.error.map(|e| e.message),
            Some("activity stopped heartbeating".to_string())
        );

        let events = engine.store().load_events("exp_1").await.unwrap();
        assert!(events.iter().any(|(_, e)| matches!(
            e,
            crate::workflow::WorkflowEvent::ActivityTimedOut {
                timeout_type: TimeoutType::Heartbeat,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_service_start_and_shutdown() {
        let engine = Arc::new(WorkflowEngine::new(InMemoryProcessStore::new()));
        let service = TimerService::new(
            engine,
            TimerServiceConfig {
                poll_interval: Duration::from_millis(10),
            },
        );

        service.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        service.shutdown().await;
    }
}
