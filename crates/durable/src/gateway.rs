//! Client gateway
//!
//! External-facing entry point over the engine and scheduler. The handle has
//! an explicit lifecycle: callers construct it around a shared engine and
//! pass it where it is needed, nothing is ambient.

use std::sync::Arc;

use serde_json::Value;
use tracing::instrument;

use crate::engine::{EngineError, StartOutcome, WorkflowEngine};
use crate::persistence::{InstanceInfo, ProcessStatus, ProcessStore};
use crate::scheduler::{ScheduleSpec, Scheduler, SchedulerError};
use crate::worker::TimerService;
use crate::workflow::{Workflow, WorkflowError, WorkflowSignal};

/// Gateway errors
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Scheduler error
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Instance has not finished yet
    #[error("instance {0} is still running")]
    StillRunning(String),
}

/// Handle for external callers
///
/// Wraps the engine and scheduler behind the operations a client needs:
/// starting processes, sending signals, inspecting results, terminating,
/// and registering schedules. The handle has an explicit lifecycle:
/// [`open`](Self::open) starts the background services and
/// [`close`](Self::close) drains and stops them.
///
/// # Example
///
/// ```ignore
/// use windlass_durable::prelude::*;
///
/// let handle = EngineHandle::new(engine, scheduler)
///     .with_timer_service(timer_service);
/// handle.open();
///
/// handle
///     .start_process::<OrderProcessing>("order_1", "order-processing", order)
///     .await?;
/// handle
///     .send_signal("order_1", "payment-notification-signal", json!({"ok": true}))
///     .await?;
///
/// handle.close().await;
/// ```
pub struct EngineHandle<S: ProcessStore> {
    engine: Arc<WorkflowEngine<S>>,
    scheduler: Arc<Scheduler<S>>,
    timer_service: Option<Arc<TimerService<S>>>,
}

impl<S: ProcessStore> EngineHandle<S> {
    /// Create a handle over an engine and scheduler
    pub fn new(engine: Arc<WorkflowEngine<S>>, scheduler: Arc<Scheduler<S>>) -> Self {
        Self {
            engine,
            scheduler,
            timer_service: None,
        }
    }

    /// Attach a timer service to the handle's lifecycle
    pub fn with_timer_service(mut self, timer_service: Arc<TimerService<S>>) -> Self {
        self.timer_service = Some(timer_service);
        self
    }

    /// Start the background services behind the handle
    ///
    /// Spawns the scheduler tick loop and, when one is attached, the timer
    /// service. Safe to call once per handle; processes can be started and
    /// signalled before opening, but cron fires and durable timers only
    /// advance while the handle is open.
    pub fn open(&self) {
        self.scheduler.start();
        if let Some(timer_service) = &self.timer_service {
            timer_service.start();
        }
    }

    /// Stop the background services, draining their tick loops
    pub async fn close(&self) {
        self.scheduler.shutdown().await;
        if let Some(timer_service) = &self.timer_service {
            timer_service.shutdown().await;
        }
    }

    /// Get the underlying engine
    pub fn engine(&self) -> &Arc<WorkflowEngine<S>> {
        &self.engine
    }

    /// Start a process instance
    ///
    /// Idempotent per instance id: repeating a start with the same input is
    /// absorbed, reusing the id with a different input is rejected.
    pub async fn start_process<W: Workflow>(
        &self,
        instance_id: &str,
        task_queue: &str,
        input: W::Input,
    ) -> Result<StartOutcome, GatewayError> {
        Ok(self
            .engine
            .start_workflow::<W>(instance_id, task_queue, input)
            .await?)
    }

    /// Start a process instance by workflow type name
    pub async fn start_process_by_type(
        &self,
        workflow_type: &str,
        instance_id: &str,
        task_queue: &str,
        input: Value,
    ) -> Result<StartOutcome, GatewayError> {
        Ok(self
            .engine
            .start_by_type(workflow_type, instance_id, task_queue, input)
            .await?)
    }

    /// Send a signal to a running instance
    ///
    /// Fails if the target instance does not exist or already finished.
    #[instrument(skip(self, payload))]
    pub async fn send_signal(
        &self,
        instance_id: &str,
        signal_name: &str,
        payload: Value,
    ) -> Result<(), GatewayError> {
        self.engine
            .send_signal(instance_id, WorkflowSignal::new(signal_name, payload))
            .await?;
        Ok(())
    }

    /// Get the status of an instance
    pub async fn get_status(&self, instance_id: &str) -> Result<ProcessStatus, GatewayError> {
        Ok(self
            .engine
            .store()
            .get_instance_status(instance_id)
            .await
            .map_err(EngineError::from)?)
    }

    /// Get full instance information
    pub async fn describe(&self, instance_id: &str) -> Result<InstanceInfo, GatewayError> {
        Ok(self
            .engine
            .store()
            .get_instance(instance_id)
            .await
            .map_err(EngineError::from)?)
    }

    /// Get the result of a finished instance
    ///
    /// Returns the recorded result on completion, the recorded error on
    /// failure or termination, and [`GatewayError::StillRunning`] otherwise.
    pub async fn get_result(
        &self,
        instance_id: &str,
    ) -> Result<Result<Value, WorkflowError>, GatewayError> {
        let info = self.describe(instance_id).await?;

        match info.status {
            ProcessStatus::Running => Err(GatewayError::StillRunning(instance_id.to_string())),
            ProcessStatus::Completed => Ok(Ok(info.result.unwrap_or(Value::Null))),
            ProcessStatus::Failed | ProcessStatus::Terminated => Ok(Err(info
                .error
                .unwrap_or_else(|| WorkflowError::new(format!("instance {}", info.status))))),
        }
    }

    /// Terminate a running instance
    pub async fn terminate(&self, instance_id: &str, reason: &str) -> Result<(), GatewayError> {
        self.engine.terminate(instance_id, reason).await?;
        Ok(())
    }

    /// Register a recurring schedule
    pub fn create_schedule(
        &self,
        schedule_id: &str,
        spec: ScheduleSpec,
    ) -> Result<(), GatewayError> {
        self.scheduler.create_schedule(schedule_id, spec)?;
        Ok(())
    }

    /// Remove a schedule
    pub fn delete_schedule(&self, schedule_id: &str) -> Result<(), GatewayError> {
        self.scheduler.delete_schedule(schedule_id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryProcessStore;
    use crate::scheduler::SchedulerConfig;
    use crate::workflow::{WorkflowAction, WorkflowContext};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct PingInput {
        value: i64,
    }

    struct PingWorkflow {
        value: i64,
        acked: bool,
    }

    impl Workflow for PingWorkflow {
        const TYPE: &'static str = "ping";
        type Input = PingInput;
        type Output = Value;

        fn new(input: Self::Input) -> Self {
            Self {
                value: input.value,
                acked: false,
            }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::await_signal("ack")]
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

        fn on_signal(
            &mut self,
            _ctx: &mut WorkflowContext,
            signal: &WorkflowSignal,
        ) -> Vec<WorkflowAction> {
            self.acked = true;
            vec![WorkflowAction::complete(
                json!({ "value": self.value, "ack": signal.payload }),
            )]
        }

        fn is_completed(&self) -> bool {
            self.acked
        }

        fn result(&self) -> Option<Self::Output> {
            self.acked.then(|| json!({ "value": self.value }))
        }
    }

    fn test_handle() -> EngineHandle<InMemoryProcessStore> {
        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<PingWorkflow>();
        let engine = Arc::new(engine);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            SchedulerConfig::default(),
        ));
        EngineHandle::new(engine, scheduler)
    }

    #[tokio::test]
    async fn test_start_signal_and_result() {
        let handle = test_handle();

        let outcome = handle
            .start_process::<PingWorkflow>("ping_1", "pings", PingInput { value: 7 })
            .await
            .unwrap();
        assert_eq!(outcome, StartOutcome::Started);

        assert_eq!(
            handle.get_status("ping_1").await.unwrap(),
            ProcessStatus::Running
        );
        assert!(matches!(
            handle.get_result("ping_1").await,
            Err(GatewayError::StillRunning(_))
        ));

        handle
            .send_signal("ping_1", "ack", json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(
            handle.get_status("ping_1").await.unwrap(),
            ProcessStatus::Completed
        );
        let result = handle.get_result("ping_1").await.unwrap().unwrap();
        assert_eq!(result["value"], json!(7));
    }

    #[tokio::test]
    async fn test_terminate_surfaces_error_result() {
        let handle = test_handle();

        handle
            .start_process::<PingWorkflow>("ping_2", "pings", PingInput { value: 1 })
            .await
            .unwrap();
        handle.terminate("ping_2", "operator request").await.unwrap();

        let result = handle.get_result("ping_2").await.unwrap();
        assert!(result.is_err());

        // Signals to a terminated instance are rejected
        let sent = handle.send_signal("ping_2", "ack", json!(null)).await;
        assert!(matches!(
            sent,
            Err(GatewayError::Engine(EngineError::InstanceCompleted(_)))
        ));
    }

    struct SnoozeWorkflow {
        done: bool,
    }

    impl Workflow for SnoozeWorkflow {
        const TYPE: &'static str = "snooze";
        type Input = Value;
        type Output = Value;

        fn new(_input: Self::Input) -> Self {
            Self { done: false }
        }

        fn on_start(&mut self, _ctx: &mut WorkflowContext) -> Vec<WorkflowAction> {
            vec![WorkflowAction::timer(
                "snooze",
                std::time::Duration::from_millis(10),
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
            self.done = true;
            vec![WorkflowAction::complete(json!({"slept": true}))]
        }

        fn is_completed(&self) -> bool {
            self.done
        }

        fn result(&self) -> Option<Self::Output> {
            self.done.then(|| json!({"slept": true}))
        }
    }

    #[tokio::test]
    async fn test_open_runs_services_and_close_stops_them() {
        use crate::worker::{TimerService, TimerServiceConfig};

        let mut engine = WorkflowEngine::new(InMemoryProcessStore::new());
        engine.register::<SnoozeWorkflow>();
        let engine = Arc::new(engine);
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&engine),
            SchedulerConfig::default(),
        ));
        let timer_service = Arc::new(TimerService::new(
            Arc::clone(&engine),
            TimerServiceConfig {
                poll_interval: std::time::Duration::from_millis(10),
            },
        ));

        let handle = EngineHandle::new(Arc::clone(&engine), scheduler)
            .with_timer_service(timer_service);
        handle.open();

        handle
            .start_process::<SnoozeWorkflow>("snooze_1", "snoozes", json!({}))
            .await
            .unwrap();

        // The timer fires only because open() put the services to work
        let mut status = handle.get_status("snooze_1").await.unwrap();
        for _ in 0..100 {
            if status.is_terminal() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            status = handle.get_status("snooze_1").await.unwrap();
        }
        assert_eq!(status, ProcessStatus::Completed);

        handle.close().await;
    }

    #[tokio::test]
    async fn test_schedule_registration_via_gateway() {
        let handle = test_handle();

        let spec = ScheduleSpec::new("0 0 2 * * *", "ping", "pings", json!({"value": 0}));
        handle.create_schedule("nightly-ping", spec.clone()).unwrap();

        assert!(matches!(
            handle.create_schedule("nightly-ping", spec),
            Err(GatewayError::Scheduler(SchedulerError::AlreadyExists(_)))
        ));

        handle.delete_schedule("nightly-ping").unwrap();
    }
}
