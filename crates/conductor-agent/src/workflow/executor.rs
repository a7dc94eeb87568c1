use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conductor_core::config::{FailureStrategy, WorkflowConfig};
use conductor_core::error::{AgentError, ErrorCode};
use conductor_core::event::EventBus;
use conductor_core::types::{
    EventKind, ExecutionContext, LifecycleEvent, Metadata, Payload, StepResult, WorkflowResult,
};

use super::step::{Step, StepOptions};
use crate::race;

/// Runs named steps in order over a shared [`ExecutionContext`].
///
/// The whole step loop races against the configured timeout. Each step may
/// be guarded by a condition; a false condition is recorded as a successful
/// skip. What happens after a failing step depends on the configured
/// [`FailureStrategy`].
///
/// `execute` takes `&mut self`, so one instance runs one workflow at a time.
/// The instance is reusable across runs; use one instance per concurrent run.
pub struct Workflow<T: Payload> {
    config: WorkflowConfig,
    steps: Vec<Step<T>>,
    event_bus: Arc<EventBus>,
    context: Option<ExecutionContext<T>>,
}

impl<T: Payload> Workflow<T> {
    pub fn new(config: WorkflowConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            steps: Vec::new(),
            event_bus,
            context: None,
        }
    }

    /// Workflow with default configuration and a private event bus.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(WorkflowConfig::named(name), Arc::new(EventBus::default()))
    }

    /// Register an unconditional step.
    pub fn step<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        self.step_with(name, handler, StepOptions::new())
    }

    /// Register a step with a condition and/or error hook.
    pub fn step_with<F, Fut>(
        mut self,
        name: impl Into<String>,
        handler: F,
        options: StepOptions<T>,
    ) -> Self
    where
        F: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        self.steps.push(Step::new(name, handler).with_options(options));
        self
    }

    /// Register a step that only runs when `condition` holds.
    pub fn when<C, F, Fut>(self, condition: C, name: impl Into<String>, handler: F) -> Self
    where
        C: Fn(&ExecutionContext<T>) -> bool + Send + Sync + 'static,
        F: Fn(ExecutionContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<T>>> + Send + 'static,
    {
        self.step_with(name, handler, StepOptions::new().when(condition))
    }

    /// Append a pre-built step.
    pub fn add_step(&mut self, step: Step<T>) -> &mut Self {
        self.steps.push(step);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Registered step names, in execution order.
    pub fn steps(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Copy of the last run's context.
    pub fn get_context(&self) -> Option<ExecutionContext<T>> {
        self.context.clone()
    }

    pub fn get_config(&self) -> WorkflowConfig {
        self.config.clone()
    }

    /// Drop all steps and the last context.
    pub fn clear(&mut self) {
        self.steps.clear();
        self.context = None;
    }

    pub async fn execute(&mut self, input: T) -> WorkflowResult<T> {
        self.execute_with_metadata(input, Metadata::new()).await
    }

    /// Run every step against a fresh context seeded with `input`.
    ///
    /// Never returns an error: failures, including timeouts, are reported
    /// through `success` and `error` on the result.
    pub async fn execute_with_metadata(&mut self, input: T, metadata: Metadata) -> WorkflowResult<T> {
        let start = Instant::now();
        let name = self.config.name.clone();
        let context = ExecutionContext::with_metadata(input, metadata);
        let run_id = context.id.clone();

        info!(workflow = %name, run_id = %run_id, steps = self.steps.len(), "Workflow started");
        self.event_bus.publish(
            LifecycleEvent::new(EventKind::WorkflowStart, &name).with_data(serde_json::json!({
                "workflow": name,
                "steps": self.steps.len(),
                "run_id": run_id,
            })),
        );

        let progress = Arc::new(Mutex::new(context.clone()));
        let run = StepLoop {
            workflow: name.clone(),
            steps: self.steps.clone(),
            strategy: self.config.on_error,
            event_bus: Arc::clone(&self.event_bus),
            progress: Arc::clone(&progress),
        };

        let (context, error) = match race::with_timeout(self.config.timeout(), run.run(context)).await {
            Ok(outcome) => (outcome.context, outcome.error),
            Err(err) => {
                if err.code == ErrorCode::Timeout {
                    warn!(
                        workflow = %name,
                        run_id = %run_id,
                        timeout_ms = self.config.timeout_ms,
                        "Workflow timed out; in-flight step left running in background"
                    );
                }
                let snapshot = progress
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                (snapshot, Some(err))
            }
        };

        let execution_time_ms = start.elapsed().as_millis() as u64;
        let steps = context.history.clone();
        let result = match error {
            None => {
                info!(workflow = %name, run_id = %run_id, execution_time_ms, "Workflow complete");
                WorkflowResult {
                    success: true,
                    data: Some(context.data.clone()),
                    error: None,
                    steps,
                    execution_time_ms,
                }
            }
            Some(err) => {
                error!(
                    workflow = %name,
                    run_id = %run_id,
                    code = %err.code,
                    completed_steps = steps.len(),
                    error = %err.message,
                    "Workflow failed"
                );
                WorkflowResult {
                    success: false,
                    data: None,
                    error: Some(err),
                    steps,
                    execution_time_ms,
                }
            }
        };

        let kind = if result.success {
            EventKind::WorkflowComplete
        } else {
            EventKind::WorkflowError
        };
        let mut event = LifecycleEvent::new(kind, &name)
            .with_data(serde_json::to_value(&result).unwrap_or(serde_json::Value::Null));
        if let Some(err) = &result.error {
            event = event.with_error(err.clone());
        }
        self.event_bus.publish(event);

        self.context = Some(context);
        result
    }
}

impl<T: Payload> std::fmt::Debug for Workflow<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("config", &self.config)
            .field("steps", &self.steps)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

struct LoopOutcome<T> {
    context: ExecutionContext<T>,
    error: Option<AgentError>,
}

/// The step loop, moved into its own task for the timeout race.
struct StepLoop<T> {
    workflow: String,
    steps: Vec<Step<T>>,
    strategy: FailureStrategy,
    event_bus: Arc<EventBus>,
    /// Last context the caller can recover if the loop loses the race.
    progress: Arc<Mutex<ExecutionContext<T>>>,
}

impl<T: Payload> StepLoop<T> {
    async fn run(self, mut context: ExecutionContext<T>) -> LoopOutcome<T> {
        for (index, step) in self.steps.iter().enumerate() {
            debug!(workflow = %self.workflow, step = %step.name(), index, "Step started");
            self.emit(
                LifecycleEvent::new(EventKind::StepStart, &self.workflow).with_data(serde_json::json!({
                    "workflow": self.workflow,
                    "step": step.name(),
                    "index": index,
                })),
            );

            let result = step.evaluate(&mut context).await;
            context.history.push(result.clone());
            self.checkpoint(&context);

            if result.success {
                debug!(
                    workflow = %self.workflow,
                    step = %result.step,
                    skipped = result.skipped,
                    duration_ms = result.duration_ms,
                    "Step complete"
                );
                self.emit(
                    LifecycleEvent::new(EventKind::StepComplete, &self.workflow)
                        .with_data(to_json(&result)),
                );
                continue;
            }

            let err = result
                .error
                .clone()
                .unwrap_or_else(|| AgentError::execution_failed(format!("Step '{}' failed", result.step)));
            self.emit(
                LifecycleEvent::new(EventKind::StepError, &self.workflow)
                    .with_data(to_json(&result))
                    .with_error(err.clone()),
            );

            match self.strategy {
                FailureStrategy::Stop => {
                    error!(workflow = %self.workflow, step = %result.step, error = %err, "Step failed, stopping");
                    return LoopOutcome { context, error: Some(err) };
                }
                FailureStrategy::Continue => {
                    warn!(workflow = %self.workflow, step = %result.step, error = %err, "Step failed, continuing");
                }
                FailureStrategy::Rollback => {
                    error!(workflow = %self.workflow, step = %result.step, error = %err, "Step failed, rolling back");
                    rollback(&self.workflow, &context.history);
                    return LoopOutcome { context, error: Some(err) };
                }
            }
        }

        LoopOutcome { context, error: None }
    }

    fn emit(&self, event: LifecycleEvent) {
        self.event_bus.publish(event);
    }

    fn checkpoint(&self, context: &ExecutionContext<T>) {
        *self.progress.lock().unwrap_or_else(PoisonError::into_inner) = context.clone();
    }
}

/// Rollback hook over the steps that already ran.
///
/// Steps declare no compensating action, so nothing is undone: this only
/// reports what would need reverting before the run aborts.
fn rollback<T>(workflow: &str, history: &[StepResult<T>]) {
    let executed: Vec<&str> = history
        .iter()
        .rev()
        .filter(|r| r.success && !r.skipped)
        .map(|r| r.step.as_str())
        .collect();
    warn!(
        workflow = %workflow,
        steps = ?executed,
        "Rollback requested but steps define no undo; nothing reverted"
    );
}

fn to_json<S: serde::Serialize>(value: &S) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}
