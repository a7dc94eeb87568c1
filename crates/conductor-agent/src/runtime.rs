use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use conductor_core::config::AgentConfig;
use conductor_core::error::{AgentError, ErrorCode};
use conductor_core::event::EventBus;
use conductor_core::types::{AgentResult, EventKind, ExecutionContext, LifecycleEvent, Metadata};

use crate::agent::Agent;
use crate::race;
use crate::retry::run_with_retry;

/// Runs an [`Agent`] with input validation, a timeout race, retries and
/// lifecycle events.
///
/// `execute` never returns an `Err`: every failure ends up in the
/// [`AgentResult`], so callers branch on `success`.
///
/// Each call builds its own [`ExecutionContext`], so concurrent calls on one
/// runner do not share run state. A timed-out call leaves its work running in
/// the background (see [`crate::race`]).
pub struct AgentRunner<A: Agent> {
    agent: Arc<A>,
    config: AgentConfig,
    event_bus: Arc<EventBus>,
    initialized: Mutex<bool>,
}

impl<A: Agent> AgentRunner<A> {
    pub fn new(agent: A, config: AgentConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            agent: Arc::new(agent),
            config,
            event_bus,
            initialized: Mutex::new(false),
        }
    }

    /// Runner with default configuration and a private event bus.
    pub fn with_defaults(agent: A) -> Self {
        let config = AgentConfig::named(agent.name());
        Self::new(agent, config, Arc::new(EventBus::default()))
    }

    /// Event source name: the configured name, or the agent's own.
    pub fn name(&self) -> &str {
        if self.config.name.is_empty() {
            self.agent.name()
        } else {
            &self.config.name
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn agent(&self) -> &Arc<A> {
        &self.agent
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn is_initialized(&self) -> bool {
        *self.initialized.lock().await
    }

    /// Initialize the agent if it has not been yet.
    ///
    /// Emits `agent:start` once per successful initialization. On failure the
    /// runner stays uninitialized so a later call tries again.
    pub async fn initialize(&self) -> Result<(), AgentError> {
        let mut initialized = self.initialized.lock().await;
        if *initialized {
            return Ok(());
        }

        let name = self.name().to_string();
        if let Err(e) = self.agent.initialize().await {
            let err = AgentError::new(
                ErrorCode::InitializationFailed,
                format!("Agent '{}' failed to initialize: {}", name, e),
            )
            .with_details(serde_json::json!({ "cause": AgentError::normalize(e) }));
            error!(agent = %name, error = %err, "Agent initialization failed");
            return Err(err);
        }

        *initialized = true;
        info!(agent = %name, timeout_ms = self.config.timeout_ms, "Agent initialized");
        self.event_bus.publish(
            LifecycleEvent::new(EventKind::AgentStart, &name).with_data(serde_json::json!({
                "agent": name,
                "config": self.config,
            })),
        );
        Ok(())
    }

    /// Close the agent and mark the runner uninitialized.
    pub async fn shutdown(&self) -> Result<(), AgentError> {
        let mut initialized = self.initialized.lock().await;
        if !*initialized {
            return Ok(());
        }
        *initialized = false;
        self.agent.close().await.map_err(AgentError::normalize)?;
        info!(agent = %self.name(), "Agent closed");
        Ok(())
    }

    pub async fn execute(&self, input: A::Input) -> AgentResult<A::Output> {
        self.execute_with_metadata(input, Metadata::new()).await
    }

    /// Execute with caller-supplied metadata merged into the context.
    pub async fn execute_with_metadata(
        &self,
        input: A::Input,
        metadata: Metadata,
    ) -> AgentResult<A::Output> {
        let start = Instant::now();
        let name = self.name().to_string();

        if let Err(err) = self.initialize().await {
            return self.finish_err(err, start, metadata);
        }

        let ctx = ExecutionContext::with_metadata(input, metadata);
        let mut result_meta = ctx.metadata.clone();
        result_meta.insert("agent".into(), serde_json::json!(name));
        result_meta.insert("run_id".into(), serde_json::json!(ctx.id));
        debug!(agent = %name, run_id = %ctx.id, "Agent run started");

        if let Err(err) = self.check_input(&ctx.data) {
            warn!(agent = %name, run_id = %ctx.id, error = %err, "Input rejected");
            return self.finish_err(err, start, result_meta);
        }

        let agent = Arc::clone(&self.agent);
        let retry = self.config.retry.clone();
        let label = name.clone();
        let work = async move {
            let agent = &agent;
            let ctx = &ctx;
            run_with_retry(&label, &retry, move |_attempt| agent.process(ctx.clone())).await
        };

        match race::with_timeout(self.config.timeout(), work).await {
            Ok((Ok(data), attempts)) => {
                result_meta.insert("attempts".into(), serde_json::json!(attempts));
                self.finish_ok(data, start, result_meta)
            }
            Ok((Err(err), attempts)) => {
                result_meta.insert("attempts".into(), serde_json::json!(attempts));
                self.finish_err(err, start, result_meta)
            }
            Err(err) => {
                if err.code == ErrorCode::Timeout {
                    warn!(
                        agent = %name,
                        timeout_ms = self.config.timeout_ms,
                        "Agent timed out; work left running in background"
                    );
                }
                self.finish_err(err, start, result_meta)
            }
        }
    }

    fn check_input(&self, input: &A::Input) -> Result<(), AgentError> {
        match catch_unwind(AssertUnwindSafe(|| self.agent.validate(input))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => match e.downcast::<AgentError>() {
                Ok(typed) => Err(typed),
                Err(raw) => Err(AgentError::invalid_input(raw.to_string())),
            },
            Err(panic) => Err(AgentError::from_panic(panic)),
        }
    }

    fn finish_ok(&self, data: A::Output, start: Instant, metadata: Metadata) -> AgentResult<A::Output> {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(agent = %self.name(), elapsed_ms, "Agent run complete");

        let result = AgentResult::ok(data, elapsed_ms, metadata);
        let payload = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        self.event_bus
            .publish(LifecycleEvent::new(EventKind::AgentComplete, self.name()).with_data(payload));
        result
    }

    fn finish_err(&self, error: AgentError, start: Instant, metadata: Metadata) -> AgentResult<A::Output> {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        error!(agent = %self.name(), code = %error.code, elapsed_ms, error = %error.message, "Agent run failed");

        let result = AgentResult::failed(error.clone(), elapsed_ms, metadata);
        let payload = serde_json::to_value(&result).unwrap_or(serde_json::Value::Null);
        self.event_bus.publish(
            LifecycleEvent::new(EventKind::AgentError, self.name())
                .with_data(payload)
                .with_error(error),
        );
        result
    }
}
