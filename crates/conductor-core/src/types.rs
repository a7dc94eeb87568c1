use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AgentError;

/// Caller-supplied metadata bag. The engine never mutates it.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Anything that can flow through a run as the data payload.
///
/// Serialization is only used to attach the payload to lifecycle events.
pub trait Payload: Clone + Serialize + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Serialize + Send + Sync + 'static {}

/// Per-run state threaded through an agent or workflow run.
///
/// Owned by exactly one run and discarded when it completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext<T> {
    /// Correlation id, unique per run.
    pub id: String,
    /// Current payload. Replaced wholesale by each step that returns a value.
    pub data: T,
    #[serde(default)]
    pub metadata: Metadata,
    /// Results of every attempted step, in registration order.
    #[serde(default = "Vec::new")]
    pub history: Vec<StepResult<T>>,
    pub timestamp: DateTime<Utc>,
}

impl<T> ExecutionContext<T> {
    pub fn new(data: T) -> Self {
        Self::with_metadata(data, Metadata::new())
    }

    pub fn with_metadata(data: T, metadata: Metadata) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data,
            metadata,
            history: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    /// Most recent step result, if any step has run.
    pub fn last_result(&self) -> Option<&StepResult<T>> {
        self.history.last()
    }
}

/// Outcome of one attempted step. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult<T> {
    pub step: String,
    pub success: bool,
    /// True when the step's condition was false and the handler never ran.
    #[serde(default)]
    pub skipped: bool,
    pub data: Option<T>,
    pub error: Option<AgentError>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl<T> StepResult<T> {
    pub fn is_failure(&self) -> bool {
        !self.success
    }
}

/// Terminal summary of one `AgentRunner::execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult<O> {
    pub success: bool,
    pub data: Option<O>,
    pub error: Option<AgentError>,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl<O> AgentResult<O> {
    pub fn ok(data: O, execution_time_ms: u64, metadata: Metadata) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            execution_time_ms,
            metadata,
        }
    }

    pub fn failed(error: AgentError, execution_time_ms: u64, metadata: Metadata) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
            execution_time_ms,
            metadata,
        }
    }

    /// Convert into a plain `Result`, dropping timing and metadata.
    pub fn into_result(self) -> std::result::Result<O, AgentError> {
        match (self.data, self.error) {
            (Some(data), _) if self.success => Ok(data),
            (_, Some(err)) => Err(err),
            _ => Err(AgentError::execution_failed("agent produced no data")),
        }
    }
}

/// Terminal summary of one `Workflow::execute` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<AgentError>,
    pub steps: Vec<StepResult<T>>,
    pub execution_time_ms: u64,
}

impl<T> WorkflowResult<T> {
    /// Names of the steps that failed during the run.
    pub fn failed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|r| r.is_failure())
            .map(|r| r.step.as_str())
            .collect()
    }

    /// Look up the result of a step by name.
    pub fn step(&self, name: &str) -> Option<&StepResult<T>> {
        self.steps.iter().find(|r| r.step == name)
    }
}

/// Closed set of lifecycle event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent:start")]
    AgentStart,
    #[serde(rename = "agent:complete")]
    AgentComplete,
    #[serde(rename = "agent:error")]
    AgentError,
    #[serde(rename = "step:start")]
    StepStart,
    #[serde(rename = "step:complete")]
    StepComplete,
    #[serde(rename = "step:error")]
    StepError,
    #[serde(rename = "workflow:start")]
    WorkflowStart,
    #[serde(rename = "workflow:complete")]
    WorkflowComplete,
    #[serde(rename = "workflow:error")]
    WorkflowError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent:start",
            Self::AgentComplete => "agent:complete",
            Self::AgentError => "agent:error",
            Self::StepStart => "step:start",
            Self::StepComplete => "step:complete",
            Self::StepError => "step:error",
            Self::WorkflowStart => "workflow:start",
            Self::WorkflowComplete => "workflow:complete",
            Self::WorkflowError => "workflow:error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::AgentError | Self::StepError | Self::WorkflowError)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notification broadcast to listeners. Not retained after delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Name of the agent or workflow that emitted the event.
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentError>,
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            kind,
            source: source.into(),
            timestamp: Utc::now(),
            data: None,
            error: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_error(mut self, error: AgentError) -> Self {
        self.error = Some(error);
        self
    }
}
