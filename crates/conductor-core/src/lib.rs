pub mod config;
pub mod error;
pub mod event;
pub mod traits;
pub mod types;

pub use config::{AgentConfig, AppConfig, Backoff, FailureStrategy, RetryConfig, WorkflowConfig};
pub use error::{AgentError, ConductorError, ErrorCode, Result};
pub use event::{EventBus, EventListener, ListenerId};
pub use traits::Integration;
pub use types::*;
