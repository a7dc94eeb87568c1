pub mod agent;
pub mod race;
pub mod retry;
pub mod runtime;
pub mod workflow;

pub use agent::{Agent, FnAgent};
pub use retry::{calculate_backoff, run_with_retry};
pub use runtime::AgentRunner;
pub use workflow::{Step, StepCondition, StepOptions, Workflow};
