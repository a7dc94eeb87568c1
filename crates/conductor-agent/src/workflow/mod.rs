//! Step sequencer: a linear pipeline of named steps.
//!
//! A `Workflow` owns an ordered list of `Step`s. Each step is an async
//! transform over the `ExecutionContext`, optionally guarded by a condition
//! and carrying an optional error hook. Steps run strictly one after another
//! inside a single timeout race; a step's non-`None` return value replaces
//! the context data for the steps that follow.
//!
//! After a failing step the configured `FailureStrategy` decides whether the
//! run stops, continues with the data unchanged, or rolls back and stops.

pub mod executor;
pub mod step;

pub use executor::Workflow;
pub use step::{ErrorHook, Step, StepCondition, StepHandler, StepOptions};
