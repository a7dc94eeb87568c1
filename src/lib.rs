//! Pipelines shipped with the `conductor` binary.

pub mod lead;
