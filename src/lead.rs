//! Lead-qualification pipeline run by `conductor lead`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use conductor_agent::Workflow;
use conductor_core::config::WorkflowConfig;
use conductor_core::error::AgentError;
use conductor_core::event::EventBus;
use conductor_core::types::ExecutionContext;

pub const WORKFLOW_NAME: &str = "lead-qualification";

/// Score at which a lead is marked qualified.
pub const QUALIFY_THRESHOLD: u32 = 60;

const SENIOR_TITLES: &[&str] = &["CTO", "CEO", "VP", "DIRECTOR"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub score: u32,
    #[serde(default = "default_status")]
    pub status: String,
}

fn default_status() -> String {
    "New".to_string()
}

impl Lead {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.email.trim().is_empty() {
            return Err(AgentError::invalid_input("Lead is missing an email"));
        }
        if self.company.trim().is_empty() {
            return Err(AgentError::invalid_input("Lead is missing a company"));
        }
        Ok(())
    }

    pub fn compute_score(&self) -> u32 {
        let mut score = 0;
        if self.company.chars().count() > 10 {
            score += 20;
        }
        if self.phone.as_deref().is_some_and(|p| !p.is_empty()) {
            score += 15;
        }
        if let Some(title) = &self.title {
            let title = title.to_uppercase();
            if SENIOR_TITLES.iter().any(|t| title.contains(t)) {
                score += 30;
            }
        }
        score
    }
}

/// validate -> score -> qualify (only when the score reaches the threshold).
pub fn build_pipeline(config: WorkflowConfig, event_bus: Arc<EventBus>) -> Workflow<Lead> {
    Workflow::new(config, event_bus)
        .step("validate", |ctx: ExecutionContext<Lead>| async move {
            ctx.data.validate()?;
            Ok(None)
        })
        .step("score", |ctx: ExecutionContext<Lead>| async move {
            let mut lead = ctx.data;
            lead.score = lead.compute_score();
            Ok(Some(lead))
        })
        .when(
            |ctx: &ExecutionContext<Lead>| ctx.data.score >= QUALIFY_THRESHOLD,
            "qualify",
            |ctx: ExecutionContext<Lead>| async move {
                let mut lead = ctx.data;
                lead.status = "Qualified".to_string();
                Ok(Some(lead))
            },
        )
}
