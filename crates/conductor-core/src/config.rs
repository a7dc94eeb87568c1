use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Per-agent overrides, keyed by agent name.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
    /// Per-workflow overrides, keyed by workflow name.
    #[serde(default)]
    pub workflows: HashMap<String, WorkflowConfig>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `tracing_subscriber` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String { "conductor=info,warn".to_string() }

/// Unit-of-work executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Overall timeout for one `execute` call, retries included.
    #[serde(default = "default_agent_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            timeout_ms: default_agent_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate()
    }
}

fn default_agent_timeout() -> u64 { 30_000 }

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Wait the configured delay before every retry.
    Linear,
    /// Double the delay after every failed attempt.
    #[default]
    Exponential,
}

/// Retry configuration for the work function.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay")]
    pub delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    /// Scale each delay by a random factor in [0.8, 1.2].
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay(),
            backoff: Backoff::default(),
            max_delay_ms: None,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff: Backoff::None,
            max_delay_ms: None,
            jitter: false,
        }
    }

    pub fn new(max_attempts: u32, delay: Duration, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            backoff,
            max_delay_ms: None,
            jitter: false,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay_ms = Some(max_delay.as_millis() as u64);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ConductorError::Config(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_delay() -> u64 { 1000 }

/// What the workflow does after a step fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStrategy {
    /// Abort the run with the step's error.
    #[default]
    Stop,
    /// Record the failure and move on with the data unchanged.
    Continue,
    /// Run the rollback hook over executed steps, then abort.
    Rollback,
}

/// Step sequencer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Overall timeout for the whole step loop.
    #[serde(default = "default_workflow_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub on_error: FailureStrategy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            description: None,
            timeout_ms: default_workflow_timeout(),
            on_error: FailureStrategy::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_on_error(mut self, strategy: FailureStrategy) -> Self {
        self.on_error = strategy;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_workflow_timeout() -> u64 { 300_000 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content)?;

        let config: Self =
            toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))?;
        for (name, agent) in &config.agents {
            agent
                .validate()
                .map_err(|e| ConductorError::Config(format!("agents.{}: {}", name, e)))?;
        }
        Ok(config)
    }

    /// Agent settings for `name`, falling back to defaults.
    pub fn agent(&self, name: &str) -> AgentConfig {
        let mut config = self.agents.get(name).cloned().unwrap_or_default();
        if config.name.is_empty() {
            config.name = name.to_string();
        }
        config
    }

    /// Workflow settings for `name`, falling back to defaults.
    pub fn workflow(&self, name: &str) -> WorkflowConfig {
        let mut config = self.workflows.get(name).cloned().unwrap_or_default();
        if config.name.is_empty() {
            config.name = name.to_string();
        }
        config
    }

    pub fn log_filter(&self) -> String {
        self.log.clone().unwrap_or_default().filter
    }
}

/// Substitute `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables stay as written. A `${` with no `}` before the end of
/// its line is an error.
fn expand_env_vars(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let close = match after.find(|c: char| c == '}' || c == '\n') {
            Some(i) if after.as_bytes()[i] == b'}' => i,
            _ => {
                let offset = input.len() - rest.len() + open;
                let line = input[..offset].matches('\n').count() + 1;
                return Err(ConductorError::Config(format!(
                    "unterminated ${{ on line {}",
                    line
                )));
            }
        };

        let name = &after[..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[open..open + close + 3]),
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_references_substituted() {
        std::env::set_var("CONDUCTOR_CFG_HOST", "crm.internal");
        std::env::set_var("CONDUCTOR_CFG_PORT", "8443");
        let expanded = expand_env_vars("url = \"https://${CONDUCTOR_CFG_HOST}:${CONDUCTOR_CFG_PORT}/v1\"").unwrap();
        assert_eq!(expanded, "url = \"https://crm.internal:8443/v1\"");
        std::env::remove_var("CONDUCTOR_CFG_HOST");
        std::env::remove_var("CONDUCTOR_CFG_PORT");
    }

    #[test]
    fn test_unset_reference_kept_verbatim() {
        let text = "token = \"${CONDUCTOR_CFG_UNSET}\"\nprice = \"$5\"";
        assert_eq!(expand_env_vars(text).unwrap(), text);
    }

    #[test]
    fn test_unterminated_reference_rejected() {
        let err = expand_env_vars("[log]\nfilter = \"${RUST_LOG\"\n[agents.a]\n").unwrap_err();
        match err {
            ConductorError::Config(msg) => assert!(msg.contains("line 2"), "{}", msg),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(expand_env_vars("tail = ${").is_err());
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(config.agents.is_empty());
        assert_eq!(config.log_filter(), "conductor=info,warn");

        let agent = config.agent("crm-sync");
        assert_eq!(agent.name, "crm-sync");
        assert_eq!(agent.timeout_ms, 30_000);
        assert_eq!(agent.retry.max_attempts, 3);
        assert_eq!(agent.retry.delay_ms, 1000);
        assert_eq!(agent.retry.backoff, Backoff::Exponential);
        assert_eq!(agent.retry.max_delay_ms, None);
        assert!(!agent.retry.jitter);

        let workflow = config.workflow("leads");
        assert_eq!(workflow.name, "leads");
        assert_eq!(workflow.timeout_ms, 300_000);
        assert_eq!(workflow.on_error, FailureStrategy::Stop);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let toml_str = r#"
[agents.crm-sync]
timeout_ms = 5000

[agents.crm-sync.retry]
backoff = "linear"

[workflows.leads]
on_error = "continue"
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        let agent = config.agent("crm-sync");
        assert_eq!(agent.timeout_ms, 5000);
        assert_eq!(agent.retry.backoff, Backoff::Linear);
        assert_eq!(agent.retry.max_attempts, 3);

        let workflow = config.workflow("leads");
        assert_eq!(workflow.on_error, FailureStrategy::Continue);
        assert_eq!(workflow.timeout_ms, 300_000);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let retry = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert!(matches!(retry.validate(), Err(ConductorError::Config(_))));
        assert!(RetryConfig::none().validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let agent = AgentConfig::named("scorer")
            .with_timeout(Duration::from_millis(250))
            .with_retry(
                RetryConfig::new(5, Duration::from_millis(10), Backoff::Linear)
                    .with_max_delay(Duration::from_millis(40)),
            );
        assert_eq!(agent.timeout(), Duration::from_millis(250));
        assert_eq!(agent.retry.max_attempts, 5);
        assert_eq!(agent.retry.max_delay_ms, Some(40));

        let workflow = WorkflowConfig::named("leads").with_on_error(FailureStrategy::Rollback);
        assert_eq!(workflow.on_error, FailureStrategy::Rollback);
        assert_eq!(workflow.timeout(), Duration::from_secs(300));
    }
}
