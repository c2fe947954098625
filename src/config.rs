//! Command-line and environment configuration
//!
//! Every flag can also be set through a `SPARKVISOR_*` environment variable.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::agent::{AgentConfig, AgentMode};
use crate::project::ManagerConfig;
use crate::sandbox::RetryPolicy;

#[derive(Parser, Debug, Clone)]
#[command(name = "sparkvisor", version, about = "Sandboxed coding-agent supervisor")]
pub struct Config {
    /// Ollama server base URL
    #[arg(long, env = "SPARKVISOR_OLLAMA_URL", default_value = "http://localhost:11434")]
    pub ollama_url: String,

    /// Model for planning and execution
    #[arg(long, env = "SPARKVISOR_MAIN_MODEL", default_value = "qwen3")]
    pub main_model: String,

    /// Model for merges, commit messages and follow-ups (defaults to --main-model)
    #[arg(long, env = "SPARKVISOR_FAST_MODEL")]
    pub fast_model: Option<String>,

    #[arg(long, env = "SPARKVISOR_TEMPERATURE", default_value_t = 0.0)]
    pub temperature: f32,

    #[arg(long, env = "SPARKVISOR_MAX_TOOL_ROUNDS", default_value_t = 10)]
    pub max_tool_rounds: usize,

    #[arg(long, env = "SPARKVISOR_AGENT_MODE", value_enum, default_value_t = AgentMode::Single)]
    pub agent_mode: AgentMode,

    /// Streaming deadline per turn, 0 disables it
    #[arg(long, env = "SPARKVISOR_TURN_TIMEOUT_SECS", default_value_t = 900)]
    pub turn_timeout_secs: u64,

    #[arg(long, env = "SPARKVISOR_NOT_READY_BACKOFF_SECS", default_value_t = 10)]
    pub not_ready_backoff_secs: u64,

    #[arg(long, env = "SPARKVISOR_FAILURE_BACKOFF_SECS", default_value_t = 30)]
    pub failure_backoff_secs: u64,

    #[arg(long, env = "SPARKVISOR_READINESS_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub readiness_poll_interval_ms: u64,

    #[arg(long, env = "SPARKVISOR_READINESS_POLLS", default_value_t = 60)]
    pub readiness_polls: u32,

    /// Reclaim projects with no listeners after this long
    #[arg(long, env = "SPARKVISOR_IDLE_TIMEOUT_MINS", default_value_t = 30)]
    pub idle_timeout_mins: u64,

    #[arg(long, env = "SPARKVISOR_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    #[arg(long, env = "SPARKVISOR_LINT_CONFIG_PATH", default_value = "/app/frontend/.eslintrc.json")]
    pub lint_config_path: String,

    #[arg(long, env = "SPARKVISOR_LINT_COMMAND", default_value = "npm run lint")]
    pub lint_command: String,

    #[arg(long, env = "SPARKVISOR_LINT_WORKDIR", default_value = "/app/frontend")]
    pub lint_workdir: String,

    #[arg(long, env = "SPARKVISOR_GIT_LOG_PATH", default_value = "/app/git.log")]
    pub git_log_path: String,

    /// JSON store location (defaults to ~/.sparkvisor)
    #[arg(long, env = "SPARKVISOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, env = "SPARKVISOR_DOCKER_PORT_START", default_value_t = 4000)]
    pub docker_port_start: u16,

    #[arg(long, env = "SPARKVISOR_DOCKER_CONTAINER_PORT", default_value_t = 3000)]
    pub docker_container_port: u16,

    #[arg(long, env = "SPARKVISOR_DASHBOARD_ADDR", default_value = "127.0.0.1:9090")]
    pub dashboard_addr: SocketAddr,

    /// OTLP collector endpoint; traces are only exported when set
    #[arg(long, env = "SPARKVISOR_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "SPARKVISOR_LOG_FILTER", default_value = "info,sparkvisor=debug")]
    pub log_filter: String,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            not_ready_backoff: Duration::from_secs(self.not_ready_backoff_secs),
            failure_backoff: Duration::from_secs(self.failure_backoff_secs),
            poll_interval: Duration::from_millis(self.readiness_poll_interval_ms),
            readiness_polls: self.readiness_polls,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            main_model: self.main_model.clone(),
            fast_model: self.fast_model().to_string(),
            temperature: self.temperature,
            max_tool_rounds: self.max_tool_rounds,
            mode: self.agent_mode,
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            retry: self.retry_policy(),
            agent: self.agent_config(),
            turn_timeout: match self.turn_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            lint_config_path: self.lint_config_path.clone(),
            lint_command: self.lint_command.clone(),
            lint_workdir: self.lint_workdir.clone(),
            git_log_path: self.git_log_path.clone(),
        }
    }

    pub fn fast_model(&self) -> &str {
        self.fast_model.as_deref().unwrap_or(&self.main_model)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_mins * 60)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_defaults() {
        let config = Config::parse_from(["sparkvisor"]);
        let manager = config.manager_config();
        let defaults = ManagerConfig::default();

        assert_eq!(manager.turn_timeout, defaults.turn_timeout);
        assert_eq!(manager.lint_config_path, defaults.lint_config_path);
        assert_eq!(manager.git_log_path, defaults.git_log_path);
        assert_eq!(manager.retry.not_ready_backoff, Duration::from_secs(10));
        assert_eq!(manager.retry.failure_backoff, Duration::from_secs(30));
        assert_eq!(config.fast_model(), "qwen3");
        assert_eq!(config.idle_timeout(), Duration::from_secs(30 * 60));
    }

    #[test]
    fn test_overrides() {
        let config = Config::parse_from([
            "sparkvisor",
            "--fast-model",
            "llama3.2",
            "--turn-timeout-secs",
            "0",
            "--agent-mode",
            "doc-handoff",
        ]);
        assert_eq!(config.agent_config().fast_model, "llama3.2");
        assert_eq!(config.agent_config().mode, AgentMode::DocHandoff);
        assert_eq!(config.manager_config().turn_timeout, None);
    }
}
