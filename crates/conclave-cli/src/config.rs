//! Layered `serde_yaml` configuration: a single typed struct with
//! `#[serde(default)]` on every optional field.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use conclave_provider::ProviderConfig;
use conclave_schema::AgentType;

fn default_port() -> u16 {
    8080
}

fn default_hostname() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            port: default_port(),
        }
    }
}

/// `comm.type`: `Human`/`Thing`, a readable name rather than `AgentType`'s
/// integer wire tag (this is a config file, not the wire).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CommType {
    Human,
    Thing,
}

impl From<CommType> for AgentType {
    fn from(value: CommType) -> Self {
        match value {
            CommType::Human => AgentType::HumanAssistant,
            CommType::Thing => AgentType::ThingAssistant,
        }
    }
}

fn default_observation_func() -> String {
    "dummy".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EmbeddingConfig {
    /// `stub` (default, no network call) or `openai`.
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub aliases: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub global_fallbacks: Vec<String>,
    pub primary_model: String,
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommConfig {
    pub name: String,
    #[serde(default)]
    pub desc: String,
    #[serde(default = "default_comm_type")]
    pub r#type: CommType,
    pub llm: LlmConfig,
    #[serde(default = "default_observation_func")]
    pub observation_func: String,
    #[serde(default)]
    pub support_nested_teams: bool,
    #[serde(default)]
    pub discussion_only: bool,
    pub max_team_up_attempts: u32,
}

fn default_comm_type() -> CommType {
    CommType::Thing
}

/// Executor configuration, nullable. `command` is a shell command run with
/// the rephrased task content on stdin; its stdout becomes the task
/// conclusion. Absent `tool_agent` means the Coordination Engine's own LLM
/// produces the conclusion directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolAgentConfig {
    pub command: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub comm: CommConfig,
    #[serde(default)]
    pub tool_agent: Option<ToolAgentConfig>,
    /// Base URL of the Registry/Router this agent process talks to. Needed
    /// to wire `HttpRouterClient` without hardcoding
    /// `server.hostname`/`server.port` as both "where I listen" and "where
    /// the router is" (an agent process and the Router process are not the
    /// same thing in this deployment).
    #[serde(default = "default_router_url")]
    pub router_url: String,
}

fn default_router_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&content).with_context(|| format!("failed to parse yaml config: {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let yaml = r#"
comm:
  name: researcher
  max_team_up_attempts: 3
  llm:
    primary_model: anthropic/claude
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.comm.observation_func, "dummy");
        assert!(!config.comm.discussion_only);
        assert_eq!(config.comm.r#type, CommType::Thing);
        assert!(config.tool_agent.is_none());
    }

    #[test]
    fn full_config_round_trips() {
        let yaml = r#"
server:
  hostname: 0.0.0.0
  port: 9090
comm:
  name: researcher
  desc: does research
  type: Human
  max_team_up_attempts: 5
  support_nested_teams: true
  discussion_only: true
  llm:
    primary_model: anthropic/claude
    fallback_models: [openai/gpt-4o]
    embedding:
      provider: openai
      api_key: secret
tool_agent:
  command: "./run-task.sh"
router_url: "http://router.local:8080"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.hostname, "0.0.0.0");
        assert_eq!(config.comm.r#type, CommType::Human);
        assert!(config.comm.support_nested_teams);
        assert_eq!(config.tool_agent.unwrap().command, "./run-task.sh");
    }
}
