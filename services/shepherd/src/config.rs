//! Shepherd configuration loading.
//!
//! TOML is the sole config source.  The path comes from the first CLI
//! argument or `SHEPHERD_CONFIG`, defaulting to `shepherd.toml`.  A missing
//! or invalid file is fatal at startup.
//!
//! Every field has a default, so an empty file is a valid configuration for
//! local development (memory broker, port 8080, canonical topic names).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level service configuration.
#[derive(Debug, Clone)]
pub struct ShepherdConfig {
    pub server: ServerConfig,
    pub broker: BrokerConfig,
    pub topics: TopicConfig,
    pub agents: AgentLaunchConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Directory the Lens static assets are served from.
    pub public_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerMode {
    Kafka,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub host: String,
    /// Consumer group identifier.
    pub group: String,
    /// Topics the gateway consumer subscribes to.
    pub subscribe: Vec<String>,
}

/// The topic name map.  Wire names are the canonical hyphenated spellings;
/// `event` is the single topic bridged to websocket clients.
#[derive(Debug, Clone, Serialize)]
pub struct TopicConfig {
    pub shepherd_receive: String,
    pub agent_receive: String,
    pub cell_receive: String,
    pub environment_receive: String,
    pub environment_state: String,
    #[serde(skip)]
    pub event: String,
}

/// How agent child processes are launched.
#[derive(Debug, Clone)]
pub struct AgentLaunchConfig {
    /// Working directory for spawned children.
    pub dir: PathBuf,
    /// Default boot module when an `ADD_AGENT` message names none.
    pub boot: Option<String>,
    /// Bounded wait before force-kill on agent removal.
    pub shutdown_timeout_secs: u64,
}

impl Default for ShepherdConfig {
    fn default() -> Self {
        validate(RawConfig::default()).expect("empty config must validate")
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server: Option<RawServerConfig>,
    broker: Option<RawBrokerConfig>,
    topics: Option<RawTopicConfig>,
    agents: Option<RawAgentConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServerConfig {
    port: Option<u16>,
    public_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct RawBrokerConfig {
    mode: Option<String>,
    host: Option<String>,
    group: Option<String>,
    subscribe: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
struct RawTopicConfig {
    shepherd_receive: Option<String>,
    agent_receive: Option<String>,
    cell_receive: Option<String>,
    environment_receive: Option<String>,
    environment_state: Option<String>,
    event: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawAgentConfig {
    dir: Option<PathBuf>,
    boot: Option<String>,
    shutdown_timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load config from `path`.
pub fn load_config_from_path(path: &Path) -> Result<ShepherdConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ShepherdConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(raw)
}

fn validate(raw: RawConfig) -> Result<ShepherdConfig, ConfigError> {
    let raw_server = raw.server.unwrap_or_default();
    let server = ServerConfig {
        port: raw_server.port.unwrap_or(8080),
        public_dir: raw_server.public_dir.unwrap_or_else(|| PathBuf::from("public")),
    };

    let raw_topics = raw.topics.unwrap_or_default();
    let environment_state = raw_topics
        .environment_state
        .unwrap_or_else(|| "environment-state".to_owned());
    let topics = TopicConfig {
        shepherd_receive: raw_topics
            .shepherd_receive
            .unwrap_or_else(|| "shepherd-receive".to_owned()),
        agent_receive: raw_topics
            .agent_receive
            .unwrap_or_else(|| "agent-receive".to_owned()),
        cell_receive: raw_topics
            .cell_receive
            .unwrap_or_else(|| "cell-receive".to_owned()),
        environment_receive: raw_topics
            .environment_receive
            .unwrap_or_else(|| "environment-receive".to_owned()),
        // The bridged event topic defaults to the environment state feed.
        event: raw_topics.event.unwrap_or_else(|| environment_state.clone()),
        environment_state,
    };

    let raw_broker = raw.broker.unwrap_or_default();
    let mode = match raw_broker.mode.as_deref() {
        None | Some("memory") => BrokerMode::Memory,
        Some("kafka") => BrokerMode::Kafka,
        Some(other) => {
            return Err(ConfigError::InvalidValue(format!(
                "broker.mode must be \"kafka\" or \"memory\", got \"{other}\""
            )))
        }
    };
    let broker = BrokerConfig {
        mode,
        host: raw_broker
            .host
            .unwrap_or_else(|| "127.0.0.1:9092".to_owned()),
        group: raw_broker.group.unwrap_or_else(|| "shepherd".to_owned()),
        subscribe: raw_broker.subscribe.unwrap_or_else(|| {
            vec![
                topics.shepherd_receive.clone(),
                topics.environment_state.clone(),
            ]
        }),
    };
    if broker.subscribe.is_empty() {
        return Err(ConfigError::InvalidValue(
            "broker.subscribe must name at least one topic".to_owned(),
        ));
    }

    let raw_agents = raw.agents.unwrap_or_default();
    let agents = AgentLaunchConfig {
        dir: raw_agents.dir.unwrap_or_else(|| PathBuf::from(".")),
        boot: raw_agents.boot,
        shutdown_timeout_secs: raw_agents.shutdown_timeout_secs.unwrap_or(30),
    };

    Ok(ShepherdConfig {
        server,
        broker,
        topics,
        agents,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
