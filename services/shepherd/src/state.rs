//! Shared service state.
//!
//! The agent registry and last-message cache are the two pieces of shared
//! mutable state; both serialize updates through an `RwLock`.  Add is a plain
//! insert (silent overwrite allowed), remove is delete-if-present, and status
//! and prefix matching work on snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tempfile::TempPath;
use tokio::sync::RwLock;

use shepherd_protocol::Envelope;

use crate::broker::MessageProducer;
use crate::bus::EventBus;
use crate::config::ShepherdConfig;
use crate::process::ProcessHandle;

/// One supervised agent.
///
/// Owning the blob temp paths ties their lifetime to the record: the files
/// are deleted when the record is dropped, not at process exit.
pub struct AgentRecord {
    pub agent_type: String,
    pub agent_config: Map<String, Value>,
    pub process: Arc<ProcessHandle>,
    #[allow(dead_code)]
    blob_files: Vec<TempPath>,
}

impl AgentRecord {
    pub fn new(
        agent_type: String,
        agent_config: Map<String, Value>,
        process: ProcessHandle,
        blob_files: Vec<TempPath>,
    ) -> AgentRecord {
        AgentRecord {
            agent_type,
            agent_config,
            process: Arc::new(process),
            blob_files,
        }
    }
}

pub type AgentRegistry = Arc<RwLock<HashMap<String, AgentRecord>>>;

/// `{topic → last blob-stripped envelope}`, answering late-joining websocket
/// clients asking for an initial snapshot.
pub type LastMessageCache = Arc<RwLock<HashMap<String, Envelope>>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ShepherdConfig>,
    pub registry: AgentRegistry,
    pub last_messages: LastMessageCache,
    pub bus: EventBus,
    pub producer: Arc<dyn MessageProducer>,
}

impl AppState {
    pub fn new(config: Arc<ShepherdConfig>, producer: Arc<dyn MessageProducer>) -> AppState {
        AppState {
            config,
            registry: Arc::new(RwLock::new(HashMap::new())),
            last_messages: Arc::new(RwLock::new(HashMap::new())),
            bus: EventBus::new(),
            producer,
        }
    }
}
