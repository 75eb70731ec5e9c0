//! Agent supervision: control-message routing over the registry.
//!
//! Control messages arrive on the shepherd-receive topic and translate into
//! process launches, bounded-time terminations, and per-agent command
//! broadcasts on the agent-receive topic.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Map, Value};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{debug, error, info, warn};

use shepherd_protocol::{Envelope, Event};

use crate::broker::BrokerError;
use crate::process::{ProcessError, ProcessHandle, SpawnSpec};
use crate::state::{AgentRecord, AppState};

/// Fixed invocation prefix when `boot` names a module rather than an argv.
const MODULE_RUN_PREFIX: [&str; 3] = ["python", "-u", "-m"];

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("{event} is missing agent_id")]
    MissingAgentId { event: Event },
    #[error("agent '{agent_id}' has no usable boot entry")]
    InvalidBoot { agent_id: String },
    #[error("failed to launch agent '{agent_id}': {source}")]
    Launch {
        agent_id: String,
        #[source]
        source: ProcessError,
    },
    #[error("writing blob payload file: {0}")]
    BlobFile(#[from] std::io::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("serializing agent config: {0}")]
    Json(#[from] serde_json::Error),
}

/// Route one control message received on the shepherd-receive topic.
///
/// Unknown events (and known verbs that are not shepherd control verbs) are
/// logged and ignored so the control topic can carry traffic this service
/// does not care about.
pub async fn handle_control(state: &AppState, envelope: &Envelope) -> Result<(), SupervisorError> {
    let Some(event_str) = envelope.event.as_deref() else {
        debug!("control record without event field; ignoring");
        return Ok(());
    };
    let Some(event) = Event::parse(event_str) else {
        warn!(event = %event_str, "unknown control event; ignoring");
        return Ok(());
    };
    match event {
        Event::AddAgent => add_agent(state, envelope).await,
        Event::RemoveAgent => match envelope.prefix.as_deref() {
            Some(prefix) => {
                remove_agents_by_prefix(state, prefix).await;
                Ok(())
            }
            None => {
                let agent_id = required_agent_id(envelope, event)?;
                remove_agent(state, agent_id).await
            }
        },
        // A targeted shutdown on the control topic removes that one agent.
        Event::ShutdownAgent => {
            let agent_id = required_agent_id(envelope, event)?;
            remove_agent(state, agent_id).await
        }
        Event::TriggerAll => broadcast(state, Event::TriggerAgent).await,
        Event::PauseAll => broadcast(state, Event::PauseAgent).await,
        Event::ShutdownAll => broadcast(state, Event::ShutdownAgent).await,
        other => {
            debug!(event = %other, "event is not a shepherd control verb; ignoring");
            Ok(())
        }
    }
}

fn required_agent_id<'e>(
    envelope: &'e Envelope,
    event: Event,
) -> Result<&'e str, SupervisorError> {
    envelope
        .agent_id
        .as_deref()
        .ok_or(SupervisorError::MissingAgentId { event })
}

// ---------------------------------------------------------------------------
// Add
// ---------------------------------------------------------------------------

/// Launch a new agent and insert its record.
///
/// The outbound `agent_config` is augmented with the shepherd's own broker
/// coordinates (`kafka_config`) and, when the message carried blobs, the
/// paths of the temp files they were written to (`files`).  Replacing an
/// existing id silently overwrites it; callers pick fresh identifiers.
pub async fn add_agent(state: &AppState, envelope: &Envelope) -> Result<(), SupervisorError> {
    let agent_id = required_agent_id(envelope, Event::AddAgent)?.to_owned();
    let agent_type = envelope.agent_type.clone().unwrap_or_default();
    let mut agent_config = envelope.agent_config.clone().unwrap_or_default();

    // The child addresses the bus without separate configuration.
    agent_config.insert(
        "kafka_config".to_owned(),
        kafka_config(&state.config)?,
    );

    let mut blob_files = Vec::with_capacity(envelope.blobs.len());
    if !envelope.blobs.is_empty() {
        let mut paths = Vec::with_capacity(envelope.blobs.len());
        for blob in &envelope.blobs {
            let mut file = NamedTempFile::new()?;
            file.write_all(blob)?;
            file.flush()?;
            let path = file.into_temp_path();
            paths.push(Value::String(path.to_string_lossy().into_owned()));
            blob_files.push(path);
        }
        // Positional arguments to the child.
        agent_config.insert("files".to_owned(), Value::Array(paths));
    }

    let argv = compose_argv(state, &agent_id, &agent_type, &agent_config)?;
    let spec = SpawnSpec {
        argv,
        dir: Some(state.config.agents.dir.clone()),
        ..SpawnSpec::default()
    };
    let spawned = ProcessHandle::spawn(&spec).map_err(|source| SupervisorError::Launch {
        agent_id: agent_id.clone(),
        source,
    })?;
    tee_output(&agent_id, "stdout", spawned.stdout);
    tee_output(&agent_id, "stderr", spawned.stderr);
    info!(
        agent_id = %agent_id,
        agent_type = %agent_type,
        pid = spawned.handle.pid(),
        "agent launched"
    );

    let record = AgentRecord::new(agent_type, agent_config, spawned.handle, blob_files);
    if state
        .registry
        .write()
        .await
        .insert(agent_id.clone(), record)
        .is_some()
    {
        warn!(agent_id = %agent_id, "replaced an existing agent record with the same id");
    }
    Ok(())
}

/// The broker coordinates handed to every child: host, the topic name map,
/// and an empty subscription list the agent fills in itself.
fn kafka_config(config: &crate::config::ShepherdConfig) -> Result<Value, serde_json::Error> {
    Ok(json!({
        "host": config.broker.host,
        "topics": serde_json::to_value(&config.topics)?,
        "subscribe": [],
    }))
}

/// Compose the child argv from the boot entry plus the standard trailing
/// arguments.
fn compose_argv(
    state: &AppState,
    agent_id: &str,
    agent_type: &str,
    agent_config: &Map<String, Value>,
) -> Result<Vec<String>, SupervisorError> {
    let mut argv: Vec<String> = match agent_config.get("boot") {
        // A module name runs under the fixed interpreter prefix.
        Some(Value::String(module)) => module_invocation(module),
        // A sequence is the literal invocation.
        Some(Value::Array(parts)) => {
            let mut argv = Vec::with_capacity(parts.len());
            for part in parts {
                match part.as_str() {
                    Some(s) => argv.push(s.to_owned()),
                    None => {
                        return Err(SupervisorError::InvalidBoot {
                            agent_id: agent_id.to_owned(),
                        })
                    }
                }
            }
            argv
        }
        None => match &state.config.agents.boot {
            Some(module) => module_invocation(module),
            None => {
                return Err(SupervisorError::InvalidBoot {
                    agent_id: agent_id.to_owned(),
                })
            }
        },
        Some(_) => {
            return Err(SupervisorError::InvalidBoot {
                agent_id: agent_id.to_owned(),
            })
        }
    };
    if argv.is_empty() {
        return Err(SupervisorError::InvalidBoot {
            agent_id: agent_id.to_owned(),
        });
    }
    argv.push("--id".to_owned());
    argv.push(agent_id.to_owned());
    argv.push("--type".to_owned());
    argv.push(agent_type.to_owned());
    argv.push("--config".to_owned());
    argv.push(serde_json::to_string(agent_config)?);
    Ok(argv)
}

fn module_invocation(module: &str) -> Vec<String> {
    MODULE_RUN_PREFIX
        .iter()
        .map(|s| (*s).to_owned())
        .chain(std::iter::once(module.to_owned()))
        .collect()
}

/// Copy one child output stream, line by line, into the parent's own log so
/// operators see agent output annotated with its id.
fn tee_output<R>(agent_id: &str, stream: &'static str, output: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let agent_id = agent_id.to_owned();
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(agent_id = %agent_id, stream, "{line}");
        }
    });
}

// ---------------------------------------------------------------------------
// Remove
// ---------------------------------------------------------------------------

/// Remove one agent: ask it to shut down over the bus, wait out the
/// termination timeout, force-kill if needed, then drop the record (which
/// deletes its blob temp files).
pub async fn remove_agent(state: &AppState, agent_id: &str) -> Result<(), SupervisorError> {
    let process = {
        let registry = state.registry.read().await;
        match registry.get(agent_id) {
            Some(record) => Arc::clone(&record.process),
            None => {
                warn!(agent_id = %agent_id, "REMOVE_AGENT for unknown agent; ignoring");
                return Ok(());
            }
        }
    };

    // Give the agent a chance to exit cleanly before the bounded wait.
    state
        .producer
        .send(
            &state.config.topics.agent_receive,
            &Envelope::for_agent(Event::ShutdownAgent, agent_id),
        )
        .await?;

    let timeout = Duration::from_secs(state.config.agents.shutdown_timeout_secs);
    let clean = process.terminate(timeout).await;
    state.registry.write().await.remove(agent_id);
    info!(agent_id = %agent_id, clean, "agent removed");
    Ok(())
}

/// Remove every agent whose id starts with `prefix`, over a snapshot of the
/// keys taken now.  Agents added concurrently may escape the batch; errors on
/// individual agents do not abort it.
pub async fn remove_agents_by_prefix(state: &AppState, prefix: &str) {
    let matching: Vec<String> = {
        let registry = state.registry.read().await;
        registry
            .keys()
            .filter(|id| id.starts_with(prefix))
            .cloned()
            .collect()
    };
    info!(prefix = %prefix, count = matching.len(), "removing agents by prefix");
    for agent_id in matching {
        if let Err(error) = remove_agent(state, &agent_id).await {
            error!(agent_id = %agent_id, %error, "prefix removal failed for agent; continuing");
        }
    }
}

/// Terminate every supervised agent, for graceful service shutdown.
pub async fn shutdown_all(state: &AppState) {
    let drained: Vec<(String, AgentRecord)> =
        state.registry.write().await.drain().collect();
    let timeout = Duration::from_secs(state.config.agents.shutdown_timeout_secs);
    for (agent_id, record) in drained {
        let clean = record.process.terminate(timeout).await;
        info!(agent_id = %agent_id, clean, "agent terminated at shutdown");
    }
}

// ---------------------------------------------------------------------------
// Broadcast
// ---------------------------------------------------------------------------

/// Publish a per-agent command for every agent in the registry.
async fn broadcast(state: &AppState, per_agent: Event) -> Result<(), SupervisorError> {
    let ids: Vec<String> = state.registry.read().await.keys().cloned().collect();
    debug!(event = %per_agent, count = ids.len(), "broadcasting agent command");
    for agent_id in ids {
        if let Err(error) = state
            .producer
            .send(
                &state.config.topics.agent_receive,
                &Envelope::for_agent(per_agent, &agent_id),
            )
            .await
        {
            error!(agent_id = %agent_id, event = %per_agent, %error, "agent command publish failed");
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// One `/status` entry.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub agent_type: String,
    pub agent_config: Map<String, Value>,
    pub alive: bool,
}

/// Project the registry for `/status`; `alive` is queried now, per record.
pub async fn status(state: &AppState) -> Vec<AgentStatus> {
    let snapshot: Vec<(String, String, Map<String, Value>, Arc<ProcessHandle>)> = {
        let registry = state.registry.read().await;
        registry
            .iter()
            .map(|(id, record)| {
                (
                    id.clone(),
                    record.agent_type.clone(),
                    record.agent_config.clone(),
                    Arc::clone(&record.process),
                )
            })
            .collect()
    };
    let mut statuses = Vec::with_capacity(snapshot.len());
    for (agent_id, agent_type, agent_config, process) in snapshot {
        statuses.push(AgentStatus {
            agent_id,
            agent_type,
            agent_config,
            alive: process.alive().await,
        });
    }
    statuses
}
