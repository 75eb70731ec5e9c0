//! Agent message envelopes and their chunk-stream encoding.
//!
//! One envelope is one broker message: a `JSON` chunk holding the header,
//! followed by one `BLOB` chunk per binary payload.  Alignment is disabled on
//! broker messages (no pad bytes).
//!
//! Decoding is deliberately forgiving: the first `JSON` chunk wins (later
//! ones are ignored for recovery simplicity), unknown chunk types are
//! skipped, and a payload with no `JSON` chunk at all yields an envelope
//! carrying only blobs.

use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::chunk::{self, ChunkError, TAG_BLOB, TAG_JSON};
use crate::json;

/// The verbs recognized on control and client topics.
///
/// Wire strings are upper snake case (`ADD_AGENT`).  Handlers parse the
/// envelope's `event` field with [`Event::parse`] and ignore anything
/// unknown, so new verbs can roll out without breaking old services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    AddAgent,
    RemoveAgent,
    TriggerAll,
    PauseAll,
    ShutdownAll,
    TriggerAgent,
    PauseAgent,
    ShutdownAgent,
    CellDeclare,
    DivideCell,
    EnvironmentSynchronize,
    Initialize,
    VisualizationInitialize,
}

impl Event {
    pub fn parse(s: &str) -> Option<Event> {
        match s {
            "ADD_AGENT" => Some(Event::AddAgent),
            "REMOVE_AGENT" => Some(Event::RemoveAgent),
            "TRIGGER_ALL" => Some(Event::TriggerAll),
            "PAUSE_ALL" => Some(Event::PauseAll),
            "SHUTDOWN_ALL" => Some(Event::ShutdownAll),
            "TRIGGER_AGENT" => Some(Event::TriggerAgent),
            "PAUSE_AGENT" => Some(Event::PauseAgent),
            "SHUTDOWN_AGENT" => Some(Event::ShutdownAgent),
            "CELL_DECLARE" => Some(Event::CellDeclare),
            "DIVIDE_CELL" => Some(Event::DivideCell),
            "ENVIRONMENT_SYNCHRONIZE" => Some(Event::EnvironmentSynchronize),
            "INITIALIZE" => Some(Event::Initialize),
            "VISUALIZATION_INITIALIZE" => Some(Event::VisualizationInitialize),
            _ => None,
        }
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Event::AddAgent => "ADD_AGENT",
            Event::RemoveAgent => "REMOVE_AGENT",
            Event::TriggerAll => "TRIGGER_ALL",
            Event::PauseAll => "PAUSE_ALL",
            Event::ShutdownAll => "SHUTDOWN_ALL",
            Event::TriggerAgent => "TRIGGER_AGENT",
            Event::PauseAgent => "PAUSE_AGENT",
            Event::ShutdownAgent => "SHUTDOWN_AGENT",
            Event::CellDeclare => "CELL_DECLARE",
            Event::DivideCell => "DIVIDE_CELL",
            Event::EnvironmentSynchronize => "ENVIRONMENT_SYNCHRONIZE",
            Event::Initialize => "INITIALIZE",
            Event::VisualizationInitialize => "VISUALIZATION_INITIALIZE",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One logical message: a JSON header plus ordered binary blobs.
///
/// The well-known header fields are typed; everything else a producer puts in
/// the header survives round-trips through `extra`.  Blobs are carried
/// out-of-band from the header and never serialize into the JSON chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_config: Option<Map<String, Value>>,
    /// Bulk-removal selector for `REMOVE_AGENT`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Free-form header fields handlers may read.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Binary payloads; carried as `BLOB` chunks, never in the header.
    #[serde(skip)]
    pub blobs: Vec<Vec<u8>>,
}

impl Envelope {
    /// An envelope carrying just an event verb.
    pub fn for_event(event: Event) -> Envelope {
        Envelope {
            event: Some(event.as_wire().to_owned()),
            ..Envelope::default()
        }
    }

    /// An envelope addressing one agent, as used by the `*_AGENT` commands.
    pub fn for_agent(event: Event, agent_id: &str) -> Envelope {
        Envelope {
            event: Some(event.as_wire().to_owned()),
            agent_id: Some(agent_id.to_owned()),
            ..Envelope::default()
        }
    }

    /// The parsed event verb, if the header carries a known one.
    pub fn parsed_event(&self) -> Option<Event> {
        self.event.as_deref().and_then(Event::parse)
    }

    /// Drop the binary payloads, e.g. before caching or fan-out.
    pub fn strip_blobs(&mut self) {
        self.blobs.clear();
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("chunk framing: {0}")]
    Chunk(#[from] ChunkError),
    #[error("header JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize `envelope` into its chunk-stream wire form.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let mut out = Vec::new();
    let header = serde_json::to_vec(envelope)?;
    chunk::write_chunk(&mut out, TAG_JSON, &header, false)?;
    for blob in &envelope.blobs {
        chunk::write_chunk(&mut out, TAG_BLOB, blob, false)?;
    }
    Ok(out)
}

/// Decode one broker payload into an envelope.
pub fn decode(payload: &[u8]) -> Result<Envelope, EnvelopeError> {
    let mut cursor = Cursor::new(payload);
    let mut header: Option<Envelope> = None;
    let mut blobs = Vec::new();
    for (tag, body) in chunk::read_all(&mut cursor, false) {
        match tag {
            TAG_JSON if header.is_none() => header = Some(json::from_slice(&body)?),
            TAG_JSON => debug!("ignoring extra JSON chunk; first header wins"),
            TAG_BLOB => blobs.push(body),
            other => debug!(
                tag = %String::from_utf8_lossy(&other),
                "skipping unrecognized chunk type"
            ),
        }
    }
    let mut envelope = header.unwrap_or_default();
    envelope.blobs = blobs;
    Ok(envelope)
}
