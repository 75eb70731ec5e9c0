// shepherd-protocol: Wire format shared by the shepherd service and its agents.
//
// A broker message is a chunk stream (chunk.rs) carrying one JSON envelope
// header plus ordered binary blobs (envelope.rs).  Header JSON from
// scientific agents may contain non-finite numerics; json.rs handles those.

pub mod chunk;
pub mod envelope;
pub mod json;

pub use envelope::{decode, encode, Envelope, EnvelopeError, Event};
