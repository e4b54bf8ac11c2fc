//! Control-channel message bodies.
//!
//! The daemon and init exchange [`Envelope`]s over the control socket; the
//! envelope's `id` correlates a response with its request within one
//! connection. Bodies are a closed tagged union so dispatch is exhaustive:
//! a frame whose tag is unknown fails decoding and is answered with an
//! `Error` reply instead of being dropped.

use serde::{Deserialize, Serialize};

use crate::error::{InitError, Result};

/// One framed message, request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Response-channel id; replies echo the request's id.
    pub id: u64,
    pub body: Body,
}

/// Every message body the control channel understands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Body {
    /// Liveness probe; the payload is echoed back.
    Ping { data: String },
    /// Generic success reply; also the terminator for streamed responses.
    Ok,
    /// Generic negative (non-error) reply.
    NotOk,
    /// Request failure reply.
    Error { msg: String },
    /// Launch the profile's application (or `path` when non-empty).
    RunProgram {
        path: String,
        pwd: String,
        args: Vec<String>,
        no_exec: bool,
    },
    /// Open an interactive shell; the reply carries the PTY master fd.
    RunShell { term: String },
    /// Adopt the attached listening socket and proxy connections to
    /// `proto://addr` inside the sandbox.
    SetupForwarder { addr: String, proto: String },
    /// Bind host-visible paths into the running sandbox.
    MountFiles { files: Vec<String>, read_only: bool },
    /// Detach a previously mounted path.
    UnmountFile { file: String },
}

impl Body {
    /// Short tag for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Body::Ping { .. } => "Ping",
            Body::Ok => "Ok",
            Body::NotOk => "NotOk",
            Body::Error { .. } => "Error",
            Body::RunProgram { .. } => "RunProgram",
            Body::RunShell { .. } => "RunShell",
            Body::SetupForwarder { .. } => "SetupForwarder",
            Body::MountFiles { .. } => "MountFiles",
            Body::UnmountFile { .. } => "UnmountFile",
        }
    }
}

/// Encode an envelope for the wire.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decode a frame payload.
///
/// The id is recovered even when the body tag is unknown, so the dispatcher
/// can address its `Error` reply to the right exchange. The error carries
/// the offending payload for the reply text.
pub fn decode(payload: &[u8]) -> (u64, Result<Body>) {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => return (0, Err(InitError::Ipc(format!("bad frame: {e}")))),
    };
    let id = value.get("id").and_then(|v| v.as_u64()).unwrap_or(0);
    let body = match value.get("body") {
        Some(body) => serde_json::from_value::<Body>(body.clone())
            .map_err(|_| InitError::UnexpectedMessage(body.to_string())),
        None => Err(InitError::Ipc("frame has no body".to_string())),
    };
    (id, body)
}
