//! Wire envelope shared by both directions of a connection.
//!
//! Packets are JSON objects tagged by `kind`:
//!
//! ```json
//! {"id": 7, "kind": "Request", "name": "GetFile", "data": {"file_id": 3}}
//! {"id": 7, "kind": "Response", "data": {...}}
//! {"id": 7, "kind": "Error", "code": "Forbidden", "message": "...", "stack": null}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorKind, Result, StrongboxError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub id: u64,
    #[serde(flatten)]
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Body {
    Request {
        name: String,
        #[serde(default)]
        data: Value,
    },
    Response {
        #[serde(default)]
        data: Value,
    },
    Error {
        code: ErrorKind,
        message: String,
        #[serde(default)]
        stack: Option<String>,
    },
    /// The sender no longer wants the answer to request `id`.
    Cancel,
    /// Request `id` stopped because its lifetime ended.
    Cancelled,
}

impl Packet {
    pub fn request(id: u64, name: impl Into<String>, data: Value) -> Self {
        Self {
            id,
            body: Body::Request {
                name: name.into(),
                data,
            },
        }
    }

    pub fn response(id: u64, data: Value) -> Self {
        Self {
            id,
            body: Body::Response { data },
        }
    }

    /// Error packet for `err`; internal detail stays on this side.
    pub fn error(id: u64, err: &StrongboxError) -> Self {
        if matches!(err, StrongboxError::Cancelled) {
            return Self {
                id,
                body: Body::Cancelled,
            };
        }
        Self {
            id,
            body: Body::Error {
                code: err.kind(),
                message: err.public_message(),
                stack: None,
            },
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| StrongboxError::invalid(format!("malformed packet: {}", e)))
    }

    /// Whether this packet answers an outbound call.
    pub fn is_reply(&self) -> bool {
        matches!(
            self.body,
            Body::Response { .. } | Body::Error { .. } | Body::Cancelled
        )
    }
}
