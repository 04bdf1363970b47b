//! Peer-to-peer RPC surface.
//!
//! Requests and responses are plain serde enums; the transport decides how
//! they are framed.  Errors are split into connection-class failures,
//! which tear a peer connection down, and application-class rejections,
//! which are handled per operation.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ServiceEntry;

/// Timeout for the handshake steps and the liveness probe.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
/// Timeout for pushing a single add or remove.
pub const PUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum PeerRequest {
    /// Liveness probe.
    Ping,
    /// Ask the receiver to treat the caller as one of its peers.
    AddPeer { name: String, location: String },
    /// Ask for every entry the receiver owns.
    ListManaged,
    DoAdd {
        requester: String,
        name: String,
        location: String,
    },
    DoRemove {
        requester: String,
        name: String,
        location: String,
    },
    /// Local registration surface: register an entry owned by the receiver.
    Register { name: String, location: String },
    /// Local registration surface: drop an entry owned by the receiver.
    Unregister { name: String, location: String },
}

impl PeerRequest {
    pub fn method(&self) -> &'static str {
        match self {
            PeerRequest::Ping => "ping",
            PeerRequest::AddPeer { .. } => "addPeer",
            PeerRequest::ListManaged => "listManaged",
            PeerRequest::DoAdd { .. } => "doAdd",
            PeerRequest::DoRemove { .. } => "doRemove",
            PeerRequest::Register { .. } => "register",
            PeerRequest::Unregister { .. } => "unregister",
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            PeerRequest::DoAdd { .. } | PeerRequest::DoRemove { .. } => PUSH_TIMEOUT,
            _ => HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerResponse {
    Ack,
    /// Reply to `ListManaged`: parallel arrays that must have equal length.
    Managed {
        names: Vec<String>,
        locations: Vec<String>,
    },
}

impl PeerResponse {
    pub fn managed(entries: &[ServiceEntry]) -> Self {
        PeerResponse::Managed {
            names: entries.iter().map(|e| e.name.clone()).collect(),
            locations: entries.iter().map(|e| e.location.clone()).collect(),
        }
    }

    /// Accepts only a plain acknowledgement.
    pub fn into_ack(self) -> Result<(), RpcError> {
        match self {
            PeerResponse::Ack => Ok(()),
            other => Err(RpcError::Protocol(format!("expected ack, got {:?}", other))),
        }
    }

    /// Pairs up a `Managed` reply, rejecting mismatched array lengths.
    pub fn into_entries(self) -> Result<Vec<ServiceEntry>, RpcError> {
        match self {
            PeerResponse::Managed { names, locations } => {
                if names.len() != locations.len() {
                    return Err(RpcError::Protocol(format!(
                        "inconsistent array lengths: {} names, {} locations",
                        names.len(),
                        locations.len()
                    )));
                }
                Ok(names
                    .into_iter()
                    .zip(locations)
                    .map(|(name, location)| ServiceEntry { name, location })
                    .collect())
            }
            other => Err(RpcError::Protocol(format!(
                "expected managed list, got {:?}",
                other
            ))),
        }
    }
}

/// How a failed call affects the peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Transport trouble or an untrustworthy reply: reconnect.
    Connection,
    /// The peer refused the operation: keep the connection.
    Application,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("rejected by peer: {0}")]
    Rejected(String),
}

impl RpcError {
    pub fn class(&self) -> ErrorClass {
        match self {
            RpcError::Rejected(_) => ErrorClass::Application,
            RpcError::Connection(_) | RpcError::Timeout(_) | RpcError::Protocol(_) => {
                ErrorClass::Connection
            }
        }
    }
}
