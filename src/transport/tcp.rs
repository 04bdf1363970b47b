//! TCP transport using length-prefixed JSON frames.
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────┐
//! │ 4 bytes (BE)  │  JSON payload                            │
//! │ payload len   │  RequestFrame or ReplyFrame              │
//! └───────────────┴──────────────────────────────────────────┘
//! ```
//!
//! Every request carries the hex SHA-256 digest of the cluster secret;
//! the listener refuses requests from brokers with a different secret.
//!
//! Frames above the configured limit are refused in both directions.  A
//! `listManaged` reply carries every owned entry at once, so the limit
//! bounds how large a single node's registration set can grow before its
//! peers can no longer complete a handshake with it.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::{Target, Transport};
use crate::broker::BrokerHandle;
use crate::protocol::{PeerRequest, PeerResponse, RpcError};

/// Default for the largest accepted frame payload.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    cluster: String,
    request: PeerRequest,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum ReplyFrame {
    Ok(PeerResponse),
    Error(String),
}

#[derive(Debug, Error)]
enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
}

impl FrameError {
    /// I/O trouble is a connection failure; anything undecodable is a
    /// protocol violation.
    fn into_rpc(self) -> RpcError {
        match self {
            FrameError::Io(e) => RpcError::Connection(e.to_string()),
            other => RpcError::Protocol(other.to_string()),
        }
    }
}

/// Hex SHA-256 of the shared cluster secret.
pub fn cluster_digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

async fn write_frame<W, T>(writer: &mut W, value: &T, limit: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() > limit {
        return Err(FrameError::TooLarge(payload.len()));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_frame<R, T>(reader: &mut R, limit: usize) -> Result<T, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await? as usize;
    if len > limit {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Opens a fresh TCP connection per request.
pub struct TcpTransport {
    cluster: String,
    max_frame: usize,
}

impl TcpTransport {
    pub fn new(cluster_secret: &str) -> Self {
        Self {
            cluster: cluster_digest(cluster_secret),
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }
}

impl Transport for TcpTransport {
    fn target(&self, location: &str) -> Arc<dyn Target> {
        Arc::new(TcpTarget {
            location: location.to_string(),
            cluster: self.cluster.clone(),
            max_frame: self.max_frame,
        })
    }
}

struct TcpTarget {
    location: String,
    cluster: String,
    max_frame: usize,
}

#[async_trait]
impl Target for TcpTarget {
    async fn invoke(&self, request: PeerRequest) -> Result<PeerResponse, RpcError> {
        let mut stream = TcpStream::connect(&self.location)
            .await
            .map_err(|e| RpcError::Connection(format!("connect to {}: {}", self.location, e)))?;
        let frame = RequestFrame {
            cluster: self.cluster.clone(),
            request,
        };
        write_frame(&mut stream, &frame, self.max_frame)
            .await
            .map_err(FrameError::into_rpc)?;
        let reply: ReplyFrame = read_frame(&mut stream, self.max_frame)
            .await
            .map_err(FrameError::into_rpc)?;
        match reply {
            ReplyFrame::Ok(response) => Ok(response),
            ReplyFrame::Error(message) => Err(RpcError::Rejected(message)),
        }
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Accepts peer and client connections and forwards their requests to the broker.
pub async fn serve(
    listener: TcpListener,
    broker: BrokerHandle,
    cluster_secret: String,
    max_frame: usize,
) -> Result<()> {
    let cluster = cluster_digest(&cluster_secret);
    info!("Listening for peers on {}", listener.local_addr()?);
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Accepted connection from {}", addr);
        let broker = broker.clone();
        let cluster = cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, broker, cluster, max_frame).await {
                warn!("Connection from {} failed: {}", addr, e);
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    broker: BrokerHandle,
    cluster: String,
    max_frame: usize,
) -> Result<(), FrameError> {
    loop {
        let frame: RequestFrame = match read_frame(&mut stream, max_frame).await {
            Ok(frame) => frame,
            Err(FrameError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let reply = if frame.cluster != cluster {
            warn!("Refusing {} with foreign cluster digest", frame.request.method());
            ReplyFrame::Error("cluster secret mismatch".into())
        } else {
            match broker.request(frame.request).await {
                Ok(response) => ReplyFrame::Ok(response),
                Err(RpcError::Rejected(message)) => ReplyFrame::Error(message),
                Err(e) => {
                    // Closing without a reply makes the caller see a connection failure.
                    warn!("Dropping connection: {}", e);
                    return Ok(());
                }
            }
        };
        write_frame(&mut stream, &reply, max_frame).await?;
    }
}
