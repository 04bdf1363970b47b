use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{PeerRequest, PeerResponse, RpcError};

pub mod memory;
pub mod tcp;

pub use memory::MemoryTransport;
pub use tcp::{serve, TcpTransport, DEFAULT_MAX_FRAME};

/// Resolves peer locations into call targets.
///
/// Resolving is synchronous and must not perform I/O; the first call on a
/// target is what actually reaches the peer.
pub trait Transport: Send + Sync {
    fn target(&self, location: &str) -> Arc<dyn Target>;
}

/// An outbound handle to one remote broker.
#[async_trait]
pub trait Target: Send + Sync {
    /// Performs one request/response exchange.  Timeouts are enforced by
    /// the caller.
    async fn invoke(&self, request: PeerRequest) -> Result<PeerResponse, RpcError>;

    fn location(&self) -> &str;
}
