use thiserror::Error;

/// Returned by [`BrokerHandle`](crate::broker::BrokerHandle) once the event
/// loop is gone.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker event loop has stopped")]
    Stopped,
}

/// A problem with one configured peer.  Reported at startup, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("peer #{index} has an empty name")]
    EmptyPeerName { index: usize },
    #[error("peer {name} has an empty location")]
    EmptyPeerLocation { name: String },
    #[error("peer {name} is listed more than once")]
    DuplicatePeer { name: String },
    #[error("peer {name} at {location} is this node")]
    SelfAsPeer { name: String, location: String },
}
