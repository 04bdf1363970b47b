//! Peer synchronization for a distributed name broker.
//!
//! Each broker keeps a directory of `name -> location` entries and keeps it
//! reconciled with every configured peer.  The [`exchange`] coordinator owns
//! the directory and one [`peer::PeerConnection`] per remote broker; the
//! [`broker`] event loop drives them over a pluggable [`transport`].

pub mod backoff;
pub mod broker;
pub mod config;
pub mod directory;
pub mod error;
pub mod exchange;
pub mod peer;
pub mod protocol;
pub mod transport;
pub mod types;

pub use broker::{Broker, BrokerHandle, PeerStatus};
pub use config::Config;
pub use exchange::ExchangeCoordinator;
pub use types::{PeerSpec, PendingOp, ServiceEntry};
