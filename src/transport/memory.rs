//! In-process transport that routes calls straight to other brokers'
//! handles.  Locations can be taken down to simulate partitions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Target, Transport};
use crate::broker::BrokerHandle;
use crate::protocol::{PeerRequest, PeerResponse, RpcError};

#[derive(Default)]
struct Network {
    brokers: HashMap<String, BrokerHandle>,
    down: HashSet<String>,
}

/// A shared switchboard of brokers keyed by location.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    network: Arc<RwLock<Network>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, location: impl Into<String>, broker: BrokerHandle) {
        self.network
            .write()
            .await
            .brokers
            .insert(location.into(), broker);
    }

    /// Makes every call to `location` fail with a connection error.
    pub async fn take_down(&self, location: &str) {
        self.network.write().await.down.insert(location.to_string());
    }

    pub async fn bring_up(&self, location: &str) {
        self.network.write().await.down.remove(location);
    }
}

impl Transport for MemoryTransport {
    fn target(&self, location: &str) -> Arc<dyn Target> {
        Arc::new(MemoryTarget {
            location: location.to_string(),
            network: Arc::clone(&self.network),
        })
    }
}

struct MemoryTarget {
    location: String,
    network: Arc<RwLock<Network>>,
}

#[async_trait]
impl Target for MemoryTarget {
    async fn invoke(&self, request: PeerRequest) -> Result<PeerResponse, RpcError> {
        let broker = {
            let network = self.network.read().await;
            if network.down.contains(&self.location) {
                return Err(RpcError::Connection(format!("{} is down", self.location)));
            }
            network.brokers.get(&self.location).cloned()
        };
        match broker {
            Some(broker) => broker.request(request).await,
            None => Err(RpcError::Connection(format!(
                "no broker at {}",
                self.location
            ))),
        }
    }

    fn location(&self) -> &str {
        &self.location
    }
}
