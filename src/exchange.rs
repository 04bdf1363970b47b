//! Exchange coordinator: owns the registry and every peer connection.
//!
//! All mutation happens through `&mut self`, and the event loop is the only
//! owner, so there is no locking anywhere in here.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::directory::Registry;
use crate::peer::{Action, PeerConnection, RequestToken, SyncContext};
use crate::protocol::{PeerRequest, PeerResponse, RpcError};
use crate::transport::Transport;
use crate::types::{PeerSpec, PendingOp, ServiceEntry};

pub struct ExchangeCoordinator {
    local: PeerSpec,
    registry: Registry,
    peers: BTreeMap<String, PeerConnection>,
    transport: Arc<dyn Transport>,
    rng: StdRng,
    backoff_unit: Duration,
    actions: Vec<Action>,
    ids: u64,
}

/// Builds a `SyncContext` from disjoint fields of the coordinator.
macro_rules! sync_ctx {
    ($self:ident) => {
        SyncContext {
            local: &$self.local,
            registry: &mut $self.registry,
            transport: $self.transport.as_ref(),
            rng: &mut $self.rng,
            actions: &mut $self.actions,
            ids: &mut $self.ids,
        }
    };
}

impl ExchangeCoordinator {
    pub fn new(local: PeerSpec, transport: Arc<dyn Transport>, backoff_unit: Duration) -> Self {
        Self::with_rng(local, transport, backoff_unit, StdRng::from_os_rng())
    }

    pub fn with_rng(
        local: PeerSpec,
        transport: Arc<dyn Transport>,
        backoff_unit: Duration,
        rng: StdRng,
    ) -> Self {
        Self {
            local,
            registry: Registry::new(),
            peers: BTreeMap::new(),
            transport,
            rng,
            backoff_unit,
            actions: Vec::new(),
            ids: 0,
        }
    }

    pub fn local(&self) -> &PeerSpec {
        &self.local
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn peer(&self, name: &str) -> Option<&PeerConnection> {
        self.peers.get(name)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerConnection> {
        self.peers.values()
    }

    /// Hands the accumulated actions to the event loop.
    pub fn take_actions(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    /// Adds a peer and probes it right away.  Returns `false` if a peer with
    /// that name already exists or the spec names this node.
    pub fn add_peer(&mut self, spec: PeerSpec) -> bool {
        if self.is_local(&spec) {
            warn!("Not adding {} at {} as a peer: that is this node", spec.name, spec.location);
            return false;
        }
        if self.peers.contains_key(&spec.name) {
            return false;
        }
        info!("Adding peer {} at {}", spec.name, spec.location);
        let name = spec.name.clone();
        let mut peer = PeerConnection::new(spec, self.backoff_unit);
        peer.try_connect(&mut sync_ctx!(self));
        self.peers.insert(name, peer);
        true
    }

    /// Drops a peer, aborting its in-flight request and reconnect timer.
    pub fn remove_peer(&mut self, name: &str) -> bool {
        match self.peers.remove(name) {
            Some(mut peer) => {
                info!("Removing peer {} at {}", name, peer.spec().location);
                peer.shutdown(&mut self.actions);
                true
            }
            None => false,
        }
    }

    fn is_local(&self, spec: &PeerSpec) -> bool {
        spec.name == self.local.name || spec.location == self.local.location
    }

    pub fn shutdown(&mut self) {
        let names: Vec<String> = self.peers.keys().cloned().collect();
        for name in names {
            self.remove_peer(&name);
        }
    }

    /// Registers an entry owned by this node and fans it out to every peer.
    pub fn register_local(&mut self, entry: ServiceEntry) -> bool {
        let owned = self.registry.ledger.insert(entry.clone());
        let written = self.registry.directory.upsert(entry.clone());
        if !owned && !written {
            debug!("Registration of [{}] is a no-op", entry);
            return false;
        }
        info!(
            "Registered [{}] ({} owned, {} known)",
            entry,
            self.registry.ledger.len(),
            self.registry.directory.len()
        );
        self.fan_out(PendingOp::Add(entry), None);
        true
    }

    /// Drops an owned entry if it still has `location`.
    pub fn deregister_local(&mut self, name: &str, location: &str) -> bool {
        if !self.registry.ledger.remove(name, location) {
            debug!("Ignoring deregistration of unowned {} -> {}", name, location);
            return false;
        }
        self.registry.directory.remove(name, location);
        let entry = ServiceEntry::new(name, location);
        info!(
            "Deregistered [{}] ({} owned, {} known)",
            entry,
            self.registry.ledger.len(),
            self.registry.directory.len()
        );
        self.fan_out(PendingOp::Remove(entry), None);
        true
    }

    /// Records an entry owned by some peer.  Never touches the ledger.
    pub fn on_remote_learned(&mut self, name: &str, location: &str) -> bool {
        self.registry.on_remote_learned(name, location)
    }

    pub fn on_rpc_done(
        &mut self,
        peer: &str,
        token: RequestToken,
        result: Result<PeerResponse, RpcError>,
    ) {
        let Some(conn) = self.peers.get_mut(peer) else {
            debug!("Dropping reply for removed peer {}", peer);
            return;
        };
        conn.on_rpc_done(token, result, &mut sync_ctx!(self));
        self.flush_evicted();
    }

    pub fn on_timer(&mut self, peer: &str, generation: u64) {
        if let Some(conn) = self.peers.get_mut(peer) {
            conn.on_timer(generation, &mut sync_ctx!(self));
        }
    }

    /// Periodic resync of every idle, connected peer.
    pub fn on_health_tick(&mut self) {
        for conn in self.peers.values_mut() {
            conn.health_check(&mut sync_ctx!(self));
        }
    }

    /// Serves one inbound request from a peer or a local client.
    pub fn handle_request(&mut self, request: PeerRequest) -> Result<PeerResponse, RpcError> {
        match request {
            PeerRequest::Ping => Ok(PeerResponse::Ack),
            PeerRequest::AddPeer { name, location } => {
                let spec = PeerSpec::new(name, location);
                if self.is_local(&spec) {
                    return Err(RpcError::Rejected(format!(
                        "cannot add {} at {} as a peer of itself",
                        spec.name, spec.location
                    )));
                }
                let PeerSpec { name, location } = spec;
                if let Some(existing) = self.peers.get(&name) {
                    if existing.spec().location != location {
                        return Err(RpcError::Rejected(format!(
                            "peer {} already known at {}",
                            name,
                            existing.spec().location
                        )));
                    }
                    return Ok(PeerResponse::Ack);
                }
                if self.peers.values().any(|p| p.spec().location == location) {
                    debug!(
                        "Peer {} at {} is already configured under another name",
                        name, location
                    );
                    return Ok(PeerResponse::Ack);
                }
                self.add_peer(PeerSpec::new(name, location));
                Ok(PeerResponse::Ack)
            }
            PeerRequest::ListManaged => Ok(PeerResponse::managed(&self.registry.all_owned())),
            PeerRequest::DoAdd {
                requester,
                name,
                location,
            } => {
                if let Some(owned) = self.registry.ledger.location_of(&name) {
                    if owned != location {
                        warn!(
                            "Refusing {} -> {} from {}: owned here at {}",
                            name, location, requester, owned
                        );
                        return Err(RpcError::Rejected(format!(
                            "{} is registered here at {}",
                            name, owned
                        )));
                    }
                }
                if self.on_remote_learned(&name, &location) {
                    debug!("Learned {} -> {} from {}", name, location, requester);
                }
                Ok(PeerResponse::Ack)
            }
            PeerRequest::DoRemove {
                requester,
                name,
                location,
            } => {
                if !self.registry.ledger.owns(&name)
                    && self.registry.directory.remove(&name, &location)
                {
                    debug!("Forgot {} -> {} on request from {}", name, location, requester);
                }
                Ok(PeerResponse::Ack)
            }
            PeerRequest::Register { name, location } => {
                self.register_local(ServiceEntry::new(name, location));
                Ok(PeerResponse::Ack)
            }
            PeerRequest::Unregister { name, location } => {
                self.deregister_local(&name, &location);
                Ok(PeerResponse::Ack)
            }
        }
    }

    /// Queues `op` on every peer except `skip`.
    fn fan_out(&mut self, op: PendingOp, skip: Option<&str>) {
        for (name, conn) in self.peers.iter_mut() {
            if Some(name.as_str()) == skip {
                continue;
            }
            conn.enqueue(op.clone(), &mut sync_ctx!(self));
        }
    }

    /// Tells the other peers about entries a peer refused.
    fn flush_evicted(&mut self) {
        for (rejecter, entry) in self.registry.take_evicted() {
            info!(
                "Evicted [{}] after rejection by {}, withdrawing from other peers",
                entry, rejecter
            );
            self.fan_out(PendingOp::Remove(entry), Some(rejecter.as_str()));
        }
    }
}
