//! Connection state machine for one remote broker.
//!
//! A `PeerConnection` never performs I/O.  Every step pushes an [`Action`]
//! for the event loop to carry out and is resumed when the matching
//! completion is handed back through [`PeerConnection::on_rpc_done`].
//! At most one request is outstanding per peer at any time.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use rand::rngs::StdRng;

use crate::backoff::BackoffScheduler;
use crate::directory::Registry;
use crate::protocol::{ErrorClass, PeerRequest, PeerResponse, RpcError};
use crate::transport::{Target, Transport};
use crate::types::{PeerSpec, PendingOp};

/// Failures beyond this count are logged at warning level.
const QUIET_FAILURES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Connecting,
    HandshakeList,
    Steady,
}

/// The protocol step a request belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Probe,
    AddPeer,
    ListManaged,
    Push(PendingOp),
}

/// Identifies the single outstanding request of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestToken {
    pub seq: u64,
    pub step: Step,
}

/// Work for the event loop.
pub enum Action {
    Invoke {
        peer: String,
        token: RequestToken,
        target: Arc<dyn Target>,
        request: PeerRequest,
    },
    /// Abort the request currently in flight for `peer`.
    Abort { peer: String },
    ArmTimer {
        peer: String,
        generation: u64,
        delay: Duration,
    },
    CancelTimer { peer: String },
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Invoke {
                peer,
                token,
                target,
                request,
            } => f
                .debug_struct("Invoke")
                .field("peer", peer)
                .field("token", token)
                .field("target", &target.location())
                .field("request", request)
                .finish(),
            Action::Abort { peer } => f.debug_struct("Abort").field("peer", peer).finish(),
            Action::ArmTimer {
                peer,
                generation,
                delay,
            } => f
                .debug_struct("ArmTimer")
                .field("peer", peer)
                .field("generation", generation)
                .field("delay", delay)
                .finish(),
            Action::CancelTimer { peer } => {
                f.debug_struct("CancelTimer").field("peer", peer).finish()
            }
        }
    }
}

/// Everything a peer connection may touch besides its own state.
pub struct SyncContext<'a> {
    pub local: &'a PeerSpec,
    pub registry: &'a mut Registry,
    pub transport: &'a dyn Transport,
    pub rng: &'a mut StdRng,
    pub actions: &'a mut Vec<Action>,
    /// Source of request sequence numbers and timer generations, shared by
    /// every connection so that a reply or timer from a removed connection
    /// can never match one issued by its replacement.
    pub ids: &'a mut u64,
}

impl SyncContext<'_> {
    fn next_id(&mut self) -> u64 {
        *self.ids += 1;
        *self.ids
    }
}

pub struct PeerConnection {
    spec: PeerSpec,
    state: PeerState,
    target: Option<Arc<dyn Target>>,
    in_flight: Option<RequestToken>,
    pending: VecDeque<PendingOp>,
    fail_count: u32,
    backoff: BackoffScheduler,
}

impl PeerConnection {
    pub fn new(spec: PeerSpec, backoff_unit: Duration) -> Self {
        Self {
            spec,
            state: PeerState::Disconnected,
            target: None,
            in_flight: None,
            pending: VecDeque::new(),
            fail_count: 0,
            backoff: BackoffScheduler::new(backoff_unit),
        }
    }

    pub fn spec(&self) -> &PeerSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn pending(&self) -> &VecDeque<PendingOp> {
        &self.pending
    }

    pub fn in_flight(&self) -> Option<&RequestToken> {
        self.in_flight.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.target.is_some()
    }

    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    pub fn backoff(&self) -> &BackoffScheduler {
        &self.backoff
    }

    /// Probes the peer; a successful probe starts the handshake.
    pub fn try_connect(&mut self, ctx: &mut SyncContext<'_>) {
        if self.in_flight.is_some() || self.state != PeerState::Disconnected {
            return;
        }
        let target = ctx.transport.target(&self.spec.location);
        self.target = Some(target);
        self.issue(ctx, Step::Probe, PeerRequest::Ping);
    }

    pub fn on_timer(&mut self, generation: u64, ctx: &mut SyncContext<'_>) {
        if !self.backoff.fire(generation) {
            debug!("Ignoring stale reconnect timer for peer {}", self.spec.name);
            return;
        }
        self.try_connect(ctx);
    }

    /// Queues `op` behind everything already pending and keeps draining.
    pub fn enqueue(&mut self, op: PendingOp, ctx: &mut SyncContext<'_>) {
        self.pending.push_back(op);
        self.drain(ctx);
    }

    /// Periodic resync: while idle, push everything this node owns again.
    pub fn health_check(&mut self, ctx: &mut SyncContext<'_>) {
        if self.state == PeerState::Steady && self.in_flight.is_none() && self.pending.is_empty()
        {
            debug!("Pushing owned names to peer {}", self.spec.name);
            self.push_owned(ctx);
        } else {
            debug!(
                "Not pushing owned names to peer {}: state {:?}, in flight {:?}, {} pending",
                self.spec.name,
                self.state,
                self.in_flight,
                self.pending.len()
            );
        }
    }

    /// Handles the completion of a request issued by this connection.
    pub fn on_rpc_done(
        &mut self,
        token: RequestToken,
        result: Result<PeerResponse, RpcError>,
        ctx: &mut SyncContext<'_>,
    ) {
        if self.in_flight.as_ref() != Some(&token) {
            error!(
                "Got unknown reply {:?} from peer {}, expected {:?}",
                token, self.spec.name, self.in_flight
            );
            return;
        }
        self.in_flight = None;

        match token.step {
            Step::Probe => match result.and_then(PeerResponse::into_ack) {
                Ok(()) => {
                    if self.backoff.cancel() {
                        ctx.actions.push(Action::CancelTimer {
                            peer: self.spec.name.clone(),
                        });
                    }
                    self.state = PeerState::Connecting;
                    let request = PeerRequest::AddPeer {
                        name: ctx.local.name.clone(),
                        location: ctx.local.location.clone(),
                    };
                    self.issue(ctx, Step::AddPeer, request);
                }
                Err(e) => self.fail(ctx, e),
            },
            Step::AddPeer => match result.and_then(PeerResponse::into_ack) {
                Ok(()) => {
                    self.backoff.disable();
                    self.fail_count = 0;
                    self.state = PeerState::HandshakeList;
                    self.issue(ctx, Step::ListManaged, PeerRequest::ListManaged);
                }
                Err(e) => {
                    error!(
                        "addPeer({}, {}) on peer {} at {}: {}",
                        ctx.local.name, ctx.local.location, self.spec.name, self.spec.location, e
                    );
                    self.fail(ctx, e)
                }
            },
            Step::ListManaged => {
                let entries = match result.and_then(PeerResponse::into_entries) {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(
                            "Error listing peer {} at {}: {}",
                            self.spec.name, self.spec.location, e
                        );
                        self.fail(ctx, e);
                        return;
                    }
                };
                let learned = entries.len();
                for entry in entries {
                    ctx.registry.on_remote_learned(&entry.name, &entry.location);
                }
                self.state = PeerState::Steady;
                info!(
                    "Peer {} at {} connected, learned {} entries, {} known",
                    self.spec.name,
                    self.spec.location,
                    learned,
                    ctx.registry.directory.len()
                );
                self.push_owned(ctx);
            }
            Step::Push(op) => self.on_push_done(op, result, ctx),
        }
    }

    fn on_push_done(
        &mut self,
        op: PendingOp,
        result: Result<PeerResponse, RpcError>,
        ctx: &mut SyncContext<'_>,
    ) {
        match result.and_then(PeerResponse::into_ack) {
            Ok(()) => {
                debug!("Peer {} acked {:?}", self.spec.name, op);
                self.pop_head(&op);
            }
            Err(e) if e.class() == ErrorClass::Connection => {
                error!(
                    "Connection error pushing {:?} to peer {}: {}",
                    op, self.spec.name, e
                );
                self.fail(ctx, e);
                return;
            }
            Err(e) => {
                self.pop_head(&op);
                match &op {
                    PendingOp::Add(entry) => {
                        warn!(
                            "Error adding [{}] to peer {}: {}",
                            entry, self.spec.name, e
                        );
                        ctx.registry.evict_rejected(&self.spec.name, entry);
                    }
                    PendingOp::Remove(entry) => {
                        warn!(
                            "Error removing [{}] on peer {}: {}",
                            entry, self.spec.name, e
                        );
                    }
                }
            }
        }
        self.drain(ctx);
    }

    fn pop_head(&mut self, op: &PendingOp) {
        if self.pending.front() == Some(op) {
            self.pending.pop_front();
        } else {
            error!(
                "Queue head for peer {} changed under in-flight {:?}",
                self.spec.name, op
            );
        }
    }

    /// Appends every owned entry not already queued as the same add, then drains.
    fn push_owned(&mut self, ctx: &mut SyncContext<'_>) {
        for entry in ctx.registry.all_owned() {
            let op = PendingOp::Add(entry);
            if !self.pending.contains(&op) {
                self.pending.push_back(op);
            }
        }
        self.drain(ctx);
    }

    /// Starts the next queued push unless one is already outstanding.
    fn drain(&mut self, ctx: &mut SyncContext<'_>) {
        if self.state != PeerState::Steady || self.in_flight.is_some() {
            return;
        }
        while let Some(head) = self.pending.front() {
            let request = match head {
                PendingOp::Add(entry) => PeerRequest::DoAdd {
                    requester: ctx.local.location.clone(),
                    name: entry.name.clone(),
                    location: entry.location.clone(),
                },
                PendingOp::Remove(entry) => {
                    if let Some(current) = ctx.registry.lookup(&entry.name) {
                        if current.location != entry.location {
                            debug!(
                                "Skipping remove of [{}] for peer {}: superseded by {}",
                                entry, self.spec.name, current.location
                            );
                            self.pending.pop_front();
                            continue;
                        }
                    }
                    PeerRequest::DoRemove {
                        requester: ctx.local.location.clone(),
                        name: entry.name.clone(),
                        location: entry.location.clone(),
                    }
                }
            };
            let op = head.clone();
            self.issue(ctx, Step::Push(op), request);
            return;
        }
    }

    fn issue(&mut self, ctx: &mut SyncContext<'_>, step: Step, request: PeerRequest) {
        let Some(target) = self.target.clone() else {
            error!(
                "No target for peer {} while issuing {}",
                self.spec.name,
                request.method()
            );
            return;
        };
        let token = RequestToken {
            seq: ctx.next_id(),
            step,
        };
        self.in_flight = Some(token.clone());
        ctx.actions.push(Action::Invoke {
            peer: self.spec.name.clone(),
            token,
            target,
            request,
        });
    }

    /// Drops the connection and arms a reconnect timer.
    fn fail(&mut self, ctx: &mut SyncContext<'_>, err: RpcError) {
        self.fail_count += 1;
        if self.fail_count > QUIET_FAILURES {
            warn!(
                "Peer {} at {} failed ({} in a row): {}",
                self.spec.name, self.spec.location, self.fail_count, err
            );
        } else {
            debug!(
                "Peer {} at {} failed: {}",
                self.spec.name, self.spec.location, err
            );
        }
        if self.state != PeerState::Disconnected {
            info!("Peer {} disconnected", self.spec.name);
        }
        self.target = None;
        self.in_flight = None;
        self.state = PeerState::Disconnected;
        let generation = ctx.next_id();
        let armed = self.backoff.schedule(&mut *ctx.rng, generation);
        ctx.actions.push(Action::ArmTimer {
            peer: self.spec.name.clone(),
            generation: armed.generation,
            delay: armed.delay,
        });
    }

    /// Aborts outstanding work and cancels the reconnect timer.
    pub fn shutdown(&mut self, actions: &mut Vec<Action>) {
        if self.in_flight.take().is_some() {
            actions.push(Action::Abort {
                peer: self.spec.name.clone(),
            });
        }
        if self.backoff.cancel() {
            actions.push(Action::CancelTimer {
                peer: self.spec.name.clone(),
            });
        }
        self.target = None;
        self.state = PeerState::Disconnected;
    }
}
