//! Event loop driving the exchange coordinator.
//!
//! A single task owns the [`ExchangeCoordinator`].  RPCs and reconnect
//! timers run as spawned tasks that only post completion events back onto
//! the loop's channel, so every state transition happens on this one task.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};

use crate::error::BrokerError;
use crate::exchange::ExchangeCoordinator;
use crate::peer::{Action, PeerState, RequestToken};
use crate::protocol::{PeerRequest, PeerResponse, RpcError};
use crate::types::{PeerSpec, ServiceEntry, Update};

const EVENT_QUEUE: usize = 128;

/// Snapshot of one peer connection, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub name: String,
    pub location: String,
    pub state: PeerState,
    pub pending: usize,
    pub fail_count: u32,
}

enum Event {
    Local(Update),
    Inbound {
        request: PeerRequest,
        reply: oneshot::Sender<Result<PeerResponse, RpcError>>,
    },
    AddPeer(PeerSpec),
    RemovePeer(String),
    Lookup {
        name: String,
        reply: oneshot::Sender<Option<ServiceEntry>>,
    },
    Status(oneshot::Sender<Vec<PeerStatus>>),
    RpcDone {
        peer: String,
        token: RequestToken,
        result: Result<PeerResponse, RpcError>,
    },
    TimerFired {
        peer: String,
        generation: u64,
    },
    Shutdown,
}

pub struct Broker {
    coordinator: ExchangeCoordinator,
    events_tx: mpsc::Sender<Event>,
    events_rx: mpsc::Receiver<Event>,
    /// In-flight call per peer, with the sequence number of its token.
    calls: HashMap<String, (u64, JoinHandle<()>)>,
    /// Armed reconnect timer per peer, with its generation.
    timers: HashMap<String, (u64, JoinHandle<()>)>,
    health_interval: Duration,
}

impl Broker {
    pub fn new(coordinator: ExchangeCoordinator, health_interval: Duration) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        Self {
            coordinator,
            events_tx,
            events_rx,
            calls: HashMap::new(),
            timers: HashMap::new(),
            health_interval,
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Runs until [`BrokerHandle::shutdown`] is called.
    pub async fn run(mut self) {
        info!(
            "Broker {} at {} running",
            self.coordinator.local().name,
            self.coordinator.local().location
        );
        let mut health = interval_at(Instant::now() + self.health_interval, self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.apply_actions();
        loop {
            tokio::select! {
                event = self.events_rx.recv() => {
                    // The loop holds a sender itself, so the channel never closes.
                    let Some(event) = event else { break };
                    if !self.dispatch(event) {
                        break;
                    }
                }
                _ = health.tick() => {
                    self.coordinator.on_health_tick();
                }
            }
            self.apply_actions();
        }

        self.coordinator.shutdown();
        self.apply_actions();
        for (_, (_, call)) in self.calls.drain() {
            call.abort();
        }
        info!("Broker {} stopped", self.coordinator.local().name);
    }

    /// Returns `false` when the loop should stop.
    fn dispatch(&mut self, event: Event) -> bool {
        match event {
            Event::Local(Update::Add(entry)) => {
                self.coordinator.register_local(entry);
            }
            Event::Local(Update::Remove(entry)) => {
                self.coordinator.deregister_local(&entry.name, &entry.location);
            }
            Event::Inbound { request, reply } => {
                debug!("Serving {}", request.method());
                let result = self.coordinator.handle_request(request);
                let _ = reply.send(result);
            }
            Event::AddPeer(spec) => {
                self.coordinator.add_peer(spec);
            }
            Event::RemovePeer(name) => {
                self.coordinator.remove_peer(&name);
            }
            Event::Lookup { name, reply } => {
                let _ = reply.send(self.coordinator.registry().lookup(&name).cloned());
            }
            Event::Status(reply) => {
                let status = self
                    .coordinator
                    .peers()
                    .map(|peer| PeerStatus {
                        name: peer.name().to_string(),
                        location: peer.spec().location.clone(),
                        state: peer.state(),
                        pending: peer.pending().len(),
                        fail_count: peer.fail_count(),
                    })
                    .collect();
                let _ = reply.send(status);
            }
            Event::RpcDone {
                peer,
                token,
                result,
            } => {
                if self.calls.get(&peer).is_some_and(|(seq, _)| *seq == token.seq) {
                    self.calls.remove(&peer);
                }
                self.coordinator.on_rpc_done(&peer, token, result);
            }
            Event::TimerFired { peer, generation } => {
                if self.timers.get(&peer).is_some_and(|(armed, _)| *armed == generation) {
                    self.timers.remove(&peer);
                }
                self.coordinator.on_timer(&peer, generation);
            }
            Event::Shutdown => return false,
        }
        true
    }

    fn apply_actions(&mut self) {
        for action in self.coordinator.take_actions() {
            match action {
                Action::Invoke {
                    peer,
                    token,
                    target,
                    request,
                } => {
                    let limit = request.timeout();
                    let seq = token.seq;
                    let tx = self.events_tx.clone();
                    let name = peer.clone();
                    let call = tokio::spawn(async move {
                        let result = match timeout(limit, target.invoke(request)).await {
                            Ok(result) => result,
                            Err(_) => Err(RpcError::Timeout(limit)),
                        };
                        let _ = tx
                            .send(Event::RpcDone {
                                peer: name,
                                token,
                                result,
                            })
                            .await;
                    });
                    if let Some((_, previous)) = self.calls.insert(peer, (seq, call)) {
                        previous.abort();
                    }
                }
                Action::Abort { peer } => {
                    if let Some((_, call)) = self.calls.remove(&peer) {
                        debug!("Aborting request to peer {}", peer);
                        call.abort();
                    }
                }
                Action::ArmTimer {
                    peer,
                    generation,
                    delay,
                } => {
                    debug!("Reconnecting to peer {} in {:?}", peer, delay);
                    let tx = self.events_tx.clone();
                    let name = peer.clone();
                    let timer = tokio::spawn(async move {
                        sleep(delay).await;
                        let _ = tx
                            .send(Event::TimerFired {
                                peer: name,
                                generation,
                            })
                            .await;
                    });
                    if let Some((_, previous)) = self.timers.insert(peer, (generation, timer)) {
                        previous.abort();
                    }
                }
                Action::CancelTimer { peer } => {
                    if let Some((_, timer)) = self.timers.remove(&peer) {
                        timer.abort();
                    }
                }
            }
        }
    }
}

/// Cloneable handle for talking to a running [`Broker`].
#[derive(Clone)]
pub struct BrokerHandle {
    tx: mpsc::Sender<Event>,
}

impl BrokerHandle {
    async fn send(&self, event: Event) -> Result<(), BrokerError> {
        self.tx.send(event).await.map_err(|_| BrokerError::Stopped)
    }

    pub async fn register(&self, entry: ServiceEntry) -> Result<(), BrokerError> {
        self.send(Event::Local(Update::Add(entry))).await
    }

    pub async fn deregister(&self, entry: ServiceEntry) -> Result<(), BrokerError> {
        self.send(Event::Local(Update::Remove(entry))).await
    }

    pub async fn add_peer(&self, spec: PeerSpec) -> Result<(), BrokerError> {
        self.send(Event::AddPeer(spec)).await
    }

    pub async fn remove_peer(&self, name: impl Into<String>) -> Result<(), BrokerError> {
        self.send(Event::RemovePeer(name.into())).await
    }

    /// Serves a request as if it had arrived from the network.
    pub async fn request(&self, request: PeerRequest) -> Result<PeerResponse, RpcError> {
        let (reply, rx) = oneshot::channel();
        let stopped = || RpcError::Connection("broker stopped".into());
        self.send(Event::Inbound { request, reply })
            .await
            .map_err(|_| stopped())?;
        rx.await.map_err(|_| stopped())?
    }

    pub async fn lookup(
        &self,
        name: impl Into<String>,
    ) -> Result<Option<ServiceEntry>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Lookup {
            name: name.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Stopped)
    }

    pub async fn peer_status(&self) -> Result<Vec<PeerStatus>, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Status(reply)).await?;
        rx.await.map_err(|_| BrokerError::Stopped)
    }

    pub async fn shutdown(&self) -> Result<(), BrokerError> {
        self.send(Event::Shutdown).await
    }
}
