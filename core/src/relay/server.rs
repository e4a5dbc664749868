//! Relay server — accepts relay sessions and forwards or buffers traffic
//!
//! One server serves many unreachable peers. Each accepted setup installs
//! a per-peer forwarder and registers it with the dispatcher under the
//! (peer-id, command) pairs it answers. Failures never escape a handler:
//! they come back to the sender as `Denied` replies.
//!
//! A persistent registration flips the roles on its TCP connection: after
//! the server acknowledges the setup, it stops reading requests from that
//! connection and starts initiating forward exchanges on it instead.

use super::client::{PeerChannel, RelayConnector, TcpConnector, TcpPeerChannel};
use super::forwarder::{PersistentForwarder, PushForwarder};
use super::framing::{read_frame, write_frame};
use super::liveness::DEFAULT_LIVENESS_STRETCH;
use super::protocol::{
    PushSetup, RelayCommand, RelayMessage, RelayType, SetupDecision, PROTOCOL_VERSION,
};
use crate::buffer::MessageBufferConfig;
use crate::dispatch::{Dispatcher, RpcHandler};
use crate::message::{decode_message, encode_message};
use crate::push::{DelegateWakeupSender, DirectWakeupSender, GatewayClient, WakeupSender};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Relay server configuration
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Maximum concurrent relay sessions
    pub max_sessions: usize,
    /// Buffer policy applied to every push session
    pub buffer: MessageBufferConfig,
    /// Tolerance multiplier on promised map-update intervals
    pub liveness_stretch: f64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1000,
            buffer: MessageBufferConfig::default(),
            liveness_stretch: DEFAULT_LIVENESS_STRETCH,
        }
    }
}

/// Counters over the server's lifetime
#[derive(Debug, Clone, Default)]
pub struct RelayServerStats {
    /// Relay sessions currently installed
    pub sessions_active: usize,
    /// Messages forwarded live over persistent channels
    pub messages_forwarded: u64,
    /// Messages accepted into push buffers
    pub messages_buffered: u64,
    /// Buffered batches handed to their peer
    pub batches_delivered: u64,
    /// Sessions evicted by the liveness sweep
    pub sessions_evicted: u64,
}

/// The relay server
pub struct RelayServer {
    /// This relay peer's own id (named as the wake-up sender)
    peer_id: String,
    config: RelayServerConfig,
    /// Present when this relay holds gateway credentials itself. One
    /// sender serves every session and delegate RPC; shutdown cancels it
    /// and evicted sessions drop their clone of it.
    direct_sender: Option<Arc<DirectWakeupSender>>,
    /// Outbound RPC seam, used for delegated wake-ups
    connector: Arc<dyn RelayConnector>,
    dispatcher: Dispatcher,
    persistent: RwLock<HashMap<String, Arc<PersistentForwarder>>>,
    push: RwLock<HashMap<String, Arc<PushForwarder>>>,
    stats: Arc<RwLock<RelayServerStats>>,
    shutdown: AtomicBool,
    /// Flipped on shutdown so a parked `serve` loop wakes up and returns
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Server without gateway credentials, dialing over TCP
    pub fn new(peer_id: String, config: RelayServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            peer_id,
            config,
            direct_sender: None,
            connector: Arc::new(TcpConnector),
            dispatcher: Dispatcher::new(),
            persistent: RwLock::new(HashMap::new()),
            push: RwLock::new(HashMap::new()),
            stats: Arc::new(RwLock::new(RelayServerStats::default())),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    /// Attach locally held gateway credentials; this relay then wakes
    /// devices directly and serves delegate wake-up RPCs
    pub fn with_gateway(mut self, gateway: Arc<dyn GatewayClient>) -> Self {
        self.direct_sender = Some(Arc::new(DirectWakeupSender::new(
            gateway,
            self.config.buffer.push_retries,
        )));
        self
    }

    /// Replace the outbound RPC seam (tests inject fakes here)
    pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
        self.connector = connector;
        self
    }

    /// This relay's peer id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// True while another session fits and the server is running
    pub fn can_accept_session(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire) && self.session_count() < self.config.max_sessions
    }

    /// Number of installed relay sessions
    pub fn session_count(&self) -> usize {
        self.persistent.read().len() + self.push.read().len()
    }

    /// Current statistics snapshot
    pub fn stats(&self) -> RelayServerStats {
        let mut stats = self.stats.read().clone();
        stats.sessions_active = self.session_count();
        stats
    }

    /// Forwarder serving `peer_id` over a push session, if any
    pub fn push_forwarder(&self, peer_id: &str) -> Option<Arc<PushForwarder>> {
        self.push.read().get(peer_id).cloned()
    }

    /// Forwarder serving `peer_id` over a persistent channel, if any
    pub fn persistent_forwarder(&self, peer_id: &str) -> Option<Arc<PersistentForwarder>> {
        self.persistent.read().get(peer_id).cloned()
    }

    /// Decide a setup request and install the session on acceptance.
    ///
    /// Persistent setups need the registration channel (and the address it
    /// came from); push setups need the push parameters. A push setup is
    /// denied when this relay has neither gateway credentials nor a
    /// delegate to forward the wake-up to.
    pub fn handle_setup(
        &self,
        peer_id: String,
        relay_type: RelayType,
        push: Option<PushSetup>,
        registration: Option<(String, Arc<dyn PeerChannel>)>,
    ) -> SetupDecision {
        if self.shutdown.load(Ordering::Acquire) {
            return SetupDecision::Denied {
                reason: "relay is shutting down".to_string(),
            };
        }
        if self.session_count() >= self.config.max_sessions {
            return SetupDecision::Denied {
                reason: "session limit reached".to_string(),
            };
        }

        match relay_type {
            RelayType::PersistentConnection => {
                let Some((address, channel)) = registration else {
                    return SetupDecision::Denied {
                        reason: "persistent setup needs a registration channel".to_string(),
                    };
                };
                self.install_persistent(peer_id, address, channel);
                SetupDecision::Ok
            }
            RelayType::PushNotification => {
                let Some(push) = push else {
                    return SetupDecision::Denied {
                        reason: "push setup needs push parameters".to_string(),
                    };
                };
                let wakeup = match self.wakeup_sender_for(&push) {
                    Some(w) => w,
                    None => {
                        return SetupDecision::Denied {
                            reason: "no push credentials and no delegates".to_string(),
                        }
                    }
                };
                self.install_push(peer_id, push, wakeup);
                SetupDecision::Ok
            }
        }
    }

    /// Pick the wake-up path for a push session: local credentials win,
    /// otherwise the peer-supplied delegates, otherwise nothing
    fn wakeup_sender_for(&self, push: &PushSetup) -> Option<Arc<dyn WakeupSender>> {
        if let Some(sender) = &self.direct_sender {
            Some(Arc::clone(sender) as _)
        } else if !push.delegates.is_empty() {
            Some(Arc::new(DelegateWakeupSender::new(
                push.delegates.clone(),
                Arc::clone(&self.connector),
            )))
        } else {
            None
        }
    }

    fn install_persistent(&self, peer_id: String, address: String, channel: Arc<dyn PeerChannel>) {
        info!(peer = %peer_id, %address, "installing persistent relay session");
        let forwarder = Arc::new(PersistentForwarder::new(
            peer_id.clone(),
            address,
            channel,
        ));
        self.dispatcher.register(
            peer_id.clone(),
            RelayCommand::Forward,
            Arc::new(PersistentHandler {
                forwarder: Arc::clone(&forwarder),
                stats: Arc::clone(&self.stats),
            }),
        );
        self.persistent.write().insert(peer_id, forwarder);
    }

    fn install_push(&self, peer_id: String, push: PushSetup, wakeup: Arc<dyn WakeupSender>) {
        info!(peer = %peer_id, registration = %push.registration_id, "installing push relay session");
        let forwarder = Arc::new(PushForwarder::new(
            peer_id.clone(),
            push.registration_id,
            Duration::from_secs(push.map_update_interval_secs),
            self.config.liveness_stretch,
            self.config.buffer.clone(),
            wakeup,
            self.peer_id.clone(),
        ));
        let handler = Arc::new(PushHandler {
            forwarder: Arc::clone(&forwarder),
            stats: Arc::clone(&self.stats),
        });
        for command in [
            RelayCommand::Forward,
            RelayCommand::MapUpdate,
            RelayCommand::BufferRetrieval,
        ] {
            self.dispatcher
                .register(peer_id.clone(), command, Arc::clone(&handler) as _);
        }
        self.push.write().insert(peer_id, forwarder);
    }

    /// Handle one inbound message and produce the reply
    pub async fn handle_message(&self, from_peer: &str, message: RelayMessage) -> RelayMessage {
        match message {
            RelayMessage::SetupRequest {
                version,
                peer_id,
                relay_type,
                push,
            } => {
                if version != PROTOCOL_VERSION {
                    return RelayMessage::SetupResponse {
                        decision: SetupDecision::Denied {
                            reason: format!("unsupported protocol version {version}"),
                        },
                    };
                }
                // Persistent setups arrive through `serve`, which owns the
                // registration channel; here only push setups can succeed.
                let decision = self.handle_setup(peer_id, relay_type, push, None);
                RelayMessage::SetupResponse { decision }
            }
            RelayMessage::Wakeup {
                registration_id,
                recipient_id,
                ..
            } => self.handle_delegate_wakeup(&registration_id, &recipient_id).await,
            RelayMessage::ForwardEnvelope {
                ref recipient_id, ..
            } => {
                let target = recipient_id.clone();
                self.dispatcher.dispatch(from_peer, &target, message).await
            }
            RelayMessage::MapUpdate { ref peer_id } | RelayMessage::BufferRetrieval { ref peer_id } => {
                let target = peer_id.clone();
                self.dispatcher.dispatch(from_peer, &target, message).await
            }
            other => RelayMessage::Denied {
                reason: format!("unsupported request: {}", other.message_type()),
            },
        }
    }

    /// Another relay asked this peer, as a delegate, to wake a device
    async fn handle_delegate_wakeup(
        &self,
        registration_id: &str,
        recipient_id: &str,
    ) -> RelayMessage {
        let Some(sender) = &self.direct_sender else {
            return RelayMessage::Denied {
                reason: "no push credentials held".to_string(),
            };
        };

        match sender
            .send_wakeup(registration_id, &self.peer_id, recipient_id)
            .await
        {
            Ok(receipt) => RelayMessage::WakeupAck {
                message_id: receipt.message_id,
            },
            Err(e) => {
                warn!(error = %e, "delegate wake-up failed");
                RelayMessage::Denied {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Evict sessions whose peer stopped checking in (push variant) or
    /// whose registration channel closed (persistent variant). Returns how
    /// many sessions were removed. Buffered messages of an evicted peer
    /// are dropped with the session; until eviction they survive offline
    /// detection and keep aging toward their own limit.
    pub fn sweep_dead_sessions(&self) -> usize {
        let dead_push: Vec<String> = self
            .push
            .read()
            .iter()
            .filter(|(_, f)| !f.liveness().is_alive())
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in &dead_push {
            if let Some(forwarder) = self.push.write().remove(peer) {
                forwarder.liveness().declare_offline();
            }
            self.dispatcher.unregister_peer(peer);
            debug!(peer = %peer, "evicted push session, peer offline");
        }

        let dead_persistent: Vec<String> = self
            .persistent
            .read()
            .iter()
            .filter(|(_, f)| !f.is_connected())
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in &dead_persistent {
            self.persistent.write().remove(peer);
            self.dispatcher.unregister_peer(peer);
            debug!(peer = %peer, "evicted persistent session, channel closed");
        }

        let evicted = dead_push.len() + dead_persistent.len();
        if evicted > 0 {
            self.stats.write().sessions_evicted += evicted as u64;
        }
        evicted
    }

    /// Tear down one peer's session
    pub fn remove_peer(&self, peer_id: &str) {
        if let Some(forwarder) = self.persistent.write().remove(peer_id) {
            forwarder.shutdown();
        }
        self.push.write().remove(peer_id);
        self.dispatcher.unregister_peer(peer_id);
    }

    /// Stop accepting sessions, cancel in-flight wake-up retries, release
    /// every registration channel. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer = %self.peer_id, "relay server shutting down");
        let _ = self.shutdown_tx.send(true);

        if let Some(sender) = &self.direct_sender {
            sender.cancel();
        }

        let peers: Vec<String> = self
            .persistent
            .read()
            .keys()
            .chain(self.push.read().keys())
            .cloned()
            .collect();
        for peer in peers {
            self.remove_peer(&peer);
        }
    }

    // ------------------------------------------------------------------
    // Framed TCP serve loop
    // ------------------------------------------------------------------

    /// Accept connections until the listener fails or `shutdown` is called
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(peer = %self.peer_id, addr = ?listener.local_addr().ok(), "relay server listening");
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        // A signal sent before the subscription never wakes `changed()`
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, remote) = accepted?;
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.serve_connection(stream, remote).await;
                    });
                }
                _ = shutdown_rx.changed() => return Ok(()),
            }
        }
    }

    /// One inbound connection: request/response until it closes, or until
    /// a persistent setup converts it into a registration channel
    async fn serve_connection(self: Arc<Self>, mut stream: TcpStream, remote: SocketAddr) {
        let from_peer = remote.to_string();
        loop {
            let message = match read_frame(&mut stream).await {
                Ok(message) => message,
                Err(_) => break,
            };

            match message {
                RelayMessage::SetupRequest {
                    version,
                    peer_id,
                    relay_type: RelayType::PersistentConnection,
                    ..
                } => {
                    if version != PROTOCOL_VERSION {
                        let reply = RelayMessage::SetupResponse {
                            decision: SetupDecision::Denied {
                                reason: format!("unsupported protocol version {version}"),
                            },
                        };
                        if write_frame(&mut stream, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }
                    if !self.can_accept_session() {
                        let reply = RelayMessage::SetupResponse {
                            decision: SetupDecision::Denied {
                                reason: "session limit reached".to_string(),
                            },
                        };
                        if write_frame(&mut stream, &reply).await.is_err() {
                            break;
                        }
                        continue;
                    }

                    let reply = RelayMessage::SetupResponse {
                        decision: SetupDecision::Ok,
                    };
                    if write_frame(&mut stream, &reply).await.is_err() {
                        break;
                    }

                    // Roles flip: this connection is now the registration
                    // channel and the relay initiates all further traffic
                    let channel: Arc<dyn PeerChannel> =
                        Arc::new(TcpPeerChannel::from_stream(stream));
                    let decision = self.handle_setup(
                        peer_id,
                        RelayType::PersistentConnection,
                        None,
                        Some((from_peer, channel.clone())),
                    );
                    if !matches!(decision, SetupDecision::Ok) {
                        channel.close();
                    }
                    return;
                }
                other => {
                    let reply = self.handle_message(&from_peer, other).await;
                    if write_frame(&mut stream, &reply).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

// ============================================================================
// DISPATCHER HANDLERS
// ============================================================================

/// Forward handler for a persistent session
struct PersistentHandler {
    forwarder: Arc<PersistentForwarder>,
    stats: Arc<RwLock<RelayServerStats>>,
}

#[async_trait]
impl RpcHandler for PersistentHandler {
    async fn handle(&self, from_peer: &str, message: RelayMessage) -> RelayMessage {
        let RelayMessage::ForwardEnvelope { payload, .. } = message else {
            return RelayMessage::Denied {
                reason: "persistent session only forwards".to_string(),
            };
        };

        let inner = match decode_message(&payload) {
            Ok(inner) => inner,
            Err(e) => {
                return RelayMessage::Denied {
                    reason: format!("decode failed: {e}"),
                }
            }
        };

        match self.forwarder.forward_to_unreachable(&inner).await {
            Ok(response) => match encode_message(&response) {
                Ok(payload) => {
                    self.stats.write().messages_forwarded += 1;
                    RelayMessage::ForwardResponse { payload }
                }
                Err(e) => RelayMessage::Denied {
                    reason: format!("encode failed: {e}"),
                },
            },
            Err(e) => {
                debug!(from = from_peer, error = %e, "live forward failed");
                RelayMessage::Denied {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Forward/map-update/retrieval handler for a push session
struct PushHandler {
    forwarder: Arc<PushForwarder>,
    stats: Arc<RwLock<RelayServerStats>>,
}

#[async_trait]
impl RpcHandler for PushHandler {
    async fn handle(&self, _from_peer: &str, message: RelayMessage) -> RelayMessage {
        match message {
            RelayMessage::ForwardEnvelope { payload, .. } => {
                let inner = match decode_message(&payload) {
                    Ok(inner) => inner,
                    Err(e) => {
                        return RelayMessage::Denied {
                            reason: format!("decode failed: {e}"),
                        }
                    }
                };
                match self.forwarder.forward_to_unreachable(&inner) {
                    Ok(()) => {
                        self.stats.write().messages_buffered += 1;
                        // Accepted for buffering; nothing to answer with yet
                        RelayMessage::ForwardResponse {
                            payload: Vec::new(),
                        }
                    }
                    Err(e) => RelayMessage::Denied {
                        reason: e.to_string(),
                    },
                }
            }
            RelayMessage::MapUpdate { .. } => {
                let buffered = self.forwarder.on_map_update();
                if !buffered.is_empty() {
                    self.stats.write().batches_delivered += 1;
                }
                RelayMessage::MapUpdateAck { buffered }
            }
            RelayMessage::BufferRetrieval { .. } => {
                let envelopes = self.forwarder.retrieve_buffered();
                if !envelopes.is_empty() {
                    self.stats.write().batches_delivered += 1;
                }
                RelayMessage::BufferResponse { envelopes }
            }
            _ => RelayMessage::Denied {
                reason: "unsupported command for push session".to_string(),
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
