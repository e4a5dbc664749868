//! Per-relayed-peer forwarders — the server half of a relay session
//!
//! A relay peer installs one forwarder per unreachable peer it serves.
//! The persistent forwarder owns that peer's registration channel and
//! pushes every intercepted message straight through it. The push
//! forwarder owns a message buffer instead; a full buffer parks the batch
//! for the next map-update reply and fires the wake-up chain.

use super::client::{ChannelError, ChannelToken, PeerChannel};
use super::liveness::LivenessTracker;
use super::protocol::RelayMessage;
use crate::buffer::{FlushListener, MessageBuffer, MessageBufferConfig};
use crate::message::{decode_message, encode_message, Message};
use crate::push::WakeupSender;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Forwarding failures, surfaced to the RPC responder (never dropped
/// silently and never allowed to escape to the dispatcher)
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Encode failed: {0}")]
    Encode(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),
}

/// Last known address of the unreachable peer, plus whether the most
/// recent trusted report confirmed or disputed it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedAddress {
    /// Socket address string
    pub address: String,
    /// False after a trusted `peer_failed` report
    pub confirmed: bool,
}

/// Where an address report came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOrigin {
    /// The reporter observed the peer itself
    FirstHand,
    /// The reporter heard it from someone else; carries the channel the
    /// report arrived through
    SecondHand(ChannelToken),
}

/// Trust rule shared by both forwarder variants: first-hand reports are
/// always believed; second-hand reports only when they arrive through the
/// channel that registered the peer. Anything else is a stale or hostile
/// redirect and is ignored.
fn report_trusted(origin: ReportOrigin, registration: ChannelToken) -> bool {
    match origin {
        ReportOrigin::FirstHand => true,
        ReportOrigin::SecondHand(via) => via == registration,
    }
}

// ============================================================================
// PERSISTENT FORWARDER
// ============================================================================

/// Forwarder for a peer with an open registration channel
pub struct PersistentForwarder {
    unreachable_peer_id: String,
    channel: Arc<dyn PeerChannel>,
    cached_address: RwLock<CachedAddress>,
}

impl PersistentForwarder {
    /// Forwarder over the channel the peer registered through
    pub fn new(
        unreachable_peer_id: String,
        registered_address: String,
        channel: Arc<dyn PeerChannel>,
    ) -> Self {
        Self {
            unreachable_peer_id,
            channel,
            cached_address: RwLock::new(CachedAddress {
                address: registered_address,
                confirmed: true,
            }),
        }
    }

    /// The peer this forwarder serves
    pub fn peer_id(&self) -> &str {
        &self.unreachable_peer_id
    }

    /// Token of the registration channel
    pub fn registration_token(&self) -> ChannelToken {
        self.channel.token()
    }

    /// Last known address of the unreachable peer
    pub fn cached_address(&self) -> CachedAddress {
        self.cached_address.read().clone()
    }

    /// True while the registration channel is open
    pub fn is_connected(&self) -> bool {
        self.channel.is_open()
    }

    /// Forward an intercepted message to the unreachable peer: the encoded
    /// message rides inside a forward envelope on the registration channel;
    /// the nested response is decoded and re-addressed to the original
    /// sender. Write errors and closed channels surface as failed results.
    pub async fn forward_to_unreachable(&self, message: &Message) -> Result<Message, ForwardError> {
        let payload = encode_message(message).map_err(|e| ForwardError::Encode(e.to_string()))?;

        let envelope = RelayMessage::ForwardEnvelope {
            sender_id: message.sender_id.clone(),
            recipient_id: self.unreachable_peer_id.clone(),
            payload,
        };

        debug!(
            peer = %self.unreachable_peer_id,
            from = %message.sender_id,
            "forwarding over registration channel"
        );

        match self.channel.request(envelope).await? {
            RelayMessage::ForwardResponse { payload } => {
                let inner =
                    decode_message(&payload).map_err(|e| ForwardError::Decode(e.to_string()))?;
                Ok(inner.readdressed_to(message.sender_id.clone()))
            }
            RelayMessage::Denied { reason } => {
                warn!(peer = %self.unreachable_peer_id, %reason, "forward denied");
                Err(ForwardError::UnexpectedResponse("Denied"))
            }
            _ => Err(ForwardError::UnexpectedResponse("not a ForwardResponse")),
        }
    }

    /// A reporter claims the peer moved to `address`
    pub fn peer_found(&self, address: String, origin: ReportOrigin) {
        if !report_trusted(origin, self.channel.token()) {
            debug!(peer = %self.unreachable_peer_id, "ignoring untrusted address report");
            return;
        }
        *self.cached_address.write() = CachedAddress {
            address,
            confirmed: true,
        };
    }

    /// A reporter claims the peer is no longer reachable at its address
    pub fn peer_failed(&self, origin: ReportOrigin) {
        if !report_trusted(origin, self.channel.token()) {
            return;
        }
        self.cached_address.write().confirmed = false;
    }

    /// Release the registration channel
    pub fn shutdown(&self) {
        self.channel.close();
    }
}

// ============================================================================
// PUSH FORWARDER
// ============================================================================

/// Forwarder for a peer with no open channel: everything goes through the
/// buffer, and a full buffer wakes the device out-of-band.
///
/// With no registration channel, the session token stands in for one in
/// the address trust rule: second-hand reports need the token handed out
/// at setup, first-hand reports are always believed.
pub struct PushForwarder {
    unreachable_peer_id: String,
    registration_id: String,
    buffer: Arc<MessageBuffer<Vec<u8>>>,
    /// Batch parked for the next map-update reply or retrieval poll
    pending: Arc<Mutex<Vec<Vec<u8>>>>,
    liveness: Arc<LivenessTracker>,
    /// None until a trusted report supplies an address; push peers dial
    /// in, so there is no standing address at setup
    cached_address: RwLock<Option<CachedAddress>>,
    session_token: ChannelToken,
}

impl PushForwarder {
    /// Forwarder buffering for `unreachable_peer_id`. A fullness-triggered
    /// flush parks the batch and fires `wakeup` on a separate task, so the
    /// flush path never waits on the gateway.
    pub fn new(
        unreachable_peer_id: String,
        registration_id: String,
        map_update_interval: Duration,
        liveness_stretch: f64,
        buffer_config: MessageBufferConfig,
        wakeup: Arc<dyn WakeupSender>,
        relay_peer_id: String,
    ) -> Self {
        let buffer = MessageBuffer::new(buffer_config);
        let pending: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

        let parked = Arc::clone(&pending);
        let peer = unreachable_peer_id.clone();
        let registration = registration_id.clone();
        let relay = relay_peer_id;
        let listener: FlushListener<Vec<u8>> = Arc::new(move |batch, triggered_by_full| {
            {
                let mut pending = parked.lock();
                pending.extend(batch.iter().map(|m| m.payload.clone()));
            }

            if triggered_by_full {
                let wakeup = Arc::clone(&wakeup);
                let registration = registration.clone();
                let relay = relay.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    match wakeup.send_wakeup(&registration, &relay, &peer).await {
                        Ok(receipt) => {
                            debug!(peer = %peer, message_id = %receipt.message_id, "wake-up sent")
                        }
                        Err(e) => warn!(peer = %peer, error = %e, "wake-up failed"),
                    }
                });
            }
        });
        buffer.add_listener(listener);

        Self {
            unreachable_peer_id,
            registration_id,
            buffer,
            pending,
            liveness: Arc::new(LivenessTracker::with_stretch(
                map_update_interval,
                liveness_stretch,
            )),
            cached_address: RwLock::new(None),
            session_token: ChannelToken::next(),
        }
    }

    /// The peer this forwarder serves
    pub fn peer_id(&self) -> &str {
        &self.unreachable_peer_id
    }

    /// Gateway registration id supplied at setup
    pub fn registration_id(&self) -> &str {
        &self.registration_id
    }

    /// Liveness tracker for this session
    pub fn liveness(&self) -> &Arc<LivenessTracker> {
        &self.liveness
    }

    /// This peer's buffer
    pub fn buffer(&self) -> &Arc<MessageBuffer<Vec<u8>>> {
        &self.buffer
    }

    /// Buffer an intercepted message. Encode failures propagate; the call
    /// never waits on a flush.
    pub fn forward_to_unreachable(&self, message: &Message) -> Result<(), ForwardError> {
        let payload = encode_message(message).map_err(|e| ForwardError::Encode(e.to_string()))?;
        let size = payload.len() as u64;
        self.buffer.add_message(payload, size);
        Ok(())
    }

    /// The peer checked in: stamp liveness and hand back whatever batches
    /// were parked since its last contact.
    pub fn on_map_update(&self) -> Vec<Vec<u8>> {
        self.liveness.mark_alive();
        std::mem::take(&mut *self.pending.lock())
    }

    /// The woken device polls for its traffic: flush any stragglers still
    /// below the limits, then drain everything parked.
    pub fn retrieve_buffered(&self) -> Vec<Vec<u8>> {
        self.buffer.flush_now();
        std::mem::take(&mut *self.pending.lock())
    }

    /// Messages parked and waiting for pickup
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Token standing in for the registration channel in the trust rule
    pub fn session_token(&self) -> ChannelToken {
        self.session_token
    }

    /// Last known address of the unreachable peer, if any trusted report
    /// supplied one
    pub fn cached_address(&self) -> Option<CachedAddress> {
        self.cached_address.read().clone()
    }

    /// A reporter claims the peer moved to `address`
    pub fn peer_found(&self, address: String, origin: ReportOrigin) {
        if !report_trusted(origin, self.session_token) {
            debug!(peer = %self.unreachable_peer_id, "ignoring untrusted address report");
            return;
        }
        *self.cached_address.write() = Some(CachedAddress {
            address,
            confirmed: true,
        });
    }

    /// A reporter claims the peer is no longer reachable at its address
    pub fn peer_failed(&self, origin: ReportOrigin) {
        if !report_trusted(origin, self.session_token) {
            return;
        }
        if let Some(cached) = self.cached_address.write().as_mut() {
            cached.confirmed = false;
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
