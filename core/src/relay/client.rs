//! Relay clients — how an unreachable peer talks to its relay
//!
//! Two mutually exclusive strategies behind one trait. The persistent
//! client reuses one open channel for every exchange and watches that
//! channel's close signal; the push client keeps nothing open and dials
//! the relay like any other RPC target, one connection per call.

use super::protocol::{RelayMessage, RelayType};
use super::session::{SessionBookkeeping, SessionState};
use crate::relay::framing::{read_frame, write_frame, FramingError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Transport-level errors on a relay exchange
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel is not open")]
    NotOpen,
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Write failed: {0}")]
    WriteFailed(String),
    #[error("Read failed: {0}")]
    ReadFailed(String),
}

/// Relay client errors
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Session has been shut down")]
    SessionClosed,
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error("Relay denied the request: {0}")]
    Denied(String),
}

/// Process-unique identity of a channel, used by the server-side address
/// trust rule: second-hand reports are only believed when they arrive
/// through the channel that registered the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelToken(u64);

impl ChannelToken {
    /// Allocate a fresh token
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// An open bidirectional channel to one peer. Exchanges are strictly
/// request/response; the channel stays open across exchanges.
#[async_trait]
pub trait PeerChannel: Send + Sync {
    /// Send a message and wait for the peer's reply
    async fn request(&self, message: RelayMessage) -> Result<RelayMessage, ChannelError>;

    /// True while the channel is usable
    fn is_open(&self) -> bool;

    /// Receiver flipped to `true` when the channel closes
    fn closed(&self) -> watch::Receiver<bool>;

    /// Process-unique channel identity
    fn token(&self) -> ChannelToken;

    /// Release the channel; subsequent requests fail with `NotOpen`
    fn close(&self);
}

/// One-shot RPC client: dial, exchange, hang up. The push variant and the
/// delegate wake-up chain both speak through this seam.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a fresh connection to `address`, perform one exchange, close
    async fn request(
        &self,
        address: &str,
        message: RelayMessage,
    ) -> Result<RelayMessage, ChannelError>;
}

// ============================================================================
// TCP IMPLEMENTATIONS
// ============================================================================

/// A persistent framed-TCP channel
pub struct TcpPeerChannel {
    stream: Mutex<TcpStream>,
    open: AtomicBool,
    closed_tx: watch::Sender<bool>,
    token: ChannelToken,
}

impl TcpPeerChannel {
    /// Dial `address` and wrap the stream
    pub async fn connect(address: &str) -> Result<Self, ChannelError> {
        let dial_addr = address.strip_prefix("tcp://").unwrap_or(address);
        let stream = TcpStream::connect(dial_addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-accepted stream (server side of a registration)
    pub fn from_stream(stream: TcpStream) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            stream: Mutex::new(stream),
            open: AtomicBool::new(true),
            closed_tx,
            token: ChannelToken::next(),
        }
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.closed_tx.send(true);
        }
    }
}

#[async_trait]
impl PeerChannel for TcpPeerChannel {
    async fn request(&self, message: RelayMessage) -> Result<RelayMessage, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }

        let mut stream = self.stream.lock().await;
        if let Err(e) = write_frame(&mut *stream, &message).await {
            self.mark_closed();
            return Err(match e {
                FramingError::Io(e) => ChannelError::WriteFailed(e.to_string()),
                FramingError::Protocol(e) => ChannelError::WriteFailed(e.to_string()),
            });
        }
        match read_frame(&mut *stream).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.mark_closed();
                Err(ChannelError::ReadFailed(e.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    fn token(&self) -> ChannelToken {
        self.token
    }

    fn close(&self) {
        self.mark_closed();
    }
}

/// Dial-per-call TCP connector
#[derive(Debug, Default, Clone)]
pub struct TcpConnector;

#[async_trait]
impl RelayConnector for TcpConnector {
    async fn request(
        &self,
        address: &str,
        message: RelayMessage,
    ) -> Result<RelayMessage, ChannelError> {
        let dial_addr = address.strip_prefix("tcp://").unwrap_or(address);
        let mut stream = TcpStream::connect(dial_addr)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        write_frame(&mut stream, &message)
            .await
            .map_err(|e| ChannelError::WriteFailed(e.to_string()))?;
        read_frame(&mut stream)
            .await
            .map_err(|e| ChannelError::ReadFailed(e.to_string()))
    }
}

// ============================================================================
// CLIENT VARIANTS
// ============================================================================

/// Client-side configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Base interval for reconnect scheduling
    pub reconnect_interval: Duration,
    /// Consecutive contact failures tolerated before the session fails
    pub max_failures: u32,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_failures: super::session::MAX_RELAY_FAILURES,
        }
    }
}

impl RelayClientConfig {
    /// Exponential backoff for reconnect attempt `attempt`, capped at 60s
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.reconnect_interval.as_millis() as u64;
        let backoff_ms = base_ms * (2u64.pow(std::cmp::min(attempt, 5)));
        Duration::from_millis(std::cmp::min(backoff_ms, 60_000))
    }
}

/// One relay relationship, client side
#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Send a message to the relay peer and wait for its reply
    async fn send_to_relay(&self, message: RelayMessage) -> Result<RelayMessage, RelayClientError>;

    /// Address of the relay peer
    fn relay_address(&self) -> &str;

    /// Which strategy this session uses
    fn relay_type(&self) -> RelayType;

    /// Session bookkeeping (failure counter, close listeners)
    fn session(&self) -> &Arc<SessionBookkeeping>;

    /// Idempotent teardown; all subsequent sends fail immediately
    fn shutdown(&self);
}

/// Persistent-connection relay client: every exchange reuses the one held
/// channel. The channel's own close signal fails the session immediately,
/// independent of the failure counter.
pub struct PersistentRelayClient {
    relay_address: String,
    channel: Arc<dyn PeerChannel>,
    session: Arc<SessionBookkeeping>,
    monitor: tokio::task::JoinHandle<()>,
}

impl PersistentRelayClient {
    /// Wrap an open channel to the relay
    pub fn new(relay_address: String, channel: Arc<dyn PeerChannel>) -> Self {
        Self::with_config(relay_address, channel, RelayClientConfig::default())
    }

    /// Wrap an open channel with a custom failure tolerance
    pub fn with_config(
        relay_address: String,
        channel: Arc<dyn PeerChannel>,
        config: RelayClientConfig,
    ) -> Self {
        let session = Arc::new(SessionBookkeeping::with_max_failures(config.max_failures));

        // Subscribe first, then check: a close signal sent before the
        // subscription would never wake `changed()`, so a channel that died
        // before construction is caught here instead.
        let mut closed = channel.closed();
        if !channel.is_open() {
            warn!(relay = %relay_address, "relay channel already closed, failing session");
            session.fail();
        }
        let watched = Arc::clone(&session);
        let address = relay_address.clone();
        let monitor = tokio::spawn(async move {
            while closed.changed().await.is_ok() {
                if *closed.borrow() {
                    warn!(relay = %address, "relay channel closed, failing session");
                    watched.fail();
                    break;
                }
            }
        });

        Self {
            relay_address,
            channel,
            session,
            monitor,
        }
    }
}

#[async_trait]
impl RelayClient for PersistentRelayClient {
    async fn send_to_relay(&self, message: RelayMessage) -> Result<RelayMessage, RelayClientError> {
        if self.session.is_shut_down() || self.session.state() == SessionState::Failed {
            return Err(RelayClientError::SessionClosed);
        }
        // Fail fast: nothing is written on a closed channel
        if !self.channel.is_open() {
            self.session.record_failure();
            return Err(ChannelError::NotOpen.into());
        }

        match self.channel.request(message).await {
            Ok(response) => {
                self.session.record_success();
                Ok(response)
            }
            Err(e) => {
                self.session.record_failure();
                Err(e.into())
            }
        }
    }

    fn relay_address(&self) -> &str {
        &self.relay_address
    }

    fn relay_type(&self) -> RelayType {
        RelayType::PersistentConnection
    }

    fn session(&self) -> &Arc<SessionBookkeeping> {
        &self.session
    }

    fn shutdown(&self) {
        info!(relay = %self.relay_address, "shutting down persistent relay session");
        self.monitor.abort();
        self.channel.close();
        self.session.shutdown();
    }
}

/// Push-notification relay client: the relay is dialed per call like a
/// normal RPC target; no channel is held between calls.
pub struct PushRelayClient {
    relay_address: String,
    connector: Arc<dyn RelayConnector>,
    session: Arc<SessionBookkeeping>,
}

impl PushRelayClient {
    /// Client that reaches `relay_address` through `connector`
    pub fn new(relay_address: String, connector: Arc<dyn RelayConnector>) -> Self {
        Self::with_config(relay_address, connector, RelayClientConfig::default())
    }

    /// Client with a custom failure tolerance
    pub fn with_config(
        relay_address: String,
        connector: Arc<dyn RelayConnector>,
        config: RelayClientConfig,
    ) -> Self {
        Self {
            relay_address,
            connector,
            session: Arc::new(SessionBookkeeping::with_max_failures(config.max_failures)),
        }
    }
}

#[async_trait]
impl RelayClient for PushRelayClient {
    async fn send_to_relay(&self, message: RelayMessage) -> Result<RelayMessage, RelayClientError> {
        if self.session.is_shut_down() || self.session.state() == SessionState::Failed {
            return Err(RelayClientError::SessionClosed);
        }

        debug!(relay = %self.relay_address, msg = message.message_type(), "dialing relay");
        match self.connector.request(&self.relay_address, message).await {
            Ok(RelayMessage::Denied { reason }) => {
                self.session.record_failure();
                Err(RelayClientError::Denied(reason))
            }
            Ok(response) => {
                self.session.record_success();
                Ok(response)
            }
            Err(e) => {
                self.session.record_failure();
                Err(e.into())
            }
        }
    }

    fn relay_address(&self) -> &str {
        &self.relay_address
    }

    fn relay_type(&self) -> RelayType {
        RelayType::PushNotification
    }

    fn session(&self) -> &Arc<SessionBookkeeping> {
        &self.session
    }

    fn shutdown(&self) {
        info!(relay = %self.relay_address, "shutting down push relay session");
        self.session.shutdown();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::session::MAX_RELAY_FAILURES;
    use std::sync::atomic::AtomicUsize;

    /// In-memory channel with a fixed behavior per request
    struct FakeChannel {
        open: AtomicBool,
        fail_requests: bool,
        closed_tx: watch::Sender<bool>,
        token: ChannelToken,
        requests: AtomicUsize,
    }

    impl FakeChannel {
        fn new(fail_requests: bool) -> Arc<Self> {
            let (closed_tx, _) = watch::channel(false);
            Arc::new(Self {
                open: AtomicBool::new(true),
                fail_requests,
                closed_tx,
                token: ChannelToken::next(),
                requests: AtomicUsize::new(0),
            })
        }

        /// Drop the open flag without sending the close signal, like a
        /// channel whose death has not been observed yet
        fn quiet_close(&self) {
            self.open.store(false, Ordering::Release);
        }
    }

    #[async_trait]
    impl PeerChannel for FakeChannel {
        async fn request(&self, _message: RelayMessage) -> Result<RelayMessage, ChannelError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail_requests {
                Err(ChannelError::WriteFailed("injected".to_string()))
            } else {
                Ok(RelayMessage::ForwardResponse { payload: vec![1] })
            }
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }

        fn closed(&self) -> watch::Receiver<bool> {
            self.closed_tx.subscribe()
        }

        fn token(&self) -> ChannelToken {
            self.token
        }

        fn close(&self) {
            if self.open.swap(false, Ordering::AcqRel) {
                let _ = self.closed_tx.send(true);
            }
        }
    }

    struct FakeConnector {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RelayConnector for FakeConnector {
        async fn request(
            &self,
            _address: &str,
            _message: RelayMessage,
        ) -> Result<RelayMessage, ChannelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(ChannelError::ConnectionFailed("injected".to_string()))
            } else {
                Ok(RelayMessage::MapUpdateAck { buffered: vec![] })
            }
        }
    }

    fn map_update() -> RelayMessage {
        RelayMessage::MapUpdate {
            peer_id: "peer1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_persistent_send_success_resets_failures() {
        let channel = FakeChannel::new(false);
        let client = PersistentRelayClient::new("relay:1".to_string(), channel);

        client.session().record_failure();
        client.session().record_failure();

        let response = client.send_to_relay(map_update()).await.unwrap();
        assert!(matches!(response, RelayMessage::ForwardResponse { .. }));
        assert_eq!(client.session().failure_count(), 0);
    }

    #[tokio::test]
    async fn test_persistent_fails_fast_on_closed_channel() {
        let channel = FakeChannel::new(false);
        let client = PersistentRelayClient::new("relay:1".to_string(), Arc::clone(&channel) as _);
        channel.quiet_close();

        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(
            result,
            Err(RelayClientError::Channel(ChannelError::NotOpen))
        ));
        assert_eq!(
            channel.requests.load(Ordering::SeqCst),
            0,
            "nothing may be sent on a closed channel"
        );
    }

    #[tokio::test]
    async fn test_channel_closed_before_construction_fails_session() {
        let channel = FakeChannel::new(false);
        channel.close();

        // The close signal was sent before the client could subscribe;
        // the session must still come up failed
        let client = PersistentRelayClient::new("relay:1".to_string(), Arc::clone(&channel) as _);
        assert_eq!(client.session().state(), SessionState::Failed);

        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(result, Err(RelayClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_channel_close_signal_fails_session() {
        let channel = FakeChannel::new(false);
        let client = PersistentRelayClient::new("relay:1".to_string(), Arc::clone(&channel) as _);
        assert_eq!(client.session().state(), SessionState::Active);

        channel.close();
        // Let the monitor task observe the close
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(client.session().state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_repeated_failures_fail_session() {
        let channel = FakeChannel::new(true);
        let client = PersistentRelayClient::new("relay:1".to_string(), channel);

        for _ in 0..=MAX_RELAY_FAILURES {
            let _ = client.send_to_relay(map_update()).await;
        }
        assert_eq!(client.session().state(), SessionState::Failed);

        // Terminal: further sends fail without touching the channel
        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(result, Err(RelayClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_shutdown_fails_subsequent_sends() {
        let channel = FakeChannel::new(false);
        let client = PersistentRelayClient::new("relay:1".to_string(), channel);

        client.shutdown();
        client.shutdown(); // idempotent

        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(result, Err(RelayClientError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_push_client_dials_per_call() {
        let connector = Arc::new(FakeConnector {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let client = PushRelayClient::new("relay:1".to_string(), Arc::clone(&connector) as _);

        client.send_to_relay(map_update()).await.unwrap();
        client.send_to_relay(map_update()).await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.relay_type(), RelayType::PushNotification);
    }

    #[tokio::test]
    async fn test_push_client_shutdown_flag() {
        let connector = Arc::new(FakeConnector {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let client = PushRelayClient::new("relay:1".to_string(), Arc::clone(&connector) as _);

        client.shutdown();
        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(result, Err(RelayClientError::SessionClosed)));
        assert_eq!(
            connector.calls.load(Ordering::SeqCst),
            0,
            "shutdown must prevent dialing"
        );
    }

    #[tokio::test]
    async fn test_push_client_failure_counting() {
        let connector = Arc::new(FakeConnector {
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let client = PushRelayClient::new("relay:1".to_string(), connector);

        let _ = client.send_to_relay(map_update()).await;
        assert_eq!(client.session().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_denied_response_counts_as_failure() {
        struct DenyingConnector;
        #[async_trait]
        impl RelayConnector for DenyingConnector {
            async fn request(
                &self,
                _address: &str,
                _message: RelayMessage,
            ) -> Result<RelayMessage, ChannelError> {
                Ok(RelayMessage::Denied {
                    reason: "not relaying for you".to_string(),
                })
            }
        }

        let client = PushRelayClient::new("relay:1".to_string(), Arc::new(DenyingConnector));
        let result = client.send_to_relay(map_update()).await;
        assert!(matches!(result, Err(RelayClientError::Denied(_))));
        assert_eq!(client.session().failure_count(), 1);
    }

    #[test]
    fn test_backoff_duration_caps() {
        let config = RelayClientConfig::default();
        let d0 = config.backoff_duration(0);
        let d3 = config.backoff_duration(3);
        assert!(d3 > d0);
        assert!(config.backoff_duration(20).as_secs() <= 60);
    }

    #[test]
    fn test_channel_tokens_are_unique() {
        assert_ne!(ChannelToken::next(), ChannelToken::next());
    }
}
