//! Relay subsystem: sessions, clients, forwarders, and the server loop.
//!
//! A reachable peer relays for an unreachable one in one of two modes.
//! Persistent: the unreachable peer keeps a registered channel open and
//! traffic is forwarded live. Push: the relay buffers traffic and wakes
//! the sleeping device through a push gateway when the buffer flushes.

pub mod client;
pub mod forwarder;
pub mod framing;
pub mod liveness;
pub mod protocol;
pub mod server;
pub mod session;

pub use client::{
    ChannelError, ChannelToken, PeerChannel, PersistentRelayClient, PushRelayClient, RelayClient,
    RelayClientConfig, RelayClientError, RelayConnector, TcpConnector, TcpPeerChannel,
};
pub use forwarder::{CachedAddress, ForwardError, PersistentForwarder, PushForwarder, ReportOrigin};
pub use framing::{read_frame, write_frame, FramingError};
pub use liveness::{LivenessTracker, DEFAULT_LIVENESS_STRETCH};
pub use protocol::{
    PushSetup, RelayCommand, RelayMessage, RelayProtocolError, RelayType, SetupDecision,
    MAX_FRAME_SIZE, PROTOCOL_VERSION,
};
pub use server::{RelayServer, RelayServerConfig, RelayServerStats};
pub use session::{SessionBookkeeping, SessionState, MAX_RELAY_FAILURES};
