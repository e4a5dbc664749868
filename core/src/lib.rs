// Sideband — relay spine for unreachable peers
//
// "Can a peer behind a NAT, asleep in someone's pocket, still get
//  its messages without a corporation in the middle?"
//
// Everything in this crate serves that question.

pub mod buffer;
pub mod dispatch;
pub mod message;
pub mod push;
pub mod relay;

pub use buffer::{BufferedMessage, FlushListener, MessageBuffer, MessageBufferConfig};
pub use dispatch::{Dispatcher, RpcHandler};
pub use message::{decode_message, encode_message, Message, MessageKind};
pub use push::{
    DelegateWakeupSender, DirectWakeupSender, GatewayClient, GatewayError, GatewayRequest,
    GatewayResponse, WakeupError, WakeupReceipt, WakeupSender,
};
pub use relay::{
    PeerChannel, PersistentRelayClient, PushRelayClient, RelayClient, RelayConnector, RelayMessage,
    RelayServer, RelayServerConfig, RelayType,
};
