//! Dispatcher — routes inbound relay messages to the handler registered
//! for a (peer-id, command) pair
//!
//! The relay server installs one handler per relayed peer per command it
//! serves for that peer. A handler never lets an error escape: failures
//! come back as protocol-level `Denied` replies.

use crate::relay::protocol::{RelayCommand, RelayMessage};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Handles one inbound message addressed to a relayed peer.
///
/// Implementations answer with a protocol message in every case; transport
/// and codec failures are converted to `Denied` inside the handler.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle `message` sent by `from_peer`
    async fn handle(&self, from_peer: &str, message: RelayMessage) -> RelayMessage;
}

/// Registry of handlers keyed by (relayed peer id, command)
pub struct Dispatcher {
    handlers: RwLock<HashMap<(String, RelayCommand), Arc<dyn RpcHandler>>>,
}

impl Dispatcher {
    /// Empty dispatcher
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Install `handler` for messages of `command` addressed to `peer_id`,
    /// replacing any previous handler for that pair
    pub fn register(&self, peer_id: String, command: RelayCommand, handler: Arc<dyn RpcHandler>) {
        debug!(peer = %peer_id, ?command, "registering handler");
        self.handlers.write().insert((peer_id, command), handler);
    }

    /// Look up the handler for a (peer-id, command) pair
    pub fn lookup_handler(&self, peer_id: &str, command: RelayCommand) -> Option<Arc<dyn RpcHandler>> {
        self.handlers
            .read()
            .get(&(peer_id.to_string(), command))
            .cloned()
    }

    /// Remove every handler registered for `peer_id`
    pub fn unregister_peer(&self, peer_id: &str) {
        self.handlers.write().retain(|(p, _), _| p != peer_id);
    }

    /// Number of registered (peer, command) pairs
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }

    /// Route `message` to the handler registered for (`target_peer`,
    /// message command). Unroutable messages are answered with `Denied`.
    pub async fn dispatch(
        &self,
        from_peer: &str,
        target_peer: &str,
        message: RelayMessage,
    ) -> RelayMessage {
        match self.lookup_handler(target_peer, message.command()) {
            Some(handler) => handler.handle(from_peer, message).await,
            None => RelayMessage::Denied {
                reason: format!("no handler for peer {target_peer}"),
            },
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticHandler(RelayMessage);

    #[async_trait]
    impl RpcHandler for StaticHandler {
        async fn handle(&self, _from_peer: &str, _message: RelayMessage) -> RelayMessage {
            self.0.clone()
        }
    }

    fn ack() -> RelayMessage {
        RelayMessage::MapUpdateAck { buffered: vec![] }
    }

    #[tokio::test]
    async fn test_register_and_dispatch() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::MapUpdate,
            Arc::new(StaticHandler(ack())),
        );

        let reply = dispatcher
            .dispatch(
                "bob",
                "bob",
                RelayMessage::MapUpdate {
                    peer_id: "bob".to_string(),
                },
            )
            .await;
        assert_eq!(reply, ack());
    }

    #[tokio::test]
    async fn test_unrouted_message_is_denied() {
        let dispatcher = Dispatcher::new();
        let reply = dispatcher
            .dispatch(
                "alice",
                "nobody",
                RelayMessage::MapUpdate {
                    peer_id: "nobody".to_string(),
                },
            )
            .await;
        assert!(matches!(reply, RelayMessage::Denied { .. }));
    }

    #[tokio::test]
    async fn test_command_keys_are_independent() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::Forward,
            Arc::new(StaticHandler(ack())),
        );

        assert!(dispatcher
            .lookup_handler("bob", RelayCommand::Forward)
            .is_some());
        assert!(dispatcher
            .lookup_handler("bob", RelayCommand::MapUpdate)
            .is_none());
    }

    #[tokio::test]
    async fn test_unregister_peer_removes_all_commands() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::Forward,
            Arc::new(StaticHandler(ack())),
        );
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::MapUpdate,
            Arc::new(StaticHandler(ack())),
        );
        dispatcher.register(
            "carol".to_string(),
            RelayCommand::Forward,
            Arc::new(StaticHandler(ack())),
        );

        dispatcher.unregister_peer("bob");
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher
            .lookup_handler("carol", RelayCommand::Forward)
            .is_some());
    }

    #[tokio::test]
    async fn test_reregistration_replaces_handler() {
        let dispatcher = Dispatcher::new();
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::Forward,
            Arc::new(StaticHandler(RelayMessage::Denied {
                reason: "old".to_string(),
            })),
        );
        dispatcher.register(
            "bob".to_string(),
            RelayCommand::Forward,
            Arc::new(StaticHandler(ack())),
        );

        let reply = dispatcher
            .dispatch(
                "alice",
                "bob",
                RelayMessage::ForwardEnvelope {
                    sender_id: "alice".to_string(),
                    recipient_id: "bob".to_string(),
                    payload: vec![],
                },
            )
            .await;
        assert_eq!(reply, ack());
        assert_eq!(dispatcher.len(), 1);
    }
}
