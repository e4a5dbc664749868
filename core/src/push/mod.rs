//! Push wake-up delivery chain
//!
//! When a push-relayed peer's buffer flushes, the device behind the NAT
//! must be told to come and fetch. Two ways to deliver that wake-up:
//! the relay holds gateway credentials itself and calls the gateway
//! directly, or it delegates to an ordered list of peers known to hold
//! credentials, stopping at the first one that acknowledges.
//!
//! The gateway's authentication key lives inside the `GatewayClient`
//! implementation and never travels across the P2P network; only the
//! device registration id and a collapse key do.

use crate::relay::client::{ChannelError, RelayConnector};
use crate::relay::protocol::RelayMessage;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One wake-up call to the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
    /// Device registration id assigned by the gateway
    pub registration_id: String,
    /// Coalescing key: repeated wake-ups for the same device collapse
    pub collapse_key: String,
}

/// Gateway acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
    /// Gateway-assigned message id
    pub message_id: String,
    /// Set when the gateway says the device's registration id changed;
    /// the caller should persist the new id or risk future sends failing
    pub canonical_registration_id: Option<String>,
}

/// Gateway-side failures
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Gateway unavailable: {0}")]
    Unavailable(String),
    #[error("Registration id rejected: {0}")]
    InvalidRegistration(String),
    #[error("Gateway rejected the send: {0}")]
    Rejected(String),
}

/// Blocking push-gateway call. Implementations wrap the vendor HTTP API
/// and hold the authentication key internally.
#[cfg_attr(test, mockall::automock)]
pub trait GatewayClient: Send + Sync {
    /// Send one wake-up; blocks until the gateway answers
    fn send(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// Outcome of a delivered wake-up
#[derive(Debug, Clone, PartialEq)]
pub struct WakeupReceipt {
    /// Message id reported by whoever delivered the wake-up
    pub message_id: String,
    /// Replacement registration id to persist, when the gateway sent one
    pub canonical_registration_id: Option<String>,
}

/// Wake-up delivery failures
#[derive(Debug, Error)]
pub enum WakeupError {
    #[error("Gateway failed after {attempts} attempts: {last}")]
    GatewayFailed { attempts: u32, last: GatewayError },
    #[error("All {tried} delegates failed")]
    AllDelegatesFailed { tried: usize },
    #[error("No delegates configured")]
    NoDelegates,
    #[error("Wake-up cancelled by shutdown")]
    Cancelled,
    #[error(transparent)]
    Transport(#[from] ChannelError),
}

/// Delivers "fetch your buffered messages" to an unreachable device
#[async_trait]
pub trait WakeupSender: Send + Sync {
    /// Wake the device registered as `registration_id` on behalf of
    /// `relay_sender_id`, for traffic addressed to `recipient_id`
    async fn send_wakeup(
        &self,
        registration_id: &str,
        relay_sender_id: &str,
        recipient_id: &str,
    ) -> Result<WakeupReceipt, WakeupError>;
}

/// Collapse key for a recipient: one key per device, so the gateway
/// coalesces a burst of flushes into a single wake-up.
pub fn collapse_key_for(recipient_id: &str) -> String {
    format!("sideband-wakeup-{recipient_id}")
}

// ============================================================================
// DIRECT SENDER
// ============================================================================

/// Calls the push gateway with locally held credentials.
///
/// The blocking gateway call runs on the blocking pool so the RPC dispatch
/// path is never stalled by gateway latency. Retries up to the configured
/// attempt count; reports the first success or the last failure.
pub struct DirectWakeupSender {
    gateway: Arc<dyn GatewayClient>,
    retries: u32,
    cancelled: AtomicBool,
}

impl DirectWakeupSender {
    /// Sender with `retries` total attempts per wake-up
    pub fn new(gateway: Arc<dyn GatewayClient>, retries: u32) -> Self {
        Self {
            gateway,
            retries: retries.max(1),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Abandon in-flight retry loops; they stop before their next attempt
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

#[async_trait]
impl WakeupSender for DirectWakeupSender {
    async fn send_wakeup(
        &self,
        registration_id: &str,
        relay_sender_id: &str,
        recipient_id: &str,
    ) -> Result<WakeupReceipt, WakeupError> {
        let request = GatewayRequest {
            registration_id: registration_id.to_string(),
            collapse_key: collapse_key_for(recipient_id),
        };

        let mut last_error = None;
        for attempt in 1..=self.retries {
            if self.cancelled.load(Ordering::Acquire) {
                return Err(WakeupError::Cancelled);
            }

            let gateway = Arc::clone(&self.gateway);
            let call = request.clone();
            let result = tokio::task::spawn_blocking(move || gateway.send(&call))
                .await
                .map_err(|e| GatewayError::Unavailable(e.to_string()))
                .and_then(|r| r);

            match result {
                Ok(response) => {
                    if let Some(canonical) = &response.canonical_registration_id {
                        info!(
                            relay = relay_sender_id,
                            canonical, "gateway reports a new registration id; persist it"
                        );
                    }
                    debug!(
                        attempt,
                        message_id = %response.message_id,
                        "wake-up delivered to gateway"
                    );
                    return Ok(WakeupReceipt {
                        message_id: response.message_id,
                        canonical_registration_id: response.canonical_registration_id,
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "gateway wake-up attempt failed");
                    last_error = Some(e);
                }
            }
        }

        Err(WakeupError::GatewayFailed {
            attempts: self.retries,
            last: last_error.unwrap_or_else(|| GatewayError::Unavailable("no attempts".into())),
        })
    }
}

// ============================================================================
// DELEGATE SENDER
// ============================================================================

/// Delegates the wake-up to peers known to hold gateway credentials.
///
/// Delegates are tried in order; the first acknowledged success wins.
/// Retrying happens across delegates, never within one. The list is an
/// atomically swappable immutable snapshot: readers always see a complete,
/// consistent list even while it is being replaced.
pub struct DelegateWakeupSender {
    delegates: RwLock<Arc<Vec<String>>>,
    connector: Arc<dyn RelayConnector>,
}

impl DelegateWakeupSender {
    /// Sender trying `delegates` in order through `connector`
    pub fn new(delegates: Vec<String>, connector: Arc<dyn RelayConnector>) -> Self {
        Self {
            delegates: RwLock::new(Arc::new(delegates)),
            connector,
        }
    }

    /// Replace the delegate list wholesale
    pub fn set_delegates(&self, delegates: Vec<String>) {
        *self.delegates.write() = Arc::new(delegates);
    }

    /// Current delegate list snapshot
    pub fn delegates(&self) -> Arc<Vec<String>> {
        Arc::clone(&self.delegates.read())
    }
}

#[async_trait]
impl WakeupSender for DelegateWakeupSender {
    async fn send_wakeup(
        &self,
        registration_id: &str,
        relay_sender_id: &str,
        recipient_id: &str,
    ) -> Result<WakeupReceipt, WakeupError> {
        let delegates = self.delegates();
        if delegates.is_empty() {
            return Err(WakeupError::NoDelegates);
        }

        let rpc = RelayMessage::Wakeup {
            registration_id: registration_id.to_string(),
            collapse_key: collapse_key_for(recipient_id),
            recipient_id: recipient_id.to_string(),
        };

        for delegate in delegates.iter() {
            match self.connector.request(delegate, rpc.clone()).await {
                Ok(RelayMessage::WakeupAck { message_id }) => {
                    debug!(relay = relay_sender_id, delegate = %delegate, "delegate delivered wake-up");
                    return Ok(WakeupReceipt {
                        message_id,
                        canonical_registration_id: None,
                    });
                }
                Ok(other) => {
                    warn!(delegate = %delegate, response = other.message_type(), "delegate refused wake-up");
                }
                Err(e) => {
                    warn!(delegate = %delegate, error = %e, "delegate unreachable");
                }
            }
        }

        Err(WakeupError::AllDelegatesFailed {
            tried: delegates.len(),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn test_direct_sender_first_success() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_send().times(1).returning(|_| {
            Ok(GatewayResponse {
                message_id: "gw-1".to_string(),
                canonical_registration_id: None,
            })
        });

        let sender = DirectWakeupSender::new(Arc::new(gateway), 5);
        let receipt = sender.send_wakeup("reg-1", "relay", "bob").await.unwrap();
        assert_eq!(receipt.message_id, "gw-1");
        assert!(receipt.canonical_registration_id.is_none());
    }

    #[tokio::test]
    async fn test_direct_sender_retries_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut gateway = MockGatewayClient::new();
        gateway.expect_send().times(3).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(GatewayError::Unavailable("flaky".to_string()))
            } else {
                Ok(GatewayResponse {
                    message_id: "gw-2".to_string(),
                    canonical_registration_id: None,
                })
            }
        });

        let sender = DirectWakeupSender::new(Arc::new(gateway), 5);
        let receipt = sender.send_wakeup("reg-1", "relay", "bob").await.unwrap();
        assert_eq!(receipt.message_id, "gw-2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_direct_sender_reports_last_failure() {
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_send()
            .times(3)
            .returning(|_| Err(GatewayError::Rejected("quota".to_string())));

        let sender = DirectWakeupSender::new(Arc::new(gateway), 3);
        let result = sender.send_wakeup("reg-1", "relay", "bob").await;

        match result {
            Err(WakeupError::GatewayFailed { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(last, GatewayError::Rejected(_)));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_direct_sender_surfaces_canonical_id() {
        let mut gateway = MockGatewayClient::new();
        gateway.expect_send().returning(|_| {
            Ok(GatewayResponse {
                message_id: "gw-3".to_string(),
                canonical_registration_id: Some("reg-new".to_string()),
            })
        });

        let sender = DirectWakeupSender::new(Arc::new(gateway), 1);
        let receipt = sender.send_wakeup("reg-old", "relay", "bob").await.unwrap();
        assert_eq!(
            receipt.canonical_registration_id,
            Some("reg-new".to_string())
        );
    }

    #[tokio::test]
    async fn test_direct_sender_cancel_stops_retries() {
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_send()
            .returning(|_| Err(GatewayError::Unavailable("down".to_string())));

        let sender = DirectWakeupSender::new(Arc::new(gateway), 100);
        sender.cancel();

        let result = sender.send_wakeup("reg-1", "relay", "bob").await;
        assert!(matches!(result, Err(WakeupError::Cancelled)));
    }

    #[tokio::test]
    async fn test_direct_sender_collapse_key() {
        let mut gateway = MockGatewayClient::new();
        gateway
            .expect_send()
            .withf(|req: &GatewayRequest| req.collapse_key == "sideband-wakeup-bob")
            .returning(|_| {
                Ok(GatewayResponse {
                    message_id: "gw-4".to_string(),
                    canonical_registration_id: None,
                })
            });

        let sender = DirectWakeupSender::new(Arc::new(gateway), 1);
        sender.send_wakeup("reg-1", "relay", "bob").await.unwrap();
    }

    /// Connector that scripts a response per delegate address
    struct ScriptedConnector {
        contacted: StdMutex<Vec<String>>,
        failing: Vec<String>,
    }

    #[async_trait]
    impl RelayConnector for ScriptedConnector {
        async fn request(
            &self,
            address: &str,
            _message: RelayMessage,
        ) -> Result<RelayMessage, ChannelError> {
            self.contacted.lock().unwrap().push(address.to_string());
            if self.failing.iter().any(|f| f == address) {
                Err(ChannelError::ConnectionFailed("unreachable".to_string()))
            } else {
                Ok(RelayMessage::WakeupAck {
                    message_id: format!("ack-{address}"),
                })
            }
        }
    }

    #[tokio::test]
    async fn test_delegate_fallback_stops_at_first_success() {
        let connector = Arc::new(ScriptedConnector {
            contacted: StdMutex::new(Vec::new()),
            failing: vec!["d1:7000".to_string()],
        });
        let sender = DelegateWakeupSender::new(
            vec![
                "d1:7000".to_string(),
                "d2:7000".to_string(),
                "d3:7000".to_string(),
            ],
            Arc::clone(&connector) as _,
        );

        let receipt = sender.send_wakeup("reg-1", "relay", "bob").await.unwrap();
        assert_eq!(receipt.message_id, "ack-d2:7000");

        let contacted = connector.contacted.lock().unwrap();
        assert_eq!(*contacted, vec!["d1:7000".to_string(), "d2:7000".to_string()]);
    }

    #[tokio::test]
    async fn test_delegate_all_fail() {
        let connector = Arc::new(ScriptedConnector {
            contacted: StdMutex::new(Vec::new()),
            failing: vec!["d1:7000".to_string(), "d2:7000".to_string()],
        });
        let sender = DelegateWakeupSender::new(
            vec!["d1:7000".to_string(), "d2:7000".to_string()],
            connector,
        );

        let result = sender.send_wakeup("reg-1", "relay", "bob").await;
        assert!(matches!(
            result,
            Err(WakeupError::AllDelegatesFailed { tried: 2 })
        ));
    }

    #[tokio::test]
    async fn test_delegate_empty_list_fails() {
        let connector = Arc::new(ScriptedConnector {
            contacted: StdMutex::new(Vec::new()),
            failing: vec![],
        });
        let sender = DelegateWakeupSender::new(Vec::new(), connector);

        let result = sender.send_wakeup("reg-1", "relay", "bob").await;
        assert!(matches!(result, Err(WakeupError::NoDelegates)));
    }

    #[tokio::test]
    async fn test_delegate_list_swap_is_atomic_snapshot() {
        let connector = Arc::new(ScriptedConnector {
            contacted: StdMutex::new(Vec::new()),
            failing: vec![],
        });
        let sender = DelegateWakeupSender::new(vec!["old:1".to_string()], connector);

        let before = sender.delegates();
        sender.set_delegates(vec!["new:1".to_string(), "new:2".to_string()]);

        // Old snapshot is unchanged; new readers see the full new list
        assert_eq!(*before, vec!["old:1".to_string()]);
        assert_eq!(sender.delegates().len(), 2);
    }

    #[test]
    fn test_collapse_key_is_per_recipient() {
        assert_eq!(collapse_key_for("bob"), "sideband-wakeup-bob");
        assert_ne!(collapse_key_for("bob"), collapse_key_for("carol"));
    }
}
