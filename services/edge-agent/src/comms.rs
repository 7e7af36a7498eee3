//! Messaging transport boundary.
//!
//! The wire protocol and broker connection live behind [`Transport`]. The
//! agent only needs to publish documents on a topic, receive decoded
//! commands from its RPC topic, and disconnect on shutdown.
//! [`LoopbackTransport`] is an in-process implementation used when the agent
//! runs without a control plane and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::rpc::AgentCommand;

/// Capacity of a command subscription channel.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Delivery guarantee requested for a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// Transport failures. Always logged by the agent, never escalated.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("unsubscribe from {topic} failed: {reason}")]
    Unsubscribe { topic: String, reason: String },
}

/// Topic layout for one agent channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub base: String,
    pub heartbeat: String,
    pub rpc_from_core: String,
    pub rpc_to_core: String,
    pub capabilities: String,
}

impl Topics {
    pub fn for_channel(channel_id: &str) -> Self {
        let base = format!("channels/{channel_id}/messages");
        Self {
            heartbeat: format!("{base}/heartbeat"),
            rpc_from_core: format!("{base}/from_core"),
            rpc_to_core: format!("{base}/to_core"),
            capabilities: format!("{base}/capabilities"),
            base,
        }
    }

    /// Topic template handed to a backend. The backend substitutes `?` with
    /// the name of the data stream it publishes.
    pub fn backend_template(&self, backend: &str) -> String {
        format!("{}/?/{}", self.base, backend)
    }
}

/// Log sink installed into the transport so its diagnostics land in the
/// agent's structured log.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommsLogHooks {
    debug: bool,
}

impl CommsLogHooks {
    pub fn new(debug: bool) -> Self {
        Self { debug }
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug
    }

    pub fn critical(&self, message: &str) {
        error!(target: "comms", severity = "critical", "{message}");
    }

    pub fn error(&self, message: &str) {
        error!(target: "comms", "{message}");
    }

    pub fn warn(&self, message: &str) {
        warn!(target: "comms", "{message}");
    }

    pub fn debug(&self, message: &str) {
        if self.debug {
            debug!(target: "comms", "{message}");
        }
    }
}

/// Messaging transport used for heartbeats, requests and RPC.
#[async_trait]
pub trait Transport: Send + Sync {
    fn is_connected(&self) -> bool;

    fn install_log_hooks(&self, hooks: CommsLogHooks);

    async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Subscribes to a topic; the transport decodes inbound messages.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<AgentCommand>, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    async fn disconnect(&self);
}

/// A message captured by [`LoopbackTransport`].
#[derive(Debug, Clone)]
pub struct Published {
    pub topic: String,
    pub qos: Qos,
    pub payload: Vec<u8>,
}

/// In-process transport. Publishes are recorded, subscriptions are fed by
/// [`LoopbackTransport::deliver`].
pub struct LoopbackTransport {
    connected: AtomicBool,
    fail_publishes: AtomicBool,
    hooks: Mutex<CommsLogHooks>,
    published: Mutex<Vec<Published>>,
    subscribers: Mutex<HashMap<String, mpsc::Sender<AgentCommand>>>,
}

impl LoopbackTransport {
    pub fn connected() -> Self {
        Self::with_state(true)
    }

    pub fn disconnected() -> Self {
        Self::with_state(false)
    }

    fn with_state(connected: bool) -> Self {
        Self {
            connected: AtomicBool::new(connected),
            fail_publishes: AtomicBool::new(false),
            hooks: Mutex::new(CommsLogHooks::default()),
            published: Mutex::new(Vec::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Makes every subsequent publish fail.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Everything published so far.
    pub fn published(&self) -> Vec<Published> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Payloads published on one topic, oldest first.
    pub fn published_on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.payload)
            .collect()
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.subscribers
            .lock()
            .map(|s| s.contains_key(topic))
            .unwrap_or(false)
    }

    /// Delivers a command to the subscriber of `topic`.
    pub async fn deliver(&self, topic: &str, command: AgentCommand) -> Result<(), TransportError> {
        let sender = self
            .subscribers
            .lock()
            .ok()
            .and_then(|s| s.get(topic).cloned())
            .ok_or_else(|| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "no subscriber".to_string(),
            })?;
        sender
            .send(command)
            .await
            .map_err(|_| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "subscriber dropped".to_string(),
            })
    }

    fn hooks(&self) -> CommsLogHooks {
        self.hooks.lock().map(|h| *h).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn install_log_hooks(&self, hooks: CommsLogHooks) {
        if let Ok(mut current) = self.hooks.lock() {
            *current = hooks;
        }
    }

    async fn publish(&self, topic: &str, qos: Qos, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_publishes.load(Ordering::SeqCst) {
            self.hooks().error("loopback publish rejected");
            return Err(TransportError::Publish {
                topic: topic.to_string(),
                reason: "rejected".to_string(),
            });
        }

        self.hooks()
            .debug(&format!("publish {} bytes to {topic}", payload.len()));
        if let Ok(mut published) = self.published.lock() {
            published.push(Published {
                topic: topic.to_string(),
                qos,
                payload,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<AgentCommand>, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .map_err(|_| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: "subscriber table poisoned".to_string(),
            })?
            .insert(topic.to_string(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        let removed = self
            .subscribers
            .lock()
            .ok()
            .and_then(|mut s| s.remove(topic));
        match removed {
            Some(_) => Ok(()),
            None => Err(TransportError::Unsubscribe {
                topic: topic.to_string(),
                reason: "not subscribed".to_string(),
            }),
        }
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
        self.hooks().debug("loopback transport disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_for_channel() {
        let topics = Topics::for_channel("c1");
        assert_eq!(topics.base, "channels/c1/messages");
        assert_eq!(topics.heartbeat, "channels/c1/messages/heartbeat");
        assert_eq!(topics.backend_template("pktvisor"), "channels/c1/messages/?/pktvisor");
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = LoopbackTransport::disconnected();
        let result = transport.publish("t", Qos::AtLeastOnce, vec![1]).await;
        assert!(matches!(result, Err(TransportError::NotConnected)));
    }

    #[tokio::test]
    async fn test_publish_is_recorded() {
        let transport = LoopbackTransport::connected();
        transport.publish("t", Qos::AtLeastOnce, b"hi".to_vec()).await.unwrap();

        assert_eq!(transport.published_on("t"), vec![b"hi".to_vec()]);
        assert_eq!(transport.published()[0].qos, Qos::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_failing_publish() {
        let transport = LoopbackTransport::connected();
        transport.set_fail_publishes(true);
        assert!(transport.publish("t", Qos::AtMostOnce, vec![]).await.is_err());
        assert!(transport.published().is_empty());
    }

    #[tokio::test]
    async fn test_deliver_and_unsubscribe() {
        let transport = LoopbackTransport::connected();
        let mut rx = transport.subscribe("rpc").await.unwrap();

        transport
            .deliver(
                "rpc",
                AgentCommand::AgentStop {
                    reason: "test".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(matches!(rx.recv().await, Some(AgentCommand::AgentStop { .. })));

        transport.unsubscribe("rpc").await.unwrap();
        assert!(!transport.is_subscribed("rpc"));
        assert!(transport.unsubscribe("rpc").await.is_err());
    }

    #[tokio::test]
    async fn test_disconnect_drops_subscriptions() {
        let transport = LoopbackTransport::connected();
        let mut rx = transport.subscribe("rpc").await.unwrap();
        transport.disconnect().await;

        assert!(!transport.is_connected());
        assert!(rx.recv().await.is_none());
    }
}
