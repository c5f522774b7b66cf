//! Outbound event dispatch.
//!
//! The dispatcher encodes structured payloads, attaches a delivery-guarantee
//! tier, and hands the bytes to the connection driver. It performs no local
//! retry or deduplication; the tier maps straight onto the transport's
//! guarantee. Publishing while the link is down is not queued: the message
//! is dropped with a warning and the caller gets an error, never a silent
//! success.

use serde::Serialize;

use crate::change::ChangeEvent;
use crate::connection::ConnectionHandle;
use crate::error::SyncError;

/// Delivery-guarantee tier for a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QosTier {
    /// 0 — fire and forget.
    AtMostOnce,
    /// 1 — at least once (the default).
    #[default]
    AtLeastOnce,
    /// 2 — exactly once.
    ExactlyOnce,
}

impl QosTier {
    pub(crate) fn to_mqtt(self) -> rumqttc::QoS {
        match self {
            QosTier::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QosTier::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QosTier::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QosTier::AtMostOnce),
            1 => Some(QosTier::AtLeastOnce),
            2 => Some(QosTier::ExactlyOnce),
            _ => None,
        }
    }
}

/// Encodes and dispatches outgoing messages through a connection handle.
#[derive(Clone)]
pub struct Publisher {
    handle: ConnectionHandle,
}

impl Publisher {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self { handle }
    }

    /// Publish a structured message, JSON-encoded before transmission.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        message: &T,
        qos: QosTier,
    ) -> Result<(), SyncError> {
        let payload = serde_json::to_vec(message)?;
        self.publish_bytes(topic, payload, qos).await
    }

    /// Publish a plain text message unencoded.
    pub async fn publish_text(
        &self,
        topic: &str,
        text: &str,
        qos: QosTier,
    ) -> Result<(), SyncError> {
        self.publish_bytes(topic, text.as_bytes().to_vec(), qos).await
    }

    /// Publish a change event at the default tier.
    pub async fn publish_change(
        &self,
        topic: &str,
        event: &ChangeEvent,
    ) -> Result<(), SyncError> {
        self.publish(topic, event, QosTier::default()).await
    }

    async fn publish_bytes(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosTier,
    ) -> Result<(), SyncError> {
        if !self.handle.is_connected() {
            tracing::warn!(%topic, "not connected; dropping publish");
            return Err(SyncError::NotConnected {
                topic: topic.to_string(),
            });
        }
        self.handle.publish(topic, payload, qos).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::connection::{ConnectionManager, LinkState};

    #[test]
    fn qos_levels_map_to_transport_tiers() {
        assert_eq!(QosTier::from_level(0), Some(QosTier::AtMostOnce));
        assert_eq!(QosTier::from_level(1), Some(QosTier::AtLeastOnce));
        assert_eq!(QosTier::from_level(2), Some(QosTier::ExactlyOnce));
        assert_eq!(QosTier::from_level(3), None);
        assert_eq!(QosTier::default(), QosTier::AtLeastOnce);
    }

    #[tokio::test]
    async fn publish_while_disconnected_fails_loud() {
        let config = SyncConfig {
            broker_url: "wss://unsupported.example/mqtt".to_string(),
            ..Default::default()
        };
        let (mut manager, _deliveries) = ConnectionManager::new(config);
        // Driver started but we do not wait for the link: Connecting state.
        manager.connect();
        let publisher = Publisher::new(manager.handle().unwrap());

        if manager.state() == LinkState::Connecting {
            let result = publisher
                .publish_text("todo/tasks", "hello", QosTier::AtMostOnce)
                .await;
            assert!(matches!(result, Err(SyncError::NotConnected { .. })));
        }
        manager.disconnect().await;
    }
}
