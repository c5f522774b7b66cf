//! Transport adapter over the broker connection.
//!
//! One enum covers both variants: a live MQTT link (rumqttc) and the
//! loopback fallback used when no broker is reachable. Which variant a
//! client gets is decided exactly once, when [`Transport::open`] inspects
//! the broker URL and reports a [`TransportMode`], so upper layers never
//! probe the transport's nature at call sites.
//!
//! The transport is payload-agnostic: it moves topic/bytes pairs and knows
//! nothing about change events.

use std::collections::HashSet;

use rumqttc::{AsyncClient, Event as MqttEvent, EventLoop, MqttOptions, Packet, SubscribeFilter};
use url::Url;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::publish::QosTier;

/// Whether the client runs against a live broker or the loopback stand-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Live,
    Fallback,
}

/// Events surfaced by either transport variant.
#[derive(Debug)]
pub enum TransportEvent {
    /// The link is up (broker acknowledged the connection).
    ConnAck,
    /// An inbound message on a subscribed topic.
    Message { topic: String, payload: Vec<u8> },
    /// The link failed or closed; polling again re-dials.
    Closed { reason: String },
}

pub enum Transport {
    Mqtt(MqttLink),
    Loopback(LoopbackLink),
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

/// Loop-back stand-in satisfying the same contract without network I/O.
///
/// Publishes are suppressed rather than delivered back to this client's own
/// handlers, so a self-echo can never be mistaken for a remote event.
/// Subscriptions register topics that simply never fire from outside.
#[derive(Default)]
pub struct LoopbackLink {
    subscribed: HashSet<String>,
    announced: bool,
}

impl Transport {
    /// Construct the transport for `config`, deciding live-or-fallback once.
    ///
    /// An unparsable broker URL or an unsupported scheme means the live
    /// transport cannot be built; the loopback takes its place and the
    /// caller observes logical success.
    pub fn open(config: &SyncConfig, client_id: &str) -> (Self, TransportMode) {
        match mqtt_options(config, client_id) {
            Ok(options) => {
                let (client, eventloop) = AsyncClient::new(options, 64);
                (
                    Transport::Mqtt(MqttLink { client, eventloop }),
                    TransportMode::Live,
                )
            }
            Err(reason) => {
                tracing::warn!(%reason, "live transport unavailable; using loopback");
                (Transport::loopback(), TransportMode::Fallback)
            }
        }
    }

    pub fn loopback() -> Self {
        Transport::Loopback(LoopbackLink::default())
    }

    /// Wait for the next transport event.
    pub async fn next(&mut self) -> TransportEvent {
        match self {
            Transport::Mqtt(link) => loop {
                match link.eventloop.poll().await {
                    Ok(MqttEvent::Incoming(Packet::ConnAck(_))) => {
                        return TransportEvent::ConnAck;
                    }
                    Ok(MqttEvent::Incoming(Packet::Publish(publish))) => {
                        return TransportEvent::Message {
                            topic: publish.topic.clone(),
                            payload: publish.payload.to_vec(),
                        };
                    }
                    Ok(_) => continue,
                    Err(error) => {
                        return TransportEvent::Closed {
                            reason: error.to_string(),
                        };
                    }
                }
            },
            Transport::Loopback(link) => {
                if !link.announced {
                    link.announced = true;
                    return TransportEvent::ConnAck;
                }
                // Nothing ever arrives from outside on the loopback.
                std::future::pending().await
            }
        }
    }

    pub async fn publish(
        &mut self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosTier,
    ) -> Result<(), SyncError> {
        match self {
            Transport::Mqtt(link) => link
                .client
                .publish(topic, qos.to_mqtt(), false, payload)
                .await
                .map_err(|e| SyncError::Transport(e.to_string())),
            Transport::Loopback(_) => {
                tracing::debug!(%topic, "loopback publish suppressed");
                Ok(())
            }
        }
    }

    /// Register all `topics` with the broker in one batch.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<(), SyncError> {
        if topics.is_empty() {
            return Ok(());
        }
        match self {
            Transport::Mqtt(link) => {
                let filters = topics
                    .iter()
                    .map(|t| SubscribeFilter::new(t.clone(), QosTier::default().to_mqtt()));
                link.client
                    .subscribe_many(filters)
                    .await
                    .map_err(|e| SyncError::Transport(e.to_string()))
            }
            Transport::Loopback(link) => {
                link.subscribed.extend(topics.iter().cloned());
                Ok(())
            }
        }
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<(), SyncError> {
        match self {
            Transport::Mqtt(link) => link
                .client
                .unsubscribe(topic)
                .await
                .map_err(|e| SyncError::Transport(e.to_string())),
            Transport::Loopback(link) => {
                link.subscribed.remove(topic);
                Ok(())
            }
        }
    }

    /// Release the underlying connection. Safe to call in any state.
    pub async fn disconnect(&mut self) {
        match self {
            Transport::Mqtt(link) => {
                if let Err(error) = link.client.disconnect().await {
                    tracing::debug!(%error, "disconnect while link already down");
                }
            }
            Transport::Loopback(link) => {
                link.subscribed.clear();
                link.announced = false;
            }
        }
    }
}

fn mqtt_options(config: &SyncConfig, client_id: &str) -> Result<MqttOptions, String> {
    let url = Url::parse(&config.broker_url).map_err(|e| format!("bad broker url: {e}"))?;
    let (default_port, tls) = match url.scheme() {
        "mqtt" | "tcp" => (1883, false),
        "mqtts" | "ssl" => (8883, true),
        other => return Err(format!("unsupported broker scheme '{other}'")),
    };
    let host = url
        .host_str()
        .ok_or_else(|| "broker url has no host".to_string())?
        .to_string();
    let port = url.port().unwrap_or(default_port);

    let mut options = MqttOptions::new(client_id, host, port);
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(config.clean_session);
    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    if tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> SyncConfig {
        SyncConfig {
            broker_url: url.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_and_tls_schemes_build_live_transport() {
        for url in ["mqtt://broker.local:1883", "mqtts://broker.local"] {
            let (_, mode) = Transport::open(&config(url), "todo_client_0");
            assert_eq!(mode, TransportMode::Live, "{url}");
        }
    }

    #[tokio::test]
    async fn unsupported_scheme_falls_back() {
        let (transport, mode) = Transport::open(&config("wss://broker.local/mqtt"), "c");
        assert_eq!(mode, TransportMode::Fallback);
        assert!(matches!(transport, Transport::Loopback(_)));
    }

    #[tokio::test]
    async fn garbage_url_falls_back() {
        let (_, mode) = Transport::open(&config("not a url"), "c");
        assert_eq!(mode, TransportMode::Fallback);
    }

    #[tokio::test]
    async fn loopback_announces_then_never_delivers() {
        let mut transport = Transport::loopback();
        assert!(matches!(transport.next().await, TransportEvent::ConnAck));

        transport
            .subscribe(&["todo/tasks".to_string()])
            .await
            .unwrap();
        transport
            .publish("todo/tasks", b"{}".to_vec(), QosTier::AtLeastOnce)
            .await
            .unwrap();

        // A publish on the loopback must not echo back to our own handlers.
        let delivered = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.next(),
        )
        .await;
        assert!(delivered.is_err(), "loopback must suppress self-echo");
    }

    #[test]
    fn default_port_applied_per_scheme() {
        let options = mqtt_options(&config("mqtt://broker.local"), "c").unwrap();
        assert_eq!(options.broker_address().1, 1883);
        let options = mqtt_options(&config("mqtts://broker.local"), "c").unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }
}
