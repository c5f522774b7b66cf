//! Connection lifecycle management.
//!
//! [`ConnectionManager`] is the only place that opens or closes the broker
//! link. `connect` spawns a driver task that owns the [`Transport`] and
//! serves two channels: commands in (publish/subscribe/unsubscribe/
//! disconnect, via [`ConnectionHandle`]) and deliveries out (consumed by the
//! topic router). The single shared connection carries all topics in both
//! directions.
//!
//! Lifecycle: `Disconnected → Connecting → Connected`, with `Reconnecting`
//! on unexpected closure (fixed-period retries, bounded attempt count) and
//! `Faulted` when the bound is exhausted. At that point the loopback
//! transport is substituted and the driver proceeds to `Connected` in
//! degraded mode, so callers never special-case the fallback. Every
//! transition is published on a `watch` channel that doubles as the
//! user-visible connected/disconnected indicator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config::{self, SyncConfig};
use crate::error::SyncError;
use crate::publish::QosTier;
use crate::transport::{Transport, TransportEvent, TransportMode};

/// Lifecycle states of the broker link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Faulted,
}

impl LinkState {
    /// The boolean status indicator shown to users.
    pub fn is_connected(self) -> bool {
        matches!(self, LinkState::Connected)
    }

    /// A driver task is running in this state. `Faulted` is transient (the
    /// driver substitutes the fallback and moves on), so it counts too.
    fn in_progress(self) -> bool {
        !matches!(self, LinkState::Disconnected)
    }
}

/// Per-process session owned by the manager: generated client id,
/// clean-session flag, and the last connect attempt. Never persisted.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub client_id: String,
    pub clean_session: bool,
    pub last_connect: Option<DateTime<Utc>>,
}

/// An inbound message prior to decoding.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

enum LinkCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QosTier,
        done: oneshot::Sender<Result<(), SyncError>>,
    },
    Subscribe {
        topics: Vec<String>,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
}

/// Pure reconnect bookkeeping, separated from transport I/O so the retry
/// behavior is testable without a broker.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    /// Sleep the fixed period, then poll again, reporting this state.
    Retry(LinkState),
    /// Bound exhausted: declare the link faulted.
    GiveUp,
}

impl RetryPolicy {
    fn on_closed(&self, failed_attempts: u32, was_ever_connected: bool) -> RetryDecision {
        if failed_attempts > self.max_attempts {
            RetryDecision::GiveUp
        } else if was_ever_connected {
            RetryDecision::Retry(LinkState::Reconnecting)
        } else {
            RetryDecision::Retry(LinkState::Connecting)
        }
    }
}

/// Cheap cloneable handle to a running connection driver.
#[derive(Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<LinkCommand>,
    state: Arc<watch::Sender<LinkState>>,
    mode: Arc<watch::Sender<TransportMode>>,
    client_id: String,
}

impl ConnectionHandle {
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.subscribe().borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Live broker or loopback fallback, as negotiated at construction or
    /// after retry exhaustion.
    pub fn mode(&self) -> TransportMode {
        *self.mode.subscribe().borrow()
    }

    /// Watch every lifecycle transition (the status indicator feed).
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    /// Hand an encoded payload to the driver for transmission.
    ///
    /// The result reflects the driver's outcome: a publish the driver drops
    /// because the link went down surfaces as `NotConnected`, never as a
    /// silent `Ok`.
    pub async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QosTier,
    ) -> Result<(), SyncError> {
        let (done, outcome) = oneshot::channel();
        self.send(LinkCommand::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            done,
        })
        .await?;
        outcome.await.map_err(|_| SyncError::LinkClosed)?
    }

    /// Register topics with the broker in one batch. Issued before the link
    /// is up, the subscription is queued and flushed on connect.
    pub async fn subscribe_many(&self, topics: &[String]) -> Result<(), SyncError> {
        self.send(LinkCommand::Subscribe {
            topics: topics.to_vec(),
        })
        .await
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), SyncError> {
        self.send(LinkCommand::Unsubscribe {
            topic: topic.to_string(),
        })
        .await
    }

    async fn send(&self, cmd: LinkCommand) -> Result<(), SyncError> {
        self.cmd_tx.send(cmd).await.map_err(|_| SyncError::LinkClosed)
    }
}

/// Owner of the broker connection. Construct with an explicit [`SyncConfig`];
/// several managers with distinct configs can coexist in one process.
pub struct ConnectionManager {
    config: SyncConfig,
    session: ConnectionSession,
    state: Arc<watch::Sender<LinkState>>,
    mode: Arc<watch::Sender<TransportMode>>,
    cmd_tx: Option<mpsc::Sender<LinkCommand>>,
    delivery_tx: mpsc::Sender<Delivery>,
}

impl ConnectionManager {
    /// Create a manager and the delivery stream its driver will feed.
    pub fn new(config: SyncConfig) -> (Self, mpsc::Receiver<Delivery>) {
        let client_id = config::generate_client_id(&config.client_id_prefix);
        let session = ConnectionSession {
            client_id,
            clean_session: config.clean_session,
            last_connect: None,
        };
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (mode, _) = watch::channel(TransportMode::Live);
        let (delivery_tx, delivery_rx) = mpsc::channel(256);
        (
            Self {
                config,
                session,
                state: Arc::new(state),
                mode: Arc::new(mode),
                cmd_tx: None,
                delivery_tx,
            },
            delivery_rx,
        )
    }

    pub fn session(&self) -> &ConnectionSession {
        &self.session
    }

    pub fn state(&self) -> LinkState {
        *self.state.subscribe().borrow()
    }

    /// Start the connection driver.
    ///
    /// Re-entrant while a driver is running (any state but `Disconnected`):
    /// a no-op that returns the current state, so a second driver can never
    /// be spawned alongside a live one.
    pub fn connect(&mut self) -> LinkState {
        let current = self.state();
        if current.in_progress() {
            tracing::debug!(state = ?current, "connect is a no-op in this state");
            return current;
        }

        self.session.last_connect = Some(Utc::now());
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        self.cmd_tx = Some(cmd_tx);
        self.state.send_replace(LinkState::Connecting);

        tokio::spawn(run_driver(
            self.config.clone(),
            self.session.client_id.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.mode),
            self.delivery_tx.clone(),
            cmd_rx,
        ));
        LinkState::Connecting
    }

    /// A handle for the command surface. Valid after `connect`.
    pub fn handle(&self) -> Result<ConnectionHandle, SyncError> {
        let cmd_tx = self.cmd_tx.clone().ok_or(SyncError::LinkClosed)?;
        Ok(ConnectionHandle {
            cmd_tx,
            state: Arc::clone(&self.state),
            mode: Arc::clone(&self.mode),
            client_id: self.session.client_id.clone(),
        })
    }

    /// Tear the link down. Valid from any state; always ends `Disconnected`.
    pub async fn disconnect(&mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(LinkCommand::Disconnect).await;
        }
        self.state.send_replace(LinkState::Disconnected);
    }

    /// Watch every lifecycle transition (the status indicator feed).
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }
}

async fn run_driver(
    config: SyncConfig,
    client_id: String,
    state: Arc<watch::Sender<LinkState>>,
    mode: Arc<watch::Sender<TransportMode>>,
    delivery_tx: mpsc::Sender<Delivery>,
    mut cmd_rx: mpsc::Receiver<LinkCommand>,
) {
    let (mut transport, negotiated) = Transport::open(&config, &client_id);
    mode.send_replace(negotiated);

    let policy = RetryPolicy {
        max_attempts: config.max_reconnect_attempts,
    };
    let mut connected = false;
    let mut ever_connected = false;
    let mut failed_attempts: u32 = 0;
    // Topics the broker should know about: flushed on (re)connect.
    let mut subscribed: Vec<String> = Vec::new();
    let mut pending_subs: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            event = transport.next() => match event {
                TransportEvent::ConnAck => {
                    connected = true;
                    ever_connected = true;
                    failed_attempts = 0;
                    tracing::info!(%client_id, mode = ?*mode.subscribe().borrow(), "link up");

                    // Re-establish prior subscriptions, then flush the queue.
                    if let Err(error) = transport.subscribe(&subscribed).await {
                        tracing::warn!(%error, "resubscribe failed");
                    }
                    let queued: Vec<String> = pending_subs.drain(..).collect();
                    if let Err(error) = transport.subscribe(&queued).await {
                        tracing::warn!(%error, "subscribe failed");
                    }
                    subscribed.extend(queued);

                    state.send_replace(LinkState::Connected);
                }
                TransportEvent::Message { topic, payload } => {
                    if delivery_tx.send(Delivery { topic, payload }).await.is_err() {
                        // Consumer dropped the delivery stream: shut down.
                        transport.disconnect().await;
                        state.send_replace(LinkState::Disconnected);
                        break;
                    }
                }
                TransportEvent::Closed { reason } => {
                    connected = false;
                    failed_attempts += 1;
                    match policy.on_closed(failed_attempts, ever_connected) {
                        RetryDecision::Retry(retry_state) => {
                            state.send_replace(retry_state);
                            tracing::warn!(
                                %reason,
                                attempt = failed_attempts,
                                max = config.max_reconnect_attempts,
                                "link down; retrying"
                            );
                            tokio::time::sleep(config.reconnect_period).await;
                            // Next poll re-dials.
                        }
                        RetryDecision::GiveUp => {
                            state.send_replace(LinkState::Faulted);
                            tracing::warn!(
                                %reason,
                                attempts = failed_attempts,
                                "retries exhausted; substituting loopback transport"
                            );
                            transport = Transport::loopback();
                            mode.send_replace(TransportMode::Fallback);
                            failed_attempts = 0;
                            // The loopback acks on the next poll and the prior
                            // subscriptions are re-registered there.
                        }
                    }
                }
            },
            cmd = cmd_rx.recv() => match cmd {
                None | Some(LinkCommand::Disconnect) => {
                    transport.disconnect().await;
                    state.send_replace(LinkState::Disconnected);
                    tracing::info!(%client_id, "link closed");
                    break;
                }
                Some(LinkCommand::Publish { topic, payload, qos, done }) => {
                    if !connected {
                        tracing::warn!(%topic, "not connected; dropping publish");
                        let _ = done.send(Err(SyncError::NotConnected { topic }));
                        continue;
                    }
                    let result = transport.publish(&topic, payload, qos).await;
                    if let Err(error) = &result {
                        tracing::warn!(%topic, %error, "publish failed");
                    }
                    let _ = done.send(result);
                }
                Some(LinkCommand::Subscribe { topics }) => {
                    if connected {
                        match transport.subscribe(&topics).await {
                            Ok(()) => subscribed.extend(topics),
                            // Logged, not retried; the caller may resubscribe.
                            Err(error) => tracing::warn!(%error, "subscribe failed"),
                        }
                    } else {
                        tracing::debug!(count = topics.len(), "link not up; queueing subscriptions");
                        pending_subs.extend(topics);
                    }
                }
                Some(LinkCommand::Unsubscribe { topic }) => {
                    subscribed.retain(|t| t != &topic);
                    pending_subs.retain(|t| t != &topic);
                    if let Err(error) = transport.unsubscribe(&topic).await {
                        tracing::warn!(%topic, %error, "unsubscribe failed");
                    }
                }
            },
        }
    }
}
