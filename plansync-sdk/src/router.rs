//! Topic router: multiplexes the single connection across logical channels.
//!
//! Handlers register per exact topic name. On delivery the raw payload is
//! decoded as JSON; when that fails the text is delivered unchanged, and a
//! payload that is not even UTF-8 is delivered byte-for-byte, so handlers
//! must tolerate all three shapes. Fan-out is synchronous and in
//! registration order, and one handler's failure never prevents delivery to
//! the handlers after it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::change::ChangeEvent;
use crate::connection::{ConnectionHandle, Delivery};
use crate::error::SyncError;

/// A decoded inbound payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// The payload parsed as JSON.
    Json(serde_json::Value),
    /// Not JSON; the payload text, unchanged.
    Raw(String),
    /// Not even UTF-8; the payload bytes, unchanged.
    Bytes(Vec<u8>),
}

type Handler = Box<dyn FnMut(&str, &Payload) -> anyhow::Result<()> + Send>;

#[derive(Default)]
pub struct TopicRouter {
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an exact topic. Handlers for the same topic
    /// run in registration order.
    pub fn on<F>(&self, topic: &str, handler: F)
    where
        F: FnMut(&str, &Payload) -> anyhow::Result<()> + Send + 'static,
    {
        self.handlers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Box::new(handler));
    }

    /// Register every handler topic with the broker in one batch.
    ///
    /// Subscribe failures are logged, not retried; the caller may
    /// resubscribe.
    pub async fn subscribe_all(&self, handle: &ConnectionHandle) -> Result<(), SyncError> {
        let topics: Vec<String> = self.handlers.lock().keys().cloned().collect();
        if let Err(error) = handle.subscribe_many(&topics).await {
            tracing::warn!(%error, "batch subscribe failed");
            return Err(error);
        }
        tracing::debug!(count = topics.len(), "topics registered");
        Ok(())
    }

    /// Forward decoded [`ChangeEvent`]s from `topics` into a channel.
    ///
    /// Undecodable payloads are dropped (with a log line) inside the
    /// registered handler; the receiver only ever sees well-formed events.
    pub fn change_stream(&self, topics: &[&str]) -> mpsc::UnboundedReceiver<ChangeEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for topic in topics {
            let tx = tx.clone();
            self.on(topic, move |topic, payload| {
                if let Some(event) = ChangeEvent::decode(topic, payload) {
                    let _ = tx.send(event);
                }
                Ok(())
            });
        }
        rx
    }

    /// Decode and fan out one inbound message.
    pub fn dispatch(&self, topic: &str, raw: &[u8]) {
        let payload = match std::str::from_utf8(raw) {
            Ok(text) => match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => Payload::Json(value),
                Err(_) => Payload::Raw(text.to_string()),
            },
            Err(_) => Payload::Bytes(raw.to_vec()),
        };

        let mut handlers = self.handlers.lock();
        let Some(registered) = handlers.get_mut(topic) else {
            tracing::debug!(%topic, "message on topic with no handlers");
            return;
        };
        for (index, handler) in registered.iter_mut().enumerate() {
            if let Err(error) = handler(topic, &payload) {
                // Isolate the failure; later handlers still run.
                tracing::warn!(%topic, index, %error, "handler failed");
            }
        }
    }
}

/// Drain the connection driver's delivery stream into the router.
pub async fn pump(router: Arc<TopicRouter>, mut deliveries: mpsc::Receiver<Delivery>) {
    while let Some(delivery) = deliveries.recv().await {
        router.dispatch(&delivery.topic, &delivery.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fan_out_runs_in_registration_order() {
        let router = TopicRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            router.on("todo/tasks", move |_, _| {
                seen.lock().push(tag);
                Ok(())
            });
        }

        router.dispatch("todo/tasks", br#"{"x":1}"#);
        assert_eq!(*seen.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_handler_does_not_block_later_ones() {
        let router = TopicRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        router.on("todo/sync", |_, _| anyhow::bail!("boom"));
        let calls2 = Arc::clone(&calls);
        router.on("todo/sync", move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        router.dispatch("todo/sync", b"{}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn undecodable_payload_arrives_raw_and_unchanged() {
        let router = TopicRouter::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        router.on("todo/notification", move |_, payload| {
            *seen2.lock() = Some(payload.clone());
            Ok(())
        });

        router.dispatch("todo/notification", b"plain text ping");
        assert_eq!(
            seen.lock().take(),
            Some(Payload::Raw("plain text ping".to_string()))
        );
    }

    #[test]
    fn non_utf8_payload_arrives_byte_for_byte() {
        let router = TopicRouter::new();
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        router.on("todo/notification", move |_, payload| {
            *seen2.lock() = Some(payload.clone());
            Ok(())
        });

        let raw = [0xff, 0xfe, b'p', b'i', b'n', b'g'];
        router.dispatch("todo/notification", &raw);
        assert_eq!(seen.lock().take(), Some(Payload::Bytes(raw.to_vec())));
    }

    #[test]
    fn dispatch_only_hits_the_exact_topic() {
        let router = TopicRouter::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        router.on("todo/tasks", move |_, _| {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        router.dispatch("todo/calendar", b"{}");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        router.dispatch("todo/tasks", b"{}");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn change_stream_yields_only_decoded_events() {
        let router = TopicRouter::new();
        let mut changes = router.change_stream(&["todo/sync"]);

        let event = crate::change::ChangeEvent::task_deleted("someone", 42);
        router.dispatch("todo/sync", &serde_json::to_vec(&event).unwrap());
        router.dispatch("todo/sync", b"garbage that is not json");

        assert_eq!(changes.try_recv().unwrap(), event);
        assert!(changes.try_recv().is_err());
    }
}
