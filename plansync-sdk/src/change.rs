//! Change-event wire types exchanged between clients.
//!
//! Every locally-initiated mutation produces exactly one [`ChangeEvent`]
//! before being published; every remotely received event must decode to a
//! kind and an action or it is dropped. Wire format is JSON with snake_case
//! tags, e.g.:
//!
//! ```json
//! {"action":"updated","origin":"todo_client_a1b2c3d4","kind":"task",
//!  "id":42,"record":{...},"emitted_at":"2025-06-01T09:00:00Z"}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CalendarEvent, Task};
use crate::router::Payload;

/// Origin recorded on events announced by the service itself (which carries
/// no client id). Client ids always have a hex suffix, so this can never
/// collide with one.
pub const SERVICE_ORIGIN: &str = "service";

/// What happened to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

/// Record-or-id body of a change, tagged by record kind.
///
/// `Deleted` events carry only the id; `Created`/`Updated` also carry the
/// emitter's projection of the record, which receivers must not trust as
/// complete for `Created` (see the reconciler's full-reload rule).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Task {
        id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<Task>,
    },
    Event {
        id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<CalendarEvent>,
    },
}

impl Change {
    pub fn id(&self) -> i64 {
        match self {
            Change::Task { id, .. } | Change::Event { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Change::Task { .. } => "task",
            Change::Event { .. } => "event",
        }
    }
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub action: ChangeAction,
    /// Client id of the emitter, used for self-echo suppression.
    pub origin: String,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub change: Change,
}

impl ChangeEvent {
    fn new(action: ChangeAction, origin: &str, change: Change) -> Self {
        Self {
            action,
            origin: origin.to_string(),
            emitted_at: Utc::now(),
            change,
        }
    }

    pub fn task_created(origin: &str, record: Task) -> Self {
        let id = record.id;
        Self::new(
            ChangeAction::Created,
            origin,
            Change::Task { id, record: Some(record) },
        )
    }

    pub fn task_updated(origin: &str, record: Task) -> Self {
        let id = record.id;
        Self::new(
            ChangeAction::Updated,
            origin,
            Change::Task { id, record: Some(record) },
        )
    }

    pub fn task_deleted(origin: &str, id: i64) -> Self {
        Self::new(ChangeAction::Deleted, origin, Change::Task { id, record: None })
    }

    pub fn event_created(origin: &str, record: CalendarEvent) -> Self {
        let id = record.id;
        Self::new(
            ChangeAction::Created,
            origin,
            Change::Event { id, record: Some(record) },
        )
    }

    pub fn event_updated(origin: &str, record: CalendarEvent) -> Self {
        let id = record.id;
        Self::new(
            ChangeAction::Updated,
            origin,
            Change::Event { id, record: Some(record) },
        )
    }

    pub fn event_deleted(origin: &str, id: i64) -> Self {
        Self::new(ChangeAction::Deleted, origin, Change::Event { id, record: None })
    }

    /// Decode a routed payload into a change event.
    ///
    /// Accepts both the client wire shape and the service's announcement
    /// shape (`{"event": "task_created", "data": {…}, "timestamp": …}` on
    /// the sync topic). Returns `None`, after a log line, for raw
    /// (non-JSON) payloads and for JSON that fits neither shape. Such
    /// events are dropped, never surfaced to the application.
    pub fn decode(topic: &str, payload: &Payload) -> Option<ChangeEvent> {
        match payload {
            Payload::Json(value) => {
                if let Ok(event) = serde_json::from_value(value.clone()) {
                    return Some(event);
                }
                match serde_json::from_value::<ServiceAnnouncement>(value.clone()) {
                    Ok(announcement) => announcement.into_change_event(topic),
                    Err(error) => {
                        tracing::warn!(%topic, %error, "dropping undecodable change event");
                        None
                    }
                }
            }
            Payload::Raw(text) => {
                tracing::warn!(%topic, len = text.len(), "dropping non-JSON change payload");
                None
            }
            Payload::Bytes(bytes) => {
                tracing::warn!(%topic, len = bytes.len(), "dropping binary change payload");
                None
            }
        }
    }
}

/// The service's own broadcast shape: event name encodes kind and action,
/// `data` is the record dict (or at least its id), and the timestamp is a
/// naive ISO-8601 string.
#[derive(Deserialize)]
struct ServiceAnnouncement {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    timestamp: Option<NaiveDateTime>,
}

impl ServiceAnnouncement {
    fn into_change_event(self, topic: &str) -> Option<ChangeEvent> {
        let action = match self.event.as_str() {
            "task_created" => ChangeAction::Created,
            "task_updated" => ChangeAction::Updated,
            "task_deleted" => ChangeAction::Deleted,
            other => {
                tracing::debug!(%topic, event = %other, "ignoring service announcement");
                return None;
            }
        };

        let Some(id) = self.data.get("id").and_then(serde_json::Value::as_i64) else {
            tracing::warn!(%topic, event = %self.event, "announcement without an id; dropped");
            return None;
        };
        let record = match action {
            ChangeAction::Deleted => None,
            _ => match serde_json::from_value::<Task>(self.data) {
                Ok(task) => Some(task),
                Err(error) => {
                    tracing::warn!(%topic, %error, "announcement record would not decode");
                    None
                }
            },
        };

        Some(ChangeEvent {
            action,
            origin: SERVICE_ORIGIN.to_string(),
            emitted_at: self
                .timestamp
                .map(|naive| naive.and_utc())
                .unwrap_or_else(Utc::now),
            change: Change::Task { id, record },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: i64, title: &str) -> Task {
        serde_json::from_value(serde_json::json!({"id": id, "title": title})).unwrap()
    }

    #[test]
    fn round_trips_through_wire_json() {
        let event = ChangeEvent::task_updated("client_a", task(42, "Buy milk"));
        let wire = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.change.id(), 42);
        assert_eq!(back.change.kind(), "task");
    }

    #[test]
    fn deleted_carries_only_the_id() {
        let event = ChangeEvent::task_deleted("client_a", 42);
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["action"], "deleted");
        assert_eq!(wire["kind"], "task");
        assert_eq!(wire["id"], 42);
        assert!(wire.get("record").is_none());
    }

    #[test]
    fn decode_drops_raw_payloads() {
        let payload = Payload::Raw("not json".to_string());
        assert!(ChangeEvent::decode("todo/sync", &payload).is_none());
    }

    #[test]
    fn decode_drops_json_missing_fields() {
        let payload = Payload::Json(serde_json::json!({"action": "created"}));
        assert!(ChangeEvent::decode("todo/sync", &payload).is_none());
    }

    #[test]
    fn decode_accepts_service_announcements() {
        let payload = Payload::Json(serde_json::json!({
            "event": "task_updated",
            "data": {"id": 42, "title": "Buy milk", "completed": true},
            "timestamp": "2025-06-01T09:00:00",
        }));
        let event = ChangeEvent::decode("todo/sync", &payload).unwrap();
        assert_eq!(event.action, ChangeAction::Updated);
        assert_eq!(event.origin, SERVICE_ORIGIN);
        assert_eq!(event.change.id(), 42);
        match &event.change {
            Change::Task { record: Some(task), .. } => assert!(task.completed),
            other => panic!("unexpected change body: {other:?}"),
        }
    }

    #[test]
    fn service_delete_announcement_keeps_only_the_id() {
        let payload = Payload::Json(serde_json::json!({
            "event": "task_deleted",
            "data": {"id": 7, "title": "gone"},
        }));
        let event = ChangeEvent::decode("todo/sync", &payload).unwrap();
        assert_eq!(event.action, ChangeAction::Deleted);
        assert_eq!(event.change, Change::Task { id: 7, record: None });
    }

    #[test]
    fn announcement_without_an_id_is_dropped() {
        let payload = Payload::Json(serde_json::json!({
            "event": "task_updated",
            "data": {"title": "nothing to key on"},
        }));
        assert!(ChangeEvent::decode("todo/sync", &payload).is_none());
    }

    #[test]
    fn decode_drops_binary_payloads() {
        let payload = Payload::Bytes(vec![0xff, 0x00, 0x01]);
        assert!(ChangeEvent::decode("todo/sync", &payload).is_none());
    }

    #[test]
    fn unknown_service_announcements_are_ignored() {
        let payload = Payload::Json(serde_json::json!({
            "event": "sync_response",
            "data": {"user_id": 1, "tasks": []},
        }));
        assert!(ChangeEvent::decode("todo/sync", &payload).is_none());
    }

    #[test]
    fn decode_accepts_well_formed_events() {
        let event = ChangeEvent::event_deleted("client_b", 7);
        let payload = Payload::Json(serde_json::to_value(&event).unwrap());
        let decoded = ChangeEvent::decode("todo/calendar", &payload).unwrap();
        assert_eq!(decoded.action, ChangeAction::Deleted);
        assert_eq!(decoded.change.id(), 7);
    }
}
