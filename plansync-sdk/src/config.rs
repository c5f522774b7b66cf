//! Connection configuration.
//!
//! A `SyncConfig` is an explicit value handed to
//! [`ConnectionManager::new`](crate::connection::ConnectionManager::new),
//! never a process-wide singleton, so independent clients with distinct
//! brokers, credentials, and topic sets can coexist in one process.

use std::time::Duration;

use rand::Rng;

/// The four logical topics multiplexed over one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Task change events.
    pub tasks: String,
    /// Calendar change events.
    pub calendar: String,
    /// Cross-client sync notifications.
    pub sync: String,
    /// User-facing notifications.
    pub notification: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            tasks: "todo/tasks".to_string(),
            calendar: "todo/calendar".to_string(),
            sync: "todo/sync".to_string(),
            notification: "todo/notification".to_string(),
        }
    }
}

impl Topics {
    /// All topic names, in subscription order.
    pub fn all(&self) -> Vec<String> {
        vec![
            self.tasks.clone(),
            self.calendar.clone(),
            self.sync.clone(),
            self.notification.clone(),
        ]
    }
}

/// Configuration for connecting to the broker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Broker URL (`mqtt://host:port` or `mqtts://host:port`). A URL that
    /// cannot be parsed, or whose scheme is unsupported, makes the transport
    /// fall back to the loopback variant at construction.
    pub broker_url: String,
    /// Broker username.
    pub username: Option<String>,
    /// Broker password.
    pub password: Option<String>,
    /// Prefix for the generated per-process client id.
    pub client_id_prefix: String,
    /// MQTT clean-session flag.
    pub clean_session: bool,
    /// MQTT keep-alive interval.
    pub keep_alive: Duration,
    /// Fixed delay between reconnect attempts.
    pub reconnect_period: Duration,
    /// Consecutive failed attempts tolerated before the link is declared
    /// faulted and the loopback transport takes over.
    pub max_reconnect_attempts: u32,
    /// Topic names.
    pub topics: Topics,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            username: None,
            password: None,
            client_id_prefix: "todo_client".to_string(),
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            reconnect_period: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            topics: Topics::default(),
        }
    }
}

/// Generate a per-process client id: prefix plus a random hex suffix.
pub fn generate_client_id(prefix: &str) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    format!("{prefix}_{suffix:08x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ids_are_unique_and_prefixed() {
        let a = generate_client_id("todo_client");
        let b = generate_client_id("todo_client");
        assert!(a.starts_with("todo_client_"));
        assert_ne!(a, b);
    }

    #[test]
    fn default_topics_cover_all_channels() {
        let topics = Topics::default();
        let all = topics.all();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0], "todo/tasks");
        assert_eq!(all[2], "todo/sync");
    }
}
