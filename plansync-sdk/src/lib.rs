//! Client SDK for keeping shared task and calendar collections consistent
//! across independent clients in near-real-time.
//!
//! Two boundaries are wrapped here:
//!
//! - An MQTT broker over which clients exchange [`change::ChangeEvent`]
//!   notifications. [`connection`] owns the link lifecycle (connect,
//!   fixed-period reconnect, transparent degrade to a loopback transport),
//!   [`router`] multiplexes topics to handlers, and [`publish`] encodes
//!   outgoing events with a delivery-guarantee tier.
//! - An authoritative HTTP CRUD service ([`api`]) whose responses are always
//!   ground truth for record contents.
//!
//! [`reconcile::Reconciler`] sits on top of both: local mutations are applied
//! optimistically and confirmed against the service, remote change events are
//! folded into the local collections without double-applying this client's
//! own changes.

pub mod api;
pub mod change;
pub mod config;
pub mod connection;
pub mod error;
pub mod model;
pub mod publish;
pub mod reconcile;
pub mod router;
pub mod transport;

pub use api::{ApiClient, RecordService};
pub use change::{Change, ChangeAction, ChangeEvent, SERVICE_ORIGIN};
pub use config::{SyncConfig, Topics};
pub use model::{CalendarEvent, Task, User};
pub use connection::{ConnectionHandle, ConnectionManager, Delivery, LinkState};
pub use error::SyncError;
pub use publish::{Publisher, QosTier};
pub use reconcile::{Applied, Reconciler};
pub use router::{Payload, TopicRouter};
pub use transport::TransportMode;
