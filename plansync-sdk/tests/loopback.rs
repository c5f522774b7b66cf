//! End-to-end wiring over the loopback transport: connection lifecycle,
//! topic routing, change decoding, and reconciliation, with no broker and
//! no HTTP service in the loop.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use plansync_sdk::{
    Applied, CalendarEvent, Change, ChangeEvent, ConnectionManager, LinkState, Publisher,
    Reconciler, SyncConfig, SyncError, Task, TopicRouter, TransportMode,
};
use plansync_sdk::api::RecordService;
use plansync_sdk::model::{
    EventDraft, EventPatch, Priority, TaskDraft, TaskPatch,
};
use tokio::sync::watch;

/// In-memory record store shared by every simulated client in a test.
#[derive(Default)]
struct MemoryService {
    tasks: RefCell<HashMap<i64, Task>>,
    next_id: RefCell<i64>,
}

impl MemoryService {
    fn assign_id(&self) -> i64 {
        let mut next = self.next_id.borrow_mut();
        *next += 1;
        *next
    }
}

impl RecordService for &MemoryService {
    async fn list_tasks(&self) -> Result<Vec<Task>, SyncError> {
        let mut tasks: Vec<Task> = self.tasks.borrow().values().cloned().collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn create_task(&self, draft: &TaskDraft) -> Result<Task, SyncError> {
        let task = Task {
            id: self.assign_id(),
            user_id: None,
            title: draft.title.clone(),
            description: draft.description.clone(),
            completed: false,
            due_date: draft.due_date,
            priority: draft.priority,
            created_at: None,
            updated_at: None,
        };
        self.tasks.borrow_mut().insert(task.id, task.clone());
        Ok(task)
    }

    async fn update_task(&self, id: i64, patch: &TaskPatch) -> Result<Task, SyncError> {
        let mut tasks = self.tasks.borrow_mut();
        let stored = tasks.get_mut(&id).ok_or(SyncError::Service {
            status: 404,
            message: "no such task".to_string(),
        })?;
        if let Some(title) = &patch.title {
            stored.title = title.clone();
        }
        if let Some(completed) = patch.completed {
            stored.completed = completed;
        }
        Ok(stored.clone())
    }

    async fn delete_task(&self, id: i64) -> Result<(), SyncError> {
        self.tasks.borrow_mut().remove(&id);
        Ok(())
    }

    async fn list_events(&self) -> Result<Vec<CalendarEvent>, SyncError> {
        Ok(Vec::new())
    }

    async fn create_event(&self, _draft: &EventDraft) -> Result<CalendarEvent, SyncError> {
        Err(SyncError::Service {
            status: 501,
            message: "events unused in this test".to_string(),
        })
    }

    async fn update_event(
        &self,
        _id: i64,
        _patch: &EventPatch,
    ) -> Result<CalendarEvent, SyncError> {
        Err(SyncError::Service {
            status: 501,
            message: "events unused in this test".to_string(),
        })
    }

    async fn delete_event(&self, _id: i64) -> Result<(), SyncError> {
        Ok(())
    }
}

fn fallback_config() -> SyncConfig {
    // Unsupported scheme: negotiation settles on the loopback transport.
    SyncConfig {
        broker_url: "wss://broker.example/mqtt".to_string(),
        ..Default::default()
    }
}

async fn wait_connected(rx: &mut watch::Receiver<LinkState>) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while *rx.borrow() != LinkState::Connected {
            rx.changed().await.expect("driver gone");
        }
    })
    .await
    .expect("never reached Connected");
}

#[tokio::test]
async fn full_stack_comes_up_on_fallback_and_accepts_traffic() {
    let (mut manager, deliveries) = ConnectionManager::new(fallback_config());
    let mut states = manager.watch_state();
    manager.connect();
    wait_connected(&mut states).await;

    let handle = manager.handle().unwrap();
    assert_eq!(handle.mode(), TransportMode::Fallback);

    let router = Arc::new(TopicRouter::new());
    router.subscribe_all(&handle).await.unwrap();
    tokio::spawn(plansync_sdk::router::pump(Arc::clone(&router), deliveries));

    // Publishing over the degraded link is a logical success.
    let publisher = Publisher::new(handle.clone());
    let service = MemoryService::default();
    let mut engine = Reconciler::new(&service, handle.client_id().to_string());
    let (_, change) = engine
        .create_task(TaskDraft {
            title: "Buy milk".to_string(),
            priority: Priority::High,
            ..Default::default()
        })
        .await
        .unwrap();
    publisher.publish_change("todo/tasks", &change).await.unwrap();

    manager.disconnect().await;
    assert_eq!(manager.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn publish_before_connect_fails_loud() {
    let (mut manager, _deliveries) = ConnectionManager::new(fallback_config());
    manager.connect();
    let handle = manager.handle().unwrap();
    let publisher = Publisher::new(handle);

    // No waiting for Connected: the publish must be refused, not queued.
    let change = ChangeEvent::task_deleted("someone", 1);
    let result = publisher.publish_change("todo/tasks", &change).await;
    assert!(matches!(result, Err(SyncError::NotConnected { .. })));

    manager.disconnect().await;
}

#[tokio::test]
async fn decoded_change_events_drive_the_reconciler() {
    let router = TopicRouter::new();
    let mut changes = router.change_stream(&["todo/tasks"]);

    let service = MemoryService::default();

    // Another client created id 42 on the shared service...
    let mut origin = Reconciler::new(&service, "client_a");
    let (created, change) = origin
        .create_task(TaskDraft {
            title: "Buy milk".to_string(),
            priority: Priority::High,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.id, 1);

    // ...and its published event arrives here as raw bytes.
    let raw = serde_json::to_vec(&change).unwrap();
    router.dispatch("todo/tasks", &raw);

    let received = changes.try_recv().expect("change should be routed");
    assert_eq!(received.origin, "client_a");

    // This client reloads rather than trusting the payload.
    let mut mirror = Reconciler::new(&service, "client_b");
    let applied = mirror.apply_remote(&received).await.unwrap();
    assert_eq!(applied, Applied::Reloaded);
    let synced = mirror.task(created.id).expect("reload should fetch it");
    assert_eq!(synced.title, "Buy milk");
}

#[tokio::test]
async fn delete_then_replayed_delete_converges() {
    let service = MemoryService::default();
    let mut origin = Reconciler::new(&service, "client_a");
    let mut mirror = Reconciler::new(&service, "client_b");

    let (created, create_change) = origin
        .create_task(TaskDraft {
            title: "short-lived".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    mirror.apply_remote(&create_change).await.unwrap();
    assert!(mirror.task(created.id).is_some());

    let delete_change = origin.delete_task(created.id).await.unwrap();
    assert_eq!(
        mirror.apply_remote(&delete_change).await.unwrap(),
        Applied::Removed
    );
    // A duplicate delivery of the same delete is a benign no-op.
    assert_eq!(
        mirror.apply_remote(&delete_change).await.unwrap(),
        Applied::Ignored
    );
    assert!(mirror.task(created.id).is_none());
}

#[tokio::test]
async fn own_events_round_tripped_through_the_wire_are_skipped() {
    let service = MemoryService::default();
    let mut engine = Reconciler::new(&service, "client_a");

    let (created, change) = engine
        .create_task(TaskDraft {
            title: "mine".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Encode and decode as the broker would deliver it back to us.
    let raw = serde_json::to_vec(&change).unwrap();
    let echoed: ChangeEvent = serde_json::from_slice(&raw).unwrap();
    assert!(matches!(echoed.change, Change::Task { .. }));

    assert_eq!(engine.apply_remote(&echoed).await.unwrap(), Applied::Ignored);
    assert_eq!(engine.tasks().len(), 1);
    assert_eq!(engine.task(created.id).unwrap().title, "mine");
}
