//! Event-driven reconciliation of local record collections.
//!
//! The engine is the exclusive owner of the in-memory task and calendar
//! collections. All mutations flow through it, on one logical task, so it
//! needs no locking:
//!
//! - **Local path**: apply the change optimistically, call the authoritative
//!   service, replace the optimistic copy with the canonical response, and
//!   return exactly one [`ChangeEvent`] (with `origin = self`) for the
//!   caller to publish. If the service call fails the optimistic change is
//!   rolled back, so local state is never half-applied.
//! - **Remote path**: fold a received [`ChangeEvent`] into local state.
//!   `Created` triggers a full reload of the affected collection rather than
//!   trusting the embedded payload, since other clients may hold stale or
//!   partial projections. `Updated`
//!   replaces the record wholesale if it is present (last writer observed
//!   wins, no version comparison) and is ignored when the id is outside this
//!   client's view. `Deleted` removes by id; a missing id is a benign no-op.
//!
//! A client's own events, looped back by the broker, are recognized by
//! origin id and skipped, so nothing is applied twice.

use crate::api::RecordService;
use crate::change::{Change, ChangeAction, ChangeEvent};
use crate::error::SyncError;
use crate::model::{
    CalendarEvent, EventDraft, EventPatch, Task, TaskDraft, TaskPatch,
};

/// What applying a remote event did to local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// A `Created` event forced a full collection reload.
    Reloaded,
    /// An `Updated` event replaced a local record.
    Replaced,
    /// A `Deleted` event removed a local record.
    Removed,
    /// Self-echo, unknown id, or a payload without a record: nothing done.
    Ignored,
}

pub struct Reconciler<S> {
    service: S,
    client_id: String,
    tasks: Vec<Task>,
    events: Vec<CalendarEvent>,
}

impl<S: RecordService> Reconciler<S> {
    pub fn new(service: S, client_id: impl Into<String>) -> Self {
        Self {
            service,
            client_id: client_id.into(),
            tasks: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn events(&self) -> &[CalendarEvent] {
        &self.events
    }

    pub fn task(&self, id: i64) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn event(&self, id: i64) -> Option<&CalendarEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    /// Initial full load of both collections from the service.
    pub async fn load(&mut self) -> Result<(), SyncError> {
        self.tasks = self.service.list_tasks().await?;
        self.events = self.service.list_events().await?;
        Ok(())
    }

    // ── Local mutation path ──

    /// Create a task. The id is server-assigned, so the canonical record is
    /// inserted when the service responds; nothing optimistic exists before
    /// that.
    pub async fn create_task(&mut self, draft: TaskDraft) -> Result<(Task, ChangeEvent), SyncError> {
        let task = self.service.create_task(&draft).await?;
        self.tasks.insert(0, task.clone());
        let event = ChangeEvent::task_created(&self.client_id, task.clone());
        Ok((task, event))
    }

    pub async fn update_task(
        &mut self,
        id: i64,
        patch: TaskPatch,
    ) -> Result<(Task, ChangeEvent), SyncError> {
        // Optimistic apply, remembering the previous copy for rollback.
        let previous = match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(slot) => {
                let before = slot.clone();
                apply_task_patch(slot, &patch);
                Some(before)
            }
            None => None,
        };

        match self.service.update_task(id, &patch).await {
            Ok(canonical) => {
                self.upsert_task(canonical.clone());
                let event = ChangeEvent::task_updated(&self.client_id, canonical.clone());
                Ok((canonical, event))
            }
            Err(error) => {
                if let Some(before) = previous {
                    self.upsert_task(before);
                }
                Err(error)
            }
        }
    }

    pub async fn delete_task(&mut self, id: i64) -> Result<ChangeEvent, SyncError> {
        // Optimistic removal, restored if the service refuses.
        let removed = self
            .tasks
            .iter()
            .position(|t| t.id == id)
            .map(|index| (index, self.tasks.remove(index)));

        match self.service.delete_task(id).await {
            Ok(()) => Ok(ChangeEvent::task_deleted(&self.client_id, id)),
            Err(error) => {
                if let Some((index, task)) = removed {
                    self.tasks.insert(index.min(self.tasks.len()), task);
                }
                Err(error)
            }
        }
    }

    pub async fn create_event(
        &mut self,
        draft: EventDraft,
    ) -> Result<(CalendarEvent, ChangeEvent), SyncError> {
        let event = self.service.create_event(&draft).await?;
        self.events.insert(0, event.clone());
        let change = ChangeEvent::event_created(&self.client_id, event.clone());
        Ok((event, change))
    }

    pub async fn update_event(
        &mut self,
        id: i64,
        patch: EventPatch,
    ) -> Result<(CalendarEvent, ChangeEvent), SyncError> {
        let previous = match self.events.iter_mut().find(|e| e.id == id) {
            Some(slot) => {
                let before = slot.clone();
                apply_event_patch(slot, &patch);
                Some(before)
            }
            None => None,
        };

        match self.service.update_event(id, &patch).await {
            Ok(canonical) => {
                self.upsert_event(canonical.clone());
                let change = ChangeEvent::event_updated(&self.client_id, canonical.clone());
                Ok((canonical, change))
            }
            Err(error) => {
                if let Some(before) = previous {
                    self.upsert_event(before);
                }
                Err(error)
            }
        }
    }

    pub async fn delete_event(&mut self, id: i64) -> Result<ChangeEvent, SyncError> {
        let removed = self
            .events
            .iter()
            .position(|e| e.id == id)
            .map(|index| (index, self.events.remove(index)));

        match self.service.delete_event(id).await {
            Ok(()) => Ok(ChangeEvent::event_deleted(&self.client_id, id)),
            Err(error) => {
                if let Some((index, event)) = removed {
                    self.events.insert(index.min(self.events.len()), event);
                }
                Err(error)
            }
        }
    }

    // ── Remote event path ──

    /// Fold a remote change event into local state.
    ///
    /// Each action is atomic with respect to the local collection: either it
    /// fully applies or, on a failed reload, the collection is untouched.
    pub async fn apply_remote(&mut self, event: &ChangeEvent) -> Result<Applied, SyncError> {
        if event.origin == self.client_id {
            tracing::debug!(id = event.change.id(), "skipping self-echo");
            return Ok(Applied::Ignored);
        }

        match (&event.change, event.action) {
            // Never insert the embedded payload: other clients may hold a
            // partial projection. Reload the collection from ground truth.
            (Change::Task { .. }, ChangeAction::Created) => {
                self.tasks = self.service.list_tasks().await?;
                Ok(Applied::Reloaded)
            }
            (Change::Event { .. }, ChangeAction::Created) => {
                self.events = self.service.list_events().await?;
                Ok(Applied::Reloaded)
            }

            (Change::Task { id, record }, ChangeAction::Updated) => {
                let Some(record) = record else {
                    tracing::warn!(id, "updated task event without a record; dropped");
                    return Ok(Applied::Ignored);
                };
                match self.tasks.iter_mut().find(|t| t.id == *id) {
                    Some(slot) => {
                        *slot = record.clone();
                        Ok(Applied::Replaced)
                    }
                    // Outside this client's current view; nothing to do.
                    None => Ok(Applied::Ignored),
                }
            }
            (Change::Event { id, record }, ChangeAction::Updated) => {
                let Some(record) = record else {
                    tracing::warn!(id, "updated calendar event without a record; dropped");
                    return Ok(Applied::Ignored);
                };
                match self.events.iter_mut().find(|e| e.id == *id) {
                    Some(slot) => {
                        *slot = record.clone();
                        Ok(Applied::Replaced)
                    }
                    None => Ok(Applied::Ignored),
                }
            }

            (Change::Task { id, .. }, ChangeAction::Deleted) => {
                let before = self.tasks.len();
                self.tasks.retain(|t| t.id != *id);
                Ok(if self.tasks.len() < before {
                    Applied::Removed
                } else {
                    Applied::Ignored
                })
            }
            (Change::Event { id, .. }, ChangeAction::Deleted) => {
                let before = self.events.len();
                self.events.retain(|e| e.id != *id);
                Ok(if self.events.len() < before {
                    Applied::Removed
                } else {
                    Applied::Ignored
                })
            }
        }
    }

    fn upsert_task(&mut self, task: Task) {
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => *slot = task,
            None => self.tasks.insert(0, task),
        }
    }

    fn upsert_event(&mut self, event: CalendarEvent) {
        match self.events.iter_mut().find(|e| e.id == event.id) {
            Some(slot) => *slot = event,
            None => self.events.insert(0, event),
        }
    }
}

fn apply_task_patch(task: &mut Task, patch: &TaskPatch) {
    if let Some(title) = &patch.title {
        task.title = title.clone();
    }
    if let Some(description) = &patch.description {
        task.description = Some(description.clone());
    }
    if let Some(completed) = patch.completed {
        task.completed = completed;
    }
    if let Some(due_date) = patch.due_date {
        task.due_date = Some(due_date);
    }
    if let Some(priority) = patch.priority {
        task.priority = priority;
    }
}

fn apply_event_patch(event: &mut CalendarEvent, patch: &EventPatch) {
    if let Some(title) = &patch.title {
        event.title = title.clone();
    }
    if let Some(description) = &patch.description {
        event.description = Some(description.clone());
    }
    if let Some(start_time) = patch.start_time {
        event.start_time = start_time;
    }
    if let Some(end_time) = patch.end_time {
        event.end_time = Some(end_time);
    }
    if let Some(all_day) = patch.all_day {
        event.all_day = all_day;
    }
    if let Some(color) = &patch.color {
        event.color = color.clone();
    }
}
