//! The active-model slot and its in-flight accounting

use crate::backend::BackendHandle;
use crate::catalog::{ModelDescriptor, TaskType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct LeaseState {
    in_flight: usize,
    admitting: bool,
    last_activity: Instant,
}

/// A loaded model together with the requests currently running on it
///
/// The in-flight counter is only changed through [`InFlightGuard`], so a
/// request that is cancelled or times out still releases its lease.
#[derive(Debug)]
pub struct ActiveModelHandle {
    descriptor: ModelDescriptor,
    backend_handle: BackendHandle,
    loaded_at: DateTime<Utc>,
    activated_for: TaskType,
    lease: Mutex<LeaseState>,
    /// Task types the swap policy has already judged this model for
    evaluated: Mutex<BTreeSet<TaskType>>,
    idle: Notify,
}

impl ActiveModelHandle {
    pub(crate) fn new(
        descriptor: ModelDescriptor,
        backend_handle: BackendHandle,
        activated_for: TaskType,
    ) -> Self {
        Self {
            descriptor,
            backend_handle,
            loaded_at: Utc::now(),
            activated_for,
            lease: Mutex::new(LeaseState {
                in_flight: 0,
                admitting: true,
                last_activity: Instant::now(),
            }),
            evaluated: Mutex::new(BTreeSet::from([activated_for])),
            idle: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LeaseState> {
        self.lease.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }

    pub fn model_id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn backend_handle(&self) -> &BackendHandle {
        &self.backend_handle
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Task type the model was chosen for
    pub fn activated_for(&self) -> TaskType {
        self.activated_for
    }

    pub fn in_flight_requests(&self) -> usize {
        self.state().in_flight
    }

    /// Whether the policy already decided this model keeps serving `task`
    pub fn has_evaluated(&self, task: TaskType) -> bool {
        self.evaluated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&task)
    }

    pub(crate) fn mark_evaluated(&self, task: TaskType) {
        self.evaluated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task);
    }

    pub fn is_admitting(&self) -> bool {
        self.state().admitting
    }

    /// How long the model has had no request running, `None` while busy
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.state();
        (state.in_flight == 0).then(|| state.last_activity.elapsed())
    }

    /// Registers one more in-flight request, unless the handle is draining
    pub fn try_lease(self: &Arc<Self>) -> Option<InFlightGuard> {
        let mut state = self.state();
        if !state.admitting {
            return None;
        }
        state.in_flight += 1;
        state.last_activity = Instant::now();
        Some(InFlightGuard {
            handle: Arc::clone(self),
        })
    }

    pub(crate) fn stop_admitting(&self) {
        self.state().admitting = false;
    }

    /// Resolves once no request is in flight
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight_requests() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        let mut state = self.state();
        state.in_flight = state.in_flight.saturating_sub(1);
        state.last_activity = Instant::now();
        if state.in_flight == 0 {
            drop(state);
            self.idle.notify_waiters();
        }
    }
}

/// Lease on the active model held for the duration of one request
#[derive(Debug)]
pub struct InFlightGuard {
    handle: Arc<ActiveModelHandle>,
}

impl InFlightGuard {
    pub fn handle(&self) -> &Arc<ActiveModelHandle> {
        &self.handle
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.handle.release();
    }
}

/// Slot state machine
///
/// `EMPTY -> ACTIVATING -> ACTIVE -> DRAINING -> EMPTY`, and
/// `ACTIVATING -> FAILED -> EMPTY` when loading fails.
#[derive(Debug, Clone)]
pub enum SlotState {
    Empty,
    Activating { model_id: String },
    Active(Arc<ActiveModelHandle>),
    Draining(Arc<ActiveModelHandle>),
    Failed { model_id: String },
}

impl SlotState {
    pub fn phase(&self) -> SlotPhase {
        match self {
            SlotState::Empty => SlotPhase::Empty,
            SlotState::Activating { .. } => SlotPhase::Activating,
            SlotState::Active(_) => SlotPhase::Active,
            SlotState::Draining(_) => SlotPhase::Draining,
            SlotState::Failed { .. } => SlotPhase::Failed,
        }
    }

    /// Model the slot currently refers to
    pub fn model_id(&self) -> Option<&str> {
        match self {
            SlotState::Empty => None,
            SlotState::Activating { model_id } | SlotState::Failed { model_id } => Some(model_id),
            SlotState::Active(handle) | SlotState::Draining(handle) => Some(handle.model_id()),
        }
    }
}

/// Serializable view of [`SlotState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotPhase {
    Empty,
    Activating,
    Active,
    Draining,
    Failed,
}

impl std::fmt::Display for SlotPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SlotPhase::Empty => "EMPTY",
            SlotPhase::Activating => "ACTIVATING",
            SlotPhase::Active => "ACTIVE",
            SlotPhase::Draining => "DRAINING",
            SlotPhase::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> Arc<ActiveModelHandle> {
        Arc::new(ActiveModelHandle::new(
            ModelDescriptor::new("A", 4.0).ready(),
            BackendHandle::new("A", "t1"),
            TaskType::General,
        ))
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let handle = handle();
        let first = handle.try_lease().unwrap();
        let second = handle.try_lease().unwrap();
        assert_eq!(handle.in_flight_requests(), 2);
        assert!(handle.idle_for().is_none());

        drop(first);
        assert_eq!(handle.in_flight_requests(), 1);
        drop(second);
        assert_eq!(handle.in_flight_requests(), 0);
        assert!(handle.idle_for().is_some());
    }

    #[test]
    fn test_draining_handle_refuses_leases() {
        let handle = handle();
        handle.stop_admitting();
        assert!(handle.try_lease().is_none());
        assert_eq!(handle.in_flight_requests(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_when_last_lease_drops() {
        let handle = handle();
        let lease = handle.try_lease().unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(lease);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_on_idle_handle() {
        handle().wait_idle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_for_tracks_last_release() {
        let handle = handle();
        drop(handle.try_lease().unwrap());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(handle.idle_for().unwrap() >= Duration::from_secs(5));
    }

    #[test]
    fn test_slot_phase() {
        assert_eq!(SlotState::Empty.phase(), SlotPhase::Empty);
        let active = SlotState::Active(handle());
        assert_eq!(active.phase(), SlotPhase::Active);
        assert_eq!(active.model_id(), Some("A"));
        assert_eq!(SlotPhase::Draining.to_string(), "DRAINING");
    }
}
