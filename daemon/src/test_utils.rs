//! Test utilities for async coordinator tests
//!
//! A recording event sink plus a polling helper, so tests wait for state
//! instead of sleeping for a guessed amount of time.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::bridge::coordinator::TaskCoordinator;
use crate::bridge::protocol::{BridgeEvent, TaskStatus};
use crate::bridge::sink::EventSink;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const DEFAULT_WAIT: Duration = Duration::from_secs(3);

/// Event sink that keeps every broadcast event in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<BridgeEvent>>,
}

impl RecordingSink {
    /// Snapshot of everything broadcast so far
    pub fn events(&self) -> Vec<BridgeEvent> {
        self.lock().clone()
    }

    /// Most recent event, if any
    pub fn last(&self) -> Option<BridgeEvent> {
        self.lock().last().cloned()
    }

    /// Event type names in broadcast order
    pub fn event_types(&self) -> Vec<&'static str> {
        self.lock().iter().map(BridgeEvent::event_type).collect()
    }

    pub fn has(&self, event_type: &str) -> bool {
        self.lock().iter().any(|e| e.event_type() == event_type)
    }

    /// Wait until an event of `event_type` has been broadcast
    pub async fn wait_for(self: &Arc<Self>, event_type: &'static str) {
        let sink = Arc::clone(self);
        assert_eventually_bool(event_type, DEFAULT_WAIT, POLL_INTERVAL, move || {
            let sink = Arc::clone(&sink);
            async move { sink.has(event_type) }
        })
        .await;
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BridgeEvent>> {
        // A panicking test thread must not hide the events from the next assertion
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl EventSink for RecordingSink {
    fn broadcast(&self, event: BridgeEvent) {
        self.lock().push(event);
    }
}

/// Wait until the coordinator's current task reaches `status`
pub async fn wait_for_status(coordinator: &Arc<TaskCoordinator>, status: TaskStatus) {
    let coordinator = Arc::clone(coordinator);
    assert_eventually_bool(
        &format!("task to be {}", status),
        DEFAULT_WAIT,
        POLL_INTERVAL,
        move || {
            let c = Arc::clone(&coordinator);
            async move { c.current_task().await.is_some_and(|t| t.status == status) }
        },
    )
    .await;
}

/// Poll an async condition until it holds, panicking after `timeout`.
///
/// # Example
///
/// ```rust,ignore
/// use agent_bridge_lib::test_utils::assert_eventually_bool;
///
/// assert_eventually_bool(
///     "choice to be requested",
///     Duration::from_secs(2),
///     Duration::from_millis(50),
///     || async { coordinator.has_pending_choice().await }
/// ).await;
/// ```
pub async fn assert_eventually_bool<F, Fut>(
    desc: &str,
    timeout: Duration,
    interval: Duration,
    mut condition: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = Instant::now();
    let mut attempts = 0;

    while !condition().await {
        attempts += 1;
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            panic!(
                "Timeout waiting for {} after {:?} ({} attempts)",
                desc, elapsed, attempts
            );
        }
        tokio::time::sleep(interval).await;
    }
}
