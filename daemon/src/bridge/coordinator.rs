//! Task lifecycle coordinator.
//!
//! Owns at most one task at a time and is the only place its state changes.
//! Every transition happens under one mutex and the matching event is
//! broadcast before the lock is released, so clients see events in the same
//! order the state moved.
//!
//! Cancellation is cooperative. Cancelling marks the task id in a
//! cancelled-set that outlives the task itself; the runner polls that set
//! between steps and removes its id on the way out. The set is the only
//! thing a runner can still consult once the current task has been cleared.
//!
//! The single suspension point is [`TaskCoordinator::wait_for_input`]: the
//! runner parks on a oneshot receiver while create/cancel/submit stay
//! callable.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info};

use super::ids::{RandomIdGenerator, TaskIdGenerator};
use super::protocol::{BridgeEvent, Choice, Task, TaskLog, TaskStatus};
use super::runner::{self, StepWork};
use super::sink::EventSink;

/// How a pending choice was resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChoiceResolution {
    /// The user picked this choice id
    Chosen(String),
    /// The task was cancelled (or finished externally) while waiting
    Cancelled,
}

/// Admission was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CreateTaskError {
    #[error("task {task_id} is already {status}")]
    TaskActive { task_id: String, status: TaskStatus },

    #[error("task id {task_id} is still shutting down")]
    IdInUse { task_id: String },
}

#[derive(Default)]
struct CoordinatorState {
    current: Option<Task>,
    /// Present exactly while the current task is `waiting_input`
    pending_choice: Option<oneshot::Sender<ChoiceResolution>>,
    cancelled: HashSet<String>,
}

impl CoordinatorState {
    fn is_current(&self, task_id: &str) -> bool {
        self.current.as_ref().is_some_and(|t| t.id == task_id)
    }

    fn current_mut(&mut self, task_id: &str) -> Option<&mut Task> {
        self.current.as_mut().filter(|t| t.id == task_id)
    }

    fn resolve_pending(&mut self, resolution: ChoiceResolution) {
        if let Some(tx) = self.pending_choice.take() {
            // Receiver gone means the runner already unwound
            let _ = tx.send(resolution);
        }
    }

    /// Shared tail of every path that ends the current task early
    fn stop_current(&mut self, task_id: &str, status: TaskStatus) {
        self.cancelled.insert(task_id.to_string());
        if let Some(task) = self.current_mut(task_id) {
            task.set_status(status);
        }
        self.resolve_pending(ChoiceResolution::Cancelled);
        self.current = None;
    }
}

/// Single-task lifecycle state machine shared by every request handler
pub struct TaskCoordinator {
    state: Mutex<CoordinatorState>,
    sink: Arc<dyn EventSink>,
    ids: Arc<dyn TaskIdGenerator>,
    work: Arc<dyn StepWork>,
}

impl TaskCoordinator {
    pub fn new(sink: Arc<dyn EventSink>, work: Arc<dyn StepWork>) -> Self {
        Self {
            state: Mutex::new(CoordinatorState::default()),
            sink,
            ids: Arc::new(RandomIdGenerator),
            work,
        }
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn TaskIdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub(crate) fn step_work(&self) -> Arc<dyn StepWork> {
        Arc::clone(&self.work)
    }

    /// Admit a new task and start its runner in the background.
    ///
    /// Returns as soon as `task.started` has been broadcast; the runner is
    /// fire-and-forget.
    pub async fn create_task(
        self: &Arc<Self>,
        repo_id: &str,
        prompt: &str,
    ) -> Result<String, CreateTaskError> {
        self.admit(None, repo_id, prompt).await
    }

    /// Like [`create_task`](Self::create_task) but with an id chosen by the caller
    /// (agent hooks that already have a session id of their own)
    pub async fn create_task_with_id(
        self: &Arc<Self>,
        task_id: &str,
        repo_id: &str,
        prompt: &str,
    ) -> Result<String, CreateTaskError> {
        self.admit(Some(task_id), repo_id, prompt).await
    }

    async fn admit(
        self: &Arc<Self>,
        requested_id: Option<&str>,
        repo_id: &str,
        prompt: &str,
    ) -> Result<String, CreateTaskError> {
        let task_id = {
            let mut state = self.state.lock().await;

            if let Some(active) = state.current.as_ref().filter(|t| t.status.is_active()) {
                debug!(task_id = %active.id, status = %active.status, "admission refused");
                return Err(CreateTaskError::TaskActive {
                    task_id: active.id.clone(),
                    status: active.status,
                });
            }

            let task_id = match requested_id {
                // An unwinding runner still owns a cancelled id
                Some(id) if state.cancelled.contains(id) => {
                    return Err(CreateTaskError::IdInUse {
                        task_id: id.to_string(),
                    });
                }
                Some(id) => id.to_string(),
                None => self.ids.generate(),
            };

            let task = Task::new(task_id.clone(), repo_id.to_string(), prompt.to_string());
            self.sink.broadcast(BridgeEvent::TaskStarted {
                task_id: task.id.clone(),
                repo_id: task.repo_id.clone(),
                started_at: task.created_at,
                prompt: task.prompt.clone(),
            });
            state.current = Some(task);
            task_id
        };

        info!(task_id = %task_id, repo_id, "task started");

        let coordinator = Arc::clone(self);
        let runner_id = task_id.clone();
        let prompt = prompt.to_string();
        tokio::spawn(async move {
            runner::run(coordinator, runner_id, prompt).await;
        });

        Ok(task_id)
    }

    /// Cancel the current task. `false` (and no event) unless `task_id` is current.
    pub async fn cancel_task(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        if !state.is_current(task_id) {
            return false;
        }

        self.sink.broadcast(BridgeEvent::cancelled(task_id));
        state.stop_current(task_id, TaskStatus::Error);
        info!(task_id, "task cancelled");
        true
    }

    /// Cancellation coming from outside the normal flow (e.g. a hook reporting
    /// that the agent process died). Always broadcasts and always succeeds.
    ///
    /// For the current task the id stays in the cancelled-set until its runner
    /// unwinds. For any other id the set is left as it was: nothing was added,
    /// and a mark owned by a still-unwinding runner is not disturbed.
    pub async fn cancel_external_task(&self, task_id: &str) -> bool {
        let mut state = self.state.lock().await;
        self.sink.broadcast(BridgeEvent::cancelled(task_id));

        if state.is_current(task_id) {
            state.stop_current(task_id, TaskStatus::Error);
            info!(task_id, "task cancelled externally");
        } else {
            debug!(task_id, "external cancel for unknown task");
        }
        true
    }

    /// Resolve the pending choice. Only valid while the task is `waiting_input`;
    /// the resumed runner moves the status back to `running`.
    pub async fn submit_choice(&self, task_id: &str, choice_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let waiting = state
            .current
            .as_ref()
            .is_some_and(|t| t.id == task_id && t.status == TaskStatus::WaitingInput);
        if !waiting {
            return false;
        }

        match state.pending_choice.take() {
            Some(tx) => {
                let _ = tx.send(ChoiceResolution::Chosen(choice_id.to_string()));
                info!(task_id, choice_id, "choice submitted");
                true
            }
            None => false,
        }
    }

    /// The agent reported completion through its hook.
    ///
    /// Always broadcasts `task.done`. If the task is current it is finished
    /// here and marked so its runner exits without emitting anything more.
    pub async fn complete_external(&self, task_id: &str, summary: &str) -> bool {
        let mut state = self.state.lock().await;
        self.sink.broadcast(BridgeEvent::TaskDone {
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            meta: json!({ "source": "agent" }),
        });

        if !state.is_current(task_id) {
            return false;
        }
        state.stop_current(task_id, TaskStatus::Done);
        info!(task_id, "task completed by agent");
        true
    }

    /// Record a log line. Retained only while `task_id` is current; the
    /// `task.log` event goes out either way.
    pub async fn log(&self, task_id: &str, entry: TaskLog) {
        let mut state = self.state.lock().await;
        self.record_log(&mut state, task_id, entry);
    }

    /// Runner-side logging: the cancellation check and the broadcast share one
    /// lock, so nothing from the runner can follow the cancellation event.
    /// Returns `false` (and emits nothing) once `task_id` is cancelled.
    pub(crate) async fn log_unless_cancelled(&self, task_id: &str, entry: TaskLog) -> bool {
        let mut state = self.state.lock().await;
        if state.cancelled.contains(task_id) {
            return false;
        }
        self.record_log(&mut state, task_id, entry);
        true
    }

    fn record_log(&self, state: &mut CoordinatorState, task_id: &str, entry: TaskLog) {
        self.sink.broadcast(BridgeEvent::TaskLog {
            task_id: task_id.to_string(),
            level: entry.level,
            message: entry.message.clone(),
            message_key: entry.message_key.clone(),
            message_params: entry.message_params.clone(),
        });
        if let Some(task) = state.current_mut(task_id) {
            task.push_log(entry);
        }
    }

    /// Park the runner until a choice is submitted or the task is cancelled
    pub(crate) async fn wait_for_input(
        &self,
        task_id: &str,
        question: &str,
        choices: Vec<Choice>,
    ) -> ChoiceResolution {
        let rx = {
            let mut state = self.state.lock().await;
            if state.cancelled.contains(task_id) || !state.is_current(task_id) {
                return ChoiceResolution::Cancelled;
            }

            let (tx, rx) = oneshot::channel();
            state.resolve_pending(ChoiceResolution::Cancelled);
            state.pending_choice = Some(tx);
            if let Some(task) = state.current_mut(task_id) {
                task.set_status(TaskStatus::WaitingInput);
            }
            self.sink.broadcast(BridgeEvent::TaskNeedInput {
                task_id: task_id.to_string(),
                question: question.to_string(),
                choices,
            });
            rx
        };

        rx.await.unwrap_or(ChoiceResolution::Cancelled)
    }

    /// Back to `running` after a choice resolved
    pub(crate) async fn resume(&self, task_id: &str) {
        let mut state = self.state.lock().await;
        if let Some(task) = state
            .current_mut(task_id)
            .filter(|t| t.status == TaskStatus::WaitingInput)
        {
            task.set_status(TaskStatus::Running);
        }
    }

    /// Normal completion from the runner
    pub(crate) async fn complete(&self, task_id: &str, summary: &str, meta: Value) -> bool {
        self.finish(task_id, TaskStatus::Done, |id| BridgeEvent::TaskDone {
            task_id: id.to_string(),
            summary: summary.to_string(),
            meta,
        })
        .await
    }

    /// Unexpected runner failure
    pub(crate) async fn fail(&self, task_id: &str, message: &str) -> bool {
        self.finish(task_id, TaskStatus::Error, |id| BridgeEvent::TaskError {
            task_id: id.to_string(),
            message: message.to_string(),
            message_key: None,
        })
        .await
    }

    async fn finish(
        &self,
        task_id: &str,
        status: TaskStatus,
        event: impl FnOnce(&str) -> BridgeEvent,
    ) -> bool {
        let mut state = self.state.lock().await;
        if state.cancelled.contains(task_id) {
            return false;
        }
        let Some(task) = state.current_mut(task_id) else {
            return false;
        };

        task.set_status(status);
        self.sink.broadcast(event(task_id));
        state.current = None;
        true
    }

    pub async fn is_cancelled(&self, task_id: &str) -> bool {
        self.state.lock().await.cancelled.contains(task_id)
    }

    /// Drop the cancellation mark for `task_id`. Idempotent.
    pub async fn clear_cancellation(&self, task_id: &str) {
        self.state.lock().await.cancelled.remove(task_id);
    }

    /// Snapshot of the current task, if any
    pub async fn current_task(&self) -> Option<Task> {
        self.state.lock().await.current.clone()
    }

    pub async fn has_pending_choice(&self) -> bool {
        self.state.lock().await.pending_choice.is_some()
    }

    /// Number of ids still marked cancelled (runners yet to unwind)
    pub async fn cancelled_count(&self) -> usize {
        self.state.lock().await.cancelled.len()
    }
}
