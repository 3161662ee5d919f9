//! Lifecycle runner: drives one task through its scripted stages.
//!
//! ```text
//! starting → analyzing → found_files → generating → awaiting_choice
//!          → (applying | skipping | modifying) → finishing → done
//! ```
//!
//! Any step failure ends in `error`; a cancellation check before every stage
//! (and right after the choice resolves) ends the run silently, since whoever
//! cancelled already broadcast `task.error`. The body of each stage is
//! delegated to [`StepWork`]; the daemon ships [`SimulatedWork`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use super::coordinator::{ChoiceResolution, TaskCoordinator};
use super::protocol::{Choice, LogLevel, TaskLog};

pub const CHOICE_APPLY: &str = "apply";
pub const CHOICE_SKIP: &str = "skip";
pub const CHOICE_MODIFY: &str = "modify";

/// Files the scripted plan touches
pub const PLANNED_CHANGED_FILES: u64 = 3;

pub const CHOICE_QUESTION: &str = "Apply the proposed changes?";

/// Default pause per simulated step
pub const DEFAULT_STEP_DELAY: Duration = Duration::from_millis(800);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Starting,
    Analyzing,
    FoundFiles,
    Generating,
    AwaitingChoice,
    Applying,
    Skipping,
    Modifying,
    Finishing,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Starting => "starting",
            Stage::Analyzing => "analyzing",
            Stage::FoundFiles => "found_files",
            Stage::Generating => "generating",
            Stage::AwaitingChoice => "awaiting_choice",
            Stage::Applying => "applying",
            Stage::Skipping => "skipping",
            Stage::Modifying => "modifying",
            Stage::Finishing => "finishing",
        }
    }

    /// Log line announcing the stage, with its i18n key
    fn announcement(self, prompt: &str) -> TaskLog {
        let (level, message) = match self {
            Stage::Starting => (LogLevel::Info, format!("Starting task: {}", prompt)),
            Stage::Analyzing => (LogLevel::Info, "Analyzing repository...".to_string()),
            Stage::FoundFiles => (
                LogLevel::Info,
                format!("Found {} files to modify", PLANNED_CHANGED_FILES),
            ),
            Stage::Generating => (LogLevel::Info, "Generating changes...".to_string()),
            Stage::AwaitingChoice => (LogLevel::Focus, "Waiting for your decision".to_string()),
            Stage::Applying => (LogLevel::Info, "Applying changes...".to_string()),
            Stage::Skipping => (LogLevel::Warn, "Skipping proposed changes".to_string()),
            Stage::Modifying => (LogLevel::Info, "Modifying the plan...".to_string()),
            Stage::Finishing => (LogLevel::Success, "Finishing up".to_string()),
        };

        let mut params = Map::new();
        match self {
            Stage::Starting => {
                params.insert("prompt".to_string(), json!(prompt));
            }
            Stage::FoundFiles => {
                params.insert("count".to_string(), json!(PLANNED_CHANGED_FILES));
            }
            _ => {}
        }

        let entry = TaskLog::new(level, message).with_key(format!("runner.{}", self.as_str()));
        if params.is_empty() {
            entry
        } else {
            entry.with_params(params)
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The work done inside a stage. Swap the implementation to do real edits;
/// the state machine, events and cancellation checks stay where they are.
#[async_trait]
pub trait StepWork: Send + Sync {
    async fn perform(&self, task_id: &str, stage: Stage) -> anyhow::Result<()>;
}

/// Stand-in for real work: every stage just takes `delay`
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for SimulatedWork {
    fn default() -> Self {
        Self::new(DEFAULT_STEP_DELAY)
    }
}

#[async_trait]
impl StepWork for SimulatedWork {
    async fn perform(&self, _task_id: &str, _stage: Stage) -> anyhow::Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

/// The three options offered at `awaiting_choice`
pub fn default_choices() -> Vec<Choice> {
    vec![
        Choice::new(CHOICE_APPLY, "Apply changes"),
        Choice::new(CHOICE_SKIP, "Skip"),
        Choice::new(CHOICE_MODIFY, "Modify plan"),
    ]
}

enum RunOutcome {
    Completed { summary: String, meta: Value },
    Cancelled,
}

/// Drive `task_id` to completion. Spawned by the coordinator. A step that
/// errors or panics ends the task in `error`, and the task's cancellation
/// mark is cleared on every exit.
pub(crate) async fn run(coordinator: Arc<TaskCoordinator>, task_id: String, prompt: String) {
    let outcome = AssertUnwindSafe(drive(&coordinator, &task_id, &prompt))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(anyhow::anyhow!(
                "step panicked: {}",
                panic_message(&*panic)
            ))
        });

    match outcome {
        Ok(RunOutcome::Completed { summary, meta }) => {
            if coordinator.complete(&task_id, &summary, meta).await {
                info!(task_id = %task_id, "task done");
            }
        }
        Ok(RunOutcome::Cancelled) => {
            debug!(task_id = %task_id, "runner observed cancellation");
        }
        Err(e) => {
            if coordinator.is_cancelled(&task_id).await {
                debug!(task_id = %task_id, error = %e, "step failed after cancellation");
            } else {
                warn!(task_id = %task_id, error = %e, "task failed");
                coordinator.fail(&task_id, &e.to_string()).await;
            }
        }
    }

    coordinator.clear_cancellation(&task_id).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn drive(
    coordinator: &TaskCoordinator,
    task_id: &str,
    prompt: &str,
) -> anyhow::Result<RunOutcome> {
    let work = coordinator.step_work();

    for stage in [
        Stage::Starting,
        Stage::Analyzing,
        Stage::FoundFiles,
        Stage::Generating,
    ] {
        if !run_stage(coordinator, work.as_ref(), task_id, stage, prompt).await? {
            return Ok(RunOutcome::Cancelled);
        }
    }

    if !coordinator
        .log_unless_cancelled(task_id, Stage::AwaitingChoice.announcement(prompt))
        .await
    {
        return Ok(RunOutcome::Cancelled);
    }
    let choice = match coordinator
        .wait_for_input(task_id, CHOICE_QUESTION, default_choices())
        .await
    {
        ChoiceResolution::Chosen(choice) => choice,
        ChoiceResolution::Cancelled => return Ok(RunOutcome::Cancelled),
    };
    if coordinator.is_cancelled(task_id).await {
        return Ok(RunOutcome::Cancelled);
    }
    coordinator.resume(task_id).await;

    let (stage, changed_files, summary) = match choice.as_str() {
        CHOICE_APPLY => (
            Stage::Applying,
            PLANNED_CHANGED_FILES,
            format!("Applied changes to {} files", PLANNED_CHANGED_FILES),
        ),
        CHOICE_SKIP => (Stage::Skipping, 0, "Skipped the proposed changes".to_string()),
        CHOICE_MODIFY => (
            Stage::Modifying,
            PLANNED_CHANGED_FILES,
            format!("Applied the modified plan to {} files", PLANNED_CHANGED_FILES),
        ),
        other => bail!("unknown choice: {}", other),
    };
    if !run_stage(coordinator, work.as_ref(), task_id, stage, prompt).await?
        || !run_stage(coordinator, work.as_ref(), task_id, Stage::Finishing, prompt).await?
    {
        return Ok(RunOutcome::Cancelled);
    }

    if coordinator.is_cancelled(task_id).await {
        return Ok(RunOutcome::Cancelled);
    }
    Ok(RunOutcome::Completed {
        summary,
        meta: json!({
            "changedFiles": changed_files,
            "choice": choice,
        }),
    })
}

/// Announce `stage` and do its work. `Ok(false)` means the task was already
/// cancelled and the stage never started.
async fn run_stage(
    coordinator: &TaskCoordinator,
    work: &dyn StepWork,
    task_id: &str,
    stage: Stage,
    prompt: &str,
) -> anyhow::Result<bool> {
    if !coordinator
        .log_unless_cancelled(task_id, stage.announcement(prompt))
        .await
    {
        return Ok(false);
    }
    debug!(task_id, stage = %stage, "entering stage");
    work.perform(task_id, stage).await?;
    Ok(true)
}
