// Bridge protocol - shared structs for agent hooks, the coordinator and browser clients
// Events are pushed as JSON text frames; requests arrive as JSON HTTP bodies

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Most recent log entries retained per task
pub const MAX_TASK_LOGS: usize = 100;

/// Message carried by the `task.error` event when a task is cancelled
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Localization key carried alongside [`CANCELLED_MESSAGE`]
pub const CANCELLED_MESSAGE_KEY: &str = "task.cancelled";

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Task status reflecting where the lifecycle currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// The runner is working through its steps
    Running,
    /// The runner is blocked on a user choice
    WaitingInput,
    /// Finished successfully
    Done,
    /// Failed or cancelled
    Error,
}

impl TaskStatus {
    /// Running and waiting tasks block admission of a new task
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::WaitingInput)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::WaitingInput => write!(f, "waiting_input"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskStatus::Running),
            "waiting_input" => Ok(TaskStatus::WaitingInput),
            "done" => Ok(TaskStatus::Done),
            "error" => Ok(TaskStatus::Error),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Severity/category of a task log line.
///
/// `focus` and `command` are display categories used by the browser panel
/// (window focus requests and shell commands the agent ran).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
    Success,
    Focus,
    Command,
}

impl LogLevel {
    /// Wire names accepted by `POST /agent/log`
    pub const NAMES: [&'static str; 7] =
        ["info", "warn", "error", "debug", "success", "focus", "command"];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Debug => "debug",
            LogLevel::Success => "success",
            LogLevel::Focus => "focus",
            LogLevel::Command => "command",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "debug" => Ok(LogLevel::Debug),
            "success" => Ok(LogLevel::Success),
            "focus" => Ok(LogLevel::Focus),
            "command" => Ok(LogLevel::Command),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// A single retained log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub level: LogLevel,
    pub message: String,
    pub timestamp: i64,
    /// i18n key the browser uses instead of `message` when it has a translation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_params: Option<Map<String, Value>>,
}

impl TaskLog {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: now_millis(),
            message_key: None,
            message_params: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = Some(key.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.message_params = Some(params);
        self
    }
}

/// The single unit of work tracked by the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    /// Caller-supplied correlation string
    pub repo_id: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub logs: VecDeque<TaskLog>,
}

impl Task {
    pub fn new(id: String, repo_id: String, prompt: String) -> Self {
        let now = now_millis();
        Self {
            id,
            repo_id,
            prompt,
            status: TaskStatus::Running,
            created_at: now,
            updated_at: now,
            logs: VecDeque::new(),
        }
    }

    /// Append a log line, evicting the oldest once [`MAX_TASK_LOGS`] is reached
    pub fn push_log(&mut self, entry: TaskLog) {
        if self.logs.len() >= MAX_TASK_LOGS {
            self.logs.pop_front();
        }
        self.logs.push_back(entry);
        self.touch();
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.touch();
    }

    fn touch(&mut self) {
        // Wall clock may step backwards; updated_at never does
        self.updated_at = now_millis().max(self.updated_at);
    }
}

/// One option offered by `task.need_input`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub id: String,
    pub label: String,
}

impl Choice {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

// ============================================================================
// Daemon -> Client push events (broadcast)
// ============================================================================

/// Lifecycle event pushed to every connected browser client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeEvent {
    #[serde(rename = "task.started", rename_all = "camelCase")]
    TaskStarted {
        task_id: String,
        repo_id: String,
        started_at: i64,
        prompt: String,
    },
    #[serde(rename = "task.log", rename_all = "camelCase")]
    TaskLog {
        task_id: String,
        level: LogLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_params: Option<Map<String, Value>>,
    },
    #[serde(rename = "task.need_input", rename_all = "camelCase")]
    TaskNeedInput {
        task_id: String,
        question: String,
        choices: Vec<Choice>,
    },
    #[serde(rename = "task.done", rename_all = "camelCase")]
    TaskDone {
        task_id: String,
        summary: String,
        meta: Value,
    },
    #[serde(rename = "task.error", rename_all = "camelCase")]
    TaskError {
        task_id: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_key: Option<String>,
    },
}

impl BridgeEvent {
    /// The `task.error` event every cancellation path emits
    pub fn cancelled(task_id: &str) -> Self {
        BridgeEvent::TaskError {
            task_id: task_id.to_string(),
            message: CANCELLED_MESSAGE.to_string(),
            message_key: Some(CANCELLED_MESSAGE_KEY.to_string()),
        }
    }

    pub fn task_id(&self) -> &str {
        match self {
            BridgeEvent::TaskStarted { task_id, .. }
            | BridgeEvent::TaskLog { task_id, .. }
            | BridgeEvent::TaskNeedInput { task_id, .. }
            | BridgeEvent::TaskDone { task_id, .. }
            | BridgeEvent::TaskError { task_id, .. } => task_id,
        }
    }

    /// Wire name of the event (`task.started`, `task.log`, ...)
    pub fn event_type(&self) -> &'static str {
        match self {
            BridgeEvent::TaskStarted { .. } => "task.started",
            BridgeEvent::TaskLog { .. } => "task.log",
            BridgeEvent::TaskNeedInput { .. } => "task.need_input",
            BridgeEvent::TaskDone { .. } => "task.done",
            BridgeEvent::TaskError { .. } => "task.error",
        }
    }

    /// Cancellations share `task.error`; only the message tells them apart
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BridgeEvent::TaskError { message, .. } if message == CANCELLED_MESSAGE)
    }
}

// ============================================================================
// Helpers for message framing
// ============================================================================

/// Serialize an event to the JSON text sent in a WebSocket frame
pub fn serialize_event(event: &BridgeEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Parse an event from a JSON text frame
pub fn deserialize_event(text: &str) -> Result<BridgeEvent, serde_json::Error> {
    serde_json::from_str(text.trim_end())
}
