// HTTP front-door handlers
// Transport-agnostic: takes a decoded request, returns a status and a JSON body

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::auth::authorize_bearer;
use super::config::Config;
use super::coordinator::{CreateTaskError, TaskCoordinator};
use super::protocol::{LogLevel, TaskLog};
use super::settings::{FocusSettingsPatch, SettingsStore};
use super::validation::{
    validate_enum, validate_optional_bool, validate_optional_string, validate_string,
    ValidationError, MAX_ID_LEN, MAX_MESSAGE_LEN, MAX_PROMPT_LEN,
};

pub const DEFAULT_REPO_ID: &str = "default";
pub const DEFAULT_DONE_SUMMARY: &str = "Task completed";

/// Shared state behind every request handler
pub struct BridgeState {
    pub coordinator: Arc<TaskCoordinator>,
    pub settings: SettingsStore,
    pub shared_secret: Option<String>,
    pub allowed_extension_id: Option<String>,
    pub version: String,
    pub git_branch: String,
}

impl BridgeState {
    pub fn new(coordinator: Arc<TaskCoordinator>, config: &Config) -> Self {
        Self {
            coordinator,
            settings: SettingsStore::default(),
            shared_secret: config.shared_secret.clone(),
            allowed_extension_id: config.allowed_extension_id.clone(),
            version: config.version.clone(),
            git_branch: config.git_branch.clone(),
        }
    }
}

/// A request as the handlers see it
#[derive(Debug, Clone, Copy)]
pub struct ApiRequest<'a> {
    pub method: &'a str,
    /// Request target; any query string is ignored for routing
    pub path: &'a str,
    pub authorization: Option<&'a str>,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn ok(mut fields: Map<String, Value>) -> Self {
        fields.insert("ok".to_string(), Value::Bool(true));
        Self {
            status: 200,
            body: Value::Object(fields),
        }
    }

    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: json!({ "ok": false, "error": message.into() }),
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: 401,
            body: json!({ "ok": false }),
        }
    }

    pub fn not_found() -> Self {
        Self::error(404, "not found")
    }
}

impl From<ValidationError> for ApiResponse {
    fn from(err: ValidationError) -> Self {
        Self::error(400, err.to_string())
    }
}

type HandlerResult = Result<ApiResponse, ApiResponse>;

/// Route a request to its handler
pub async fn handle(state: &BridgeState, request: ApiRequest<'_>) -> ApiResponse {
    let path = request.path.split('?').next().unwrap_or_default();

    let result = match (request.method, path) {
        ("GET", "/health") => Ok(health(state)),
        ("GET", "/task/current") => current_task(state).await,
        ("GET", "/focus/settings") => get_focus_settings(state).await,
        ("POST", "/focus/settings") => update_focus_settings(state, &request).await,
        ("POST", "/agent/start") => start_task(state, &request).await,
        ("POST", "/agent/done") => agent_done(state, &request).await,
        ("POST", "/agent/log") => agent_log(state, &request).await,
        ("POST", "/agent/cancel") => agent_cancel(state, &request).await,
        ("POST", "/task/choice") => submit_choice(state, &request).await,
        ("POST", "/task/cancel") => cancel_task(state, &request).await,
        _ => {
            debug!(method = request.method, path, "no route");
            Err(ApiResponse::not_found())
        }
    };

    result.unwrap_or_else(|response| response)
}

/// Decode a JSON object body. An empty body reads as `{}`.
fn parse_body(body: &[u8]) -> Result<Map<String, Value>, ApiResponse> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiResponse::error(400, "body must be a JSON object")),
        Err(e) => {
            debug!(error = %e, "malformed JSON body");
            Err(ApiResponse::error(400, "invalid JSON"))
        }
    }
}

fn health(state: &BridgeState) -> ApiResponse {
    let mut fields = Map::new();
    fields.insert("version".into(), json!(state.version));
    fields.insert("gitBranch".into(), json!(state.git_branch));
    ApiResponse::ok(fields)
}

async fn current_task(state: &BridgeState) -> HandlerResult {
    let task = state.coordinator.current_task().await;
    let mut fields = Map::new();
    fields.insert("task".into(), serde_json::to_value(task).unwrap_or(Value::Null));
    Ok(ApiResponse::ok(fields))
}

async fn get_focus_settings(state: &BridgeState) -> HandlerResult {
    let settings = state.settings.get().await;
    let mut fields = Map::new();
    fields.insert("settings".into(), json!(settings));
    Ok(ApiResponse::ok(fields))
}

async fn update_focus_settings(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    if !authorize_bearer(request.authorization, state.shared_secret.as_deref()) {
        warn!("rejected focus settings update");
        return Err(ApiResponse::unauthorized());
    }

    let body = parse_body(request.body)?;
    let patch = FocusSettingsPatch {
        enabled: validate_optional_bool(body.get("enabled"), "enabled")?,
        focus_on_done: validate_optional_bool(body.get("focusOnDone"), "focusOnDone")?,
    };

    let settings = state.settings.update(patch).await;
    let mut fields = Map::new();
    fields.insert("settings".into(), json!(settings));
    Ok(ApiResponse::ok(fields))
}

async fn start_task(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let prompt = validate_string(body.get("prompt"), "prompt", MAX_PROMPT_LEN)?;
    let task_id = validate_optional_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;
    let repo_id = validate_optional_string(body.get("repoId"), "repoId", MAX_ID_LEN)?
        .unwrap_or(DEFAULT_REPO_ID);

    let created = match task_id {
        Some(id) => {
            state
                .coordinator
                .create_task_with_id(id, repo_id, prompt)
                .await
        }
        None => state.coordinator.create_task(repo_id, prompt).await,
    };

    match created {
        Ok(task_id) => {
            let mut fields = Map::new();
            fields.insert("taskId".into(), json!(task_id));
            Ok(ApiResponse::ok(fields))
        }
        Err(err) => {
            let blocking_id = match &err {
                CreateTaskError::TaskActive { task_id, .. } => task_id,
                CreateTaskError::IdInUse { task_id } => task_id,
            };
            Err(ApiResponse {
                status: 409,
                body: json!({ "ok": false, "error": err.to_string(), "taskId": blocking_id }),
            })
        }
    }
}

async fn agent_done(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let task_id = validate_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;
    let summary = validate_optional_string(body.get("summary"), "summary", MAX_MESSAGE_LEN)?
        .unwrap_or(DEFAULT_DONE_SUMMARY);

    state.coordinator.complete_external(task_id, summary).await;
    Ok(ApiResponse::ok(Map::new()))
}

async fn agent_log(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let task_id = validate_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;
    let message = validate_string(body.get("message"), "message", MAX_MESSAGE_LEN)?;
    let level = validate_enum(body.get("level"), "level", &LogLevel::NAMES)?;
    let level: LogLevel = level
        .parse()
        .map_err(|e: String| ApiResponse::error(400, e))?;

    state
        .coordinator
        .log(task_id, TaskLog::new(level, message))
        .await;
    Ok(ApiResponse::ok(Map::new()))
}

async fn agent_cancel(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let task_id = validate_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;

    state.coordinator.cancel_external_task(task_id).await;
    Ok(ApiResponse::ok(Map::new()))
}

async fn submit_choice(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let task_id = validate_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;
    let choice_id = validate_string(body.get("choiceId"), "choiceId", MAX_ID_LEN)?;

    if state.coordinator.submit_choice(task_id, choice_id).await {
        Ok(ApiResponse::ok(Map::new()))
    } else {
        Err(ApiResponse::error(409, "task is not waiting for input"))
    }
}

async fn cancel_task(state: &BridgeState, request: &ApiRequest<'_>) -> HandlerResult {
    let body = parse_body(request.body)?;
    let task_id = validate_string(body.get("taskId"), "taskId", MAX_ID_LEN)?;

    if state.coordinator.cancel_task(task_id).await {
        Ok(ApiResponse::ok(Map::new()))
    } else {
        Err(ApiResponse::error(404, "task not found"))
    }
}
