//! Router and handlers binding the orchestrator to HTTP.
//!
//! All lifecycle mutations go through the orchestrator; handlers only
//! translate between wire schemas and [`RuntimeError`] values. Streaming
//! runs over SSE: one SSE event per [`StreamEvent`], named after its tag,
//! closed after the terminal event.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::debug;

use tether_core::BackendCallbacks;
use tether_runtime::{Orchestrator, RuntimeError};
use tether_settings::TetherSettings;

use crate::schemas::{
    AckResponse, ChatRequest, ChatResponse, DeviceRequest, FleetResponse, InitRequest,
    StatusQuery, StatusResponse,
};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// The process's coordination point.
    pub orchestrator: Arc<Orchestrator>,
    /// Server settings snapshot.
    pub settings: Arc<TetherSettings>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/init", post(init_agent))
        .route("/api/chat", post(chat))
        .route("/api/chat/stream", post(chat_stream))
        .route("/api/interrupt", post(interrupt_agent))
        .route("/api/reset", post(reset_agent))
        .route("/api/destroy", post(destroy_agent))
        .route("/api/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire-facing error: status code plus a categorized JSON body.
pub struct ApiError {
    status: StatusCode,
    category: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            category: "bad_request",
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            category: "not_found",
            message: message.into(),
        }
    }
}

impl From<RuntimeError> for ApiError {
    fn from(err: RuntimeError) -> Self {
        let status = match &err {
            RuntimeError::DeviceBusy(_) => StatusCode::CONFLICT,
            RuntimeError::AgentNotInitialized(_) => StatusCode::BAD_REQUEST,
            RuntimeError::AgentInitialization { .. }
            | RuntimeError::Backend(_)
            | RuntimeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            category: match &err {
                RuntimeError::DeviceBusy(_) => "device_busy",
                RuntimeError::AgentNotInitialized(_) => "agent_not_initialized",
                RuntimeError::AgentInitialization { .. } => "agent_initialization",
                RuntimeError::Backend(_) => "backend",
                RuntimeError::Internal(_) => "internal",
            },
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": { "category": self.category, "message": self.message }
        }));
        (self.status, body).into_response()
    }
}

async fn init_agent(
    State(state): State<AppState>,
    Json(request): Json<InitRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let mut model = request.model.unwrap_or_default();
    let agent = request.agent.unwrap_or_default();

    let device_key = agent.device_key.clone();
    if device_key.is_empty() {
        return Err(ApiError::bad_request("deviceKey is required in agent config"));
    }

    // Fall back to the server's default endpoint when the request omits one.
    if model.base_url.is_empty() {
        model.base_url.clone_from(&state.settings.model.base_url);
    }
    if model.base_url.is_empty() {
        return Err(ApiError::bad_request(
            "baseUrl is required: configure a model default or pass model.baseUrl",
        ));
    }

    let _ = state.orchestrator.initialize(
        &device_key,
        model,
        agent,
        BackendCallbacks::default(),
        request.force,
    )?;

    Ok(Json(AckResponse {
        success: true,
        message: format!("Agent initialized for device {device_key}"),
        device_key,
    }))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    match state
        .orchestrator
        .run_task(&request.device_key, &request.message, Some(Duration::ZERO))
        .await
    {
        Ok(outcome) => Ok(Json(ChatResponse {
            result: outcome.message,
            steps: outcome.steps,
            success: outcome.success,
        })),
        // Backend failures are a completed-but-unsuccessful chat, not a
        // transport error.
        Err(RuntimeError::Backend(err)) => Ok(Json(ChatResponse {
            result: err.message().to_string(),
            steps: 0,
            success: false,
        })),
        Err(err) => Err(err.into()),
    }
}

async fn chat_stream(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = state
        .orchestrator
        .start_session(&request.device_key, &request.message, Some(Duration::ZERO))
        .await?;

    let mut events = session.into_events();
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            let terminal = event.is_terminal();
            match Event::default().event(event.event_type()).json_data(&event) {
                Ok(sse_event) => yield Ok::<_, Infallible>(sse_event),
                Err(err) => debug!(error = %err, "failed to frame stream event"),
            }
            if terminal {
                break;
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn interrupt_agent(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let device_key = request.device_key;
    if !state.orchestrator.is_initialized(&device_key) {
        return Err(ApiError::not_found(format!(
            "Device {device_key} not initialized"
        )));
    }

    let aborted = state.orchestrator.abort_session(&device_key);
    let message = if aborted {
        format!("Abort signal sent to device {device_key}")
    } else {
        format!("No active session for device {device_key}")
    };
    Ok(Json(AckResponse {
        success: aborted,
        device_key,
        message,
    }))
}

async fn reset_agent(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let device_key = request.device_key;
    match state.orchestrator.reset(&device_key) {
        Ok(()) => Ok(Json(AckResponse {
            success: true,
            message: format!("Agent reset for device {device_key}"),
            device_key,
        })),
        Err(RuntimeError::AgentNotInitialized(_)) => Err(ApiError::not_found(format!(
            "Device {device_key} not found"
        ))),
        Err(err) => Err(err.into()),
    }
}

async fn destroy_agent(
    State(state): State<AppState>,
    Json(request): Json<DeviceRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let device_key = request.device_key;
    if !state.orchestrator.destroy(&device_key) {
        return Err(ApiError::not_found(format!(
            "Device {device_key} not found"
        )));
    }
    Ok(Json(AckResponse {
        success: true,
        message: format!("Agent destroyed for device {device_key}"),
        device_key,
    }))
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, ApiError> {
    let Some(device_key) = query.device_key else {
        let fleet = FleetResponse {
            version: APP_VERSION.to_string(),
            devices: state.orchestrator.list_metadata(),
        };
        return Ok(Json(fleet).into_response());
    };

    let initialized = state.orchestrator.is_initialized(&device_key);
    // Status must not block behind a device hold: read the counter only
    // if the handle mutex is free.
    let step_count = if initialized {
        state
            .orchestrator
            .get(&device_key)
            .ok()
            .and_then(|handle| handle.try_lock().map(|backend| backend.step_count()))
    } else {
        None
    };

    let response = StatusResponse {
        version: APP_VERSION.to_string(),
        initialized,
        state: state.orchestrator.state(&device_key),
        step_count,
    };
    Ok(Json(response).into_response())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    use tether_runtime::testutil::{ScriptPlan, ScriptedFactory, ScriptedStep};

    fn test_state(factory: ScriptedFactory) -> AppState {
        let mut settings = TetherSettings::default();
        settings.model.base_url = "http://127.0.0.1:8001/v1".to_string();
        AppState {
            orchestrator: Arc::new(Orchestrator::new(Arc::new(factory))),
            settings: Arc::new(settings),
        }
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn init_body(device_key: &str) -> Value {
        json!({ "agent": { "deviceKey": device_key } })
    }

    #[tokio::test]
    async fn init_requires_device_key() {
        let state = test_state(ScriptedFactory::new());
        let (status, body) = send(router(state), "POST", "/api/init", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["category"], "bad_request");
    }

    #[tokio::test]
    async fn init_requires_base_url_somewhere() {
        let state = AppState {
            orchestrator: Arc::new(Orchestrator::new(Arc::new(ScriptedFactory::new()))),
            settings: Arc::new(TetherSettings::default()), // no default base URL
        };
        let (status, _) = send(
            router(state),
            "POST",
            "/api/init",
            Some(init_body("d1")),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn init_then_status_reports_initialized() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state);

        let (status, body) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["deviceKey"], "d1");

        let (status, body) = send(app, "GET", "/api/status?deviceKey=d1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["initialized"], true);
        assert_eq!(body["state"], "idle");
        assert_eq!(body["stepCount"], 0);
    }

    #[tokio::test]
    async fn init_is_idempotent_over_http() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state.clone());

        let (first, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (second, _) = send(app, "POST", "/api/init", Some(init_body("d1"))).await;
        assert_eq!(first, StatusCode::OK);
        assert_eq!(second, StatusCode::OK);
        assert_eq!(state.orchestrator.list().len(), 1);
    }

    #[tokio::test]
    async fn failed_init_maps_to_500_and_leaves_nothing() {
        let factory = ScriptedFactory::new();
        factory.push_plan(ScriptPlan::failing("device unreachable"));
        let state = test_state(factory);
        let app = router(state.clone());

        let (status, body) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["category"], "agent_initialization");

        let (_, body) = send(app, "GET", "/api/status?deviceKey=d1", None).await;
        assert_eq!(body["initialized"], false);
        assert_eq!(body["state"], "error");
    }

    #[tokio::test]
    async fn chat_runs_task_to_completion() {
        let factory = ScriptedFactory::new();
        factory.push_plan(ScriptPlan::new(vec![
            ScriptedStep::unfinished("tap"),
            ScriptedStep::finished("opened settings"),
        ]));
        let state = test_state(factory);
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (status, body) = send(
            app,
            "POST",
            "/api/chat",
            Some(json!({ "deviceKey": "d1", "message": "open settings" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"], "opened settings");
        assert_eq!(body["steps"], 2);
        assert_eq!(body["success"], true);
    }

    #[tokio::test]
    async fn chat_backend_failure_reports_unsuccessful() {
        let factory = ScriptedFactory::new();
        factory.push_plan(ScriptPlan::new(vec![ScriptedStep::failing("model 500")]));
        let state = test_state(factory);
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (status, body) = send(
            app,
            "POST",
            "/api/chat",
            Some(json!({ "deviceKey": "d1", "message": "task" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["result"], "model 500");
    }

    #[tokio::test]
    async fn chat_uninitialized_maps_to_400() {
        let state = test_state(ScriptedFactory::new());
        let (status, body) = send(
            router(state),
            "POST",
            "/api/chat",
            Some(json!({ "deviceKey": "ghost", "message": "task" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["category"], "agent_not_initialized");
    }

    #[tokio::test]
    async fn chat_busy_device_maps_to_409() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state.clone());

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        assert!(
            state
                .orchestrator
                .acquire("d1", Some(Duration::ZERO), true)
                .await
                .unwrap()
        );

        let (status, body) = send(
            app,
            "POST",
            "/api/chat",
            Some(json!({ "deviceKey": "d1", "message": "task" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["category"], "device_busy");

        state.orchestrator.release("d1");
    }

    #[tokio::test]
    async fn chat_stream_frames_events_as_sse() {
        let factory = ScriptedFactory::new();
        factory.push_plan(ScriptPlan::new(Vec::new())); // durable handle
        factory.push_plan(ScriptPlan::new(vec![
            ScriptedStep::unfinished("tap").with_thinking(&["hmm"]),
            ScriptedStep::finished("done"),
        ]));
        let state = test_state(factory);
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;

        let request = Request::builder()
            .method("POST")
            .uri("/api/chat/stream")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "deviceKey": "d1", "message": "task" }).to_string(),
            ))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8_lossy(&bytes);
        assert!(body.contains("event: thinking_chunk"));
        assert!(body.contains("event: step"));
        assert!(body.contains("event: done"));
        // Terminal event closes the stream; nothing after done
        let done_pos = body.find("event: done").unwrap();
        assert!(!body[done_pos..].contains("event: step"));
    }

    #[tokio::test]
    async fn stream_busy_device_maps_to_409() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state.clone());

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        assert!(
            state
                .orchestrator
                .acquire("d1", Some(Duration::ZERO), true)
                .await
                .unwrap()
        );

        let (status, _) = send(
            app,
            "POST",
            "/api/chat/stream",
            Some(json!({ "deviceKey": "d1", "message": "task" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        state.orchestrator.release("d1");
    }

    #[tokio::test]
    async fn interrupt_unknown_device_is_404() {
        let state = test_state(ScriptedFactory::new());
        let (status, _) = send(
            router(state),
            "POST",
            "/api/interrupt",
            Some(json!({ "deviceKey": "ghost" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn interrupt_idle_device_reports_no_session() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (status, body) = send(
            app,
            "POST",
            "/api/interrupt",
            Some(json!({ "deviceKey": "d1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn reset_unknown_device_is_404() {
        let state = test_state(ScriptedFactory::new());
        let (status, _) = send(
            router(state),
            "POST",
            "/api/reset",
            Some(json!({ "deviceKey": "ghost" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn destroy_then_fleet_status_is_empty() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (status, body) = send(
            app.clone(),
            "POST",
            "/api/destroy",
            Some(json!({ "deviceKey": "d1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);

        let (_, body) = send(app.clone(), "GET", "/api/status", None).await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 0);

        let (status, _) = send(
            app,
            "POST",
            "/api/destroy",
            Some(json!({ "deviceKey": "d1" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn fleet_status_lists_devices() {
        let state = test_state(ScriptedFactory::new());
        let app = router(state);

        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d1"))).await;
        let (_, _) = send(app.clone(), "POST", "/api/init", Some(init_body("d2"))).await;

        let (status, body) = send(app, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        let devices = body["devices"].as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert!(body["version"].as_str().is_some());
    }
}
