use std::collections::HashMap;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::{Dispatcher, PollError, ResultError};
use crate::error::NoWorkerError;
use crate::model::{Assignment, AssignmentOrigin, WorkOutcome};
use crate::token::guard::{GuardError, bearer_token, require_worker};
use crate::token::validate_token;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<GuardError> for AppError {
    fn from(err: GuardError) -> Self {
        let status = match err {
            GuardError::WrongWorker { .. } => StatusCode::FORBIDDEN,
            GuardError::MissingCredentials | GuardError::InvalidToken(_) => {
                StatusCode::UNAUTHORIZED
            }
        };
        Self::new(status, err.to_string())
    }
}

impl From<PollError> for AppError {
    fn from(err: PollError) -> Self {
        Self::new(StatusCode::NOT_FOUND, err.to_string())
    }
}

impl From<ResultError> for AppError {
    fn from(err: ResultError) -> Self {
        let status = match err {
            ResultError::Duplicate(_) => StatusCode::CONFLICT,
            ResultError::Unknown { .. } => StatusCode::NOT_FOUND,
        };
        Self::new(status, err.to_string())
    }
}

impl From<NoWorkerError> for AppError {
    fn from(err: NoWorkerError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub pid: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub worker: String,
    pub queued: usize,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    #[serde(default)]
    pub wait_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub worker: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub assignment_id: Uuid,
    pub correlation_id: Uuid,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(dispatcher: Dispatcher) -> Router {
    Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/{name}/register", post(register))
        .route("/workers/{name}/assignments/next", get(next_assignment))
        .route("/workers/{name}/assignments/{id}/result", post(submit_result))
        .route("/assignments", post(submit_assignment))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_workers(State(dispatcher): State<Dispatcher>) -> impl IntoResponse {
    Json(dispatcher.workers())
}

async fn register(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Option<Json<RegisterRequest>>,
) -> Result<Json<RegisterResponse>, AppError> {
    require_worker(dispatcher.tokens(), &headers, &name)?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let queued = dispatcher.register(&name, request.pid);
    Ok(Json(RegisterResponse {
        worker: name,
        queued,
    }))
}

async fn next_assignment(
    State(dispatcher): State<Dispatcher>,
    Path(name): Path<String>,
    Query(query): Query<PollQuery>,
    headers: HeaderMap,
) -> Result<axum::response::Response, AppError> {
    require_worker(dispatcher.tokens(), &headers, &name)?;
    let wait = Duration::from_millis(query.wait_ms);
    match dispatcher.next_assignment(&name, wait).await? {
        Some(assignment) => Ok(Json(assignment.as_ref().clone()).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn submit_result(
    State(dispatcher): State<Dispatcher>,
    Path((name, id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(outcome): Json<WorkOutcome>,
) -> Result<StatusCode, AppError> {
    require_worker(dispatcher.tokens(), &headers, &name)?;
    dispatcher.submit_result(&name, id, outcome).await?;
    Ok(StatusCode::ACCEPTED)
}

/// Any worker may hand work to any other worker.
async fn submit_assignment(
    State(dispatcher): State<Dispatcher>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let token = bearer_token(&headers).ok_or(GuardError::MissingCredentials)?;
    validate_token(dispatcher.tokens(), token).map_err(GuardError::from)?;

    let assignment = Assignment::new(
        request.worker,
        Uuid::new_v4(),
        request.payload,
        request.metadata,
        AssignmentOrigin::Local,
    );
    let queued = dispatcher.submit_local(assignment)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            assignment_id: queued.id,
            correlation_id: queued.correlation_id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::bus::{Bus, Event, Signal};
    use crate::dispatch::DispatcherConfig;
    use crate::token::{TokenConfig, generate_token};

    // -----------------------------------------------------------------------
    // HTTP helpers
    // -----------------------------------------------------------------------

    fn setup(bus: &Bus) -> (Dispatcher, TokenConfig) {
        let tokens = TokenConfig::new(b"routes-test".to_vec());
        let config = DispatcherConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..DispatcherConfig::default()
        };
        (Dispatcher::new(config, bus.clone(), tokens.clone()), tokens)
    }

    async fn send(
        dispatcher: &Dispatcher,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        let body = match body {
            Some(json) => {
                req = req.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        dispatcher
            .router()
            .oneshot(req.body(body).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn worker_round_trip_over_http() {
        let bus = Bus::new();
        let mut done = bus.connect(Signal::WorkComplete);
        let (d, tokens) = setup(&bus);
        let token = generate_token(&tokens, "echo");

        let resp = send(&d, "POST", "/workers/echo/register", Some(&token), Some(serde_json::json!({"pid": 7}))).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["queued"], 0);

        let resp = send(&d, "GET", "/workers/echo/assignments/next", Some(&token), None).await;
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let resp = send(
            &d,
            "POST",
            "/assignments",
            Some(&token),
            Some(serde_json::json!({"worker": "echo", "payload": {"text": "hi"}})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let id = body_json(resp).await["assignment_id"]
            .as_str()
            .unwrap()
            .to_string();

        let resp = send(&d, "GET", "/workers/echo/assignments/next?wait_ms=100", Some(&token), None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let assignment = body_json(resp).await;
        assert_eq!(assignment["id"], id.as_str());
        assert_eq!(assignment["payload"]["text"], "hi");
        assert_eq!(assignment["origin"], "local");

        let uri = format!("/workers/echo/assignments/{id}/result");
        let result = serde_json::json!({"status": "succeeded", "result": "hi"});
        let resp = send(&d, "POST", &uri, Some(&token), Some(result.clone())).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = send(&d, "POST", &uri, Some(&token), Some(result)).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        match done.recv().await.unwrap() {
            Event::WorkComplete(c) => assert_eq!(c.assignment_id.to_string(), id),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(done.try_recv().is_none());
    }

    #[tokio::test]
    async fn worker_routes_require_matching_token() {
        let (d, tokens) = setup(&Bus::new());

        let resp = send(&d, "POST", "/workers/echo/register", None, None).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(body_json(resp).await["error"].as_str().unwrap().contains("bearer"));

        let other = generate_token(&tokens, "shell");
        let resp = send(&d, "POST", "/workers/echo/register", Some(&other), None).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = send(&d, "POST", "/assignments", None, Some(serde_json::json!({"worker": "echo"}))).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn poll_before_register_is_not_found() {
        let (d, tokens) = setup(&Bus::new());
        let token = generate_token(&tokens, "echo");
        let resp = send(&d, "GET", "/workers/echo/assignments/next", Some(&token), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_workers_reports_queue_depth() {
        let (d, tokens) = setup(&Bus::new());
        let token = generate_token(&tokens, "echo");
        send(&d, "POST", "/workers/echo/register", Some(&token), None).await;
        send(
            &d,
            "POST",
            "/assignments",
            Some(&token),
            Some(serde_json::json!({"worker": "echo"})),
        )
        .await;

        let resp = send(&d, "GET", "/workers", None, None).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json[0]["name"], "echo");
        assert_eq!(json[0]["registered"], true);
        assert_eq!(json[0]["queued"], 1);
    }

    #[tokio::test]
    async fn local_submission_after_stop_is_unavailable() {
        let (d, tokens) = setup(&Bus::new());
        d.stop();
        let token = generate_token(&tokens, "echo");
        let resp = send(
            &d,
            "POST",
            "/assignments",
            Some(&token),
            Some(serde_json::json!({"worker": "echo"})),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
