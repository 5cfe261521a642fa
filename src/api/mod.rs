// HTTP and websocket endpoints for the control panel

use axum::{
    Form, Router,
    extract::{
        FromRequest, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header::CONTENT_TYPE},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::{PanelError, PanelResult};
use crate::orchestrator::SessionOrchestrator;
use crate::request::BatchRequest;

pub type AppState = Arc<SessionOrchestrator>;

const CONTROL_PAGE: &str = include_str!("../../assets/index.html");

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(control_page))
        .route("/health", get(health_check))
        .route("/run", post(run_batch))
        .route("/api/sessions/start", post(start_sessions))
        .route("/api/sessions/stop", post(stop_sessions))
        .route("/api/sessions/status", get(session_status))
        .route("/api/logs/clear", post(clear_logs))
        .route("/api/flight-data", get(flight_data))
        .route("/api/flight-data-json", get(flight_data_json))
        .route("/ws", get(live_channel))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// A batch request body, accepted as JSON or as an urlencoded form.
pub struct BatchPayload(pub BatchRequest);

impl<S: Send + Sync> FromRequest<S> for BatchPayload {
    type Rejection = PanelError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_form = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

        if is_form {
            let Form(body) = Form::<BatchRequest>::from_request(req, state)
                .await
                .map_err(|e| PanelError::validation(e.body_text()))?;
            Ok(Self(body))
        } else {
            let Json(body) = Json::<BatchRequest>::from_request(req, state)
                .await
                .map_err(|e| PanelError::validation(e.body_text()))?;
            Ok(Self(body))
        }
    }
}

async fn control_page() -> Html<&'static str> {
    Html(CONTROL_PAGE)
}

async fn health_check() -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

/// Run a batch to completion and report its output.
async fn run_batch(
    State(state): State<AppState>,
    BatchPayload(request): BatchPayload,
) -> PanelResult<Json<Value>> {
    let summary = state.run_batch(&request).await?;

    let error = match &summary.aborted {
        Some(reason) => reason.clone(),
        None => summary.last_error.clone(),
    };
    Ok(Json(json!({
        "success": summary.all_succeeded(),
        "output": summary.last_output,
        "error": error,
        "summary": summary,
    })))
}

async fn start_sessions(
    State(state): State<AppState>,
    BatchPayload(request): BatchPayload,
) -> PanelResult<Response> {
    let run_state = state.start(&request).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "success": true, "state": run_state })),
    )
        .into_response())
}

async fn stop_sessions(State(state): State<AppState>) -> Json<Value> {
    let stopped = state.stop().await;
    Json(json!({
        "success": true,
        "stopped": stopped,
        "state": state.state().await,
    }))
}

async fn session_status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.snapshot().await))
}

async fn clear_logs(State(state): State<AppState>) -> Json<Value> {
    state.clear_logs().await;
    Json(json!({ "success": true }))
}

/// Schedule entries with the triggers currently armed.
async fn flight_data(State(state): State<AppState>) -> PanelResult<Json<Value>> {
    let entries = state.fetch_schedule().await?;
    Ok(Json(json!({
        "success": true,
        "source": state.schedule_source(),
        "count": entries.len(),
        "flights": entries,
        "upcoming": state.upcoming_triggers().await,
    })))
}

async fn flight_data_json(State(state): State<AppState>) -> PanelResult<Json<Value>> {
    Ok(Json(json!(state.fetch_schedule().await?)))
}

async fn live_channel(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| relay_to_socket(socket, state))
}

/// Push a snapshot, then every relay event, until either side goes away.
async fn relay_to_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut incoming) = socket.split();
    let (observer, mut events) = state.relay().subscribe().await;

    let mut snapshot = json!(state.snapshot().await);
    snapshot["type"] = json!("snapshot");

    if sink
        .send(Message::Text(snapshot.to_string().into()))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(error = %e, "cannot serialize relay event");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                frame = incoming.next() => match frame {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        }
    }

    debug!(observer = %observer, "live channel closed");
    state.relay().unsubscribe(observer).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::patcher::{ConfigPatcher, StagedIdentity};
    use crate::relay::{LogLevel, LogRelay};
    use crate::runner::{Invocation, ProcessRunner, RunOutcome};
    use crate::schedule::{FeedEntry, StaticScheduleSource};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    struct AcceptAll;

    #[async_trait]
    impl ConfigPatcher for AcceptAll {
        async fn apply(&self, _identity: &StagedIdentity) -> PanelResult<()> {
            Ok(())
        }
    }

    struct EchoRunner;

    #[async_trait]
    impl ProcessRunner for EchoRunner {
        async fn run(&self, invocation: Invocation, relay: &LogRelay) -> RunOutcome {
            let line = format!("attached {}", invocation.session);
            relay
                .process_output(LogLevel::Info, &invocation.session, line.clone())
                .await;
            RunOutcome {
                success: true,
                exit_code: Some(0),
                captured_output: format!("{line}\n"),
                ..Default::default()
            }
        }
    }

    fn app() -> Router {
        let orchestrator = SessionOrchestrator::new(
            OrchestratorSettings::default(),
            Arc::new(AcceptAll),
            Arc::new(EchoRunner),
            Arc::new(LogRelay::default()),
            Arc::new(StaticScheduleSource::new(vec![FeedEntry {
                arrival: "2099-01-01T08:00:00Z".into(),
                session_size: Some(2),
                flight: Some("LH2099".into()),
            }])),
        );
        create_router(orchestrator)
    }

    async fn send(app: Router, req: HttpRequest<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::post(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let req = HttpRequest::get("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn control_page_is_served() {
        let req = HttpRequest::get("/").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("<html"));
    }

    #[tokio::test]
    async fn run_returns_output_and_summary() {
        let req = post_json(
            "/run",
            json!({
                "countryCode": "999",
                "networkCode": "70",
                "baseIdentifier": "0000000100",
                "sessionCount": 2
            }),
        );
        let (status, body) = send(app(), req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["output"], "attached ue-0000000101\n");
        assert_eq!(body["summary"]["sessionsRun"], 2);
        assert_eq!(body["summary"]["nextIdentifier"], "0000000102");
    }

    #[tokio::test]
    async fn start_accepts_form_bodies() {
        let app = app();
        let req = HttpRequest::post("/api/sessions/start")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                "countryCode=001&networkCode=01&baseIdentifier=0000000001&sessionCount=1&uesPerSession=",
            ))
            .unwrap();
        let (status, body) = send(app, req).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["success"], true);
        assert_eq!(body["state"]["phase"], "running");
        assert_eq!(body["state"]["totalCount"], 1);
    }

    #[tokio::test]
    async fn invalid_start_is_a_validation_error() {
        let req = post_json(
            "/api/sessions/start",
            json!({
                "countryCode": "001",
                "networkCode": "01",
                "baseIdentifier": "0000000001",
                "sessionCount": 0
            }),
        );
        let (status, body) = send(app(), req).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        assert_eq!(body["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let req = HttpRequest::post("/api/sessions/start")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{ nope"))
            .unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["kind"], "ValidationError");
    }

    #[tokio::test]
    async fn stop_when_idle_reports_not_stopped() {
        let req = HttpRequest::post("/api/sessions/stop")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["stopped"], false);
        assert_eq!(body["state"]["phase"], "idle");
    }

    #[tokio::test]
    async fn status_and_clear_logs() {
        let app = app();
        let req = post_json(
            "/run",
            json!({
                "countryCode": "001",
                "networkCode": "01",
                "baseIdentifier": "0000000001",
                "sessionCount": "1"
            }),
        );
        send(app.clone(), req).await;

        let status_req = || {
            HttpRequest::get("/api/sessions/status")
                .body(Body::empty())
                .unwrap()
        };
        let (_, before) = send(app.clone(), status_req()).await;
        assert!(!before["sessionLog"].as_array().unwrap().is_empty());
        assert_eq!(before["processOutputLog"].as_array().unwrap().len(), 1);

        let clear = HttpRequest::post("/api/logs/clear")
            .body(Body::empty())
            .unwrap();
        let (_, cleared) = send(app.clone(), clear).await;
        assert_eq!(cleared["success"], true);

        let (_, after) = send(app, status_req()).await;
        assert!(after["sessionLog"].as_array().unwrap().is_empty());
        assert!(after["processOutputLog"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn flight_data_lists_schedule() {
        let req = HttpRequest::get("/api/flight-data")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["flights"][0]["label"], "LH2099");
        assert!(body["upcoming"].as_array().unwrap().is_empty());

        let req = HttpRequest::get("/api/flight-data-json")
            .body(Body::empty())
            .unwrap();
        let (_, body) = send(app(), req).await;
        assert_eq!(body[0]["sessionSize"], 2);
    }
}
