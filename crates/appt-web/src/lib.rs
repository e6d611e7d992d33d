//! Axum HTTP surface for the GHL appointment webhooks.

use std::sync::Arc;

use appt_reconcile::{ReconcileError, ReconcileOutcome, Reconciler};
use appt_storage::{connect_gateway, GatewayConfig};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "appt-web";

const CORS_ALLOW_HEADERS: [&str; 4] = ["authorization", "x-client-info", "apikey", "content-type"];

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
}

impl AppState {
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub port: u16,
}

impl WebConfig {
    pub fn from_env() -> Self {
        Self {
            bind_addr: std::env::var("APPT_WEB_BIND").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("APPT_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8000),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    reason: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
    #[serde(rename = "locationId", skip_serializing_if = "Option::is_none")]
    location_id: Option<String>,
    #[serde(rename = "contactId", skip_serializing_if = "Option::is_none")]
    contact_id: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/ghl-appointment-webhook",
            post(status_webhook_handler).options(preflight_handler),
        )
        .route(
            "/ghl-appointment-created",
            post(created_webhook_handler).options(preflight_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(Arc::new(state))
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers(CORS_ALLOW_HEADERS.map(HeaderName::from_static))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let gateway = connect_gateway(&GatewayConfig::from_env()?).await?;
    let state = AppState::new(Reconciler::new(gateway));
    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port)).await?;
    info!(addr = %listener.local_addr()?, "appointment webhook server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutdown signal received");
}

async fn health_handler() -> Json<JsonValue> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "appt-web",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn preflight_handler() -> StatusCode {
    StatusCode::OK
}

async fn status_webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => respond(state.reconciler.handle_status_event(&payload).await),
        Err(resp) => resp,
    }
}

async fn created_webhook_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    match parse_payload(&body) {
        Ok(payload) => respond(state.reconciler.handle_created_event(&payload).await),
        Err(resp) => resp,
    }
}

fn parse_payload(body: &[u8]) -> Result<JsonValue, Response> {
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(payload) => {
            debug!(%payload, "received appointment webhook");
            Ok(payload)
        }
        Err(err) => {
            warn!(error = %err, "rejecting webhook with invalid JSON body");
            Err(json_response(
                StatusCode::BAD_REQUEST,
                &ErrorBody {
                    error: "Invalid JSON body".to_string(),
                    reason: "invalid_body",
                    details: Some(err.to_string()),
                    location_id: None,
                    contact_id: None,
                },
            ))
        }
    }
}

fn respond(result: Result<ReconcileOutcome, ReconcileError>) -> Response {
    match result {
        Ok(outcome) => json_response(StatusCode::OK, &outcome),
        Err(err) => error_response(err),
    }
}

fn error_response(err: ReconcileError) -> Response {
    let status = if err.is_client_error() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    let mut body = ErrorBody {
        error: err.to_string(),
        reason: err.reason(),
        details: err.details(),
        location_id: None,
        contact_id: None,
    };
    if let ReconcileError::MissingRequiredAttribution {
        location_id,
        contact_id,
    } = err
    {
        body.location_id = location_id;
        body.contact_id = contact_id;
    }
    json_response(status, &body)
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response {
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use appt_core::{ExistingAppointment, OutcomeUpdate, PassiveUpsert, UpsertResult};
    use appt_storage::{AppointmentGateway, GatewayError, InMemoryGateway};
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    struct DownGateway;

    #[async_trait]
    impl AppointmentGateway for DownGateway {
        async fn lookup(&self, _id: &str) -> Result<Option<ExistingAppointment>, GatewayError> {
            Err(GatewayError::Decode("connection refused".into()))
        }

        async fn upsert_passive(&self, _req: &PassiveUpsert) -> Result<UpsertResult, GatewayError> {
            Err(GatewayError::Decode("connection refused".into()))
        }

        async fn update_outcome(&self, _update: &OutcomeUpdate) -> Result<(), GatewayError> {
            Err(GatewayError::Decode("connection refused".into()))
        }
    }

    fn memory_app() -> (Router, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let app = app(AppState::new(Reconciler::new(gateway.clone())));
        (app, gateway)
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> JsonValue {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn preflight_is_permissive_and_empty() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/ghl-appointment-webhook")
                    .header(header::ORIGIN, "https://app.gohighlevel.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "apikey, content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(resp.status().is_success());
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let allow_headers = resp.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS]
            .to_str()
            .unwrap()
            .to_string();
        assert!(allow_headers.contains("apikey"));
        assert!(allow_headers.contains("x-client-info"));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn bare_options_request_gets_empty_ok() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/ghl-appointment-created")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_identifier_is_bad_request() {
        let (app, gateway) = memory_app();
        let resp = app
            .oneshot(post_json("/ghl-appointment-webhook", r#"{"status":"confirmed"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Missing appointment ID");
        assert_eq!(body["reason"], "missing_identifier");
        assert!(gateway.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_json_is_bad_request() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(post_json("/ghl-appointment-webhook", "{not json"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["reason"], "invalid_body");
    }

    #[tokio::test]
    async fn missing_attribution_echoes_known_ids() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(post_json(
                "/ghl-appointment-created",
                r#"{"id":"a-1","locationId":"loc-1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = body_json(resp).await;
        assert_eq!(body["reason"], "missing_required_attribution");
        assert_eq!(body["locationId"], "loc-1");
        assert!(body.get("contactId").is_none());
    }

    #[tokio::test]
    async fn booking_then_outcome_round_trip() {
        let (app, gateway) = memory_app();
        let booking = r#"{"id":"a-2","locationId":"loc-1","contactId":"c-1","status":"confirmed"}"#;

        let resp = app
            .clone()
            .oneshot(post_json("/ghl-appointment-webhook", booking))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["action"], "inserted");
        assert_eq!(body["created_source"], "rep_manual");

        let resp = app
            .clone()
            .oneshot(post_json(
                "/ghl-appointment-webhook",
                r#"{"appointmentId":"a-2","appointmentStatus":"noshow"}"#,
            ))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["action"], "updated_outcome");
        assert_eq!(body["new_outcome"], "no_show");
        assert_eq!(body["created_source"], "rep_manual");

        let resp = app
            .oneshot(post_json("/ghl-appointment-created", booking))
            .await
            .unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["action"], "skipped_existing");

        let row = gateway.get("a-2").await.unwrap();
        assert_eq!(row.outcome_status.as_deref(), Some("no_show"));
        assert_eq!(gateway.len().await, 1);
    }

    #[tokio::test]
    async fn unknown_appointment_is_ok_and_skipped() {
        let (app, _) = memory_app();
        let resp = app
            .oneshot(post_json(
                "/ghl-appointment-webhook",
                r#"{"id":"ghost","status":"showed"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["action"], "skipped");
    }

    #[tokio::test]
    async fn storage_failure_is_internal_error_with_details() {
        let app = app(AppState::new(Reconciler::new(Arc::new(DownGateway))));
        let resp = app
            .oneshot(post_json(
                "/ghl-appointment-webhook",
                r#"{"id":"a-3","status":"confirmed"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Database lookup failed");
        assert!(body["details"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn postgrest_rejection_is_internal_error_with_details() {
        use appt_storage::{PostgrestConfig, PostgrestGateway};
        use std::time::Duration;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/appointments"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/rpc/upsert_appointment_from_webhook"))
            .respond_with(ResponseTemplate::new(404).set_body_string("PGRST202 function not found"))
            .mount(&server)
            .await;
        let gateway = PostgrestGateway::new(PostgrestConfig {
            base_url: server.uri(),
            service_key: "service-key".into(),
            timeout: Duration::from_secs(5),
        })
        .unwrap();

        let resp = app(AppState::new(Reconciler::new(Arc::new(gateway))))
            .oneshot(post_json(
                "/ghl-appointment-webhook",
                r#"{"id":"a-4","locationId":"loc-1","contactId":"c-1","status":"confirmed"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(resp).await;
        assert_eq!(body["error"], "Failed to insert appointment");
        assert_eq!(body["reason"], "write_failure");
        assert!(body["details"].as_str().unwrap().contains("PGRST202"));
    }
}
