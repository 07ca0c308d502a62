use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    serve, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::{ChatHandler, Recommendation};
use crate::config::Settings;
use crate::conversation::Message;
use crate::error::Error;
use crate::oracle::Oracle;
use crate::pricing::{PricingEngine, PricingInputs, PricingResult};

type Session = Arc<Mutex<ChatHandler>>;

struct SessionEntry {
    handler: Session,
    last_used: Instant,
}

// Shared application state. Each session owns its own ChatHandler; only the
// stateless engine and the oracle client are shared.
#[derive(Clone)]
pub struct AppState {
    engine: PricingEngine,
    oracle: Arc<dyn Oracle>,
    settings: Arc<Settings>,
    sessions: Arc<RwLock<HashMap<Uuid, SessionEntry>>>,
    idle_timeout: Duration,
}

impl AppState {
    pub fn new(oracle: Arc<dyn Oracle>, settings: Settings) -> Result<Self, Error> {
        Ok(Self {
            engine: PricingEngine::new(settings.pricing)?,
            oracle,
            idle_timeout: settings.server.session_idle_timeout(),
            settings: Arc::new(settings),
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn open_session(&self) -> Result<Uuid, Error> {
        let handler = ChatHandler::new(self.oracle.clone(), &self.settings)?;
        let id = Uuid::new_v4();
        let entry = SessionEntry {
            handler: Arc::new(Mutex::new(handler)),
            last_used: Instant::now(),
        };
        self.sessions.write().await.insert(id, entry);
        Ok(id)
    }

    /// Looks up a session and marks it as used.
    async fn session(&self, id: Uuid) -> Result<Session, ApiError> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(&id).ok_or(ApiError::SessionNotFound(id))?;
        entry.last_used = Instant::now();
        Ok(entry.handler.clone())
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Drops sessions idle for longer than the configured timeout. Sessions
    /// with a request in flight are kept. Returns how many were dropped.
    pub async fn expire_idle_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let in_use = Arc::strong_count(&entry.handler) > 1;
            let keep = in_use || entry.last_used.elapsed() < self.idle_timeout;
            if !keep {
                info!(session_id = %id, "Expired idle chat session");
            }
            keep
        });
        before - sessions.len()
    }
}

async fn sweep_idle_sessions(state: AppState) {
    let period = (state.idle_timeout / 4).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the first tick completes immediately
    loop {
        ticker.tick().await;
        let expired = state.expire_idle_sessions().await;
        if expired > 0 {
            debug!(expired, "Swept idle sessions");
        }
    }
}

#[derive(Debug)]
enum ApiError {
    SessionNotFound(Uuid),
    BadRequest(JsonRejection),
    Domain(Error),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection)
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Domain(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::SessionNotFound(id) => (
                StatusCode::NOT_FOUND,
                ErrorBody {
                    error: "session_not_found",
                    message: format!("no session with id {}", id),
                },
            ),
            ApiError::BadRequest(rejection) => {
                warn!(error = %rejection.body_text(), "Malformed request body");
                (
                    rejection.status(),
                    ErrorBody {
                        error: "invalid_request",
                        message: rejection.body_text(),
                    },
                )
            }
            ApiError::Domain(err) => {
                let status = match &err {
                    Error::InvalidInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    Error::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    Error::UpstreamAuthError(_) | Error::MalformedResponse(_) => {
                        StatusCode::BAD_GATEWAY
                    }
                    Error::Config(_) | Error::Template(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status.is_server_error() {
                    error!(error = %err, "Request failed");
                } else {
                    warn!(error = %err, "Request rejected");
                }
                (
                    status,
                    ErrorBody {
                        error: err.kind(),
                        message: err.to_string(),
                    },
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Deserialize)]
struct SendMessageRequest {
    message: String,
}

#[derive(Serialize)]
struct SendMessageResponse {
    reply: String,
}

#[derive(Serialize)]
struct SessionCreated {
    session_id: Uuid,
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// Manual form entry: no conversation involved.
async fn price_handler(
    State(state): State<AppState>,
    payload: Result<Json<PricingInputs>, JsonRejection>,
) -> Result<Json<PricingResult>, ApiError> {
    let Json(inputs) = payload?;
    Ok(Json(state.engine.compute(&inputs)?))
}

async fn create_session_handler(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionCreated>), ApiError> {
    let id = state.open_session().await?;
    info!(session_id = %id, "Created chat session");
    Ok((StatusCode::CREATED, Json(SessionCreated { session_id: id })))
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    match state.sessions.write().await.remove(&id) {
        Some(_) => {
            info!(session_id = %id, "Closed chat session");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::SessionNotFound(id)),
    }
}

async fn reset_session_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let session = state.session(id).await?;
    session.lock().await.reset();
    Ok(StatusCode::NO_CONTENT)
}

async fn send_message_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    payload: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    let Json(request) = payload?;
    let session = state.session(id).await?;
    let reply = session.lock().await.send_message(&request.message).await?;
    Ok(Json(SendMessageResponse { reply }))
}

async fn history_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, ApiError> {
    let session = state.session(id).await?;
    let history = session.lock().await.history().to_vec();
    Ok(Json(history))
}

async fn recommendations_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Recommendation>, ApiError> {
    let session = state.session(id).await?;
    let recommendation = session.lock().await.get_recommendations().await?;
    Ok(Json(recommendation))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/price", post(price_handler))
        .route("/api/sessions", post(create_session_handler))
        .route("/api/sessions/:id", axum::routing::delete(delete_session_handler))
        .route("/api/sessions/:id/reset", post(reset_session_handler))
        .route(
            "/api/sessions/:id/messages",
            post(send_message_handler).get(history_handler),
        )
        .route("/api/sessions/:id/recommendations", get(recommendations_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http()) // Add request logging
}

pub async fn start_web_server(port: u16, state: AppState) -> anyhow::Result<()> {
    let sweeper_state = state.clone();
    let app = router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    // Bind using tokio::net::TcpListener
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    let sweeper = tokio::spawn(sweep_idle_sessions(sweeper_state));
    let served = serve(listener, app.into_make_service())
        .await
        .context("Web server failed");
    sweeper.abort();
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::ScriptedOracle;

    fn state(idle_secs: u64) -> AppState {
        let mut settings = Settings::default();
        settings.server.session_idle_timeout_secs = idle_secs;
        AppState::new(Arc::new(ScriptedOracle::new()), settings).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let state = state(60);
        let stale = state.open_session().await.unwrap();
        let fresh = state.open_session().await.unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        state.session(fresh).await.unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(state.expire_idle_sessions().await, 1);
        assert_eq!(state.session_count().await, 1);
        assert!(matches!(
            state.session(stale).await,
            Err(ApiError::SessionNotFound(_))
        ));
        assert!(state.session(fresh).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_in_use_is_not_expired() {
        let state = state(10);
        let id = state.open_session().await.unwrap();
        let held = state.session(id).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(state.expire_idle_sessions().await, 0);

        drop(held);
        assert_eq!(state.expire_idle_sessions().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_idle_sessions() {
        let state = state(4);
        state.open_session().await.unwrap();

        let sweeper = tokio::spawn(sweep_idle_sessions(state.clone()));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(state.session_count().await, 0);
        sweeper.abort();
    }

    #[test]
    fn test_state_rejects_invalid_weights() {
        let mut settings = Settings::default();
        settings.pricing.uniqueness_weight = 0.4;
        let result = AppState::new(Arc::new(ScriptedOracle::new()), settings);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
