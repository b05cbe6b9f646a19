//! HTTP API for the web coordinator
//!
//! Read-only view of the speech loop's session, plus text query and
//! text-to-speech endpoints that never touch turn state.

pub mod health;
pub mod query;
pub mod session;
pub mod speech;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::agent::ResponseGenerator;
use crate::config::Config;
use crate::db::DbPool;
use crate::knowledge::Retriever;
use crate::session::SessionView;
use crate::voice::Synthesizer;

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<dyn SessionView>,
    /// Knowledge store, for readiness checks
    pub db: Option<DbPool>,
    pub retriever: Option<Arc<dyn Retriever>>,
    pub generator: Option<Arc<dyn ResponseGenerator>>,
    pub retrieval_k: usize,
    pub retrieval_timeout: Duration,
    pub llm_deadline: Duration,
    pub synthesizer: Option<Arc<dyn Synthesizer>>,
    /// Sample rate of synthesized audio
    pub playback_rate: u32,
    pub tts_deadline: Duration,
    /// Poll interval for the session event stream
    pub event_interval: Duration,
    /// Sessions older than this fail readiness
    pub stale_after: Duration,
}

impl ApiState {
    /// State with only a session view; query is disabled
    #[must_use]
    pub fn new(session: Arc<dyn SessionView>) -> Self {
        let defaults = Config::default();
        Self {
            session,
            db: None,
            retriever: None,
            generator: None,
            retrieval_k: defaults.retrieval.k,
            retrieval_timeout: defaults.retrieval.timeout,
            llm_deadline: defaults.turn.llm_deadline,
            synthesizer: None,
            playback_rate: defaults.audio.playback_sample_rate,
            tts_deadline: defaults.turn.tts_deadline,
            event_interval: Duration::from_millis(200),
            stale_after: defaults.api_server.stale_after,
        }
    }
}

/// JSON error body: `{"error": {"code", "message"}}`
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// An error a handler can return directly
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<crate::Error> for ApiError {
    fn from(e: crate::Error) -> Self {
        use crate::error::ErrorKind;

        let (status, code) = match e.kind() {
            ErrorKind::Input => (StatusCode::BAD_REQUEST, "invalid_input"),
            ErrorKind::Provider => (StatusCode::BAD_GATEWAY, "provider_error"),
            ErrorKind::Storage => (StatusCode::SERVICE_UNAVAILABLE, "storage_error"),
            ErrorKind::Device | ErrorKind::Config => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };
        Self::new(status, code, e.to_string())
    }
}

/// Build the full router for `state`
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(health::ready_router(state.clone()))
        .nest("/api/session", session::router(state.clone()))
        .nest("/api/query", query::router(state.clone()))
        .nest("/api/tts", speech::router(state))
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    state: ApiState,
    host: String,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServerBuilder {
    /// Create a builder serving `session` on `host:port`
    #[must_use]
    pub fn new(session: Arc<dyn SessionView>, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: ApiState::new(session),
            host: host.into(),
            port,
            static_dir: None,
        }
    }

    /// Take retrieval and deadline settings from `config`
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.state.retrieval_k = config.retrieval.k;
        self.state.retrieval_timeout = config.retrieval.timeout;
        self.state.llm_deadline = config.turn.llm_deadline;
        self.state.playback_rate = config.audio.playback_sample_rate;
        self.state.tts_deadline = config.turn.tts_deadline;
        self.state.stale_after = config.api_server.stale_after;
        self
    }

    /// Set the database pool used by readiness checks
    #[must_use]
    pub fn db(mut self, db: DbPool) -> Self {
        self.state.db = Some(db);
        self
    }

    /// Enable `POST /api/query`
    #[must_use]
    pub fn query(
        mut self,
        retriever: Arc<dyn Retriever>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        self.state.retriever = Some(retriever);
        self.state.generator = Some(generator);
        self
    }

    /// Enable `POST /api/tts`
    #[must_use]
    pub fn tts(mut self, synthesizer: Arc<dyn Synthesizer>) -> Self {
        self.state.synthesizer = Some(synthesizer);
        self
    }

    /// Set the static files directory for serving the web UI
    #[must_use]
    pub fn static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        ApiServer {
            state: Arc::new(self.state),
            host: self.host,
            port: self.port,
            static_dir: self.static_dir,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
    static_dir: Option<PathBuf>,
}

impl ApiServer {
    /// Router with all routes and layers
    #[must_use]
    pub fn router(&self) -> Router {
        let mut router = router(self.state.clone());

        if let Some(static_dir) = &self.static_dir {
            let index_file = static_dir.join("index.html");
            let serve_dir =
                ServeDir::new(static_dir).not_found_service(ServeFile::new(&index_file));

            router = router.fallback_service(serve_dir);
            tracing::info!(path = %static_dir.display(), "serving static files");
        }

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` fires
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: tokio_util::sync::CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(
        self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
