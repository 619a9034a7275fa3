use crate::{
    config::SearchConfig,
    semantic::{IndexStatus, QueryResult, QueryService, SearchError},
};
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
struct SharedState {
    service: Arc<QueryService>,
    default_k: usize,
    max_k: usize,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                log::error!("failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::warn!("shutting down");
}

fn router(service: Arc<QueryService>, search: &SearchConfig) -> Router {
    let shared_state = Arc::new(SharedState {
        service,
        default_k: search.default_k,
        max_k: search.max_k,
    });

    Router::new()
        .route("/", get(index_page))
        .route("/api/search", post(search_handler))
        .route("/api/status", get(status))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(shared_state)
}

async fn start_app(service: Arc<QueryService>, search: SearchConfig, listen: String) -> anyhow::Result<()> {
    let app = router(service, &search);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Serve the search UI and API until Ctrl-C or SIGTERM.
pub fn start_daemon(service: QueryService, search: &SearchConfig, listen: &str) -> anyhow::Result<()> {
    let service = Arc::new(service);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let result = runtime.block_on(start_app(service.clone(), search.clone(), listen.to_string()));

    // the blocking HTTP client inside the embedder must not be dropped on a
    // runtime worker
    drop(runtime);
    drop(service);

    result
}

#[derive(Debug)]
enum HttpError {
    Search(SearchError),
    /// Body that does not deserialize into the request type
    Payload(JsonRejection),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            HttpError::Payload(rejection) => {
                log::debug!("{self:?}");
                (rejection.status(), rejection.body_text())
            }
            HttpError::Search(err) => {
                let status = match err {
                    SearchError::EmptyQuery | SearchError::InvalidK => StatusCode::BAD_REQUEST,
                    SearchError::Unavailable(_) => {
                        log::warn!("{self:?}");
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => {
                        log::error!("{self:?}");
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };

        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<SearchError> for HttpError {
    fn from(err: SearchError) -> Self {
        Self::Search(err)
    }
}

impl From<JsonRejection> for HttpError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Payload(rejection)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    /// Number of results; the configured default when omitted
    #[serde(default)]
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub k: usize,
    pub results: Vec<QueryResult>,
}

async fn index_page(State(state): State<Arc<SharedState>>) -> Html<String> {
    Html(
        INDEX_HTML
            .replace("{{DEFAULT_K}}", &state.default_k.to_string())
            .replace("{{MAX_K}}", &state.max_k.to_string()),
    )
}

async fn search_handler(
    State(state): State<Arc<SharedState>>,
    payload: Result<Json<SearchRequest>, JsonRejection>,
) -> Result<Json<SearchResponse>, HttpError> {
    let Json(payload) = payload?;
    log::debug!("payload: {payload:?}");

    let k = payload.k.unwrap_or(state.default_k);
    let service = state.service.clone();

    tokio::task::block_in_place(move || {
        let results = service.search(&payload.query, k)?;
        Ok(Json(SearchResponse {
            query: payload.query,
            k: k.min(state.max_k),
            results,
        }))
    })
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub index: IndexStatus,
    pub default_k: usize,
    pub max_k: usize,
}

async fn status(State(state): State<Arc<SharedState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        index: state.service.status(),
        default_k: state.default_k,
        max_k: state.max_k,
    })
}
