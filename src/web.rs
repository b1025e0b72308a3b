use crate::{
    app::App,
    catalog::{CatalogError, CatalogRecord, VendorSummary},
    fetch::FetchError,
    semantic::{BuildError, BuildSummary, ErrorClass, EmbeddingError, RankedResult, SearchError, SkippedImage},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    app: App,
}

pub fn router(app: App) -> Router {
    let shared_state = Arc::new(SharedState { app });

    Router::new()
        .route("/search", post(search_image))
        .route("/search/text", post(search_text))
        .route("/recommend/board", post(recommend_board))
        .route("/brands", get(brands))
        .route("/brands/:name", get(brand_products))
        .route("/api/index", get(index_info))
        .route("/api/index/rebuild", post(rebuild_index))
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

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

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

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::warn!("shutting down");
}

async fn start_app(app: App, listen: String) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    log::info!("listening on {listen}");

    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn start_daemon(app: App, listen: String) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    // the blocking http client inside `app` must not be dropped on a runtime thread
    let result = runtime.block_on(start_app(app.clone(), listen));
    drop(runtime);
    drop(app);
    result
}

#[derive(Debug)]
enum ApiError {
    Search(SearchError),
    Build(BuildError),
    Catalog(CatalogError),
    NotFound(String),
}

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        Self::Search(err)
    }
}

impl From<BuildError> for ApiError {
    fn from(err: BuildError) -> Self {
        Self::Build(err)
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        Self::Catalog(err)
    }
}

#[derive(Debug)]
struct HttpError(ApiError);

impl HttpError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ApiError::Search(err) => match err.class() {
                ErrorClass::Input => match err {
                    SearchError::NoEmbeddableInput { .. } | SearchError::Degenerate(_) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    _ => StatusCode::BAD_REQUEST,
                },
                ErrorClass::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
                ErrorClass::Integrity => StatusCode::INTERNAL_SERVER_ERROR,
                ErrorClass::Upstream => match err {
                    SearchError::Fetch(FetchError::Timeout)
                    | SearchError::Embedding(EmbeddingError::Timeout(_))
                    | SearchError::Catalog(CatalogError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
                    _ => StatusCode::BAD_GATEWAY,
                },
            },
            ApiError::Build(BuildError::AlreadyRunning) => StatusCode::CONFLICT,
            ApiError::Build(BuildError::NothingEmbedded { .. }) => StatusCode::BAD_GATEWAY,
            ApiError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Catalog(CatalogError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Catalog(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }

    fn message(&self) -> String {
        match &self.0 {
            ApiError::Search(err) => err.to_string(),
            ApiError::Build(err) => err.to_string(),
            ApiError::Catalog(err) => err.to_string(),
            ApiError::NotFound(what) => format!("{what} not found"),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("{self:?}");
        } else {
            log::debug!("{self:?}");
        }

        (status, Json(json!({"error": self.message()}))).into_response()
    }
}

impl<E> From<E> for HttpError
where
    E: Into<ApiError>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSearchRequest {
    pub image_url: String,
    pub k: Option<usize>,
}

async fn search_image(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<ImageSearchRequest>,
) -> Result<Json<Vec<RankedResult>>, HttpError> {
    log::debug!("payload: {payload:?}");

    let orchestrator = state.app.orchestrator().clone();

    tokio::task::block_in_place(move || {
        orchestrator
            .search_by_image(&payload.image_url, payload.k)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextSearchRequest {
    pub query: String,
    pub k: Option<usize>,
}

async fn search_text(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<TextSearchRequest>,
) -> Result<Json<Vec<RankedResult>>, HttpError> {
    log::debug!("payload: {payload:?}");

    let orchestrator = state.app.orchestrator().clone();

    tokio::task::block_in_place(move || {
        orchestrator
            .search_by_text(&payload.query, payload.k)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoardRequest {
    pub image_urls: Vec<String>,
    pub k: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BoardResponse {
    pub message: String,
    pub attempted: usize,
    pub embedded: usize,
    pub skipped: Vec<SkippedImage>,
    pub results: Vec<RankedResult>,
}

async fn recommend_board(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<BoardRequest>,
) -> Result<Json<BoardResponse>, HttpError> {
    log::debug!("payload: {payload:?}");

    let orchestrator = state.app.orchestrator().clone();

    tokio::task::block_in_place(move || {
        let board = orchestrator.search_by_board(&payload.image_urls, payload.k)?;

        Ok(BoardResponse {
            message: format!("Analyzed {} images from your board", board.embedded),
            attempted: board.attempted,
            embedded: board.embedded,
            skipped: board.skipped,
            results: board.results,
        }
        .into())
    })
}

async fn brands(
    State(state): State<Arc<SharedState>>,
) -> Result<Json<Vec<VendorSummary>>, HttpError> {
    let catalog = state.app.orchestrator().catalog().clone();

    tokio::task::block_in_place(move || catalog.vendors().map(Into::into).map_err(Into::into))
}

async fn brand_products(
    State(state): State<Arc<SharedState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<CatalogRecord>>, HttpError> {
    let catalog = state.app.orchestrator().catalog().clone();

    tokio::task::block_in_place(move || {
        let records = catalog.by_vendor(&name)?;
        if records.is_empty() {
            return Err(HttpError(ApiError::NotFound(format!("brand '{name}'"))));
        }
        Ok(records.into())
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub loaded: bool,
    pub build_tag: Option<String>,
    pub built_at: Option<String>,
    pub entries: usize,
    pub dimensions: usize,
    pub model: String,
    pub building: bool,
    pub last_build: Option<BuildSummary>,
}

async fn index_info(State(state): State<Arc<SharedState>>) -> Json<IndexInfo> {
    let app = &state.app;
    let manager = app.manager();
    let snapshot = manager.snapshots().current();

    IndexInfo {
        loaded: snapshot.is_some(),
        build_tag: snapshot.as_ref().map(|s| s.build_tag.to_string()),
        built_at: snapshot.as_ref().map(|s| s.build_tag.built_at().to_rfc3339()),
        entries: snapshot.as_ref().map_or(0, |s| s.len()),
        dimensions: app.config().embedding.dimensions,
        model: app.config().embedding.model.clone(),
        building: manager.is_building(),
        last_build: manager.last_build(),
    }
    .into()
}

async fn rebuild_index(
    State(state): State<Arc<SharedState>>,
) -> Result<(StatusCode, Json<serde_json::Value>), HttpError> {
    state.app.manager().spawn_rebuild()?;

    Ok((StatusCode::ACCEPTED, Json(json!({"status": "rebuilding"}))))
}
