// LEI Explorer - Web Server
// REST API with Axum over the matching and hierarchy engines

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lei_explorer::{
    is_lei, lei_key, parse_entity_list, registry, to_csv_string, write_hierarchy_csv,
    write_match_csv, write_resolution_csv, AppConfig, ExpandOutcome,
    HierarchyLoader, LeiRegistry, LoadOutcome, MatchRanker, NodePath,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    registry: Arc<dyn LeiRegistry>,
    ranker: Arc<MatchRanker>,
    loader: HierarchyLoader,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: (),
            error: Some(message.into()),
        }
    }
}

fn fail(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ApiResponse::failure(message))).into_response()
}

fn csv_download(filename: &str, rendered: Result<String>) -> Response {
    match rendered {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", filename),
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, filename, "CSV export failed");
            fail(StatusCode::INTERNAL_SERVER_ERROR, "CSV export failed")
        }
    }
}

/// Path segments arrive percent-encoded from some clients.
fn decode_lei(raw: &str) -> String {
    let decoded = urlencoding::decode(raw)
        .unwrap_or_else(|_| raw.into())
        .into_owned();
    lei_key(&decoded)
}

#[derive(Deserialize)]
struct MatchQuery {
    q: String,
}

/// Body for batch matching: an explicit list, free text (newline or comma
/// separated), or both.
#[derive(Deserialize)]
struct BatchRequest {
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    text: Option<String>,
}

impl BatchRequest {
    fn queries(self) -> Vec<String> {
        let mut queries: Vec<String> = self
            .entities
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if let Some(text) = self.text {
            queries.extend(parse_entity_list(&text));
        }
        queries
    }
}

#[derive(Deserialize)]
struct ViewQuery {
    /// Comma-separated LEIs the client has expanded
    #[serde(default)]
    expanded: String,
}

/// One visible row of the tree view
#[derive(Serialize)]
struct ViewRow {
    path: String,
    depth: usize,
    lei: String,
    legal_name: String,
    status: String,
    jurisdiction: Option<String>,
    fetched: bool,
    child_count: Option<u64>,
    expandable: bool,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/lei/:lei - Single registry record
async fn get_lei(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let lei = decode_lei(&raw);
    if !is_lei(&lei) {
        return fail(StatusCode::BAD_REQUEST, "Invalid LEI format");
    }

    match state.registry.get_entity(&lei).await {
        Ok(Some(entity)) => (StatusCode::OK, Json(ApiResponse::ok(entity))).into_response(),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("LEI {} not found", lei)),
        Err(e) => {
            error!(lei = %lei, error = %e, "Registry lookup failed");
            fail(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// GET /api/lei/:lei/details - Full company profile
async fn get_lei_details(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let lei = decode_lei(&raw);
    if !is_lei(&lei) {
        return fail(StatusCode::BAD_REQUEST, "Invalid LEI format");
    }

    match state.registry.get_entity_details(&lei).await {
        Ok(Some(details)) => (StatusCode::OK, Json(ApiResponse::ok(details))).into_response(),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("LEI {} not found", lei)),
        Err(e) => {
            error!(lei = %lei, error = %e, "Details lookup failed");
            fail(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

/// GET /api/match?q=... - Ranked matches for one name
async fn match_one(State(state): State<AppState>, Query(query): Query<MatchQuery>) -> Response {
    if query.q.trim().is_empty() {
        return fail(StatusCode::BAD_REQUEST, "Query must not be empty");
    }
    let result = state.ranker.search_and_rank(query.q.trim()).await;
    (StatusCode::OK, Json(ApiResponse::ok(result))).into_response()
}

/// POST /api/match/batch - Ranked matches for many names
async fn match_batch(State(state): State<AppState>, Json(body): Json<BatchRequest>) -> Response {
    let queries = body.queries();
    if queries.is_empty() {
        return fail(StatusCode::BAD_REQUEST, "No entity names supplied");
    }
    let results = state.ranker.match_batch(&queries).await;
    (StatusCode::OK, Json(ApiResponse::ok(results))).into_response()
}

/// GET /api/match/export.csv?q=a,b - Match rows as CSV
async fn export_matches(State(state): State<AppState>, Query(query): Query<MatchQuery>) -> Response {
    let queries = parse_entity_list(&query.q);
    let results = state.ranker.match_batch(&queries).await;
    csv_download("lei_matches.csv", to_csv_string(|buf| write_match_csv(buf, &results)))
}

/// GET /api/resolve/export.csv?q=a,b - Best match and ultimate parent per name
async fn export_resolutions(State(state): State<AppState>, Query(query): Query<MatchQuery>) -> Response {
    let queries = parse_entity_list(&query.q);
    let resolutions = state.ranker.resolve_entities(&queries).await;
    csv_download(
        "entity_resolution.csv",
        to_csv_string(|buf| write_resolution_csv(buf, &resolutions)),
    )
}

/// POST /api/hierarchy/load/:lei - Start a new hierarchy run
async fn load_hierarchy(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let lei = decode_lei(&raw);
    if !is_lei(&lei) {
        return fail(StatusCode::BAD_REQUEST, "Invalid LEI format");
    }

    match state.loader.load_hierarchy(&lei).await {
        LoadOutcome::NoData => fail(StatusCode::NOT_FOUND, format!("No hierarchy data for {}", lei)),
        outcome => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
    }
}

/// GET /api/hierarchy - Current tree snapshot
async fn get_hierarchy(State(state): State<AppState>) -> Response {
    match state.loader.snapshot() {
        Some(tree) => (StatusCode::OK, Json(ApiResponse::ok(tree))).into_response(),
        None => fail(StatusCode::NOT_FOUND, "No hierarchy loaded"),
    }
}

/// GET /api/hierarchy/status - Load progress
async fn hierarchy_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::ok(state.loader.status()))
}

/// GET /api/hierarchy/view?expanded=A,B - Visible rows with expand affordances
async fn hierarchy_view(State(state): State<AppState>, Query(query): Query<ViewQuery>) -> Response {
    let expanded: HashSet<String> = query
        .expanded
        .split(',')
        .map(lei_key)
        .filter(|lei| !lei.is_empty())
        .collect();

    state.loader.prefetch_visible(&expanded).await;

    let Some(tree) = state.loader.snapshot() else {
        return fail(StatusCode::NOT_FOUND, "No hierarchy loaded");
    };

    let rows: Vec<ViewRow> = tree
        .visible_nodes(&expanded)
        .into_iter()
        .map(|(path, node)| ViewRow {
            path: path.to_string(),
            depth: path.depth(),
            lei: node.lei().to_string(),
            legal_name: node.entity.display_name().to_string(),
            status: node.entity.status.as_str().to_string(),
            jurisdiction: node.entity.jurisdiction.clone(),
            fetched: node.is_fetched(),
            child_count: if node.is_fetched() {
                Some(node.children().len() as u64)
            } else {
                state.loader.known_child_count(node.lei())
            },
            expandable: state.loader.shows_expand_affordance(node.lei()),
        })
        .collect();

    (StatusCode::OK, Json(ApiResponse::ok(rows))).into_response()
}

fn expand_response(outcome: ExpandOutcome) -> Response {
    match outcome {
        ExpandOutcome::NotFound => fail(StatusCode::NOT_FOUND, "Node not in the current hierarchy"),
        ExpandOutcome::Failed(message) => fail(StatusCode::BAD_GATEWAY, message),
        outcome => (StatusCode::OK, Json(ApiResponse::ok(outcome))).into_response(),
    }
}

/// POST /api/hierarchy/expand/:lei - Fetch children of the first node with this LEI
async fn expand_lei(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let lei = decode_lei(&raw);
    expand_response(state.loader.expand_lei(&lei).await)
}

/// POST /api/hierarchy/expand-path/:path - Fetch children of the node at "0.2.1"
async fn expand_path(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    match NodePath::parse(&raw) {
        Some(path) => expand_response(state.loader.expand(&path).await),
        None => fail(StatusCode::BAD_REQUEST, "Invalid node path"),
    }
}

/// GET /api/hierarchy/analysis - Structural and risk metrics
async fn hierarchy_analysis(State(state): State<AppState>) -> Response {
    match state.loader.analyze() {
        Some(analysis) => (StatusCode::OK, Json(ApiResponse::ok(analysis))).into_response(),
        None => fail(StatusCode::NOT_FOUND, "No hierarchy loaded"),
    }
}

/// POST /api/hierarchy/shape - Refresh registry totals for the current root
async fn hierarchy_shape(State(state): State<AppState>) -> Response {
    match state.loader.refresh_shape().await {
        Some(shape) => (StatusCode::OK, Json(ApiResponse::ok(shape))).into_response(),
        None => fail(StatusCode::BAD_GATEWAY, "Hierarchy shape unavailable"),
    }
}

/// GET /api/hierarchy/export.csv - Loaded tree as CSV
async fn export_hierarchy(State(state): State<AppState>) -> Response {
    let Some(tree) = state.loader.snapshot() else {
        return fail(StatusCode::NOT_FOUND, "No hierarchy loaded");
    };
    let filename = format!("hierarchy_{}.csv", tree.lei());
    csv_download(&filename, to_csv_string(|buf| write_hierarchy_csv(buf, &tree)))
}

/// GET /api/entities/:lei/parent - Ultimate parent of an entity
async fn get_ultimate_parent(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let lei = decode_lei(&raw);
    if !is_lei(&lei) {
        return fail(StatusCode::BAD_REQUEST, "Invalid LEI format");
    }
    match state.registry.get_ultimate_parent(&lei).await {
        Ok(Some(parent)) => (StatusCode::OK, Json(ApiResponse::ok(parent))).into_response(),
        Ok(None) => fail(StatusCode::NOT_FOUND, format!("No ultimate parent for {}", lei)),
        Err(e) => fail(StatusCode::BAD_GATEWAY, e.to_string()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lei_explorer=info,lei_server=info,tower_http=info")),
        )
        .init();

    let config = AppConfig::load()?;
    let registry = registry::from_config(&config)?;

    // Create shared state
    let state = AppState {
        registry: registry.clone(),
        ranker: Arc::new(MatchRanker::from_config(registry.clone(), &config)),
        loader: HierarchyLoader::from_config(registry, &config),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/lei/:lei", get(get_lei))
        .route("/lei/:lei/details", get(get_lei_details))
        .route("/entities/:lei/parent", get(get_ultimate_parent))
        .route("/match", get(match_one))
        .route("/match/batch", post(match_batch))
        .route("/match/export.csv", get(export_matches))
        .route("/resolve/export.csv", get(export_resolutions))
        .route("/hierarchy", get(get_hierarchy))
        .route("/hierarchy/load/:lei", post(load_hierarchy))
        .route("/hierarchy/status", get(hierarchy_status))
        .route("/hierarchy/view", get(hierarchy_view))
        .route("/hierarchy/expand/:lei", post(expand_lei))
        .route("/hierarchy/expand-path/:path", post(expand_path))
        .route("/hierarchy/analysis", get(hierarchy_analysis))
        .route("/hierarchy/shape", post(hierarchy_shape))
        .route("/hierarchy/export.csv", get(export_hierarchy))
        .with_state(state);

    // Build main router
    let app = Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    );

    // Start server
    let addr = config.server.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "LEI API listening");
    println!("\n🚀 Server running on http://{}", addr);
    println!("   API: http://{}/api/match?q=Acme", addr);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("Server failed")?;
    Ok(())
}
