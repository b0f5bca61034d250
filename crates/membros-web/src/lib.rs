//! JSON API over people, reports and lookups.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use membros_core::{value_text, Membro, MembroDraft, ReportDocument};
use membros_import::{ImportError, LookupBootstrapper};
use membros_storage::{
    self as storage, Bucket, FriendRef, Page, PageRequest, RecordQuery, StorageConfig,
    StorageError,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

pub const CRATE_NAME: &str = "membros-web";

const DEFAULT_PER_PAGE: u32 = 20;
const DEFAULT_LOOKUP_PER_PAGE: u32 = 50;
const DEFAULT_AGGREGATE_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
}

impl AppState {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation { field: String, message: String },
    #[error("record not found")]
    NotFound,
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Import(#[from] ImportError),
}

impl ApiError {
    fn validation(field: &str, message: impl Into<String>) -> Self {
        ApiError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    fn required(field: &str) -> Self {
        Self::validation(field, format!("The {field} field is required."))
    }

    /// Report a unique-constraint hit against `field`.
    fn duplicate_on(field: &str) -> impl FnOnce(StorageError) -> ApiError + '_ {
        move |err| match err {
            StorageError::Duplicate => ApiError::validation(field, "duplicate record"),
            other => ApiError::from(other),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UnknownField(name) => {
                ApiError::validation("field", format!("unknown field {name:?}"))
            }
            StorageError::Duplicate => ApiError::validation("data", "duplicate record"),
            other => ApiError::Storage(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation { field, message } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "message": message.clone(), "errors": { field: [message] } })),
            )
                .into_response(),
            ApiError::NotFound => (
                StatusCode::NOT_FOUND,
                Json(json!({ "message": "record not found" })),
            )
                .into_response(),
            ApiError::Storage(_) | ApiError::Import(_) => {
                error!(error = %self, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "message": "server error" })),
                )
                    .into_response()
            }
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize, Default)]
struct ListQuery {
    q: Option<String>,
    filters_json: Option<String>,
    filters: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

impl ListQuery {
    fn record_query(&self) -> RecordQuery {
        RecordQuery {
            q: self.q.clone(),
            filters: parse_filters(self.filters_json.as_deref().or(self.filters.as_deref())),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AggregateQuery {
    field: Option<String>,
    limit: Option<u32>,
    q: Option<String>,
    filters_json: Option<String>,
    filters: Option<String>,
}

impl AggregateQuery {
    fn field(&self) -> ApiResult<&str> {
        self.field
            .as_deref()
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| ApiError::required("field"))
    }

    fn record_query(&self) -> RecordQuery {
        RecordQuery {
            q: self.q.clone(),
            filters: parse_filters(self.filters_json.as_deref().or(self.filters.as_deref())),
        }
    }

    fn limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_AGGREGATE_LIMIT).clamp(1, PageRequest::MAX_PER_PAGE)
    }
}

#[derive(Debug, Deserialize, Default)]
struct LookupListQuery {
    #[serde(rename = "type")]
    lookup_type: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ReportBody {
    data: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct LookupBody {
    #[serde(rename = "type")]
    lookup_type: Option<String>,
    name: Option<String>,
}

/// Grouped counts for one field.
#[derive(Debug, Serialize)]
struct Aggregation {
    field: String,
    data: Vec<Bucket>,
}

#[derive(Debug, Serialize)]
struct MembroDetail {
    #[serde(flatten)]
    membro: Membro,
    friends: Vec<FriendRef>,
}

/// Decode a `{"field": ["v1", "v2"]}` filter object. Scalars count as a single
/// value; anything that is not a JSON object is ignored.
fn parse_filters(raw: Option<&str>) -> BTreeMap<String, Vec<String>> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return BTreeMap::new();
    };
    let Ok(decoded) = serde_json::from_str::<Map<String, JsonValue>>(raw) else {
        debug!(raw, "ignoring malformed filters");
        return BTreeMap::new();
    };
    decoded
        .into_iter()
        .map(|(field, values)| {
            let values = match values {
                JsonValue::Array(items) => items.iter().map(value_text).collect(),
                JsonValue::Null => Vec::new(),
                scalar => vec![value_text(&scalar)],
            };
            (field, values)
        })
        .collect()
}

fn required_text(value: Option<String>, field: &str) -> ApiResult<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::required(field))
}

fn validated_membro(draft: MembroDraft) -> ApiResult<MembroDraft> {
    let draft = draft.normalized();
    if draft.nome.is_empty() {
        return Err(ApiError::required("nome"));
    }
    if draft.quantidade_filhos.is_some_and(|n| n < 0) {
        return Err(ApiError::validation(
            "quantidade_filhos",
            "The quantidade_filhos field must be at least 0.",
        ));
    }
    Ok(draft)
}

fn report_document(body: ReportBody) -> ApiResult<ReportDocument> {
    match body.data {
        None | Some(JsonValue::Null) => Err(ApiError::required("data")),
        Some(value) => ReportDocument::from_value(value)
            .ok_or_else(|| ApiError::validation("data", "The data field must be an object.")),
    }
}

async fn acquire(state: &AppState) -> ApiResult<PoolConnection<Sqlite>> {
    state
        .pool
        .acquire()
        .await
        .map_err(|err| ApiError::Storage(StorageError::Database(err)))
}

pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/membros", get(list_membros_handler).post(create_membro_handler))
        .route("/membros/aggregate", get(aggregate_membros_handler))
        .route("/membros/stats", get(membro_stats_handler))
        .route("/membros/{id}", get(show_membro_handler).put(update_membro_handler))
        .route("/reports", get(list_reports_handler).post(create_report_handler))
        .route("/reports/aggregate", get(aggregate_reports_handler))
        .route(
            "/reports/{id}",
            get(show_report_handler)
                .put(update_report_handler)
                .delete(delete_report_handler),
        )
        .route("/lookups", get(list_lookups_handler).post(create_lookup_handler))
        .route("/lookups/bootstrap", post(bootstrap_lookups_handler))
        .route(
            "/lookups/{id}",
            put(update_lookup_handler).delete(delete_lookup_handler),
        );

    Router::new()
        .nest("/api", api)
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("MEMBROS_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let pool = storage::connect(&StorageConfig::from_env()).await?;
    serve(pool, port).await
}

pub async fn serve(pool: SqlitePool, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "api listening");
    axum::serve(listener, app(AppState::new(pool))).await?;
    Ok(())
}

async fn list_membros_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<Membro>>> {
    let mut conn = acquire(&state).await?;
    let page = PageRequest::new(query.page, query.per_page, DEFAULT_PER_PAGE);
    Ok(Json(storage::list_membros(&mut conn, &query.record_query(), page).await?))
}

async fn aggregate_membros_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregateQuery>,
) -> ApiResult<Json<Aggregation>> {
    let field = query.field()?;
    let mut conn = acquire(&state).await?;
    let data =
        storage::aggregate_membros(&mut conn, field, &query.record_query(), query.limit()).await?;
    Ok(Json(Aggregation {
        field: field.to_string(),
        data,
    }))
}

async fn membro_stats_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<storage::MembroStats>> {
    let mut conn = acquire(&state).await?;
    Ok(Json(storage::membro_stats(&mut conn, &query.record_query()).await?))
}

async fn show_membro_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<MembroDetail>> {
    let mut conn = acquire(&state).await?;
    let membro = storage::get_membro(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    let friends = storage::friends_of(&mut conn, id).await?;
    Ok(Json(MembroDetail { membro, friends }))
}

async fn create_membro_handler(
    State(state): State<Arc<AppState>>,
    Json(draft): Json<MembroDraft>,
) -> ApiResult<(StatusCode, Json<Membro>)> {
    let draft = validated_membro(draft)?;
    let mut conn = acquire(&state).await?;
    let id = storage::insert_membro(&mut conn, &draft).await?;
    let membro = storage::get_membro(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    Ok((StatusCode::CREATED, Json(membro)))
}

async fn update_membro_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(draft): Json<MembroDraft>,
) -> ApiResult<Json<Membro>> {
    let draft = validated_membro(draft)?;
    let mut conn = acquire(&state).await?;
    if !storage::update_membro(&mut conn, id, &draft).await? {
        return Err(ApiError::NotFound);
    }
    let membro = storage::get_membro(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(membro))
}

async fn list_reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Page<membros_core::Report>>> {
    let mut conn = acquire(&state).await?;
    let page = PageRequest::new(query.page, query.per_page, DEFAULT_PER_PAGE);
    Ok(Json(storage::list_reports(&mut conn, &query.record_query(), page).await?))
}

async fn aggregate_reports_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregateQuery>,
) -> ApiResult<Json<Aggregation>> {
    let field = query.field()?;
    let mut conn = acquire(&state).await?;
    let data =
        storage::aggregate_reports(&mut conn, field, &query.record_query(), query.limit()).await?;
    Ok(Json(Aggregation {
        field: field.to_string(),
        data,
    }))
}

async fn show_report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<membros_core::Report>> {
    let mut conn = acquire(&state).await?;
    let report = storage::get_report(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(report))
}

async fn create_report_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ReportBody>,
) -> ApiResult<(StatusCode, Json<membros_core::Report>)> {
    let doc = report_document(body)?;
    let mut conn = acquire(&state).await?;
    let id = storage::insert_report(&mut conn, &doc)
        .await
        .map_err(ApiError::duplicate_on("data"))?;
    let report = storage::get_report(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    Ok((StatusCode::CREATED, Json(report)))
}

async fn update_report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<ReportBody>,
) -> ApiResult<Json<membros_core::Report>> {
    let doc = report_document(body)?;
    let mut conn = acquire(&state).await?;
    let updated = storage::update_report(&mut conn, id, &doc)
        .await
        .map_err(ApiError::duplicate_on("data"))?;
    if !updated {
        return Err(ApiError::NotFound);
    }
    let report = storage::get_report(&mut conn, id).await?.ok_or(ApiError::NotFound)?;
    Ok(Json(report))
}

async fn delete_report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<JsonValue>> {
    let mut conn = acquire(&state).await?;
    if !storage::delete_report(&mut conn, id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn list_lookups_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupListQuery>,
) -> ApiResult<Json<Page<membros_core::Lookup>>> {
    let mut conn = acquire(&state).await?;
    let page = PageRequest::new(query.page, query.per_page, DEFAULT_LOOKUP_PER_PAGE);
    Ok(Json(
        storage::list_lookups(&mut conn, query.lookup_type.as_deref(), page).await?,
    ))
}

async fn create_lookup_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LookupBody>,
) -> ApiResult<(StatusCode, Json<membros_core::Lookup>)> {
    let lookup_type = required_text(body.lookup_type, "type")?;
    let name = required_text(body.name, "name")?;
    let mut conn = acquire(&state).await?;
    let (lookup, _created) = storage::first_or_create_lookup(&mut conn, &lookup_type, &name).await?;
    Ok((StatusCode::CREATED, Json(lookup)))
}

async fn update_lookup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<LookupBody>,
) -> ApiResult<Json<membros_core::Lookup>> {
    let lookup_type = required_text(body.lookup_type, "type")?;
    let name = required_text(body.name, "name")?;
    let mut conn = acquire(&state).await?;
    let lookup = storage::update_lookup(&mut conn, id, &lookup_type, &name)
        .await
        .map_err(ApiError::duplicate_on("name"))?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(lookup))
}

async fn delete_lookup_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
) -> ApiResult<Json<JsonValue>> {
    let mut conn = acquire(&state).await?;
    if !storage::delete_lookup(&mut conn, id).await? {
        return Err(ApiError::NotFound);
    }
    Ok(Json(json!({ "deleted": true })))
}

async fn bootstrap_lookups_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<JsonValue>> {
    let inserted = LookupBootstrapper::new(state.pool.clone()).run().await?;
    Ok(Json(json!({ "inserted": inserted })))
}
