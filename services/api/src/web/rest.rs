//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::error::ApiError;
use crate::web::middleware::{identify, DeviceId};
use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware as axum_middleware,
    response::{IntoResponse, Json},
    routing::{get, post},
    Extension, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use story_engine_core::engine::popular::POPULAR_LIMIT;
use story_engine_core::{Collection, Fields, Record, ReportSubmission, RequestContext};
use utoipa::{IntoParams, OpenApi, ToSchema};

const DEFAULT_PER_PAGE: usize = 30;
const MAX_PER_PAGE: usize = 500;

pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_record,
        list_records,
        get_record,
        update_record,
        delete_record,
        get_chapter,
        list_chapter_audios,
        submit_report,
        popular_searches,
        refresh_popular_searches,
    ),
    components(
        schemas(
            RecordInput,
            RecordResponse,
            RecordList,
            ReportSubmitRequest,
            ReportSubmitted,
            PopularSearchList,
        )
    ),
    tags(
        (name = "Story Engine API", description = "Record endpoints whose writes drive the story engine reactions.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// The fields of a record to create, or to merge into an existing one.
#[derive(Deserialize, ToSchema)]
pub struct RecordInput {
    #[schema(value_type = Object)]
    pub data: Fields,
}

#[derive(Serialize, ToSchema)]
pub struct RecordResponse {
    pub id: String,
    pub collection: String,
    #[schema(value_type = Object)]
    pub data: Fields,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl From<Record> for RecordResponse {
    fn from(record: Record) -> Self {
        Self {
            id: record.id,
            collection: record.collection.as_str().to_string(),
            data: record.data,
            created: record.created,
            updated: record.updated,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct RecordList {
    pub page: usize,
    pub per_page: usize,
    pub items: Vec<RecordResponse>,
}

/// The public support form.
#[derive(Deserialize, ToSchema, Default)]
pub struct ReportSubmitRequest {
    /// One of `story`, `chapter`, `app`, `question`, `other`; defaults to `app`.
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub contact_email: String,
}

#[derive(Serialize, ToSchema)]
pub struct ReportSubmitted {
    pub ok: bool,
    pub message: String,
}

#[derive(Serialize, ToSchema)]
pub struct PopularSearchList {
    pub queries: Vec<String>,
}

#[derive(Deserialize, IntoParams, Default)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Filter expression, e.g. `story="abc" && rating>=4`.
    pub filter: Option<String>,
    /// Comma separated sort keys, `-` prefix for descending.
    pub sort: Option<String>,
    /// 1-based page number.
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

//=========================================================================================
// Router
//=========================================================================================

/// All API routes, with identity extraction applied.
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/collections/{collection}/records",
            get(list_records).post(create_record),
        )
        .route(
            "/collections/{collection}/records/{id}",
            get(get_record).patch(update_record).delete(delete_record),
        )
        .route("/chapters/{id}", get(get_chapter))
        .route("/chapters/{id}/audios", get(list_chapter_audios))
        .route("/reports/submit", post(submit_report))
        .route("/popular-searches", get(popular_searches))
        .route("/internal/refresh-popular", post(refresh_popular_searches))
        .layer(axum_middleware::from_fn(identify))
        .with_state(state)
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Rejects client writes to engine-owned collections and to derived fields.
fn ensure_client_writable(collection: Collection, data: Option<&Fields>) -> Result<(), ApiError> {
    if collection.is_engine_owned() {
        return Err(ApiError::Forbidden(format!(
            "{collection} records are maintained by the server"
        )));
    }
    let derived = data.and_then(|data| {
        collection
            .derived_fields()
            .iter()
            .find(|field| data.contains_key(**field))
    });
    match derived {
        Some(field) => Err(ApiError::Forbidden(format!(
            "{collection}.{field} is derived by the server"
        ))),
        None => Ok(()),
    }
}

/// Create a record. Its create reactions run after it is committed.
#[utoipa::path(
    post,
    path = "/collections/{collection}/records",
    request_body = RecordInput,
    responses(
        (status = 201, description = "Record created", body = RecordResponse),
        (status = 403, description = "Server-maintained collection or field"),
        (status = 404, description = "Unknown collection"),
        (status = 409, description = "Uniqueness constraint violated"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("collection" = String, Path, description = "Collection name, e.g. `views`."),
        ("x-user-id" = Option<String>, Header, description = "The authenticated user, if any.")
    )
)]
pub async fn create_record(
    State(app_state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Extension(ctx): Extension<RequestContext>,
    Json(input): Json<RecordInput>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = collection.parse()?;
    ensure_client_writable(collection, Some(&input.data))?;
    let record = app_state.router.create(&ctx, collection, input.data).await?;
    Ok((StatusCode::CREATED, Json(RecordResponse::from(record))))
}

/// List one page of records matching a filter.
#[utoipa::path(
    get,
    path = "/collections/{collection}/records",
    responses(
        (status = 200, description = "One page of records", body = RecordList),
        (status = 400, description = "Malformed filter or sort"),
        (status = 404, description = "Unknown collection")
    ),
    params(
        ("collection" = String, Path, description = "Collection name."),
        ListQuery
    )
)]
pub async fn list_records(
    State(app_state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = collection.parse()?;
    let page = query.page.unwrap_or(1).max(1);
    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let records = app_state
        .router
        .store()
        .find_by_filter(
            collection,
            query.filter.as_deref().unwrap_or(""),
            query.sort.as_deref().unwrap_or("-created"),
            per_page,
            (page - 1) * per_page,
        )
        .await?;
    Ok(Json(RecordList {
        page,
        per_page,
        items: records.into_iter().map(RecordResponse::from).collect(),
    }))
}

/// Fetch one record.
#[utoipa::path(
    get,
    path = "/collections/{collection}/records/{id}",
    responses(
        (status = 200, description = "The record", body = RecordResponse),
        (status = 404, description = "Unknown collection or record")
    ),
    params(
        ("collection" = String, Path, description = "Collection name."),
        ("id" = String, Path, description = "Record id.")
    )
)]
pub async fn get_record(
    State(app_state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = collection.parse()?;
    let record = app_state.router.store().find_by_id(collection, &id).await?;
    Ok(Json(RecordResponse::from(record)))
}

/// Merge fields into a record. Update reactions see both versions.
#[utoipa::path(
    patch,
    path = "/collections/{collection}/records/{id}",
    request_body = RecordInput,
    responses(
        (status = 200, description = "The updated record", body = RecordResponse),
        (status = 403, description = "Server-maintained collection or field"),
        (status = 404, description = "Unknown collection or record"),
        (status = 409, description = "Uniqueness constraint violated")
    ),
    params(
        ("collection" = String, Path, description = "Collection name."),
        ("id" = String, Path, description = "Record id.")
    )
)]
pub async fn update_record(
    State(app_state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    Json(input): Json<RecordInput>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = collection.parse()?;
    ensure_client_writable(collection, Some(&input.data))?;
    let record = app_state.router.update(collection, &id, input.data).await?;
    Ok(Json(RecordResponse::from(record)))
}

/// Delete a record. Delete reactions see the removed row.
#[utoipa::path(
    delete,
    path = "/collections/{collection}/records/{id}",
    responses(
        (status = 204, description = "Record deleted"),
        (status = 403, description = "Server-maintained collection"),
        (status = 404, description = "Unknown collection or record")
    ),
    params(
        ("collection" = String, Path, description = "Collection name."),
        ("id" = String, Path, description = "Record id.")
    )
)]
pub async fn delete_record(
    State(app_state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let collection: Collection = collection.parse()?;
    ensure_client_writable(collection, None)?;
    app_state.router.delete(collection, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Fetch a chapter annotated with whether the calling device is premium.
#[utoipa::path(
    get,
    path = "/chapters/{id}",
    responses(
        (status = 200, description = "The chapter with `is_premium` set", body = RecordResponse),
        (status = 404, description = "Chapter not found")
    ),
    params(
        ("id" = String, Path, description = "Chapter id."),
        ("x-device-id" = Option<String>, Header, description = "The calling device.")
    )
)]
pub async fn get_chapter(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Extension(device): Extension<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    let chapter = app_state
        .router
        .store()
        .find_by_id(Collection::Chapters, &id)
        .await?;
    let mut chapters = [chapter];
    app_state
        .entitlements
        .annotate_chapters(&device.0, &mut chapters)
        .await;
    let [chapter] = chapters;
    Ok(Json(RecordResponse::from(chapter)))
}

/// List a chapter's audio variants; empty for a locked chapter on a free device.
#[utoipa::path(
    get,
    path = "/chapters/{id}/audios",
    responses(
        (status = 200, description = "Visible audio variants", body = RecordList)
    ),
    params(
        ("id" = String, Path, description = "Chapter id."),
        ("x-device-id" = Option<String>, Header, description = "The calling device.")
    )
)]
pub async fn list_chapter_audios(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Extension(device): Extension<DeviceId>,
) -> Result<impl IntoResponse, ApiError> {
    let audios = app_state
        .entitlements
        .gate_chapter_audios(&id, &device.0)
        .await?;
    Ok(Json(RecordList {
        page: 1,
        per_page: audios.len(),
        items: audios.into_iter().map(RecordResponse::from).collect(),
    }))
}

/// Submit a report from the public support form.
#[utoipa::path(
    post,
    path = "/reports/submit",
    request_body = ReportSubmitRequest,
    responses(
        (status = 200, description = "Report stored as pending", body = ReportSubmitted),
        (status = 400, description = "Unknown type or missing reason")
    ),
    params(
        ("x-user-id" = Option<String>, Header, description = "The authenticated user, if any.")
    )
)]
pub async fn submit_report(
    State(app_state): State<Arc<AppState>>,
    Extension(ctx): Extension<RequestContext>,
    Json(form): Json<ReportSubmitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let row = ReportSubmission {
        kind: form.kind,
        reason: form.reason,
        contact_email: form.contact_email,
    }
    .into_fields()?;
    app_state.router.create(&ctx, Collection::Reports, row).await?;
    Ok(Json(ReportSubmitted {
        ok: true,
        message: "Report submitted".to_string(),
    }))
}

/// The most searched queries, served from the popular-search cache.
#[utoipa::path(
    get,
    path = "/popular-searches",
    responses(
        (status = 200, description = "Most popular queries first", body = PopularSearchList)
    )
)]
pub async fn popular_searches(
    State(app_state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let queries = app_state.popular.top(POPULAR_LIMIT).await?;
    Ok((
        [(header::CACHE_CONTROL, "public, max-age=86400")],
        Json(PopularSearchList { queries }),
    ))
}

/// Rebuild the popular-search cache now, for an external cron job.
#[utoipa::path(
    post,
    path = "/internal/refresh-popular",
    responses(
        (status = 200, description = "Cache rebuilt", body = PopularSearchList),
        (status = 401, description = "Missing or wrong cron secret")
    ),
    params(
        ("x-cron-secret" = String, Header, description = "The configured `CRON_SECRET`.")
    )
)]
pub async fn refresh_popular_searches(
    State(app_state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let presented = headers
        .get(CRON_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    match app_state.config.cron_secret.as_deref() {
        Some(secret) if !presented.is_empty() && presented == secret => {}
        _ => return Err(ApiError::Unauthorized),
    }
    let terms = app_state.popular.refresh().await?;
    Ok(Json(PopularSearchList {
        queries: terms.into_iter().map(|t| t.query).collect(),
    }))
}
