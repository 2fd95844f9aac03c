//! HTTP surface of the portal.

use crate::Portal;
use crate::analysis::RESULTS_PREFIX;
use crate::errors::{PortalError, Result};
use crate::events::{EventOutcome, PushEnvelope, StorageEvent};
use crate::identity::{Principal, RequestCredentials, form_value};
use crate::ingest::UploadFormat;
use crate::metrics_defs::REQUEST_DURATION;
use crate::reports::ReportSummary;
use crate::table_name::{TableName, base_name};
use axum::body::{Body, to_bytes};
use axum::extract::rejection::JsonRejection;
use axum::extract::{
    DefaultBodyLimit, FromRequest, MatchedPath, Multipart, Path, Query, Request, State,
};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use http::{HeaderValue, header};
use maud::{DOCTYPE, Markup, html};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::histogram;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

pub fn router(portal: Arc<Portal>) -> Router {
    let body_limit = portal.max_upload_bytes;

    Router::new()
        .route("/", get(upload_form).post(upload))
        .route("/download/{filename}", get(download_results))
        .route("/download_bq", get(download_analysis))
        .route("/run_analysis", get(run_analysis))
        .route("/reports", get(list_reports))
        .route("/run_report", post(run_report))
        .route("/download_report", get(download_report))
        .route("/publish_looker_views", post(publish_views))
        .route("/whoami", get(whoami))
        .route("/events/storage", post(storage_event))
        .route("/events/sql-import", post(sql_import_event))
        .route_layer(middleware::from_fn_with_state(portal.clone(), authenticate))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(middleware::from_fn(track_request_metrics))
        .with_state(portal)
}

/// Resolves the caller before any handler runs. Form bodies are buffered
/// only when the token has to be read from them.
async fn authenticate(State(portal): State<Arc<Portal>>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let is_urlencoded = content_type.starts_with("application/x-www-form-urlencoded");
    let is_multipart = content_type.starts_with("multipart/form-data");
    let field = portal
        .identity
        .body_token_field(&parts.headers, parts.uri.query())
        .filter(|_| is_urlencoded || is_multipart);

    let (body, token) = match field {
        Some(field) => {
            let bytes = match to_bytes(body, portal.max_upload_bytes).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    return PortalError::InvalidRequest(format!(
                        "could not read request body: {e}"
                    ))
                    .into_response();
                }
            };
            let token = if is_multipart {
                multipart_text_field(&parts, bytes.clone(), field).await
            } else {
                form_value(&bytes, field)
            };
            (Body::from(bytes), token)
        }
        None => (body, None),
    };

    let credentials = RequestCredentials {
        headers: &parts.headers,
        query: parts.uri.query(),
        form: token.as_deref(),
    };
    let Some(principal) = portal.identity.resolve(&credentials).await else {
        return PortalError::Unauthorized.into_response();
    };

    parts.extensions.insert(principal);
    next.run(Request::from_parts(parts, body)).await
}

/// Text of the first multipart part called `name`. Reparses a copy of the
/// buffered body so the handler still sees every part.
async fn multipart_text_field(
    parts: &http::request::Parts,
    bytes: Bytes,
    name: &str,
) -> Option<String> {
    let mut request = Request::new(Body::from(bytes));
    *request.headers_mut() = parts.headers.clone();
    *request.extensions_mut() = parts.extensions.clone();

    let mut multipart = Multipart::from_request(request, &()).await.ok()?;
    while let Ok(Some(field)) = multipart.next_field().await {
        if field.name() == Some(name) {
            return field.text().await.ok().filter(|text| !text.is_empty());
        }
    }
    None
}

async fn track_request_metrics(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let start = Instant::now();

    let response = next.run(request).await;

    histogram!(
        REQUEST_DURATION,
        "route" => route,
        "status" => response.status().as_u16().to_string(),
    )
    .record(start.elapsed().as_secs_f64());
    response
}

async fn healthz() -> &'static str {
    "ok"
}

/// Upload page. With bearer-token identity the token the page was opened
/// with is carried into the upload as a hidden field.
async fn upload_form(State(portal): State<Arc<Portal>>, request: Request) -> Markup {
    let hidden = portal.identity.form_field().zip(
        portal
            .identity
            .presented_token(request.headers(), request.uri().query()),
    );

    html! {
        (DOCTYPE)
        html {
            head { title { "Upload data" } }
            body {
                h1 { "Upload a data file" }
                form method="post" action="/" enctype="multipart/form-data" {
                    @if let Some((field, token)) = &hidden {
                        input type="hidden" name=(field) value=(token);
                    }
                    input type="file" name="file" accept=".csv,.xls,.xlsx,.json,.parquet,.sql";
                    button type="submit" { "Upload" }
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    table: Option<String>,
    format: &'static str,
    staged_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_loaded: Option<u64>,
}

async fn upload(
    State(portal): State<Arc<Portal>>,
    Extension(principal): Extension<Principal>,
    multipart: std::result::Result<Multipart, axum::extract::multipart::MultipartRejection>,
) -> Result<Json<UploadResponse>> {
    let mut multipart = multipart.map_err(|e| PortalError::InvalidRequest(e.to_string()))?;

    let (filename, data) = loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| PortalError::InvalidRequest(e.to_string()))?
            .ok_or_else(|| PortalError::InvalidRequest("no file part in request".into()))?;
        if field.name() != Some("file") {
            continue;
        }
        let filename = field
            .file_name()
            .map(|name| base_name(name).to_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PortalError::InvalidRequest("no file selected".into()))?;
        let data = field
            .bytes()
            .await
            .map_err(|e| PortalError::InvalidRequest(e.to_string()))?;
        break (filename, data);
    };

    // Both checks happen before anything is written.
    let format = UploadFormat::from_filename(&filename)?;
    let table = TableName::from_filename(&filename)?;

    let outcome = portal.ingestor.ingest(data, &filename, &table).await?;
    tracing::info!(
        %principal,
        %filename,
        %table,
        format = format.as_str(),
        "upload staged"
    );

    if format == UploadFormat::Sql {
        return Ok(Json(UploadResponse {
            success: true,
            message: format!("SQL file '{filename}' queued for import."),
            table: None,
            format: format.as_str(),
            staged_key: outcome.staged_key,
            rows_loaded: None,
        }));
    }

    portal.analysis.run_preview(&table).await?;

    Ok(Json(UploadResponse {
        success: true,
        message: format!("Analysis completed for table '{table}'."),
        table: Some(table.to_string()),
        format: format.as_str(),
        staged_key: outcome.staged_key,
        rows_loaded: outcome.rows_loaded,
    }))
}

fn csv_attachment(filename: &str, body: impl Into<Body>) -> Result<Response> {
    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
        .map_err(|_| PortalError::InvalidRequest(format!("invalid file name {filename:?}")))?;
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/csv")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body.into(),
    )
        .into_response())
}

async fn download_results(
    State(portal): State<Arc<Portal>>,
    Path(filename): Path<String>,
) -> Result<Response> {
    if filename.is_empty()
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(PortalError::InvalidRequest(format!(
            "invalid file name {filename:?}"
        )));
    }

    let key = format!("{RESULTS_PREFIX}{filename}");
    if !portal.store.exists(&key).await? {
        return Err(PortalError::ObjectNotFound(filename));
    }
    let data = portal.store.get(&key).await?;
    csv_attachment(&filename, data)
}

#[derive(Debug, Deserialize)]
struct TableQuery {
    table: Option<String>,
}

/// A missing or empty `table` parameter is rejected before any name check.
fn table_param(raw: Option<&str>) -> Result<TableName> {
    match raw {
        None | Some("") => Err(PortalError::MissingParameter("table")),
        Some(name) => Ok(TableName::parse(name)?),
    }
}

async fn download_analysis(
    State(portal): State<Arc<Portal>>,
    Query(query): Query<TableQuery>,
) -> Result<Response> {
    let table = table_param(query.table.as_deref())?;
    let csv = portal.runner.export_analysis_csv(&table).await?;
    csv_attachment(&format!("{}.csv", table.analysis()), csv)
}

async fn run_analysis(
    State(portal): State<Arc<Portal>>,
    Query(query): Query<TableQuery>,
) -> Result<String> {
    let table = table_param(query.table.as_deref())?;
    portal.runner.run_preview(&table).await?;
    Ok(format!("Analysis completed for table '{table}'."))
}

async fn list_reports(State(portal): State<Arc<Portal>>) -> Json<Vec<ReportSummary>> {
    Json(portal.reports.list_reports())
}

#[derive(Debug, Deserialize)]
struct RunReportRequest {
    report: String,
    table: String,
    #[serde(default)]
    limit: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ReportRows {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

fn json_body<T>(body: std::result::Result<Json<T>, JsonRejection>) -> Result<T> {
    body.map(|Json(value)| value)
        .map_err(|e| PortalError::InvalidRequest(e.body_text()))
}

async fn run_report(
    State(portal): State<Arc<Portal>>,
    body: std::result::Result<Json<RunReportRequest>, JsonRejection>,
) -> Result<Json<ReportRows>> {
    let request = json_body(body)?;
    let table = table_param(Some(&request.table))?;
    let results = portal
        .reports
        .run_report(&request.report, &table, request.limit)
        .await?;
    Ok(Json(ReportRows {
        columns: results.columns,
        rows: results.rows,
    }))
}

#[derive(Debug, Deserialize)]
struct DownloadReportQuery {
    report: Option<String>,
    table: Option<String>,
}

async fn download_report(
    State(portal): State<Arc<Portal>>,
    Query(query): Query<DownloadReportQuery>,
) -> Result<Response> {
    let report = query
        .report
        .filter(|report| !report.is_empty())
        .ok_or(PortalError::MissingParameter("report"))?;
    let table = table_param(query.table.as_deref())?;
    let csv = portal.reports.download_report_csv(&report, &table).await?;
    csv_attachment(&format!("{table}__{report}.csv"), csv)
}

#[derive(Debug, Deserialize)]
struct PublishViewsRequest {
    table: String,
}

#[derive(Debug, Serialize)]
struct PublishViewsResponse {
    success: bool,
    views: BTreeMap<String, String>,
}

async fn publish_views(
    State(portal): State<Arc<Portal>>,
    Extension(principal): Extension<Principal>,
    body: std::result::Result<Json<PublishViewsRequest>, JsonRejection>,
) -> Result<Json<PublishViewsResponse>> {
    let request = json_body(body)?;
    let table = table_param(Some(&request.table))?;
    let views = portal.reports.publish_views(&table).await?;
    tracing::info!(%principal, %table, "published report views");
    Ok(Json(PublishViewsResponse {
        success: true,
        views,
    }))
}

#[derive(Debug, Serialize)]
struct WhoAmI {
    principal: Principal,
}

async fn whoami(Extension(principal): Extension<Principal>) -> Json<WhoAmI> {
    Json(WhoAmI { principal })
}

async fn storage_event(
    State(portal): State<Arc<Portal>>,
    body: std::result::Result<Json<StorageEvent>, JsonRejection>,
) -> Result<Json<EventOutcome>> {
    let event = json_body(body)?;
    Ok(Json(portal.events.handle_storage_event(&event).await?))
}

async fn sql_import_event(
    State(portal): State<Arc<Portal>>,
    body: std::result::Result<Json<PushEnvelope>, JsonRejection>,
) -> Result<Json<EventOutcome>> {
    let envelope = json_body(body)?;
    Ok(Json(portal.events.handle_sql_import(&envelope).await?))
}
