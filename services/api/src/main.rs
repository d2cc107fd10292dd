//! API Service - read-only queries over the loaded USDA observations
//!
//! Endpoints:
//! - GET /health - Health check with database time
//! - GET /prices - Paginated PRICE rows
//! - GET /observations - Paginated rows of any metric
//! - GET /reports/:metric - All rows of one metric, newest first
//! - GET /stats/summary - Price statistics per commodity
//! - GET /stats/average - Price statistics for a filtered slice

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use pipeline::config::{validate_table_name, DEFAULT_TABLE};
use pipeline::logging::init_logging;
use pipeline::model::Metric;
use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 1000;

// ============================================================================
// State
// ============================================================================

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    table: String,
}

// ============================================================================
// Response types
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    version: &'static str,
    db_time: DateTime<Utc>,
}

#[derive(Debug, Serialize, sqlx::FromRow)]
struct ObservationRow {
    year: i32,
    region_name: String,
    commodity: String,
    metric: String,
    unit: String,
    raw_value: Option<f64>,
    derived_value_per_ton: Option<f64>,
}

#[derive(Serialize)]
struct PageResponse {
    limit: i64,
    offset: i64,
    rows: Vec<ObservationRow>,
}

#[derive(Serialize)]
struct ReportResponse {
    metric: Metric,
    count: usize,
    rows: Vec<ObservationRow>,
}

#[derive(Serialize, sqlx::FromRow)]
struct CommoditySummary {
    commodity: String,
    records: i64,
    avg_price: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
}

#[derive(Serialize, sqlx::FromRow)]
struct PriceStats {
    records: i64,
    avg_price: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ============================================================================
// Query params
// ============================================================================

#[derive(Debug, Default, Deserialize)]
struct ObservationsQuery {
    metric: Option<String>,
    commodity: Option<String>,
    region: Option<String>,
    year: Option<i32>,
    limit: Option<i64>,
    offset: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SliceQuery {
    commodity: Option<String>,
    region: Option<String>,
    year: Option<i32>,
}

/// Row filter shared by every listing and aggregate query.
#[derive(Debug, Default, PartialEq)]
struct Filter {
    metric: Option<Metric>,
    commodity: Option<String>,
    region: Option<String>,
    year: Option<i32>,
}

impl Filter {
    fn new(
        metric: Option<Metric>,
        commodity: Option<String>,
        region: Option<String>,
        year: Option<i32>,
    ) -> Self {
        Self {
            metric,
            commodity: normalize_filter(commodity),
            region: normalize_filter(region),
            year,
        }
    }

    /// Append a `WHERE` clause for the set filters.
    fn push_where(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        let mut sep = " WHERE ";
        if let Some(metric) = self.metric {
            builder.push(sep).push("metric = ").push_bind(metric.as_str());
            sep = " AND ";
        }
        if let Some(commodity) = &self.commodity {
            builder.push(sep).push("commodity = ").push_bind(commodity.clone());
            sep = " AND ";
        }
        if let Some(region) = &self.region {
            builder.push(sep).push("region_name = ").push_bind(region.clone());
            sep = " AND ";
        }
        if let Some(year) = self.year {
            builder.push(sep).push("year = ").push_bind(year);
        }
    }
}

/// Trimmed, upper-cased filter value; blank means unset.
fn normalize_filter(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_uppercase())
        .filter(|v| !v.is_empty())
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

fn clamp_offset(offset: Option<i64>) -> i64 {
    offset.unwrap_or(0).max(0)
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn db_error(e: sqlx::Error) -> Response {
    error!(error = %e, "query failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

const SELECT_ROWS: &str =
    "SELECT year, region_name, commodity, metric, unit, raw_value, derived_value_per_ton FROM ";

const PRICE_AGGREGATES: &str = r#"
    COUNT(*)::bigint AS records,
    ROUND(AVG(raw_value)::numeric, 2)::float8 AS avg_price,
    MIN(raw_value) AS min_price,
    MAX(raw_value) AS max_price
"#;

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let now: Result<(DateTime<Utc>,), _> = sqlx::query_as("SELECT NOW()")
        .fetch_one(&state.pool)
        .await;

    match now {
        Ok((db_time,)) => Json(HealthResponse {
            ok: true,
            version: env!("CARGO_PKG_VERSION"),
            db_time,
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "health check failed");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "database unavailable")
        }
    }
}

async fn fetch_page(state: &AppState, filter: &Filter, limit: i64, offset: i64) -> Response {
    let mut builder = QueryBuilder::<Postgres>::new(SELECT_ROWS);
    builder.push(&state.table);
    filter.push_where(&mut builder);
    builder
        .push(" ORDER BY year DESC, commodity, region_name, metric LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    match builder
        .build_query_as::<ObservationRow>()
        .fetch_all(&state.pool)
        .await
    {
        Ok(rows) => Json(PageResponse {
            limit,
            offset,
            rows,
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

async fn prices_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ObservationsQuery>,
) -> Response {
    let filter = Filter::new(Some(Metric::Price), params.commodity, params.region, params.year);
    fetch_page(&state, &filter, clamp_limit(params.limit), clamp_offset(params.offset)).await
}

async fn observations_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ObservationsQuery>,
) -> Response {
    let metric = match params.metric.as_deref().map(str::parse::<Metric>).transpose() {
        Ok(metric) => metric,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let filter = Filter::new(metric, params.commodity, params.region, params.year);
    fetch_page(&state, &filter, clamp_limit(params.limit), clamp_offset(params.offset)).await
}

async fn report_handler(
    State(state): State<Arc<AppState>>,
    Path(metric): Path<String>,
) -> Response {
    let metric: Metric = match metric.parse() {
        Ok(metric) => metric,
        Err(e) => return error_response(StatusCode::NOT_FOUND, e),
    };

    let mut builder = QueryBuilder::<Postgres>::new(SELECT_ROWS);
    builder.push(&state.table);
    Filter::new(Some(metric), None, None, None).push_where(&mut builder);
    builder.push(" ORDER BY year DESC, commodity, region_name");

    match builder
        .build_query_as::<ObservationRow>()
        .fetch_all(&state.pool)
        .await
    {
        Ok(rows) => Json(ReportResponse {
            metric,
            count: rows.len(),
            rows,
        })
        .into_response(),
        Err(e) => db_error(e),
    }
}

async fn summary_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut builder = QueryBuilder::<Postgres>::new("SELECT commodity, ");
    builder.push(PRICE_AGGREGATES).push(" FROM ").push(&state.table);
    Filter::new(Some(Metric::Price), None, None, None).push_where(&mut builder);
    builder.push(" GROUP BY commodity ORDER BY commodity");

    match builder
        .build_query_as::<CommoditySummary>()
        .fetch_all(&state.pool)
        .await
    {
        Ok(rows) => Json(serde_json::json!({ "commodities": rows })).into_response(),
        Err(e) => db_error(e),
    }
}

async fn average_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SliceQuery>,
) -> Response {
    let filter = Filter::new(Some(Metric::Price), params.commodity, params.region, params.year);

    let mut builder = QueryBuilder::<Postgres>::new("SELECT ");
    builder.push(PRICE_AGGREGATES).push(" FROM ").push(&state.table);
    filter.push_where(&mut builder);

    match builder
        .build_query_as::<PriceStats>()
        .fetch_one(&state.pool)
        .await
    {
        Ok(stats) if stats.records == 0 => {
            error_response(StatusCode::NOT_FOUND, "No data found for the given filters")
        }
        Ok(stats) => Json(serde_json::json!({
            "commodity": filter.commodity,
            "region": filter.region,
            "year": filter.year,
            "stats": stats,
        }))
        .into_response(),
        Err(e) => db_error(e),
    }
}

// ============================================================================
// Main
// ============================================================================

fn router(state: Arc<AppState>) -> Router {
    // CORS for web frontend
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/prices", get(prices_handler))
        .route("/observations", get(observations_handler))
        .route("/reports/:metric", get(report_handler))
        .route("/stats/summary", get(summary_handler))
        .route("/stats/average", get(average_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_logging(false);

    let db_url = std::env::var("DB_URL").context("DB_URL env var missing")?;
    let bind = std::env::var("API_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let table = std::env::var("TARGET_TABLE").unwrap_or_else(|_| DEFAULT_TABLE.to_string());
    validate_table_name(&table).context("Invalid TARGET_TABLE")?;

    info!("connecting to database");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&db_url)
        .await
        .context("Failed to connect to database")?;

    let app = router(Arc::new(AppState { pool, table }));

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(%bind, "API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
