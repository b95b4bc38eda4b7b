use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stockval_core::domain::history::HistoryResponse;
use stockval_core::domain::run::RunTrigger;
use stockval_core::domain::snapshot::{StockSnapshot, StocksResponse};
use stockval_core::error::{service_error, ServiceError};
use stockval_core::ingest::provider::YahooChartProvider;
use stockval_core::service::ValuationService;
use stockval_core::storage::{MemoryStore, PgStore, PriceStore};
use stockval_core::time::us_market::MarketCalendar;
use stockval_core::valuation::ValuationParams;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = stockval_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let store: Option<Arc<dyn PriceStore>> = match settings.database_url.as_deref() {
        None => {
            tracing::warn!("DATABASE_URL missing; using in-memory price store");
            Some(Arc::new(MemoryStore::new()))
        }
        Some(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(settings.database_max_connections)
            .connect(db_url)
            .await
        {
            Ok(pool) => match stockval_core::storage::migrate(&pool).await {
                Ok(()) => Some(Arc::new(PgStore::new(
                    pool,
                    settings.price_history_insert_batch,
                ))),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
    };

    let provider = Arc::new(YahooChartProvider::from_settings(&settings)?);
    let params = ValuationParams::from_settings(&settings)?;
    let calendar = MarketCalendar::from_env();
    let service = store.map(|store| {
        ValuationService::new(store, provider, params).with_calendar(calendar)
    });

    let state = AppState {
        service,
        watchlist: Arc::new(settings.watchlist.clone()),
    };

    let app = router(state).layer(cors_layer(&settings.cors_origins));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!(%addr, watchlist = ?settings.watchlist, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/stocks", get(get_stocks))
        .route("/history/:symbol", get(get_history))
        .route("/analyze/:symbol", get(analyze_symbol))
        .route("/update/:symbol", get(update_symbol))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

#[derive(Clone)]
struct AppState {
    service: Option<ValuationService>,
    watchlist: Arc<Vec<String>>,
}

impl AppState {
    fn service(&self) -> Result<&ValuationService, ApiError> {
        self.service.as_ref().ok_or(ApiError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "price store unavailable".to_string(),
        })
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let status = status_for(&err);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            sentry_anyhow::capture_anyhow(&err);
            tracing::error!(error = %format!("{err:#}"), "request failed");
        }
        Self {
            status,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn status_for(err: &anyhow::Error) -> StatusCode {
    match service_error(err) {
        Some(ServiceError::InvalidSymbol(_)) => StatusCode::BAD_REQUEST,
        Some(ServiceError::NotFound { .. }) => StatusCode::NOT_FOUND,
        Some(ServiceError::InsufficientHistory { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
        Some(ServiceError::Busy { .. }) => StatusCode::CONFLICT,
        Some(ServiceError::Upstream { .. }) => StatusCode::BAD_GATEWAY,
        None => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({"status": "Stock Value Analyzer API running"}))
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let store = state
        .service
        .as_ref()
        .map(|s| s.store().backend_name())
        .unwrap_or("unavailable");
    Json(json!({"status": "healthy", "store": store}))
}

async fn get_stocks(State(state): State<AppState>) -> Result<Json<StocksResponse>, ApiError> {
    let stocks = state.service()?.stocks(&state.watchlist).await?;
    Ok(Json(StocksResponse { stocks }))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    since: Option<String>,
}

async fn get_history(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let since = query
        .since
        .as_deref()
        .map(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .transpose()
        .map_err(|_| ApiError {
            status: StatusCode::BAD_REQUEST,
            message: "since must be YYYY-MM-DD".to_string(),
        })?;

    let data = state.service()?.history(&symbol, since).await?;
    Ok(Json(HistoryResponse { data }))
}

async fn analyze_symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Result<Json<StockSnapshot>, ApiError> {
    let snapshot = state
        .service()?
        .refresh(&symbol, RunTrigger::OnDemand)
        .await?;
    Ok(Json(snapshot))
}

/// Legacy refresh: always 200, with either a snapshot or `{"error": ...}`.
async fn update_symbol(
    State(state): State<AppState>,
    Path(symbol): Path<String>,
) -> Json<serde_json::Value> {
    let res = match state.service() {
        Ok(service) => service
            .refresh(&symbol, RunTrigger::OnDemand)
            .await
            .map_err(ApiError::from),
        Err(e) => Err(e),
    };

    match res.and_then(|s| {
        serde_json::to_value(s).map_err(|e| ApiError::from(anyhow::Error::new(e)))
    }) {
        Ok(v) => Json(v),
        Err(e) => Json(json!({ "error": e.message })),
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &stockval_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
