//! Operator control API
//!
//! JSON over HTTP in front of the `Engine`. Instruments in paths use the
//! `BTC-USDT` spelling; any form `Instrument::parse` accepts also works.

use crate::application::actors::sweeper_actor::SweeperStats;
use crate::application::services::engine::{Engine, EngineHealth};
use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{OrderSnapshot, Position};
use crate::domain::entities::signal::Signal;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::entities::trade::{ProtectiveOrderState, TradeRecord};
use crate::domain::errors::TradeError;
use crate::domain::services::monitor_registry::RegistryEntryInfo;
use crate::domain::services::scan_scheduler::{ScanError, StrategyInfo};
use crate::domain::services::sweeper::SweepReport;
use crate::domain::services::trader::CloseSummary;
use crate::rate_limit::{rate_limit_middleware, SharedRateLimiter};
use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub type AppState = Arc<Engine>;

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: None,
        }),
    )
}

fn trade_error(error: TradeError) -> ApiError {
    let status = match &error {
        TradeError::AlreadyOpenTrade { .. } => StatusCode::CONFLICT,
        TradeError::InvalidSignal { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        TradeError::InsufficientFunds { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: Some(error.error_code().to_string()),
        }),
    )
}

fn parse_instrument(raw: &str) -> Result<Instrument, ApiError> {
    Instrument::parse(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenTradeResponse {
    pub message: String,
    pub trade: TradeRecord,
}

#[derive(Debug, Serialize)]
pub struct MonitorsResponse {
    pub tasks: Vec<RegistryEntryInfo>,
    pub protections: Vec<ProtectiveOrderState>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanResponse {
    pub instrument: Instrument,
    pub signal: Option<Signal>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TimeframeRequest {
    pub timeframe: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeverageRequest {
    pub leverage: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeverageResponse {
    pub leverage: u32,
}

/// Build the control router around `engine`
pub fn router(engine: AppState, limiter: SharedRateLimiter) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/positions", get(positions))
        .route("/orders", get(orders))
        .route("/trades", get(trades).post(open_trade))
        .route("/trades/close-all", post(close_all))
        .route("/trades/:instrument/close", post(close_trade))
        .route("/monitors", get(monitors))
        .route("/strategies", get(strategies))
        .route("/strategies/:instrument/timeframe", put(set_timeframe))
        .route("/scan/:instrument", post(scan_now))
        .route("/sweep", get(sweep_stats).post(sweep_now))
        .route("/leverage", get(get_leverage).put(set_leverage))
        .layer(middleware::from_fn(move |request: Request, next: Next| {
            rate_limit_middleware(limiter.clone(), request, next)
        }))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

async fn health(State(engine): State<AppState>) -> Json<EngineHealth> {
    Json(engine.health().await)
}

async fn positions(State(engine): State<AppState>) -> Result<Json<Vec<Position>>, ApiError> {
    engine
        .get_active_positions()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))
}

async fn orders(State(engine): State<AppState>) -> Result<Json<Vec<OrderSnapshot>>, ApiError> {
    engine
        .get_open_orders()
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e))
}

async fn trades(State(engine): State<AppState>) -> Json<Vec<TradeRecord>> {
    Json(engine.active_trades())
}

async fn open_trade(
    State(engine): State<AppState>,
    Json(signal): Json<Signal>,
) -> Result<(StatusCode, Json<OpenTradeResponse>), ApiError> {
    let trade = engine.try_open_trade(signal).await.map_err(trade_error)?;
    let message = format!(
        "Opened {} {} quantity {:.6}, stop-loss {:.4}",
        trade.side, trade.instrument, trade.quantity, trade.stop_loss
    );
    Ok((StatusCode::CREATED, Json(OpenTradeResponse { message, trade })))
}

async fn close_all(State(engine): State<AppState>) -> Json<CloseSummary> {
    Json(engine.close_all_trades().await)
}

async fn close_trade(
    State(engine): State<AppState>,
    Path(instrument): Path<String>,
) -> Result<Json<CloseSummary>, ApiError> {
    let instrument = parse_instrument(&instrument)?;
    Ok(Json(engine.close_trade(&instrument).await))
}

async fn monitors(State(engine): State<AppState>) -> Json<MonitorsResponse> {
    Json(MonitorsResponse {
        tasks: engine.monitors(),
        protections: engine.protections(),
    })
}

async fn strategies(State(engine): State<AppState>) -> Json<Vec<StrategyInfo>> {
    Json(engine.strategies_info())
}

async fn set_timeframe(
    State(engine): State<AppState>,
    Path(instrument): Path<String>,
    Json(request): Json<TimeframeRequest>,
) -> Result<Json<StrategyInfo>, ApiError> {
    let instrument = parse_instrument(&instrument)?;
    let timeframe = request
        .timeframe
        .parse::<Timeframe>()
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;

    if !engine.set_timeframe(&instrument, timeframe).await {
        return Err(api_error(
            StatusCode::NOT_FOUND,
            format!("No strategy configured for {}", instrument),
        ));
    }
    engine
        .strategies_info()
        .into_iter()
        .find(|info| info.instrument == instrument)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("No strategy configured for {}", instrument)))
}

async fn scan_now(
    State(engine): State<AppState>,
    Path(instrument): Path<String>,
) -> Result<Json<ScanResponse>, ApiError> {
    let instrument = parse_instrument(&instrument)?;
    match engine.scan_now(&instrument).await {
        Ok(signal) => Ok(Json(ScanResponse { instrument, signal })),
        Err(e @ ScanError::NotConfigured(_)) => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e @ ScanError::MarketData(_)) => Err(api_error(StatusCode::BAD_GATEWAY, e)),
    }
}

async fn sweep_now(State(engine): State<AppState>) -> Json<SweepReport> {
    Json(engine.sweep_now().await)
}

async fn sweep_stats(State(engine): State<AppState>) -> Result<Json<SweeperStats>, ApiError> {
    engine
        .sweeper_stats()
        .await
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::SERVICE_UNAVAILABLE, "Sweeper is not running"))
}

async fn get_leverage(State(engine): State<AppState>) -> Json<LeverageResponse> {
    Json(LeverageResponse {
        leverage: engine.leverage(),
    })
}

async fn set_leverage(
    State(engine): State<AppState>,
    Json(request): Json<LeverageRequest>,
) -> Result<Json<LeverageResponse>, ApiError> {
    if engine.set_leverage(request.leverage) {
        Ok(Json(LeverageResponse {
            leverage: engine.leverage(),
        }))
    } else {
        Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Invalid leverage: {} (must be between 1 and 100)", request.leverage),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::domain::entities::signal::tests::btc_long_signal;
    use crate::domain::services::strategies::tests::trend;
    use crate::infrastructure::simulated_exchange::SimulatedExchange;
    use crate::rate_limit::control_rate_limiter;
    use axum::body::{to_bytes, Body};
    use axum::http::{self, Method};
    use tower::ServiceExt;

    fn btc() -> Instrument {
        Instrument::parse("BTC/USDT").unwrap()
    }

    async fn app() -> (Arc<SimulatedExchange>, AppState, Router) {
        let venue = Arc::new(SimulatedExchange::new());
        venue.set_price(&btc(), 50_000.0);
        let config = EngineConfig {
            fill_poll_interval_ms: 5,
            position_poll_interval_ms: 10,
            task_cancel_grace_ms: 500,
            scan_attempts: 1,
            scan_history_limit: 60,
            ..EngineConfig::default()
        };
        let engine = Arc::new(Engine::new(venue.clone(), &config));
        engine.add_configured_strategies(&config).await;
        let router = router(engine.clone(), control_rate_limiter(1_000));
        (venue, engine, router)
    }

    fn request(method: Method, uri: &str, body: Option<serde_json::Value>) -> http::Request<Body> {
        let builder = http::Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_venue, _engine, app) = app().await;
        let response = app.oneshot(request(Method::GET, "/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "running");
        assert_eq!(body["venue"], "simulated");
    }

    #[tokio::test]
    async fn test_open_trade_then_conflict() {
        let (_venue, engine, app) = app().await;
        let signal = serde_json::to_value(btc_long_signal()).unwrap();

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/trades", Some(signal.clone())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json_body(response).await;
        assert_eq!(body["trade"]["instrument"], "BTC/USDT");

        let response = app
            .oneshot(request(Method::POST, "/trades", Some(signal)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json_body(response).await["code"], "ERR_ALREADY_OPEN");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_single_instrument() {
        let (venue, engine, app) = app().await;
        engine.try_open_trade(btc_long_signal()).await.unwrap();

        let response = app
            .oneshot(request(Method::POST, "/trades/BTC-USDT/close", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["closed_positions"], 1);
        assert_eq!(venue.position_quantity(&btc()), 0.0);
        assert!(engine.active_trades().is_empty());
    }

    #[tokio::test]
    async fn test_close_all_with_nothing_open() {
        let (_venue, _engine, app) = app().await;
        let response = app
            .oneshot(request(Method::POST, "/trades/close-all", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"cancelled_orders": 0, "closed_positions": 0})
        );
    }

    #[tokio::test]
    async fn test_set_timeframe() {
        let (_venue, _engine, app) = app().await;

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/strategies/BTC-USDT/timeframe",
                Some(serde_json::json!({"timeframe": "15m"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["timeframe"], "15m");

        let response = app
            .clone()
            .oneshot(request(
                Method::PUT,
                "/strategies/ETH-USDT/timeframe",
                Some(serde_json::json!({"timeframe": "15m"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(
                Method::PUT,
                "/strategies/BTC-USDT/timeframe",
                Some(serde_json::json!({"timeframe": "7m"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scan_endpoint() {
        let (venue, engine, app) = app().await;
        venue.set_candles(&btc(), trend(50_000.0, 0.0, 60));

        let response = app
            .clone()
            .oneshot(request(Method::POST, "/scan/BTC-USDT", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(json_body(response).await["signal"].is_null());

        let response = app
            .oneshot(request(Method::POST, "/scan/DOGE-USDT", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_leverage_bounds() {
        let (_venue, _engine, app) = app().await;
        let response = app
            .clone()
            .oneshot(request(Method::PUT, "/leverage", Some(serde_json::json!({"leverage": 10}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["leverage"], 10);

        let response = app
            .oneshot(request(Method::PUT, "/leverage", Some(serde_json::json!({"leverage": 0}))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_sweep_and_monitors() {
        let (_venue, _engine, app) = app().await;
        let response = app
            .clone()
            .oneshot(request(Method::POST, "/sweep", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["checked"], 0);

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/sweep", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = app.oneshot(request(Method::GET, "/monitors", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["tasks"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let venue = Arc::new(SimulatedExchange::new());
        let engine = Arc::new(Engine::new(venue, &EngineConfig::default()));
        let app = router(engine, control_rate_limiter(1));

        let first = app.clone().oneshot(request(Method::GET, "/trades", None)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.oneshot(request(Method::GET, "/trades", None)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}
