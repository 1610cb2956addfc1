//! # Bitget USDT-M Futures Client
//!
//! REST implementation of `ExchangeClient` against the Bitget v2 mix API.
//!
//! ## Authentication
//!
//! Every request carries `ACCESS-KEY`, `ACCESS-SIGN`, `ACCESS-TIMESTAMP` and
//! `ACCESS-PASSPHRASE`. The signature is
//! `base64(HMAC-SHA256(secret, timestamp + METHOD + path[?query] + body))`
//! with the timestamp in milliseconds.
//!
//! ## Conventions
//!
//! - Responses are wrapped in `{code, msg, data}`; anything but `"00000"` is a
//!   rejection.
//! - The account is expected in hedge mode: entries are sent with
//!   `tradeSide=open` and positions are closed per `holdSide`.
//! - Protective orders are plan orders (`loss_plan`, `pos_loss`,
//!   `moving_plan`) and are cancelled through the plan-order endpoint.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{
    Candle, ContractSpec, OrderKind, OrderSnapshot, OrderStatus, Position, Ticker,
};
use crate::domain::entities::signal::Side;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangeResult, MarketOrderRequest, TrailingStopRequest,
};
use crate::rate_limit::{venue_rate_limiter, SharedRateLimiter};
use crate::secrets::ApiCredentials;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Bitget production REST endpoint
pub const BITGET_API_BASE: &str = "https://api.bitget.com";

const SUCCESS_CODE: &str = "00000";
const PRODUCT_TYPE: &str = "USDT-FUTURES";
const MARGIN_COIN: &str = "USDT";
const MAX_CANDLES: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Plan types tried when cancelling an order the client has not seen listed
const PROTECTIVE_PLAN_TYPES: &[&str] = &["moving_plan", "loss_plan", "pos_loss"];

/// Codes meaning "no such order"
const ORDER_NOT_FOUND_CODES: &[&str] = &["40109", "40768", "43001", "43020", "43025"];

/// Codes for signature, key or passphrase problems
const AUTH_ERROR_CODES: &[&str] = &["40006", "40009", "40012", "40037"];

#[derive(Debug, Clone)]
pub struct BitgetConfig {
    pub api_base: String,
    pub requests_per_second: u32,
}

impl Default for BitgetConfig {
    fn default() -> Self {
        Self {
            api_base: BITGET_API_BASE.to_string(),
            requests_per_second: 10,
        }
    }
}

/// Response envelope shared by every endpoint
#[derive(Debug, Deserialize)]
struct Envelope {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountData {
    margin_coin: String,
    available: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerData {
    last_pr: String,
    mark_price: Option<String>,
    index_price: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractData {
    symbol: String,
    volume_place: String,
    price_place: String,
    #[serde(default)]
    min_trade_num: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderIdData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct OrderDetailData {
    state: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "T: Deserialize<'de>"))]
struct EntrustedList<T> {
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty")]
    entrusted_list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingOrderData {
    order_id: String,
    symbol: String,
    size: String,
    side: String,
    #[serde(default)]
    pos_side: Option<String>,
    order_type: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanOrderData {
    order_id: String,
    symbol: String,
    plan_type: String,
    size: String,
    #[serde(default)]
    trigger_price: Option<String>,
    side: String,
    #[serde(default)]
    pos_side: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionData {
    symbol: String,
    hold_side: String,
    total: String,
    #[serde(default)]
    mark_price: Option<String>,
    #[serde(default)]
    open_price_avg: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchResult {
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty")]
    success_list: Vec<Value>,
    #[serde(default = "Vec::new", deserialize_with = "null_as_empty")]
    failure_list: Vec<BatchFailure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchFailure {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_msg: Option<String>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// `base64(HMAC-SHA256(secret, timestamp + method + request_path + body))`
pub fn sign_request(
    secret: &str,
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String, ExchangeError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| ExchangeError::Authentication(format!("HMAC error: {}", e)))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn parse_f64(value: &str, field: &str) -> ExchangeResult<f64> {
    value
        .trim()
        .parse::<f64>()
        .map_err(|_| ExchangeError::Decode(format!("{} is not a number: {:?}", field, value)))
}

fn parse_optional_f64(value: Option<&str>) -> Option<f64> {
    value
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| v.trim().parse::<f64>().ok())
}

/// Fixed-point rendering, never scientific notation
fn format_decimal(value: f64, places: u32) -> String {
    format!("{:.*}", places as usize, value)
}

fn parse_order_state(state: &str) -> OrderStatus {
    match state.to_lowercase().as_str() {
        "init" | "new" | "live" => OrderStatus::Pending,
        "partially_filled" | "partial_fill" => OrderStatus::PartiallyFilled,
        "filled" | "full_fill" => OrderStatus::Filled,
        "canceled" | "cancelled" => OrderStatus::Cancelled,
        "rejected" => OrderStatus::Rejected,
        "expired" => OrderStatus::Expired,
        _ => OrderStatus::Unknown,
    }
}

fn plan_kind(plan_type: &str) -> OrderKind {
    match plan_type {
        "loss_plan" | "pos_loss" => OrderKind::StopLoss,
        "moving_plan" | "track_plan" => OrderKind::TrailingStop,
        "profit_plan" | "pos_profit" => OrderKind::TakeProfit,
        _ => OrderKind::Limit,
    }
}

/// Position side from `posSide`, falling back to the order side
fn snapshot_side(pos_side: Option<&str>, side: &str) -> Option<Side> {
    pos_side
        .and_then(|s| s.parse::<Side>().ok())
        .or_else(|| side.parse::<Side>().ok())
}

fn is_order_not_found(error: &ExchangeError) -> bool {
    match error {
        ExchangeError::NotFound(_) => true,
        ExchangeError::Rejected { code, message } => {
            let message = message.to_lowercase();
            ORDER_NOT_FOUND_CODES.contains(&code.as_str())
                || message.contains("does not exist")
                || message.contains("not exist")
                || message.contains("not found")
        }
        _ => false,
    }
}

/// Bitget REST client
pub struct BitgetClient {
    http: Client,
    base: Url,
    credentials: ApiCredentials,
    limiter: SharedRateLimiter,
    specs: RwLock<HashMap<Instrument, ContractSpec>>,
    plan_types: RwLock<HashMap<String, String>>,
}

impl std::fmt::Debug for BitgetClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitgetClient")
            .field("base", &self.base.as_str())
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl BitgetClient {
    pub fn new(credentials: ApiCredentials) -> Result<Self, ExchangeError> {
        Self::new_with_config(credentials, BitgetConfig::default())
    }

    pub fn new_with_config(
        credentials: ApiCredentials,
        config: BitgetConfig,
    ) -> Result<Self, ExchangeError> {
        let base = Url::parse(&config.api_base)
            .map_err(|e| ExchangeError::Network(format!("Invalid API base {}: {}", config.api_base, e)))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ExchangeError::Network(format!("Failed to build HTTP client: {}", e)))?;

        info!(
            "Bitget client ready ({}, {} req/s)",
            base, config.requests_per_second
        );

        Ok(Self {
            http,
            base,
            credentials,
            limiter: venue_rate_limiter(config.requests_per_second),
            specs: RwLock::new(HashMap::new()),
            plan_types: RwLock::new(HashMap::new()),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> ExchangeResult<T> {
        self.request(Method::GET, path, query, None).await
    }

    async fn post<T: DeserializeOwned>(&self, path: &str, body: Value) -> ExchangeResult<T> {
        self.request(Method::POST, path, &[], Some(body)).await
    }

    /// Signed request returning the decoded `data` field
    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> ExchangeResult<T> {
        self.limiter.until_ready().await;

        let mut url = self
            .base
            .join(path)
            .map_err(|e| ExchangeError::Network(format!("Invalid path {}: {}", path, e)))?;
        let query_string = if query.is_empty() {
            None
        } else {
            let mut serializer = url::form_urlencoded::Serializer::new(String::new());
            for (key, value) in query {
                serializer.append_pair(key, value);
            }
            Some(serializer.finish())
        };
        url.set_query(query_string.as_deref());

        let request_path = match &query_string {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = Utc::now().timestamp_millis().to_string();
        let signature = sign_request(
            &self.credentials.api_secret,
            &timestamp,
            method.as_str(),
            &request_path,
            &body,
        )?;

        let mut request = self
            .http
            .request(method.clone(), url)
            .header("ACCESS-KEY", self.credentials.api_key.as_str())
            .header("ACCESS-SIGN", signature)
            .header("ACCESS-TIMESTAMP", timestamp)
            .header("ACCESS-PASSPHRASE", self.credentials.passphrase.as_str())
            .header("Content-Type", "application/json")
            .header("locale", "en-US");
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ExchangeError::Network(format!("{} {} failed: {}", method, path, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ExchangeError::Network(format!("Failed to read response: {}", e)))?;

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExchangeError::RateLimited(text));
        }

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(ExchangeError::Decode(format!("{} {}: {}", method, path, e)))
            }
            Err(_) if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN => {
                return Err(ExchangeError::Authentication(format!("HTTP {}: {}", status, text)))
            }
            Err(_) => return Err(ExchangeError::Network(format!("HTTP {}: {}", status, text))),
        };

        if envelope.code != SUCCESS_CODE {
            debug!("{} {} rejected: {} {}", method, path, envelope.code, envelope.msg);
            return Err(if AUTH_ERROR_CODES.contains(&envelope.code.as_str()) {
                ExchangeError::Authentication(envelope.msg)
            } else {
                ExchangeError::Rejected {
                    code: envelope.code,
                    message: envelope.msg,
                }
            });
        }

        serde_json::from_value(envelope.data)
            .map_err(|e| ExchangeError::Decode(format!("{} {}: {}", method, path, e)))
    }

    fn cached_spec(&self, instrument: &Instrument) -> Option<ContractSpec> {
        self.specs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(instrument)
            .copied()
    }

    fn remember_plan(&self, order_id: &str, plan_type: &str) {
        self.plan_types
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(order_id.to_string(), plan_type.to_string());
    }

    fn known_plan(&self, order_id: &str) -> Option<String> {
        self.plan_types
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(order_id)
            .cloned()
    }

    fn forget_plan(&self, order_id: &str) {
        self.plan_types
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(order_id);
    }

    async fn cancel_plan_order(
        &self,
        order_id: &str,
        instrument: &Instrument,
        plan_type: &str,
    ) -> ExchangeResult<()> {
        let result: BatchResult = self
            .post(
                "/api/v2/mix/order/cancel-plan-order",
                json!({
                    "symbol": instrument.venue_symbol(),
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "planType": plan_type,
                    "orderIdList": [{ "orderId": order_id }],
                }),
            )
            .await?;

        if !result.success_list.is_empty() {
            return Ok(());
        }
        let failure = result.failure_list.into_iter().next();
        Err(ExchangeError::Rejected {
            code: failure
                .as_ref()
                .and_then(|f| f.error_code.clone())
                .unwrap_or_else(|| "40768".to_string()),
            message: failure
                .and_then(|f| f.error_msg)
                .unwrap_or_else(|| format!("plan order {} does not exist", order_id)),
        })
    }

    async fn fetch_regular_orders(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<OrderSnapshot>> {
        let mut query = vec![("productType", PRODUCT_TYPE.to_string())];
        if let Some(instrument) = instrument {
            query.push(("symbol", instrument.venue_symbol()));
        }
        let data: Option<EntrustedList<PendingOrderData>> =
            self.get("/api/v2/mix/order/orders-pending", &query).await?;

        data.map(|d| d.entrusted_list)
            .unwrap_or_default()
            .into_iter()
            .map(|order| {
                Ok(OrderSnapshot {
                    instrument: Instrument::parse(&order.symbol)
                        .map_err(|e| ExchangeError::Decode(e.to_string()))?,
                    kind: if order.order_type == "market" {
                        OrderKind::Market
                    } else {
                        OrderKind::Limit
                    },
                    side: snapshot_side(order.pos_side.as_deref(), &order.side),
                    quantity: parse_f64(&order.size, "size")?,
                    trigger_price: None,
                    status: order
                        .status
                        .as_deref()
                        .map(parse_order_state)
                        .unwrap_or(OrderStatus::Pending),
                    id: order.order_id,
                })
            })
            .collect()
    }

    async fn fetch_plan_orders(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<OrderSnapshot>> {
        let mut query = vec![
            ("productType", PRODUCT_TYPE.to_string()),
            ("planType", "profit_loss".to_string()),
        ];
        if let Some(instrument) = instrument {
            query.push(("symbol", instrument.venue_symbol()));
        }
        let data: Option<EntrustedList<PlanOrderData>> =
            self.get("/api/v2/mix/order/orders-plan-pending", &query).await?;

        let mut orders = Vec::new();
        for plan in data.map(|d| d.entrusted_list).unwrap_or_default() {
            self.remember_plan(&plan.order_id, &plan.plan_type);
            orders.push(OrderSnapshot {
                instrument: Instrument::parse(&plan.symbol)
                    .map_err(|e| ExchangeError::Decode(e.to_string()))?,
                kind: plan_kind(&plan.plan_type),
                side: snapshot_side(plan.pos_side.as_deref(), &plan.side),
                quantity: parse_optional_f64(Some(&plan.size)).unwrap_or(0.0),
                trigger_price: parse_optional_f64(plan.trigger_price.as_deref()),
                status: OrderStatus::Pending,
                id: plan.order_id,
            });
        }
        Ok(orders)
    }
}

#[async_trait]
impl ExchangeClient for BitgetClient {
    fn name(&self) -> &str {
        "bitget"
    }

    async fn get_balance(&self) -> ExchangeResult<f64> {
        let accounts: Vec<AccountData> = self
            .get(
                "/api/v2/mix/account/accounts",
                &[("productType", PRODUCT_TYPE.to_string())],
            )
            .await?;
        let account = accounts
            .into_iter()
            .find(|a| a.margin_coin.eq_ignore_ascii_case(MARGIN_COIN))
            .ok_or_else(|| ExchangeError::NotFound(format!("no {} futures account", MARGIN_COIN)))?;
        parse_f64(&account.available, "available")
    }

    async fn get_ticker_price(&self, instrument: &Instrument) -> ExchangeResult<Ticker> {
        let tickers: Vec<TickerData> = self
            .get(
                "/api/v2/mix/market/ticker",
                &[
                    ("symbol", instrument.venue_symbol()),
                    ("productType", PRODUCT_TYPE.to_string()),
                ],
            )
            .await?;
        let ticker = tickers
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {}", instrument)))?;

        let last = parse_f64(&ticker.last_pr, "lastPr")?;
        Ok(Ticker {
            last,
            mark: parse_optional_f64(ticker.mark_price.as_deref()).unwrap_or(last),
            index: parse_optional_f64(ticker.index_price.as_deref()).unwrap_or(last),
        })
    }

    async fn contract_spec(&self, instrument: &Instrument) -> ExchangeResult<ContractSpec> {
        if let Some(spec) = self.cached_spec(instrument) {
            return Ok(spec);
        }

        let contracts: Vec<ContractData> = self
            .get(
                "/api/v2/mix/market/contracts",
                &[
                    ("productType", PRODUCT_TYPE.to_string()),
                    ("symbol", instrument.venue_symbol()),
                ],
            )
            .await?;
        let symbol = instrument.venue_symbol();
        let contract = contracts
            .into_iter()
            .find(|c| c.symbol == symbol)
            .ok_or_else(|| ExchangeError::NotFound(format!("no contract for {}", instrument)))?;

        let places = |value: &str, field: &str| {
            value
                .trim()
                .parse::<u32>()
                .map_err(|_| ExchangeError::Decode(format!("{} is not an integer: {:?}", field, value)))
        };
        let spec = ContractSpec {
            quantity_precision: places(&contract.volume_place, "volumePlace")?,
            price_precision: places(&contract.price_place, "pricePlace")?,
            min_quantity: parse_optional_f64(contract.min_trade_num.as_deref()).unwrap_or(0.0),
        };
        self.specs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(instrument.clone(), spec);
        debug!("Cached contract spec for {}: {:?}", instrument, spec);
        Ok(spec)
    }

    async fn set_leverage(&self, leverage: u32, instrument: &Instrument) -> ExchangeResult<()> {
        let _: Value = self
            .post(
                "/api/v2/mix/account/set-leverage",
                json!({
                    "symbol": instrument.venue_symbol(),
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "leverage": leverage.to_string(),
                }),
            )
            .await?;
        info!("Leverage for {} set to {}x", instrument, leverage);
        Ok(())
    }

    async fn create_market_order(&self, request: &MarketOrderRequest) -> ExchangeResult<String> {
        let spec = self.contract_spec(&request.instrument).await?;
        let mut body = json!({
            "symbol": request.instrument.venue_symbol(),
            "productType": PRODUCT_TYPE,
            "marginMode": "isolated",
            "marginCoin": MARGIN_COIN,
            "size": format_decimal(spec.round_quantity(request.quantity), spec.quantity_precision),
            "side": request.side.entry_order_side(),
            "tradeSide": "open",
            "orderType": "market",
        });
        if let Some(stop_loss) = request.stop_loss {
            body["presetStopLossPrice"] =
                Value::String(format_decimal(spec.round_price(stop_loss), spec.price_precision));
        }
        if request.trailing_activation.is_some() {
            warn!(
                "Preset trailing stops are not supported on entry for {}; place one after the fill",
                request.instrument
            );
        }

        let data: OrderIdData = self.post("/api/v2/mix/order/place-order", body).await?;
        info!(
            "Market {} order {} submitted for {} ({:.6})",
            request.side, data.order_id, request.instrument, request.quantity
        );
        Ok(data.order_id)
    }

    async fn place_trailing_stop(&self, request: &TrailingStopRequest) -> ExchangeResult<String> {
        let spec = self.contract_spec(&request.instrument).await?;
        // venue expects the callback as a ratio
        let range_rate = request.callback_pct / 100.0;
        let data: OrderIdData = self
            .post(
                "/api/v2/mix/order/place-tpsl-order",
                json!({
                    "symbol": request.instrument.venue_symbol(),
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "planType": "moving_plan",
                    "triggerPrice": format_decimal(
                        spec.round_price(request.activation_price),
                        spec.price_precision,
                    ),
                    "triggerType": "mark_price",
                    "holdSide": request.side.as_str(),
                    "size": format_decimal(spec.round_quantity(request.quantity), spec.quantity_precision),
                    "rangeRate": format_decimal(range_rate, 4),
                }),
            )
            .await?;
        self.remember_plan(&data.order_id, "moving_plan");
        Ok(data.order_id)
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        instrument: &Instrument,
    ) -> ExchangeResult<OrderStatus> {
        let result: ExchangeResult<OrderDetailData> = self
            .get(
                "/api/v2/mix/order/detail",
                &[
                    ("symbol", instrument.venue_symbol()),
                    ("productType", PRODUCT_TYPE.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await;
        match result {
            Ok(detail) => Ok(parse_order_state(&detail.state)),
            Err(e) if is_order_not_found(&e) => Ok(OrderStatus::Unknown),
            Err(e) => Err(e),
        }
    }

    async fn fetch_open_orders(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<OrderSnapshot>> {
        let mut orders = self.fetch_regular_orders(instrument).await?;
        orders.extend(self.fetch_plan_orders(instrument).await?);
        Ok(orders)
    }

    async fn fetch_positions(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<Position>> {
        let data: Vec<PositionData> = match instrument {
            Some(instrument) => {
                self.get(
                    "/api/v2/mix/position/single-position",
                    &[
                        ("symbol", instrument.venue_symbol()),
                        ("productType", PRODUCT_TYPE.to_string()),
                        ("marginCoin", MARGIN_COIN.to_string()),
                    ],
                )
                .await?
            }
            None => {
                self.get(
                    "/api/v2/mix/position/all-position",
                    &[
                        ("productType", PRODUCT_TYPE.to_string()),
                        ("marginCoin", MARGIN_COIN.to_string()),
                    ],
                )
                .await?
            }
        };

        let mut positions = Vec::new();
        for raw in data {
            let position = Position {
                instrument: Instrument::parse(&raw.symbol)
                    .map_err(|e| ExchangeError::Decode(e.to_string()))?,
                side: raw
                    .hold_side
                    .parse::<Side>()
                    .map_err(|e| ExchangeError::Decode(e.to_string()))?,
                quantity: parse_f64(&raw.total, "total")?,
                mark_price: parse_optional_f64(raw.mark_price.as_deref()).unwrap_or(0.0),
                entry_price: parse_optional_f64(raw.open_price_avg.as_deref()),
            };
            if position.is_open() {
                positions.push(position);
            }
        }
        Ok(positions)
    }

    async fn cancel_order(&self, order_id: &str, instrument: &Instrument) -> ExchangeResult<()> {
        if let Some(plan_type) = self.known_plan(order_id) {
            let result = self.cancel_plan_order(order_id, instrument, &plan_type).await;
            return match result {
                Ok(()) => {
                    self.forget_plan(order_id);
                    Ok(())
                }
                Err(e) if is_order_not_found(&e) => {
                    self.forget_plan(order_id);
                    Err(ExchangeError::NotFound(format!("order {} is not open", order_id)))
                }
                Err(e) => Err(e),
            };
        }

        let regular: ExchangeResult<Value> = self
            .post(
                "/api/v2/mix/order/cancel-order",
                json!({
                    "symbol": instrument.venue_symbol(),
                    "productType": PRODUCT_TYPE,
                    "marginCoin": MARGIN_COIN,
                    "orderId": order_id,
                }),
            )
            .await;
        match regular {
            Ok(_) => return Ok(()),
            Err(e) if !is_order_not_found(&e) => return Err(e),
            Err(_) => debug!("{} is not a regular order, trying plan orders", order_id),
        }

        for plan_type in PROTECTIVE_PLAN_TYPES {
            match self.cancel_plan_order(order_id, instrument, plan_type).await {
                Ok(()) => return Ok(()),
                Err(e) if is_order_not_found(&e) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ExchangeError::NotFound(format!("order {} is not open", order_id)))
    }

    async fn close_position(&self, position: &Position) -> ExchangeResult<()> {
        let result: BatchResult = self
            .post(
                "/api/v2/mix/order/close-positions",
                json!({
                    "symbol": position.instrument.venue_symbol(),
                    "productType": PRODUCT_TYPE,
                    "holdSide": position.side.as_str(),
                }),
            )
            .await?;

        if result.success_list.is_empty() {
            if let Some(failure) = result.failure_list.into_iter().next() {
                return Err(ExchangeError::Rejected {
                    code: failure.error_code.unwrap_or_default(),
                    message: failure.error_msg.unwrap_or_default(),
                });
            }
        }
        info!("Closed {} {} position", position.side, position.instrument);
        Ok(())
    }

    async fn fetch_ohlcv(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        let rows: Vec<Vec<String>> = self
            .get(
                "/api/v2/mix/market/candles",
                &[
                    ("symbol", instrument.venue_symbol()),
                    ("productType", PRODUCT_TYPE.to_string()),
                    ("granularity", timeframe.venue_granularity().to_string()),
                    ("limit", limit.clamp(1, MAX_CANDLES).to_string()),
                ],
            )
            .await?;

        let mut candles = rows
            .iter()
            .map(|row| {
                if row.len() < 6 {
                    return Err(ExchangeError::Decode(format!("short candle row: {:?}", row)));
                }
                Ok(Candle {
                    timestamp: row[0]
                        .parse::<i64>()
                        .map_err(|_| ExchangeError::Decode(format!("bad candle timestamp {:?}", row[0])))?,
                    open: parse_f64(&row[1], "open")?,
                    high: parse_f64(&row[2], "high")?,
                    low: parse_f64(&row[3], "low")?,
                    close: parse_f64(&row[4], "close")?,
                    volume: parse_f64(&row[5], "volume")?,
                })
            })
            .collect::<ExchangeResult<Vec<_>>>()?;
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    async fn is_healthy(&self) -> bool {
        let result: ExchangeResult<Value> = self.get("/api/v2/public/time", &[]).await;
        if let Err(e) = &result {
            warn!("Bitget health check failed: {}", e);
        }
        result.is_ok()
    }
}
