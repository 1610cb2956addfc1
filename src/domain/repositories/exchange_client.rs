//! Exchange Client Trait
//!
//! The venue seam used by the trader, the protective-order monitors, the
//! sweeper and the scan scheduler. Every call is assumed at-least-once with no
//! ordering guarantee across calls; callers re-read venue state rather than
//! trusting their own last write.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{
    Candle, ContractSpec, OrderSnapshot, OrderStatus, Position, Ticker,
};
use crate::domain::entities::signal::Side;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::errors::OrderFailureKind;
use async_trait::async_trait;
use thiserror::Error;

/// Common result type for exchange operations
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors that can occur during exchange operations
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExchangeError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The venue answered with a business error code
    #[error("Exchange rejected request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl ExchangeError {
    /// Map a venue failure onto the order-failure taxonomy
    pub fn classify(&self) -> OrderFailureKind {
        match self {
            ExchangeError::RateLimited(_) => OrderFailureKind::RateLimited,
            ExchangeError::Rejected { code, message } => classify_rejection(code, message),
            _ => OrderFailureKind::Unknown,
        }
    }

    /// Worth retrying on the next poll
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Network(_) | ExchangeError::RateLimited(_))
    }
}

fn classify_rejection(code: &str, message: &str) -> OrderFailureKind {
    let message = message.to_lowercase();
    match code {
        "429" | "42901" => return OrderFailureKind::RateLimited,
        "40754" | "40762" | "43012" => return OrderFailureKind::InsufficientBalance,
        "40808" | "45110" | "45111" => return OrderFailureKind::SizePrecision,
        _ => {}
    }

    if message.contains("insufficient") || message.contains("exceeds the balance") {
        OrderFailureKind::InsufficientBalance
    } else if message.contains("precision")
        || message.contains("checkbdscale")
        || message.contains("minimum order")
        || message.contains("decimal")
    {
        OrderFailureKind::SizePrecision
    } else if message.contains("too many requests") || message.contains("rate limit") {
        OrderFailureKind::RateLimited
    } else if message.contains("market closed")
        || message.contains("not open")
        || message.contains("suspended")
        || message.contains("maintenance")
    {
        OrderFailureKind::MarketClosed
    } else {
        OrderFailureKind::Unknown
    }
}

/// Market entry, optionally with a preset stop-loss and trailing stop
#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrderRequest {
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: f64,
    pub stop_loss: Option<f64>,
    pub trailing_activation: Option<f64>,
    pub trailing_callback_pct: Option<f64>,
}

/// Stand-alone trailing stop protecting an open position
#[derive(Debug, Clone, PartialEq)]
pub struct TrailingStopRequest {
    pub instrument: Instrument,
    /// Side of the position being protected
    pub side: Side,
    pub quantity: f64,
    pub activation_price: f64,
    pub callback_pct: f64,
}

/// Exchange client trait providing the venue operations the engine needs
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Get the name of this exchange
    fn name(&self) -> &str;

    /// Available margin balance in the quote currency
    async fn get_balance(&self) -> ExchangeResult<f64>;

    async fn get_ticker_price(&self, instrument: &Instrument) -> ExchangeResult<Ticker>;

    /// Quantity and price precision for an instrument
    async fn contract_spec(&self, _instrument: &Instrument) -> ExchangeResult<ContractSpec> {
        Ok(ContractSpec::default())
    }

    async fn set_leverage(&self, leverage: u32, instrument: &Instrument) -> ExchangeResult<()>;

    /// Submit a market order, returning the exchange-assigned order ID
    async fn create_market_order(&self, request: &MarketOrderRequest) -> ExchangeResult<String>;

    /// Place a trailing stop, returning the exchange-assigned order ID
    async fn place_trailing_stop(&self, request: &TrailingStopRequest) -> ExchangeResult<String>;

    /// `OrderStatus::Unknown` when the venue no longer knows the order
    async fn fetch_order(&self, order_id: &str, instrument: &Instrument)
        -> ExchangeResult<OrderStatus>;

    async fn fetch_open_orders(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<OrderSnapshot>>;

    /// Open positions only; flat instruments are omitted
    async fn fetch_positions(&self, instrument: Option<&Instrument>)
        -> ExchangeResult<Vec<Position>>;

    async fn cancel_order(&self, order_id: &str, instrument: &Instrument) -> ExchangeResult<()>;

    /// Flatten a position at market
    async fn close_position(&self, position: &Position) -> ExchangeResult<()>;

    async fn fetch_ohlcv(
        &self,
        instrument: &Instrument,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>>;

    /// Check if the exchange client is healthy and connected
    async fn is_healthy(&self) -> bool {
        true
    }
}
