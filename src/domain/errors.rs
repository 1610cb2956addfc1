//! Error taxonomy for trade entry, protective orders and reconciliation

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Input that could not be parsed into a domain value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid instrument: {0}")]
    InvalidSymbol(String),

    #[error("Invalid timeframe: {0}")]
    InvalidTimeframe(String),

    #[error("Invalid side: {0}")]
    InvalidSide(String),

    #[error("Invalid leverage: {0} (must be between 1 and 100)")]
    InvalidLeverage(u32),
}

/// Why the venue refused an order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderFailureKind {
    InsufficientBalance,
    SizePrecision,
    RateLimited,
    MarketClosed,
    Unknown,
}

impl fmt::Display for OrderFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderFailureKind::InsufficientBalance => write!(f, "insufficient balance"),
            OrderFailureKind::SizePrecision => write!(f, "size precision"),
            OrderFailureKind::RateLimited => write!(f, "rate limited"),
            OrderFailureKind::MarketClosed => write!(f, "market closed"),
            OrderFailureKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Failures surfaced by the trader and reconciliation paths
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeError {
    /// A trade or live monitor already exists for the instrument
    #[error("Trade already open for {instrument}")]
    AlreadyOpenTrade { instrument: String },

    #[error("Insufficient funds: available {available:.2}, minimum {minimum:.2}")]
    InsufficientFunds { available: f64, minimum: f64 },

    #[error("Invalid signal: {reason}")]
    InvalidSignal { reason: String },

    #[error("Failed to fetch balance: {reason}")]
    BalanceFetchFailed { reason: String },

    #[error("Order submission failed ({kind}): {reason}")]
    OrderSubmissionFailed {
        kind: OrderFailureKind,
        reason: String,
    },

    /// Transient; the fill watch keeps polling
    #[error("Order status unavailable for {order_id}: {reason}")]
    OrderStatusUnavailable { order_id: String, reason: String },

    /// Bookkeeping disagreed with the venue and was repaired
    #[error("Reconciliation mismatch on {instrument}: {detail}")]
    ReconciliationMismatch { instrument: String, detail: String },
}

impl TradeError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TradeError::AlreadyOpenTrade { .. } => ErrorSeverity::Minor,
            TradeError::InvalidSignal { .. } => ErrorSeverity::Minor,
            TradeError::OrderStatusUnavailable { .. } => ErrorSeverity::Minor,
            TradeError::InsufficientFunds { .. } => ErrorSeverity::Moderate,
            TradeError::BalanceFetchFailed { .. } => ErrorSeverity::Moderate,
            TradeError::ReconciliationMismatch { .. } => ErrorSeverity::Moderate,
            TradeError::OrderSubmissionFailed { kind, .. } => match kind {
                OrderFailureKind::RateLimited | OrderFailureKind::MarketClosed => {
                    ErrorSeverity::Moderate
                }
                _ => ErrorSeverity::Critical,
            },
        }
    }

    /// Short error code for logging/monitoring
    pub fn error_code(&self) -> &'static str {
        match self {
            TradeError::AlreadyOpenTrade { .. } => "ERR_ALREADY_OPEN",
            TradeError::InsufficientFunds { .. } => "ERR_INSUFFICIENT_FUNDS",
            TradeError::InvalidSignal { .. } => "ERR_INVALID_SIGNAL",
            TradeError::BalanceFetchFailed { .. } => "ERR_BALANCE_FETCH",
            TradeError::OrderSubmissionFailed { .. } => "ERR_ORDER_SUBMISSION",
            TradeError::OrderStatusUnavailable { .. } => "ERR_ORDER_STATUS",
            TradeError::ReconciliationMismatch { .. } => "ERR_RECONCILIATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Expected to occur occasionally
    Minor,
    Moderate,
    /// Requires operator attention
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Minor => write!(f, "Minor"),
            ErrorSeverity::Moderate => write!(f, "Moderate"),
            ErrorSeverity::Critical => write!(f, "Critical"),
        }
    }
}

impl From<TradeError> for String {
    fn from(error: TradeError) -> Self {
        error.to_string()
    }
}
