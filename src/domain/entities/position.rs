//! Venue-side views: positions, orders, tickers and candles

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::signal::Side;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantities below this are treated as a flat position
pub const QUANTITY_EPSILON: f64 = 1e-9;

/// Real position as reported by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: Instrument,
    pub side: Side,
    pub quantity: f64,
    pub mark_price: f64,
    pub entry_price: Option<f64>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.quantity > QUANTITY_EPSILON
    }
}

/// Total open quantity for `instrument` across the returned positions
pub fn open_quantity(positions: &[Position], instrument: &Instrument) -> f64 {
    positions
        .iter()
        .filter(|p| &p.instrument == instrument && p.is_open())
        .map(|p| p.quantity)
        .sum()
}

/// Order status from the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
    /// Order unknown to the venue
    Unknown,
}

impl OrderStatus {
    pub fn is_terminal_without_fill(&self) -> bool {
        matches!(
            self,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Expired => write!(f, "EXPIRED"),
            OrderStatus::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl OrderKind {
    /// Stop-loss and trailing-stop orders protect an open position
    pub fn is_protective(&self) -> bool {
        matches!(self, OrderKind::StopLoss | OrderKind::TrailingStop)
    }
}

/// Open order as listed by the venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub id: String,
    pub instrument: Instrument,
    pub kind: OrderKind,
    pub side: Option<Side>,
    pub quantity: f64,
    pub trigger_price: Option<f64>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub last: f64,
    pub mark: f64,
    pub index: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Open time, milliseconds since epoch
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Trading rules for one contract
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContractSpec {
    pub quantity_precision: u32,
    pub price_precision: u32,
    pub min_quantity: f64,
}

impl Default for ContractSpec {
    fn default() -> Self {
        Self {
            quantity_precision: 6,
            price_precision: 2,
            min_quantity: 0.0,
        }
    }
}

impl ContractSpec {
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_to(quantity, self.quantity_precision)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to(price, self.price_precision)
    }
}

pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(symbol: &str, quantity: f64) -> Position {
        Position {
            instrument: Instrument::parse(symbol).unwrap(),
            side: Side::Long,
            quantity,
            mark_price: 100.0,
            entry_price: None,
        }
    }

    #[test]
    fn test_open_quantity_filters_instrument_and_flat() {
        let btc = Instrument::parse("BTC/USDT").unwrap();
        let positions = vec![
            position("BTC/USDT", 0.5),
            position("ETH/USDT", 2.0),
            position("BTC/USDT", 0.0),
        ];
        assert_eq!(open_quantity(&positions, &btc), 0.5);
        assert_eq!(open_quantity(&[], &btc), 0.0);
    }

    #[test]
    fn test_round_quantity() {
        let spec = ContractSpec {
            quantity_precision: 3,
            ..ContractSpec::default()
        };
        assert_eq!(spec.round_quantity(0.06049), 0.06);
        assert_eq!(spec.round_quantity(0.0005), 0.001);
        assert_eq!(spec.round_quantity(0.0004), 0.0);
    }

    #[test]
    fn test_protective_kinds() {
        assert!(OrderKind::StopLoss.is_protective());
        assert!(OrderKind::TrailingStop.is_protective());
        assert!(!OrderKind::TakeProfit.is_protective());
        assert!(!OrderKind::Market.is_protective());
    }

    #[test]
    fn test_order_status_display() {
        assert_eq!(OrderStatus::Filled.to_string(), "FILLED");
        assert!(OrderStatus::Cancelled.is_terminal_without_fill());
        assert!(!OrderStatus::Unknown.is_terminal_without_fill());
    }
}
