//! Local bookkeeping for open trades and their protective orders

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::signal::{Side, Signal};
use crate::domain::entities::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trailing-stop parameters in absolute price units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrailingPlan {
    pub enabled: bool,
    /// Absolute activation price computed at entry
    pub activation_price: f64,
    /// Distance used to recompute activation on replacement
    pub activation_distance: f64,
    /// Absolute trailing step
    pub step: f64,
}

/// Trailing-stop order parameters as the venue wants them
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrailingParams {
    pub activation_price: f64,
    /// Callback as a percentage of the activation price
    pub callback_pct: f64,
}

impl TrailingParams {
    /// Convert absolute distances into venue parameters around `reference`
    pub fn derive(side: Side, reference: f64, activation_distance: f64, step: f64) -> Self {
        let activation_price = side.offset(reference, activation_distance);
        Self::at_activation(activation_price, step)
    }

    pub fn at_activation(activation_price: f64, step: f64) -> Self {
        let callback_pct = if activation_price > 0.0 {
            step / activation_price * 100.0
        } else {
            0.0
        };
        Self {
            activation_price,
            callback_pct,
        }
    }
}

/// One open trade, owned by the trader and destroyed on confirmed close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub instrument: Instrument,
    pub entry_order_id: String,
    pub side: Side,
    pub quantity: f64,
    pub stop_loss: f64,
    pub trailing: TrailingPlan,
    pub opened_at: DateTime<Utc>,
    pub strategy_name: String,
    pub timeframe: Timeframe,
}

impl TradeRecord {
    /// Build the record for a submitted entry order
    pub fn from_signal(signal: &Signal, entry_order_id: String, quantity: f64) -> Self {
        let params = TrailingParams::derive(
            signal.side,
            signal.entry_price,
            signal.trailing_activation_distance,
            signal.trailing_step_distance,
        );

        Self {
            instrument: signal.instrument.clone(),
            entry_order_id,
            side: signal.side,
            quantity,
            stop_loss: signal.stop_loss,
            trailing: TrailingPlan {
                enabled: signal.trailing_enabled,
                activation_price: params.activation_price,
                activation_distance: signal.trailing_activation_distance,
                step: signal.trailing_step_distance,
            },
            opened_at: Utc::now(),
            strategy_name: signal.strategy_name.clone(),
            timeframe: signal.timeframe,
        }
    }

    /// Parameters for the first trailing order after fill
    pub fn initial_trailing_params(&self) -> TrailingParams {
        TrailingParams::at_activation(self.trailing.activation_price, self.trailing.step)
    }

    /// Parameters recomputed from the current market price
    pub fn trailing_params_from(&self, reference: f64) -> TrailingParams {
        TrailingParams::derive(
            self.side,
            reference,
            self.trailing.activation_distance,
            self.trailing.step,
        )
    }
}

/// Protective-order state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    AwaitingFill,
    TrailingInstalled,
    TrailingTriggeredAwaitingReplacement,
    Closed,
}

/// Observable state of a position's protection, published by its monitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectiveOrderState {
    pub instrument: Instrument,
    pub order_id: Option<String>,
    pub side: Side,
    pub last_known_quantity: f64,
    pub phase: MonitorPhase,
    pub updated_at: DateTime<Utc>,
}

impl ProtectiveOrderState {
    pub fn awaiting_fill(record: &TradeRecord) -> Self {
        Self {
            instrument: record.instrument.clone(),
            order_id: None,
            side: record.side,
            last_known_quantity: 0.0,
            phase: MonitorPhase::AwaitingFill,
            updated_at: Utc::now(),
        }
    }

    pub fn with_phase(mut self, phase: MonitorPhase) -> Self {
        self.phase = phase;
        self.updated_at = Utc::now();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::tests::btc_long_signal;

    #[test]
    fn test_long_record_adds_activation_distance() {
        let record = TradeRecord::from_signal(&btc_long_signal(), "entry-1".to_string(), 0.06);
        assert_eq!(record.trailing.activation_price, 50_350.0);
        assert_eq!(record.trailing.step, 125.0);
        assert_eq!(record.quantity, 0.06);

        let params = record.initial_trailing_params();
        assert!((params.callback_pct - 125.0 / 50_350.0 * 100.0).abs() < 1e-12);
        assert!((params.callback_pct - 0.248).abs() < 0.001);
    }

    #[test]
    fn test_short_record_subtracts_activation_distance() {
        let mut signal = btc_long_signal();
        signal.side = Side::Short;
        signal.stop_loss = 50_300.0;
        let record = TradeRecord::from_signal(&signal, "entry-2".to_string(), 0.06);
        assert_eq!(record.trailing.activation_price, 49_650.0);
    }

    #[test]
    fn test_replacement_params_follow_current_price() {
        let record = TradeRecord::from_signal(&btc_long_signal(), "entry-3".to_string(), 0.06);
        let params = record.trailing_params_from(51_000.0);
        assert_eq!(params.activation_price, 51_350.0);
        assert!((params.callback_pct - 125.0 / 51_350.0 * 100.0).abs() < 1e-12);
    }
}
