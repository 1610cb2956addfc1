use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::errors::{TradeError, ValidationError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// Order side that opens a position in this direction
    pub fn entry_order_side(&self) -> &'static str {
        match self {
            Side::Long => "buy",
            Side::Short => "sell",
        }
    }

    /// Move `price` by `distance` in the favourable direction
    pub fn offset(&self, price: f64, distance: f64) -> f64 {
        match self {
            Side::Long => price + distance,
            Side::Short => price - distance,
        }
    }

    /// True when `stop` sits on the losing side of `entry`
    pub fn is_protective_stop(&self, entry: f64, stop: f64) -> bool {
        match self {
            Side::Long => stop < entry,
            Side::Short => stop > entry,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Long => "long",
            Side::Short => "short",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

impl FromStr for Side {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" | "buy" => Ok(Side::Long),
            "short" | "sell" => Ok(Side::Short),
            other => Err(ValidationError::InvalidSide(other.to_string())),
        }
    }
}

/// Candidate trade produced by a strategy, consumed once by the trader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub instrument: Instrument,
    pub side: Side,
    /// Reference price the strategy saw when it fired
    pub entry_price: f64,
    pub stop_loss: f64,
    /// Absolute price distance from entry at which trailing activates
    pub trailing_activation_distance: f64,
    /// Absolute price distance the trailing stop keeps behind the best price
    pub trailing_step_distance: f64,
    #[serde(default = "default_trailing_enabled")]
    pub trailing_enabled: bool,
    /// Explicit order size; sized from balance when absent
    #[serde(default)]
    pub quantity: Option<f64>,
    pub strategy_name: String,
    pub timeframe: Timeframe,
    #[serde(default = "Utc::now")]
    pub generated_at: DateTime<Utc>,
}

fn default_trailing_enabled() -> bool {
    true
}

impl Signal {
    /// Reject signals with missing, non-finite or contradictory fields
    pub fn validate(&self) -> Result<(), TradeError> {
        let invalid = |reason: String| Err(TradeError::InvalidSignal { reason });

        if !self.entry_price.is_finite() || self.entry_price <= 0.0 {
            return invalid(format!("entry price {} must be positive", self.entry_price));
        }
        if !self.stop_loss.is_finite() || self.stop_loss <= 0.0 {
            return invalid(format!("stop-loss {} must be positive", self.stop_loss));
        }
        if !self.side.is_protective_stop(self.entry_price, self.stop_loss) {
            return invalid(format!(
                "stop-loss {} is on the wrong side of entry {} for a {} trade",
                self.stop_loss, self.entry_price, self.side
            ));
        }
        if self.trailing_enabled {
            if !self.trailing_activation_distance.is_finite() || self.trailing_activation_distance < 0.0 {
                return invalid("trailing activation distance must be non-negative".to_string());
            }
            if !self.trailing_step_distance.is_finite() || self.trailing_step_distance <= 0.0 {
                return invalid("trailing step distance must be positive".to_string());
            }
            if self.side.offset(self.entry_price, self.trailing_activation_distance) <= 0.0 {
                return invalid("trailing activation price would not be positive".to_string());
            }
        }
        if let Some(quantity) = self.quantity {
            if !quantity.is_finite() || quantity <= 0.0 {
                return invalid(format!("quantity {} must be positive", quantity));
            }
        }
        if self.strategy_name.trim().is_empty() {
            return invalid("strategy name is empty".to_string());
        }
        Ok(())
    }
}
