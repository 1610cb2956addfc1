use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::Candle;
use crate::domain::entities::signal::{Side, Signal};
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::errors::ValidationError;
use crate::domain::services::indicators::{Indicator, ADX, EMA, FRAMA, RSI, STC, VFI};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Capabilities a strategy declares once, at registration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyDescriptor {
    pub name: String,
    /// Candle fields the strategy reads
    pub required_fields: BTreeSet<&'static str>,
    /// Fewest candles that can produce a signal
    pub min_history: usize,
}

/// Signal source: turns recent history into at most one candidate trade
pub trait Strategy: Send + Sync {
    fn descriptor(&self) -> StrategyDescriptor;

    fn generate_signal(&self, instrument: &Instrument, timeframe: Timeframe, candles: &[Candle]) -> Option<Signal>;
}

/// Which sides a strategy may trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeDirection {
    Long,
    Short,
    Both,
}

impl TradeDirection {
    pub fn allows(&self, side: Side) -> bool {
        matches!(
            (self, side),
            (TradeDirection::Both, _) | (TradeDirection::Long, Side::Long) | (TradeDirection::Short, Side::Short)
        )
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeDirection::Long => write!(f, "long"),
            TradeDirection::Short => write!(f, "short"),
            TradeDirection::Both => write!(f, "both"),
        }
    }
}

impl FromStr for TradeDirection {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "long" => Ok(TradeDirection::Long),
            "short" => Ok(TradeDirection::Short),
            "both" => Ok(TradeDirection::Both),
            other => Err(ValidationError::InvalidSide(other.to_string())),
        }
    }
}

/// Strategy traded on `instrument`, resolved once when it is registered.
/// ETH runs the ADX-filtered trend, every other instrument the STC/VFI trend.
pub fn strategy_for(instrument: &Instrument, direction: TradeDirection) -> Arc<dyn Strategy> {
    match instrument.base() {
        "ETH" => Arc::new(FramaAdxTrend::new(direction)),
        _ => Arc::new(FramaTrend::new(direction)),
    }
}

/// Signal with stop-loss and trailing distances taken as percentages of `close`
fn percent_signal(
    instrument: &Instrument,
    timeframe: Timeframe,
    side: Side,
    close: f64,
    (stop_loss_pct, trigger_pct, step_pct): (f64, f64, f64),
    strategy_name: &str,
) -> Signal {
    let stop_distance = close * stop_loss_pct / 100.0;
    let stop_loss = match side {
        Side::Long => close - stop_distance,
        Side::Short => close + stop_distance,
    };

    Signal {
        instrument: instrument.clone(),
        side,
        entry_price: close,
        stop_loss,
        trailing_activation_distance: close * trigger_pct / 100.0,
        trailing_step_distance: close * step_pct / 100.0,
        trailing_enabled: true,
        quantity: None,
        strategy_name: strategy_name.to_string(),
        timeframe,
        generated_at: Utc::now(),
    }
}

/// Trend strategy: price against FRAMA, momentum from STC, participation from VFI.
/// Stop-loss and trailing distances are percentages of the entry close.
pub struct FramaTrend {
    pub frama: FRAMA,
    pub stc: STC,
    pub vfi: VFI,
    pub stop_loss_pct: f64,
    pub trailing_trigger_pct: f64,
    pub trailing_step_pct: f64,
    pub direction: TradeDirection,
}

impl FramaTrend {
    pub const NAME: &'static str = "FramaTrend";

    const STC_LONG_FLOOR: f64 = 48.0;
    const STC_SHORT_CEILING: f64 = 52.0;
    const VFI_BAND: f64 = 0.15;

    pub fn new(direction: TradeDirection) -> Self {
        FramaTrend {
            frama: FRAMA::new(12),
            stc: STC::new(23),
            vfi: VFI::new(120),
            stop_loss_pct: 0.6,
            trailing_trigger_pct: 0.9,
            trailing_step_pct: 0.3,
            direction,
        }
    }

    fn min_history(&self) -> usize {
        (self.frama.length + 5).max(self.stc.length).max(VFI::warm_up())
    }

    fn side_for(&self, close: f64, frama: f64, stc: f64, vfi: f64) -> Option<Side> {
        let long = close > frama && stc > Self::STC_LONG_FLOOR && vfi > -Self::VFI_BAND;
        let short = close < frama && stc < Self::STC_SHORT_CEILING && vfi < Self::VFI_BAND;

        if long && self.direction.allows(Side::Long) {
            Some(Side::Long)
        } else if short && self.direction.allows(Side::Short) {
            Some(Side::Short)
        } else {
            None
        }
    }
}

impl Default for FramaTrend {
    fn default() -> Self {
        Self::new(TradeDirection::Both)
    }
}

impl Strategy for FramaTrend {
    fn descriptor(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            name: Self::NAME.to_string(),
            required_fields: ["close", "high", "low", "volume"].into_iter().collect(),
            min_history: self.min_history(),
        }
    }

    fn generate_signal(&self, instrument: &Instrument, timeframe: Timeframe, candles: &[Candle]) -> Option<Signal> {
        if candles.len() < self.min_history() {
            return None;
        }

        let close = candles.last()?.close;
        let frama = self.frama.latest(candles)?;
        let stc = self.stc.latest(candles)?;
        let vfi = self.vfi.latest(candles)?;
        let side = self.side_for(close, frama, stc, vfi)?;

        Some(percent_signal(
            instrument,
            timeframe,
            side,
            close,
            (self.stop_loss_pct, self.trailing_trigger_pct, self.trailing_step_pct),
            Self::NAME,
        ))
    }
}

/// Filtered trend strategy: trades only when ADX shows a trend, price sits on
/// the same side of FRAMA and the 200 EMA, and RSI clears 50 by a margin
pub struct FramaAdxTrend {
    pub frama: FRAMA,
    pub adx: ADX,
    pub rsi: RSI,
    pub ema: EMA,
    pub adx_min: f64,
    pub rsi_entry_margin: f64,
    pub stop_loss_pct: f64,
    pub trailing_trigger_pct: f64,
    pub trailing_step_pct: f64,
    pub direction: TradeDirection,
}

impl FramaAdxTrend {
    pub const NAME: &'static str = "FramaAdxTrend";

    pub fn new(direction: TradeDirection) -> Self {
        FramaAdxTrend {
            frama: FRAMA::new(14),
            adx: ADX::new(14),
            rsi: RSI::new(14),
            ema: EMA::new(200),
            adx_min: 15.0,
            rsi_entry_margin: 5.0,
            stop_loss_pct: 1.0,
            trailing_trigger_pct: 1.5,
            trailing_step_pct: 0.7,
            direction,
        }
    }

    fn min_history(&self) -> usize {
        self.frama
            .length
            .max(self.ema.period)
            .max(self.rsi.length)
            .max(self.adx.length)
            + 5
    }

    fn side_for(&self, close: f64, frama: f64, ema: f64, adx: f64, rsi: f64) -> Option<Side> {
        if adx <= self.adx_min {
            return None;
        }
        let long = close > ema && close > frama && rsi > 50.0 + self.rsi_entry_margin;
        let short = close < ema && close < frama && rsi < 50.0 - self.rsi_entry_margin;

        if long && self.direction.allows(Side::Long) {
            Some(Side::Long)
        } else if short && self.direction.allows(Side::Short) {
            Some(Side::Short)
        } else {
            None
        }
    }
}

impl Default for FramaAdxTrend {
    fn default() -> Self {
        Self::new(TradeDirection::Both)
    }
}

impl Strategy for FramaAdxTrend {
    fn descriptor(&self) -> StrategyDescriptor {
        StrategyDescriptor {
            name: Self::NAME.to_string(),
            required_fields: ["close", "high", "low"].into_iter().collect(),
            min_history: self.min_history(),
        }
    }

    fn generate_signal(&self, instrument: &Instrument, timeframe: Timeframe, candles: &[Candle]) -> Option<Signal> {
        if candles.len() < self.min_history() {
            return None;
        }

        let close = candles.last()?.close;
        let frama = self.frama.latest(candles)?;
        let ema = self.ema.latest(candles)?;
        let adx = self.adx.latest(candles)?;
        let rsi = self.rsi.latest(candles)?;
        let side = self.side_for(close, frama, ema, adx, rsi)?;

        Some(percent_signal(
            instrument,
            timeframe,
            side,
            close,
            (self.stop_loss_pct, self.trailing_trigger_pct, self.trailing_step_pct),
            Self::NAME,
        ))
    }
}
