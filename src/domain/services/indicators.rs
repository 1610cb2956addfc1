use crate::domain::entities::position::Candle;

/// A technical indicator over OHLCV history.
///
/// Output is tail-aligned: the last value belongs to the last candle, and
/// warm-up candles produce no value, so the output may be shorter than the input.
pub trait Indicator {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64>;

    fn latest(&self, candles: &[Candle]) -> Option<f64> {
        self.calculate(candles).last().copied()
    }
}

/// Exponential moving average seeded with the first value
pub struct EMA {
    pub period: usize,
}

impl EMA {
    pub fn new(period: usize) -> Self {
        EMA { period }
    }

    pub fn calculate_on_values(&self, values: &[f64]) -> Vec<f64> {
        if values.is_empty() || self.period == 0 {
            return vec![];
        }
        let multiplier = 2.0 / (self.period as f64 + 1.0);
        let mut ema_values = Vec::with_capacity(values.len());
        let mut ema = values[0];
        ema_values.push(ema);

        for &val in values.iter().skip(1) {
            ema = (val - ema) * multiplier + ema;
            ema_values.push(ema);
        }

        ema_values
    }
}

impl Indicator for EMA {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        self.calculate_on_values(&closes)
    }
}

/// Fractal Adaptive Moving Average
pub struct FRAMA {
    pub length: usize,
}

impl FRAMA {
    const MIN_ALPHA: f64 = 0.01;

    pub fn new(length: usize) -> Self {
        FRAMA { length }
    }
}

impl Indicator for FRAMA {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        let length = self.length;
        let half = length / 2;
        if length < 2 || candles.len() < length {
            return vec![];
        }

        let mut frama = candles[length - 1].close;
        let mut values = Vec::with_capacity(candles.len() - length + 1);
        values.push(frama);

        for i in length..candles.len() {
            let window = &candles[i - length..i];
            let high1 = window.iter().map(|c| c.high).fold(f64::MIN, f64::max);
            let low1 = window.iter().map(|c| c.low).fold(f64::MAX, f64::min);
            let n1 = (high1 - low1) / length as f64;

            let mids = window[length - half..].iter().map(|c| (c.high + c.low) / 2.0);
            let (high2, low2) = mids.fold((f64::MIN, f64::MAX), |(hi, lo), m| (hi.max(m), lo.min(m)));
            let n2 = (high2 - low2) / half as f64;

            let dimension = if n1 + n2 > 0.0 { (n1 + n2).log2() } else { 0.0 };
            let alpha = (-4.6 * (dimension - 1.0)).exp().clamp(Self::MIN_ALPHA, 1.0);

            frama = alpha * candles[i].close + (1.0 - alpha) * frama;
            values.push(frama);
        }

        values
    }
}

/// Schaff Trend Cycle: stochastic of MACD(12, 26) over `length` bars
pub struct STC {
    pub length: usize,
    pub fast: EMA,
    pub slow: EMA,
}

impl STC {
    pub fn new(length: usize) -> Self {
        STC {
            length,
            fast: EMA::new(12),
            slow: EMA::new(26),
        }
    }
}

impl Indicator for STC {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.length == 0 || candles.len() < self.length {
            return vec![];
        }
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = self.fast.calculate_on_values(&closes);
        let slow = self.slow.calculate_on_values(&closes);
        let macd: Vec<f64> = fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect();

        macd.windows(self.length)
            .map(|window| {
                let lowest = window.iter().copied().fold(f64::MAX, f64::min);
                let highest = window.iter().copied().fold(f64::MIN, f64::max);
                let range = highest - lowest;
                let range = if range == 0.0 { 1.0 } else { range };
                let current = window[window.len() - 1];
                100.0 * (current - lowest) / range
            })
            .collect()
    }
}

/// Volume Flow Indicator: EMA of log-return weighted volume, spikes capped
/// at twice the short moving average
pub struct VFI {
    pub length: usize,
}

impl VFI {
    const CAP_WINDOW: usize = 10;

    pub fn new(length: usize) -> Self {
        VFI { length }
    }

    /// Candles needed before the first value exists
    pub fn warm_up() -> usize {
        Self::CAP_WINDOW + 1
    }
}

impl Indicator for VFI {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.length == 0 || candles.len() < Self::warm_up() {
            return vec![];
        }
        if candles.iter().any(|c| c.close <= 0.0) {
            return vec![];
        }

        // raw[k] belongs to candle k + 1
        let raw: Vec<f64> = candles
            .windows(2)
            .map(|pair| (pair[1].close / pair[0].close).ln() * pair[1].volume)
            .collect();

        let capped: Vec<f64> = raw
            .windows(Self::CAP_WINDOW)
            .map(|window| {
                let cap = 2.0 * window.iter().sum::<f64>() / Self::CAP_WINDOW as f64;
                let current = window[window.len() - 1];
                if current.abs() > cap.abs() {
                    if current > 0.0 {
                        cap
                    } else {
                        -cap
                    }
                } else {
                    current
                }
            })
            .collect();

        EMA::new(self.length).calculate_on_values(&capped)
    }
}

/// Relative Strength Index over simple rolling means of gains and losses
pub struct RSI {
    pub length: usize,
}

impl RSI {
    pub fn new(length: usize) -> Self {
        RSI { length }
    }
}

impl Indicator for RSI {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.length == 0 || candles.len() <= self.length {
            return vec![];
        }
        let deltas: Vec<f64> = candles.windows(2).map(|pair| pair[1].close - pair[0].close).collect();

        deltas
            .windows(self.length)
            .map(|window| {
                let gain = window.iter().filter(|d| **d > 0.0).sum::<f64>() / self.length as f64;
                let loss = -window.iter().filter(|d| **d < 0.0).sum::<f64>() / self.length as f64;
                if loss == 0.0 {
                    if gain == 0.0 {
                        50.0
                    } else {
                        100.0
                    }
                } else {
                    100.0 - 100.0 / (1.0 + gain / loss)
                }
            })
            .collect()
    }
}

/// Wilder's running average, seeded with the first value
fn wilder_smooth(values: &[f64], length: usize) -> Vec<f64> {
    let alpha = 1.0 / length as f64;
    let mut smoothed = Vec::with_capacity(values.len());
    let mut current = match values.first() {
        Some(first) => *first,
        None => return smoothed,
    };
    smoothed.push(current);
    for &value in &values[1..] {
        current = alpha * value + (1.0 - alpha) * current;
        smoothed.push(current);
    }
    smoothed
}

/// Average Directional Index with Wilder smoothing
pub struct ADX {
    pub length: usize,
}

impl ADX {
    pub fn new(length: usize) -> Self {
        ADX { length }
    }
}

impl Indicator for ADX {
    fn calculate(&self, candles: &[Candle]) -> Vec<f64> {
        if self.length == 0 || candles.len() <= self.length {
            return vec![];
        }

        let mut true_range = Vec::with_capacity(candles.len() - 1);
        let mut plus_dm = Vec::with_capacity(candles.len() - 1);
        let mut minus_dm = Vec::with_capacity(candles.len() - 1);
        for pair in candles.windows(2) {
            let (prev, bar) = (&pair[0], &pair[1]);
            true_range.push(
                (bar.high - bar.low)
                    .max((bar.high - prev.close).abs())
                    .max((bar.low - prev.close).abs()),
            );
            let up = bar.high - prev.high;
            let down = prev.low - bar.low;
            plus_dm.push(if up > down && up > 0.0 { up } else { 0.0 });
            minus_dm.push(if down > up && down > 0.0 { down } else { 0.0 });
        }

        let true_range = wilder_smooth(&true_range, self.length);
        let plus_dm = wilder_smooth(&plus_dm, self.length);
        let minus_dm = wilder_smooth(&minus_dm, self.length);

        let dx: Vec<f64> = true_range
            .iter()
            .zip(plus_dm.iter().zip(minus_dm.iter()))
            .map(|(tr, (plus, minus))| {
                if *tr == 0.0 {
                    return 0.0;
                }
                let plus_di = 100.0 * plus / tr;
                let minus_di = 100.0 * minus / tr;
                let sum = plus_di + minus_di;
                if sum == 0.0 {
                    0.0
                } else {
                    100.0 * (plus_di - minus_di).abs() / sum
                }
            })
            .collect();

        wilder_smooth(&dx, self.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64, spread: f64, volume: f64) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high: close + spread,
            low: close - spread,
            close,
            volume,
        }
    }

    fn ramp(start: f64, step: f64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| candle(start + step * i as f64, step.abs() / 2.0, 10.0))
            .collect()
    }

    #[test]
    fn test_ema_seeds_with_first_value() {
        let ema = EMA::new(3);
        let values = ema.calculate_on_values(&[10.0, 20.0, 20.0]);
        assert_eq!(values, vec![10.0, 15.0, 17.5]);
        assert!(EMA::new(0).calculate_on_values(&[1.0]).is_empty());
    }

    #[test]
    fn test_frama_follows_flat_market_exactly() {
        let candles: Vec<Candle> = (0..30).map(|_| candle(100.0, 0.0, 1.0)).collect();
        let values = FRAMA::new(12).calculate(&candles);
        assert_eq!(values.len(), 19);
        assert!(values.iter().all(|v| (*v - 100.0).abs() < 1e-12));
    }

    #[test]
    fn test_frama_lags_a_trend() {
        let rising = ramp(50_000.0, 50.0, 40);
        let last_close = rising.last().unwrap().close;
        let frama = FRAMA::new(12).latest(&rising).unwrap();
        assert!(frama < last_close);

        let falling = ramp(50_000.0, -50.0, 40);
        let last_close = falling.last().unwrap().close;
        let frama = FRAMA::new(12).latest(&falling).unwrap();
        assert!(frama > last_close);
    }

    #[test]
    fn test_frama_needs_full_window() {
        assert!(FRAMA::new(12).calculate(&ramp(100.0, 1.0, 11)).is_empty());
        assert_eq!(FRAMA::new(12).calculate(&ramp(100.0, 1.0, 12)).len(), 1);
    }

    #[test]
    fn test_stc_bounds_and_extremes() {
        let stc = STC::new(23);
        let rising = stc.calculate(&ramp(50_000.0, 50.0, 60));
        assert_eq!(rising.len(), 60 - 23 + 1);
        assert!(rising.iter().all(|v| (0.0..=100.0).contains(v)));
        assert!((rising.last().unwrap() - 100.0).abs() < 1e-9);

        let falling = stc.latest(&ramp(50_000.0, -50.0, 60)).unwrap();
        assert!(falling.abs() < 1e-9);
    }

    #[test]
    fn test_stc_flat_macd_is_zero() {
        let candles: Vec<Candle> = (0..30).map(|_| candle(100.0, 0.0, 1.0)).collect();
        assert_eq!(STC::new(23).latest(&candles), Some(0.0));
    }

    #[test]
    fn test_vfi_sign_follows_price_direction() {
        let vfi = VFI::new(120);
        assert!(vfi.latest(&ramp(50_000.0, 50.0, 40)).unwrap() > 0.0);
        assert!(vfi.latest(&ramp(50_000.0, -50.0, 40)).unwrap() < 0.0);
        assert!(vfi.calculate(&ramp(100.0, 1.0, 10)).is_empty());
        assert_eq!(vfi.calculate(&ramp(100.0, 1.0, 11)).len(), 1);
    }

    #[test]
    fn test_vfi_caps_volume_spikes() {
        let mut candles = ramp(100.0, 1.0, 12);
        candles[11].volume = 10_000.0;
        let raw_spike = (candles[11].close / candles[10].close).ln() * 10_000.0;
        let values = VFI::new(1).calculate(&candles);
        // span 1 EMA is the capped series itself
        assert!(*values.last().unwrap() < raw_spike);
    }

    #[test]
    fn test_rsi_extremes_and_flat_market() {
        let rsi = RSI::new(14);
        assert_eq!(rsi.latest(&ramp(100.0, 1.0, 30)), Some(100.0));
        assert_eq!(rsi.latest(&ramp(100.0, -1.0, 30)), Some(0.0));
        assert_eq!(rsi.latest(&ramp(100.0, 0.0, 30)), Some(50.0));
        assert!(rsi.calculate(&ramp(100.0, 1.0, 14)).is_empty());
        assert_eq!(rsi.calculate(&ramp(100.0, 1.0, 15)).len(), 1);
    }

    #[test]
    fn test_rsi_balanced_moves() {
        let closes = [10.0, 11.0, 10.0, 11.0, 10.0];
        let candles: Vec<Candle> = closes.iter().map(|c| candle(*c, 0.0, 1.0)).collect();
        assert_eq!(RSI::new(4).latest(&candles), Some(50.0));
    }

    #[test]
    fn test_adx_strong_in_trends_and_zero_when_flat() {
        let adx = ADX::new(14);
        assert!(adx.latest(&ramp(50_000.0, 50.0, 60)).unwrap() > 50.0);
        assert!(adx.latest(&ramp(50_000.0, -50.0, 60)).unwrap() > 50.0);
        assert_eq!(adx.latest(&ramp(50_000.0, 0.0, 60)), Some(0.0));
        assert!(adx.calculate(&ramp(100.0, 1.0, 14)).is_empty());
    }
}
