use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::services::protective_monitor::MonitorSettings;
use crate::domain::services::scan_scheduler::ScanSettings;
use crate::domain::services::strategies::TradeDirection;
use crate::domain::services::trader::{TraderConfig, MAX_LEVERAGE, MIN_LEVERAGE};
use crate::task_runner::RetryPolicy;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

/// Engine configuration: defaults overridden from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub leverage: u32,
    pub position_size_percent: f64,
    pub min_balance_usdt: f64,
    pub fill_poll_interval_ms: u64,
    pub fill_timeout_seconds: u64,
    pub position_poll_interval_ms: u64,
    pub sweep_interval_seconds: u64,
    pub scan_attempts: u32,
    pub scan_attempt_delay_seconds: u64,
    pub scan_error_cooldown_seconds: u64,
    pub scan_history_limit: usize,
    pub task_cancel_grace_ms: u64,
    pub strategy_instruments: Vec<(Instrument, Timeframe)>,
    pub strategy_direction: TradeDirection,
    pub control_api_addr: String,
    pub control_requests_per_minute: u32,
    pub venue_requests_per_second: u32,
    pub bitget_api_base: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            leverage: 20,
            position_size_percent: 15.0,
            min_balance_usdt: 5.0,
            fill_poll_interval_ms: 2_000,
            fill_timeout_seconds: 600, // 10 minutes
            position_poll_interval_ms: 5_000,
            sweep_interval_seconds: 300, // 5 minutes
            scan_attempts: 3,
            scan_attempt_delay_seconds: 5,
            scan_error_cooldown_seconds: 10,
            scan_history_limit: 200,
            task_cancel_grace_ms: 5_000,
            strategy_instruments: vec![(
                Instrument::new("BTC", "USDT"),
                Timeframe::M1,
            )],
            strategy_direction: TradeDirection::Both,
            control_api_addr: "127.0.0.1:3000".to_string(),
            control_requests_per_minute: 120,
            venue_requests_per_second: 10,
            bitget_api_base: "https://api.bitget.com".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> EngineConfig {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; out-of-range or unparsable
    /// values are logged and the default kept
    pub fn from_lookup<L>(lookup: L) -> EngineConfig
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = EngineConfig::default();

        override_in_range(&lookup, "LEVERAGE", MIN_LEVERAGE..=MAX_LEVERAGE, &mut config.leverage);
        override_in_range(&lookup, "MIN_BALANCE_USDT", 0.0..=f64::MAX, &mut config.min_balance_usdt);
        override_in_range(&lookup, "FILL_POLL_INTERVAL_MS", 200..=60_000, &mut config.fill_poll_interval_ms);
        override_in_range(&lookup, "FILL_TIMEOUT_SECONDS", 10..=3_600, &mut config.fill_timeout_seconds);
        override_in_range(
            &lookup,
            "POSITION_POLL_INTERVAL_MS",
            1_000..=60_000,
            &mut config.position_poll_interval_ms,
        );
        override_in_range(&lookup, "SWEEP_INTERVAL_SECONDS", 10..=3_600, &mut config.sweep_interval_seconds);
        override_in_range(&lookup, "SCAN_ATTEMPTS", 1..=10, &mut config.scan_attempts);
        override_in_range(
            &lookup,
            "SCAN_ATTEMPT_DELAY_SECONDS",
            0..=60,
            &mut config.scan_attempt_delay_seconds,
        );
        override_in_range(
            &lookup,
            "SCAN_ERROR_COOLDOWN_SECONDS",
            1..=600,
            &mut config.scan_error_cooldown_seconds,
        );
        override_in_range(&lookup, "SCAN_HISTORY_LIMIT", 20..=1_000, &mut config.scan_history_limit);
        override_in_range(&lookup, "TASK_CANCEL_GRACE_MS", 100..=60_000, &mut config.task_cancel_grace_ms);
        override_in_range(
            &lookup,
            "CONTROL_REQUESTS_PER_MINUTE",
            1..=10_000,
            &mut config.control_requests_per_minute,
        );
        override_in_range(&lookup, "VENUE_REQUESTS_PER_SECOND", 1..=50, &mut config.venue_requests_per_second);

        // (0, 100]: zero is excluded, which a RangeInclusive cannot express
        if let Some(raw) = lookup("POSITION_SIZE_PERCENT") {
            match raw.trim().parse::<f64>() {
                Ok(value) if value > 0.0 && value <= 100.0 => config.position_size_percent = value,
                _ => tracing::warn!(
                    "Invalid POSITION_SIZE_PERCENT value: '{}' (must be in (0, 100]), using default: {}",
                    raw,
                    config.position_size_percent
                ),
            }
        }

        if let Some(raw) = lookup("STRATEGY_INSTRUMENTS") {
            match parse_strategy_instruments(&raw) {
                Ok(instruments) if !instruments.is_empty() => config.strategy_instruments = instruments,
                Ok(_) => tracing::warn!("STRATEGY_INSTRUMENTS is empty, using default"),
                Err(e) => tracing::warn!("Invalid STRATEGY_INSTRUMENTS '{}': {}, using default", raw, e),
            }
        }

        if let Some(raw) = lookup("STRATEGY_DIRECTION") {
            match raw.parse::<TradeDirection>() {
                Ok(direction) => config.strategy_direction = direction,
                Err(e) => tracing::warn!(
                    "Invalid STRATEGY_DIRECTION '{}': {}, using default: {}",
                    raw,
                    e,
                    config.strategy_direction
                ),
            }
        }

        if let Some(addr) = lookup("CONTROL_API_ADDR") {
            if addr.trim().parse::<std::net::SocketAddr>().is_ok() {
                config.control_api_addr = addr.trim().to_string();
            } else {
                tracing::warn!("Invalid CONTROL_API_ADDR '{}', using default: {}", addr, config.control_api_addr);
            }
        }

        if let Some(base) = lookup("BITGET_API_BASE") {
            match url::Url::parse(base.trim()) {
                Ok(_) => config.bitget_api_base = base.trim().trim_end_matches('/').to_string(),
                Err(e) => tracing::warn!("Invalid BITGET_API_BASE '{}': {}, using default", base, e),
            }
        }

        config
    }

    pub fn trader_config(&self) -> TraderConfig {
        TraderConfig {
            leverage: self.leverage,
            position_size_percent: self.position_size_percent,
            min_balance: self.min_balance_usdt,
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            fill_poll_interval: Duration::from_millis(self.fill_poll_interval_ms),
            fill_timeout: Duration::from_secs(self.fill_timeout_seconds),
            position_poll_interval: Duration::from_millis(self.position_poll_interval_ms),
        }
    }

    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            retry: RetryPolicy::new(
                self.scan_attempts,
                Duration::from_secs(self.scan_attempt_delay_seconds),
            ),
            error_cooldown: Duration::from_secs(self.scan_error_cooldown_seconds),
            history_limit: self.scan_history_limit,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.task_cancel_grace_ms)
    }
}

fn override_in_range<L, T>(lookup: &L, name: &str, range: RangeInclusive<T>, target: &mut T)
where
    L: Fn(&str) -> Option<String>,
    T: FromStr + PartialOrd + Display + Copy,
    T::Err: Display,
{
    let Some(raw) = lookup(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if range.contains(&value) => *target = value,
        Ok(value) => tracing::warn!(
            "Invalid {} value: {} (must be between {} and {}), using default: {}",
            name,
            value,
            range.start(),
            range.end(),
            target
        ),
        Err(e) => tracing::warn!("Failed to parse {} '{}': {}, using default: {}", name, raw, e, target),
    }
}

/// Parse `BTC/USDT:1m,ETH/USDT:15m`
pub fn parse_strategy_instruments(raw: &str) -> Result<Vec<(Instrument, Timeframe)>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (instrument, timeframe) = entry
                .rsplit_once(':')
                .ok_or_else(|| format!("'{}' is not instrument:timeframe", entry))?;
            let instrument = Instrument::parse(instrument).map_err(|e| e.to_string())?;
            let timeframe = timeframe.parse::<Timeframe>().map_err(|e| e.to_string())?;
            Ok((instrument, timeframe))
        })
        .collect()
}
