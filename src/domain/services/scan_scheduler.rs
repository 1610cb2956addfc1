//! Scan Scheduler
//!
//! One registry-owned scan loop per configured instrument. Each loop sleeps
//! until one second past the next candle boundary of its timeframe, runs a
//! short burst of scans and hands the first signal to the registered callback.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::signal::Signal;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeError};
use crate::domain::services::monitor_registry::{MonitorRegistry, TaskContext, TaskPurpose};
use crate::domain::services::strategies::{Strategy, StrategyDescriptor};
use crate::task_runner::{sleep_or_cancel, BurstOutcome, RetryPolicy};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives every signal a scan produces
pub type SignalCallback = Arc<dyn Fn(Signal) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wall clock the scan loops schedule against
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wrap an async closure as a `SignalCallback`
pub fn signal_callback<F, Fut>(f: F) -> SignalCallback
where
    F: Fn(Signal) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |signal| f(signal).boxed())
}

/// When the first attempt after `now` runs: one second past the next boundary
pub fn next_scan_at(now: DateTime<Utc>, timeframe: Timeframe) -> DateTime<Utc> {
    timeframe.next_boundary(now) + ChronoDuration::seconds(1)
}

/// Planned attempt times of the burst following `now`
pub fn burst_schedule(now: DateTime<Utc>, timeframe: Timeframe, retry: &RetryPolicy) -> Vec<DateTime<Utc>> {
    let first = next_scan_at(now, timeframe);
    retry
        .attempt_offsets()
        .into_iter()
        .map(|offset| first + ChronoDuration::from_std(offset).unwrap_or_else(|_| ChronoDuration::zero()))
        .collect()
}

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("No strategy configured for {0}")]
    NotConfigured(Instrument),
    #[error("Market data unavailable: {0}")]
    MarketData(#[from] ExchangeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub retry: RetryPolicy,
    /// Pause after a burst whose every attempt failed, before waiting for
    /// the next boundary
    pub error_cooldown: Duration,
    /// Candles requested per scan
    pub history_limit: usize,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            error_cooldown: Duration::from_secs(10),
            history_limit: 200,
        }
    }
}

/// Operator view of one configured strategy
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyInfo {
    pub instrument: Instrument,
    pub name: String,
    pub timeframe: Timeframe,
    pub active: bool,
    pub min_history: usize,
    pub required_fields: BTreeSet<&'static str>,
}

struct StrategySlot {
    strategy: Arc<dyn Strategy>,
    descriptor: StrategyDescriptor,
    timeframe: Timeframe,
    history: usize,
}

#[derive(Clone)]
pub struct ScanScheduler {
    exchange: Arc<dyn ExchangeClient>,
    registry: MonitorRegistry,
    settings: ScanSettings,
    slots: Arc<Mutex<HashMap<Instrument, StrategySlot>>>,
    callback: Arc<Mutex<Option<SignalCallback>>>,
    running: Arc<AtomicBool>,
    clock: Clock,
}

impl ScanScheduler {
    pub fn new(exchange: Arc<dyn ExchangeClient>, registry: MonitorRegistry, settings: ScanSettings) -> Self {
        Self {
            exchange,
            registry,
            settings,
            slots: Arc::new(Mutex::new(HashMap::new())),
            callback: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            clock: Arc::new(Utc::now),
        }
    }

    /// Schedule against `clock` instead of the system time
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> &ScanSettings {
        &self.settings
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<Instrument, StrategySlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Configure `strategy` for `instrument`, replacing any previous one.
    /// Starts its loop immediately when the scheduler is running.
    pub async fn add_strategy(&self, instrument: Instrument, timeframe: Timeframe, strategy: Arc<dyn Strategy>) {
        let descriptor = strategy.descriptor();
        let history = self.settings.history_limit.max(descriptor.min_history);
        if history > self.settings.history_limit {
            warn!(
                "{} needs {} candles, requesting more than the configured {}",
                descriptor.name, descriptor.min_history, self.settings.history_limit
            );
        }
        info!("Strategy {} configured for {} on {}", descriptor.name, instrument, timeframe);

        self.slots().insert(
            instrument.clone(),
            StrategySlot {
                strategy,
                descriptor,
                timeframe,
                history,
            },
        );

        if self.running.load(Ordering::SeqCst) {
            self.spawn_loop(instrument).await;
        }
    }

    pub fn register_signal_callback(&self, callback: SignalCallback) {
        *self.callback.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(callback);
    }

    fn configured(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = self.slots().keys().cloned().collect();
        instruments.sort();
        instruments
    }

    /// Start one scan loop per configured instrument
    pub async fn start(&self) -> usize {
        self.running.store(true, Ordering::SeqCst);
        let instruments = self.configured();
        for instrument in &instruments {
            self.spawn_loop(instrument.clone()).await;
        }
        info!("Scan scheduler started for {} instruments", instruments.len());
        instruments.len()
    }

    /// Cancel every scan loop and await their termination
    pub async fn stop(&self) -> usize {
        self.running.store(false, Ordering::SeqCst);
        let mut stopped = 0;
        for instrument in self.configured() {
            if self.registry.cancel(&instrument, TaskPurpose::ScanLoop).await {
                stopped += 1;
            }
        }
        info!("Scan scheduler stopped {} loops", stopped);
        stopped
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Change the timeframe of one instrument and restart only its loop
    pub async fn set_timeframe(&self, instrument: &Instrument, timeframe: Timeframe) -> bool {
        {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(instrument) else {
                warn!("Cannot set timeframe for {}: no strategy configured", instrument);
                return false;
            };
            if slot.timeframe != timeframe {
                info!("Timeframe for {} changed {} -> {}", instrument, slot.timeframe, timeframe);
            }
            slot.timeframe = timeframe;
        }

        if self.running.load(Ordering::SeqCst) {
            self.spawn_loop(instrument.clone()).await;
        }
        true
    }

    pub fn strategies_info(&self) -> Vec<StrategyInfo> {
        let mut info: Vec<StrategyInfo> = self
            .slots()
            .iter()
            .map(|(instrument, slot)| StrategyInfo {
                instrument: instrument.clone(),
                name: slot.descriptor.name.clone(),
                timeframe: slot.timeframe,
                active: self.registry.is_live(instrument, TaskPurpose::ScanLoop),
                min_history: slot.descriptor.min_history,
                required_fields: slot.descriptor.required_fields.clone(),
            })
            .collect();
        info.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        info
    }

    /// Run a single scan outside the schedule; any signal is dispatched
    pub async fn scan_now(&self, instrument: &Instrument) -> Result<Option<Signal>, ScanError> {
        let signal = self.scan_once(instrument, 1).await?;
        if let Some(signal) = &signal {
            info!("Manual scan of {} produced a {} signal", instrument, signal.side);
            self.dispatch(signal.clone());
        }
        Ok(signal)
    }

    async fn spawn_loop(&self, instrument: Instrument) {
        let scheduler = self.clone();
        self.registry
            .register(instrument, TaskPurpose::ScanLoop, move |ctx| scheduler.run_scan_loop(ctx))
            .await;
    }

    async fn run_scan_loop(self, ctx: TaskContext) {
        let instrument = ctx.key.instrument.clone();
        info!("Scan loop started for {}", instrument);

        loop {
            let Some(timeframe) = self.slots().get(&instrument).map(|slot| slot.timeframe) else {
                warn!("Scan loop for {} has no strategy, exiting", instrument);
                break;
            };

            let now = (self.clock)();
            let scan_at = next_scan_at(now, timeframe);
            debug!("Next scan of {} ({}) at {}", instrument, timeframe, scan_at);
            let wait = (scan_at - now).to_std().unwrap_or(Duration::ZERO);
            if !sleep_or_cancel(wait, &ctx.token).await {
                break;
            }

            match self.scan_burst(&instrument, &ctx.token).await {
                Ok(BurstOutcome::Found { value, attempt }) => {
                    info!(
                        "{} signal for {} on attempt {} (entry {:.4}, stop {:.4})",
                        value.side, instrument, attempt, value.entry_price, value.stop_loss
                    );
                    self.dispatch(value);
                }
                Ok(BurstOutcome::Exhausted) => debug!("No signal for {} this candle", instrument),
                Ok(BurstOutcome::Cancelled) => break,
                Err(e) => {
                    error!("Every scan attempt for {} failed: {}", instrument, e);
                    if !sleep_or_cancel(self.settings.error_cooldown, &ctx.token).await {
                        break;
                    }
                }
            }
        }

        info!("Scan loop stopped for {}", instrument);
    }

    /// Up to `retry.max_attempts` scans, stopping at the first signal
    pub(crate) async fn scan_burst(
        &self,
        instrument: &Instrument,
        token: &CancellationToken,
    ) -> Result<BurstOutcome<Signal>, ScanError> {
        self.settings
            .retry
            .run_burst(token, |attempt| self.scan_once(instrument, attempt))
            .await
    }

    async fn scan_once(&self, instrument: &Instrument, attempt: u32) -> Result<Option<Signal>, ScanError> {
        let (strategy, timeframe, history) = {
            let slots = self.slots();
            let slot = slots
                .get(instrument)
                .ok_or_else(|| ScanError::NotConfigured(instrument.clone()))?;
            (slot.strategy.clone(), slot.timeframe, slot.history)
        };

        debug!("Scanning {} ({}) attempt {}", instrument, timeframe, attempt);
        let candles = self.exchange.fetch_ohlcv(instrument, timeframe, history).await?;
        Ok(strategy.generate_signal(instrument, timeframe, &candles))
    }

    /// Hand `signal` to the callback on its own task so that stopping a
    /// scan loop never interrupts an entry in progress
    fn dispatch(&self, signal: Signal) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match callback {
            Some(callback) => {
                tokio::spawn(callback(signal));
            }
            None => warn!("No signal callback registered, dropping {} signal for {}", signal.side, signal.instrument),
        }
    }
}
