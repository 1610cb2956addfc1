//! Engine
//!
//! Wires trader, protective monitor, registry, sweeper and scan scheduler
//! around one exchange client and exposes the operator-facing operations.
//!
//! Lock ordering: trade-mutation lock (TradeBook) before the registry's
//! registration lock. Nothing here takes them in the other order.

use crate::application::actors::sweeper_actor::{SweeperActor, SweeperMessage, SweeperStats};
use crate::config::EngineConfig;
use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{OrderSnapshot, Position};
use crate::domain::entities::signal::Signal;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::entities::trade::{ProtectiveOrderState, TradeRecord};
use crate::domain::errors::TradeError;
use crate::domain::repositories::exchange_client::{ExchangeClient, ExchangeResult};
use crate::domain::services::monitor_registry::{MonitorRegistry, RegistryEntryInfo};
use crate::domain::services::protective_monitor::ProtectiveMonitor;
use crate::domain::services::scan_scheduler::{
    signal_callback, ScanError, ScanScheduler, SignalCallback, StrategyInfo,
};
use crate::domain::services::strategies::{strategy_for, Strategy};
use crate::domain::services::sweeper::{SweepReport, Sweeper};
use crate::domain::services::trade_book::TradeBook;
use crate::domain::services::trader::{CloseSummary, Trader};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Reply timeout for actor round-trips
const ACTOR_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub status: &'static str,
    pub venue: String,
    pub venue_healthy: bool,
    pub scanning: bool,
    pub open_trades: usize,
    pub live_tasks: usize,
}

pub struct Engine {
    exchange: Arc<dyn ExchangeClient>,
    registry: MonitorRegistry,
    book: TradeBook,
    trader: Arc<Trader>,
    scheduler: ScanScheduler,
    sweeper: Sweeper,
    sweep_interval: Duration,
    sweeper_tx: Mutex<Option<mpsc::Sender<SweeperMessage>>>,
}

impl Engine {
    pub fn new(exchange: Arc<dyn ExchangeClient>, config: &EngineConfig) -> Self {
        let registry = MonitorRegistry::new(config.cancel_grace());
        let book = TradeBook::new();
        let monitor = ProtectiveMonitor::new(
            exchange.clone(),
            registry.clone(),
            book.clone(),
            config.monitor_settings(),
        );
        let trader = Arc::new(Trader::new(
            exchange.clone(),
            book.clone(),
            registry.clone(),
            monitor,
            config.trader_config(),
        ));
        let scheduler = ScanScheduler::new(exchange.clone(), registry.clone(), config.scan_settings());
        let sweeper = Sweeper::new(exchange.clone(), registry.clone(), book.clone());

        let engine = Self {
            exchange,
            registry,
            book,
            trader,
            scheduler,
            sweeper,
            sweep_interval: config.sweep_interval(),
            sweeper_tx: Mutex::new(None),
        };
        engine.register_signal_callback(engine.trader_callback());
        engine
    }

    /// Default hand-off: every scanned signal goes to `open_trade`
    fn trader_callback(&self) -> SignalCallback {
        let trader = self.trader.clone();
        signal_callback(move |signal: Signal| {
            let trader = trader.clone();
            async move {
                let outcome = trader.open_trade(signal).await;
                info!("{}", outcome);
            }
        })
    }

    /// Replace the signal hand-off (the default opens a trade)
    pub fn register_signal_callback(&self, callback: SignalCallback) {
        self.scheduler.register_signal_callback(callback);
    }

    pub async fn add_strategy(&self, instrument: Instrument, timeframe: Timeframe, strategy: Arc<dyn Strategy>) {
        self.scheduler.add_strategy(instrument, timeframe, strategy).await;
    }

    /// Configure every instrument in `config` with the strategy resolved for it
    pub async fn add_configured_strategies(&self, config: &EngineConfig) {
        for (instrument, timeframe) in &config.strategy_instruments {
            let strategy = strategy_for(instrument, config.strategy_direction);
            self.add_strategy(instrument.clone(), *timeframe, strategy).await;
        }
    }

    /// Start the sweeper actor and the scan loops
    pub async fn start(&self) {
        {
            let mut sweeper_tx = self.sweeper_tx.lock().unwrap_or_else(|p| p.into_inner());
            if sweeper_tx.is_none() {
                *sweeper_tx = Some(SweeperActor::spawn(self.sweeper.clone(), self.sweep_interval));
            }
        }
        let loops = self.scheduler.start().await;
        info!("Engine started on {} with {} scan loops", self.exchange.name(), loops);
    }

    /// Stop every background task. Venue-side protective orders stay in place.
    pub async fn shutdown(&self) {
        let loops = self.scheduler.stop().await;
        let sweeper_tx = self.sweeper_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(tx) = sweeper_tx {
            if tx.send(SweeperMessage::Shutdown).await.is_err() {
                debug!("Sweeper actor already stopped");
            }
        }
        let tasks = self.registry.shutdown().await;
        info!("Engine stopped: {} scan loops, {} other tasks", loops, tasks);
    }

    fn sweeper_sender(&self) -> Option<mpsc::Sender<SweeperMessage>> {
        self.sweeper_tx.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    // ------------------------------------------------------------------
    // Trading
    // ------------------------------------------------------------------

    pub async fn open_trade(&self, signal: Signal) -> String {
        self.trader.open_trade(signal).await
    }

    pub async fn try_open_trade(&self, signal: Signal) -> Result<TradeRecord, TradeError> {
        self.trader.try_open_trade(signal).await
    }

    pub async fn close_trade(&self, instrument: &Instrument) -> CloseSummary {
        self.trader.close_trade(instrument).await
    }

    pub async fn close_all_trades(&self) -> CloseSummary {
        self.trader.close_all_trades().await
    }

    pub fn set_leverage(&self, leverage: u32) -> bool {
        self.trader.set_leverage(leverage)
    }

    pub fn leverage(&self) -> u32 {
        self.trader.leverage()
    }

    // ------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------

    pub async fn get_active_positions(&self) -> ExchangeResult<Vec<Position>> {
        self.trader.get_active_positions().await
    }

    pub async fn get_open_orders(&self) -> ExchangeResult<Vec<OrderSnapshot>> {
        self.trader.get_open_orders().await
    }

    pub fn active_trades(&self) -> Vec<TradeRecord> {
        self.book.snapshot()
    }

    pub fn monitors(&self) -> Vec<RegistryEntryInfo> {
        self.registry.entries()
    }

    pub fn protections(&self) -> Vec<ProtectiveOrderState> {
        self.registry.protections()
    }

    pub async fn health(&self) -> EngineHealth {
        let venue_healthy = self.exchange.is_healthy().await;
        EngineHealth {
            status: if venue_healthy { "running" } else { "degraded" },
            venue: self.exchange.name().to_string(),
            venue_healthy,
            scanning: self.scheduler.is_running(),
            open_trades: self.book.len(),
            live_tasks: self.registry.entries().len(),
        }
    }

    // ------------------------------------------------------------------
    // Scanning
    // ------------------------------------------------------------------

    pub async fn set_timeframe(&self, instrument: &Instrument, timeframe: Timeframe) -> bool {
        self.scheduler.set_timeframe(instrument, timeframe).await
    }

    pub async fn scan_now(&self, instrument: &Instrument) -> Result<Option<Signal>, ScanError> {
        self.scheduler.scan_now(instrument).await
    }

    pub fn strategies_info(&self) -> Vec<StrategyInfo> {
        self.scheduler.strategies_info()
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Sweep now, through the actor when it runs so its stats stay complete
    pub async fn sweep_now(&self) -> SweepReport {
        if let Some(tx) = self.sweeper_sender() {
            let (reply_tx, mut reply_rx) = mpsc::channel(1);
            if tx.send(SweeperMessage::SweepNow { reply: reply_tx }).await.is_ok() {
                match timeout(ACTOR_REPLY_TIMEOUT, reply_rx.recv()).await {
                    Ok(Some(report)) => return report,
                    Ok(None) => warn!("Sweeper actor dropped the reply, sweeping inline"),
                    Err(_) => warn!("Sweeper actor reply timed out, sweeping inline"),
                }
            }
        }
        self.sweeper.sweep_once().await
    }

    pub async fn sweeper_stats(&self) -> Option<SweeperStats> {
        let tx = self.sweeper_sender()?;
        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        tx.send(SweeperMessage::GetStats { reply: reply_tx }).await.ok()?;
        timeout(ACTOR_REPLY_TIMEOUT, reply_rx.recv()).await.ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::tests::btc_long_signal;
    use crate::domain::services::strategies::tests::trend;
    use crate::infrastructure::simulated_exchange::SimulatedExchange;

    fn btc() -> Instrument {
        Instrument::parse("BTC/USDT").unwrap()
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            fill_poll_interval_ms: 5,
            position_poll_interval_ms: 10,
            task_cancel_grace_ms: 500,
            scan_attempts: 1,
            scan_history_limit: 60,
            ..EngineConfig::default()
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..400 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_scanned_signal_is_traded_by_default() {
        let venue = Arc::new(SimulatedExchange::new());
        venue.set_price(&btc(), 50_000.0);
        venue.set_candles(&btc(), trend(50_000.0, 50.0, 60));
        let engine = Engine::new(venue.clone(), &fast_config());
        engine.add_configured_strategies(&fast_config()).await;

        assert!(engine.scan_now(&btc()).await.unwrap().is_some());
        assert!(wait_until(|| engine.active_trades().len() == 1).await);
        assert_eq!(engine.strategies_info()[0].name, "FramaTrend");

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_configured_instruments_get_their_own_strategies() {
        let venue = Arc::new(SimulatedExchange::new());
        let config = EngineConfig {
            strategy_instruments: vec![
                (btc(), Timeframe::M15),
                (Instrument::parse("ETH/USDT").unwrap(), Timeframe::H4),
            ],
            ..fast_config()
        };
        let engine = Engine::new(venue, &config);
        engine.add_configured_strategies(&config).await;

        let info = engine.strategies_info();
        assert_eq!(info.len(), 2);
        assert_eq!(info[0].name, "FramaTrend");
        assert_eq!(info[1].name, "FramaAdxTrend");
        assert_eq!(info[1].timeframe, Timeframe::H4);
        assert_eq!(info[1].min_history, 205);
        assert_ne!(info[0].required_fields, info[1].required_fields);
    }

    #[tokio::test]
    async fn test_start_sweep_and_shutdown() {
        let venue = Arc::new(SimulatedExchange::new());
        venue.set_price(&btc(), 50_000.0);
        let engine = Engine::new(venue.clone(), &fast_config());
        engine.add_configured_strategies(&fast_config()).await;

        engine.start().await;
        let health = engine.health().await;
        assert!(health.scanning);
        assert_eq!(health.venue, "simulated");

        engine.try_open_trade(btc_long_signal()).await.unwrap();
        venue.set_position_quantity(&btc(), 0.0);
        // the monitor may win the race; either way nothing is left afterwards
        engine.sweep_now().await;
        assert!(wait_until(|| engine.active_trades().is_empty()).await);

        let stats = engine.sweeper_stats().await.unwrap();
        assert_eq!(stats.total_sweeps, 1);

        engine.shutdown().await;
        assert!(engine.monitors().is_empty());
        assert!(!engine.health().await.scanning);
        assert!(engine.sweeper_stats().await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_without_actor_runs_inline() {
        let venue = Arc::new(SimulatedExchange::new());
        let engine = Engine::new(venue, &fast_config());
        let report = engine.sweep_now().await;
        assert_eq!(report.checked, 0);
        assert!(report.finished_at.is_some());
    }
}
