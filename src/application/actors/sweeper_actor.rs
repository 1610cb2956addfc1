//! Sweeper Actor
//!
//! Runs the reconciliation sweep on a fixed interval and on demand. The
//! actor owns its statistics; callers talk to it through `SweeperMessage`.

use crate::domain::services::sweeper::{SweepReport, Sweeper};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

/// Channel capacity for sweeper actor messages
const SWEEPER_CHANNEL_CAPACITY: usize = 32;

/// Messages that can be sent to the sweeper actor
#[derive(Debug)]
pub enum SweeperMessage {
    /// Run a sweep now instead of waiting for the next tick
    SweepNow {
        reply: mpsc::Sender<SweepReport>,
    },

    /// Get sweep statistics
    GetStats {
        reply: mpsc::Sender<SweeperStats>,
    },

    /// Shutdown the actor
    Shutdown,
}

/// Sweeper actor statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub total_sweeps: u64,
    pub instruments_cleaned: u64,
    pub orders_cancelled: u64,
    pub failed_checks: u64,
    pub last_sweep: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
}

pub struct SweeperActor {
    sweeper: Sweeper,
    period: Duration,
    stats: SweeperStats,
}

impl SweeperActor {
    pub fn new(sweeper: Sweeper, period: Duration) -> Self {
        Self {
            sweeper,
            period,
            stats: SweeperStats::default(),
        }
    }

    /// Spawn a new sweeper actor
    pub fn spawn(sweeper: Sweeper, period: Duration) -> mpsc::Sender<SweeperMessage> {
        let (tx, rx) = mpsc::channel(SWEEPER_CHANNEL_CAPACITY);
        let actor = Self::new(sweeper, period);

        tokio::spawn(async move {
            actor.run(rx).await;
        });

        info!("SweeperActor spawned (every {:?})", period);
        tx
    }

    /// Main actor loop
    async fn run(mut self, mut rx: mpsc::Receiver<SweeperMessage>) {
        info!("SweeperActor started");

        // first sweep one full period after start
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(SweeperMessage::SweepNow { reply }) => {
                            debug!("SweeperActor received SweepNow");
                            let report = self.sweep().await;
                            if let Err(e) = reply.send(report).await {
                                error!("Failed to send SweepNow reply: {:?}", e);
                            }
                        }
                        Some(SweeperMessage::GetStats { reply }) => {
                            if let Err(e) = reply.send(self.stats.clone()).await {
                                error!("Failed to send GetStats reply: {:?}", e);
                            }
                        }
                        Some(SweeperMessage::Shutdown) => {
                            info!("SweeperActor received shutdown signal");
                            break;
                        }
                        None => {
                            debug!("SweeperActor channel closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("SweeperActor stopped");
    }

    async fn sweep(&mut self) -> SweepReport {
        let report = self.sweeper.sweep_once().await;
        self.update_stats(&report);
        report
    }

    fn update_stats(&mut self, report: &SweepReport) {
        self.stats.total_sweeps += 1;
        self.stats.instruments_cleaned += report.cleaned.len() as u64;
        self.stats.orders_cancelled += report.cancelled_orders as u64;
        self.stats.failed_checks += report.errors.len() as u64;
        self.stats.last_sweep = report.finished_at;
        self.stats.last_report = Some(report.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::instrument::Instrument;
    use crate::domain::services::monitor_registry::{MonitorRegistry, TaskPurpose};
    use crate::domain::services::trade_book::TradeBook;
    use crate::infrastructure::simulated_exchange::SimulatedExchange;
    use std::sync::Arc;

    fn setup() -> (MonitorRegistry, Sweeper) {
        let venue = Arc::new(SimulatedExchange::new());
        let registry = MonitorRegistry::new(Duration::from_millis(200));
        let sweeper = Sweeper::new(venue, registry.clone(), TradeBook::new());
        (registry, sweeper)
    }

    #[tokio::test]
    async fn test_sweep_now_and_stats() {
        let (registry, sweeper) = setup();
        let btc = Instrument::parse("BTC/USDT").unwrap();
        let tx = SweeperActor::spawn(sweeper, Duration::from_secs(3600));

        registry
            .register(btc.clone(), TaskPurpose::TrailingMonitor, |ctx| async move {
                ctx.token.cancelled().await;
            })
            .await;

        let (reply_tx, mut reply_rx) = mpsc::channel(1);
        tx.send(SweeperMessage::SweepNow { reply: reply_tx }).await.unwrap();
        let report = reply_rx.recv().await.unwrap();
        assert_eq!(report.cleaned, vec![btc.clone()]);
        assert!(!registry.is_monitored(&btc));

        let (stats_tx, mut stats_rx) = mpsc::channel(1);
        tx.send(SweeperMessage::GetStats { reply: stats_tx }).await.unwrap();
        let stats = stats_rx.recv().await.unwrap();
        assert_eq!(stats.total_sweeps, 1);
        assert_eq!(stats.instruments_cleaned, 1);
        assert_eq!(stats.last_report.unwrap().cleaned, vec![btc]);
        assert!(stats.last_sweep.is_some());

        tx.send(SweeperMessage::Shutdown).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_channel() {
        let (_registry, sweeper) = setup();
        let tx = SweeperActor::spawn(sweeper, Duration::from_secs(3600));

        tx.send(SweeperMessage::Shutdown).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), tx.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interval_sweeps_periodically() {
        let (registry, sweeper) = setup();
        let tx = SweeperActor::spawn(sweeper, Duration::from_millis(10));
        let eth = Instrument::parse("ETH/USDT").unwrap();

        registry
            .register(eth.clone(), TaskPurpose::TrailingMonitor, |ctx| async move {
                ctx.token.cancelled().await;
            })
            .await;

        let mut cleaned = false;
        for _ in 0..100 {
            if !registry.is_monitored(&eth) {
                cleaned = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(cleaned);
        tx.send(SweeperMessage::Shutdown).await.unwrap();
    }
}
