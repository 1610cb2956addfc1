//! Sweeper
//!
//! Backstop reconciliation: every instrument the engine believes is open is
//! checked against the venue, and bookkeeping with no real position behind it
//! is force-cleaned. A failure on one instrument never stops the pass.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{open_quantity, QUANTITY_EPSILON};
use crate::domain::errors::TradeError;
use crate::domain::repositories::exchange_client::ExchangeClient;
use crate::domain::services::monitor_registry::{MonitorRegistry, TaskPurpose};
use crate::domain::services::trade_book::TradeBook;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub checked: usize,
    pub cleaned: Vec<Instrument>,
    /// Entry still awaiting fill; the fill watch owns it
    pub skipped: Vec<Instrument>,
    pub cancelled_orders: usize,
    pub errors: Vec<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct Sweeper {
    exchange: Arc<dyn ExchangeClient>,
    registry: MonitorRegistry,
    book: TradeBook,
}

impl Sweeper {
    pub fn new(exchange: Arc<dyn ExchangeClient>, registry: MonitorRegistry, book: TradeBook) -> Self {
        Self {
            exchange,
            registry,
            book,
        }
    }

    pub async fn sweep_once(&self) -> SweepReport {
        let _mutations = self.book.lock_mutations().await;
        let mut report = SweepReport::default();

        let instruments: BTreeSet<Instrument> = self
            .registry
            .monitored_instruments()
            .into_iter()
            .chain(self.book.instruments())
            .collect();

        for instrument in instruments {
            report.checked += 1;

            if self.registry.is_live(&instrument, TaskPurpose::OrderFillWatch) {
                debug!("Sweep skips {}: entry still awaiting fill", instrument);
                report.skipped.push(instrument);
                continue;
            }

            let positions = match self.exchange.fetch_positions(Some(&instrument)).await {
                Ok(positions) => positions,
                Err(e) => {
                    warn!("Sweep could not read position for {}: {}", instrument, e);
                    report.errors.push(format!("{}: {}", instrument, e));
                    continue;
                }
            };

            if open_quantity(&positions, &instrument) > QUANTITY_EPSILON {
                continue;
            }

            report.cancelled_orders += self.clean(&instrument).await;
            report.cleaned.push(instrument);
        }

        report.finished_at = Some(Utc::now());
        if report.cleaned.is_empty() {
            debug!("Sweep checked {} instruments, nothing to clean", report.checked);
        } else {
            info!(
                "Sweep cleaned {:?} ({} protective orders cancelled)",
                report.cleaned, report.cancelled_orders
            );
        }
        report
    }

    /// Force-clean bookkeeping for an instrument with no real position
    async fn clean(&self, instrument: &Instrument) -> usize {
        let mismatch = TradeError::ReconciliationMismatch {
            instrument: instrument.to_string(),
            detail: format!(
                "no position at the venue, trade record present: {}, monitored: {}",
                self.book.contains(instrument),
                self.registry.is_monitored(instrument)
            ),
        };
        warn!("{} [{}]", mismatch, mismatch.error_code());

        let known = self
            .registry
            .protection(instrument)
            .and_then(|state| state.order_id);

        let stopped = self.registry.cancel_all(Some(instrument)).await;
        let mut cancelled = 0;

        if let Some(order_id) = known.as_deref() {
            match self.exchange.cancel_order(order_id, instrument).await {
                Ok(()) => cancelled += 1,
                Err(e) => debug!("Recorded protective order {} not cancelled: {}", order_id, e),
            }
        }

        match self.exchange.fetch_open_orders(Some(instrument)).await {
            Ok(orders) => {
                for order in orders
                    .iter()
                    .filter(|o| o.kind.is_protective() && Some(o.id.as_str()) != known.as_deref())
                {
                    match self.exchange.cancel_order(&order.id, instrument).await {
                        Ok(()) => cancelled += 1,
                        Err(e) => warn!("Failed to cancel orphan order {}: {}", order.id, e),
                    }
                }
            }
            Err(e) => warn!("Open orders for {} unavailable during sweep: {}", instrument, e),
        }

        self.registry.clear_protection(instrument);
        self.book.remove(instrument);
        debug!("Sweep stopped {} tasks for {}", stopped, instrument);
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::tests::btc_long_signal;
    use crate::domain::entities::signal::Side;
    use crate::domain::entities::trade::{MonitorPhase, ProtectiveOrderState, TradeRecord};
    use crate::domain::repositories::exchange_client::{ExchangeError, TrailingStopRequest};
    use crate::infrastructure::simulated_exchange::{SimulatedExchange, VenueCall};
    use std::time::Duration;

    fn btc() -> Instrument {
        Instrument::parse("BTC/USDT").unwrap()
    }

    fn eth() -> Instrument {
        Instrument::parse("ETH/USDT").unwrap()
    }

    fn setup() -> (Arc<SimulatedExchange>, MonitorRegistry, TradeBook, Sweeper) {
        let venue = Arc::new(SimulatedExchange::new());
        let registry = MonitorRegistry::new(Duration::from_millis(200));
        let book = TradeBook::new();
        let sweeper = Sweeper::new(venue.clone(), registry.clone(), book.clone());
        (venue, registry, book, sweeper)
    }

    async fn park(registry: &MonitorRegistry, instrument: Instrument, purpose: TaskPurpose) {
        registry
            .register(instrument, purpose, |ctx| async move {
                ctx.token.cancelled().await;
            })
            .await;
    }

    #[tokio::test]
    async fn test_orphaned_bookkeeping_is_cleaned() {
        let (venue, registry, book, sweeper) = setup();
        let record = TradeRecord::from_signal(&btc_long_signal(), "e-1".to_string(), 0.06);
        book.insert(record.clone());
        park(&registry, btc(), TaskPurpose::TrailingMonitor).await;

        let order_id = venue
            .place_trailing_stop(&TrailingStopRequest {
                instrument: btc(),
                side: Side::Long,
                quantity: 0.06,
                activation_price: 50_350.0,
                callback_pct: 0.25,
            })
            .await
            .unwrap();
        let mut state = ProtectiveOrderState::awaiting_fill(&record).with_phase(MonitorPhase::TrailingInstalled);
        state.order_id = Some(order_id);
        registry.publish_protection(state);

        let report = sweeper.sweep_once().await;

        assert_eq!(report.cleaned, vec![btc()]);
        assert_eq!(report.cancelled_orders, 1);
        assert!(book.is_empty());
        assert!(registry.entries().is_empty());
        assert!(registry.protection(&btc()).is_none());
        assert!(venue.resting_orders(&btc()).is_empty());
    }

    #[tokio::test]
    async fn test_real_positions_are_left_alone() {
        let (venue, registry, book, sweeper) = setup();
        venue.set_position(&btc(), Side::Long, 0.06);
        book.insert(TradeRecord::from_signal(&btc_long_signal(), "e-1".to_string(), 0.06));
        park(&registry, btc(), TaskPurpose::TrailingMonitor).await;

        let report = sweeper.sweep_once().await;

        assert_eq!(report.checked, 1);
        assert!(report.cleaned.is_empty());
        assert!(book.contains(&btc()));
        assert!(registry.is_monitored(&btc()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_fill_watch_is_skipped() {
        let (_venue, registry, book, sweeper) = setup();
        book.insert(TradeRecord::from_signal(&btc_long_signal(), "e-1".to_string(), 0.06));
        park(&registry, btc(), TaskPurpose::OrderFillWatch).await;

        let report = sweeper.sweep_once().await;

        assert_eq!(report.skipped, vec![btc()]);
        assert!(book.contains(&btc()));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_one_failure_does_not_stop_the_pass() {
        let (venue, registry, _book, sweeper) = setup();
        park(&registry, btc(), TaskPurpose::TrailingMonitor).await;
        park(&registry, eth(), TaskPurpose::TrailingMonitor).await;
        // instruments are swept in order, BTC first
        venue.fail_next(VenueCall::Positions, ExchangeError::Network("timeout".to_string()));

        let report = sweeper.sweep_once().await;

        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.cleaned, vec![eth()]);
        assert!(registry.is_monitored(&btc()));
        assert!(!registry.is_monitored(&eth()));

        let second = sweeper.sweep_once().await;
        assert_eq!(second.cleaned, vec![btc()]);
        assert!(registry.entries().is_empty());
    }

    #[tokio::test]
    async fn test_scan_loops_survive_sweep() {
        let (_venue, registry, _book, sweeper) = setup();
        park(&registry, btc(), TaskPurpose::ScanLoop).await;

        let report = sweeper.sweep_once().await;

        assert_eq!(report.checked, 0);
        assert!(registry.is_live(&btc(), TaskPurpose::ScanLoop));
        registry.shutdown().await;
    }
}
