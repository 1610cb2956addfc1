//! Protective-Order Monitor
//!
//! Drives one position's protection through
//! `AwaitingFill -> TrailingInstalled <-> TrailingTriggeredAwaitingReplacement -> Closed`.
//!
//! Two registry tasks carry the state machine. The fill watch polls the entry
//! order until it fills, is cancelled, or times out. On fill it installs the
//! trailing stop and hands over to the trailing monitor, which re-reads the
//! real position quantity every poll and replaces or tears down protection as
//! the position changes under it. Every iteration re-derives truth from the
//! venue; the monitor never assumes it is the only actor changing the position.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{open_quantity, OrderKind, OrderStatus, QUANTITY_EPSILON};
use crate::domain::entities::trade::{
    MonitorPhase, ProtectiveOrderState, TradeRecord, TrailingParams,
};
use crate::domain::errors::TradeError;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, TrailingStopRequest,
};
use crate::domain::services::monitor_registry::{MonitorRegistry, TaskContext, TaskPurpose};
use crate::domain::services::trade_book::TradeBook;
use crate::task_runner::sleep_or_cancel;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub fill_poll_interval: Duration,
    pub fill_timeout: Duration,
    pub position_poll_interval: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            fill_poll_interval: Duration::from_secs(2),
            fill_timeout: Duration::from_secs(600),
            position_poll_interval: Duration::from_secs(5),
        }
    }
}

/// How the real position quantity moved since the last poll
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QuantityChange {
    Unchanged,
    Decreased(f64),
    Increased(f64),
    Closed,
}

pub fn classify_quantity_change(last_known: f64, current: f64) -> QuantityChange {
    if current <= QUANTITY_EPSILON {
        return QuantityChange::Closed;
    }
    let tolerance = QUANTITY_EPSILON.max(last_known.abs() * 1e-9);
    if (current - last_known).abs() <= tolerance {
        QuantityChange::Unchanged
    } else if current < last_known {
        QuantityChange::Decreased(current)
    } else {
        QuantityChange::Increased(current)
    }
}

/// Outcome of the fill watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FillOutcome {
    Filled,
    Closed,
}

/// Result of one protective-order cancel pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CancelPass {
    cancelled: usize,
    /// A protective order may still be resting at the venue
    unconfirmed: bool,
}

#[derive(Clone)]
pub struct ProtectiveMonitor {
    exchange: Arc<dyn ExchangeClient>,
    registry: MonitorRegistry,
    book: TradeBook,
    settings: MonitorSettings,
}

impl ProtectiveMonitor {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        registry: MonitorRegistry,
        book: TradeBook,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            exchange,
            registry,
            book,
            settings,
        }
    }

    pub fn settings(&self) -> MonitorSettings {
        self.settings
    }

    /// Start watching a freshly submitted entry order
    pub async fn start(&self, record: TradeRecord) -> u64 {
        self.registry
            .publish_protection(ProtectiveOrderState::awaiting_fill(&record));

        let monitor = self.clone();
        let instrument = record.instrument.clone();
        self.registry
            .register(instrument, TaskPurpose::OrderFillWatch, move |ctx| {
                monitor.run_fill_watch(ctx, record)
            })
            .await
    }

    /// Re-protect a filled position whose protective orders were cancelled.
    /// A trailing stop priced from the current mark is installed even when
    /// the trade runs without trailing, since its stop-loss is gone.
    pub async fn resume(&self, record: TradeRecord) -> u64 {
        let monitor = self.clone();
        let instrument = record.instrument.clone();
        self.registry
            .register(instrument, TaskPurpose::TrailingMonitor, move |ctx| {
                monitor.run_resumed(ctx, record)
            })
            .await
    }

    async fn run_resumed(self, ctx: TaskContext, record: TradeRecord) {
        let instrument = record.instrument.clone();
        let quantity = match self.exchange.fetch_positions(Some(&instrument)).await {
            Ok(positions) => open_quantity(&positions, &instrument),
            Err(e) => {
                warn!("Position fetch for {} failed, assuming recorded size: {}", instrument, e);
                record.quantity
            }
        };
        if quantity <= QUANTITY_EPSILON {
            info!("Position {} already flat, nothing to resume", instrument);
            self.teardown(&ctx, &record, None).await;
            return;
        }

        let state = self.publish(
            &record,
            None,
            quantity,
            MonitorPhase::TrailingTriggeredAwaitingReplacement,
        );
        let state = self.replace_trailing(&record, state, quantity).await;
        info!(
            "Protection for {} resumed with order {:?}",
            instrument, state.order_id
        );
        self.run_trailing_monitor(ctx, record, state).await;
    }

    async fn run_fill_watch(self, ctx: TaskContext, record: TradeRecord) {
        let instrument = record.instrument.clone();
        info!(
            "Watching entry order {} for {} ({})",
            record.entry_order_id, instrument, record.side
        );

        let Some(outcome) = self.await_fill(&ctx, &record).await else {
            debug!("Fill watch for {} cancelled", instrument);
            return;
        };

        if outcome == FillOutcome::Closed {
            self.teardown(&ctx, &record, None).await;
            return;
        }

        let quantity = match self.exchange.fetch_positions(Some(&instrument)).await {
            Ok(positions) if open_quantity(&positions, &instrument) > QUANTITY_EPSILON => {
                open_quantity(&positions, &instrument)
            }
            Ok(_) => record.quantity,
            Err(e) => {
                warn!("Position fetch after fill failed for {}: {}", instrument, e);
                record.quantity
            }
        };

        let order_id = self.install_initial_protection(&record, quantity).await;
        let state = self.publish(&record, order_id, quantity, MonitorPhase::TrailingInstalled);

        let monitor = self.clone();
        let registry = ctx.registry.clone();
        tokio::select! {
            _ = ctx.token.cancelled() => {
                debug!("Hand-off for {} abandoned, fill watch cancelled", instrument);
            }
            generation = registry.register(
                instrument.clone(),
                TaskPurpose::TrailingMonitor,
                move |trailing_ctx| monitor.run_trailing_monitor(trailing_ctx, record, state),
            ) => {
                debug!("Trailing monitor for {} started (generation {})", instrument, generation);
            }
        }
    }

    /// `None` when cancelled
    async fn await_fill(&self, ctx: &TaskContext, record: &TradeRecord) -> Option<FillOutcome> {
        let instrument = &record.instrument;
        let order_id = &record.entry_order_id;
        let deadline = Instant::now() + self.settings.fill_timeout;

        loop {
            if ctx.token.is_cancelled() {
                return None;
            }

            match self.exchange.fetch_order(order_id, instrument).await {
                Ok(OrderStatus::Filled) => {
                    info!("Entry order {} for {} filled", order_id, instrument);
                    return Some(FillOutcome::Filled);
                }
                Ok(status) if status.is_terminal_without_fill() => {
                    info!("Entry order {} for {} ended {}", order_id, instrument, status);
                    return Some(FillOutcome::Closed);
                }
                Ok(OrderStatus::Unknown) => {
                    match self.position_exists(instrument).await {
                        Some(true) => return Some(FillOutcome::Filled),
                        Some(false) => {
                            warn!("Entry order {} for {} is unknown to the venue", order_id, instrument);
                            return Some(FillOutcome::Closed);
                        }
                        None => {}
                    }
                }
                Ok(status) => debug!("Entry order {} for {} is {}", order_id, instrument, status),
                Err(e) => {
                    let error = TradeError::OrderStatusUnavailable {
                        order_id: order_id.clone(),
                        reason: e.to_string(),
                    };
                    warn!("{} [{}]", error, error.error_code());
                    if self.position_exists(instrument).await == Some(true) {
                        info!("Position for {} exists, treating entry as filled", instrument);
                        return Some(FillOutcome::Filled);
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    "Entry order {} for {} not filled within {:?}, cancelling",
                    order_id, instrument, self.settings.fill_timeout
                );
                if let Err(e) = self.exchange.cancel_order(order_id, instrument).await {
                    warn!("Cancel of entry order {} failed: {}", order_id, e);
                }
                if self.position_exists(instrument).await == Some(true) {
                    info!("Entry for {} filled during timeout cancel", instrument);
                    return Some(FillOutcome::Filled);
                }
                return Some(FillOutcome::Closed);
            }

            if !sleep_or_cancel(self.settings.fill_poll_interval, &ctx.token).await {
                return None;
            }
        }
    }

    /// Install protection for a confirmed fill; `None` if nothing could be placed
    async fn install_initial_protection(&self, record: &TradeRecord, quantity: f64) -> Option<String> {
        if !record.trailing.enabled {
            let stop = self.find_protective_order(&record.instrument, OrderKind::StopLoss).await;
            info!(
                "Trailing disabled for {}, keeping stop-loss {:?}",
                record.instrument, stop
            );
            return stop;
        }

        let pass = self.cancel_protective_orders(&record.instrument, None).await;
        if pass.cancelled > 0 {
            info!(
                "Cancelled {} pre-existing protective orders for {}",
                pass.cancelled, record.instrument
            );
        }
        if pass.unconfirmed {
            warn!(
                "Pre-existing protection for {} may still rest at the venue",
                record.instrument
            );
        }
        self.place_trailing(record, quantity, record.initial_trailing_params())
            .await
    }

    async fn run_trailing_monitor(
        self,
        ctx: TaskContext,
        record: TradeRecord,
        mut state: ProtectiveOrderState,
    ) {
        let instrument = record.instrument.clone();
        info!(
            "Monitoring {} position of {} (protective order {:?})",
            instrument, state.last_known_quantity, state.order_id
        );

        loop {
            if !sleep_or_cancel(self.settings.position_poll_interval, &ctx.token).await {
                debug!("Trailing monitor for {} cancelled", instrument);
                return;
            }

            let quantity = match self.exchange.fetch_positions(Some(&instrument)).await {
                Ok(positions) => open_quantity(&positions, &instrument),
                Err(e) => {
                    warn!("Position poll for {} failed: {}", instrument, e);
                    continue;
                }
            };

            match classify_quantity_change(state.last_known_quantity, quantity) {
                QuantityChange::Closed => {
                    info!("Position {} closed", instrument);
                    self.teardown(&ctx, &record, state.order_id.clone()).await;
                    return;
                }
                QuantityChange::Unchanged => {
                    if state.order_id.is_none() && record.trailing.enabled {
                        warn!("{} has no protective order, retrying installation", instrument);
                        state = self.replace_trailing(&record, state, quantity).await;
                    }
                }
                QuantityChange::Increased(quantity) => {
                    info!(
                        "Position {} grew from {} to {}",
                        instrument, state.last_known_quantity, quantity
                    );
                    state.last_known_quantity = quantity;
                    state.updated_at = Utc::now();
                    self.registry.publish_protection(state.clone());
                }
                QuantityChange::Decreased(quantity) => {
                    info!(
                        "Position {} reduced from {} to {}, trailing stop partially triggered",
                        instrument, state.last_known_quantity, quantity
                    );
                    if record.trailing.enabled {
                        state = state.with_phase(MonitorPhase::TrailingTriggeredAwaitingReplacement);
                        self.registry.publish_protection(state.clone());
                        state = self.replace_trailing(&record, state, quantity).await;
                    } else {
                        state.last_known_quantity = quantity;
                        self.registry.publish_protection(state.clone());
                    }
                }
            }
        }
    }

    /// Cancel lingering protection and install one trailing stop priced from
    /// the current market.
    ///
    /// Nothing is placed while any protective order may still be resting; the
    /// unchanged `state` comes back so the next poll retries.
    async fn replace_trailing(
        &self,
        record: &TradeRecord,
        state: ProtectiveOrderState,
        quantity: f64,
    ) -> ProtectiveOrderState {
        let instrument = &record.instrument;
        let pass = self
            .cancel_protective_orders(instrument, state.order_id.as_deref())
            .await;
        if pass.unconfirmed {
            warn!(
                "Protection for {} not confirmed cancelled, replacement deferred",
                instrument
            );
            return state;
        }

        let order_id = match self.exchange.get_ticker_price(instrument).await {
            Ok(ticker) => {
                let params = record.trailing_params_from(ticker.mark);
                self.place_trailing(record, quantity, params).await
            }
            Err(e) => {
                warn!("Ticker for {} unavailable, replacement deferred: {}", instrument, e);
                None
            }
        };

        self.publish(record, order_id, quantity, MonitorPhase::TrailingInstalled)
    }

    async fn place_trailing(
        &self,
        record: &TradeRecord,
        quantity: f64,
        params: TrailingParams,
    ) -> Option<String> {
        let request = TrailingStopRequest {
            instrument: record.instrument.clone(),
            side: record.side,
            quantity,
            activation_price: params.activation_price,
            callback_pct: params.callback_pct,
        };

        match self.exchange.place_trailing_stop(&request).await {
            Ok(order_id) => {
                info!(
                    "Trailing stop {} for {}: activation {:.4}, callback {:.3}%, quantity {}",
                    order_id, record.instrument, params.activation_price, params.callback_pct, quantity
                );
                Some(order_id)
            }
            Err(e) => {
                error!(
                    "Trailing stop for {} failed ({}): {}",
                    record.instrument,
                    e.classify(),
                    e
                );
                None
            }
        }
    }

    /// Cancel `known` and every resting protective order for `instrument`,
    /// `known` included while it is still listed
    async fn cancel_protective_orders(&self, instrument: &Instrument, known: Option<&str>) -> CancelPass {
        let mut pass = CancelPass::default();
        if let Some(order_id) = known {
            match self.exchange.cancel_order(order_id, instrument).await {
                Ok(()) => pass.cancelled += 1,
                Err(ExchangeError::NotFound(_)) => debug!("Protective order {} already gone", order_id),
                Err(e) => warn!("Protective order {} not cancelled: {}", order_id, e),
            }
        }

        match self.exchange.fetch_open_orders(Some(instrument)).await {
            Ok(orders) => {
                for order in orders.iter().filter(|o| o.kind.is_protective()) {
                    match self.exchange.cancel_order(&order.id, instrument).await {
                        Ok(()) => pass.cancelled += 1,
                        Err(ExchangeError::NotFound(_)) => {}
                        Err(e) => {
                            warn!("Failed to cancel protective order {}: {}", order.id, e);
                            pass.unconfirmed = true;
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Open orders for {} unavailable: {}", instrument, e);
                pass.unconfirmed = true;
            }
        }
        pass
    }

    async fn find_protective_order(&self, instrument: &Instrument, kind: OrderKind) -> Option<String> {
        match self.exchange.fetch_open_orders(Some(instrument)).await {
            Ok(orders) => orders.into_iter().find(|o| o.kind == kind).map(|o| o.id),
            Err(e) => {
                warn!("Open orders for {} unavailable: {}", instrument, e);
                None
            }
        }
    }

    /// `None` when the position could not be read
    async fn position_exists(&self, instrument: &Instrument) -> Option<bool> {
        match self.exchange.fetch_positions(Some(instrument)).await {
            Ok(positions) => Some(open_quantity(&positions, instrument) > QUANTITY_EPSILON),
            Err(e) => {
                debug!("Position check for {} failed: {}", instrument, e);
                None
            }
        }
    }

    fn publish(
        &self,
        record: &TradeRecord,
        order_id: Option<String>,
        quantity: f64,
        phase: MonitorPhase,
    ) -> ProtectiveOrderState {
        let state = ProtectiveOrderState {
            instrument: record.instrument.clone(),
            order_id,
            side: record.side,
            last_known_quantity: quantity,
            phase,
            updated_at: Utc::now(),
        };
        self.registry.publish_protection(state.clone());
        state
    }

    /// Closed: cancel leftover protection, drop bookkeeping, release siblings.
    /// The caller's own registry entry is released by its guard.
    async fn teardown(&self, ctx: &TaskContext, record: &TradeRecord, known: Option<String>) {
        let instrument = &record.instrument;
        self.publish(record, known.clone(), 0.0, MonitorPhase::Closed);

        let cancelled = self
            .cancel_protective_orders(instrument, known.as_deref())
            .await
            .cancelled;
        self.registry.clear_protection(instrument);
        let removed = self.book.remove_entry(instrument, &record.entry_order_id);
        let siblings = ctx.registry.cancel_siblings(ctx).await;

        info!(
            "Protection for {} closed: {} orders cancelled, trade record removed: {}, {} sibling tasks stopped",
            instrument, cancelled, removed, siblings
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::OrderSnapshot;
    use crate::domain::entities::signal::tests::btc_long_signal;
    use crate::domain::repositories::exchange_client::{ExchangeError, MarketOrderRequest};
    use crate::infrastructure::simulated_exchange::{FillMode, SimulatedExchange, VenueCall};

    struct Harness {
        venue: Arc<SimulatedExchange>,
        registry: MonitorRegistry,
        book: TradeBook,
        monitor: ProtectiveMonitor,
    }

    fn btc() -> Instrument {
        Instrument::parse("BTC/USDT").unwrap()
    }

    fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            fill_poll_interval: Duration::from_millis(5),
            fill_timeout: Duration::from_millis(300),
            position_poll_interval: Duration::from_millis(10),
        }
    }

    fn harness(fill_mode: FillMode) -> Harness {
        let venue = Arc::new(SimulatedExchange::new());
        venue.set_fill_mode(fill_mode);
        venue.set_price(&btc(), 50_000.0);
        let registry = MonitorRegistry::new(Duration::from_millis(500));
        let book = TradeBook::new();
        let monitor = ProtectiveMonitor::new(
            venue.clone(),
            registry.clone(),
            book.clone(),
            fast_settings(),
        );
        Harness {
            venue,
            registry,
            book,
            monitor,
        }
    }

    /// Submit an entry the way the trader does and record it
    async fn submit_entry(h: &Harness, quantity: f64) -> TradeRecord {
        let signal = btc_long_signal();
        let order_id = h
            .venue
            .create_market_order(&MarketOrderRequest {
                instrument: btc(),
                side: signal.side,
                quantity,
                stop_loss: Some(signal.stop_loss),
                trailing_activation: None,
                trailing_callback_pct: None,
            })
            .await
            .unwrap();
        let record = TradeRecord::from_signal(&signal, order_id, quantity);
        h.book.insert(record.clone());
        record
    }

    async fn wait_until(condition: impl Fn() -> bool) -> bool {
        for _ in 0..300 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        condition()
    }

    fn trailing_orders(h: &Harness) -> Vec<OrderSnapshot> {
        h.venue
            .resting_orders(&btc())
            .into_iter()
            .filter(|o| o.kind == OrderKind::TrailingStop)
            .collect()
    }

    #[test]
    fn test_classify_quantity_change() {
        assert_eq!(classify_quantity_change(1.0, 1.0), QuantityChange::Unchanged);
        assert_eq!(classify_quantity_change(1.0, 0.4), QuantityChange::Decreased(0.4));
        assert_eq!(classify_quantity_change(1.0, 1.5), QuantityChange::Increased(1.5));
        assert_eq!(classify_quantity_change(1.0, 0.0), QuantityChange::Closed);
        assert_eq!(classify_quantity_change(0.0, 0.0), QuantityChange::Closed);
    }

    #[tokio::test]
    async fn test_fill_installs_trailing_and_replaces_stop_loss() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 0.06).await;
        h.monitor.start(record).await;

        assert!(wait_until(|| h.registry.is_live(&btc(), TaskPurpose::TrailingMonitor)).await);
        assert!(wait_until(|| !h.registry.is_live(&btc(), TaskPurpose::OrderFillWatch)).await);

        let resting = h.venue.resting_orders(&btc());
        assert_eq!(resting.len(), 1, "stop-loss should have been replaced");
        assert_eq!(resting[0].kind, OrderKind::TrailingStop);
        assert_eq!(resting[0].trigger_price, Some(50_350.0));

        let state = h.registry.protection(&btc()).unwrap();
        assert_eq!(state.phase, MonitorPhase::TrailingInstalled);
        assert_eq!(state.order_id.as_deref(), Some(resting[0].id.as_str()));
        assert_eq!(state.last_known_quantity, 0.06);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_trailing_disabled_keeps_stop_loss() {
        let h = harness(FillMode::Immediate);
        let mut record = submit_entry(&h, 0.06).await;
        record.trailing.enabled = false;
        h.monitor.start(record).await;

        assert!(wait_until(|| h.registry.is_live(&btc(), TaskPurpose::TrailingMonitor)).await);
        let resting = h.venue.resting_orders(&btc());
        assert_eq!(resting.len(), 1);
        assert_eq!(resting[0].kind, OrderKind::StopLoss);
        assert_eq!(
            h.registry.protection(&btc()).unwrap().order_id.as_deref(),
            Some(resting[0].id.as_str())
        );
        assert_eq!(h.venue.calls(VenueCall::TrailingStop), 0);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_trigger_installs_exactly_one_replacement() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 1.0).await;
        h.monitor.start(record).await;
        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);
        let original = trailing_orders(&h)[0].id.clone();

        h.venue.set_price(&btc(), 51_000.0);
        h.venue.set_position_quantity(&btc(), 0.4);

        assert!(wait_until(|| {
            h.registry
                .protection(&btc())
                .map_or(false, |s| s.last_known_quantity == 0.4 && s.order_id.as_deref() != Some(original.as_str()))
        })
        .await);

        let trailing = trailing_orders(&h);
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].quantity, 0.4);
        assert_eq!(trailing[0].trigger_price, Some(51_350.0));
        assert_eq!(h.venue.order(&original).unwrap().status, OrderStatus::Cancelled);

        let state = h.registry.protection(&btc()).unwrap();
        assert_eq!(state.phase, MonitorPhase::TrailingInstalled);
        assert!(h.registry.is_live(&btc(), TaskPurpose::TrailingMonitor));
        assert_eq!(h.venue.calls(VenueCall::TrailingStop), 2);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_cancel_before_partial_trigger_leaves_one_trailing_order() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 1.0).await;
        h.monitor.start(record).await;
        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);
        let original = trailing_orders(&h)[0].id.clone();

        h.venue.fail_next(
            VenueCall::CancelOrder,
            ExchangeError::Network("connection reset".to_string()),
        );
        h.venue.set_price(&btc(), 51_000.0);
        h.venue.set_position_quantity(&btc(), 0.4);

        assert!(wait_until(|| {
            h.registry
                .protection(&btc())
                .map_or(false, |s| s.last_known_quantity == 0.4 && s.order_id.is_some())
        })
        .await);

        let trailing = trailing_orders(&h);
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].quantity, 0.4);
        assert_eq!(h.venue.order(&original).unwrap().status, OrderStatus::Cancelled);
        assert_eq!(
            h.registry.protection(&btc()).unwrap().order_id.as_deref(),
            Some(trailing[0].id.as_str())
        );

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_replacement_waits_until_old_order_is_cancelled() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 1.0).await;
        h.monitor.start(record).await;
        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);
        let original = trailing_orders(&h)[0].id.clone();
        let cancels_before = h.venue.calls(VenueCall::CancelOrder);

        h.venue.set_failing(
            VenueCall::CancelOrder,
            Some(ExchangeError::Network("venue unreachable".to_string())),
        );
        h.venue.set_price(&btc(), 51_000.0);
        h.venue.set_position_quantity(&btc(), 0.4);

        // at least two replacement attempts
        assert!(wait_until(|| h.venue.calls(VenueCall::CancelOrder) >= cancels_before + 4).await);
        let trailing = trailing_orders(&h);
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].id, original);
        assert_eq!(h.venue.calls(VenueCall::TrailingStop), 1);
        let state = h.registry.protection(&btc()).unwrap();
        assert_eq!(state.order_id.as_deref(), Some(original.as_str()));
        assert_eq!(state.phase, MonitorPhase::TrailingTriggeredAwaitingReplacement);

        h.venue.set_failing(VenueCall::CancelOrder, None);
        assert!(wait_until(|| {
            h.registry
                .protection(&btc())
                .map_or(false, |s| s.phase == MonitorPhase::TrailingInstalled && s.last_known_quantity == 0.4)
        })
        .await);
        let trailing = trailing_orders(&h);
        assert_eq!(trailing.len(), 1);
        assert_eq!(trailing[0].quantity, 0.4);
        assert_eq!(h.venue.order(&original).unwrap().status, OrderStatus::Cancelled);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_resume_reinstalls_trailing_from_mark() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 0.06).await;
        // the preset stop-loss was cancelled by an operator close
        for order in h.venue.resting_orders(&btc()) {
            h.venue.cancel_order(&order.id, &btc()).await.unwrap();
        }
        h.venue.set_price(&btc(), 50_500.0);

        h.monitor.resume(record).await;

        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);
        assert_eq!(trailing_orders(&h)[0].trigger_price, Some(50_850.0));
        assert!(wait_until(|| h
            .registry
            .protection(&btc())
            .map_or(false, |s| s.phase == MonitorPhase::TrailingInstalled))
        .await);
        assert!(h.registry.is_live(&btc(), TaskPurpose::TrailingMonitor));

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_position_closed_tears_everything_down() {
        let h = harness(FillMode::Immediate);
        let record = submit_entry(&h, 0.06).await;
        h.monitor.start(record).await;
        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);

        // closed outside the bot; the trailing order lingers at the venue
        h.venue.set_position_quantity(&btc(), 0.0);

        assert!(wait_until(|| h.registry.entries().is_empty()).await);
        assert!(h.book.is_empty());
        assert!(h.registry.protection(&btc()).is_none());
        assert!(h.venue.resting_orders(&btc()).is_empty());
        assert!(!h.registry.is_monitored(&btc()));
    }

    #[tokio::test]
    async fn test_fill_timeout_cancels_entry() {
        let h = harness(FillMode::Manual);
        let record = submit_entry(&h, 0.06).await;
        let entry_id = record.entry_order_id.clone();
        h.monitor.start(record).await;

        assert!(wait_until(|| h.registry.entries().is_empty()).await);
        assert_eq!(h.venue.order(&entry_id).unwrap().status, OrderStatus::Cancelled);
        assert!(h.book.is_empty());
        assert_eq!(h.venue.calls(VenueCall::TrailingStop), 0);
    }

    #[tokio::test]
    async fn test_rejected_entry_closes_without_protection() {
        let h = harness(FillMode::Manual);
        let record = submit_entry(&h, 0.06).await;
        h.venue.set_order_status(&record.entry_order_id, OrderStatus::Rejected);
        h.monitor.start(record).await;

        assert!(wait_until(|| h.registry.entries().is_empty()).await);
        assert!(h.book.is_empty());
        assert!(h.venue.resting_orders(&btc()).is_empty());
    }

    #[tokio::test]
    async fn test_status_errors_fall_back_to_position_check() {
        let h = harness(FillMode::Manual);
        let record = submit_entry(&h, 0.06).await;
        h.venue.set_failing(
            VenueCall::FetchOrder,
            Some(ExchangeError::Network("status endpoint down".to_string())),
        );
        h.monitor.start(record.clone()).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(h.registry.is_live(&btc(), TaskPurpose::OrderFillWatch));

        h.venue.fill_order(&record.entry_order_id);
        assert!(wait_until(|| h.registry.is_live(&btc(), TaskPurpose::TrailingMonitor)).await);
        assert_eq!(trailing_orders(&h).len(), 1);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_installation_is_retried() {
        let h = harness(FillMode::Immediate);
        h.venue.fail_next(
            VenueCall::TrailingStop,
            ExchangeError::RateLimited("429".to_string()),
        );
        let record = submit_entry(&h, 0.06).await;
        h.monitor.start(record).await;

        assert!(wait_until(|| trailing_orders(&h).len() == 1).await);
        assert!(h.venue.calls(VenueCall::TrailingStop) >= 2);
        assert!(wait_until(|| h
            .registry
            .protection(&btc())
            .map_or(false, |s| s.order_id.is_some()))
        .await);

        h.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancelled_fill_watch_does_not_hand_off() {
        let h = harness(FillMode::Manual);
        let record = submit_entry(&h, 0.06).await;
        h.monitor.start(record.clone()).await;

        assert_eq!(h.registry.cancel_all(Some(&btc())).await, 1);
        h.venue.fill_order(&record.entry_order_id);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.registry.entries().is_empty());
        assert_eq!(h.venue.calls(VenueCall::TrailingStop), 0);
    }
}
