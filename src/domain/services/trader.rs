//! Trader
//!
//! Gatekeeper for opening and closing trades and the only writer of
//! `TradeRecord`s. Entry and explicit close run inside the trade book's
//! mutation section, so at most one `TradeRecord` exists per instrument.
//!
//! ## Entry
//! 1. Validate the signal
//! 2. Refuse if a record, a live monitor, or a real position already exists
//! 3. Check balance and size the order from balance, leverage and mark price
//! 4. Set leverage and submit the market entry with its fixed stop-loss
//! 5. Record the trade and start the protective-order monitor
//!
//! Exchange errors never escape `open_trade`: they are classified, logged and
//! returned as a failure message.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{open_quantity, OrderSnapshot, Position, QUANTITY_EPSILON};
use crate::domain::entities::signal::Signal;
use crate::domain::entities::trade::TradeRecord;
use crate::domain::errors::{ErrorSeverity, OrderFailureKind, TradeError, ValidationError};
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangeResult, MarketOrderRequest,
};
use crate::domain::services::monitor_registry::MonitorRegistry;
use crate::domain::services::protective_monitor::ProtectiveMonitor;
use crate::domain::services::trade_book::TradeBook;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MIN_LEVERAGE: u32 = 1;
pub const MAX_LEVERAGE: u32 = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct TraderConfig {
    pub leverage: u32,
    /// Share of leveraged balance committed per trade, in percent
    pub position_size_percent: f64,
    /// Entries are refused below this available balance
    pub min_balance: f64,
}

impl Default for TraderConfig {
    fn default() -> Self {
        Self {
            leverage: 20,
            position_size_percent: 15.0,
            min_balance: 5.0,
        }
    }
}

/// Outcome of a close request; always returned, even on partial failure
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CloseSummary {
    pub cancelled_orders: usize,
    pub closed_positions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `(balance × leverage / 100) × percent / price`
pub fn position_size(balance: f64, leverage: u32, position_size_percent: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    (balance * leverage as f64 / 100.0) * position_size_percent / price
}

fn submission_failed(error: &ExchangeError) -> TradeError {
    TradeError::OrderSubmissionFailed {
        kind: error.classify(),
        reason: error.to_string(),
    }
}

pub struct Trader {
    exchange: Arc<dyn ExchangeClient>,
    book: TradeBook,
    registry: MonitorRegistry,
    monitor: ProtectiveMonitor,
    leverage: AtomicU32,
    position_size_percent: f64,
    min_balance: f64,
}

impl Trader {
    pub fn new(
        exchange: Arc<dyn ExchangeClient>,
        book: TradeBook,
        registry: MonitorRegistry,
        monitor: ProtectiveMonitor,
        config: TraderConfig,
    ) -> Self {
        let leverage = config.leverage.clamp(MIN_LEVERAGE, MAX_LEVERAGE);
        Self {
            exchange,
            book,
            registry,
            monitor,
            leverage: AtomicU32::new(leverage),
            position_size_percent: config.position_size_percent,
            min_balance: config.min_balance,
        }
    }

    pub fn leverage(&self) -> u32 {
        self.leverage.load(Ordering::Relaxed)
    }

    /// Leverage for subsequent entries; false when out of range
    pub fn set_leverage(&self, leverage: u32) -> bool {
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            warn!("{}", ValidationError::InvalidLeverage(leverage));
            return false;
        }
        self.leverage.store(leverage, Ordering::Relaxed);
        info!("Leverage set to {}x", leverage);
        true
    }

    /// Open a trade and describe the outcome for the operator
    pub async fn open_trade(&self, signal: Signal) -> String {
        let instrument = signal.instrument.clone();
        match self.try_open_trade(signal).await {
            Ok(record) => {
                let trailing = if record.trailing.enabled {
                    format!(", trailing from {:.4}", record.trailing.activation_price)
                } else {
                    String::new()
                };
                format!(
                    "Opened {} {} quantity {:.6}, stop-loss {:.4}{}",
                    record.side, record.instrument, record.quantity, record.stop_loss, trailing
                )
            }
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Critical => error!("Entry for {} failed [{}]: {}", instrument, e.error_code(), e),
                    _ => warn!("Entry for {} refused [{}]: {}", instrument, e.error_code(), e),
                }
                format!("Failed to open {}: {}", instrument, e)
            }
        }
    }

    pub async fn try_open_trade(&self, signal: Signal) -> Result<TradeRecord, TradeError> {
        signal.validate()?;
        let instrument = signal.instrument.clone();

        let _mutations = self.book.lock_mutations().await;

        if self.book.contains(&instrument) {
            return Err(TradeError::AlreadyOpenTrade {
                instrument: instrument.to_string(),
            });
        }
        self.ensure_flat(&instrument).await?;

        let balance = self
            .exchange
            .get_balance()
            .await
            .map_err(|e| TradeError::BalanceFetchFailed {
                reason: e.to_string(),
            })?;
        if balance < self.min_balance {
            return Err(TradeError::InsufficientFunds {
                available: balance,
                minimum: self.min_balance,
            });
        }

        let leverage = self.leverage();
        let spec = match self.exchange.contract_spec(&instrument).await {
            Ok(spec) => spec,
            Err(e) => {
                warn!("Contract spec for {} unavailable, using defaults: {}", instrument, e);
                Default::default()
            }
        };

        let raw_quantity = match signal.quantity {
            Some(quantity) => quantity,
            None => {
                let price = self.sizing_price(&signal).await;
                position_size(balance, leverage, self.position_size_percent, price)
            }
        };
        let quantity = spec.round_quantity(raw_quantity);
        if quantity <= QUANTITY_EPSILON || quantity < spec.min_quantity {
            return Err(TradeError::OrderSubmissionFailed {
                kind: OrderFailureKind::SizePrecision,
                reason: format!(
                    "quantity {} rounds to {} (precision {}, minimum {})",
                    raw_quantity, quantity, spec.quantity_precision, spec.min_quantity
                ),
            });
        }

        self.exchange
            .set_leverage(leverage, &instrument)
            .await
            .map_err(|e| submission_failed(&e))?;

        info!(
            "Submitting {} entry for {}: quantity {}, stop-loss {}, leverage {}x",
            signal.side, instrument, quantity, signal.stop_loss, leverage
        );
        let request = MarketOrderRequest {
            instrument: instrument.clone(),
            side: signal.side,
            quantity,
            stop_loss: Some(spec.round_price(signal.stop_loss)),
            trailing_activation: None,
            trailing_callback_pct: None,
        };
        let order_id = self
            .exchange
            .create_market_order(&request)
            .await
            .map_err(|e| submission_failed(&e))?;

        let record = TradeRecord::from_signal(&signal, order_id, quantity);
        if !self.book.insert(record.clone()) {
            // unreachable while the mutation section is held
            return Err(TradeError::AlreadyOpenTrade {
                instrument: instrument.to_string(),
            });
        }
        self.monitor.start(record.clone()).await;

        info!(
            "Trade opened: {} {} quantity {} (entry order {}, strategy {} on {})",
            record.side,
            record.instrument,
            record.quantity,
            record.entry_order_id,
            record.strategy_name,
            record.timeframe
        );
        Ok(record)
    }

    /// Refuse entry while a real position exists; clear stale monitors otherwise
    async fn ensure_flat(&self, instrument: &Instrument) -> Result<(), TradeError> {
        let positions = self
            .exchange
            .fetch_positions(Some(instrument))
            .await
            .map_err(|e| submission_failed(&e))?;
        let real = open_quantity(&positions, instrument);

        if real > QUANTITY_EPSILON {
            warn!(
                "{} has a venue position of {} without a trade record",
                instrument, real
            );
            return Err(TradeError::AlreadyOpenTrade {
                instrument: instrument.to_string(),
            });
        }

        if self.registry.is_monitored(instrument) {
            let stopped = self.registry.cancel_all(Some(instrument)).await;
            warn!(
                "Cleared {} stale monitor tasks for flat instrument {}",
                stopped, instrument
            );
        }
        Ok(())
    }

    async fn sizing_price(&self, signal: &Signal) -> f64 {
        match self.exchange.get_ticker_price(&signal.instrument).await {
            Ok(ticker) if ticker.mark > 0.0 => ticker.mark,
            Ok(_) => signal.entry_price,
            Err(e) => {
                warn!(
                    "Ticker for {} unavailable, sizing from signal price: {}",
                    signal.instrument, e
                );
                signal.entry_price
            }
        }
    }

    /// Cancel orders and flatten the position for one instrument
    pub async fn close_trade(&self, instrument: &Instrument) -> CloseSummary {
        let _mutations = self.book.lock_mutations().await;
        self.close_scope(Some(instrument)).await
    }

    /// Panic button: cancel every order and flatten every position
    pub async fn close_all_trades(&self) -> CloseSummary {
        let _mutations = self.book.lock_mutations().await;
        self.close_scope(None).await
    }

    async fn close_scope(&self, scope: Option<&Instrument>) -> CloseSummary {
        let mut summary = CloseSummary::default();
        let mut errors: Vec<String> = Vec::new();
        let mut failed: Vec<Instrument> = Vec::new();

        let stopped = self.registry.cancel_all(scope).await;

        match self.exchange.fetch_open_orders(scope).await {
            Ok(orders) => {
                for order in orders {
                    match self.exchange.cancel_order(&order.id, &order.instrument).await {
                        Ok(()) => summary.cancelled_orders += 1,
                        Err(ExchangeError::NotFound(_)) => {}
                        Err(e) => errors.push(format!("cancel {}: {}", order.id, e)),
                    }
                }
            }
            Err(e) => errors.push(format!("open orders: {}", e)),
        }

        match self.exchange.fetch_positions(scope).await {
            Ok(positions) => {
                for position in positions.iter().filter(|p| p.is_open()) {
                    match self.exchange.close_position(position).await {
                        Ok(()) => summary.closed_positions += 1,
                        Err(e) => {
                            errors.push(format!("close {}: {}", position.instrument, e));
                            failed.push(position.instrument.clone());
                        }
                    }
                }
            }
            Err(e) => {
                errors.push(format!("positions: {}", e));
                failed.extend(scope.cloned().into_iter().chain(self.book.instruments()));
            }
        }

        let targets = match scope {
            Some(instrument) => vec![instrument.clone()],
            None => self.book.instruments(),
        };
        for instrument in targets.iter().filter(|i| !failed.contains(i)) {
            self.book.remove(instrument);
        }

        failed.sort();
        failed.dedup();
        for instrument in &failed {
            self.restore_protection(instrument).await;
        }

        if !errors.is_empty() {
            summary.error = Some(errors.join("; "));
        }
        info!(
            "Close {}: {} tasks stopped, {} orders cancelled, {} positions closed{}",
            scope.map_or_else(|| "all".to_string(), |i| i.to_string()),
            stopped,
            summary.cancelled_orders,
            summary.closed_positions,
            summary
                .error
                .as_ref()
                .map(|e| format!(", errors: {}", e))
                .unwrap_or_default()
        );
        summary
    }

    /// A close failed after its monitor and protective orders were removed
    async fn restore_protection(&self, instrument: &Instrument) {
        match self.book.get(instrument) {
            Some(record) => {
                error!(
                    "Close of {} failed, position left open; restoring protection",
                    instrument
                );
                self.monitor.resume(record).await;
            }
            None => error!(
                "Close of {} failed and no trade record exists; position is unprotected",
                instrument
            ),
        }
    }

    pub async fn get_active_positions(&self) -> ExchangeResult<Vec<Position>> {
        self.exchange.fetch_positions(None).await
    }

    pub async fn get_open_orders(&self) -> ExchangeResult<Vec<OrderSnapshot>> {
        self.exchange.fetch_open_orders(None).await
    }

    pub fn active_trades(&self) -> Vec<TradeRecord> {
        self.book.snapshot()
    }
}
