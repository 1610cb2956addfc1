//! In-memory venue
//!
//! Implements `ExchangeClient` over local state so the engine can be driven
//! without a network. Positions, order statuses and failures are scriptable,
//! and every call is counted so tests can assert on venue traffic.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::position::{
    Candle, ContractSpec, OrderKind, OrderSnapshot, OrderStatus, Position, Ticker,
    QUANTITY_EPSILON,
};
use crate::domain::entities::signal::Side;
use crate::domain::entities::timeframe::Timeframe;
use crate::domain::repositories::exchange_client::{
    ExchangeClient, ExchangeError, ExchangeResult, MarketOrderRequest, TrailingStopRequest,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Venue operations, for failure injection and call counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VenueCall {
    Balance,
    Ticker,
    ContractSpec,
    Leverage,
    MarketOrder,
    TrailingStop,
    FetchOrder,
    OpenOrders,
    Positions,
    CancelOrder,
    ClosePosition,
    Ohlcv,
}

/// When market entries fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Entries fill on submission
    Immediate,
    /// Entries stay pending until `fill_order`
    Manual,
}

#[derive(Debug)]
struct SimState {
    balance: f64,
    prices: HashMap<Instrument, f64>,
    specs: HashMap<Instrument, ContractSpec>,
    candles: HashMap<Instrument, Vec<Candle>>,
    positions: HashMap<Instrument, Position>,
    orders: Vec<OrderSnapshot>,
    leverage: HashMap<Instrument, u32>,
    queued_failures: HashMap<VenueCall, VecDeque<ExchangeError>>,
    sticky_failures: HashMap<VenueCall, ExchangeError>,
    calls: HashMap<VenueCall, usize>,
    fill_mode: FillMode,
    next_id: u64,
}

pub struct SimulatedExchange {
    state: Mutex<SimState>,
    latency: Mutex<Duration>,
}

impl Default for SimulatedExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                balance: 1_000.0,
                prices: HashMap::new(),
                specs: HashMap::new(),
                candles: HashMap::new(),
                positions: HashMap::new(),
                orders: Vec::new(),
                leverage: HashMap::new(),
                queued_failures: HashMap::new(),
                sticky_failures: HashMap::new(),
                calls: HashMap::new(),
                fill_mode: FillMode::Immediate,
                next_id: 1,
            }),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_balance(&self, balance: f64) {
        self.state().balance = balance;
    }

    pub fn set_price(&self, instrument: &Instrument, price: f64) {
        let mut state = self.state();
        state.prices.insert(instrument.clone(), price);
        if let Some(position) = state.positions.get_mut(instrument) {
            position.mark_price = price;
        }
    }

    pub fn set_contract_spec(&self, instrument: &Instrument, spec: ContractSpec) {
        self.state().specs.insert(instrument.clone(), spec);
    }

    pub fn set_candles(&self, instrument: &Instrument, candles: Vec<Candle>) {
        self.state().candles.insert(instrument.clone(), candles);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.state().fill_mode = mode;
    }

    /// Delay applied before every venue call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|p| p.into_inner()) = latency;
    }

    /// Fail the next call of `call` with `error`
    pub fn fail_next(&self, call: VenueCall, error: ExchangeError) {
        self.state()
            .queued_failures
            .entry(call)
            .or_default()
            .push_back(error);
    }

    /// Fail every call of `call` until cleared with `None`
    pub fn set_failing(&self, call: VenueCall, error: Option<ExchangeError>) {
        let mut state = self.state();
        match error {
            Some(error) => {
                state.sticky_failures.insert(call, error);
            }
            None => {
                state.sticky_failures.remove(&call);
            }
        }
    }

    pub fn calls(&self, call: VenueCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    pub fn leverage_for(&self, instrument: &Instrument) -> Option<u32> {
        self.state().leverage.get(instrument).copied()
    }

    /// Fill a pending market order and grow the matching position
    pub fn fill_order(&self, order_id: &str) -> bool {
        let mut state = self.state();
        let Some(index) = state.orders.iter().position(|o| o.id == order_id) else {
            return false;
        };
        if state.orders[index].status != OrderStatus::Pending {
            return false;
        }
        state.orders[index].status = OrderStatus::Filled;
        let order = state.orders[index].clone();
        Self::apply_fill(&mut state, &order);
        true
    }

    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) {
        if let Some(order) = self.state().orders.iter_mut().find(|o| o.id == order_id) {
            order.status = status;
        }
    }

    /// Script a position directly, as a manual trade or liquidation would
    pub fn set_position(&self, instrument: &Instrument, side: Side, quantity: f64) {
        let mut state = self.state();
        if quantity <= QUANTITY_EPSILON {
            state.positions.remove(instrument);
            return;
        }
        let mark_price = state.prices.get(instrument).copied().unwrap_or(0.0);
        state.positions.insert(
            instrument.clone(),
            Position {
                instrument: instrument.clone(),
                side,
                quantity,
                mark_price,
                entry_price: Some(mark_price),
            },
        );
    }

    /// Change only the quantity of an existing position
    pub fn set_position_quantity(&self, instrument: &Instrument, quantity: f64) {
        let side = self
            .state()
            .positions
            .get(instrument)
            .map(|p| p.side)
            .unwrap_or(Side::Long);
        self.set_position(instrument, side, quantity);
    }

    pub fn position_quantity(&self, instrument: &Instrument) -> f64 {
        self.state()
            .positions
            .get(instrument)
            .map(|p| p.quantity)
            .unwrap_or(0.0)
    }

    /// Orders still resting at the venue for `instrument`
    pub fn resting_orders(&self, instrument: &Instrument) -> Vec<OrderSnapshot> {
        self.state()
            .orders
            .iter()
            .filter(|o| &o.instrument == instrument && is_resting(o))
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderSnapshot> {
        self.state().orders.iter().find(|o| o.id == order_id).cloned()
    }

    fn apply_fill(state: &mut SimState, order: &OrderSnapshot) {
        let side = order.side.unwrap_or(Side::Long);
        let mark_price = state.prices.get(&order.instrument).copied().unwrap_or(0.0);
        let position = state
            .positions
            .entry(order.instrument.clone())
            .or_insert_with(|| Position {
                instrument: order.instrument.clone(),
                side,
                quantity: 0.0,
                mark_price,
                entry_price: Some(mark_price),
            });
        position.quantity += order.quantity;
    }

    fn next_id(state: &mut SimState) -> String {
        let id = format!("sim-{}", state.next_id);
        state.next_id += 1;
        id
    }

    async fn enter(&self, call: VenueCall) -> ExchangeResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(|p| p.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        *state.calls.entry(call).or_insert(0) += 1;
        if let Some(error) = state
            .queued_failures
            .get_mut(&call)
            .and_then(|queue| queue.pop_front())
        {
            return Err(error);
        }
        if let Some(error) = state.sticky_failures.get(&call) {
            return Err(error.clone());
        }
        Ok(())
    }
}

fn is_resting(order: &OrderSnapshot) -> bool {
    matches!(
        order.status,
        OrderStatus::Pending | OrderStatus::PartiallyFilled
    )
}

#[async_trait]
impl ExchangeClient for SimulatedExchange {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn get_balance(&self) -> ExchangeResult<f64> {
        self.enter(VenueCall::Balance).await?;
        Ok(self.state().balance)
    }

    async fn get_ticker_price(&self, instrument: &Instrument) -> ExchangeResult<Ticker> {
        self.enter(VenueCall::Ticker).await?;
        let price = self
            .state()
            .prices
            .get(instrument)
            .copied()
            .ok_or_else(|| ExchangeError::NotFound(format!("no ticker for {}", instrument)))?;
        Ok(Ticker {
            last: price,
            mark: price,
            index: price,
        })
    }

    async fn contract_spec(&self, instrument: &Instrument) -> ExchangeResult<ContractSpec> {
        self.enter(VenueCall::ContractSpec).await?;
        Ok(self
            .state()
            .specs
            .get(instrument)
            .copied()
            .unwrap_or_default())
    }

    async fn set_leverage(&self, leverage: u32, instrument: &Instrument) -> ExchangeResult<()> {
        self.enter(VenueCall::Leverage).await?;
        self.state().leverage.insert(instrument.clone(), leverage);
        Ok(())
    }

    async fn create_market_order(&self, request: &MarketOrderRequest) -> ExchangeResult<String> {
        self.enter(VenueCall::MarketOrder).await?;
        let mut state = self.state();

        let entry_id = Self::next_id(&mut state);
        let entry = OrderSnapshot {
            id: entry_id.clone(),
            instrument: request.instrument.clone(),
            kind: OrderKind::Market,
            side: Some(request.side),
            quantity: request.quantity,
            trigger_price: None,
            status: OrderStatus::Pending,
        };
        state.orders.push(entry.clone());

        if let Some(stop_loss) = request.stop_loss {
            let id = Self::next_id(&mut state);
            state.orders.push(OrderSnapshot {
                id,
                instrument: request.instrument.clone(),
                kind: OrderKind::StopLoss,
                side: Some(request.side),
                quantity: request.quantity,
                trigger_price: Some(stop_loss),
                status: OrderStatus::Pending,
            });
        }
        if let Some(activation) = request.trailing_activation {
            let id = Self::next_id(&mut state);
            state.orders.push(OrderSnapshot {
                id,
                instrument: request.instrument.clone(),
                kind: OrderKind::TrailingStop,
                side: Some(request.side),
                quantity: request.quantity,
                trigger_price: Some(activation),
                status: OrderStatus::Pending,
            });
        }

        if state.fill_mode == FillMode::Immediate {
            if let Some(order) = state.orders.iter_mut().find(|o| o.id == entry_id) {
                order.status = OrderStatus::Filled;
            }
            Self::apply_fill(&mut state, &entry);
        }

        Ok(entry_id)
    }

    async fn place_trailing_stop(&self, request: &TrailingStopRequest) -> ExchangeResult<String> {
        self.enter(VenueCall::TrailingStop).await?;
        let mut state = self.state();
        let id = Self::next_id(&mut state);
        state.orders.push(OrderSnapshot {
            id: id.clone(),
            instrument: request.instrument.clone(),
            kind: OrderKind::TrailingStop,
            side: Some(request.side),
            quantity: request.quantity,
            trigger_price: Some(request.activation_price),
            status: OrderStatus::Pending,
        });
        Ok(id)
    }

    async fn fetch_order(
        &self,
        order_id: &str,
        _instrument: &Instrument,
    ) -> ExchangeResult<OrderStatus> {
        self.enter(VenueCall::FetchOrder).await?;
        Ok(self
            .state()
            .orders
            .iter()
            .find(|o| o.id == order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::Unknown))
    }

    async fn fetch_open_orders(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<OrderSnapshot>> {
        self.enter(VenueCall::OpenOrders).await?;
        Ok(self
            .state()
            .orders
            .iter()
            .filter(|o| is_resting(o) && instrument.map_or(true, |i| &o.instrument == i))
            .cloned()
            .collect())
    }

    async fn fetch_positions(
        &self,
        instrument: Option<&Instrument>,
    ) -> ExchangeResult<Vec<Position>> {
        self.enter(VenueCall::Positions).await?;
        let mut positions: Vec<Position> = self
            .state()
            .positions
            .values()
            .filter(|p| p.is_open() && instrument.map_or(true, |i| &p.instrument == i))
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(positions)
    }

    async fn cancel_order(&self, order_id: &str, _instrument: &Instrument) -> ExchangeResult<()> {
        self.enter(VenueCall::CancelOrder).await?;
        let mut state = self.state();
        match state
            .orders
            .iter_mut()
            .find(|o| o.id == order_id && is_resting(o))
        {
            Some(order) => {
                order.status = OrderStatus::Cancelled;
                Ok(())
            }
            None => Err(ExchangeError::NotFound(format!("order {} is not open", order_id))),
        }
    }

    async fn close_position(&self, position: &Position) -> ExchangeResult<()> {
        self.enter(VenueCall::ClosePosition).await?;
        self.state()
            .positions
            .remove(&position.instrument)
            .map(|_| ())
            .ok_or_else(|| ExchangeError::NotFound(format!("no position for {}", position.instrument)))
    }

    async fn fetch_ohlcv(
        &self,
        instrument: &Instrument,
        _timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Candle>> {
        self.enter(VenueCall::Ohlcv).await?;
        let state = self.state();
        let candles = state.candles.get(instrument).cloned().unwrap_or_default();
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Instrument {
        Instrument::parse("BTC/USDT").unwrap()
    }

    fn entry(quantity: f64) -> MarketOrderRequest {
        MarketOrderRequest {
            instrument: btc(),
            side: Side::Long,
            quantity,
            stop_loss: Some(49_700.0),
            trailing_activation: None,
            trailing_callback_pct: None,
        }
    }

    #[tokio::test]
    async fn test_immediate_fill_opens_position_with_preset_stop() {
        let venue = SimulatedExchange::new();
        venue.set_price(&btc(), 50_000.0);

        let id = venue.create_market_order(&entry(0.5)).await.unwrap();
        assert_eq!(venue.fetch_order(&id, &btc()).await.unwrap(), OrderStatus::Filled);
        assert_eq!(venue.position_quantity(&btc()), 0.5);

        let open = venue.fetch_open_orders(Some(&btc())).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].kind, OrderKind::StopLoss);
    }

    #[tokio::test]
    async fn test_manual_fill_keeps_entry_pending() {
        let venue = SimulatedExchange::new();
        venue.set_fill_mode(FillMode::Manual);

        let id = venue.create_market_order(&entry(0.5)).await.unwrap();
        assert_eq!(venue.fetch_order(&id, &btc()).await.unwrap(), OrderStatus::Pending);
        assert!(venue.fetch_positions(None).await.unwrap().is_empty());

        assert!(venue.fill_order(&id));
        assert_eq!(venue.position_quantity(&btc()), 0.5);
        assert!(!venue.fill_order(&id));
    }

    #[tokio::test]
    async fn test_failure_injection_and_call_counting() {
        let venue = SimulatedExchange::new();
        venue.fail_next(VenueCall::Balance, ExchangeError::Network("reset".to_string()));

        assert!(venue.get_balance().await.is_err());
        assert_eq!(venue.get_balance().await.unwrap(), 1_000.0);
        assert_eq!(venue.calls(VenueCall::Balance), 2);

        venue.set_failing(
            VenueCall::Positions,
            Some(ExchangeError::Network("down".to_string())),
        );
        assert!(venue.fetch_positions(None).await.is_err());
        venue.set_failing(VenueCall::Positions, None);
        assert!(venue.fetch_positions(None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_twice_reports_not_found() {
        let venue = SimulatedExchange::new();
        let id = venue
            .place_trailing_stop(&TrailingStopRequest {
                instrument: btc(),
                side: Side::Long,
                quantity: 0.5,
                activation_price: 50_350.0,
                callback_pct: 0.25,
            })
            .await
            .unwrap();

        assert!(venue.cancel_order(&id, &btc()).await.is_ok());
        assert!(matches!(
            venue.cancel_order(&id, &btc()).await,
            Err(ExchangeError::NotFound(_))
        ));
        assert_eq!(venue.order(&id).unwrap().status, OrderStatus::Cancelled);
    }
}
