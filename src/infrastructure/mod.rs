pub mod bitget_client;
pub mod simulated_exchange;

pub use bitget_client::{BitgetClient, BitgetConfig};
pub use simulated_exchange::SimulatedExchange;
