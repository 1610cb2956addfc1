pub mod instrument;
pub mod position;
pub mod signal;
pub mod timeframe;
pub mod trade;
