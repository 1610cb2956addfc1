pub mod indicators;
pub mod monitor_registry;
pub mod protective_monitor;
pub mod scan_scheduler;
pub mod strategies;
pub mod sweeper;
pub mod trade_book;
pub mod trader;
