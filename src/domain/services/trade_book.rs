//! TradeRecord store
//!
//! Holds at most one `TradeRecord` per instrument. Entry, explicit close and
//! the sweeper serialise through `lock_mutations()`; monitors remove their
//! own record on confirmed close without taking that lock.

use crate::domain::entities::instrument::Instrument;
use crate::domain::entities::trade::TradeRecord;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

#[derive(Clone, Default)]
pub struct TradeBook {
    records: Arc<Mutex<HashMap<Instrument, TradeRecord>>>,
    mutation: Arc<AsyncMutex<()>>,
}

impl TradeBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide trade-mutation section
    pub async fn lock_mutations(&self) -> AsyncMutexGuard<'_, ()> {
        self.mutation.lock().await
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Instrument, TradeRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert unless a record already exists; returns false on conflict
    pub fn insert(&self, record: TradeRecord) -> bool {
        let mut records = self.records();
        if records.contains_key(&record.instrument) {
            return false;
        }
        records.insert(record.instrument.clone(), record);
        true
    }

    pub fn get(&self, instrument: &Instrument) -> Option<TradeRecord> {
        self.records().get(instrument).cloned()
    }

    pub fn contains(&self, instrument: &Instrument) -> bool {
        self.records().contains_key(instrument)
    }

    pub fn remove(&self, instrument: &Instrument) -> Option<TradeRecord> {
        self.records().remove(instrument)
    }

    /// Remove only the record created for `entry_order_id`
    pub fn remove_entry(&self, instrument: &Instrument, entry_order_id: &str) -> bool {
        let mut records = self.records();
        match records.get(instrument) {
            Some(record) if record.entry_order_id == entry_order_id => {
                records.remove(instrument);
                true
            }
            _ => false,
        }
    }

    pub fn instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> = self.records().keys().cloned().collect();
        instruments.sort();
        instruments
    }

    pub fn snapshot(&self) -> Vec<TradeRecord> {
        let mut records: Vec<TradeRecord> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        records
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::signal::tests::btc_long_signal;

    fn record(entry_order_id: &str) -> TradeRecord {
        TradeRecord::from_signal(&btc_long_signal(), entry_order_id.to_string(), 0.06)
    }

    #[test]
    fn test_insert_rejects_second_record_for_instrument() {
        let book = TradeBook::new();
        assert!(book.insert(record("a")));
        assert!(!book.insert(record("b")));
        assert_eq!(book.len(), 1);
        assert_eq!(
            book.get(&Instrument::parse("BTCUSDT").unwrap())
                .unwrap()
                .entry_order_id,
            "a"
        );
    }

    #[test]
    fn test_remove_entry_matches_order_id() {
        let book = TradeBook::new();
        let btc = Instrument::parse("BTC/USDT").unwrap();
        book.insert(record("a"));

        assert!(!book.remove_entry(&btc, "stale"));
        assert!(book.contains(&btc));
        assert!(book.remove_entry(&btc, "a"));
        assert!(book.is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_state_and_lock() {
        let book = TradeBook::new();
        let other = book.clone();
        book.insert(record("a"));
        assert_eq!(other.instruments().len(), 1);

        let _guard = book.lock_mutations().await;
        assert!(other.mutation.try_lock().is_err());
    }
}
