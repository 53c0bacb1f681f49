#![forbid(unsafe_code)]

//! Explicit per-session context: the ledger store plus the record loaded from
//! it. Everything that reads or mutates the ledger receives a `&mut Session`.

use anyhow::Result;

use crate::ledger::{LedgerRecord, LedgerStore};

#[derive(Debug)]
pub struct Session {
    store: LedgerStore,
    record: LedgerRecord,
}

impl Session {
    /// Loads the record (fail-soft) from `store`.
    pub fn open(store: LedgerStore) -> Self {
        let record = store.load();
        Self { store, record }
    }

    pub fn record(&self) -> &LedgerRecord {
        &self.record
    }

    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Applies `mutate` and persists immediately.
    pub fn update<R>(&mut self, mutate: impl FnOnce(&mut LedgerRecord) -> R) -> Result<R> {
        let value = mutate(&mut self.record);
        self.store.save(&self.record)?;
        Ok(value)
    }

    pub fn clear(&mut self) -> Result<()> {
        self.record = self.store.clear()?;
        Ok(())
    }
}
