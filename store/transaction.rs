//! The single global write slot.
//!
//! Every mutation runs inside a [`Transaction`]. Only one transaction is
//! active at a time; waiters queue in FIFO order on a fair async mutex.
//! Writes are staged inside the transaction and published atomically on
//! [`Transaction::commit`]; dropping an uncommitted transaction discards
//! them.

use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, trace};

use super::StoreError;
use crate::lifetime::Lifetime;

/// Writes held back until commit, one per table touched.
pub(crate) trait StagedWrites: Send {
    fn apply(self: Box<Self>);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to the write slot and the commit latch.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    slot: Arc<tokio::sync::Mutex<()>>,
    latch: Arc<RwLock<()>>,
    next_txn: AtomicU64,
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Database {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                slot: Arc::new(tokio::sync::Mutex::new(())),
                latch: Arc::new(RwLock::new(())),
                next_txn: AtomicU64::new(1),
            }),
        }
    }

    /// Wait for the write slot. Fails with `Cancelled` if `lifetime` ends
    /// while queued.
    pub async fn begin(&self, lifetime: &Lifetime) -> Result<Transaction, StoreError> {
        let waited = Instant::now();
        let slot = lifetime
            .guard(self.inner.slot.clone().lock_owned())
            .await
            .map_err(|_| StoreError::Cancelled)?;
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        trace!(txn = id, waited_us = waited.elapsed().as_micros() as u64, "transaction started");
        Ok(Transaction {
            id,
            staged: Mutex::new(Vec::new()),
            latch: self.inner.latch.clone(),
            started: Instant::now(),
            committed: false,
            _slot: slot,
        })
    }

    /// Readers outside a transaction hold this briefly so that a commit
    /// spanning several tables is observed all at once.
    pub(crate) fn latch(&self) -> Arc<RwLock<()>> {
        self.inner.latch.clone()
    }
}

pub struct Transaction {
    id: u64,
    staged: Mutex<Vec<(&'static str, Box<dyn StagedWrites>)>>,
    latch: Arc<RwLock<()>>,
    started: Instant,
    committed: bool,
    _slot: OwnedMutexGuard<()>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Publish every staged write.
    pub fn commit(mut self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        let tables: Vec<&'static str> = staged.iter().map(|(name, _)| *name).collect();
        {
            let _publish = self.latch.write();
            for (_, writes) in staged {
                writes.apply();
            }
        }
        self.committed = true;
        debug!(
            txn = self.id,
            tables = ?tables,
            elapsed_us = self.started.elapsed().as_micros() as u64,
            "transaction committed"
        );
    }

    pub(crate) fn read_staged<S: 'static, R>(
        &self,
        table: &'static str,
        f: impl FnOnce(Option<&S>) -> R,
    ) -> R {
        let staged = self.staged.lock();
        let found = staged
            .iter()
            .find(|(name, _)| *name == table)
            .and_then(|(_, writes)| writes.as_any().downcast_ref::<S>());
        f(found)
    }

    pub(crate) fn write_staged<S: StagedWrites + 'static, R>(
        &self,
        table: &'static str,
        init: impl FnOnce() -> S,
        f: impl FnOnce(&mut S) -> R,
    ) -> R {
        let mut staged = self.staged.lock();
        let position = match staged.iter().position(|(name, _)| *name == table) {
            Some(position) => position,
            None => {
                staged.push((table, Box::new(init())));
                staged.len() - 1
            }
        };
        let writes = staged[position]
            .1
            .as_any_mut()
            .downcast_mut::<S>()
            .unwrap_or_else(|| panic!("table name {} registered twice with different types", table));
        f(writes)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.committed {
            let discarded = self.staged.get_mut().len();
            debug!(txn = self.id, tables = discarded, "transaction rolled back");
        }
    }
}
