//! Versioned resource storage.
//!
//! This module provides [`ResourceStore`], a typed, append-only version chain
//! per entity with soft delete:
//!
//! - a permanent [`Record`] `{id, deleted}` per logical entity
//! - a chain of immutable [`Version`]s linked by `previous_data_id` /
//!   `next_data_id`; the head is the one version with no `next`
//! - every mutation runs inside a [`Transaction`] from the single global
//!   write slot ([`Database::begin`]); reads outside a transaction see the
//!   last committed heads
//!
//! The physical engine sits behind the [`Engine`] trait; [`MemoryTable`] is
//! the in-process implementation whose contents can be exported as a
//! [`TableImage`] for durable storage.

mod engine;
mod query;
mod transaction;

pub use engine::{Engine, MemoryTable, TableImage};
pub use query::{DeletedFilter, Query};
pub use transaction::{Database, Transaction};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

pub type ResourceId = u64;
pub type DataId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("{table} {id} not found")]
    NotFound { table: &'static str, id: ResourceId },

    #[error("{table} {id} is deleted")]
    Gone { table: &'static str, id: ResourceId },

    #[error("{table} {id} changed: expected head version {expected}, found {head}")]
    Conflict {
        table: &'static str,
        id: ResourceId,
        expected: DataId,
        head: DataId,
    },

    #[error("transaction cancelled")]
    Cancelled,

    #[error("storage engine fault: {0}")]
    Engine(String),
}

/// An entity type that can live in a [`ResourceStore`].
pub trait Resource: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Unique table name.
    const TABLE: &'static str;

    /// Secondary index key (parent id, owning content, ...).
    fn partition(&self) -> Option<u64> {
        None
    }

    /// Fields covered by free-text search.
    fn search_text(&self) -> Vec<&str> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: ResourceId,
    pub deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Version<T> {
    pub data_id: DataId,
    pub id: ResourceId,
    pub create_time: DateTime<Utc>,
    pub previous_data_id: Option<DataId>,
    pub next_data_id: Option<DataId>,
    pub fields: T,
}

/// One version of a resource together with its record state.
#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub id: ResourceId,
    pub data_id: DataId,
    pub create_time: DateTime<Utc>,
    pub previous_data_id: Option<DataId>,
    pub next_data_id: Option<DataId>,
    pub deleted: bool,
    pub fields: T,
}

impl<T: Clone> Stored<T> {
    pub(crate) fn from_parts(record: &Record, version: &Version<T>) -> Self {
        Self {
            id: version.id,
            data_id: version.data_id,
            create_time: version.create_time,
            previous_data_id: version.previous_data_id,
            next_data_id: version.next_data_id,
            deleted: record.deleted,
            fields: version.fields.clone(),
        }
    }
}

impl<T> Stored<T> {
    pub fn is_head(&self) -> bool {
        self.next_data_id.is_none()
    }

    pub fn into_fields(self) -> T {
        self.fields
    }
}

impl<T> Deref for Stored<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.fields
    }
}

/// Typed access to one table.
pub struct ResourceStore<T: Resource> {
    engine: Arc<dyn Engine<T>>,
}

impl<T: Resource> Clone for ResourceStore<T> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
        }
    }
}

impl<T: Resource> ResourceStore<T> {
    pub fn new(engine: Arc<dyn Engine<T>>) -> Self {
        Self { engine }
    }

    pub fn in_memory(db: &Database) -> Self {
        Self::new(Arc::new(MemoryTable::<T>::new(db)))
    }

    pub fn insert(&self, tx: &Transaction, fields: T) -> Result<Stored<T>, StoreError> {
        let stored = self.engine.insert(tx, fields)?;
        debug!(table = T::TABLE, id = stored.id, data_id = stored.data_id, "resource inserted");
        Ok(stored)
    }

    /// Head version of a live resource.
    pub fn get(&self, tx: Option<&Transaction>, id: ResourceId) -> Result<Stored<T>, StoreError> {
        let stored = self.get_any(tx, id)?;
        if stored.deleted {
            return Err(StoreError::Gone { table: T::TABLE, id });
        }
        Ok(stored)
    }

    /// Head version, soft-deleted or not.
    pub fn get_any(&self, tx: Option<&Transaction>, id: ResourceId) -> Result<Stored<T>, StoreError> {
        self.engine
            .head(tx, id)
            .ok_or(StoreError::NotFound { table: T::TABLE, id })
    }

    pub fn find(&self, tx: Option<&Transaction>, id: ResourceId) -> Option<Stored<T>> {
        self.engine.head(tx, id).filter(|stored| !stored.deleted)
    }

    /// Append a patched version after the current head, or after
    /// `base_data_id` when the caller read an earlier head and wants the
    /// write to fail if anyone else got there first.
    pub fn update(
        &self,
        tx: &Transaction,
        id: ResourceId,
        base_data_id: Option<DataId>,
        patch: impl FnOnce(&mut T),
    ) -> Result<Stored<T>, StoreError> {
        let head = self.get(Some(tx), id)?;
        if let Some(base) = base_data_id {
            if base != head.data_id {
                return Err(StoreError::Conflict {
                    table: T::TABLE,
                    id,
                    expected: base,
                    head: head.data_id,
                });
            }
        }
        let mut fields = head.fields;
        patch(&mut fields);
        let stored = self.engine.update_version(tx, id, fields, head.data_id)?;
        debug!(
            table = T::TABLE,
            id,
            data_id = stored.data_id,
            previous = head.data_id,
            "resource updated"
        );
        Ok(stored)
    }

    /// Soft delete; version history is untouched.
    pub fn delete(&self, tx: &Transaction, id: ResourceId) -> Result<(), StoreError> {
        self.engine.set_deleted(tx, id, true)?;
        debug!(table = T::TABLE, id, "resource deleted");
        Ok(())
    }

    pub fn restore(&self, tx: &Transaction, id: ResourceId) -> Result<(), StoreError> {
        self.engine.set_deleted(tx, id, false)?;
        debug!(table = T::TABLE, id, "resource restored");
        Ok(())
    }

    /// Irreversibly remove the record and every version.
    pub fn purge(&self, tx: &Transaction, id: ResourceId) -> Result<(), StoreError> {
        self.engine.purge(tx, id)?;
        debug!(table = T::TABLE, id, "resource purged");
        Ok(())
    }

    pub fn query(&self, tx: Option<&Transaction>, query: &Query<T>) -> Vec<Stored<T>> {
        let rows = self
            .engine
            .query_heads(tx, query.partition, query.deleted, &|stored| query.matches(stored));
        query.arrange(rows)
    }

    pub fn first(&self, tx: Option<&Transaction>, query: &Query<T>) -> Option<Stored<T>> {
        self.query(tx, &query.clone().limit(1)).into_iter().next()
    }

    /// Number of matching heads, ignoring offset and limit.
    pub fn count(&self, tx: Option<&Transaction>, query: &Query<T>) -> usize {
        self.engine
            .query_heads(tx, query.partition, query.deleted, &|stored| query.matches(stored))
            .len()
    }

    pub fn version(
        &self,
        tx: Option<&Transaction>,
        id: ResourceId,
        data_id: DataId,
    ) -> Result<Stored<T>, StoreError> {
        self.engine
            .version(tx, id, data_id)
            .ok_or(StoreError::NotFound { table: T::TABLE, id })
    }

    /// Every version, newest first, walking `previous_data_id` from the head.
    pub fn history(&self, tx: Option<&Transaction>, id: ResourceId) -> Result<Vec<Stored<T>>, StoreError> {
        let mut current = Some(self.get_any(tx, id)?);
        let mut chain = Vec::new();
        while let Some(version) = current {
            current = match version.previous_data_id {
                Some(previous) => Some(self.version(tx, id, previous)?),
                None => None,
            };
            chain.push(version);
        }
        Ok(chain)
    }

    pub fn export(&self) -> TableImage<T> {
        self.engine.export()
    }

    pub fn import(&self, image: TableImage<T>) {
        self.engine.import(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::Lifetime;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        folder: u64,
        title: String,
    }

    impl Resource for Note {
        const TABLE: &'static str = "notes";

        fn partition(&self) -> Option<u64> {
            Some(self.folder)
        }

        fn search_text(&self) -> Vec<&str> {
            vec![self.title.as_str()]
        }
    }

    fn note(folder: u64, title: &str) -> Note {
        Note {
            folder,
            title: title.to_string(),
        }
    }

    fn setup() -> (Database, ResourceStore<Note>, Lifetime) {
        let db = Database::new();
        let store = ResourceStore::in_memory(&db);
        (db, store, Lifetime::new())
    }

    #[tokio::test]
    async fn insert_then_read_returns_fields() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let inserted = store.insert(&tx, note(1, "groceries")).expect("insert");
        tx.commit();

        let read = store.get(None, inserted.id).expect("get");
        assert_eq!(read.fields, note(1, "groceries"));
        assert!(read.is_head());
        assert!(read.previous_data_id.is_none());
        assert!(!read.deleted);
    }

    #[tokio::test]
    async fn update_keeps_prior_version_reachable() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let first = store.insert(&tx, note(1, "draft")).expect("insert");
        let second = store
            .update(&tx, first.id, None, |n| n.title = "final".into())
            .expect("update");
        tx.commit();

        let head = store.get(None, first.id).expect("get");
        assert_eq!(head.title, "final");
        assert_eq!(head.data_id, second.data_id);
        assert_eq!(head.previous_data_id, Some(first.data_id));

        let prior = store.version(None, first.id, first.data_id).expect("prior");
        assert_eq!(prior.title, "draft");
        assert_eq!(prior.next_data_id, Some(second.data_id));

        let history = store.history(None, first.id).expect("history");
        let titles: Vec<_> = history.iter().map(|v| v.title.as_str()).collect();
        assert_eq!(titles, vec!["final", "draft"]);
        assert_eq!(history.iter().filter(|v| v.is_head()).count(), 1);
    }

    #[tokio::test]
    async fn stale_base_version_conflicts() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let first = store.insert(&tx, note(1, "a")).expect("insert");
        store.update(&tx, first.id, Some(first.data_id), |n| n.title = "b".into()).expect("update");

        let stale = store.update(&tx, first.id, Some(first.data_id), |n| n.title = "c".into());
        assert!(matches!(stale, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_outside_the_transaction() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let inserted = store.insert(&tx, note(1, "pending")).expect("insert");

        assert!(store.get(Some(&tx), inserted.id).is_ok());
        assert!(matches!(store.get(None, inserted.id), Err(StoreError::NotFound { .. })));
        drop(tx);

        assert!(store.get(None, inserted.id).is_err());
    }

    #[tokio::test]
    async fn soft_delete_hides_and_restore_reveals() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let inserted = store.insert(&tx, note(1, "temp")).expect("insert");
        store.delete(&tx, inserted.id).expect("delete");
        tx.commit();

        assert!(matches!(store.get(None, inserted.id), Err(StoreError::Gone { .. })));
        assert!(store.get_any(None, inserted.id).expect("any").deleted);
        assert!(store.query(None, &Query::new()).is_empty());
        assert_eq!(store.query(None, &Query::new().deleted(DeletedFilter::Only)).len(), 1);

        let tx = db.begin(&lifetime).await.expect("begin");
        let update = store.update(&tx, inserted.id, None, |n| n.title = "nope".into());
        assert!(matches!(update, Err(StoreError::Gone { .. })));
        store.restore(&tx, inserted.id).expect("restore");
        tx.commit();

        assert_eq!(store.get(None, inserted.id).expect("get").title, "temp");
        assert_eq!(store.history(None, inserted.id).expect("history").len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_every_version() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let inserted = store.insert(&tx, note(1, "v1")).expect("insert");
        store.update(&tx, inserted.id, None, |n| n.title = "v2".into()).expect("update");
        tx.commit();

        let tx = db.begin(&lifetime).await.expect("begin");
        store.purge(&tx, inserted.id).expect("purge");
        tx.commit();

        assert!(matches!(store.get_any(None, inserted.id), Err(StoreError::NotFound { .. })));
        assert!(store.version(None, inserted.id, inserted.data_id).is_err());
        assert!(store.query(None, &Query::new().partition(1)).is_empty());
    }

    #[tokio::test]
    async fn query_filters_searches_orders_and_paginates() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        for (folder, title) in [(1, "Alpha report"), (1, "beta"), (2, "gamma REPORT"), (1, "delta")] {
            store.insert(&tx, note(folder, title)).expect("insert");
        }
        tx.commit();

        let in_folder = store.query(None, &Query::new().partition(1));
        assert_eq!(in_folder.len(), 3);

        let reports = store.query(None, &Query::new().search("report"));
        let titles: Vec<_> = reports.iter().map(|n| n.title.clone()).collect();
        assert_eq!(titles, vec!["Alpha report", "gamma REPORT"]);

        let by_title_desc = Query::<Note>::new()
            .partition(1)
            .order_by(|a, b| b.title.cmp(&a.title))
            .offset(1)
            .limit(1);
        let page = store.query(None, &by_title_desc);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].title, "beta");
        assert_eq!(store.count(None, &by_title_desc), 3);

        let filtered = store.query(None, &Query::new().filter(|n: &Note| n.title.len() == 4));
        assert_eq!(filtered.len(), 1);
    }

    #[tokio::test]
    async fn partition_index_follows_updates() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let moved = store.insert(&tx, note(1, "nomad")).expect("insert");
        tx.commit();

        let tx = db.begin(&lifetime).await.expect("begin");
        store.update(&tx, moved.id, None, |n| n.folder = 2).expect("move");
        assert!(store.query(Some(&tx), &Query::new().partition(1)).is_empty());
        assert_eq!(store.query(Some(&tx), &Query::new().partition(2)).len(), 1);
        assert_eq!(store.query(None, &Query::new().partition(1)).len(), 1);
        tx.commit();

        assert!(store.query(None, &Query::new().partition(1)).is_empty());
        assert_eq!(store.query(None, &Query::new().partition(2)).len(), 1);
    }

    #[tokio::test]
    async fn concurrent_updates_leave_exactly_one_head() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let counter = store.insert(&tx, note(1, "0")).expect("insert").id;
        tx.commit();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let db = db.clone();
            let store = store.clone();
            let lifetime = lifetime.clone();
            tasks.push(tokio::spawn(async move {
                let tx = db.begin(&lifetime).await.expect("begin");
                store
                    .update(&tx, counter, None, |n| {
                        let value: u32 = n.title.parse().unwrap_or(0);
                        n.title = (value + 1).to_string();
                    })
                    .expect("update");
                tx.commit();
            }));
        }
        for task in tasks {
            task.await.expect("join");
        }

        let history = store.history(None, counter).expect("history");
        assert_eq!(history.len(), 17);
        assert_eq!(history.iter().filter(|v| v.next_data_id.is_none()).count(), 1);
        assert_eq!(store.get(None, counter).expect("head").title, "16");
    }

    #[tokio::test]
    async fn image_round_trip_restores_heads_and_counters() {
        let (db, store, lifetime) = setup();
        let tx = db.begin(&lifetime).await.expect("begin");
        let kept = store.insert(&tx, note(4, "kept")).expect("insert");
        store.update(&tx, kept.id, None, |n| n.title = "kept v2".into()).expect("update");
        tx.commit();

        let image = store.export();
        let db2 = Database::new();
        let restored: ResourceStore<Note> = ResourceStore::in_memory(&db2);
        restored.import(image);

        assert_eq!(restored.get(None, kept.id).expect("get").title, "kept v2");
        assert_eq!(restored.query(None, &Query::new().partition(4)).len(), 1);

        let tx = db2.begin(&lifetime).await.expect("begin");
        let fresh = restored.insert(&tx, note(4, "new")).expect("insert");
        assert!(fresh.id > kept.id);
    }
}
