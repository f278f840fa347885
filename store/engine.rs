//! In-process versioned table engine.
//!
//! Each table keeps three maps:
//!
//! ```text
//! records   id            -> {id, deleted}
//! versions  (id, data_id) -> {data_id, id, create_time, previous, next, fields}
//! heads     id            -> data_id of the version whose `next` is None
//! ```
//!
//! Version chains are linked through integer ids, never references. A
//! secondary index maps each head's partition key to resource ids.

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::query::DeletedFilter;
use super::transaction::{Database, StagedWrites, Transaction};
use super::{DataId, Record, Resource, ResourceId, StoreError, Stored, Version};

/// The operations a persistence engine provides to the resource store.
pub trait Engine<T: Resource>: Send + Sync {
    fn insert(&self, tx: &Transaction, fields: T) -> Result<Stored<T>, StoreError>;

    /// Current head, including soft-deleted resources.
    fn head(&self, tx: Option<&Transaction>, id: ResourceId) -> Option<Stored<T>>;

    fn version(&self, tx: Option<&Transaction>, id: ResourceId, data_id: DataId) -> Option<Stored<T>>;

    fn query_heads(
        &self,
        tx: Option<&Transaction>,
        partition: Option<u64>,
        deleted: DeletedFilter,
        filter: &dyn Fn(&Stored<T>) -> bool,
    ) -> Vec<Stored<T>>;

    /// Append a version after `base` (which must be the current head).
    fn update_version(
        &self,
        tx: &Transaction,
        id: ResourceId,
        fields: T,
        base: DataId,
    ) -> Result<Stored<T>, StoreError>;

    fn set_deleted(&self, tx: &Transaction, id: ResourceId, deleted: bool) -> Result<(), StoreError>;

    fn purge(&self, tx: &Transaction, id: ResourceId) -> Result<(), StoreError>;

    fn export(&self) -> TableImage<T>;

    fn import(&self, image: TableImage<T>);
}

/// Serializable contents of one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableImage<T> {
    pub next_id: u64,
    pub next_data_id: u64,
    pub records: Vec<Record>,
    pub versions: Vec<Version<T>>,
}

impl<T> Default for TableImage<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            next_data_id: 1,
            records: Vec::new(),
            versions: Vec::new(),
        }
    }
}

struct TableState<T> {
    records: BTreeMap<ResourceId, Record>,
    versions: BTreeMap<(ResourceId, DataId), Version<T>>,
    heads: BTreeMap<ResourceId, DataId>,
    partitions: BTreeMap<u64, BTreeSet<ResourceId>>,
}

impl<T> Default for TableState<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            versions: BTreeMap::new(),
            heads: BTreeMap::new(),
            partitions: BTreeMap::new(),
        }
    }
}

struct TableChanges<T> {
    records: BTreeMap<ResourceId, Option<Record>>,
    versions: BTreeMap<(ResourceId, DataId), Option<Version<T>>>,
    heads: BTreeMap<ResourceId, Option<DataId>>,
}

impl<T> Default for TableChanges<T> {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            versions: BTreeMap::new(),
            heads: BTreeMap::new(),
        }
    }
}

struct Staged<T> {
    state: Arc<RwLock<TableState<T>>>,
    changes: TableChanges<T>,
}

impl<T: Resource> StagedWrites for Staged<T> {
    fn apply(self: Box<Self>) {
        let Staged { state, changes } = *self;
        let mut state = state.write();

        // Unindex old heads before their versions can disappear.
        for id in changes.heads.keys() {
            let old_partition = state
                .heads
                .get(id)
                .and_then(|data_id| state.versions.get(&(*id, *data_id)))
                .and_then(|version| version.fields.partition());
            if let Some(partition) = old_partition {
                if let Some(members) = state.partitions.get_mut(&partition) {
                    members.remove(id);
                    if members.is_empty() {
                        state.partitions.remove(&partition);
                    }
                }
            }
        }

        for (id, record) in changes.records {
            match record {
                Some(record) => state.records.insert(id, record),
                None => state.records.remove(&id),
            };
        }
        for (key, version) in changes.versions {
            match version {
                Some(version) => state.versions.insert(key, version),
                None => state.versions.remove(&key),
            };
        }
        for (id, head) in changes.heads {
            match head {
                Some(data_id) => {
                    state.heads.insert(id, data_id);
                    let partition = state
                        .versions
                        .get(&(id, data_id))
                        .and_then(|version| version.fields.partition());
                    if let Some(partition) = partition {
                        state.partitions.entry(partition).or_default().insert(id);
                    }
                }
                None => {
                    state.heads.remove(&id);
                }
            }
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Read view: committed state overlaid with a transaction's staged writes.
struct View<'a, T> {
    base: &'a TableState<T>,
    changes: Option<&'a TableChanges<T>>,
}

impl<'a, T: Resource> View<'a, T> {
    fn record(&self, id: ResourceId) -> Option<&'a Record> {
        if let Some(staged) = self.changes.and_then(|c| c.records.get(&id)) {
            return staged.as_ref();
        }
        self.base.records.get(&id)
    }

    fn version(&self, id: ResourceId, data_id: DataId) -> Option<&'a Version<T>> {
        if let Some(staged) = self.changes.and_then(|c| c.versions.get(&(id, data_id))) {
            return staged.as_ref();
        }
        self.base.versions.get(&(id, data_id))
    }

    fn head_id(&self, id: ResourceId) -> Option<DataId> {
        if let Some(staged) = self.changes.and_then(|c| c.heads.get(&id)) {
            return *staged;
        }
        self.base.heads.get(&id).copied()
    }

    fn stored(&self, id: ResourceId, data_id: DataId) -> Option<Stored<T>> {
        let record = self.record(id)?;
        let version = self.version(id, data_id)?;
        Some(Stored::from_parts(record, version))
    }

    fn head(&self, id: ResourceId) -> Option<Stored<T>> {
        let data_id = self.head_id(id)?;
        self.stored(id, data_id)
    }

    fn version_ids(&self, id: ResourceId) -> BTreeSet<DataId> {
        let mut ids: BTreeSet<DataId> = self
            .base
            .versions
            .range((id, DataId::MIN)..=(id, DataId::MAX))
            .map(|((_, data_id), _)| *data_id)
            .collect();
        if let Some(changes) = self.changes {
            for ((_, data_id), version) in changes.versions.range((id, DataId::MIN)..=(id, DataId::MAX)) {
                match version {
                    Some(_) => ids.insert(*data_id),
                    None => ids.remove(data_id),
                };
            }
        }
        ids
    }

    fn candidates(&self, partition: Option<u64>) -> BTreeSet<ResourceId> {
        let mut ids: BTreeSet<ResourceId> = match partition {
            Some(p) => self.base.partitions.get(&p).cloned().unwrap_or_default(),
            None => self.base.heads.keys().copied().collect(),
        };
        if let Some(changes) = self.changes {
            ids.extend(changes.heads.keys().copied());
        }
        ids
    }
}

/// A table held in memory.
pub struct MemoryTable<T> {
    state: Arc<RwLock<TableState<T>>>,
    latch: Arc<RwLock<()>>,
    next_id: AtomicU64,
    next_data_id: AtomicU64,
}

impl<T: Resource> MemoryTable<T> {
    pub fn new(db: &Database) -> Self {
        Self {
            state: Arc::new(RwLock::new(TableState::default())),
            latch: db.latch(),
            next_id: AtomicU64::new(1),
            next_data_id: AtomicU64::new(1),
        }
    }

    fn read<R>(&self, tx: Option<&Transaction>, f: impl FnOnce(&View<'_, T>) -> R) -> R {
        match tx {
            Some(tx) => tx.read_staged::<Staged<T>, R>(T::TABLE, |staged| {
                let base = self.state.read();
                let view = View {
                    base: &base,
                    changes: staged.map(|s| &s.changes),
                };
                f(&view)
            }),
            None => {
                let _committed = self.latch.read();
                let base = self.state.read();
                let view = View {
                    base: &base,
                    changes: None,
                };
                f(&view)
            }
        }
    }

    fn write<R>(
        &self,
        tx: &Transaction,
        f: impl FnOnce(&View<'_, T>, &mut PendingWrites<T>) -> R,
    ) -> R {
        tx.write_staged(
            T::TABLE,
            || Staged {
                state: self.state.clone(),
                changes: TableChanges::default(),
            },
            |staged: &mut Staged<T>| {
                let base = self.state.read();
                // Writes are collected separately, then merged, so the view can
                // keep borrowing the staged changes while the closure runs.
                let mut pending = PendingWrites::default();
                let out = {
                    let view = View {
                        base: &base,
                        changes: Some(&staged.changes),
                    };
                    f(&view, &mut pending)
                };
                pending.merge_into(&mut staged.changes);
                out
            },
        )
    }

    fn allocate_ids(&self) -> (ResourceId, DataId) {
        (
            self.next_id.fetch_add(1, Ordering::Relaxed),
            self.next_data_id.fetch_add(1, Ordering::Relaxed),
        )
    }
}

struct PendingWrites<T> {
    changes: TableChanges<T>,
}

impl<T> Default for PendingWrites<T> {
    fn default() -> Self {
        Self {
            changes: TableChanges::default(),
        }
    }
}

impl<T> PendingWrites<T> {
    fn record(&mut self, id: ResourceId, record: Option<Record>) {
        self.changes.records.insert(id, record);
    }

    fn version(&mut self, id: ResourceId, data_id: DataId, version: Option<Version<T>>) {
        self.changes.versions.insert((id, data_id), version);
    }

    fn head(&mut self, id: ResourceId, data_id: Option<DataId>) {
        self.changes.heads.insert(id, data_id);
    }

    fn merge_into(self, target: &mut TableChanges<T>) {
        target.records.extend(self.changes.records);
        target.versions.extend(self.changes.versions);
        target.heads.extend(self.changes.heads);
    }
}

impl<T: Resource> Engine<T> for MemoryTable<T> {
    fn insert(&self, tx: &Transaction, fields: T) -> Result<Stored<T>, StoreError> {
        let (id, data_id) = self.allocate_ids();
        let record = Record { id, deleted: false };
        let version = Version {
            data_id,
            id,
            create_time: Utc::now(),
            previous_data_id: None,
            next_data_id: None,
            fields,
        };
        let stored = Stored::from_parts(&record, &version);
        self.write(tx, |_, pending| {
            pending.record(id, Some(record));
            pending.version(id, data_id, Some(version));
            pending.head(id, Some(data_id));
        });
        Ok(stored)
    }

    fn head(&self, tx: Option<&Transaction>, id: ResourceId) -> Option<Stored<T>> {
        self.read(tx, |view| view.head(id))
    }

    fn version(&self, tx: Option<&Transaction>, id: ResourceId, data_id: DataId) -> Option<Stored<T>> {
        self.read(tx, |view| view.stored(id, data_id))
    }

    fn query_heads(
        &self,
        tx: Option<&Transaction>,
        partition: Option<u64>,
        deleted: DeletedFilter,
        filter: &dyn Fn(&Stored<T>) -> bool,
    ) -> Vec<Stored<T>> {
        self.read(tx, |view| {
            view.candidates(partition)
                .into_iter()
                .filter_map(|id| view.head(id))
                .filter(|stored| partition.is_none() || stored.fields.partition() == partition)
                .filter(|stored| deleted.admits(stored.deleted))
                .filter(|stored| filter(stored))
                .collect()
        })
    }

    fn update_version(
        &self,
        tx: &Transaction,
        id: ResourceId,
        fields: T,
        base: DataId,
    ) -> Result<Stored<T>, StoreError> {
        let (_, data_id) = self.allocate_ids();
        self.write(tx, |view, pending| {
            let record = view
                .record(id)
                .ok_or(StoreError::NotFound { table: T::TABLE, id })?;
            if record.deleted {
                return Err(StoreError::Gone { table: T::TABLE, id });
            }
            let head_id = view
                .head_id(id)
                .ok_or_else(|| StoreError::Engine(format!("{} {} has no head version", T::TABLE, id)))?;
            if head_id != base {
                return Err(StoreError::Conflict {
                    table: T::TABLE,
                    id,
                    expected: base,
                    head: head_id,
                });
            }
            let mut previous = view
                .version(id, head_id)
                .cloned()
                .ok_or_else(|| StoreError::Engine(format!("{} {} head version missing", T::TABLE, id)))?;
            previous.next_data_id = Some(data_id);

            let version = Version {
                data_id,
                id,
                create_time: Utc::now(),
                previous_data_id: Some(head_id),
                next_data_id: None,
                fields,
            };
            let stored = Stored::from_parts(record, &version);
            pending.version(id, head_id, Some(previous));
            pending.version(id, data_id, Some(version));
            pending.head(id, Some(data_id));
            Ok(stored)
        })
    }

    fn set_deleted(&self, tx: &Transaction, id: ResourceId, deleted: bool) -> Result<(), StoreError> {
        self.write(tx, |view, pending| {
            if view.record(id).is_none() {
                return Err(StoreError::NotFound { table: T::TABLE, id });
            }
            pending.record(id, Some(Record { id, deleted }));
            Ok(())
        })
    }

    fn purge(&self, tx: &Transaction, id: ResourceId) -> Result<(), StoreError> {
        self.write(tx, |view, pending| {
            if view.record(id).is_none() {
                return Err(StoreError::NotFound { table: T::TABLE, id });
            }
            for data_id in view.version_ids(id) {
                pending.version(id, data_id, None);
            }
            pending.record(id, None);
            pending.head(id, None);
            Ok(())
        })
    }

    fn export(&self) -> TableImage<T> {
        let _committed = self.latch.read();
        let state = self.state.read();
        TableImage {
            next_id: self.next_id.load(Ordering::Relaxed),
            next_data_id: self.next_data_id.load(Ordering::Relaxed),
            records: state.records.values().cloned().collect(),
            versions: state.versions.values().cloned().collect(),
        }
    }

    fn import(&self, image: TableImage<T>) {
        let _committed = self.latch.write();
        let mut state = TableState::default();
        for record in image.records {
            state.records.insert(record.id, record);
        }
        for version in image.versions {
            if version.next_data_id.is_none() {
                state.heads.insert(version.id, version.data_id);
                if let Some(partition) = version.fields.partition() {
                    state.partitions.entry(partition).or_default().insert(version.id);
                }
            }
            state.versions.insert((version.id, version.data_id), version);
        }
        *self.state.write() = state;
        self.next_id.store(image.next_id, Ordering::Relaxed);
        self.next_data_id.store(image.next_data_id, Ordering::Relaxed);
    }
}
