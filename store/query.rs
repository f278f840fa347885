use std::cmp::Ordering;
use std::sync::Arc;

use super::{Resource, Stored};

/// Which soft-delete states a query admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletedFilter {
    #[default]
    Exclude,
    Include,
    Only,
}

impl DeletedFilter {
    pub fn admits(self, deleted: bool) -> bool {
        match self {
            DeletedFilter::Exclude => !deleted,
            DeletedFilter::Include => true,
            DeletedFilter::Only => deleted,
        }
    }
}

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;
type Comparator<T> = Arc<dyn Fn(&Stored<T>, &Stored<T>) -> Ordering + Send + Sync>;

/// Head-version query: predicate, partition, free-text search, ordering and
/// pagination. Results default to ascending resource id.
pub struct Query<T> {
    pub(super) predicate: Option<Predicate<T>>,
    pub(super) partition: Option<u64>,
    pub(super) search: Option<String>,
    pub(super) order: Option<Comparator<T>>,
    pub(super) offset: usize,
    pub(super) limit: Option<usize>,
    pub(super) deleted: DeletedFilter,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            partition: self.partition,
            search: self.search.clone(),
            order: self.order.clone(),
            offset: self.offset,
            limit: self.limit,
            deleted: self.deleted,
        }
    }
}

impl<T> Default for Query<T> {
    fn default() -> Self {
        Self {
            predicate: None,
            partition: None,
            search: None,
            order: None,
            offset: 0,
            limit: None,
            deleted: DeletedFilter::Exclude,
        }
    }
}

impl<T: Resource> Query<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(match self.predicate.take() {
            Some(existing) => Arc::new(move |fields: &T| existing(fields) && predicate(fields)),
            None => Arc::new(predicate),
        });
        self
    }

    /// Restrict to heads whose `partition()` equals `key` (index lookup).
    pub fn partition(mut self, key: u64) -> Self {
        self.partition = Some(key);
        self
    }

    /// Case-insensitive substring match over the resource's search fields.
    pub fn search(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.search = (!text.trim().is_empty()).then(|| text.trim().to_lowercase());
        self
    }

    pub fn order_by(
        mut self,
        compare: impl Fn(&Stored<T>, &Stored<T>) -> Ordering + Send + Sync + 'static,
    ) -> Self {
        self.order = Some(Arc::new(compare));
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn deleted(mut self, deleted: DeletedFilter) -> Self {
        self.deleted = deleted;
        self
    }

    pub(super) fn matches(&self, stored: &Stored<T>) -> bool {
        if let Some(predicate) = &self.predicate {
            if !predicate(&stored.fields) {
                return false;
            }
        }
        match &self.search {
            Some(needle) => stored
                .fields
                .search_text()
                .iter()
                .any(|field| field.to_lowercase().contains(needle.as_str())),
            None => true,
        }
    }

    pub(super) fn arrange(&self, mut rows: Vec<Stored<T>>) -> Vec<Stored<T>> {
        match &self.order {
            Some(compare) => rows.sort_by(|a, b| compare(a, b).then(a.id.cmp(&b.id))),
            None => rows.sort_by_key(|row| row.id),
        }
        let rows = rows.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        }
    }
}
