//! In-memory request store and its read-only cache view.

use fetchflow_core::{Operation, OperationKind, RequestId, RequestRecord, State, Value};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// State and data of a request right after an operation was committed.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// State after the operation
    pub state: State,
    /// Data after the operation (`None` once disposed)
    pub data: Option<Value>,
}

impl Snapshot {
    const fn disposed() -> Self {
        Self {
            state: State::Disposed,
            data: None,
        }
    }
}

/// Map of request id to [`RequestRecord`].
///
/// Cloning is cheap and yields a handle onto the same records. Only the
/// engine writes; everyone else reads through [`Store::get`] or a [`Cache`].
#[derive(Clone, Debug, Default)]
pub struct Store {
    records: Arc<RwLock<HashMap<RequestId, RequestRecord>>>,
}

impl Store {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<RequestId, RequestRecord>> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<RequestId, RequestRecord>> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the record for `id`.
    #[must_use]
    pub fn get(&self, id: &RequestId) -> Option<RequestRecord> {
        self.read().get(id).cloned()
    }

    /// Current state of `id`, `None` when there is no record.
    #[must_use]
    pub fn state(&self, id: &RequestId) -> Option<State> {
        self.read().get(id).map(|record| record.state)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Read-only view over stored data.
    #[must_use]
    pub fn cache(&self) -> Cache {
        Cache { store: self.clone() }
    }

    /// Apply `op` to its request's record.
    ///
    /// Returns `None` when there was no record and the operation does not
    /// create one; the operation must then not be broadcast either.
    pub(crate) fn commit(&self, op: &Operation) -> Option<Snapshot> {
        let mut records = self.write();
        let current = records.remove(op.id());

        match RequestRecord::apply(current, op) {
            Some(record) => {
                let snapshot = Snapshot {
                    state: record.state,
                    data: record.data.clone(),
                };
                records.insert(op.id().clone(), record);
                Some(snapshot)
            },
            // From an existing record only `dispose` yields nothing.
            None => (op.kind() == OperationKind::Dispose).then(Snapshot::disposed),
        }
    }
}

/// Read-only map of request id to the latest delivered data.
///
/// Handed to fetch handlers and exchanges. Requests without data (for
/// example a `pending` fetch) are not part of the map.
#[derive(Clone, Debug)]
pub struct Cache {
    store: Store,
}

impl Cache {
    /// Whether data is stored for `id`.
    #[must_use]
    pub fn has(&self, id: &RequestId) -> bool {
        self.store
            .read()
            .get(id)
            .is_some_and(|record| record.data.is_some())
    }

    /// Copy of the data stored for `id`.
    #[must_use]
    pub fn get(&self, id: &RequestId) -> Option<Value> {
        self.store.read().get(id).and_then(|record| record.data.clone())
    }

    /// Ids that have data.
    #[must_use]
    pub fn keys(&self) -> Vec<RequestId> {
        self.entries().into_iter().map(|(id, _)| id).collect()
    }

    /// Stored data values.
    #[must_use]
    pub fn values(&self) -> Vec<Value> {
        self.entries().into_iter().map(|(_, data)| data).collect()
    }

    /// `(id, data)` pairs.
    #[must_use]
    pub fn entries(&self) -> Vec<(RequestId, Value)> {
        self.store
            .read()
            .iter()
            .filter_map(|(id, record)| record.data.clone().map(|data| (id.clone(), data)))
            .collect()
    }
}
