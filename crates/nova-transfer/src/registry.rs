use std::fmt;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nova_transfer_proto::CorrelationId;

use crate::DuplicateCorrelationId;

/// Pending transfers of one connection, keyed by correlation id.
///
/// All operations are linearizable and safe to call from the dispatch thread and pull workers
/// concurrently. Unrelated ids never contend on a connection-wide lock.
pub struct TransferRegistry<T> {
    pending: DashMap<CorrelationId, Arc<T>>,
}

impl<T> TransferRegistry<T> {
    pub fn new() -> Self {
        Self {
            pending: DashMap::new(),
        }
    }

    /// Insert `state` under `id`, failing if `id` is still pending.
    ///
    /// The presence check and the insert happen under the same shard lock, so concurrent
    /// registrants of one id see exactly one success.
    pub fn register(
        &self,
        id: CorrelationId,
        state: T,
    ) -> Result<Arc<T>, DuplicateCorrelationId> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(DuplicateCorrelationId { correlation_id: id }),
            Entry::Vacant(slot) => {
                let state = Arc::new(state);
                slot.insert(Arc::clone(&state));
                Ok(state)
            }
        }
    }

    /// Remove whatever is registered under `id`. Absence is not an error.
    pub fn remove(&self, id: CorrelationId) -> Option<Arc<T>> {
        self.pending.remove(&id).map(|(_, state)| state)
    }

    /// Remove `id` only if it still maps to `state`.
    ///
    /// Completion paths use this so a transfer that was already cancelled cannot remove a newer
    /// transfer that reused its id.
    pub fn remove_if_current(&self, id: CorrelationId, state: &Arc<T>) -> bool {
        self.pending
            .remove_if(&id, |_, current| Arc::ptr_eq(current, state))
            .is_some()
    }

    /// Remove `id` only if `predicate` accepts the registered state.
    pub fn remove_if(
        &self,
        id: CorrelationId,
        predicate: impl FnOnce(&T) -> bool,
    ) -> Option<Arc<T>> {
        self.pending
            .remove_if(&id, |_, current| predicate(current))
            .map(|(_, state)| state)
    }

    pub fn lookup(&self, id: CorrelationId) -> Option<Arc<T>> {
        self.pending.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Snapshot of the currently pending ids, in no particular order.
    pub fn ids(&self) -> Vec<CorrelationId> {
        self.pending.iter().map(|entry| *entry.key()).collect()
    }

    /// Remove every pending transfer.
    ///
    /// Re-snapshots until the map is observed empty so registrations racing with the drain are
    /// picked up too. Each state is returned exactly once, to exactly one drainer.
    pub fn drain(&self) -> Vec<(CorrelationId, Arc<T>)> {
        let mut drained = Vec::new();
        loop {
            let ids = self.ids();
            if ids.is_empty() {
                break;
            }
            for id in ids {
                if let Some(state) = self.remove(id) {
                    drained.push((id, state));
                }
            }
        }
        drained
    }
}

impl<T> Default for TransferRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TransferRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids = self.ids();
        ids.sort_unstable();
        f.debug_struct("TransferRegistry")
            .field("pending", &ids)
            .finish()
    }
}
