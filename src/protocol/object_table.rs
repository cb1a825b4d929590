//! Per-connection table of exposed objects.
//!
//! Entries live in an id-keyed arena; a second index keyed by object address
//! gives identity lookup so exposing the same object twice yields the same id.
//! The table owns a strong handle to every tracked object, so an address can
//! only be recycled after its entry is gone, and ids come from a monotonic
//! counter so a released id is never handed out again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::protocol::object::ObjectRef;
use crate::protocol::value::ObjectId;
use crate::utils::metrics::global_metrics;

struct Entry {
    object: ObjectRef,
    ref_count: u64,
}

struct TableInner {
    entries: HashMap<ObjectId, Entry>,
    by_address: HashMap<usize, ObjectId>,
    next_id: ObjectId,
}

/// Thread-safe object table; every mutation takes the single table lock
pub struct ObjectTable {
    inner: Mutex<TableInner>,
}

fn address(object: &ObjectRef) -> usize {
    Arc::as_ptr(object) as *const () as usize
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                by_address: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the id tracking `object`, creating an entry with `ref_count == 0`
    /// if it is not tracked yet
    pub fn expose(&self, object: &ObjectRef) -> ObjectId {
        let mut inner = self.lock();
        expose_locked(&mut inner, object)
    }

    /// Expose `object` and count one emitted reference in the same critical
    /// section, so a concurrent release cannot remove the entry in between
    pub fn expose_and_incref(&self, object: &ObjectRef) -> ObjectId {
        let mut inner = self.lock();
        let id = expose_locked(&mut inner, object);
        if let Some(entry) = inner.entries.get_mut(&id) {
            entry.ref_count += 1;
        }
        id
    }

    pub fn incref(&self, id: ObjectId) -> Result<u64> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownObject(id))?;
        entry.ref_count += 1;
        Ok(entry.ref_count)
    }

    /// Drop one reference; `true` when the entry was removed
    pub fn decref(&self, id: ObjectId) -> Result<bool> {
        self.decref_by(id, 1).map(|released| released.is_some())
    }

    /// Drop `count` references. Returns the released object when the count
    /// reached zero so the caller can run the release hook outside the lock.
    pub fn decref_by(&self, id: ObjectId, count: u64) -> Result<Option<ObjectRef>> {
        let mut inner = self.lock();
        let entry = inner
            .entries
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownObject(id))?;

        if count > entry.ref_count {
            warn!(
                object_id = id,
                count,
                ref_count = entry.ref_count,
                "Release exceeds reference count; clamping to zero"
            );
        }
        entry.ref_count = entry.ref_count.saturating_sub(count);
        if entry.ref_count > 0 {
            return Ok(None);
        }

        let Some(entry) = inner.entries.remove(&id) else {
            return Ok(None);
        };
        inner.by_address.remove(&address(&entry.object));
        debug!(object_id = id, "Object released");
        Ok(Some(entry.object))
    }

    pub fn resolve(&self, id: ObjectId) -> Result<ObjectRef> {
        self.lock()
            .entries
            .get(&id)
            .map(|entry| entry.object.clone())
            .ok_or(ProtocolError::UnknownObject(id))
    }

    pub fn ref_count(&self, id: ObjectId) -> Option<u64> {
        self.lock().entries.get(&id).map(|entry| entry.ref_count)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry (connection teardown) and hand the objects back
    pub fn drain(&self) -> Vec<ObjectRef> {
        let mut inner = self.lock();
        inner.by_address.clear();
        inner.entries.drain().map(|(_, entry)| entry.object).collect()
    }
}

fn expose_locked(inner: &mut TableInner, object: &ObjectRef) -> ObjectId {
    let addr = address(object);
    if let Some(id) = inner.by_address.get(&addr) {
        return *id;
    }

    let id = inner.next_id;
    inner.next_id += 1;
    inner.entries.insert(
        id,
        Entry {
            object: object.clone(),
            ref_count: 0,
        },
    );
    inner.by_address.insert(addr, id);
    global_metrics().object_exposed();
    debug!(object_id = id, "Object exposed");
    id
}

impl Default for ObjectTable {
    fn default() -> Self {
        Self::new()
    }
}
