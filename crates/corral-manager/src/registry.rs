use chrono::Utc;
use corral_core::{CorralError, Result, Sandbox, SandboxFilter};
use dashmap::DashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// One registered sandbox: its record and the lock serializing lifecycle
/// operations on it.
#[derive(Debug)]
pub(crate) struct SandboxSlot {
    record: RwLock<Sandbox>,
    pub(crate) op_lock: Mutex<()>,
}

impl SandboxSlot {
    fn new(sandbox: Sandbox) -> Self {
        Self {
            record: RwLock::new(sandbox),
            op_lock: Mutex::new(()),
        }
    }

    pub(crate) fn snapshot(&self) -> Sandbox {
        match self.record.read() {
            Ok(record) => record.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Apply `change` to the record and bump `updated_at`. Returns the new snapshot.
    pub(crate) fn update(&self, change: impl FnOnce(&mut Sandbox)) -> Sandbox {
        let mut record = match self.record.write() {
            Ok(record) => record,
            Err(poisoned) => poisoned.into_inner(),
        };
        change(&mut record);
        record.updated_at = Utc::now();
        record.clone()
    }
}

/// In-memory store of every known sandbox, keyed by identity.
///
/// Reads hand out cloned snapshots, so callers never hold a reference into
/// the map while other tasks register or deregister.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    slots: DashMap<String, Arc<SandboxSlot>>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sandbox: Sandbox) -> Result<()> {
        use dashmap::mapref::entry::Entry;

        match self.slots.entry(sandbox.id().to_string()) {
            Entry::Occupied(entry) => Err(CorralError::DuplicateIdentity(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(SandboxSlot::new(sandbox)));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, id: &str) -> Option<Sandbox> {
        self.slots.get(id).map(|slot| slot.snapshot())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.slots.contains_key(id)
    }

    /// Matching sandboxes, oldest first.
    pub fn list(&self, filter: &SandboxFilter) -> Vec<Sandbox> {
        let slots: Vec<Arc<SandboxSlot>> = self
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut sandboxes: Vec<Sandbox> = slots
            .iter()
            .map(|slot| slot.snapshot())
            .filter(|sandbox| filter.matches(sandbox))
            .collect();
        sandboxes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        sandboxes
    }

    pub fn deregister(&self, id: &str) -> Result<Sandbox> {
        self.slots
            .remove(id)
            .map(|(_, slot)| slot.snapshot())
            .ok_or_else(|| CorralError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn slot(&self, id: &str) -> Result<Arc<SandboxSlot>> {
        self.slots
            .get(id)
            .map(|slot| slot.value().clone())
            .ok_or_else(|| CorralError::NotFound(id.to_string()))
    }

    /// Whether `slot` is still the one registered under `id`.
    pub(crate) fn holds(&self, id: &str, slot: &Arc<SandboxSlot>) -> bool {
        self.slots
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }
}
