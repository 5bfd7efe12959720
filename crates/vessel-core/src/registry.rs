use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use parking_lot::ReentrantMutex;

use crate::error::ContainerError;
use crate::loader::LibraryId;
use crate::types::{ComponentInfo, Handle};

/// Registry entry for one active component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentRecord {
    /// Library the component's code was loaded from
    pub library: LibraryId,
    /// Executable path the library was resolved from (kept for restarts)
    pub executable: String,
    pub info: ComponentInfo,
}

#[derive(Debug, Default)]
struct RegistryState {
    records: HashMap<Handle, ComponentRecord>,
    /// Activation order; holds exactly the keys of `records`
    order: Vec<Handle>,
    shutdown_order: Vec<Handle>,
}

/// Handle-indexed set of active components.
///
/// Every operation runs under one reentrant lock covering both the map and the
/// activation-order list. [`Registry::with_lock`] lets a caller group several
/// operations into a single critical section; adapter callbacks fired on the
/// same thread inside that section may use the registry again without
/// deadlocking.
pub struct Registry {
    state: ReentrantMutex<RefCell<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(RegistryState::default())),
        }
    }

    /// Run `f` while holding the registry lock.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.state.lock();
        f()
    }

    pub fn register(&self, record: ComponentRecord) -> Result<(), ContainerError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let handle = record.info.handle;
        if state.records.contains_key(&handle) {
            return Err(ContainerError::DuplicateHandle(handle));
        }
        if state.order.contains(&handle) {
            return Err(ContainerError::RegistryCorrupted(format!(
                "handle {handle} is ordered but has no record"
            )));
        }
        state.records.insert(handle, record);
        state.order.push(handle);
        Ok(())
    }

    pub fn unregister(&self, handle: Handle) -> Result<ComponentRecord, ContainerError> {
        let guard = self.state.lock();
        let mut state = guard.borrow_mut();
        let position = state.order.iter().position(|h| *h == handle);
        match (state.records.remove(&handle), position) {
            (Some(record), Some(index)) => {
                state.order.remove(index);
                Ok(record)
            }
            (None, None) => Err(ContainerError::NotFound(handle)),
            (Some(record), None) => {
                // Put it back so the caller's view is unchanged.
                state.records.insert(handle, record);
                Err(ContainerError::RegistryCorrupted(format!(
                    "handle {handle} has a record but is missing from the activation order"
                )))
            }
            (None, Some(_)) => Err(ContainerError::RegistryCorrupted(format!(
                "handle {handle} is ordered but has no record"
            ))),
        }
    }

    pub fn lookup(&self, handle: Handle) -> Result<ComponentRecord, ContainerError> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .records
            .get(&handle)
            .cloned()
            .ok_or(ContainerError::NotFound(handle))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.state.lock().borrow().records.contains_key(&handle)
    }

    /// Records in activation order. An empty filter selects everything.
    pub fn snapshot(&self, filter: &[Handle]) -> Vec<ComponentRecord> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let wanted: HashSet<Handle> = filter.iter().copied().collect();
        state
            .order
            .iter()
            .filter(|h| wanted.is_empty() || wanted.contains(h))
            .filter_map(|h| state.records.get(h).cloned())
            .collect()
    }

    /// Teardown order: handles named in `explicit` first (in that order, each
    /// once, skipping inactive ones), then the rest in activation order.
    pub fn ordered_handles(&self, explicit: &[Handle]) -> Vec<Handle> {
        let guard = self.state.lock();
        let state = guard.borrow();
        let mut seen = HashSet::new();
        let mut ordered = Vec::with_capacity(state.order.len());
        for handle in explicit {
            if state.records.contains_key(handle) && seen.insert(*handle) {
                ordered.push(*handle);
            }
        }
        for handle in &state.order {
            if seen.insert(*handle) {
                ordered.push(*handle);
            }
        }
        ordered
    }

    pub fn set_shutdown_order(&self, order: Vec<Handle>) {
        self.state.lock().borrow_mut().shutdown_order = order;
    }

    pub fn shutdown_order(&self) -> Vec<Handle> {
        self.state.lock().borrow().shutdown_order.clone()
    }

    /// Find the component whose reference carries `object_id`.
    pub fn find_by_object_id(&self, object_id: &str) -> Option<Handle> {
        let guard = self.state.lock();
        let state = guard.borrow();
        state
            .records
            .values()
            .find(|r| r.info.reference.object_id == object_id)
            .map(|r| r.info.handle)
    }

    pub fn len(&self) -> usize {
        self.state.lock().borrow().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True while the map keys and the activation order agree.
    pub fn is_consistent(&self) -> bool {
        let guard = self.state.lock();
        let state = guard.borrow();
        let ordered: HashSet<&Handle> = state.order.iter().collect();
        ordered.len() == state.order.len()
            && ordered.len() == state.records.len()
            && state.records.keys().all(|h| ordered.contains(h))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reference;

    fn record(handle: u32, name: &str) -> ComponentRecord {
        ComponentRecord {
            library: LibraryId::new(1),
            executable: "libs/test".into(),
            info: ComponentInfo {
                name: name.into(),
                component_type: "IDL:test/Lamp:1.0".into(),
                handle: Handle::new(handle),
                reference: Reference {
                    object_id: format!("c1/{name}"),
                    interface: "IDL:test/Lamp:1.0".into(),
                    endpoint: "vessel://c1".into(),
                },
                container: Handle::new(1),
            },
        }
    }

    fn handles(raw: &[u32]) -> Vec<Handle> {
        raw.iter().copied().map(Handle::new).collect()
    }

    #[test]
    fn register_rejects_duplicate_and_keeps_original() {
        let registry = Registry::new();
        registry.register(record(5, "A")).unwrap();

        let err = registry.register(record(5, "B")).unwrap_err();
        assert!(matches!(err, ContainerError::DuplicateHandle(h) if h == Handle::new(5)));
        assert_eq!(registry.lookup(Handle::new(5)).unwrap().info.name, "A");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unregister_missing_handle_is_not_found() {
        let registry = Registry::new();
        let err = registry.unregister(Handle::new(9)).unwrap_err();
        assert!(matches!(err, ContainerError::NotFound(_)));
    }

    #[test]
    fn unregister_removes_from_map_and_order() {
        let registry = Registry::new();
        for (h, n) in [(1, "A"), (2, "B"), (3, "C")] {
            registry.register(record(h, n)).unwrap();
        }
        registry.unregister(Handle::new(2)).unwrap();

        assert!(!registry.contains(Handle::new(2)));
        assert_eq!(registry.ordered_handles(&[]), handles(&[1, 3]));
        assert!(registry.is_consistent());
    }

    #[test]
    fn snapshot_filters_and_keeps_activation_order() {
        let registry = Registry::new();
        for (h, n) in [(4, "D"), (2, "B"), (9, "Z")] {
            registry.register(record(h, n)).unwrap();
        }

        let all: Vec<_> = registry.snapshot(&[]).into_iter().map(|r| r.info.name).collect();
        assert_eq!(all, vec!["D", "B", "Z"]);

        let some: Vec<_> = registry
            .snapshot(&handles(&[9, 4, 77]))
            .into_iter()
            .map(|r| r.info.name)
            .collect();
        assert_eq!(some, vec!["D", "Z"]);
    }

    #[test]
    fn explicit_order_goes_first_rest_follows_activation_order() {
        let registry = Registry::new();
        for (h, n) in [(1, "A"), (2, "B"), (3, "C"), (4, "D")] {
            registry.register(record(h, n)).unwrap();
        }

        assert_eq!(
            registry.ordered_handles(&handles(&[3, 1])),
            handles(&[3, 1, 2, 4])
        );
        // Unknown and repeated handles are ignored.
        assert_eq!(
            registry.ordered_handles(&handles(&[8, 4, 4, 2])),
            handles(&[4, 2, 1, 3])
        );
    }

    #[test]
    fn lock_is_reentrant_on_the_same_thread() {
        let registry = Registry::new();
        registry.register(record(1, "A")).unwrap();

        let removed = registry.with_lock(|| {
            registry.with_lock(|| registry.unregister(Handle::new(1)).is_ok())
        });
        assert!(removed);
        assert!(registry.is_empty());
    }

    #[test]
    fn find_by_object_id_matches_reference() {
        let registry = Registry::new();
        registry.register(record(6, "CAM")).unwrap();
        assert_eq!(registry.find_by_object_id("c1/CAM"), Some(Handle::new(6)));
        assert_eq!(registry.find_by_object_id("c1/NOPE"), None);
    }

    #[test]
    fn concurrent_registers_with_distinct_handles_all_land() {
        let registry = std::sync::Arc::new(Registry::new());
        let threads: Vec<_> = (1..=32)
            .map(|h| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(record(h, &format!("C{h}"))))
            })
            .collect();
        for t in threads {
            t.join().unwrap().unwrap();
        }
        assert_eq!(registry.len(), 32);
        assert!(registry.is_consistent());
    }
}
