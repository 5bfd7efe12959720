use std::collections::HashMap;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::error::ContainerError;
use crate::servant::Servant;
use crate::types::Reference;

/// Scopes of the adapter hierarchy: root, the container itself, and the two
/// children components are activated under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AdapterScope {
    Root,
    Container,
    /// Object ids derived from the component name; survive a restart
    Persistent,
    /// Object ids generated per activation
    Transient,
}

/// Receives end-of-life notifications for servants.
pub trait Etherealizer: Send + Sync {
    fn etherealize(&self, object_id: &str, servant: Arc<dyn Servant>);
}

/// A servant borrowed for one call.
///
/// While any use of an object is alive, its etherealize callback is held
/// back; dropping the last use of a deactivated object delivers it.
pub struct ServantUse {
    servant: Arc<dyn Servant>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ServantUse {
    /// A use the adapter does not account for.
    pub fn untracked(servant: Arc<dyn Servant>) -> Self {
        Self {
            servant,
            release: None,
        }
    }

    /// A use that runs `release` when dropped.
    pub fn tracked(servant: Arc<dyn Servant>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            servant,
            release: Some(Box::new(release)),
        }
    }
}

impl Deref for ServantUse {
    type Target = dyn Servant;

    fn deref(&self) -> &Self::Target {
        self.servant.as_ref()
    }
}

impl Drop for ServantUse {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Maps servants to remotely callable references and back.
pub trait ObjectAdapter: Send + Sync {
    /// Build the scope hierarchy for `container_name`.
    fn open(&self, container_name: &str) -> Result<(), ContainerError>;

    /// Deactivate every remaining object and drop the hierarchy.
    fn close(&self);

    fn bind_etherealizer(&self, sink: Weak<dyn Etherealizer>);

    fn activate(
        &self,
        scope: AdapterScope,
        name: &str,
        servant: Arc<dyn Servant>,
    ) -> Result<Reference, ContainerError>;

    /// Stop serving `reference`. The etherealize callback may fire before
    /// this returns or later, but never while a [`ServantUse`] of the
    /// object is alive.
    fn deactivate(&self, reference: &Reference) -> Result<(), ContainerError>;

    /// The servant currently active under `reference`, if any.
    fn resolve(&self, reference: &Reference) -> Option<Arc<dyn Servant>>;

    /// Borrow the servant under `reference` for one call.
    fn acquire(&self, reference: &Reference) -> Option<ServantUse> {
        self.resolve(reference).map(ServantUse::untracked)
    }
}

/// When [`LocalObjectAdapter`] delivers etherealize callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherealizeMode {
    /// On the thread calling `deactivate` (or dropping the last use),
    /// before it returns
    Immediate,
    /// Queued until [`LocalObjectAdapter::flush_etherealizations`]
    Deferred,
}

struct ScopeTree {
    container_name: String,
    endpoint: String,
    next_transient: u64,
}

struct ActiveObject {
    scope: AdapterScope,
    servant: Arc<dyn Servant>,
    serial: u64,
    uses: usize,
}

/// Deactivated while calls were still running.
struct Retired {
    object_id: String,
    servant: Arc<dyn Servant>,
    uses: usize,
}

#[derive(Default)]
struct AdapterState {
    tree: Option<ScopeTree>,
    objects: HashMap<String, ActiveObject>,
    retired: HashMap<u64, Retired>,
    pending: Vec<(String, Arc<dyn Servant>)>,
    next_serial: u64,
}

struct Shared {
    state: Mutex<AdapterState>,
    etherealizer: RwLock<Option<Weak<dyn Etherealizer>>>,
    mode: EtherealizeMode,
}

type Ready = Option<(String, Arc<dyn Servant>)>;

impl Shared {
    /// Queue the callback in deferred mode, otherwise hand it back to be
    /// delivered once the state lock is released.
    fn settle(&self, state: &mut AdapterState, object_id: String, servant: Arc<dyn Servant>) -> Ready {
        if self.mode == EtherealizeMode::Deferred {
            state.pending.push((object_id, servant));
            None
        } else {
            Some((object_id, servant))
        }
    }

    fn end_use(&self, object_id: &str, serial: u64) {
        let ready = {
            let mut state = self.state.lock();
            if let Some(object) = state
                .objects
                .get_mut(object_id)
                .filter(|object| object.serial == serial)
            {
                object.uses = object.uses.saturating_sub(1);
                return;
            }
            let Some(retired) = state.retired.get_mut(&serial) else {
                return;
            };
            retired.uses = retired.uses.saturating_sub(1);
            if retired.uses > 0 {
                return;
            }
            let Some(retired) = state.retired.remove(&serial) else {
                return;
            };
            tracing::debug!(object_id, "Last in-flight call finished");
            self.settle(&mut state, retired.object_id, retired.servant)
        };
        if let Some((object_id, servant)) = ready {
            self.deliver(&object_id, servant);
        }
    }

    /// Must be called without holding the state lock: the callback may
    /// re-enter `resolve` or `deactivate`.
    fn deliver(&self, object_id: &str, servant: Arc<dyn Servant>) {
        let sink = self.etherealizer.read().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => sink.etherealize(object_id, servant),
            None => {
                tracing::debug!(object_id, "No etherealizer bound, cleaning up servant directly");
                servant.cleanup();
            }
        }
    }
}

/// In-process object adapter.
pub struct LocalObjectAdapter {
    shared: Arc<Shared>,
}

impl LocalObjectAdapter {
    pub fn new() -> Self {
        Self::with_mode(EtherealizeMode::Immediate)
    }

    pub fn with_mode(mode: EtherealizeMode) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(AdapterState::default()),
                etherealizer: RwLock::new(None),
                mode,
            }),
        }
    }

    /// Deliver queued etherealize callbacks. Returns how many were delivered.
    pub fn flush_etherealizations(&self) -> usize {
        let pending = std::mem::take(&mut self.shared.state.lock().pending);
        let count = pending.len();
        for (object_id, servant) in pending {
            self.shared.deliver(&object_id, servant);
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.shared.state.lock().objects.len()
    }

    /// Calls still running against `reference`, whether or not it has been
    /// deactivated since.
    pub fn in_flight(&self, reference: &Reference) -> usize {
        let state = self.shared.state.lock();
        let live = state
            .objects
            .get(&reference.object_id)
            .map_or(0, |object| object.uses);
        let retired: usize = state
            .retired
            .values()
            .filter(|retired| retired.object_id == reference.object_id)
            .map(|retired| retired.uses)
            .sum();
        live + retired
    }

    pub fn scope_of(&self, reference: &Reference) -> Option<AdapterScope> {
        self.shared
            .state
            .lock()
            .objects
            .get(&reference.object_id)
            .map(|o| o.scope)
    }
}

impl Default for LocalObjectAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectAdapter for LocalObjectAdapter {
    fn open(&self, container_name: &str) -> Result<(), ContainerError> {
        let mut state = self.shared.state.lock();
        if let Some(tree) = &state.tree {
            return Err(ContainerError::InvalidState {
                operation: "open object adapter",
                state: format!("open for '{}'", tree.container_name),
            });
        }
        state.tree = Some(ScopeTree {
            container_name: container_name.to_string(),
            endpoint: format!("vessel://{container_name}"),
            next_transient: 1,
        });
        tracing::debug!(container = container_name, "Adapter hierarchy created (root/container/persistent/transient)");
        Ok(())
    }

    fn close(&self) {
        let (idle, pending) = {
            let mut state = self.shared.state.lock();
            if state.tree.take().is_none() {
                return;
            }
            let mut idle = Vec::new();
            for (object_id, object) in std::mem::take(&mut state.objects) {
                if object.uses > 0 {
                    state.retired.insert(
                        object.serial,
                        Retired {
                            object_id,
                            servant: object.servant,
                            uses: object.uses,
                        },
                    );
                } else {
                    idle.push((object_id, object.servant));
                }
            }
            (idle, std::mem::take(&mut state.pending))
        };
        for (object_id, servant) in pending {
            self.shared.deliver(&object_id, servant);
        }
        let remaining = idle.len();
        for (object_id, servant) in idle {
            self.shared.deliver(&object_id, servant);
        }
        tracing::debug!(remaining, "Adapter hierarchy destroyed");
    }

    fn bind_etherealizer(&self, sink: Weak<dyn Etherealizer>) {
        *self.shared.etherealizer.write() = Some(sink);
    }

    fn activate(
        &self,
        scope: AdapterScope,
        name: &str,
        servant: Arc<dyn Servant>,
    ) -> Result<Reference, ContainerError> {
        let mut state = self.shared.state.lock();
        let Some(tree) = state.tree.as_mut() else {
            return Err(ContainerError::AdapterActivation {
                name: name.to_string(),
                reason: "adapter hierarchy is not open".into(),
            });
        };
        let object_id = match scope {
            AdapterScope::Persistent => format!("{}/{name}", tree.container_name),
            AdapterScope::Transient => {
                let n = tree.next_transient;
                tree.next_transient += 1;
                format!("{}/transient/{n}", tree.container_name)
            }
            AdapterScope::Root | AdapterScope::Container => {
                return Err(ContainerError::AdapterActivation {
                    name: name.to_string(),
                    reason: format!("objects cannot be activated in the {scope:?} scope"),
                });
            }
        };
        let endpoint = tree.endpoint.clone();
        if state.objects.contains_key(&object_id) {
            return Err(ContainerError::AdapterActivation {
                name: name.to_string(),
                reason: format!("object id '{object_id}' is already active"),
            });
        }
        let reference = Reference {
            object_id: object_id.clone(),
            interface: servant.interface().to_string(),
            endpoint,
        };
        state.next_serial += 1;
        let serial = state.next_serial;
        state.objects.insert(
            object_id,
            ActiveObject {
                scope,
                servant,
                serial,
                uses: 0,
            },
        );
        Ok(reference)
    }

    fn deactivate(&self, reference: &Reference) -> Result<(), ContainerError> {
        let ready = {
            let mut state = self.shared.state.lock();
            let object = state.objects.remove(&reference.object_id).ok_or_else(|| {
                ContainerError::Etherealize {
                    object_id: reference.object_id.clone(),
                    reason: "object is not active in this adapter".into(),
                }
            })?;
            if object.uses > 0 {
                tracing::debug!(
                    object_id = %reference.object_id,
                    in_flight = object.uses,
                    "Etherealize postponed until in-flight calls finish"
                );
                state.retired.insert(
                    object.serial,
                    Retired {
                        object_id: reference.object_id.clone(),
                        servant: object.servant,
                        uses: object.uses,
                    },
                );
                return Ok(());
            }
            self.shared
                .settle(&mut state, reference.object_id.clone(), object.servant)
        };
        if let Some((object_id, servant)) = ready {
            self.shared.deliver(&object_id, servant);
        }
        Ok(())
    }

    fn resolve(&self, reference: &Reference) -> Option<Arc<dyn Servant>> {
        self.shared
            .state
            .lock()
            .objects
            .get(&reference.object_id)
            .map(|o| o.servant.clone())
    }

    fn acquire(&self, reference: &Reference) -> Option<ServantUse> {
        let (servant, serial) = {
            let mut state = self.shared.state.lock();
            let object = state.objects.get_mut(&reference.object_id)?;
            object.uses += 1;
            (object.servant.clone(), object.serial)
        };
        let shared = self.shared.clone();
        let object_id = reference.object_id.clone();
        Some(ServantUse::tracked(servant, move || {
            shared.end_use(&object_id, serial)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counted {
        cleanups: Arc<AtomicUsize>,
    }

    impl Servant for Counted {
        fn interface(&self) -> &str {
            "IDL:test/Counted:1.0"
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl Etherealizer for Recorder {
        fn etherealize(&self, object_id: &str, servant: Arc<dyn Servant>) {
            self.seen.lock().push(object_id.to_string());
            servant.cleanup();
        }
    }

    fn counted(cleanups: &Arc<AtomicUsize>) -> Arc<dyn Servant> {
        Arc::new(Counted {
            cleanups: cleanups.clone(),
        })
    }

    #[test]
    fn activation_requires_open_hierarchy() {
        let adapter = LocalObjectAdapter::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let err = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap_err();
        assert!(matches!(err, ContainerError::AdapterActivation { .. }));
    }

    #[test]
    fn persistent_ids_derive_from_name_and_must_be_unique() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap();
        assert_eq!(reference.object_id, "c1/LAMP1");
        assert_eq!(reference.endpoint, "vessel://c1");
        assert_eq!(reference.interface, "IDL:test/Counted:1.0");

        let err = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap_err();
        assert!(matches!(err, ContainerError::AdapterActivation { .. }));
    }

    #[test]
    fn transient_ids_are_generated() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let a = adapter
            .activate(AdapterScope::Transient, "X", counted(&cleanups))
            .unwrap();
        let b = adapter
            .activate(AdapterScope::Transient, "X", counted(&cleanups))
            .unwrap();
        assert_ne!(a.object_id, b.object_id);
        assert_eq!(adapter.scope_of(&a), Some(AdapterScope::Transient));
    }

    #[test]
    fn immediate_mode_etherealizes_before_returning() {
        let adapter = LocalObjectAdapter::new();
        let recorder: Arc<Recorder> = Arc::new(Recorder::default());
        let sink: Arc<dyn Etherealizer> = recorder.clone();
        adapter.bind_etherealizer(Arc::downgrade(&sink));
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap();
        adapter.deactivate(&reference).unwrap();

        assert_eq!(*recorder.seen.lock(), vec!["c1/LAMP1".to_string()]);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(adapter.resolve(&reference).is_none());
    }

    #[test]
    fn deferred_mode_waits_for_flush() {
        let adapter = LocalObjectAdapter::with_mode(EtherealizeMode::Deferred);
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));

        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap();
        adapter.deactivate(&reference).unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        assert_eq!(adapter.flush_etherealizations(), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deactivating_unknown_reference_is_etherealize_error() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let reference = Reference {
            object_id: "c1/GHOST".into(),
            interface: "IDL:test/Counted:1.0".into(),
            endpoint: "vessel://c1".into(),
        };
        assert!(matches!(
            adapter.deactivate(&reference),
            Err(ContainerError::Etherealize { .. })
        ));
    }

    #[test]
    fn close_etherealizes_leftovers() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        adapter
            .activate(AdapterScope::Persistent, "A", counted(&cleanups))
            .unwrap();
        adapter
            .activate(AdapterScope::Persistent, "B", counted(&cleanups))
            .unwrap();

        adapter.close();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.active_count(), 0);
        adapter.open("c1").unwrap();
    }

    #[test]
    fn deactivation_waits_for_in_flight_use() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap();

        let first = adapter.acquire(&reference).unwrap();
        let second = adapter.acquire(&reference).unwrap();
        assert_eq!(adapter.in_flight(&reference), 2);

        adapter.deactivate(&reference).unwrap();
        assert!(adapter.resolve(&reference).is_none());
        assert!(adapter.acquire(&reference).is_none());
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        drop(first);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        drop(second);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.in_flight(&reference), 0);
    }

    #[test]
    fn finished_use_of_live_object_does_not_etherealize() {
        let adapter = LocalObjectAdapter::new();
        adapter.open("c1").unwrap();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&cleanups))
            .unwrap();

        drop(adapter.acquire(&reference).unwrap());
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.in_flight(&reference), 0);

        adapter.deactivate(&reference).unwrap();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn old_use_does_not_release_reactivated_object() {
        let adapter = LocalObjectAdapter::with_mode(EtherealizeMode::Deferred);
        adapter.open("c1").unwrap();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        let reference = adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&old))
            .unwrap();
        let held = adapter.acquire(&reference).unwrap();
        adapter.deactivate(&reference).unwrap();

        // Same persistent id, new activation.
        adapter
            .activate(AdapterScope::Persistent, "LAMP1", counted(&new))
            .unwrap();
        drop(held);
        assert_eq!(adapter.flush_etherealizations(), 1);
        assert_eq!(old.load(Ordering::SeqCst), 1);
        assert_eq!(new.load(Ordering::SeqCst), 0);
        assert!(adapter.resolve(&reference).is_some());
    }
}
