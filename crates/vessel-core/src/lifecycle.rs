use std::collections::HashSet;
use std::sync::Arc;

use crate::adapter::{AdapterScope, Etherealizer};
use crate::config_source::ConfigBlob;
use crate::container::Container;
use crate::error::ContainerError;
use crate::loader::{ConstructRequest, LibraryId};
use crate::registry::ComponentRecord;
use crate::servant::Servant;
use crate::types::{ComponentInfo, Handle, Reference};

/// Holds a handle in the in-flight set until dropped.
struct Reservation<'a> {
    container: &'a Container,
    handle: Handle,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.container.activating.lock().remove(&self.handle);
    }
}

impl Container {
    /// Load, construct, configure, adapt and register one component.
    ///
    /// Either the component ends up registered, or every earlier step has
    /// been undone and no library reference is left behind.
    pub fn activate(
        &self,
        handle: Handle,
        name: &str,
        executable: &str,
        component_type: &str,
    ) -> Result<ComponentInfo, ContainerError> {
        self.ensure_accepting("activate component")?;
        if !handle.is_assigned() {
            return Err(ContainerError::InvalidArgument("component handle must be non-zero".into()));
        }
        if name.is_empty() {
            return Err(ContainerError::InvalidArgument("component name is empty".into()));
        }
        tracing::info!(%handle, name, executable, component_type, "Activating component");

        let _reservation = self.registry.with_lock(|| {
            let mut activating = self.activating.lock();
            if self.registry.contains(handle) || !activating.insert(handle) {
                return Err(ContainerError::DuplicateHandle(handle));
            }
            Ok(Reservation {
                container: self,
                handle,
            })
        })?;
        // Outside the registry lock: loading may compile, and lookups must
        // not wait on it.
        let library = self.loader.load(executable)?;

        let servant = match self.build_servant(handle, name, component_type, library) {
            Ok(servant) => servant,
            Err(e) => {
                self.release_library(library);
                tracing::warn!(%handle, name, error = %e, "Activation rolled back");
                return Err(e);
            }
        };

        let reference = match self
            .adapter
            .activate(AdapterScope::Persistent, name, servant.clone())
        {
            Ok(reference) => reference,
            Err(e) => {
                servant.cleanup();
                self.release_library(library);
                tracing::warn!(%handle, name, error = %e, "Activation rolled back");
                return Err(e);
            }
        };

        let info = ComponentInfo {
            name: name.to_string(),
            component_type: component_type.to_string(),
            handle,
            reference: reference.clone(),
            container: self.link.handle(),
        };
        let record = ComponentRecord {
            library,
            executable: executable.to_string(),
            info: info.clone(),
        };

        let registered = self.registry.with_lock(|| {
            let result = self.registry.register(record);
            if result.is_err() {
                self.loader.unload(library);
            }
            result
        });
        if let Err(e) = registered {
            // The record never existed, so the callback only cleans up.
            if let Err(deactivate) = self.adapter.deactivate(&reference) {
                tracing::warn!(%handle, name, error = %deactivate, "Could not withdraw reference");
            }
            tracing::warn!(%handle, name, error = %e, "Registration failed, activation rolled back");
            return Err(e);
        }

        tracing::info!(%handle, name, object_id = %reference.object_id, "Component activated");
        Ok(info)
    }

    fn build_servant(
        &self,
        handle: Handle,
        name: &str,
        component_type: &str,
        library: LibraryId,
    ) -> Result<Arc<dyn Servant>, ContainerError> {
        let services = self.services.create(handle, name, AdapterScope::Persistent);
        let servant = self.loader.construct(
            library,
            ConstructRequest {
                handle,
                name: name.to_string(),
                component_type: component_type.to_string(),
                services,
            },
        )?;

        let configured = self.component_config(name).and_then(|config| {
            servant
                .initialize(&config)
                .map_err(|reason| ContainerError::Configuration {
                    name: name.to_string(),
                    reason,
                })
        });
        if let Err(e) = configured {
            servant.cleanup();
            return Err(e);
        }
        Ok(servant)
    }

    /// Configuration entry for `name`. Dynamic containers tolerate a
    /// missing entry and pass null.
    fn component_config(&self, name: &str) -> Result<ConfigBlob, ContainerError> {
        match self.config.load_config(name) {
            Ok(config) => Ok(config),
            Err(ContainerError::ConfigNotFound(_)) if self.settings.read().container.dynamic => {
                tracing::debug!(name, "No configuration entry, dynamic container continues");
                Ok(ConfigBlob::Null)
            }
            Err(ContainerError::ConfigNotFound(entry)) => Err(ContainerError::Configuration {
                name: name.to_string(),
                reason: format!("no configuration entry '{entry}'"),
            }),
            Err(ContainerError::Configuration { reason, .. }) => Err(ContainerError::Configuration {
                name: name.to_string(),
                reason,
            }),
            Err(e) => Err(ContainerError::Configuration {
                name: name.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn release_library(&self, library: LibraryId) {
        self.registry.with_lock(|| self.loader.unload(library));
    }

    /// Tear down `handles` in shutdown order. Unknown handles are logged and
    /// skipped; an empty list does nothing.
    pub fn deactivate(&self, handles: &[Handle]) {
        if handles.is_empty() {
            return;
        }
        let requested: HashSet<Handle> = handles.iter().copied().collect();
        let ordered: Vec<Handle> = self.registry.with_lock(|| {
            let explicit = self.registry.shutdown_order();
            self.registry
                .ordered_handles(&explicit)
                .into_iter()
                .filter(|h| requested.contains(h))
                .collect()
        });
        for handle in handles {
            if !ordered.contains(handle) {
                tracing::warn!(%handle, "Deactivation of inactive handle ignored");
            }
        }
        for handle in ordered {
            self.deactivate_one(handle);
        }
    }

    /// Tear down every active component in shutdown order.
    pub fn deactivate_all(&self) {
        let ordered = self.registry.with_lock(|| {
            let explicit = self.registry.shutdown_order();
            self.registry.ordered_handles(&explicit)
        });
        if !ordered.is_empty() {
            tracing::info!(count = ordered.len(), "Deactivating all components");
        }
        for handle in ordered {
            self.deactivate_one(handle);
        }
    }

    fn deactivate_one(&self, handle: Handle) {
        self.registry.with_lock(|| {
            let record = match self.registry.lookup(handle) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(%handle, error = %e, "Skipping deactivation");
                    return;
                }
            };
            let name = record.info.name.as_str();
            tracing::info!(%handle, name, "Deactivating component");

            // May call back into `etherealize` on this thread, which
            // finalizes the record under the same lock.
            if let Err(e) = self.adapter.deactivate(&record.info.reference) {
                tracing::warn!(%handle, name, error = %e, "Etherealize failed, unregistering anyway");
            }
            if self.registry.contains(handle) {
                self.finalize(handle);
            }
        });
    }

    /// Unregister `handle` and drop its library reference. Only the caller
    /// that actually removes the record releases the library.
    fn finalize(&self, handle: Handle) -> bool {
        self.registry.with_lock(|| match self.registry.unregister(handle) {
            Ok(record) => {
                self.loader.unload(record.library);
                tracing::info!(%handle, name = %record.info.name, "Component deactivated");
                true
            }
            Err(ContainerError::NotFound(_)) => false,
            Err(e) => {
                tracing::error!(%handle, error = %e, "Finalizing component failed");
                false
            }
        })
    }

    /// Deactivate and re-activate `handle` with its retained name, type and
    /// executable.
    pub fn restart(&self, handle: Handle) -> Result<Reference, ContainerError> {
        self.ensure_accepting("restart component")?;
        let record = self.registry.lookup(handle)?;
        tracing::info!(%handle, name = %record.info.name, "Restarting component");
        self.deactivate(&[handle]);
        let info = self.activate(
            handle,
            &record.info.name,
            &record.executable,
            &record.info.component_type,
        )?;
        Ok(info.reference)
    }

    /// Info of the components in `handles`, or all of them when empty.
    pub fn component_info(&self, handles: &[Handle]) -> Vec<ComponentInfo> {
        self.registry
            .snapshot(handles)
            .into_iter()
            .map(|record| record.info)
            .collect()
    }

    pub fn set_shutdown_order(&self, handles: Vec<Handle>) {
        tracing::info!(order = ?handles, "Component shutdown order set");
        self.registry.set_shutdown_order(handles);
    }

    /// Call `operation` on the servant behind `handle`.
    pub async fn invoke_component(
        &self,
        handle: Handle,
        operation: &str,
        payload: serde_json::Value,
    ) -> Result<serde_json::Value, ContainerError> {
        let record = self.registry.lookup(handle)?;
        // Held across the call so a concurrent deactivation cannot clean the
        // servant up underneath it.
        let servant = self
            .adapter
            .acquire(&record.info.reference)
            .ok_or(ContainerError::NotFound(handle))?;
        servant
            .invoke(operation, payload)
            .await
            .map_err(|reason| ContainerError::Invocation {
                operation: format!("{}.{operation}", record.info.name),
                reason,
            })
    }
}

impl Etherealizer for Container {
    fn etherealize(&self, object_id: &str, servant: Arc<dyn Servant>) {
        self.registry.with_lock(|| {
            let Some(handle) = self.registry.find_by_object_id(object_id) else {
                return;
            };
            // A live object under this id belongs to a newer activation of
            // the same name; this callback is for a servant it replaced.
            let Ok(record) = self.registry.lookup(handle) else {
                return;
            };
            if self.adapter.resolve(&record.info.reference).is_some() {
                tracing::debug!(%handle, object_id, "Stale etherealize ignored");
                return;
            }
            self.finalize(handle);
        });
        servant.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Weak;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use tokio::sync::Notify;

    use crate::adapter::{EtherealizeMode, LocalObjectAdapter, ObjectAdapter};
    use crate::config_source::MemoryConfigSource;
    use crate::container::ContainerParts;
    use crate::loader::{LibraryLoader, StaticLibraryLoader};
    use crate::mock::{MockManager, TeardownLog, recording_factory};
    use crate::settings::Settings;

    const LAMP: &str = "IDL:demo/Lamp:1.0";

    struct Fixture {
        container: Arc<Container>,
        loader: Arc<StaticLibraryLoader>,
        adapter: Arc<LocalObjectAdapter>,
        config: Arc<MemoryConfigSource>,
        log: TeardownLog,
    }

    fn fixture_with(mode: EtherealizeMode) -> Fixture {
        let log = TeardownLog::new();
        let loader = Arc::new(StaticLibraryLoader::new());
        loader.register("libs/lamp", recording_factory(LAMP, log.clone()));
        let adapter = Arc::new(LocalObjectAdapter::with_mode(mode));
        let config = Arc::new(MemoryConfigSource::with_entries(
            ["A", "B", "C", "D", "LAMP1"].map(|name| (name.to_string(), serde_json::json!({}))),
        ));
        let container = dynamic_container(loader.clone(), adapter.clone(), config.clone());
        Fixture {
            container,
            loader,
            adapter,
            config,
            log,
        }
    }

    fn dynamic_container(
        loader: Arc<dyn LibraryLoader>,
        adapter: Arc<dyn ObjectAdapter>,
        config: Arc<MemoryConfigSource>,
    ) -> Arc<Container> {
        let container = Container::new(
            ContainerParts::new(Arc::new(MockManager::new()))
                .with_loader(loader)
                .with_adapter(adapter)
                .with_config(config),
        );
        let mut settings = Settings::default();
        settings.container.name = "c1".into();
        settings.container.dynamic = true;
        container.init(settings).unwrap();
        container
    }

    fn fixture() -> Fixture {
        fixture_with(EtherealizeMode::Immediate)
    }

    fn library_of(f: &Fixture, handle: u32) -> LibraryId {
        f.container.registry.lookup(Handle::new(handle)).unwrap().library
    }

    #[test]
    fn activate_registers_component() {
        let f = fixture();
        let info = f
            .container
            .activate(Handle::new(7), "LAMP1", "libs/lamp", LAMP)
            .unwrap();
        assert_eq!(info.name, "LAMP1");
        assert_eq!(info.reference.interface, LAMP);

        let record = f.container.registry.lookup(Handle::new(7)).unwrap();
        assert_eq!(record.info, info);
        assert_eq!(f.loader.ref_count(record.library), 1);
    }

    #[test]
    fn activate_rejects_zero_handle_and_empty_name() {
        let f = fixture();
        assert!(matches!(
            f.container.activate(Handle::UNASSIGNED, "LAMP1", "libs/lamp", LAMP),
            Err(ContainerError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.container.activate(Handle::new(1), "", "libs/lamp", LAMP),
            Err(ContainerError::InvalidArgument(_))
        ));
        assert!(f.container.registry.is_empty());
    }

    #[test]
    fn duplicate_handle_keeps_original_record() {
        let f = fixture();
        let first = f
            .container
            .activate(Handle::new(7), "LAMP1", "libs/lamp", LAMP)
            .unwrap();
        let err = f
            .container
            .activate(Handle::new(7), "B", "libs/lamp", LAMP)
            .unwrap_err();
        assert!(matches!(err, ContainerError::DuplicateHandle(h) if h == Handle::new(7)));
        let record = f.container.registry.lookup(Handle::new(7)).unwrap();
        assert_eq!(record.info.reference, first.reference);
        assert_eq!(f.loader.ref_count(record.library), 1);
    }

    #[test]
    fn unknown_executable_registers_nothing() {
        let f = fixture();
        let err = f
            .container
            .activate(Handle::new(2), "A", "libs/missing", LAMP)
            .unwrap_err();
        assert!(matches!(err, ContainerError::LibraryLoad { .. }));
        assert!(f.container.registry.is_empty());
        assert_eq!(f.loader.loaded_count(), 0);
    }

    #[test]
    fn construction_failure_rolls_back_library() {
        let f = fixture();
        let err = f
            .container
            .activate(Handle::new(2), "A", "libs/lamp", "broken")
            .unwrap_err();
        assert!(matches!(err, ContainerError::Construction { .. }));
        assert_eq!(f.loader.loaded_count(), 0);
    }

    #[test]
    fn configuration_failure_rolls_back_library() {
        let f = fixture();
        f.config.insert("A", serde_json::json!({ "reject": true }));
        let err = f
            .container
            .activate(Handle::new(2), "A", "libs/lamp", LAMP)
            .unwrap_err();
        assert!(matches!(err, ContainerError::Configuration { .. }));
        assert_eq!(f.loader.loaded_count(), 0);
        assert_eq!(f.adapter.active_count(), 0);
        // The constructed servant is cleaned up, same as on adapter failure.
        assert_eq!(f.log.entries(), vec!["A".to_string()]);
    }

    #[test]
    fn dynamic_container_activates_without_config_entry() {
        let f = fixture();
        f.config.remove("A");
        f.container
            .activate(Handle::new(2), "A", "libs/lamp", LAMP)
            .unwrap();
        assert!(f.container.registry.contains(Handle::new(2)));
        assert!(f.log.entries().is_empty());
    }

    #[test]
    fn adapter_failure_rolls_back_everything() {
        let f = fixture();
        f.container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        // Same name, same persistent object id.
        let err = f
            .container
            .activate(Handle::new(2), "A", "libs/lamp", LAMP)
            .unwrap_err();
        assert!(matches!(err, ContainerError::AdapterActivation { .. }));
        assert_eq!(f.loader.ref_count(library_of(&f, 1)), 1);
        assert_eq!(f.container.registry.len(), 1);
        assert_eq!(f.log.entries(), vec!["A".to_string()]);
    }

    #[test]
    fn activate_then_deactivate_restores_ref_count() {
        let f = fixture();
        f.container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        let library = library_of(&f, 1);

        f.container
            .activate(Handle::new(2), "B", "libs/lamp", LAMP)
            .unwrap();
        assert_eq!(f.loader.ref_count(library), 2);

        f.container.deactivate(&[Handle::new(2)]);
        assert_eq!(f.loader.ref_count(library), 1);
        assert!(f.container.registry.contains(Handle::new(1)));

        f.container.deactivate(&[Handle::new(1)]);
        assert!(f.container.registry.is_empty());
        assert_eq!(f.loader.loaded_count(), 0);
        assert_eq!(f.log.entries(), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn empty_and_unknown_deactivations_change_nothing() {
        let f = fixture();
        f.container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        f.container.deactivate(&[]);
        f.container.deactivate(&[Handle::new(99)]);
        assert_eq!(f.container.registry.len(), 1);
        assert!(f.log.entries().is_empty());
    }

    #[test]
    fn full_teardown_follows_shutdown_order() {
        let f = fixture();
        for (h, name) in [(1, "A"), (2, "B"), (3, "C"), (4, "D")] {
            f.container
                .activate(Handle::new(h), name, "libs/lamp", LAMP)
                .unwrap();
        }
        f.container
            .set_shutdown_order(vec![Handle::new(3), Handle::new(1)]);
        f.container.deactivate_all();
        assert_eq!(f.log.entries(), vec!["C", "A", "B", "D"]);
        assert!(f.container.registry.is_empty());
        assert_eq!(f.loader.loaded_count(), 0);
    }

    #[test]
    fn deferred_etherealize_releases_library_once() {
        let f = fixture_with(EtherealizeMode::Deferred);
        f.container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        f.container
            .activate(Handle::new(2), "B", "libs/lamp", LAMP)
            .unwrap();
        let library = library_of(&f, 1);

        f.container.deactivate(&[Handle::new(1)]);
        assert!(!f.container.registry.contains(Handle::new(1)));
        assert_eq!(f.loader.ref_count(library), 1);
        assert!(f.log.entries().is_empty());

        assert_eq!(f.adapter.flush_etherealizations(), 1);
        assert_eq!(f.loader.ref_count(library), 1);
        assert_eq!(f.log.entries(), vec!["A".to_string()]);
    }

    #[test]
    fn restart_keeps_handle_and_identity() {
        let f = fixture();
        let before = f
            .container
            .activate(Handle::new(5), "LAMP1", "libs/lamp", LAMP)
            .unwrap();
        let reference = f.container.restart(Handle::new(5)).unwrap();
        assert_eq!(reference.object_id, before.reference.object_id);
        assert_eq!(f.log.entries(), vec!["LAMP1".to_string()]);
        assert_eq!(f.loader.ref_count(library_of(&f, 5)), 1);
    }

    #[test]
    fn restart_with_deferred_etherealize_keeps_new_component() {
        let f = fixture_with(EtherealizeMode::Deferred);
        f.container
            .activate(Handle::new(5), "LAMP1", "libs/lamp", LAMP)
            .unwrap();
        f.container.restart(Handle::new(5)).unwrap();

        // The late callback is for the replaced servant.
        f.adapter.flush_etherealizations();
        assert!(f.container.registry.contains(Handle::new(5)));
        assert_eq!(f.loader.ref_count(library_of(&f, 5)), 1);
    }

    #[test]
    fn restart_of_unknown_handle_is_not_found() {
        let f = fixture();
        assert!(matches!(
            f.container.restart(Handle::new(8)),
            Err(ContainerError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_activations_with_distinct_handles_all_succeed() {
        let f = fixture();
        let threads: Vec<_> = (1..=16u32)
            .map(|h| {
                let container = f.container.clone();
                std::thread::spawn(move || {
                    container.activate(Handle::new(h), &format!("C{h}"), "libs/lamp", LAMP)
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        assert_eq!(f.container.registry.len(), 16);
        assert!(f.container.registry.is_consistent());
        assert_eq!(f.loader.ref_count(library_of(&f, 1)), 16);
    }

    #[test]
    fn concurrent_activations_with_same_handle_admit_one() {
        let f = fixture();
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let container = f.container.clone();
                std::thread::spawn(move || {
                    container.activate(Handle::new(9), &format!("N{i}"), "libs/lamp", LAMP)
                })
            })
            .collect();
        let results: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, ContainerError::DuplicateHandle(_))));
        assert_eq!(f.loader.ref_count(library_of(&f, 9)), 1);
    }

    #[tokio::test]
    async fn invoke_reaches_servant() {
        let f = fixture();
        f.container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        let answer = f
            .container
            .invoke_component(Handle::new(1), "echo", serde_json::json!({ "on": true }))
            .await
            .unwrap();
        assert_eq!(answer["on"], true);
        assert!(matches!(
            f.container
                .invoke_component(Handle::new(1), "explode", serde_json::Value::Null)
                .await,
            Err(ContainerError::Invocation { .. })
        ));
    }

    struct SlowLoader {
        inner: StaticLibraryLoader,
        delay: Duration,
    }

    impl LibraryLoader for SlowLoader {
        fn load(&self, path: &str) -> Result<LibraryId, ContainerError> {
            std::thread::sleep(self.delay);
            self.inner.load(path)
        }

        fn unload(&self, id: LibraryId) {
            self.inner.unload(id)
        }

        fn construct(
            &self,
            id: LibraryId,
            request: ConstructRequest,
        ) -> Result<Arc<dyn Servant>, ContainerError> {
            self.inner.construct(id, request)
        }

        fn ref_count(&self, id: LibraryId) -> usize {
            self.inner.ref_count(id)
        }

        fn backend_name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn slow_library_load_does_not_block_lookups() {
        let inner = StaticLibraryLoader::new();
        inner.register("libs/lamp", recording_factory(LAMP, TeardownLog::new()));
        let loader = Arc::new(SlowLoader {
            inner,
            delay: Duration::from_millis(500),
        });
        let container = dynamic_container(
            loader.clone(),
            Arc::new(LocalObjectAdapter::new()),
            Arc::new(MemoryConfigSource::new()),
        );

        let activation = std::thread::spawn({
            let container = container.clone();
            move || container.activate(Handle::new(1), "A", "libs/lamp", LAMP)
        });
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        assert!(container.registry.lookup(Handle::new(99)).is_err());
        assert!(container.component_info(&[]).is_empty());
        assert!(!container.ping());
        // The handle is still reserved while its library loads.
        assert!(matches!(
            container.activate(Handle::new(1), "B", "libs/lamp", LAMP),
            Err(ContainerError::DuplicateHandle(_))
        ));
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(150), "registry blocked for {elapsed:?}");

        activation.join().unwrap().unwrap();
        assert!(container.registry.contains(Handle::new(1)));
    }

    /// Rejects every deactivation without etherealizing.
    struct StuckAdapter(LocalObjectAdapter);

    impl ObjectAdapter for StuckAdapter {
        fn open(&self, container_name: &str) -> Result<(), ContainerError> {
            self.0.open(container_name)
        }

        fn close(&self) {
            self.0.close()
        }

        fn bind_etherealizer(&self, sink: Weak<dyn Etherealizer>) {
            self.0.bind_etherealizer(sink)
        }

        fn activate(
            &self,
            scope: AdapterScope,
            name: &str,
            servant: Arc<dyn Servant>,
        ) -> Result<Reference, ContainerError> {
            self.0.activate(scope, name, servant)
        }

        fn deactivate(&self, reference: &Reference) -> Result<(), ContainerError> {
            Err(ContainerError::Etherealize {
                object_id: reference.object_id.clone(),
                reason: "adapter refused".into(),
            })
        }

        fn resolve(&self, reference: &Reference) -> Option<Arc<dyn Servant>> {
            self.0.resolve(reference)
        }
    }

    #[test]
    fn etherealize_failure_still_unregisters_and_releases_library() {
        let loader = Arc::new(StaticLibraryLoader::new());
        loader.register("libs/lamp", recording_factory(LAMP, TeardownLog::new()));
        let container = dynamic_container(
            loader.clone(),
            Arc::new(StuckAdapter(LocalObjectAdapter::new())),
            Arc::new(MemoryConfigSource::new()),
        );
        container
            .activate(Handle::new(1), "A", "libs/lamp", LAMP)
            .unwrap();
        container
            .activate(Handle::new(2), "B", "libs/lamp", LAMP)
            .unwrap();
        let library = container.registry.lookup(Handle::new(1)).unwrap().library;
        assert_eq!(loader.ref_count(library), 2);

        container.deactivate(&[Handle::new(1)]);
        assert!(!container.registry.contains(Handle::new(1)));
        assert_eq!(loader.ref_count(library), 1);

        container.deactivate_all();
        assert!(container.registry.is_empty());
        assert_eq!(loader.loaded_count(), 0);
    }

    /// Parks every call until released; reports the cleanups it observed.
    struct HeldCall {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        cleanups: Arc<AtomicUsize>,
    }

    impl Servant for HeldCall {
        fn interface(&self) -> &str {
            LAMP
        }

        fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }

        fn invoke<'a>(
            &'a self,
            _operation: &'a str,
            _payload: serde_json::Value,
        ) -> crate::servant::BoxFuture<'a, Result<serde_json::Value, String>> {
            Box::pin(async move {
                self.entered.notify_one();
                self.release.notified().await;
                Ok(serde_json::json!(self.cleanups.load(Ordering::SeqCst)))
            })
        }
    }

    #[tokio::test]
    async fn deactivation_during_invoke_defers_cleanup() {
        let f = fixture();
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let cleanups = Arc::new(AtomicUsize::new(0));
        f.loader.register("libs/held", {
            let (entered, release, cleanups) = (entered.clone(), release.clone(), cleanups.clone());
            move |_: &ConstructRequest| -> Result<Arc<dyn Servant>, String> {
                Ok(Arc::new(HeldCall {
                    entered: entered.clone(),
                    release: release.clone(),
                    cleanups: cleanups.clone(),
                }))
            }
        });
        f.container
            .activate(Handle::new(1), "A", "libs/held", LAMP)
            .unwrap();
        let reference = f.container.registry.lookup(Handle::new(1)).unwrap().info.reference;

        let call = tokio::spawn({
            let container = f.container.clone();
            async move {
                container
                    .invoke_component(Handle::new(1), "hold", serde_json::Value::Null)
                    .await
            }
        });
        entered.notified().await;
        assert_eq!(f.adapter.in_flight(&reference), 1);

        f.container.deactivate(&[Handle::new(1)]);
        assert!(!f.container.registry.contains(Handle::new(1)));
        assert_eq!(f.loader.loaded_count(), 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);

        release.notify_one();
        let seen = call.await.unwrap().unwrap();
        assert_eq!(seen, 0);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(f.adapter.in_flight(&reference), 0);
    }
}
