//! In-process stand-ins for the Manager and for component code, used by the
//! unit and integration tests of a container.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::config_source::ConfigBlob;
use crate::error::ContainerError;
use crate::loader::{ComponentFactory, ConstructRequest};
use crate::manager::{ComponentLookup, ComponentStatus, Credentials, ManagerClient};
use crate::servant::{BoxFuture, Servant};
use crate::types::{Handle, Reference};

pub const MOCK_CONTAINER_HANDLE: Handle = Handle::new(0x0100_0001);

#[derive(Default)]
struct Recorded {
    offers: HashMap<String, String>,
    component_requests: Vec<(Handle, String, bool)>,
    releases: Vec<(Handle, String)>,
    logins: Vec<Credentials>,
    logouts: Vec<Handle>,
}

/// Scripted Manager.
pub struct MockManager {
    reachable: AtomicBool,
    accept_login: AtomicBool,
    handle: AtomicU32,
    challenges: AtomicU32,
    recorded: Mutex<Recorded>,
}

impl MockManager {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            accept_login: AtomicBool::new(true),
            handle: AtomicU32::new(MOCK_CONTAINER_HANDLE.get()),
            challenges: AtomicU32::new(0),
            recorded: Mutex::new(Recorded::default()),
        }
    }

    pub fn unreachable() -> Self {
        let manager = Self::new();
        manager.set_reachable(false);
        manager
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_accept_login(&self, accept: bool) {
        self.accept_login.store(accept, Ordering::SeqCst);
    }

    /// Handle the next login hands out.
    pub fn set_container_handle(&self, handle: Handle) {
        self.handle.store(handle.get(), Ordering::SeqCst);
    }

    /// Make `curl` resolvable to a reference implementing `interface`.
    pub fn offer_component(&self, curl: &str, interface: &str) {
        self.recorded
            .lock()
            .offers
            .insert(curl.to_string(), interface.to_string());
    }

    pub fn component_requests(&self) -> Vec<(Handle, String, bool)> {
        self.recorded.lock().component_requests.clone()
    }

    pub fn releases(&self) -> Vec<(Handle, String)> {
        self.recorded.lock().releases.clone()
    }

    pub fn logins(&self) -> Vec<Credentials> {
        self.recorded.lock().logins.clone()
    }

    pub fn logouts(&self) -> Vec<Handle> {
        self.recorded.lock().logouts.clone()
    }

    fn check_reachable(&self) -> Result<(), ContainerError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ContainerError::ManagerUnreachable("mock manager is offline".into()))
        }
    }

    fn answer(&self, handle: Handle, curl: &str, activate: bool) -> Result<ComponentLookup, ContainerError> {
        self.check_reachable()?;
        let mut recorded = self.recorded.lock();
        recorded
            .component_requests
            .push((handle, curl.to_string(), activate));
        Ok(match recorded.offers.get(curl) {
            Some(interface) => ComponentLookup {
                reference: Some(Reference {
                    object_id: curl.to_string(),
                    interface: interface.clone(),
                    endpoint: "mock://manager".into(),
                }),
                status: ComponentStatus::Activated,
            },
            None => ComponentLookup {
                reference: None,
                status: ComponentStatus::NonExistent,
            },
        })
    }
}

impl Default for MockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagerClient for MockManager {
    fn resolve(&self) -> BoxFuture<'_, Result<(), ContainerError>> {
        Box::pin(async move { self.check_reachable() })
    }

    fn challenge<'a>(&'a self, container_name: &'a str) -> BoxFuture<'a, Result<String, ContainerError>> {
        Box::pin(async move {
            self.check_reachable()?;
            let n = self.challenges.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{container_name}-challenge-{n}"))
        })
    }

    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Handle, ContainerError>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.recorded.lock().logins.push(credentials.clone());
            if !self.accept_login.load(Ordering::SeqCst) {
                return Err(ContainerError::Authentication(format!(
                    "manager rejected '{}'",
                    credentials.name
                )));
            }
            Ok(Handle::new(self.handle.load(Ordering::SeqCst)))
        })
    }

    fn logout(&self, handle: Handle) -> BoxFuture<'_, Result<(), ContainerError>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.recorded.lock().logouts.push(handle);
            Ok(())
        })
    }

    fn get_component<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>> {
        Box::pin(async move { self.answer(handle, curl, activate) })
    }

    fn get_service<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>> {
        Box::pin(async move { self.answer(handle, curl, activate) })
    }

    fn release_component<'a>(&'a self, handle: Handle, curl: &'a str) -> BoxFuture<'a, Result<(), ContainerError>> {
        Box::pin(async move {
            self.check_reachable()?;
            self.recorded.lock().releases.push((handle, curl.to_string()));
            Ok(())
        })
    }
}

/// Shared, ordered list of component names whose servants were cleaned up.
#[derive(Clone, Default)]
pub struct TeardownLog(Arc<Mutex<Vec<String>>>);

impl TeardownLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    fn push(&self, name: &str) {
        self.0.lock().push(name.to_string());
    }
}

/// Servant that records its cleanup and answers a few operations:
/// `echo` returns the payload, `name` its component name, `config` the
/// configuration it was initialized with, `panic` panics.
pub struct RecordingServant {
    name: String,
    interface: String,
    log: TeardownLog,
    config: Mutex<Option<ConfigBlob>>,
}

impl RecordingServant {
    pub fn new(name: &str, interface: &str, log: TeardownLog) -> Self {
        Self {
            name: name.to_string(),
            interface: interface.to_string(),
            log,
            config: Mutex::new(None),
        }
    }
}

impl Servant for RecordingServant {
    fn interface(&self) -> &str {
        &self.interface
    }

    /// Refuses configuration carrying `"reject": true`.
    fn initialize(&self, config: &ConfigBlob) -> Result<(), String> {
        if config.get("reject").and_then(|v| v.as_bool()) == Some(true) {
            return Err(format!("{} rejects its configuration", self.name));
        }
        *self.config.lock() = Some(config.clone());
        Ok(())
    }

    fn cleanup(&self) {
        self.log.push(&self.name);
    }

    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value, String>> {
        Box::pin(async move {
            match operation {
                "echo" => Ok(payload),
                "name" => Ok(serde_json::Value::String(self.name.clone())),
                "config" => Ok(self.config.lock().clone().unwrap_or_default()),
                "panic" => panic!("{} was asked to panic", self.name),
                other => Err(format!("operation '{other}' is not supported")),
            }
        })
    }
}

/// Factory building [`RecordingServant`]s for any component type. A
/// component type of `"broken"` fails construction.
pub fn recording_factory(interface: &str, log: TeardownLog) -> impl ComponentFactory + 'static {
    let interface = interface.to_string();
    move |request: &ConstructRequest| -> Result<Arc<dyn Servant>, String> {
        if request.component_type == "broken" {
            return Err(format!("cannot build '{}'", request.name));
        }
        Ok(Arc::new(RecordingServant::new(&request.name, &interface, log.clone())))
    }
}
