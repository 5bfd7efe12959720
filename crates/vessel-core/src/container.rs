use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};

use crate::adapter::{Etherealizer, LocalObjectAdapter, ObjectAdapter};
use crate::config_source::{ConfigSource, MemoryConfigSource};
use crate::error::ContainerError;
use crate::loader::{LibraryId, LibraryLoader, StaticLibraryLoader};
use crate::logging::{FilterReload, LogControl, LogLevel};
use crate::manager::{ManagerClient, ManagerLink};
use crate::registry::Registry;
use crate::rpc::{Envelope, RpcClient};
use crate::services::{DefaultServicesFactory, ServicesFactory};
use crate::settings::Settings;
use crate::shutdown::ShutdownCoordinator;
use crate::types::{AvailabilityEvent, ContainerState, Handle, ShutdownRequest};

const RPC_QUEUE_DEPTH: usize = 256;
const AVAILABILITY_CAPACITY: usize = 64;

/// Collaborators a [`Container`] is assembled from.
pub struct ContainerParts {
    pub manager: Arc<dyn ManagerClient>,
    pub loader: Arc<dyn LibraryLoader>,
    pub adapter: Arc<dyn ObjectAdapter>,
    pub config: Arc<dyn ConfigSource>,
    /// Defaults to [`DefaultServicesFactory`]
    pub services: Option<Arc<dyn ServicesFactory>>,
    pub log_reload: Option<Arc<dyn FilterReload>>,
}

impl ContainerParts {
    /// Static loader, local adapter and in-memory configuration around `manager`.
    pub fn new(manager: Arc<dyn ManagerClient>) -> Self {
        Self {
            manager,
            loader: Arc::new(StaticLibraryLoader::new()),
            adapter: Arc::new(LocalObjectAdapter::new()),
            config: Arc::new(MemoryConfigSource::new()),
            services: None,
            log_reload: None,
        }
    }

    pub fn with_loader(mut self, loader: Arc<dyn LibraryLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_adapter(mut self, adapter: Arc<dyn ObjectAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn with_services(mut self, services: Arc<dyn ServicesFactory>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_log_reload(mut self, reload: Arc<dyn FilterReload>) -> Self {
        self.log_reload = Some(reload);
        self
    }
}

/// One component container: the registry of active components, the engines
/// that change it, and the connection to the Manager.
///
/// Build it once with [`Container::new`] and pass the `Arc` to whatever needs
/// it (the RPC transport, the bootstrap loop). A reload builds a new one.
pub struct Container {
    pub(crate) settings: RwLock<Settings>,
    pub(crate) state: Mutex<ContainerState>,
    /// Serializes connect, run and done
    pub(crate) transition: tokio::sync::Mutex<()>,
    pub(crate) registry: Registry,
    /// Handles whose activation is in flight
    pub(crate) activating: Mutex<HashSet<Handle>>,
    pub(crate) loader: Arc<dyn LibraryLoader>,
    pub(crate) adapter: Arc<dyn ObjectAdapter>,
    pub(crate) config: Arc<dyn ConfigSource>,
    pub(crate) services: Arc<dyn ServicesFactory>,
    pub(crate) link: Arc<ManagerLink>,
    pub(crate) availability: broadcast::Sender<AvailabilityEvent>,
    pub(crate) log_control: LogControl,
    pub(crate) autoloaded: Mutex<Vec<LibraryId>>,
    pub(crate) teardown: ShutdownCoordinator,
    pub(crate) stop: watch::Sender<Option<ShutdownRequest>>,
    pub(crate) rpc_tx: mpsc::Sender<Envelope>,
    pub(crate) rpc_rx: Mutex<Option<mpsc::Receiver<Envelope>>>,
    pub(crate) this: Weak<Container>,
}

impl Container {
    pub fn new(parts: ContainerParts) -> Arc<Self> {
        let link = Arc::new(ManagerLink::new(parts.manager));
        let (availability, _) = broadcast::channel(AVAILABILITY_CAPACITY);
        let services = parts.services.unwrap_or_else(|| {
            Arc::new(DefaultServicesFactory::new(
                parts.config.clone(),
                link.clone(),
                availability.clone(),
            ))
        });
        let (stop, _) = watch::channel(None);
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_QUEUE_DEPTH);

        Arc::new_cyclic(|this: &Weak<Container>| {
            let sink: Weak<dyn Etherealizer> = this.clone();
            parts.adapter.bind_etherealizer(sink);
            Container {
                settings: RwLock::new(Settings::default()),
                state: Mutex::new(ContainerState::New),
                transition: tokio::sync::Mutex::new(()),
                registry: Registry::new(),
                activating: Mutex::new(HashSet::new()),
                loader: parts.loader,
                adapter: parts.adapter,
                config: parts.config,
                services,
                link,
                availability,
                log_control: LogControl::new(LogLevel::Info, parts.log_reload),
                autoloaded: Mutex::new(Vec::new()),
                teardown: ShutdownCoordinator::new(),
                stop,
                rpc_tx,
                rpc_rx: Mutex::new(Some(rpc_rx)),
                this: this.clone(),
            }
        })
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    pub fn name(&self) -> String {
        self.settings.read().container.name.clone()
    }

    pub fn settings(&self) -> Settings {
        self.settings.read().clone()
    }

    /// This container's own handle; unassigned until connected.
    pub fn handle(&self) -> Handle {
        self.link.handle()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn link(&self) -> &Arc<ManagerLink> {
        &self.link
    }

    pub fn log_control(&self) -> &LogControl {
        &self.log_control
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.teardown
    }

    /// Submits requests to the serving pool started by `run`.
    pub fn rpc_client(&self) -> RpcClient {
        RpcClient::new(self.rpc_tx.clone())
    }

    pub fn subscribe_availability(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.availability.subscribe()
    }

    /// Shutdown request recorded so far, if any.
    pub fn pending_shutdown(&self) -> Option<ShutdownRequest> {
        *self.stop.borrow()
    }

    pub(crate) fn arc(&self) -> Result<Arc<Container>, ContainerError> {
        self.this
            .upgrade()
            .ok_or_else(|| ContainerError::System("container is being dropped".into()))
    }

    pub(crate) fn ensure_accepting(&self, operation: &'static str) -> Result<(), ContainerError> {
        match self.state() {
            ContainerState::Disconnecting | ContainerState::Terminated => {
                tracing::debug!(operation, "Rejected, container is shutting down");
                Err(ContainerError::ShuttingDown)
            }
            _ => Ok(()),
        }
    }

    /// Record `request` unless one is already pending. Returns whether it was
    /// recorded.
    pub(crate) fn request_stop(&self, request: ShutdownRequest) -> bool {
        self.stop.send_if_modified(|pending| {
            if pending.is_none() {
                *pending = Some(request);
                true
            } else {
                false
            }
        })
    }
}
