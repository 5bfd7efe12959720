use crate::config_source::ConfigBlob;
use crate::container::Container;
use crate::error::ContainerError;
use crate::manager::Credentials;
use crate::rpc::RpcPool;
use crate::servant::Capability;
use crate::settings::Settings;
use crate::types::{
    AvailabilityEvent, ComponentInfo, ContainerState, Handle, MessageType, Reference,
    ShutdownRequest,
};

/// Client-type prefix a container answers the Manager's challenge with.
const CONTAINER_CLIENT_TYPE: char = 'A';

impl Container {
    /// `New -> Initialized`. Validates `settings`, opens the adapter
    /// hierarchy, reads the container's own configuration entry and loads
    /// its autoload libraries. Does not contact the Manager.
    pub fn init(&self, settings: Settings) -> Result<(), ContainerError> {
        let mut state = self.state.lock();
        if *state != ContainerState::New {
            return Err(ContainerError::InvalidState {
                operation: "init",
                state: state.to_string(),
            });
        }
        settings.validate()?;
        self.adapter.open(&settings.container.name)?;
        self.link
            .set_timeouts(settings.invocation_timeout(), settings.handle_wait_timeout());
        if let Err(e) = self.log_control.reset(settings.logging.default_level) {
            tracing::warn!(error = %e, "Could not apply default log level");
        }
        *self.settings.write() = settings;

        let container_config = self.container_config();
        if let Err(e) = self.log_control.refresh(container_config.as_ref()) {
            tracing::warn!(error = %e, "Ignoring container logging configuration");
        }
        self.autoload(container_config.as_ref());

        *state = ContainerState::Initialized;
        tracing::info!(
            container = %self.name(),
            loader = self.loader.backend_name(),
            config = self.config.backend_name(),
            "Container initialized"
        );
        Ok(())
    }

    /// The container's configuration entry; `None` for dynamic containers
    /// or when there is no usable entry.
    fn container_config(&self) -> Option<ConfigBlob> {
        let (dynamic, key) = {
            let settings = self.settings.read();
            (settings.container.dynamic, settings.container_config_key())
        };
        if dynamic {
            tracing::debug!("Dynamic container, skipping persisted configuration");
            return None;
        }
        match self.config.load_config(&key) {
            Ok(config) => Some(config),
            Err(ContainerError::ConfigNotFound(_)) => {
                tracing::debug!(key, "No container configuration entry");
                None
            }
            Err(e) => {
                tracing::warn!(key, error = %e, "Unreadable container configuration");
                None
            }
        }
    }

    fn autoload(&self, container_config: Option<&ConfigBlob>) {
        let Some(paths) = container_config
            .and_then(|c| c.get("autoload"))
            .and_then(|a| a.as_array())
        else {
            return;
        };
        let mut loaded = self.autoloaded.lock();
        for path in paths.iter().filter_map(|p| p.as_str()) {
            match self.loader.load(path) {
                Ok(id) => {
                    tracing::info!(path, %id, "Autoloaded library");
                    loaded.push(id);
                }
                Err(e) => tracing::warn!(path, error = %e, "Autoload failed"),
            }
        }
    }

    fn release_autoloaded(&self) {
        let loaded = std::mem::take(&mut *self.autoloaded.lock());
        for id in loaded {
            self.registry.with_lock(|| self.loader.unload(id));
        }
    }

    /// `Initialized -> Connected`. Resolves the Manager with bounded retries,
    /// answers its challenge and logs in. On failure the state stays
    /// `Initialized` and the call can be repeated.
    pub async fn connect(&self) -> Result<Handle, ContainerError> {
        let _transition = self.transition.lock().await;
        let current = self.state();
        if current != ContainerState::Initialized {
            return Err(ContainerError::InvalidState {
                operation: "connect",
                state: current.to_string(),
            });
        }
        let settings = self.settings();
        self.resolve_manager(&settings).await?;

        let name = settings.container.name.clone();
        let challenge = self
            .link
            .call("challenge", self.link.client().challenge(&name))
            .await
            .map_err(unreachable_on_timeout)?;
        let credentials = Credentials {
            answer: self.authenticate(&challenge),
            endpoint: format!("vessel://{name}"),
            name,
        };
        let handle = self
            .link
            .call("login", self.link.client().login(&credentials))
            .await
            .map_err(unreachable_on_timeout)?;
        if !handle.is_assigned() {
            return Err(ContainerError::Authentication(
                "manager returned an unassigned handle".into(),
            ));
        }

        self.link.assign(handle);
        *self.state.lock() = ContainerState::Connected;
        tracing::info!(container = %credentials.name, %handle, "Connected to manager");
        Ok(handle)
    }

    async fn resolve_manager(&self, settings: &Settings) -> Result<(), ContainerError> {
        let attempts = settings.manager.resolve_attempts.max(1);
        let limit = settings.resolve_timeout();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(limit, self.link.client().resolve()).await {
                Ok(Ok(())) => {
                    tracing::debug!(attempt, address = %settings.manager.address, "Manager resolved");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("no answer within {}ms", limit.as_millis()),
            }
            tracing::warn!(attempt, attempts, error = %last_error, "Manager not reachable");
            if attempt < attempts {
                tokio::time::sleep(settings.retry_interval()).await;
            }
        }
        Err(ContainerError::ManagerUnreachable(format!(
            "{} after {attempts} attempts: {last_error}",
            settings.manager.address
        )))
    }

    /// `Connected -> Running`. Serves RPCs until a shutdown is requested and
    /// teardown has finished, then returns the request.
    pub async fn run(&self) -> Result<ShutdownRequest, ContainerError> {
        let container = self.arc()?;
        let pool = {
            let _transition = self.transition.lock().await;
            let mut state = self.state.lock();
            if *state != ContainerState::Connected {
                return Err(ContainerError::InvalidState {
                    operation: "run",
                    state: state.to_string(),
                });
            }
            let receiver = self.rpc_rx.lock().take().ok_or(ContainerError::InvalidState {
                operation: "run",
                state: "already served once".into(),
            })?;
            *state = ContainerState::Running;
            let threads = self.settings.read().container.server_threads;
            RpcPool::spawn(container, receiver, threads)
        };
        tracing::info!(container = %self.name(), "Container running");

        let mut stop = self.stop.subscribe();
        let request = stop
            .wait_for(Option::is_some)
            .await
            .map(|pending| *pending)
            .map_err(|_| ContainerError::System("shutdown channel closed".into()))?
            .unwrap_or(ShutdownRequest::exit(0));
        self.teardown.wait().await;
        pool.stop().await;

        tracing::info!(action = ?request.action, exit_status = request.exit_status, "Container stopped");
        Ok(request)
    }

    /// `-> Disconnecting -> Terminated`. Stops accepting requests, tears down
    /// every component in shutdown order, logs out, closes the adapter
    /// hierarchy and signals the shutdown coordinator.
    pub async fn done(&self) -> Result<(), ContainerError> {
        let container = self.arc()?;
        let _transition = self.transition.lock().await;
        {
            let mut state = self.state.lock();
            match *state {
                ContainerState::New => {
                    return Err(ContainerError::InvalidState {
                        operation: "finish",
                        state: state.to_string(),
                    });
                }
                ContainerState::Disconnecting | ContainerState::Terminated => return Ok(()),
                _ => *state = ContainerState::Disconnecting,
            }
        }
        self.teardown.reset();
        self.request_stop(ShutdownRequest::exit(0));
        self.link.begin_closing();
        tracing::info!(container = %self.name(), components = self.registry.len(), "Container disconnecting");

        let teardown = tokio::task::spawn_blocking(move || {
            container.deactivate_all();
            container.release_autoloaded();
        })
        .await;
        if let Err(e) = teardown {
            tracing::error!(error = %e, "Component teardown aborted");
        }

        let handle = self.link.close();
        if handle.is_assigned() {
            match self
                .link
                .call("logout", self.link.client().logout(handle))
                .await
            {
                Ok(()) => tracing::info!(%handle, "Logged out of manager"),
                Err(e) => tracing::warn!(%handle, error = %e, "Logout failed"),
            }
        }
        self.adapter.close();

        *self.state.lock() = ContainerState::Terminated;
        self.teardown.signal();
        tracing::info!(container = %self.name(), "Container terminated");
        Ok(())
    }

    /// Record a shutdown request (`action << 8 | exit status`) and start
    /// teardown in the background. Returns once the request is recorded.
    pub fn shutdown(&self, code: u32) -> Result<(), ContainerError> {
        let request = ShutdownRequest::decode(code)?;
        match self.state() {
            ContainerState::New => {
                return Err(ContainerError::InvalidState {
                    operation: "shut down",
                    state: ContainerState::New.to_string(),
                });
            }
            ContainerState::Disconnecting | ContainerState::Terminated => return Ok(()),
            _ => {}
        }
        if !self.request_stop(request) {
            tracing::debug!(action = ?request.action, "Shutdown already pending");
            return Ok(());
        }
        tracing::info!(action = ?request.action, exit_status = request.exit_status, "Shutdown requested");

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ContainerError::System(format!("no runtime to shut down on: {e}")))?;
        let container = self.arc()?;
        runtime.spawn(async move {
            if let Err(e) = container.done().await {
                tracing::error!(error = %e, "Teardown failed");
            }
        });
        Ok(())
    }

    /// The Manager dropping the container is an exit with status 0.
    pub fn disconnect(&self) -> Result<(), ContainerError> {
        tracing::info!("Manager requested disconnect");
        self.shutdown(ShutdownRequest::EXIT << 8)
    }

    pub fn ping(&self) -> bool {
        let consistent = self.registry.is_consistent();
        if !consistent {
            tracing::error!("Registry map and activation order disagree");
        }
        consistent && self.state() == ContainerState::Running && !self.rpc_tx.is_closed()
    }

    pub fn authenticate(&self, challenge: &str) -> String {
        tracing::debug!(challenge, "Answering authentication challenge");
        format!("{CONTAINER_CLIENT_TYPE}{}", self.name())
    }

    pub fn message(&self, severity: MessageType, text: &str) {
        match severity {
            MessageType::Error => tracing::error!(source = "manager", "{text}"),
            MessageType::Information => tracing::info!(source = "manager", "{text}"),
        }
    }

    pub fn components_available(&self, components: Vec<ComponentInfo>) {
        for info in &components {
            tracing::info!(name = %info.name, handle = %info.handle, "Component available");
        }
        // No subscribers is fine.
        let _ = self.availability.send(AvailabilityEvent::Available(components));
    }

    pub fn components_unavailable(&self, names: Vec<String>) {
        for name in &names {
            tracing::info!(name, "Component unavailable");
        }
        let _ = self.availability.send(AvailabilityEvent::Unavailable(names));
    }

    /// Re-read the `logging` object of the container's configuration entry.
    pub fn refresh_logging_config(&self) -> Result<(), ContainerError> {
        let container_config = self.container_config();
        self.log_control.refresh(container_config.as_ref())
    }

    /// Look up a component through the Manager, waiting for this
    /// container's handle if it is not assigned yet. Failures are logged and
    /// reported as `None`.
    pub async fn resolve(&self, name: &str, domain: Option<&str>, activate: bool) -> Option<Reference> {
        self.link.get_object(name, domain, activate).await
    }

    pub async fn get_component<T: Capability>(
        &self,
        name: &str,
        domain: Option<&str>,
        activate: bool,
    ) -> Result<T, ContainerError> {
        self.link.get_component(name, domain, activate).await
    }

    pub async fn get_service<T: Capability>(
        &self,
        name: &str,
        domain: Option<&str>,
        activate: bool,
    ) -> Result<T, ContainerError> {
        self.link.get_service(name, domain, activate).await
    }

    pub async fn release_component(&self, name: &str) {
        self.link.release_component(name).await;
    }
}

fn unreachable_on_timeout(error: ContainerError) -> ContainerError {
    match error {
        ContainerError::Timeout(reason) => ContainerError::ManagerUnreachable(reason),
        other => other,
    }
}
