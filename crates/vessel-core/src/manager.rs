use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::ContainerError;
use crate::servant::{BoxFuture, Capability, narrow};
use crate::types::{Handle, Reference};

const CURL_SCHEME: &str = "curl://";

/// What a container presents to the Manager when logging in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub name: String,
    /// Answer to the Manager's challenge (see `Container::authenticate`)
    pub answer: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Activated,
    NotActivated,
    NonExistent,
    Failed,
}

/// Manager's answer to a component or service lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLookup {
    pub reference: Option<Reference>,
    pub status: ComponentStatus,
}

/// Client side of the Manager's RPC interface.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait ManagerClient: Send + Sync {
    /// Check that the Manager is reachable.
    fn resolve(&self) -> BoxFuture<'_, Result<(), ContainerError>>;

    /// Ask the Manager for a login challenge.
    fn challenge<'a>(&'a self, container_name: &'a str) -> BoxFuture<'a, Result<String, ContainerError>>;

    fn login<'a>(&'a self, credentials: &'a Credentials) -> BoxFuture<'a, Result<Handle, ContainerError>>;

    fn logout(&self, handle: Handle) -> BoxFuture<'_, Result<(), ContainerError>>;

    fn get_component<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>>;

    fn get_service<'a>(
        &'a self,
        handle: Handle,
        curl: &'a str,
        activate: bool,
    ) -> BoxFuture<'a, Result<ComponentLookup, ContainerError>>;

    fn release_component<'a>(&'a self, handle: Handle, curl: &'a str) -> BoxFuture<'a, Result<(), ContainerError>>;
}

/// Container-side view of the Manager: the client, this container's own
/// handle, and the wait for that handle to be assigned.
pub struct ManagerLink {
    client: Arc<dyn ManagerClient>,
    handle: watch::Sender<Handle>,
    closing: watch::Sender<bool>,
    timeouts: RwLock<LinkTimeouts>,
}

#[derive(Debug, Clone, Copy)]
struct LinkTimeouts {
    invocation: Duration,
    handle_wait: Option<Duration>,
}

impl ManagerLink {
    pub fn new(client: Arc<dyn ManagerClient>) -> Self {
        let (handle, _) = watch::channel(Handle::UNASSIGNED);
        let (closing, _) = watch::channel(false);
        Self {
            client,
            handle,
            closing,
            timeouts: RwLock::new(LinkTimeouts {
                invocation: Duration::from_secs(15),
                handle_wait: Some(Duration::from_secs(60)),
            }),
        }
    }

    /// `handle_wait = None` waits until assignment or shutdown.
    pub fn set_timeouts(&self, invocation: Duration, handle_wait: Option<Duration>) {
        *self.timeouts.write() = LinkTimeouts {
            invocation,
            handle_wait,
        };
    }

    pub fn client(&self) -> &Arc<dyn ManagerClient> {
        &self.client
    }

    pub fn handle(&self) -> Handle {
        *self.handle.borrow()
    }

    pub(crate) fn assign(&self, handle: Handle) {
        self.handle.send_replace(handle);
        tracing::info!(%handle, "Container handle assigned");
    }

    /// Release every waiter still waiting for a handle with `ShuttingDown`.
    /// An assigned handle stays readable until [`close`](Self::close).
    pub(crate) fn begin_closing(&self) {
        if !self.closing.send_replace(true) {
            tracing::debug!("Manager link closing, handle waiters released");
        }
    }

    /// Clear the handle and release every waiter with `ShuttingDown`.
    pub(crate) fn close(&self) -> Handle {
        self.closing.send_replace(true);
        self.handle.send_replace(Handle::UNASSIGNED)
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Suspend until the container's handle is assigned.
    ///
    /// Fails only with `ShuttingDown` (the container began teardown) or
    /// `Timeout` (`timeout` elapsed).
    pub async fn wait_for_handle(&self, timeout: Option<Duration>) -> Result<Handle, ContainerError> {
        let mut handle_rx = self.handle.subscribe();
        let mut closing_rx = self.closing.subscribe();

        let wait = async move {
            tokio::select! {
                biased;
                assigned = handle_rx.wait_for(|h| h.is_assigned()) => {
                    assigned.map(|h| *h).map_err(|_| ContainerError::ShuttingDown)
                }
                _ = closing_rx.wait_for(|closing| *closing) => Err(ContainerError::ShuttingDown),
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                ContainerError::Timeout(format!(
                    "container handle not assigned within {}ms",
                    limit.as_millis()
                ))
            })?,
            None => wait.await,
        }
    }

    /// Run a Manager RPC bounded by the invocation timeout.
    pub async fn call<T>(
        &self,
        operation: &str,
        rpc: impl Future<Output = Result<T, ContainerError>>,
    ) -> Result<T, ContainerError> {
        let limit = self.timeouts.read().invocation;
        match tokio::time::timeout(limit, rpc).await {
            Ok(result) => result,
            Err(_) => Err(ContainerError::Timeout(format!(
                "manager call '{operation}' exceeded {}ms",
                limit.as_millis()
            ))),
        }
    }

    /// `curl://<domain>/<name>`, or `name` unchanged when already a curl.
    pub fn curl(name: &str, domain: Option<&str>) -> String {
        if name.starts_with(CURL_SCHEME) {
            name.to_string()
        } else {
            format!("{CURL_SCHEME}{}/{name}", domain.unwrap_or_default())
        }
    }

    /// Resolve a component through the Manager. Failures are logged and
    /// reported as `None`.
    pub async fn get_object(&self, name: &str, domain: Option<&str>, activate: bool) -> Option<Reference> {
        match self.lookup(LookupKind::Component, name, domain, activate).await {
            Ok(reference) => Some(reference),
            Err(e) => {
                tracing::warn!(name, error = %e, "get_object failed");
                None
            }
        }
    }

    pub async fn get_component<T: Capability>(
        &self,
        name: &str,
        domain: Option<&str>,
        activate: bool,
    ) -> Result<T, ContainerError> {
        let reference = self.lookup(LookupKind::Component, name, domain, activate).await?;
        narrow(reference)
    }

    pub async fn get_service<T: Capability>(
        &self,
        name: &str,
        domain: Option<&str>,
        activate: bool,
    ) -> Result<T, ContainerError> {
        let reference = self.lookup(LookupKind::Service, name, domain, activate).await?;
        narrow(reference)
    }

    pub async fn release_component(&self, name: &str) {
        let curl = Self::curl(name, None);
        let handle = match self.wait_for_handle(self.handle_wait()).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!(curl, error = %e, "Cannot release component");
                return;
            }
        };
        if let Err(e) = self
            .call("release_component", self.client.release_component(handle, &curl))
            .await
        {
            tracing::warn!(curl, error = %e, "Manager refused component release");
        }
    }

    fn handle_wait(&self) -> Option<Duration> {
        self.timeouts.read().handle_wait
    }

    async fn lookup(
        &self,
        kind: LookupKind,
        name: &str,
        domain: Option<&str>,
        activate: bool,
    ) -> Result<Reference, ContainerError> {
        if name.is_empty() {
            return Err(ContainerError::InvalidArgument("component name is empty".into()));
        }
        let curl = Self::curl(name, domain);
        tracing::debug!(curl, ?kind, activate, "Resolving through manager");

        if !self.handle().is_assigned() {
            tracing::debug!(curl, "Waiting for container handle");
        }
        let handle = self.wait_for_handle(self.handle_wait()).await?;

        let lookup = match kind {
            LookupKind::Component => {
                self.call("get_component", self.client.get_component(handle, &curl, activate))
                    .await?
            }
            LookupKind::Service => {
                self.call("get_service", self.client.get_service(handle, &curl, activate))
                    .await?
            }
        };

        match lookup {
            ComponentLookup {
                reference: Some(reference),
                status: ComponentStatus::Activated,
            } => Ok(reference),
            ComponentLookup { status, .. } => Err(ContainerError::ResolveFailed {
                curl,
                reason: format!("manager answered {status:?}"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum LookupKind {
    Component,
    Service,
}
