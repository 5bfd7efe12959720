use std::sync::Arc;

use tokio::sync::broadcast;

use crate::adapter::AdapterScope;
use crate::config_source::{ConfigBlob, ConfigSource};
use crate::error::ContainerError;
use crate::manager::ManagerLink;
use crate::servant::Capability;
use crate::types::{AvailabilityEvent, Handle, Reference};

/// Capabilities injected into a component at construction time.
#[derive(Clone)]
pub struct ContainerServices {
    handle: Handle,
    name: String,
    scope: AdapterScope,
    config: Arc<dyn ConfigSource>,
    link: Arc<ManagerLink>,
    availability: broadcast::Sender<AvailabilityEvent>,
}

impl ContainerServices {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> AdapterScope {
        self.scope
    }

    /// This component's configuration-database entry.
    pub fn config(&self) -> Result<ConfigBlob, ContainerError> {
        self.config.load_config(&self.name)
    }

    /// Another component's configuration-database entry.
    pub fn config_of(&self, name: &str) -> Result<ConfigBlob, ContainerError> {
        self.config.load_config(name)
    }

    /// Look up a peer through the Manager. `None` on any failure.
    pub async fn get_object(&self, name: &str, domain: Option<&str>, activate: bool) -> Option<Reference> {
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

    pub async fn release_component(&self, name: &str) {
        self.link.release_component(name).await;
    }

    /// Receive availability changes of peers announced by the Manager.
    pub fn subscribe_availability(&self) -> broadcast::Receiver<AvailabilityEvent> {
        self.availability.subscribe()
    }
}

/// Builds the per-component [`ContainerServices`] bundle.
pub trait ServicesFactory: Send + Sync {
    fn create(&self, handle: Handle, name: &str, scope: AdapterScope) -> ContainerServices;
}

pub struct DefaultServicesFactory {
    config: Arc<dyn ConfigSource>,
    link: Arc<ManagerLink>,
    availability: broadcast::Sender<AvailabilityEvent>,
}

impl DefaultServicesFactory {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        link: Arc<ManagerLink>,
        availability: broadcast::Sender<AvailabilityEvent>,
    ) -> Self {
        Self {
            config,
            link,
            availability,
        }
    }
}

impl ServicesFactory for DefaultServicesFactory {
    fn create(&self, handle: Handle, name: &str, scope: AdapterScope) -> ContainerServices {
        ContainerServices {
            handle,
            name: name.to_string(),
            scope,
            config: self.config.clone(),
            link: self.link.clone(),
            availability: self.availability.clone(),
        }
    }
}
