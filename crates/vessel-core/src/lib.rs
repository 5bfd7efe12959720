//! Component container core for vessel.
//!
//! A [`Container`] hosts components on behalf of a remote Manager: it loads
//! their libraries, constructs servants, makes them reachable through an
//! object adapter, and keeps a handle-indexed [`Registry`] of what is active.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vessel_core::{Container, ContainerParts, Settings};
//! use vessel_core::mock::MockManager;
//!
//! # async fn run() -> Result<(), vessel_core::ContainerError> {
//! let container = Container::new(ContainerParts::new(Arc::new(MockManager::new())));
//!
//! let mut settings = Settings::default();
//! settings.container.name = "vessel-1".into();
//! container.init(settings)?;
//! container.connect().await?;
//!
//! // Serves requests until the Manager asks for a shutdown.
//! let request = container.run().await?;
//! println!("stopping: {:?}", request.action);
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config_source;
mod connection;
pub mod container;
pub mod error;
mod lifecycle;
pub mod loader;
pub mod logging;
pub mod manager;
pub mod mock;
pub mod registry;
pub mod rpc;
pub mod servant;
pub mod services;
pub mod settings;
pub mod shutdown;
pub mod types;

pub use adapter::{
    AdapterScope, Etherealizer, EtherealizeMode, LocalObjectAdapter, ObjectAdapter, ServantUse,
};
pub use config_source::{ConfigBlob, ConfigSource, FileConfigSource, MemoryConfigSource};
pub use container::{Container, ContainerParts};
pub use error::ContainerError;
pub use loader::{
    ComponentFactory, ConstructRequest, LibraryId, LibraryLoader, LibraryTable, StaticLibraryLoader,
};
pub use logging::{FilterReload, LogControl, LogLevel, LogLevels};
pub use manager::{ComponentLookup, ComponentStatus, Credentials, ManagerClient, ManagerLink};
pub use registry::{ComponentRecord, Registry};
pub use rpc::{RpcClient, RpcRequest, RpcResponse};
pub use servant::{BoxFuture, Capability, Servant, narrow};
pub use services::{ContainerServices, DefaultServicesFactory, ServicesFactory};
pub use settings::Settings;
pub use shutdown::ShutdownCoordinator;
pub use types::{
    AvailabilityEvent, ComponentInfo, ContainerState, Handle, MessageType, Reference,
    ShutdownAction, ShutdownRequest,
};
