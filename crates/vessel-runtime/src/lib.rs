// vessel-runtime: WebAssembly component libraries for vessel containers
//
// Ported from microsoft/wassette (MIT License).
// Copyright (c) Microsoft Corporation.

//! WebAssembly component backend for vessel containers.
//!
//! Provides [`WasmLibraryLoader`], a [`vessel_core::LibraryLoader`] that
//! treats each executable path as a WebAssembly component exporting
//! `run(input: string) -> result<string, string>`.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use vessel_core::{Container, ContainerParts};
//! use vessel_core::mock::MockManager;
//! use vessel_runtime::WasmLibraryLoader;
//!
//! # fn run() -> anyhow::Result<()> {
//! let loader = WasmLibraryLoader::new(None, Some("/opt/vessel/libs".into()))?;
//! let container = Container::new(
//!     ContainerParts::new(Arc::new(MockManager::new())).with_loader(Arc::new(loader)),
//! );
//! # let _ = container;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod loader;
pub mod wasistate;

pub use cache::ArtifactCache;
pub use error::RuntimeError;
pub use loader::{WasmLibraryLoader, WasmServant, component_engine};
