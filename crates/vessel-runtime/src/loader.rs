// Ported from microsoft/wassette (MIT License, with vessel-specific modifications)
// Copyright (c) Microsoft Corporation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use vessel_core::{
    BoxFuture, ConfigBlob, ConstructRequest, ContainerError, Handle, LibraryId, LibraryLoader,
    LibraryTable, Servant,
};
use wasmtime::component::{InstancePre, Linker, Val};
use wasmtime::{Config, Engine, Store};

use crate::cache::ArtifactCache;
use crate::error::RuntimeError;
use crate::wasistate::WasiState;

/// Name of the export every vessel component implements:
/// `run(input: string) -> result<string, string>`.
const RUN_EXPORT: &str = "run";

/// Engine every library is compiled for and every servant runs on.
///
/// Libraries are components, not core modules, and servants drive their
/// `run` export with `call_async`, so both features must be on.
pub fn component_engine() -> anyhow::Result<Engine> {
    let mut config = Config::new();
    config.wasm_component_model(true);
    config.async_support(true);
    Engine::new(&config)
}

/// Host imports a library may link against: WASI p2 and outgoing HTTP.
fn host_linker(engine: &Engine) -> anyhow::Result<Linker<WasiState>> {
    let mut linker = Linker::new(engine);
    wasmtime_wasi::p2::add_to_linker_async(&mut linker)?;
    wasmtime_wasi_http::add_only_http_to_linker_async(&mut linker)?;
    Ok(linker)
}

/// A compiled, pre-instantiated component library.
struct WasmLibrary {
    instance_pre: InstancePre<WasiState>,
    hash: String,
}

/// [`LibraryLoader`] for WebAssembly components on disk.
///
/// Executable paths are resolved against the library directory when
/// relative. Each library is compiled (or loaded from the artifact cache) and
/// pre-instantiated once against one shared linker; each servant invocation
/// gets its own `Store`.
pub struct WasmLibraryLoader {
    engine: Engine,
    linker: Linker<WasiState>,
    cache: ArtifactCache,
    library_dir: Option<PathBuf>,
    table: LibraryTable<WasmLibrary>,
}

impl WasmLibraryLoader {
    pub fn new(cache_dir: Option<PathBuf>, library_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let engine = component_engine()?;
        let linker = host_linker(&engine)?;
        let cache = ArtifactCache::new(cache_dir.unwrap_or_else(ArtifactCache::default_path));
        cache.init()?;
        tracing::info!(
            cache = %cache.base_dir().display(),
            library_dir = ?library_dir,
            "WASM loader ready (component model, async, WASI p2 + HTTP)"
        );
        Ok(Self {
            engine,
            linker,
            cache,
            library_dir,
            table: LibraryTable::new(),
        })
    }

    /// SHA-256 of the source a loaded library was built from.
    pub fn library_hash(&self, id: LibraryId) -> Option<String> {
        self.table.get(id).map(|library| library.hash.clone())
    }

    pub fn loaded_count(&self) -> usize {
        self.table.loaded_count()
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let candidate = Path::new(path);
        match &self.library_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        }
    }

    fn open(&self, path: &str) -> Result<WasmLibrary, RuntimeError> {
        let source = self.resolve_path(path);
        tracing::info!(path, source = %source.display(), "Loading component library");
        let (component, hash) = self.cache.load_or_compile(&source, &self.engine)?;
        let instance_pre = self
            .linker
            .instantiate_pre(&component)
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{path}: {e}")))?;
        Ok(WasmLibrary { instance_pre, hash })
    }
}

impl LibraryLoader for WasmLibraryLoader {
    fn load(&self, path: &str) -> Result<LibraryId, ContainerError> {
        self.table
            .acquire(path, |path| self.open(path).map_err(|e| e.into_load_error(path)))
    }

    fn unload(&self, id: LibraryId) {
        self.table.release(id);
    }

    fn construct(
        &self,
        id: LibraryId,
        request: ConstructRequest,
    ) -> Result<Arc<dyn Servant>, ContainerError> {
        let library = self.table.get(id).ok_or_else(|| ContainerError::Construction {
            name: request.name.clone(),
            reason: format!("{id} is not loaded"),
        })?;
        tracing::debug!(name = %request.name, %id, "Constructing WASM servant");
        Ok(Arc::new(WasmServant {
            name: request.name,
            handle: request.handle,
            interface: request.component_type,
            engine: self.engine.clone(),
            instance_pre: library.instance_pre.clone(),
            config: RwLock::new(ConfigBlob::Null),
        }))
    }

    fn ref_count(&self, id: LibraryId) -> usize {
        self.table.ref_count(id)
    }

    fn backend_name(&self) -> &str {
        "wasm"
    }
}

/// What a component's `run` export receives, as JSON.
#[derive(Serialize)]
struct RunInput<'a> {
    component: &'a str,
    operation: &'a str,
    payload: serde_json::Value,
    config: ConfigBlob,
}

/// One component instance backed by a pre-instantiated WASM library.
pub struct WasmServant {
    name: String,
    handle: Handle,
    interface: String,
    engine: Engine,
    instance_pre: InstancePre<WasiState>,
    config: RwLock<ConfigBlob>,
}

impl WasmServant {
    async fn run(&self, operation: &str, payload: serde_json::Value) -> Result<serde_json::Value, RuntimeError> {
        let input = RunInput {
            component: &self.name,
            operation,
            payload,
            config: self.config.read().clone(),
        };
        let input_json = serde_json::to_string(&input)?;

        let state = WasiState::for_component(&self.name, self.handle);
        let mut store = Store::new(&self.engine, state);
        let instance = self
            .instance_pre
            .instantiate_async(&mut store)
            .await
            .map_err(|e| RuntimeError::InstantiationFailed(format!("{}: {e}", self.name)))?;

        let run = instance.get_func(&mut store, RUN_EXPORT).ok_or_else(|| {
            RuntimeError::InvocationFailed(format!("{}: no '{RUN_EXPORT}' export found", self.name))
        })?;

        let params = [Val::String(input_json)];
        let mut results = vec![Val::Bool(false)];
        run.call_async(&mut store, &params, &mut results)
            .await
            .map_err(|e| RuntimeError::InvocationFailed(format!("{}.{operation}: {e}", self.name)))?;
        run.post_return_async(&mut store)
            .await
            .map_err(|e| RuntimeError::InvocationFailed(format!("{} post_return: {e}", self.name)))?;

        let output = extract_run_result(&self.name, results)?;
        Ok(serde_json::from_str(&output).unwrap_or(serde_json::Value::String(output)))
    }
}

impl Servant for WasmServant {
    fn interface(&self) -> &str {
        &self.interface
    }

    fn initialize(&self, config: &ConfigBlob) -> Result<(), String> {
        *self.config.write() = config.clone();
        Ok(())
    }

    fn cleanup(&self) {
        tracing::debug!(name = %self.name, "WASM servant released");
    }

    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value, String>> {
        Box::pin(async move { self.run(operation, payload).await.map_err(|e| e.to_string()) })
    }
}

/// Extract the string value from a `result<string, string>` Val.
fn extract_run_result(name: &str, results: Vec<Val>) -> Result<String, RuntimeError> {
    match results.into_iter().next() {
        Some(Val::Result(Ok(Some(boxed)))) => match *boxed {
            Val::String(s) => Ok(s),
            other => Err(RuntimeError::InvocationFailed(format!(
                "{name}: expected string in Ok variant, got {other:?}"
            ))),
        },
        Some(Val::Result(Err(Some(boxed)))) => match *boxed {
            Val::String(e) => Err(RuntimeError::ComponentError(e)),
            other => Err(RuntimeError::ComponentError(format!("{other:?}"))),
        },
        Some(Val::Result(Ok(None))) => Ok("null".into()),
        Some(Val::Result(Err(None))) => Err(RuntimeError::ComponentError("(no error detail)".into())),
        Some(other) => Err(RuntimeError::InvocationFailed(format!(
            "{name}: unexpected return Val: {other:?}"
        ))),
        None => Err(RuntimeError::InvocationFailed(format!(
            "{name}: component returned no values"
        ))),
    }
}
