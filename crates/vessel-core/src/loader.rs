use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::ContainerError;
use crate::servant::Servant;
use crate::services::ContainerServices;
use crate::types::Handle;

/// Identifier of one loaded library, stable while its reference count is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LibraryId(u64);

impl LibraryId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for LibraryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lib#{}", self.0)
    }
}

/// Everything a factory gets to build one servant.
pub struct ConstructRequest {
    pub handle: Handle,
    pub name: String,
    pub component_type: String,
    pub services: ContainerServices,
}

/// Loads executable modules and builds servants from them.
///
/// `load` on an already-loaded path only bumps its reference count; `unload`
/// drops one reference and releases the module at zero.
pub trait LibraryLoader: Send + Sync {
    fn load(&self, path: &str) -> Result<LibraryId, ContainerError>;

    fn unload(&self, id: LibraryId);

    fn construct(
        &self,
        id: LibraryId,
        request: ConstructRequest,
    ) -> Result<Arc<dyn Servant>, ContainerError>;

    fn ref_count(&self, id: LibraryId) -> usize;

    /// Backend name for logging.
    fn backend_name(&self) -> &str;
}

struct LibraryEntry<L> {
    path: String,
    library: Arc<L>,
    refs: usize,
}

struct TableState<L> {
    next_id: u64,
    by_path: HashMap<String, LibraryId>,
    entries: HashMap<LibraryId, LibraryEntry<L>>,
}

/// Reference-counted table of loaded libraries, shared by loader backends.
pub struct LibraryTable<L> {
    state: Mutex<TableState<L>>,
}

impl<L> LibraryTable<L> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState {
                next_id: 1,
                by_path: HashMap::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Take a reference on `path`, opening it with `open` on first use.
    ///
    /// `open` runs under the table lock, so a path is never opened twice.
    pub fn acquire(
        &self,
        path: &str,
        open: impl FnOnce(&str) -> Result<L, ContainerError>,
    ) -> Result<LibraryId, ContainerError> {
        let mut state = self.state.lock();
        if let Some(id) = state.by_path.get(path).copied() {
            if let Some(entry) = state.entries.get_mut(&id) {
                entry.refs += 1;
                tracing::debug!(path, %id, refs = entry.refs, "Library already loaded");
                return Ok(id);
            }
        }

        let library = open(path)?;
        let id = LibraryId(state.next_id);
        state.next_id += 1;
        state.by_path.insert(path.to_string(), id);
        state.entries.insert(
            id,
            LibraryEntry {
                path: path.to_string(),
                library: Arc::new(library),
                refs: 1,
            },
        );
        tracing::info!(path, %id, "Library loaded");
        Ok(id)
    }

    /// Drop one reference. Returns the library once the last reference is gone.
    pub fn release(&self, id: LibraryId) -> Option<Arc<L>> {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&id) else {
            tracing::warn!(%id, "Release of unknown library ignored");
            return None;
        };
        entry.refs -= 1;
        if entry.refs > 0 {
            tracing::debug!(%id, refs = entry.refs, "Library reference released");
            return None;
        }
        let entry = state.entries.remove(&id)?;
        state.by_path.remove(&entry.path);
        tracing::info!(path = %entry.path, %id, "Library unloaded");
        Some(entry.library)
    }

    pub fn get(&self, id: LibraryId) -> Option<Arc<L>> {
        self.state.lock().entries.get(&id).map(|e| e.library.clone())
    }

    pub fn ref_count(&self, id: LibraryId) -> usize {
        self.state.lock().entries.get(&id).map_or(0, |e| e.refs)
    }

    pub fn loaded_count(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl<L> Default for LibraryTable<L> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds servants of the component types one library provides.
pub trait ComponentFactory: Send + Sync {
    fn construct(&self, request: &ConstructRequest) -> Result<Arc<dyn Servant>, String>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&ConstructRequest) -> Result<Arc<dyn Servant>, String> + Send + Sync,
{
    fn construct(&self, request: &ConstructRequest) -> Result<Arc<dyn Servant>, String> {
        self(request)
    }
}

/// Loader backed by factories compiled into the binary, keyed by executable path.
pub struct StaticLibraryLoader {
    factories: RwLock<HashMap<String, Arc<dyn ComponentFactory>>>,
    table: LibraryTable<Arc<dyn ComponentFactory>>,
}

impl StaticLibraryLoader {
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
            table: LibraryTable::new(),
        }
    }

    /// Make `factory` loadable under `path`.
    pub fn register(&self, path: impl Into<String>, factory: impl ComponentFactory + 'static) {
        self.factories.write().insert(path.into(), Arc::new(factory));
    }

    pub fn loaded_count(&self) -> usize {
        self.table.loaded_count()
    }
}

impl Default for StaticLibraryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl LibraryLoader for StaticLibraryLoader {
    fn load(&self, path: &str) -> Result<LibraryId, ContainerError> {
        self.table.acquire(path, |path| {
            self.factories
                .read()
                .get(path)
                .cloned()
                .ok_or_else(|| ContainerError::LibraryLoad {
                    path: path.to_string(),
                    reason: "no factory registered for this executable".into(),
                })
        })
    }

    fn unload(&self, id: LibraryId) {
        self.table.release(id);
    }

    fn construct(
        &self,
        id: LibraryId,
        request: ConstructRequest,
    ) -> Result<Arc<dyn Servant>, ContainerError> {
        let factory = self.table.get(id).ok_or_else(|| ContainerError::Construction {
            name: request.name.clone(),
            reason: format!("{id} is not loaded"),
        })?;
        factory
            .construct(&request)
            .map_err(|reason| ContainerError::Construction {
                name: request.name.clone(),
                reason,
            })
    }

    fn ref_count(&self, id: LibraryId) -> usize {
        self.table.ref_count(id)
    }

    fn backend_name(&self) -> &str {
        "static"
    }
}
