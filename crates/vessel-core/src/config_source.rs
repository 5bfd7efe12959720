use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use parking_lot::RwLock;

use crate::error::ContainerError;

/// Initialization data for one component or container.
pub type ConfigBlob = serde_json::Value;

/// Read access to the configuration database.
pub trait ConfigSource: Send + Sync {
    /// Returns `ConfigNotFound` when no entry exists for `name`.
    fn load_config(&self, name: &str) -> Result<ConfigBlob, ContainerError>;

    /// Backend name for logging.
    fn backend_name(&self) -> &str;
}

/// In-memory configuration. Used by tests and dynamic deployments.
#[derive(Default)]
pub struct MemoryConfigSource {
    entries: RwLock<HashMap<String, ConfigBlob>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = (String, ConfigBlob)>) -> Self {
        Self {
            entries: RwLock::new(entries.into_iter().collect()),
        }
    }

    pub fn insert(&self, name: impl Into<String>, blob: ConfigBlob) {
        self.entries.write().insert(name.into(), blob);
    }

    pub fn remove(&self, name: &str) {
        self.entries.write().remove(name);
    }
}

impl ConfigSource for MemoryConfigSource {
    fn load_config(&self, name: &str) -> Result<ConfigBlob, ContainerError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::ConfigNotFound(name.to_string()))
    }

    fn backend_name(&self) -> &str {
        "memory"
    }
}

/// Directory-backed configuration.
///
/// Layout under `root`:
/// ```text
/// {root}/
///   LAMP1.json                       - component "LAMP1"
///   MOUNT/AXIS1.json                 - component "MOUNT/AXIS1"
///   MACI/Containers/vessel-1.json    - container "vessel-1"
/// ```
pub struct FileConfigSource {
    root: PathBuf,
}

impl FileConfigSource {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf, ContainerError> {
        let relative = Path::new(name);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if name.is_empty() || escapes {
            return Err(ContainerError::Configuration {
                name: name.to_string(),
                reason: "entry name must be a relative path without '.' or '..'".into(),
            });
        }
        Ok(self.root.join(format!("{name}.json")))
    }
}

impl ConfigSource for FileConfigSource {
    fn load_config(&self, name: &str) -> Result<ConfigBlob, ContainerError> {
        let path = self.entry_path(name)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ContainerError::ConfigNotFound(name.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content).map_err(|e| ContainerError::Configuration {
            name: name.to_string(),
            reason: format!("{}: {e}", path.display()),
        })
    }

    fn backend_name(&self) -> &str {
        "file"
    }
}
