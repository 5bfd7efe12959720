use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ContainerError;
use crate::logging::LogLevel;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub manager: ManagerSettings,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSettings {
    #[serde(default = "default_manager_address")]
    pub address: String,
    #[serde(default = "default_resolve_timeout_ms")]
    pub resolve_timeout_ms: u64,
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_invocation_timeout_ms")]
    pub invocation_timeout_ms: u64,
}

fn default_manager_address() -> String {
    "http://localhost:3000".into()
}
fn default_resolve_timeout_ms() -> u64 {
    3_000
}
fn default_resolve_attempts() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    1_000
}
fn default_invocation_timeout_ms() -> u64 {
    15_000
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            address: default_manager_address(),
            resolve_timeout_ms: default_resolve_timeout_ms(),
            resolve_attempts: default_resolve_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            invocation_timeout_ms: default_invocation_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    #[serde(default)]
    pub name: String,
    /// Prefix of the container's own configuration entry
    #[serde(default = "default_config_root")]
    pub config_root: String,
    #[serde(default = "default_server_threads")]
    pub server_threads: usize,
    /// Skip the persisted container configuration
    #[serde(default)]
    pub dynamic: bool,
    /// 0 waits until assignment or shutdown
    #[serde(default = "default_handle_wait_timeout_ms")]
    pub handle_wait_timeout_ms: u64,
}

fn default_config_root() -> String {
    "MACI/Containers".into()
}
fn default_server_threads() -> usize {
    5
}
fn default_handle_wait_timeout_ms() -> u64 {
    60_000
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            config_root: default_config_root(),
            server_threads: default_server_threads(),
            dynamic: false,
            handle_wait_timeout_ms: default_handle_wait_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    #[serde(default)]
    pub default_level: LogLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory for loader caches; `~/.vessel/cache` when absent
    pub cache_dir: Option<PathBuf>,
    /// Root of the file-backed configuration database
    pub config_dir: Option<PathBuf>,
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ContainerError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            ContainerError::InvalidArgument(reason) => {
                ContainerError::InvalidArgument(format!("{}: {reason}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ContainerError> {
        toml::from_str(content)
            .map_err(|e| ContainerError::InvalidArgument(format!("failed to parse settings: {e}")))
    }

    pub fn validate(&self) -> Result<(), ContainerError> {
        if self.container.name.trim().is_empty() {
            return Err(ContainerError::InvalidArgument("container name is required".into()));
        }
        if self.container.name.contains(char::is_whitespace) {
            return Err(ContainerError::InvalidArgument(format!(
                "container name '{}' must not contain whitespace",
                self.container.name
            )));
        }
        if self.manager.address.trim().is_empty() {
            return Err(ContainerError::InvalidArgument("manager address is required".into()));
        }
        if self.container.server_threads == 0 {
            return Err(ContainerError::InvalidArgument(
                "server_threads must be at least 1".into(),
            ));
        }
        if self.manager.resolve_attempts == 0 {
            return Err(ContainerError::InvalidArgument(
                "resolve_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Key of this container's entry in the configuration database.
    pub fn container_config_key(&self) -> String {
        let root = self.container.config_root.trim_end_matches('/');
        if root.is_empty() {
            self.container.name.clone()
        } else {
            format!("{root}/{}", self.container.name)
        }
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.manager.resolve_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.manager.retry_interval_ms)
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.manager.invocation_timeout_ms)
    }

    pub fn handle_wait_timeout(&self) -> Option<Duration> {
        match self.container.handle_wait_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_settings() {
        let settings = Settings::from_toml_str(
            r#"
[container]
name = "vessel-1"
"#,
        )
        .unwrap();
        assert_eq!(settings.container.name, "vessel-1");
        assert_eq!(settings.container.server_threads, 5);
        assert_eq!(settings.manager.address, "http://localhost:3000");
        assert_eq!(settings.logging.default_level, LogLevel::Info);
        assert_eq!(settings.container_config_key(), "MACI/Containers/vessel-1");
        settings.validate().unwrap();
    }

    #[test]
    fn parses_full_settings() {
        let settings = Settings::from_toml_str(
            r#"
[manager]
address = "http://manager:4000"
resolve_timeout_ms = 500
resolve_attempts = 5
retry_interval_ms = 100
invocation_timeout_ms = 2000

[container]
name = "vessel-2"
config_root = "CDB/MACI/Containers/"
server_threads = 12
dynamic = true
handle_wait_timeout_ms = 0

[logging]
default_level = "debug"

[storage]
cache_dir = "/var/cache/vessel"
config_dir = "/etc/vessel/cdb"
"#,
        )
        .unwrap();
        assert_eq!(settings.manager.resolve_attempts, 5);
        assert_eq!(settings.resolve_timeout(), Duration::from_millis(500));
        assert_eq!(settings.container.server_threads, 12);
        assert!(settings.container.dynamic);
        assert_eq!(settings.handle_wait_timeout(), None);
        assert_eq!(settings.logging.default_level, LogLevel::Debug);
        assert_eq!(settings.container_config_key(), "CDB/MACI/Containers/vessel-2");
        assert_eq!(
            settings.storage.cache_dir,
            Some(PathBuf::from("/var/cache/vessel"))
        );
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = Settings::from_toml_str("[container\nname=").unwrap_err();
        assert!(matches!(err, ContainerError::InvalidArgument(_)));
    }

    #[test]
    fn validation_requires_name_and_threads() {
        let mut settings = Settings::default();
        assert!(settings.validate().is_err());

        settings.container.name = "vessel-1".into();
        settings.container.server_threads = 0;
        assert!(settings.validate().is_err());

        settings.container.server_threads = 1;
        settings.validate().unwrap();

        settings.container.name = "two words".into();
        assert!(settings.validate().is_err());
    }
}
