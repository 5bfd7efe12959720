use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config_source::ConfigBlob;
use crate::error::ContainerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    /// Level name as understood by an `EnvFilter` directive.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

impl FromStr for LogLevel {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "off" => Ok(LogLevel::Off),
            other => Err(ContainerError::InvalidArgument(format!("unknown log level '{other}'"))),
        }
    }
}

/// Levels for one logger, or the defaults every logger falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevels {
    /// Follow the default levels instead of the two below
    pub use_default: bool,
    pub min_level_local: LogLevel,
    /// Recorded and reported; only the local level drives the filter
    pub min_level_remote: LogLevel,
}

impl LogLevels {
    pub fn at(level: LogLevel) -> Self {
        Self {
            use_default: false,
            min_level_local: level,
            min_level_remote: level,
        }
    }
}

impl Default for LogLevels {
    fn default() -> Self {
        Self {
            use_default: true,
            min_level_local: LogLevel::Info,
            min_level_remote: LogLevel::Info,
        }
    }
}

/// Pushes a new filter into the installed subscriber.
pub trait FilterReload: Send + Sync {
    fn reload(&self, directives: &str) -> Result<(), String>;
}

/// `logging` object of a container's configuration entry.
#[derive(Debug, Default, Deserialize)]
struct LoggingConfig {
    default_level: Option<LogLevel>,
    remote_level: Option<LogLevel>,
    #[serde(default)]
    loggers: BTreeMap<String, LogLevel>,
}

struct LogState {
    configured: LogLevels,
    default: LogLevels,
    loggers: BTreeMap<String, LogLevels>,
}

/// Default and per-logger levels of the process.
pub struct LogControl {
    state: RwLock<LogState>,
    reload: Option<Arc<dyn FilterReload>>,
}

impl LogControl {
    pub fn new(default_level: LogLevel, reload: Option<Arc<dyn FilterReload>>) -> Self {
        let configured = LogLevels {
            use_default: true,
            ..LogLevels::at(default_level)
        };
        Self {
            state: RwLock::new(LogState {
                configured,
                default: configured,
                loggers: BTreeMap::new(),
            }),
            reload,
        }
    }

    /// Replace the configured default (from the settings file) and drop
    /// per-logger overrides.
    pub fn reset(&self, default_level: LogLevel) -> Result<(), ContainerError> {
        {
            let mut state = self.state.write();
            state.configured = LogLevels {
                use_default: true,
                ..LogLevels::at(default_level)
            };
            state.default = state.configured;
            state.loggers.clear();
        }
        self.apply()
    }

    pub fn default_levels(&self) -> LogLevels {
        self.state.read().default
    }

    /// `use_default` reverts to the configured default.
    pub fn set_default_levels(&self, levels: LogLevels) -> Result<(), ContainerError> {
        {
            let mut state = self.state.write();
            state.default = if levels.use_default {
                state.configured
            } else {
                LogLevels {
                    use_default: true,
                    ..levels
                }
            };
        }
        self.apply()
    }

    pub fn logger_names(&self) -> Vec<String> {
        self.state.read().loggers.keys().cloned().collect()
    }

    /// Loggers without an override report the defaults with `use_default`.
    pub fn logger_levels(&self, logger: &str) -> LogLevels {
        let state = self.state.read();
        state.loggers.get(logger).copied().unwrap_or(LogLevels {
            use_default: true,
            ..state.default
        })
    }

    pub fn set_logger_levels(&self, logger: &str, levels: LogLevels) -> Result<(), ContainerError> {
        validate_logger_name(logger)?;
        {
            let mut state = self.state.write();
            if levels.use_default {
                state.loggers.remove(logger);
            } else {
                state.loggers.insert(logger.to_string(), levels);
            }
        }
        tracing::info!(logger, ?levels, "Logger levels changed");
        self.apply()
    }

    /// Reload levels from the container's configuration entry. Without a
    /// `logging` object the configured defaults are restored.
    pub fn refresh(&self, container_config: Option<&ConfigBlob>) -> Result<(), ContainerError> {
        let config = match container_config.and_then(|c| c.get("logging")) {
            Some(logging) => LoggingConfig::deserialize(logging).map_err(|e| {
                ContainerError::Configuration {
                    name: "logging".into(),
                    reason: e.to_string(),
                }
            })?,
            None => LoggingConfig::default(),
        };
        for logger in config.loggers.keys() {
            validate_logger_name(logger)?;
        }
        {
            let mut state = self.state.write();
            let local = config.default_level.unwrap_or(state.configured.min_level_local);
            state.default = LogLevels {
                use_default: true,
                min_level_local: local,
                min_level_remote: config.remote_level.unwrap_or(local),
            };
            state.loggers = config
                .loggers
                .into_iter()
                .map(|(name, level)| (name, LogLevels::at(level)))
                .collect();
        }
        tracing::info!(directives = %self.directives(), "Logging configuration refreshed");
        self.apply()
    }

    /// `<default>,<logger>=<level>,...`
    pub fn directives(&self) -> String {
        let state = self.state.read();
        let mut directives = state.default.min_level_local.as_directive().to_string();
        for (logger, levels) in &state.loggers {
            directives.push(',');
            directives.push_str(logger);
            directives.push('=');
            directives.push_str(levels.min_level_local.as_directive());
        }
        directives
    }

    fn apply(&self) -> Result<(), ContainerError> {
        let Some(reload) = &self.reload else {
            return Ok(());
        };
        let directives = self.directives();
        reload
            .reload(&directives)
            .map_err(|e| ContainerError::System(format!("failed to reload log filter: {e}")))
    }
}

fn validate_logger_name(logger: &str) -> Result<(), ContainerError> {
    if logger.is_empty() || logger.contains(|c: char| c.is_whitespace() || c == ',' || c == '=') {
        return Err(ContainerError::InvalidArgument(format!(
            "invalid logger name '{logger}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Captured(Mutex<Vec<String>>);

    impl FilterReload for Captured {
        fn reload(&self, directives: &str) -> Result<(), String> {
            self.0.lock().push(directives.to_string());
            Ok(())
        }
    }

    fn control() -> (LogControl, Arc<Captured>) {
        let captured = Arc::new(Captured::default());
        (LogControl::new(LogLevel::Info, Some(captured.clone())), captured)
    }

    #[test]
    fn parses_level_names() {
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn logger_override_is_pushed_as_directive() {
        let (control, captured) = control();
        control
            .set_logger_levels("vessel_core::registry", LogLevels::at(LogLevel::Trace))
            .unwrap();
        assert_eq!(
            captured.0.lock().last().unwrap(),
            "info,vessel_core::registry=trace"
        );
        assert_eq!(control.logger_names(), vec!["vessel_core::registry".to_string()]);
        assert!(!control.logger_levels("vessel_core::registry").use_default);
    }

    #[test]
    fn use_default_removes_override() {
        let (control, _) = control();
        control.set_logger_levels("LAMP1", LogLevels::at(LogLevel::Error)).unwrap();
        control.set_logger_levels("LAMP1", LogLevels::default()).unwrap();
        assert!(control.logger_names().is_empty());
        let levels = control.logger_levels("LAMP1");
        assert!(levels.use_default);
        assert_eq!(levels.min_level_local, LogLevel::Info);
    }

    #[test]
    fn default_levels_can_be_changed_and_reverted() {
        let (control, _) = control();
        control.set_default_levels(LogLevels::at(LogLevel::Debug)).unwrap();
        assert_eq!(control.directives(), "debug");
        control.set_default_levels(LogLevels::default()).unwrap();
        assert_eq!(control.directives(), "info");
    }

    #[test]
    fn refresh_reads_logging_object() {
        let (control, _) = control();
        control.set_logger_levels("stale", LogLevels::at(LogLevel::Trace)).unwrap();
        let config = serde_json::json!({
            "logging": { "default_level": "warn", "loggers": { "MOUNT1": "debug" } }
        });
        control.refresh(Some(&config)).unwrap();
        assert_eq!(control.directives(), "warn,MOUNT1=debug");
        assert_eq!(control.default_levels().min_level_remote, LogLevel::Warn);

        control.refresh(None).unwrap();
        assert_eq!(control.directives(), "info");
    }

    #[test]
    fn bad_logger_names_are_rejected() {
        let (control, _) = control();
        assert!(control.set_logger_levels("", LogLevels::at(LogLevel::Debug)).is_err());
        assert!(control.set_logger_levels("a=b", LogLevels::at(LogLevel::Debug)).is_err());
        let config = serde_json::json!({ "logging": { "loggers": { "x y": "debug" } } });
        assert!(control.refresh(Some(&config)).is_err());
    }
}
