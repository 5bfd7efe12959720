use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ContainerError;

/// Manager-assigned identifier of a container or of one live component.
///
/// Zero means "not assigned yet".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u32);

impl Handle {
    pub const UNASSIGNED: Handle = Handle(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Handle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// A remotely callable reference issued by an object adapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// Adapter-unique object id (e.g. "CONTROL/vessel-1/LAMP1")
    pub object_id: String,
    /// Interface the referenced object implements
    pub interface: String,
    /// Where the object is served from (e.g. "vessel://vessel-1")
    pub endpoint: String,
}

/// Description of one active component, as reported to the Manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub handle: Handle,
    pub reference: Reference,
    /// Handle of the container hosting the component
    pub container: Handle,
}

/// Lifecycle state of the container process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ContainerState {
    New,
    Initialized,
    Connected,
    Running,
    Disconnecting,
    Terminated,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerState::New => write!(f, "new"),
            ContainerState::Initialized => write!(f, "initialized"),
            ContainerState::Connected => write!(f, "connected"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Disconnecting => write!(f, "disconnecting"),
            ContainerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// What the process should do once teardown completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownAction {
    Reload,
    Reboot,
    Exit,
}

/// A decoded `shutdown` request: action in bits 8..15, exit status in bits 0..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub action: ShutdownAction,
    pub exit_status: u8,
}

impl ShutdownRequest {
    pub const RELOAD: u32 = 0;
    pub const REBOOT: u32 = 1;
    pub const EXIT: u32 = 2;

    pub fn decode(code: u32) -> Result<Self, ContainerError> {
        let action = match (code >> 8) & 0xff {
            Self::RELOAD => ShutdownAction::Reload,
            Self::REBOOT => ShutdownAction::Reboot,
            Self::EXIT => ShutdownAction::Exit,
            other => {
                return Err(ContainerError::InvalidArgument(format!(
                    "unknown shutdown action {other}"
                )));
            }
        };
        Ok(Self {
            action,
            exit_status: (code & 0xff) as u8,
        })
    }

    pub fn encode(self) -> u32 {
        let action = match self.action {
            ShutdownAction::Reload => Self::RELOAD,
            ShutdownAction::Reboot => Self::REBOOT,
            ShutdownAction::Exit => Self::EXIT,
        };
        (action << 8) | u32::from(self.exit_status)
    }

    pub fn exit(exit_status: u8) -> Self {
        Self {
            action: ShutdownAction::Exit,
            exit_status,
        }
    }
}

/// Severity of a textual message pushed by the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Error,
    Information,
}

/// Availability change of components this container uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AvailabilityEvent {
    Available(Vec<ComponentInfo>),
    Unavailable(Vec<String>),
}
