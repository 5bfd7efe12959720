use std::future::Future;
use std::pin::Pin;

use crate::config_source::ConfigBlob;
use crate::error::ContainerError;
use crate::types::Reference;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The local object implementing a component, before the object adapter
/// makes it remotely callable.
///
/// Uses Pin<Box<dyn Future>> for dyn-compatibility.
pub trait Servant: Send + Sync {
    /// Interface identifier of the component (e.g. "IDL:demo/Lamp:1.0").
    fn interface(&self) -> &str;

    /// Apply configuration-database data. Called once, before the servant is
    /// handed to the adapter.
    fn initialize(&self, _config: &ConfigBlob) -> Result<(), String> {
        Ok(())
    }

    /// Release resources. Called when the adapter etherealizes the servant.
    fn cleanup(&self) {}

    /// Invoke a named operation with a JSON payload.
    fn invoke<'a>(
        &'a self,
        operation: &'a str,
        _payload: serde_json::Value,
    ) -> BoxFuture<'a, Result<serde_json::Value, String>> {
        Box::pin(async move { Err(format!("operation '{operation}' is not supported")) })
    }
}

/// A typed view over a remote reference.
pub trait Capability: Sized {
    /// Interface identifier a reference must carry to be narrowed to `Self`.
    const INTERFACE: &'static str;

    fn from_reference(reference: Reference) -> Self;
}

/// Check a reference's interface and wrap it as `T`.
pub fn narrow<T: Capability>(reference: Reference) -> Result<T, ContainerError> {
    if reference.interface == T::INTERFACE {
        Ok(T::from_reference(reference))
    } else {
        Err(ContainerError::NarrowingFailed {
            expected: T::INTERFACE.to_string(),
            actual: reference.interface,
        })
    }
}
