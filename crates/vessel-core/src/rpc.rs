use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::container::Container;
use crate::error::ContainerError;
use crate::logging::LogLevels;
use crate::types::{ComponentInfo, Handle, MessageType, Reference};

/// Operations the container serves, independent of any transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    ActivateComponent {
        handle: Handle,
        name: String,
        executable: String,
        #[serde(rename = "type")]
        component_type: String,
    },
    DeactivateComponents {
        handles: Vec<Handle>,
    },
    RestartComponent {
        handle: Handle,
    },
    GetComponentInfo {
        #[serde(default)]
        handles: Vec<Handle>,
    },
    SetComponentShutdownOrder {
        handles: Vec<Handle>,
    },
    /// `action << 8 | exit status`
    Shutdown {
        action: u32,
    },
    Ping,
    Authenticate {
        challenge: String,
    },
    Message {
        severity: MessageType,
        text: String,
    },
    ComponentsAvailable {
        components: Vec<ComponentInfo>,
    },
    ComponentsUnavailable {
        names: Vec<String>,
    },
    Name,
    Disconnect,
    GetDefaultLogLevels,
    SetDefaultLogLevels {
        levels: LogLevels,
    },
    GetLoggerNames,
    GetLoggerLevels {
        logger: String,
    },
    SetLoggerLevels {
        logger: String,
        levels: LogLevels,
    },
    RefreshLoggingConfig,
    InvokeComponent {
        handle: Handle,
        operation: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
}

impl RpcRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            RpcRequest::ActivateComponent { .. } => "activate_component",
            RpcRequest::DeactivateComponents { .. } => "deactivate_components",
            RpcRequest::RestartComponent { .. } => "restart_component",
            RpcRequest::GetComponentInfo { .. } => "get_component_info",
            RpcRequest::SetComponentShutdownOrder { .. } => "set_component_shutdown_order",
            RpcRequest::Shutdown { .. } => "shutdown",
            RpcRequest::Ping => "ping",
            RpcRequest::Authenticate { .. } => "authenticate",
            RpcRequest::Message { .. } => "message",
            RpcRequest::ComponentsAvailable { .. } => "components_available",
            RpcRequest::ComponentsUnavailable { .. } => "components_unavailable",
            RpcRequest::Name => "name",
            RpcRequest::Disconnect => "disconnect",
            RpcRequest::GetDefaultLogLevels => "get_default_log_levels",
            RpcRequest::SetDefaultLogLevels { .. } => "set_default_log_levels",
            RpcRequest::GetLoggerNames => "get_logger_names",
            RpcRequest::GetLoggerLevels { .. } => "get_logger_levels",
            RpcRequest::SetLoggerLevels { .. } => "set_logger_levels",
            RpcRequest::RefreshLoggingConfig => "refresh_logging_config",
            RpcRequest::InvokeComponent { .. } => "invoke_component",
        }
    }

    /// Still answered while the container is shutting down.
    fn allowed_while_stopping(&self) -> bool {
        matches!(
            self,
            RpcRequest::Ping
                | RpcRequest::Name
                | RpcRequest::Shutdown { .. }
                | RpcRequest::Disconnect
                | RpcRequest::GetComponentInfo { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RpcResponse {
    Done,
    Component(ComponentInfo),
    Components(Vec<ComponentInfo>),
    Reference(Reference),
    Bool(bool),
    Text(String),
    LogLevels(LogLevels),
    Names(Vec<String>),
    Value(serde_json::Value),
}

pub(crate) struct Envelope {
    request: RpcRequest,
    reply: oneshot::Sender<Result<RpcResponse, ContainerError>>,
}

/// Cloneable sender side of the serving pool.
#[derive(Clone)]
pub struct RpcClient {
    tx: mpsc::Sender<Envelope>,
}

impl RpcClient {
    pub(crate) fn new(tx: mpsc::Sender<Envelope>) -> Self {
        Self { tx }
    }

    /// Queue `request` and wait for its answer. Requests queued before
    /// `run` starts are served once the pool is up.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, ContainerError> {
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(Envelope { request, reply })
            .await
            .map_err(|_| ContainerError::ShuttingDown)?;
        answer
            .await
            .map_err(|_| ContainerError::System("request dropped by serving pool".into()))?
    }
}

/// Fixed set of workers draining one request queue.
pub(crate) struct RpcPool {
    workers: Vec<JoinHandle<()>>,
    stop: watch::Sender<bool>,
}

impl RpcPool {
    pub(crate) fn spawn(
        container: Arc<Container>,
        receiver: mpsc::Receiver<Envelope>,
        threads: usize,
    ) -> Self {
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let (stop, _) = watch::channel(false);
        let workers = (0..threads.max(1))
            .map(|worker| {
                let container = container.clone();
                let receiver = receiver.clone();
                let mut stop = stop.subscribe();
                tokio::spawn(async move {
                    loop {
                        let envelope = {
                            let mut receiver = receiver.lock().await;
                            tokio::select! {
                                envelope = receiver.recv() => envelope,
                                _ = stop.wait_for(|stopped| *stopped) => None,
                            }
                        };
                        let Some(Envelope { request, reply }) = envelope else {
                            break;
                        };
                        let result = dispatch(container.clone(), request).await;
                        // The caller may have given up waiting.
                        let _ = reply.send(result);
                    }
                    tracing::debug!(worker, "RPC worker stopped");
                })
            })
            .collect();
        tracing::info!(threads = threads.max(1), "RPC serving pool started");
        Self { workers, stop }
    }

    /// Stop the workers. Requests still queued are dropped; their callers get
    /// a system error.
    pub(crate) async fn stop(self) {
        self.stop.send_replace(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "RPC worker ended abnormally");
            }
        }
    }
}

/// Run one request on its own task so a panic in component code surfaces
/// as a system error instead of killing the worker.
async fn dispatch(container: Arc<Container>, request: RpcRequest) -> Result<RpcResponse, ContainerError> {
    let operation = request.operation();
    let result = match tokio::spawn(async move { container.handle_request(request).await }).await {
        Ok(result) => result,
        Err(e) => Err(ContainerError::System(format!("{operation} aborted: {e}"))),
    };
    if let Err(e) = &result {
        tracing::warn!(operation, error = %e, "Request failed");
    }
    result
}

/// Run a blocking engine call off the async workers.
async fn blocking<T: Send + 'static>(
    operation: &'static str,
    container: &Arc<Container>,
    f: impl FnOnce(&Container) -> T + Send + 'static,
) -> Result<T, ContainerError> {
    let container = container.clone();
    tokio::task::spawn_blocking(move || f(&container))
        .await
        .map_err(|e| ContainerError::System(format!("{operation} aborted: {e}")))
}

impl Container {
    /// Serve one request directly, without the pool.
    pub async fn handle_request(self: &Arc<Self>, request: RpcRequest) -> Result<RpcResponse, ContainerError> {
        let operation = request.operation();
        if !request.allowed_while_stopping() {
            self.ensure_accepting(operation)?;
        }
        tracing::debug!(operation, "Handling request");

        match request {
            RpcRequest::ActivateComponent {
                handle,
                name,
                executable,
                component_type,
            } => blocking(operation, self, move |c| {
                c.activate(handle, &name, &executable, &component_type)
            })
            .await?
            .map(RpcResponse::Component),
            RpcRequest::DeactivateComponents { handles } => {
                blocking(operation, self, move |c| c.deactivate(&handles)).await?;
                Ok(RpcResponse::Done)
            }
            RpcRequest::RestartComponent { handle } => blocking(operation, self, move |c| c.restart(handle))
                .await?
                .map(RpcResponse::Reference),
            RpcRequest::GetComponentInfo { handles } => {
                Ok(RpcResponse::Components(self.component_info(&handles)))
            }
            RpcRequest::SetComponentShutdownOrder { handles } => {
                self.set_shutdown_order(handles);
                Ok(RpcResponse::Done)
            }
            RpcRequest::Shutdown { action } => self.shutdown(action).map(|()| RpcResponse::Done),
            RpcRequest::Ping => Ok(RpcResponse::Bool(self.ping())),
            RpcRequest::Authenticate { challenge } => Ok(RpcResponse::Text(self.authenticate(&challenge))),
            RpcRequest::Message { severity, text } => {
                self.message(severity, &text);
                Ok(RpcResponse::Done)
            }
            RpcRequest::ComponentsAvailable { components } => {
                self.components_available(components);
                Ok(RpcResponse::Done)
            }
            RpcRequest::ComponentsUnavailable { names } => {
                self.components_unavailable(names);
                Ok(RpcResponse::Done)
            }
            RpcRequest::Name => Ok(RpcResponse::Text(self.name())),
            RpcRequest::Disconnect => self.disconnect().map(|()| RpcResponse::Done),
            RpcRequest::GetDefaultLogLevels => Ok(RpcResponse::LogLevels(self.log_control.default_levels())),
            RpcRequest::SetDefaultLogLevels { levels } => self
                .log_control
                .set_default_levels(levels)
                .map(|()| RpcResponse::Done),
            RpcRequest::GetLoggerNames => Ok(RpcResponse::Names(self.log_control.logger_names())),
            RpcRequest::GetLoggerLevels { logger } => {
                Ok(RpcResponse::LogLevels(self.log_control.logger_levels(&logger)))
            }
            RpcRequest::SetLoggerLevels { logger, levels } => self
                .log_control
                .set_logger_levels(&logger, levels)
                .map(|()| RpcResponse::Done),
            RpcRequest::RefreshLoggingConfig => self.refresh_logging_config().map(|()| RpcResponse::Done),
            RpcRequest::InvokeComponent {
                handle,
                operation,
                payload,
            } => self
                .invoke_component(handle, &operation, payload)
                .await
                .map(RpcResponse::Value),
        }
    }
}
