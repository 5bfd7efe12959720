use rmcp::{
    ErrorData as McpError, RoleServer, ServerHandler,
    model::{
        CallToolRequestParams, CallToolResult, Content, JsonObject, ListToolsResult,
        PaginatedRequestParams, ServerCapabilities, ServerInfo, Tool,
    },
    service::RequestContext,
};
use tokio::sync::watch;
use vessel_core::{RpcClient, RpcRequest};

/// MCP server exposing the container's RPC surface as tools.
///
/// Every tool is one container operation: the tool name is the operation
/// name and the arguments are its fields. Calls go through the serving pool
/// of whichever container currently occupies the slot, so a reload swaps
/// the target without restarting the transport.
#[derive(Clone)]
pub struct ContainerTools {
    current: watch::Receiver<Option<RpcClient>>,
}

impl ContainerTools {
    pub fn new(current: watch::Receiver<Option<RpcClient>>) -> Self {
        Self { current }
    }

    /// Run one tool call against the current container.
    pub async fn dispatch(
        &self,
        name: &str,
        arguments: Option<JsonObject>,
    ) -> Result<CallToolResult, McpError> {
        let request = parse_call(name, arguments)?;
        let Some(client) = self.current.borrow().clone() else {
            return Ok(error_result("container is not connected yet"));
        };

        tracing::debug!(operation = request.operation(), "Dispatching MCP tool call");
        match client.call(request).await {
            Ok(response) => {
                let body = serde_json::to_string(&response)
                    .map_err(|e| McpError::internal_error(format!("Encoding reply failed: {e}"), None))?;
                Ok(make_tool_result(vec![Content::text(body)], false))
            }
            Err(e) => {
                tracing::warn!(tool = name, error = %e, "Container operation failed");
                Ok(error_result(&e.to_string()))
            }
        }
    }
}

/// Turn a tool call into the container request it names.
fn parse_call(name: &str, arguments: Option<JsonObject>) -> Result<RpcRequest, McpError> {
    if !TOOLS.iter().any(|(tool, _, _)| *tool == name) {
        return Err(McpError::invalid_params(format!("Unknown tool: {name}"), None));
    }
    let mut fields = arguments.unwrap_or_default();
    fields.insert("op".into(), serde_json::Value::String(name.to_string()));
    serde_json::from_value(serde_json::Value::Object(fields))
        .map_err(|e| McpError::invalid_params(format!("Invalid arguments for {name}: {e}"), None))
}

fn error_result(message: &str) -> CallToolResult {
    let body = serde_json::json!({ "status": "error", "message": message });
    make_tool_result(vec![Content::text(body.to_string())], true)
}

fn make_tool_result(content: Vec<Content>, is_error: bool) -> CallToolResult {
    CallToolResult {
        content,
        structured_content: None,
        is_error: Some(is_error),
        meta: None,
    }
}

fn handles_schema(description: &str) -> serde_json::Value {
    serde_json::json!({
        "type": "array",
        "items": { "type": "integer", "minimum": 1 },
        "description": description
    })
}

fn levels_schema() -> serde_json::Value {
    let level = serde_json::json!({
        "type": "string",
        "enum": ["trace", "debug", "info", "warn", "error", "off"]
    });
    serde_json::json!({
        "type": "object",
        "properties": {
            "use_default": { "type": "boolean" },
            "min_level_local": level,
            "min_level_remote": level
        },
        "required": ["use_default", "min_level_local", "min_level_remote"]
    })
}

type ToolSpec = (&'static str, &'static str, fn() -> serde_json::Value);

const TOOLS: &[ToolSpec] = &[
    ("activate_component", "Load, construct, configure and register one component.", || {
        serde_json::json!({
            "type": "object",
            "properties": {
                "handle": { "type": "integer", "minimum": 1 },
                "name": { "type": "string" },
                "executable": { "type": "string", "description": "Library path" },
                "type": { "type": "string", "description": "Interface identifier" }
            },
            "required": ["handle", "name", "executable", "type"]
        })
    }),
    ("deactivate_components", "Tear down the given components in shutdown order.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "handles": handles_schema("Handles to deactivate") },
            "required": ["handles"]
        })
    }),
    ("restart_component", "Replace a component's servant, keeping its handle and name.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "handle": { "type": "integer", "minimum": 1 } },
            "required": ["handle"]
        })
    }),
    ("get_component_info", "Describe active components; no handles means all.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "handles": handles_schema("Handles to describe") }
        })
    }),
    ("set_component_shutdown_order", "Handles torn down first, in this order.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "handles": handles_schema("Priority order") },
            "required": ["handles"]
        })
    }),
    ("shutdown", "Request teardown. Action in bits 8..15 (0 reload, 1 reboot, 2 exit), exit status in bits 0..7.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "action": { "type": "integer", "minimum": 0 } },
            "required": ["action"]
        })
    }),
    ("ping", "Liveness probe.", empty_schema),
    ("authenticate", "Answer a Manager login challenge.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "challenge": { "type": "string" } },
            "required": ["challenge"]
        })
    }),
    ("message", "Deliver a textual message from the Manager.", || {
        serde_json::json!({
            "type": "object",
            "properties": {
                "severity": { "type": "string", "enum": ["error", "information"] },
                "text": { "type": "string" }
            },
            "required": ["severity", "text"]
        })
    }),
    ("components_available", "Announce components that became available.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "components": { "type": "array", "items": { "type": "object" } } },
            "required": ["components"]
        })
    }),
    ("components_unavailable", "Announce components that went away.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "names": { "type": "array", "items": { "type": "string" } } },
            "required": ["names"]
        })
    }),
    ("name", "Container name.", empty_schema),
    ("disconnect", "The Manager is going away; exit with status 0.", empty_schema),
    ("get_default_log_levels", "Default log levels.", empty_schema),
    ("set_default_log_levels", "Change the default log levels.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "levels": levels_schema() },
            "required": ["levels"]
        })
    }),
    ("get_logger_names", "Loggers with their own levels.", empty_schema),
    ("get_logger_levels", "Levels of one logger.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "logger": { "type": "string" } },
            "required": ["logger"]
        })
    }),
    ("set_logger_levels", "Override the levels of one logger.", || {
        serde_json::json!({
            "type": "object",
            "properties": { "logger": { "type": "string" }, "levels": levels_schema() },
            "required": ["logger", "levels"]
        })
    }),
    ("refresh_logging_config", "Reload log levels from the configuration database.", empty_schema),
    ("invoke_component", "Call an operation on an active component.", || {
        serde_json::json!({
            "type": "object",
            "properties": {
                "handle": { "type": "integer", "minimum": 1 },
                "operation": { "type": "string" },
                "payload": { "description": "Operation input" }
            },
            "required": ["handle", "operation"]
        })
    }),
];

fn empty_schema() -> serde_json::Value {
    serde_json::json!({ "type": "object", "properties": {} })
}

fn tool_list() -> Vec<Tool> {
    TOOLS
        .iter()
        .map(|(name, description, schema)| Tool {
            name: (*name).into(),
            title: None,
            description: Some((*description).into()),
            input_schema: schema().as_object().cloned().unwrap_or_default().into(),
            output_schema: None,
            annotations: None,
            execution: None,
            icons: None,
            meta: None,
        })
        .collect()
}

impl ServerHandler for ContainerTools {
    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult::with_all_items(tool_list()))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        tracing::info!(tool = %request.name, "MCP tool call");
        self.dispatch(&request.name, request.arguments).await
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: rmcp::model::Implementation::from_build_env(),
            instructions: Some("vessel component container".into()),
        }
    }
}
