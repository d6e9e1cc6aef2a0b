//! MCP server implementation using rmcp.
//!
//! Exposes the host application as MCP tools. Every tool is a thin call
//! through the connection manager; bridge failures become tool errors so the
//! client can tell a busy host from a missing one.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

use crate::connection::HostConnection;
use crate::error::{BridgeError, Result};
use crate::transport::Message;

/// MCP server forwarding tool calls to the host.
#[derive(Clone)]
pub struct BridgeServer {
    connection: Arc<HostConnection>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the `execute_command` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    /// Source code to run inside the host application.
    #[schemars(description = "Source code to run inside the host application")]
    pub code: String,
}

/// Parameters for the `execute_file` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteFileParams {
    /// Path of a script file, as seen by the host application.
    #[schemars(description = "Path of a script file, as seen by the host application")]
    pub file: String,
}

#[tool_router]
impl BridgeServer {
    pub fn new(connection: Arc<HostConnection>) -> Self {
        Self {
            connection,
            tool_router: Self::tool_router(),
        }
    }

    /// Run code in the host application.
    #[tool(description = "Execute code inside the connected host application and return its output")]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(code_len = params.code.len(), "Executing command");
        let response = self.connection.execute_code(params.code, None).await;
        Ok(into_tool_result(&response))
    }

    /// Run a script file in the host application.
    #[tool(description = "Execute a script file inside the connected host application")]
    async fn execute_file(
        &self,
        Parameters(params): Parameters<ExecuteFileParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(file = %params.file, "Executing file");
        let response = self.connection.execute_file(params.file, None).await;
        Ok(into_tool_result(&response))
    }

    /// Report the host's execution state.
    #[tool(description = "Get the current execution state of the host application")]
    async fn get_editor_state(&self) -> Result<CallToolResult, McpError> {
        let bridge = self.connection.state();
        let response = self.connection.get_state(None).await;
        let (is_error, text) = render_response(&response);
        log_failure(&response);
        Ok(tool_result(is_error, format!("Bridge connection: {bridge}\n{text}")))
    }
}

#[tool_handler]
impl ServerHandler for BridgeServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "editor-bridge".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Run code inside a host application reached over a local bridge at {}.\n\
                 \n\
                 Tools:\n\
                 - execute_command: run source code\n\
                 - execute_file: run a script file by path\n\
                 - get_editor_state: check whether the host is idle or busy\n\
                 \n\
                 If the host is not connected, the bridge reconnects automatically; retry shortly.",
                self.connection.addr()
            )),
        }
    }
}

/// Render a bridge response as tool output.
///
/// Returns `(is_error, text)`.
pub fn render_response(response: &Result<Message>) -> (bool, String) {
    match response {
        Ok(Message::Result {
            success,
            output,
            error,
            logs,
            ..
        }) => {
            let mut text = if *success {
                output
                    .as_deref()
                    .filter(|o| !o.is_empty())
                    .unwrap_or("Execution completed successfully.")
                    .to_string()
            } else {
                format!("Error: {}", error.as_deref().unwrap_or("unknown error"))
            };
            if let Some(logs) = logs.as_deref().filter(|l| !l.is_empty()) {
                text.push_str("\n\nCaptured Logs:\n");
                text.push_str(logs);
            }
            (!*success, text)
        }
        Ok(Message::State {
            state, timestamp, ..
        }) => (false, format!("Host state: {state} (as of {timestamp:.3})")),
        Ok(Message::Pong { state, .. }) => (false, format!("Host is alive ({state})")),
        Ok(Message::Error { error, .. }) => (true, format!("Host rejected request: {error}")),
        Ok(other) => (true, format!("Unexpected response type: {}", other.kind())),
        Err(BridgeError::NotConnected) => (
            true,
            "Host application is not connected. Make sure it is running with the bridge \
             forwarder started; the connection is retried automatically."
                .to_string(),
        ),
        Err(BridgeError::RequestTimeout { timeout, .. }) => (
            true,
            format!(
                "Request timed out after {:.1}s. The host is still connected but busy; \
                 the work may still complete.",
                timeout.as_secs_f64()
            ),
        ),
        Err(BridgeError::ConnectionLost) => (
            true,
            "Connection to the host was lost before a response arrived. \
             The host may have crashed or been closed."
                .to_string(),
        ),
        Err(e) => (true, format!("Bridge error: {e}")),
    }
}

fn into_tool_result(response: &Result<Message>) -> CallToolResult {
    let (is_error, text) = render_response(response);
    log_failure(response);
    tool_result(is_error, text)
}

fn log_failure(response: &Result<Message>) {
    if let Err(e) = response {
        warn!(error = %e, "Bridge request failed");
    }
}

fn tool_result(is_error: bool, text: String) -> CallToolResult {
    if is_error {
        CallToolResult::error(vec![Content::text(text)])
    } else {
        CallToolResult::success(vec![Content::text(text)])
    }
}

/// Serve the bridge over stdio until the client disconnects.
pub async fn serve_stdio(connection: Arc<HostConnection>) -> anyhow::Result<()> {
    let server = BridgeServer::new(connection);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
