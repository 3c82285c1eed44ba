use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use reqwest::{header, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use url::Url;

use crate::{error::AppError, mcp::oauth::OAuthClientProvider, PKG_NAME};

/// Protocol revision sent on every request, per the Streamable HTTP spec
const MCP_PROTOCOL_VERSION: &str = "2025-03-26";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum McpConnectionState {
    Connecting,
    Authenticating,
    Ready,
    Failed,
}

pub(crate) enum InitOutcome {
    Ready,
    /// The server wants OAuth; the provider has produced an authorization URL
    AuthorizationPending,
}

enum TransportError {
    Unauthorized,
    Other(anyhow::Error),
}

/// JSON-RPC over HTTP POST, per the MCP Streamable HTTP transport. Responses
/// arrive either as a direct JSON body or as an SSE stream carrying JSON-RPC
/// messages; `202 Accepted` acknowledges notifications. The session id the
/// server hands back on `initialize` is echoed on every later request.
struct HttpTransport {
    http: reqwest::Client,
    endpoint: Url,
    session_id: Option<String>,
    next_id: u64,
}

impl HttpTransport {
    fn new(endpoint: Url) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .expect("default reqwest client should build"),
            endpoint,
            session_id: None,
            next_id: 0,
        }
    }

    async fn post(
        &mut self,
        message: Value,
        bearer: Option<&str>,
        expect_id: Option<u64>,
    ) -> Result<Value, TransportError> {
        let mut request = self
            .http
            .post(self.endpoint.clone())
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream")
            .header("mcp-protocol-version", MCP_PROTOCOL_VERSION)
            .json(&message);
        if let Some(session) = &self.session_id {
            request = request.header("mcp-session-id", session.clone());
        }
        if let Some(token) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Other(anyhow!("MCP request failed: {e}")))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }
        if response.status() == StatusCode::ACCEPTED {
            return Ok(Value::Null);
        }
        if !response.status().is_success() {
            return Err(TransportError::Other(anyhow!(
                "MCP server answered with status {}",
                response.status()
            )));
        }

        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_owned());
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Other(anyhow!("failed to read MCP response: {e}")))?;

        let message = if is_sse {
            let Some(expect_id) = expect_id else {
                return Ok(Value::Null);
            };
            extract_sse_response(&body, expect_id).ok_or_else(|| {
                TransportError::Other(anyhow!("SSE stream ended without a response"))
            })?
        } else {
            serde_json::from_str(&body)
                .map_err(|e| TransportError::Other(anyhow!("invalid MCP response body: {e}")))?
        };

        if let Some(error) = message.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let text = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(TransportError::Other(anyhow!("MCP error {code}: {text}")));
        }
        Ok(message.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn rpc(
        &mut self,
        method: &str,
        params: Value,
        bearer: Option<&str>,
    ) -> Result<Value, TransportError> {
        self.next_id += 1;
        let id = self.next_id;
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.post(message, bearer, Some(id)).await
    }

    async fn notify(&mut self, method: &str, bearer: Option<&str>) -> Result<(), TransportError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        self.post(message, bearer, None).await.map(|_| ())
    }

    /// Best-effort session teardown, spec-required when a session is active
    async fn close(&mut self) {
        if let Some(session) = self.session_id.take() {
            let _ = self
                .http
                .delete(self.endpoint.clone())
                .header("mcp-session-id", session)
                .send()
                .await;
        }
    }
}

/// Scan an SSE body for the JSON-RPC response with the given id
fn extract_sse_response(body: &str, expect_id: u64) -> Option<Value> {
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(message) = serde_json::from_str::<Value>(data.trim()) else {
            continue;
        };
        if message.get("id").and_then(Value::as_u64) == Some(expect_id)
            && (message.get("result").is_some() || message.get("error").is_some())
        {
            return Some(message);
        }
    }
    None
}

/// A live (or failed) binding to one remote MCP server, with caches of its
/// discovered tools, prompts, and resources
pub struct McpConnection {
    pub id: String,
    pub url: String,
    state: McpConnectionState,
    pub(crate) auth: Option<Arc<OAuthClientProvider>>,
    transport: HttpTransport,
    pub tools: Vec<Value>,
    pub prompts: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
}

impl McpConnection {
    pub(crate) fn new(
        id: String,
        url: &str,
        auth: Option<Arc<OAuthClientProvider>>,
    ) -> Result<Self, AppError> {
        let endpoint = Url::parse(url)
            .map_err(|e| AppError::mcp(format!("invalid MCP server url {url:?}: {e}")))?;
        Ok(Self {
            id,
            url: url.to_owned(),
            state: McpConnectionState::Connecting,
            auth,
            transport: HttpTransport::new(endpoint),
            tools: Vec::new(),
            prompts: Vec::new(),
            resources: Vec::new(),
            resource_templates: Vec::new(),
        })
    }

    pub fn connection_state(&self) -> McpConnectionState {
        self.state
    }

    fn bearer(&self) -> Option<String> {
        self.auth.as_ref().and_then(|auth| auth.bearer())
    }

    /// Establish the MCP session. With an `oauth_code` the provider first
    /// exchanges it for tokens. A 401 from the server starts the
    /// authorization flow when a provider is present; any other failure
    /// leaves the connection `failed` and re-raises.
    pub(crate) async fn init(&mut self, oauth_code: Option<String>) -> Result<InitOutcome, AppError> {
        self.state = McpConnectionState::Connecting;

        if let Some(code) = oauth_code {
            let Some(auth) = self.auth.clone() else {
                self.state = McpConnectionState::Failed;
                return Err(AppError::mcp(
                    "Trying to finalize authentication for a server connection without an authProvider",
                ));
            };
            if let Err(e) = auth.finish_authorization(&self.url, &code).await {
                self.state = McpConnectionState::Failed;
                return Err(e);
            }
        }

        let bearer = self.bearer();
        let handshake = self
            .transport
            .rpc(
                "initialize",
                json!({
                    "protocolVersion": MCP_PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": PKG_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
                bearer.as_deref(),
            )
            .await;

        match handshake {
            Ok(_) => {}
            Err(TransportError::Unauthorized) => {
                let Some(auth) = self.auth.clone() else {
                    self.state = McpConnectionState::Failed;
                    return Err(AppError::mcp(
                        "server requires authorization but no auth provider was supplied",
                    ));
                };
                match auth.begin_authorization(&self.url).await {
                    Ok(_) => {
                        self.state = McpConnectionState::Authenticating;
                        return Ok(InitOutcome::AuthorizationPending);
                    }
                    Err(e) => {
                        self.state = McpConnectionState::Failed;
                        return Err(e);
                    }
                }
            }
            Err(TransportError::Other(e)) => {
                self.state = McpConnectionState::Failed;
                return Err(AppError::mcp(e.to_string()));
            }
        }

        if let Err(e) = self.transport.notify("notifications/initialized", bearer.as_deref()).await
        {
            if let TransportError::Other(e) = e {
                debug!(server = %self.id, error = %e, "initialized notification not accepted");
            }
        }

        self.discover().await;
        self.state = McpConnectionState::Ready;
        Ok(InitOutcome::Ready)
    }

    /// Populate the discovery caches. Servers are free to not implement any
    /// given list; absences are cached as empty.
    async fn discover(&mut self) {
        let bearer = self.bearer();
        self.tools = self.fetch_list("tools/list", "tools", bearer.as_deref()).await;
        self.prompts = self
            .fetch_list("prompts/list", "prompts", bearer.as_deref())
            .await;
        self.resources = self
            .fetch_list("resources/list", "resources", bearer.as_deref())
            .await;
        self.resource_templates = self
            .fetch_list(
                "resources/templates/list",
                "resourceTemplates",
                bearer.as_deref(),
            )
            .await;
    }

    async fn fetch_list(&mut self, method: &str, key: &str, bearer: Option<&str>) -> Vec<Value> {
        match self.transport.rpc(method, json!({}), bearer).await {
            Ok(result) => result
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
            Err(TransportError::Unauthorized) => {
                warn!(server = %self.id, method, "listing rejected as unauthorized");
                Vec::new()
            }
            Err(TransportError::Other(e)) => {
                debug!(server = %self.id, method, error = %e, "server does not expose this list");
                Vec::new()
            }
        }
    }

    fn map_error(&self, e: TransportError) -> AppError {
        match e {
            TransportError::Unauthorized => {
                AppError::mcp(format!("server {} rejected the request as unauthorized", self.id))
            }
            TransportError::Other(e) => AppError::mcp(e.to_string()),
        }
    }

    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<Value, AppError> {
        let bearer = self.bearer();
        self.transport
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": arguments }),
                bearer.as_deref(),
            )
            .await
            .map_err(|e| self.map_error(e))
    }

    pub async fn read_resource(&mut self, uri: &str) -> Result<Value, AppError> {
        let bearer = self.bearer();
        self.transport
            .rpc("resources/read", json!({ "uri": uri }), bearer.as_deref())
            .await
            .map_err(|e| self.map_error(e))
    }

    pub async fn get_prompt(
        &mut self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, AppError> {
        let bearer = self.bearer();
        let mut params = json!({ "name": name });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        self.transport
            .rpc("prompts/get", params, bearer.as_deref())
            .await
            .map_err(|e| self.map_error(e))
    }

    pub(crate) async fn close(&mut self) {
        self.transport.close().await;
        self.state = McpConnectionState::Failed;
    }

    /// Test seam: a connection in a chosen state with canned discovery data
    #[cfg(test)]
    pub(crate) fn stub(
        id: &str,
        url: &str,
        state: McpConnectionState,
        tools: Vec<Value>,
        auth: Option<Arc<OAuthClientProvider>>,
    ) -> Self {
        let mut conn = Self::new(id.to_owned(), url, auth).unwrap();
        conn.state = state;
        conn.tools = tools;
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_bodies_yield_the_matching_response() {
        let body = concat!(
            "event: message\n",
            "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n",
            "\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":2,\"result\":{\"ok\":true}}\n",
        );
        let response = extract_sse_response(body, 2).unwrap();
        assert_eq!(response["result"]["ok"], json!(true));
        assert!(extract_sse_response(body, 3).is_none());
    }

    #[test]
    fn bad_urls_are_rejected_up_front() {
        assert!(McpConnection::new("x".into(), "not a url", None).is_err());
    }
}
