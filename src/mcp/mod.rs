/// A single server connection and its Streamable-HTTP transport.
pub mod connection;
/// The OAuth authorization-code + PKCE client provider.
pub mod oauth;

use std::{collections::HashMap, sync::Arc};

use axum::http::{Method, Uri};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;
use url::Url;

use crate::{error::AppError, storage::McpServerRecord, utils::random_token};
pub use connection::{McpConnection, McpConnectionState};
use connection::InitOutcome;
pub use oauth::OAuthClientProvider;

const SERVER_ID_LEN: usize = 8;

/// Options for [`McpClientManager::connect`]
#[derive(Default)]
pub struct ConnectOptions {
    /// Runs the OAuth flow when the server demands it. Without one, a
    /// protected server simply fails to connect.
    pub auth_provider: Option<Arc<OAuthClientProvider>>,
    /// Present when re-establishing a known server binding
    pub reconnect: Option<Reconnect>,
}

#[derive(Debug, Clone, Default)]
pub struct Reconnect {
    /// Reuse this server id instead of allocating one
    pub id: String,
    /// Plant this OAuth client id into the provider
    pub oauth_client_id: Option<String>,
    /// Finish the authorization flow with this code
    pub oauth_code: Option<String>,
}

/// What `connect` hands back. `auth_url` is present exactly when the server
/// wants the user sent through its authorization flow.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct McpConnectResult {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A definition suitable for handing to an LLM tool-calling layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AiToolDefinition {
    /// `tool_<serverId>_<name>`
    pub key: String,
    pub server_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

/// Aggregates connections to remote MCP servers: allocation of server ids,
/// OAuth callback demultiplexing, and discovery namespaced by server id.
///
/// The manager is owned by whoever drives it (typically one agent instance);
/// its maps are only ever touched from that owner's single-writer context.
pub struct McpClientManager {
    /// Insertion order is part of the contract: discovery unions preserve it
    connections: Vec<McpConnection>,
    /// Registered OAuth redirect URLs; append-only
    callback_urls: Vec<String>,
    warned_missing_auth: bool,
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        Self {
            connections: Vec::new(),
            callback_urls: Vec::new(),
            warned_missing_auth: false,
        }
    }

    pub fn connection(&self, id: &str) -> Option<&McpConnection> {
        self.connections.iter().find(|conn| conn.id == id)
    }

    fn connection_mut(&mut self, id: &str) -> Option<&mut McpConnection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &McpConnection> {
        self.connections.iter()
    }

    /// Open a connection to `url`. A fresh 8-character server id is
    /// allocated unless `reconnect` pins one. When the server demands
    /// authorization, the result carries the `auth_url` to send the user to
    /// and the redirect URL is registered for callback matching.
    pub async fn connect(
        &mut self,
        url: &str,
        options: ConnectOptions,
    ) -> Result<McpConnectResult, AppError> {
        let id = match &options.reconnect {
            Some(reconnect) => reconnect.id.clone(),
            None => random_token(SERVER_ID_LEN),
        };

        if let Some(auth) = &options.auth_provider {
            auth.set_server_id(&id);
            if let Some(client_id) = options
                .reconnect
                .as_ref()
                .and_then(|r| r.oauth_client_id.as_deref())
            {
                auth.set_client_id(client_id);
            }
        } else if !self.warned_missing_auth {
            warn!(
                server = %id,
                "MCP connection has no auth provider; servers requiring OAuth will not connect"
            );
            self.warned_missing_auth = true;
        }

        // A reconnect replaces the previous binding under the same id
        self.connections.retain(|conn| conn.id != id);

        let mut conn = McpConnection::new(id.clone(), url, options.auth_provider.clone())?;
        let oauth_code = options.reconnect.as_ref().and_then(|r| r.oauth_code.clone());
        let outcome = conn.init(oauth_code).await;
        let client_id = conn.auth.as_ref().and_then(|auth| auth.client_id());

        match outcome {
            Ok(InitOutcome::Ready) => {
                self.connections.push(conn);
                Ok(McpConnectResult {
                    id,
                    auth_url: None,
                    client_id: None,
                })
            }
            Ok(InitOutcome::AuthorizationPending) => {
                let auth = conn
                    .auth
                    .clone()
                    .expect("authorization cannot be pending without a provider");
                let auth_url = auth.auth_url().ok_or_else(|| {
                    AppError::mcp("auth provider did not produce an authorization URL")
                })?;
                let redirect_url = auth.redirect_url().ok_or_else(|| {
                    AppError::mcp("auth provider did not produce a redirect URL")
                })?;
                self.callback_urls.push(redirect_url);
                self.connections.push(conn);
                Ok(McpConnectResult {
                    id,
                    auth_url: Some(auth_url),
                    client_id,
                })
            }
            Err(e) => {
                // Keep the failed connection visible so its state can be
                // inspected
                self.connections.push(conn);
                Err(e)
            }
        }
    }

    /// Connect with a fresh OAuth provider rooted at `callback_url`
    pub async fn connect_with_callback(
        &mut self,
        url: &str,
        callback_url: &str,
    ) -> Result<McpConnectResult, AppError> {
        let provider = Arc::new(OAuthClientProvider::new(callback_url));
        self.connect(
            url,
            ConnectOptions {
                auth_provider: Some(provider),
                reconnect: None,
            },
        )
        .await
    }

    /// Re-establish a binding persisted in the `mcp_servers` table
    pub async fn reconnect_persisted(
        &mut self,
        record: &McpServerRecord,
    ) -> Result<McpConnectResult, AppError> {
        let provider = Arc::new(OAuthClientProvider::new(record.callback_url.clone()));
        self.connect(
            &record.server_url,
            ConnectOptions {
                auth_provider: Some(provider),
                reconnect: Some(Reconnect {
                    id: record.id.clone(),
                    oauth_client_id: record.client_id.clone(),
                    oauth_code: None,
                }),
            },
        )
        .await
    }

    /// True iff this is a GET whose URL falls under a registered OAuth
    /// callback. The request may carry the full public path or, when it
    /// arrives through an agent's router-rewritten tail, just the trailing
    /// `/callback/<server-id>` part; both shapes match.
    pub fn is_callback_request(&self, method: &Method, uri: &Uri) -> bool {
        let path = uri.path();
        method == Method::GET
            && self.callback_urls.iter().any(|cb| {
                let registered = callback_path(cb);
                path.starts_with(&registered) || (path.len() > 1 && registered.ends_with(path))
            })
    }

    /// Finish an OAuth flow from its redirect request. The trailing path
    /// segment names the server; `code` and `state` are required; the bound
    /// connection must currently be `authenticating`. On success the
    /// connection is re-established and must come up `ready`.
    pub async fn handle_callback_request(
        &mut self,
        method: &Method,
        uri: &Uri,
    ) -> Result<String, AppError> {
        if !self.is_callback_request(method, uri) {
            return Err(AppError::mcp(format!(
                "No callback URI match found for the request url: {uri}"
            )));
        }

        let params: HashMap<String, String> =
            url::form_urlencoded::parse(uri.query().unwrap_or("").as_bytes())
                .into_owned()
                .collect();
        let code = params
            .get("code")
            .ok_or_else(|| AppError::mcp("Unauthorized: no code provided"))?
            .clone();
        let state = params
            .get("state")
            .ok_or_else(|| AppError::mcp("Unauthorized: no state provided"))?
            .clone();

        let server_id = uri
            .path()
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();

        let conn = self
            .connection(&server_id)
            .ok_or_else(|| AppError::mcp(format!("Could not find serverId: {server_id}")))?;
        if conn.connection_state() != McpConnectionState::Authenticating {
            return Err(AppError::mcp(
                "Failed to authenticate: the client isn't in the `authenticating` state",
            ));
        }
        let Some(auth) = conn.auth.clone() else {
            return Err(AppError::mcp(
                "Trying to finalize authentication for a server connection without an authProvider",
            ));
        };
        let url = conn.url.clone();

        // The state parameter carries the OAuth client id; plant it before
        // reconnecting with the code
        auth.set_client_id(&state);
        auth.set_server_id(&server_id);

        self.connect(
            &url,
            ConnectOptions {
                auth_provider: Some(auth),
                reconnect: Some(Reconnect {
                    id: server_id.clone(),
                    oauth_client_id: Some(state),
                    oauth_code: Some(code),
                }),
            },
        )
        .await?;

        match self.connection(&server_id).map(|c| c.connection_state()) {
            Some(McpConnectionState::Ready) => Ok(server_id),
            _ => Err(AppError::mcp(
                "Failed to authenticate: client failed to initialize",
            )),
        }
    }

    // --- namespaced discovery ---

    /// All discovered tools across connections, each tagged with its
    /// `serverId`, in connection insertion order
    pub fn list_tools(&self) -> Vec<Value> {
        self.namespaced(|conn| &conn.tools)
    }

    pub fn list_prompts(&self) -> Vec<Value> {
        self.namespaced(|conn| &conn.prompts)
    }

    pub fn list_resources(&self) -> Vec<Value> {
        self.namespaced(|conn| &conn.resources)
    }

    pub fn list_resource_templates(&self) -> Vec<Value> {
        self.namespaced(|conn| &conn.resource_templates)
    }

    fn namespaced<F>(&self, items: F) -> Vec<Value>
    where
        F: Fn(&McpConnection) -> &Vec<Value>,
    {
        self.connections
            .iter()
            .flat_map(|conn| {
                items(conn).iter().map(|item| {
                    let mut item = item.clone();
                    if let Some(object) = item.as_object_mut() {
                        object.insert("serverId".to_owned(), json!(conn.id));
                    }
                    item
                })
            })
            .collect()
    }

    // --- invocation ---

    /// Call a tool on a server. The tool name may be namespaced as
    /// `<serverId>.<name>`; the prefix is stripped before forwarding.
    pub async fn call_tool(
        &mut self,
        server_id: &str,
        name: &str,
        arguments: Value,
    ) -> Result<Value, AppError> {
        let local = strip_server_prefix(server_id, name);
        let conn = self
            .connection_mut(server_id)
            .ok_or_else(|| AppError::mcp(format!("Could not find serverId: {server_id}")))?;
        conn.call_tool(local, arguments).await
    }

    pub async fn read_resource(&mut self, server_id: &str, uri: &str) -> Result<Value, AppError> {
        let conn = self
            .connection_mut(server_id)
            .ok_or_else(|| AppError::mcp(format!("Could not find serverId: {server_id}")))?;
        conn.read_resource(uri).await
    }

    pub async fn get_prompt(
        &mut self,
        server_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, AppError> {
        let conn = self
            .connection_mut(server_id)
            .ok_or_else(|| AppError::mcp(format!("Could not find serverId: {server_id}")))?;
        conn.get_prompt(name, arguments).await
    }

    /// Tool definitions keyed `tool_<serverId>_<name>`, ready for an LLM
    /// tool-calling layer
    pub fn ai_tool_definitions(&self) -> Vec<AiToolDefinition> {
        self.connections
            .iter()
            .flat_map(|conn| {
                conn.tools.iter().filter_map(|tool| {
                    let name = tool.get("name").and_then(Value::as_str)?;
                    Some(AiToolDefinition {
                        key: format!("tool_{}_{}", conn.id, name),
                        server_id: conn.id.clone(),
                        name: name.to_owned(),
                        description: tool
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_owned),
                        input_schema: tool.get("inputSchema").cloned(),
                    })
                })
            })
            .collect()
    }

    /// Execute a tool by its `tool_<serverId>_<name>` key. A result carrying
    /// `isError: true` surfaces as an error using the first content
    /// element's text.
    pub async fn invoke_ai_tool(&mut self, key: &str, arguments: Value) -> Result<Value, AppError> {
        let (server_id, name) = parse_ai_tool_key(key)
            .ok_or_else(|| AppError::mcp(format!("malformed tool key {key:?}")))?;
        let result = self.call_tool(&server_id, &name, arguments).await?;
        if result.get("isError").and_then(Value::as_bool) == Some(true) {
            let message = result
                .get("content")
                .and_then(Value::as_array)
                .and_then(|content| content.first())
                .and_then(|element| element.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("Tool execution failed");
            return Err(AppError::mcp(message));
        }
        Ok(result)
    }

    // --- lifecycle ---

    pub async fn close_connection(&mut self, id: &str) -> Result<(), AppError> {
        let index = self
            .connections
            .iter()
            .position(|conn| conn.id == id)
            .ok_or_else(|| AppError::mcp(format!("Could not find serverId: {id}")))?;
        let mut conn = self.connections.remove(index);
        conn.close().await;
        Ok(())
    }

    pub async fn close_all_connections(&mut self) -> Result<(), AppError> {
        for mut conn in self.connections.drain(..) {
            conn.close().await;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn insert_stub(&mut self, conn: McpConnection) {
        self.connections.push(conn);
    }

    #[cfg(test)]
    pub(crate) fn register_callback_url(&mut self, url: &str) {
        self.callback_urls.push(url.to_owned());
    }
}

/// `<serverId>.<name>` → `<name>`; anything else passes through
fn strip_server_prefix<'a>(server_id: &str, name: &'a str) -> &'a str {
    name.strip_prefix(server_id)
        .and_then(|rest| rest.strip_prefix('.'))
        .unwrap_or(name)
}

fn parse_ai_tool_key(key: &str) -> Option<(String, String)> {
    let rest = key.strip_prefix("tool_")?;
    let (server_id, name) = rest.split_once('_')?;
    Some((server_id.to_owned(), name.to_owned()))
}

/// The path component a callback URL matches against (it may be registered
/// as an absolute URL or a bare path)
fn callback_path(callback_url: &str) -> String {
    match Url::parse(callback_url) {
        Ok(url) => url.path().to_owned(),
        Err(_) => callback_url.to_owned(),
    }
}
