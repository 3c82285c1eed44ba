use std::{collections::HashMap, sync::Arc};

use agent_host::mcp::{
    ConnectOptions, McpClientManager, McpConnectionState, OAuthClientProvider,
};
use axum::{
    extract::{Form, State},
    http::{HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

/// A minimal MCP server over Streamable HTTP, optionally behind OAuth with
/// dynamic client registration
#[derive(Clone)]
struct Stub {
    base: String,
    require_auth: bool,
}

async fn mcp_endpoint(
    State(stub): State<Stub>,
    headers: HeaderMap,
    Json(message): Json<Value>,
) -> Response {
    if stub.require_auth {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "Bearer test-token");
        if !authorized {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let id = message["id"].clone();
    if id.is_null() {
        // Notification
        return StatusCode::ACCEPTED.into_response();
    }

    let result = match message["method"].as_str().unwrap_or_default() {
        "initialize" => json!({
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "serverInfo": {"name": "stub", "version": "0.0.0"},
        }),
        "tools/list" => json!({
            "tools": [
                {"name": "echo", "description": "echoes its input", "inputSchema": {"type": "object"}},
                {"name": "fail", "description": "always errors", "inputSchema": {"type": "object"}},
            ],
        }),
        "prompts/list" => json!({"prompts": [{"name": "greeting"}]}),
        "resources/list" => json!({"resources": []}),
        "resources/templates/list" => json!({"resourceTemplates": []}),
        "tools/call" => {
            if message["params"]["name"] == "fail" {
                json!({"isError": true, "content": [{"type": "text", "text": "it broke"}]})
            } else {
                json!({"isError": false, "content": [{"type": "text", "text": "echoed"}]})
            }
        }
        "prompts/get" => json!({"messages": [{"role": "user", "content": {"type": "text", "text": "hi"}}]}),
        other => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": -32601, "message": format!("unknown method {other}")},
            }))
            .into_response()
        }
    };
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

async fn oauth_metadata(State(stub): State<Stub>) -> Json<Value> {
    Json(json!({
        "authorization_endpoint": format!("{}/authorize", stub.base),
        "token_endpoint": format!("{}/token", stub.base),
        "registration_endpoint": format!("{}/register", stub.base),
    }))
}

async fn register_client() -> Json<Value> {
    Json(json!({"client_id": "client-abc"}))
}

async fn token(Form(params): Form<HashMap<String, String>>) -> Response {
    if params.get("code").map(String::as_str) == Some("good-code")
        && params.get("grant_type").map(String::as_str) == Some("authorization_code")
        && params.contains_key("code_verifier")
    {
        Json(json!({"access_token": "test-token", "token_type": "bearer"})).into_response()
    } else {
        StatusCode::BAD_REQUEST.into_response()
    }
}

/// Serve the stub on an ephemeral port; returns its MCP endpoint URL
async fn start_stub(require_auth: bool) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let stub = Stub {
        base: base.clone(),
        require_auth,
    };
    let app = Router::new()
        .route("/mcp", post(mcp_endpoint))
        .route(
            "/.well-known/oauth-authorization-server",
            get(oauth_metadata),
        )
        .route("/register", post(register_client))
        .route("/token", post(token))
        .with_state(stub);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("{base}/mcp")
}

#[tokio::test]
async fn open_servers_connect_and_expose_namespaced_tools() {
    let url = start_stub(false).await;
    let mut manager = McpClientManager::new();

    let result = manager.connect(&url, ConnectOptions::default()).await.unwrap();
    assert!(result.auth_url.is_none());
    assert_eq!(result.id.len(), 8);

    let conn = manager.connection(&result.id).unwrap();
    assert_eq!(conn.connection_state(), McpConnectionState::Ready);

    let tools = manager.list_tools();
    let per_connection: usize = manager.connections().map(|c| c.tools.len()).sum();
    assert_eq!(tools.len(), per_connection);
    assert_eq!(tools[0]["name"], "echo");
    assert_eq!(tools[0]["serverId"], json!(result.id));

    let prompts = manager.list_prompts();
    assert_eq!(prompts[0]["name"], "greeting");
    assert_eq!(prompts[0]["serverId"], json!(result.id));
}

#[tokio::test]
async fn tool_calls_strip_the_server_namespace() {
    let url = start_stub(false).await;
    let mut manager = McpClientManager::new();
    let id = manager
        .connect(&url, ConnectOptions::default())
        .await
        .unwrap()
        .id;

    let namespaced = format!("{id}.echo");
    let result = manager
        .call_tool(&id, &namespaced, json!({"text": "hi"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "echoed");

    let prompt = manager.get_prompt(&id, "greeting", None).await.unwrap();
    assert_eq!(prompt["messages"][0]["role"], "user");
}

#[tokio::test]
async fn failed_ai_tool_results_surface_their_error_text() {
    let url = start_stub(false).await;
    let mut manager = McpClientManager::new();
    let id = manager
        .connect(&url, ConnectOptions::default())
        .await
        .unwrap()
        .id;

    let defs = manager.ai_tool_definitions();
    assert!(defs.iter().any(|d| d.key == format!("tool_{id}_echo")));

    let err = manager
        .invoke_ai_tool(&format!("tool_{id}_fail"), json!({}))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "it broke");

    let ok = manager
        .invoke_ai_tool(&format!("tool_{id}_echo"), json!({}))
        .await
        .unwrap();
    assert_eq!(ok["isError"], json!(false));
}

#[tokio::test]
async fn oauth_callback_completes_the_authorization_flow() {
    let url = start_stub(true).await;
    let mut manager = McpClientManager::new();

    let provider = Arc::new(OAuthClientProvider::new(
        "https://host/agents/test-agent/x/callback",
    ));
    let result = manager
        .connect(
            &url,
            ConnectOptions {
                auth_provider: Some(provider),
                reconnect: None,
            },
        )
        .await
        .unwrap();

    let id = result.id.clone();
    let auth_url = result.auth_url.expect("authorization URL");
    assert!(auth_url.contains("code_challenge"));
    assert!(auth_url.contains("state=client-abc"));
    assert_eq!(result.client_id.as_deref(), Some("client-abc"));
    assert_eq!(
        manager.connection(&id).unwrap().connection_state(),
        McpConnectionState::Authenticating
    );

    let callback: Uri = format!(
        "/agents/test-agent/x/callback/{id}?code=good-code&state=client-abc"
    )
    .parse()
    .unwrap();
    assert!(manager.is_callback_request(&Method::GET, &callback));

    let server_id = manager
        .handle_callback_request(&Method::GET, &callback)
        .await
        .unwrap();
    assert_eq!(server_id, id);
    assert_eq!(
        manager.connection(&id).unwrap().connection_state(),
        McpConnectionState::Ready
    );
    assert!(!manager.list_tools().is_empty());
}

#[tokio::test]
async fn bad_authorization_codes_leave_the_connection_failed() {
    let url = start_stub(true).await;
    let mut manager = McpClientManager::new();

    let provider = Arc::new(OAuthClientProvider::new("https://host/cb"));
    let result = manager
        .connect(
            &url,
            ConnectOptions {
                auth_provider: Some(provider),
                reconnect: None,
            },
        )
        .await
        .unwrap();
    let id = result.id;

    let callback: Uri = format!("/cb/{id}?code=throw_error&state=client-abc")
        .parse()
        .unwrap();
    let err = manager
        .handle_callback_request(&Method::GET, &callback)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("token exchange failed"));
    assert_eq!(
        manager.connection(&id).unwrap().connection_state(),
        McpConnectionState::Failed
    );
}

#[tokio::test]
async fn protected_servers_without_a_provider_fail_to_connect() {
    let url = start_stub(true).await;
    let mut manager = McpClientManager::new();

    let err = manager
        .connect(&url, ConnectOptions::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("no auth provider"));
}
