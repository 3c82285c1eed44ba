/// Live WebSocket connections and their outbound channels.
pub mod connection;
/// The single-writer instance actor.
pub mod instance;
/// The typed WebSocket control protocol.
pub mod protocol;
/// Callable-method registration and streaming sinks.
pub mod registry;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use axum::response::Response;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::AppError,
    mcp::{McpClientManager, McpConnectResult},
    schedule::{Schedule, ScheduleQuery, ScheduleWhen},
    storage::McpServerRecord,
};
use connection::{Connection, Outbound};
use instance::InstanceCore;
use protocol::HostFrame;
use registry::MethodRegistry;

/// An HTTP request as delivered to an agent. The router strips the
/// `/<prefix>/<class>/<name>` part, so the path the agent sees starts at the
/// tail (`/setState`, `/getState`, `/`, ...).
pub type AgentRequest = axum::extract::Request;

/// The identity of one agent instance
#[derive(Debug, Clone)]
pub struct AgentIdent {
    /// Class name in kebab-case, as it appears in routing URLs
    pub class: String,
    /// Instance name, opaque UTF-8
    pub name: String,
    /// Deterministic identifier derived from `(class, name)`
    pub id: String,
}

/// Who caused a state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateSource {
    /// Server-side code called `set_state`
    Server,
    /// A connected peer pushed a `cf_agent_state` frame; carries the
    /// connection id
    Client(String),
}

/// Metadata about the current request, available through the ambient context
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
}

/// Metadata about the current email, available through the ambient context
#[derive(Debug, Clone)]
pub struct EmailInfo {
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
}

/// An inbound email routed to an agent
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
}

impl EmailMessage {
    pub(crate) fn info(&self) -> EmailInfo {
        EmailInfo {
            from: self.from.clone(),
            to: self.to.clone(),
            subject: self.subject.clone(),
        }
    }
}

/// The ambient invocation context. Set for the duration of every dispatched
/// handler (HTTP, WebSocket frame, RPC, scheduled, queued, email), so code
/// deep inside a handler can ask which agent it is running under without
/// threading the context through every call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub class: String,
    pub name: String,
    pub request: Option<RequestInfo>,
    pub connection: Option<String>,
    pub email: Option<EmailInfo>,
}

tokio::task_local! {
    pub(crate) static CURRENT_AGENT: CallContext;
}

/// The context of the currently executing handler, if any. Outside a
/// dispatched handler this returns `None`.
pub fn current_agent() -> Option<CallContext> {
    CURRENT_AGENT.try_with(|ctx| ctx.clone()).ok()
}

/// An HTTP-shaped chat request delivered over the WebSocket
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub id: String,
    /// The request init blob as sent by the peer (method, headers, body)
    pub init: Value,
}

/// Sink for chunked chat responses. Chunks are framed as
/// `cf_agent_use_chat_response`; `end` sets `done:true`.
pub struct ChatResponseStream {
    id: String,
    tx: mpsc::Sender<Outbound>,
    done: Arc<AtomicBool>,
}

impl ChatResponseStream {
    pub(crate) fn new(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(crate) fn done_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.done)
    }

    pub async fn send(&mut self, body: impl Into<String>) -> Result<(), AppError> {
        if self.done.load(Ordering::SeqCst) {
            return Err(AppError::StreamClosed);
        }
        let frame = HostFrame::ChatResponse {
            id: self.id.clone(),
            body: body.into(),
            done: false,
        };
        let _ = self.tx.send(Outbound::Text(frame.to_text())).await;
        Ok(())
    }

    pub async fn end(&mut self, body: impl Into<String>) -> Result<(), AppError> {
        if self.done.swap(true, Ordering::SeqCst) {
            return Err(AppError::StreamClosed);
        }
        let frame = HostFrame::ChatResponse {
            id: self.id.clone(),
            body: body.into(),
            done: true,
        };
        let _ = self.tx.send(Outbound::Text(frame.to_text())).await;
        Ok(())
    }
}

/// Per-invocation capability handle passed to every handler. Wraps the
/// instance internals (state, store, connections, scheduler, MCP manager) so
/// a handler can only act on its own instance.
pub struct AgentCtx<'a, A> {
    pub(crate) core: &'a mut InstanceCore,
    pub(crate) registry: &'a MethodRegistry<A>,
}

impl<'a, A> AgentCtx<'a, A> {
    /// The identity of this instance
    pub fn ident(&self) -> &AgentIdent {
        &self.core.ident
    }

    /// Metadata for the current invocation (request, connection, email)
    pub fn call(&self) -> &CallContext {
        &self.core.call
    }

    /// The current state blob
    pub fn state(&self) -> &Value {
        &self.core.state
    }

    /// Atomically replace the state blob. The write joins the handler's
    /// transaction; the `cf_agent_state` broadcast to every open connection
    /// and the `on_state_update` callback fire as soon as it commits.
    pub async fn set_state(&mut self, state: Value) -> Result<(), AppError> {
        self.core.set_state(state, StateSource::Server).await
    }

    /// Persist a callback to fire at `when`. The callback must have been
    /// registered in `Agent::methods`.
    pub async fn schedule(
        &mut self,
        when: impl Into<ScheduleWhen>,
        callback: &str,
        payload: Option<Value>,
    ) -> Result<Schedule, AppError> {
        self.ensure_callback(callback)?;
        self.core.schedule(when.into(), callback, payload).await
    }

    pub async fn get_schedule(&mut self, id: &str) -> Result<Option<Schedule>, AppError> {
        self.core.store.get_schedule(id).await
    }

    pub async fn get_schedules(
        &mut self,
        query: ScheduleQuery,
    ) -> Result<Vec<Schedule>, AppError> {
        self.core.store.list_schedules(&query).await
    }

    /// Cancel a pending schedule; returns whether a row was removed
    pub async fn cancel_schedule(&mut self, id: &str) -> Result<bool, AppError> {
        self.core.store.delete_schedule(id).await
    }

    /// Enqueue a durable work item for the named callback; items run in
    /// insertion order with at-least-once delivery.
    pub async fn queue(&mut self, callback: &str, payload: Value) -> Result<String, AppError> {
        self.ensure_callback(callback)?;
        self.core.queue(callback, payload).await
    }

    fn ensure_callback(&self, callback: &str) -> Result<(), AppError> {
        if !self.registry.has_callback(callback) {
            return Err(AppError::UserError((
                axum::http::StatusCode::BAD_REQUEST,
                format!("callback {callback:?} is not registered on this agent class").into(),
            )));
        }
        Ok(())
    }

    /// The open connections attached to this instance
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.core.connections.values()
    }

    pub fn connection(&self, id: &str) -> Option<&Connection> {
        self.core.connections.get(id)
    }

    pub fn connection_mut(&mut self, id: &str) -> Option<&mut Connection> {
        self.core.connections.get_mut(id)
    }

    /// Queue a raw text message to every open connection. Delivery happens
    /// when the handler commits, in call order.
    pub fn broadcast(&mut self, message: impl Into<String>) {
        self.core.queue_broadcast(message.into(), None);
    }

    /// Like [`broadcast`](Self::broadcast), excluding one connection
    pub fn broadcast_except(&mut self, message: impl Into<String>, exclude: &str) {
        self.core
            .queue_broadcast(message.into(), Some(exclude.to_owned()));
    }

    /// The stored chat message log
    pub async fn chat_messages(&mut self) -> Result<Vec<Value>, AppError> {
        self.core.store.list_chat_messages().await
    }

    pub async fn save_chat_messages(&mut self, messages: &[Value]) -> Result<(), AppError> {
        self.core.store.save_chat_messages(messages).await
    }

    pub async fn clear_chat_messages(&mut self) -> Result<(), AppError> {
        self.core.store.clear_chat_messages().await
    }

    /// The MCP client manager owned by this instance
    pub fn mcp(&mut self) -> &mut McpClientManager {
        &mut self.core.mcp
    }

    /// Connect to an MCP server and persist the binding so it survives
    /// hibernation. `callback_host` is this agent's public URL; the OAuth
    /// callback lands under `<callback_host>/callback/<server-id>`.
    pub async fn add_mcp_server(
        &mut self,
        name: &str,
        url: &str,
        callback_host: &str,
    ) -> Result<McpConnectResult, AppError> {
        let callback_url = format!("{}/callback", callback_host.trim_end_matches('/'));
        let result = self.core.mcp.connect_with_callback(url, &callback_url).await?;
        let record = McpServerRecord {
            id: result.id.clone(),
            name: name.to_owned(),
            server_url: url.to_owned(),
            callback_url,
            client_id: result.client_id.clone(),
            auth_url: result.auth_url.clone(),
            server_options: None,
        };
        self.core.store.put_mcp_server(&record).await?;
        Ok(result)
    }

    pub async fn remove_mcp_server(&mut self, id: &str) -> Result<(), AppError> {
        self.core.mcp.close_connection(id).await?;
        self.core.store.delete_mcp_server(id).await?;
        Ok(())
    }

    /// Tear this instance down: cancel all schedules, close all connections,
    /// and delete every persisted row. Takes effect when the current handler
    /// completes.
    pub fn destroy(&mut self) {
        self.core.destroy_requested = true;
    }
}

/// The behavior of an agent class. One value of the implementing type exists
/// per live instance; the host guarantees at most one handler runs inside an
/// instance at any moment, which is why handlers take `&mut self`.
#[async_trait]
pub trait Agent: Send + Sized + 'static {
    /// Construct the in-memory value for an instance being hydrated
    fn create(ident: &AgentIdent) -> Self;

    /// The state blob used before the first `set_state`
    fn initial_state() -> Value {
        Value::Null
    }

    /// Register callable methods and schedule/queue callbacks
    fn methods(_registry: &mut MethodRegistry<Self>) {}

    /// Handle an HTTP request. The default implementation serves the
    /// built-in endpoints: `POST /setState`, `GET /getState`, JSON-RPC on
    /// `POST /`, and MCP OAuth callbacks.
    async fn on_request(
        &mut self,
        ctx: AgentCtx<'_, Self>,
        req: AgentRequest,
    ) -> Result<Response, AppError> {
        instance::default_routes(self, ctx, req).await
    }

    /// A WebSocket connection was attached
    async fn on_connect(
        &mut self,
        _ctx: AgentCtx<'_, Self>,
        _connection: &str,
    ) -> Result<(), AppError> {
        Ok(())
    }

    /// A text message arrived that is not a control-protocol frame
    async fn on_message(
        &mut self,
        _ctx: AgentCtx<'_, Self>,
        _connection: &str,
        _message: String,
    ) -> Result<(), AppError> {
        Ok(())
    }

    /// A connection closed
    async fn on_close(
        &mut self,
        _ctx: AgentCtx<'_, Self>,
        _connection: &str,
        _code: u16,
        _reason: String,
    ) -> Result<(), AppError> {
        Ok(())
    }

    /// A handler failed. The default re-raises, which for WebSocket handlers
    /// also closes the offending connection with code 1011.
    async fn on_error(&mut self, error: AppError) -> Result<(), AppError> {
        Err(error)
    }

    /// An email was routed to this instance
    async fn on_email(
        &mut self,
        _ctx: AgentCtx<'_, Self>,
        _email: EmailMessage,
    ) -> Result<(), AppError> {
        Ok(())
    }

    /// The state blob changed, either from server code or a connected peer
    async fn on_state_update(&mut self, _state: &Value, _source: StateSource) {}

    /// Handle an HTTP-shaped chat request delivered over the WebSocket.
    /// `abort` trips when the peer sends a cancel frame for this request id.
    async fn on_chat_request(
        &mut self,
        _ctx: AgentCtx<'_, Self>,
        _request: ChatRequest,
        mut response: ChatResponseStream,
        _abort: CancellationToken,
    ) -> Result<(), AppError> {
        response.end("").await
    }
}
