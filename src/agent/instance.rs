use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::ws::{CloseFrame, Message, WebSocket},
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use dashmap::DashMap;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::{
    sync::{mpsc, oneshot},
    time::{sleep, sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    agent::{
        connection::{Connection, Outbound},
        protocol::{parse_peer_frame, HostFrame, PeerFrame},
        registry::{MethodRegistry, RpcMethod, StreamingResponse},
        Agent, AgentCtx, AgentIdent, AgentRequest, CallContext, ChatRequest, ChatResponseStream,
        EmailMessage, RequestInfo, StateSource, CURRENT_AGENT,
    },
    error::{json_content_type, AppError, AppJson},
    mcp::McpClientManager,
    schedule::{next_cron_fire, now_millis, now_seconds, Schedule, ScheduleKind, ScheduleWhen},
    storage::{AgentStore, QueueItem},
    utils::random_token,
    HostInner, InstanceHandle,
};

const MAILBOX_CAPACITY: usize = 64;
const OUTBOUND_CAPACITY: usize = 64;
const BODY_LIMIT: usize = 2 * 1024 * 1024;
/// How long a failed schedule/queue fire waits before the alarm retries it
const FIRE_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Work delivered to an instance through its mailbox. The mailbox is the
/// serialization boundary: one command is handled to completion before the
/// next is picked up.
pub(crate) enum Command {
    Request {
        req: AgentRequest,
        reply: oneshot::Sender<Response>,
    },
    Attach {
        socket: WebSocket,
    },
    Frame {
        connection: String,
        text: String,
    },
    Closed {
        connection: String,
        code: u16,
        reason: String,
    },
    Email {
        email: EmailMessage,
        reply: oneshot::Sender<Result<(), AppError>>,
    },
    Evict {
        reply: oneshot::Sender<()>,
    },
    Destroy {
        reply: oneshot::Sender<Result<(), AppError>>,
    },
}

/// Effects queued during a handler and released when its transaction commits
enum PendingEffect {
    Broadcast {
        text: String,
        exclude: Option<String>,
    },
    StateUpdate {
        state: Value,
        source: StateSource,
    },
}

/// The non-generic innards of an instance, reachable from handlers through
/// [`AgentCtx`]
pub struct InstanceCore {
    pub(crate) ident: AgentIdent,
    pub(crate) store: AgentStore,
    pub(crate) state: Value,
    pub(crate) connections: HashMap<String, Connection>,
    pub(crate) mcp: McpClientManager,
    pub(crate) call: CallContext,
    pub(crate) destroy_requested: bool,
    pending: Vec<PendingEffect>,
    chat_aborts: Arc<DashMap<String, CancellationToken>>,
    alarm_backoff: Option<Instant>,
}

impl InstanceCore {
    pub(crate) async fn set_state(
        &mut self,
        state: Value,
        source: StateSource,
    ) -> Result<(), AppError> {
        self.store.put_state(&state).await?;
        self.state = state.clone();
        let exclude = match &source {
            StateSource::Client(id) => Some(id.clone()),
            StateSource::Server => None,
        };
        self.pending.push(PendingEffect::Broadcast {
            text: HostFrame::State {
                state: state.clone(),
            }
            .to_text(),
            exclude,
        });
        self.pending.push(PendingEffect::StateUpdate { state, source });
        Ok(())
    }

    pub(crate) async fn schedule(
        &mut self,
        when: ScheduleWhen,
        callback: &str,
        payload: Option<Value>,
    ) -> Result<Schedule, AppError> {
        let now = Utc::now();
        let (kind, time, delay_seconds, cron) = when.resolve(now)?;
        let schedule = Schedule {
            id: random_token(9),
            callback: callback.to_owned(),
            payload,
            kind,
            time,
            delay_seconds,
            cron,
            created_at: now_millis(),
        };
        self.store.put_schedule(&schedule).await?;
        Ok(schedule)
    }

    pub(crate) async fn queue(
        &mut self,
        callback: &str,
        payload: Value,
    ) -> Result<String, AppError> {
        let id = random_token(9);
        self.store.push_queue(&id, callback, &payload).await?;
        Ok(id)
    }

    pub(crate) fn queue_broadcast(&mut self, text: String, exclude: Option<String>) {
        self.pending.push(PendingEffect::Broadcast { text, exclude });
    }

    fn base_call(&self) -> CallContext {
        CallContext {
            class: self.ident.class.clone(),
            name: self.ident.name.clone(),
            request: None,
            connection: None,
            email: None,
        }
    }
}

/// One live agent instance: the user's agent value plus the actor machinery
/// around it
struct Instance<A: Agent> {
    agent: A,
    core: InstanceCore,
    registry: Arc<MethodRegistry<A>>,
    rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    host: Arc<HostInner>,
    generation: u64,
    stopping: bool,
}

/// Spawn the actor task for `(class, name)` and hand back its mailbox. The
/// task hydrates lazily; commands queue in the mailbox until it is ready.
pub(crate) fn spawn<A: Agent>(
    ident: AgentIdent,
    host: Arc<HostInner>,
    generation: u64,
) -> InstanceHandle {
    let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
    let handle = InstanceHandle {
        tx: tx.clone(),
        generation,
    };
    tokio::spawn(run::<A>(ident, host, rx, tx, generation));
    handle
}

async fn run<A: Agent>(
    ident: AgentIdent,
    host: Arc<HostInner>,
    rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    generation: u64,
) {
    let key = (ident.class.clone(), ident.name.clone());
    match Instance::<A>::hydrate(ident, host.clone(), rx, cmd_tx, generation).await {
        Ok(mut instance) => instance.run().await,
        Err(e) => {
            // Dropping the mailbox makes queued requests fail over to a 500
            // at the router
            error!(class = %key.0, name = %key.1, error = %e, "failed to hydrate agent instance");
            host.instances
                .remove_if(&key, |_, handle| handle.generation == generation);
        }
    }
}

impl<A: Agent> Instance<A> {
    async fn hydrate(
        ident: AgentIdent,
        host: Arc<HostInner>,
        rx: mpsc::Receiver<Command>,
        cmd_tx: mpsc::Sender<Command>,
        generation: u64,
    ) -> Result<Self, AppError> {
        let db_path = host
            .options
            .data_dir
            .join(&ident.class)
            .join(format!("{}.db", ident.id));
        let mut store = AgentStore::open(&db_path).await?;
        let state = match store.get_state().await? {
            Some(state) => state,
            None => A::initial_state(),
        };

        let mut registry = MethodRegistry::new();
        A::methods(&mut registry);

        let agent = A::create(&ident);
        let mut core = InstanceCore {
            ident,
            store,
            state,
            connections: HashMap::new(),
            mcp: McpClientManager::new(),
            call: CallContext::default(),
            destroy_requested: false,
            pending: Vec::new(),
            chat_aborts: Arc::new(DashMap::new()),
            alarm_backoff: None,
        };

        // Re-establish persisted MCP server bindings. Failures leave the
        // connection in the failed state without blocking hydration.
        let records = core.store.list_mcp_servers().await?;
        for record in records {
            if let Err(e) = core.mcp.reconnect_persisted(&record).await {
                warn!(server = %record.id, url = %record.server_url, error = %e,
                    "could not reconnect persisted MCP server");
            }
        }

        info!(
            class = %core.ident.class,
            name = %core.ident.name,
            "agent instance hydrated"
        );

        Ok(Self {
            agent,
            core,
            registry: Arc::new(registry),
            rx,
            cmd_tx,
            host,
            generation,
            stopping: false,
        })
    }

    async fn run(&mut self) {
        // Fires missed while hibernated execute before any queued command
        self.process_due_work().await;
        if self.core.destroy_requested {
            self.do_destroy().await;
        }

        while !self.stopping {
            let alarm = self.next_alarm_instant().await;
            let alarm_instant = alarm.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));
            let can_idle = self.core.connections.is_empty();

            tokio::select! {
                biased;
                _ = sleep_until(alarm_instant), if alarm.is_some() => {
                    self.process_due_work().await;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = sleep(self.host.options.idle_timeout), if can_idle => {
                    debug!(
                        class = %self.core.ident.class,
                        name = %self.core.ident.name,
                        "evicting idle agent instance"
                    );
                    self.remove_from_map();
                    break;
                }
            }

            if self.core.destroy_requested {
                self.do_destroy().await;
            }
        }

        self.drain_mailbox().await;
    }

    /// Commands that raced into the mailbox while this instance was stopping
    /// belong to a fresh hydration, not the void
    async fn drain_mailbox(&mut self) {
        self.rx.close();
        let mut leftover = Vec::new();
        while let Ok(cmd) = self.rx.try_recv() {
            leftover.push(cmd);
        }
        if leftover.is_empty() {
            return;
        }

        let key = (
            self.core.ident.class.clone(),
            self.core.ident.name.clone(),
        );
        let successor = match self.host.instances.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().tx.clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let generation = self
                    .host
                    .generation
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                let handle = spawn::<A>(self.core.ident.clone(), Arc::clone(&self.host), generation);
                let tx = handle.tx.clone();
                vacant.insert(handle);
                tx
            }
        };
        for cmd in leftover {
            let _ = successor.send(cmd).await;
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Request { req, reply } => self.handle_request(req, reply).await,
            Command::Attach { socket } => self.attach(socket).await,
            Command::Frame { connection, text } => self.handle_frame(connection, text).await,
            Command::Closed {
                connection,
                code,
                reason,
            } => self.handle_closed(connection, code, reason).await,
            Command::Email { email, reply } => self.handle_email(email, reply).await,
            Command::Evict { reply } => {
                self.remove_from_map();
                self.stopping = true;
                let _ = reply.send(());
            }
            Command::Destroy { reply } => {
                self.do_destroy().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    // --- handler plumbing ---

    async fn begin_handler(&mut self, call: &CallContext) -> Result<(), AppError> {
        self.core.pending.clear();
        self.core.call = call.clone();
        self.core.store.begin().await
    }

    /// Commit the handler transaction and release its queued broadcasts and
    /// state-update callbacks, in order
    async fn commit_effects(&mut self) -> Result<(), AppError> {
        self.core.store.commit().await?;
        let effects = std::mem::take(&mut self.core.pending);
        for effect in effects {
            match effect {
                PendingEffect::Broadcast { text, exclude } => {
                    let mut closed = Vec::new();
                    for (id, conn) in self.core.connections.iter() {
                        if exclude.as_deref() == Some(id.as_str()) {
                            continue;
                        }
                        if !conn.send_text(text.clone()).await {
                            closed.push(id.clone());
                        }
                    }
                    for id in closed {
                        self.core.connections.remove(&id);
                    }
                }
                PendingEffect::StateUpdate { state, source } => {
                    self.agent.on_state_update(&state, source).await;
                }
            }
        }
        Ok(())
    }

    /// Roll back the handler transaction and discard everything it queued
    async fn abort_effects(&mut self) {
        if let Err(e) = self.core.store.rollback().await {
            error!(error = %e, "failed to roll back handler transaction");
        }
        self.core.pending.clear();
        self.core.destroy_requested = false;
    }

    /// Route a handler failure through `on_error` and close the offending
    /// connection with 1011 if the error is re-raised
    async fn ws_handler_error(&mut self, connection: &str, error: AppError) {
        self.abort_effects().await;
        match self.agent.on_error(error).await {
            Ok(()) => {}
            Err(e) => {
                warn!(connection, error = %e, "closing connection after handler error");
                if let Some(mut conn) = self.core.connections.remove(connection) {
                    conn.close(1011, "handler error").await;
                }
            }
        }
    }

    // --- HTTP ---

    async fn handle_request(&mut self, req: AgentRequest, reply: oneshot::Sender<Response>) {
        let mut call = self.core.base_call();
        call.request = Some(RequestInfo {
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
        });

        if let Err(e) = self.begin_handler(&call).await {
            let _ = reply.send(e.into_response());
            return;
        }
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: self.registry.as_ref(),
                };
                self.agent.on_request(ctx, req).await
            })
            .await;

        let response = match result {
            Ok(response) => match self.commit_effects().await {
                Ok(()) => response,
                Err(e) => e.into_response(),
            },
            Err(e) => {
                self.abort_effects().await;
                match self.agent.on_error(e).await {
                    Ok(()) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                    Err(e) => e.into_response(),
                }
            }
        };
        let _ = reply.send(response);
    }

    // --- WebSocket attach/detach ---

    async fn attach(&mut self, socket: WebSocket) {
        let connection = random_token(12);
        let (sink, stream) = socket.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        tokio::spawn(write_loop(sink, outbound_rx));
        tokio::spawn(read_loop(
            stream,
            self.cmd_tx.clone(),
            Arc::clone(&self.core.chat_aborts),
            connection.clone(),
        ));

        let conn = Connection::new(connection.clone(), outbound_tx);
        // Initial sync: current state, then the stored message log
        conn.send_text(
            HostFrame::State {
                state: self.core.state.clone(),
            }
            .to_text(),
        )
        .await;
        if let Ok(messages) = self.core.store.list_chat_messages().await {
            if !messages.is_empty() {
                conn.send_text(HostFrame::ChatMessages { messages }.to_text())
                    .await;
            }
        }
        self.core.connections.insert(connection.clone(), conn);
        debug!(
            class = %self.core.ident.class,
            name = %self.core.ident.name,
            connection = %connection,
            "websocket connection attached"
        );

        let mut call = self.core.base_call();
        call.connection = Some(connection.clone());
        if let Err(e) = self.begin_handler(&call).await {
            error!(error = %e, "failed to open transaction for on_connect");
            return;
        }
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: self.registry.as_ref(),
                };
                self.agent.on_connect(ctx, &connection).await
            })
            .await;
        match result {
            Ok(()) => {
                if let Err(e) = self.commit_effects().await {
                    self.ws_handler_error(&connection, e).await;
                }
            }
            Err(e) => self.ws_handler_error(&connection, e).await,
        }
    }

    async fn handle_closed(&mut self, connection: String, code: u16, reason: String) {
        if self.core.connections.remove(&connection).is_none() {
            return;
        }
        let mut call = self.core.base_call();
        call.connection = Some(connection.clone());
        if let Err(e) = self.begin_handler(&call).await {
            error!(error = %e, "failed to open transaction for on_close");
            return;
        }
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: self.registry.as_ref(),
                };
                self.agent.on_close(ctx, &connection, code, reason).await
            })
            .await;
        match result {
            Ok(()) => {
                if let Err(e) = self.commit_effects().await {
                    error!(error = %e, "failed to commit on_close effects");
                }
            }
            Err(e) => {
                self.abort_effects().await;
                if let Err(e) = self.agent.on_error(e).await {
                    warn!(connection = %connection, error = %e, "on_close handler failed");
                }
            }
        }
    }

    // --- WebSocket frames ---

    async fn handle_frame(&mut self, connection: String, text: String) {
        match parse_peer_frame(&text) {
            Some(PeerFrame::SetState { state }) => {
                let mut call = self.core.base_call();
                call.connection = Some(connection.clone());
                if let Err(e) = self.begin_handler(&call).await {
                    self.ws_handler_error(&connection, e).await;
                    return;
                }
                let source = StateSource::Client(connection.clone());
                let result = CURRENT_AGENT
                    .scope(call, self.core.set_state(state, source))
                    .await;
                match result {
                    Ok(()) => {
                        if let Err(e) = self.commit_effects().await {
                            self.ws_handler_error(&connection, e).await;
                        }
                    }
                    Err(e) => self.ws_handler_error(&connection, e).await,
                }
            }
            Some(PeerFrame::Rpc { id, method, args }) => {
                self.dispatch_rpc(&connection, id, method, args).await;
            }
            Some(PeerFrame::ChatRequest { id, init }) => {
                self.handle_chat_request(&connection, id, init).await;
            }
            Some(PeerFrame::ChatCancel { id }) => {
                // Normally consumed on the reader task; arriving here just
                // means there is nothing left to cancel
                self.core.chat_aborts.remove(&id);
            }
            Some(PeerFrame::ChatMessages { messages }) => {
                let mut call = self.core.base_call();
                call.connection = Some(connection.clone());
                if let Err(e) = self.begin_handler(&call).await {
                    self.ws_handler_error(&connection, e).await;
                    return;
                }
                let result = self.core.store.save_chat_messages(&messages).await;
                match result {
                    Ok(()) => {
                        self.core.queue_broadcast(
                            HostFrame::ChatMessages { messages }.to_text(),
                            Some(connection.clone()),
                        );
                        if let Err(e) = self.commit_effects().await {
                            self.ws_handler_error(&connection, e).await;
                        }
                    }
                    Err(e) => self.ws_handler_error(&connection, e).await,
                }
            }
            Some(PeerFrame::ChatClear) => {
                let mut call = self.core.base_call();
                call.connection = Some(connection.clone());
                if let Err(e) = self.begin_handler(&call).await {
                    self.ws_handler_error(&connection, e).await;
                    return;
                }
                let result = self.core.store.clear_chat_messages().await;
                match result {
                    Ok(()) => {
                        self.core.queue_broadcast(
                            HostFrame::ChatClear.to_text(),
                            Some(connection.clone()),
                        );
                        if let Err(e) = self.commit_effects().await {
                            self.ws_handler_error(&connection, e).await;
                        }
                    }
                    Err(e) => self.ws_handler_error(&connection, e).await,
                }
            }
            None => {
                // Not a control frame; this is the user's message
                let mut call = self.core.base_call();
                call.connection = Some(connection.clone());
                if let Err(e) = self.begin_handler(&call).await {
                    self.ws_handler_error(&connection, e).await;
                    return;
                }
                let result = CURRENT_AGENT
                    .scope(call, async {
                        let ctx = AgentCtx {
                            core: &mut self.core,
                            registry: self.registry.as_ref(),
                        };
                        self.agent.on_message(ctx, &connection, text).await
                    })
                    .await;
                match result {
                    Ok(()) => {
                        if let Err(e) = self.commit_effects().await {
                            self.ws_handler_error(&connection, e).await;
                        }
                    }
                    Err(e) => self.ws_handler_error(&connection, e).await,
                }
            }
        }
    }

    async fn dispatch_rpc(&mut self, connection: &str, id: String, method: String, args: Vec<Value>) {
        let Some(conn) = self.core.connections.get(connection) else {
            return;
        };
        let outbound = conn.sender();
        let registry = Arc::clone(&self.registry);

        let Some(rpc) = registry.rpc(&method) else {
            let frame = HostFrame::rpc_error(id, AppError::MethodNotFound.to_string());
            let _ = outbound.send(Outbound::Text(frame.to_text())).await;
            return;
        };

        let mut call = self.core.base_call();
        call.connection = Some(connection.to_owned());
        if let Err(e) = self.begin_handler(&call).await {
            let frame = HostFrame::rpc_error(id, e.to_string());
            let _ = outbound.send(Outbound::Text(frame.to_text())).await;
            return;
        }

        match rpc {
            RpcMethod::Unary(handler) => {
                let result = CURRENT_AGENT
                    .scope(call, async {
                        let ctx = AgentCtx {
                            core: &mut self.core,
                            registry: registry.as_ref(),
                        };
                        handler(&mut self.agent, ctx, args).await
                    })
                    .await;
                let frame = match result {
                    Ok(value) => match self.commit_effects().await {
                        Ok(()) => HostFrame::rpc_result(id, value),
                        Err(e) => HostFrame::rpc_error(id, e.to_string()),
                    },
                    Err(e) => {
                        self.abort_effects().await;
                        HostFrame::rpc_error(id, e.to_string())
                    }
                };
                let _ = outbound.send(Outbound::Text(frame.to_text())).await;
            }
            RpcMethod::Streaming(handler) => {
                let sink = StreamingResponse::for_connection(id.clone(), outbound.clone());
                let monitor = sink.monitor();
                let result = CURRENT_AGENT
                    .scope(call, async {
                        let ctx = AgentCtx {
                            core: &mut self.core,
                            registry: registry.as_ref(),
                        };
                        handler(&mut self.agent, ctx, sink, args).await
                    })
                    .await;
                match result {
                    Ok(()) => match self.commit_effects().await {
                        Ok(()) => {
                            // A stream the method never finished gets a null
                            // final so the peer's call resolves
                            if !monitor.ended() {
                                let frame = HostFrame::rpc_final(id, Value::Null);
                                let _ = outbound.send(Outbound::Text(frame.to_text())).await;
                            }
                        }
                        Err(e) => {
                            if !monitor.ended() {
                                let frame = HostFrame::rpc_error(id, e.to_string());
                                let _ = outbound.send(Outbound::Text(frame.to_text())).await;
                            }
                        }
                    },
                    Err(e) => {
                        self.abort_effects().await;
                        if !monitor.ended() {
                            let frame = HostFrame::rpc_error(id, e.to_string());
                            let _ = outbound.send(Outbound::Text(frame.to_text())).await;
                        } else {
                            debug!(error = %e, "streaming method failed after ending its stream");
                        }
                    }
                }
            }
        }
    }

    async fn handle_chat_request(&mut self, connection: &str, id: String, init: Value) {
        let Some(conn) = self.core.connections.get(connection) else {
            return;
        };
        let outbound = conn.sender();

        let token = CancellationToken::new();
        self.core.chat_aborts.insert(id.clone(), token.clone());
        let stream = ChatResponseStream::new(id.clone(), outbound.clone());
        let done_flag = stream.done_flag();

        let mut call = self.core.base_call();
        call.connection = Some(connection.to_owned());
        if let Err(e) = self.begin_handler(&call).await {
            self.core.chat_aborts.remove(&id);
            self.ws_handler_error(connection, e).await;
            return;
        }

        let request = ChatRequest {
            id: id.clone(),
            init,
        };
        let handler_token = token.clone();
        let result = {
            let fut = CURRENT_AGENT.scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: self.registry.as_ref(),
                };
                self.agent
                    .on_chat_request(ctx, request, stream, handler_token)
                    .await
            });
            tokio::select! {
                result = fut => Some(result),
                () = token.cancelled() => None,
            }
        };
        self.core.chat_aborts.remove(&id);

        // A stream the handler never terminated still owes the peer its
        // `done:true`
        let needs_terminal = || !done_flag.load(std::sync::atomic::Ordering::SeqCst);
        let terminal = HostFrame::ChatResponse {
            id: id.clone(),
            body: String::new(),
            done: true,
        }
        .to_text();

        match result {
            Some(Ok(())) => {
                if let Err(e) = self.commit_effects().await {
                    self.ws_handler_error(connection, e).await;
                    return;
                }
                if needs_terminal() {
                    let _ = outbound.send(Outbound::Text(terminal)).await;
                }
            }
            Some(Err(e)) => {
                if needs_terminal() {
                    let _ = outbound.send(Outbound::Text(terminal)).await;
                }
                self.ws_handler_error(connection, e).await;
            }
            None => {
                // Aborted by the peer; the handler future was dropped
                debug!(request = %id, "chat request cancelled");
                self.abort_effects().await;
                if needs_terminal() {
                    let _ = outbound.send(Outbound::Text(terminal)).await;
                }
            }
        }
    }

    // --- email ---

    async fn handle_email(&mut self, email: EmailMessage, reply: oneshot::Sender<Result<(), AppError>>) {
        let mut call = self.core.base_call();
        call.email = Some(email.info());
        if let Err(e) = self.begin_handler(&call).await {
            let _ = reply.send(Err(e));
            return;
        }
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: self.registry.as_ref(),
                };
                self.agent.on_email(ctx, email).await
            })
            .await;
        let outcome = match result {
            Ok(()) => self.commit_effects().await,
            Err(e) => {
                self.abort_effects().await;
                self.agent.on_error(e).await
            }
        };
        let _ = reply.send(outcome);
    }

    // --- alarm ---

    /// The single alarm: the nearest pending schedule fire, or now if any
    /// queue item is waiting. A recent failed fire pushes the alarm back by
    /// the retry delay.
    async fn next_alarm_instant(&mut self) -> Option<Instant> {
        let next_schedule = match self.core.store.next_schedule_time().await {
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "failed to read next schedule time");
                None
            }
        };
        let queue_waiting = match self.core.store.queue_len().await {
            Ok(n) => n > 0,
            Err(e) => {
                error!(error = %e, "failed to read queue length");
                false
            }
        };

        let now_epoch = now_seconds();
        let epoch = if queue_waiting {
            // Queue items are always due immediately
            Some(next_schedule.map_or(now_epoch, |t| t.min(now_epoch)))
        } else {
            next_schedule
        }?;

        let delta = (epoch - now_epoch).max(0) as u64;
        let mut at = Instant::now() + Duration::from_secs(delta);
        if let Some(backoff) = self.core.alarm_backoff {
            if backoff > at {
                at = backoff;
            }
        }
        Some(at)
    }

    /// Run everything that is due: schedule rows in ascending fire order,
    /// then queue items in insertion order
    async fn process_due_work(&mut self) {
        self.core.alarm_backoff = None;

        let due = match self.core.store.due_schedules(now_seconds()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due schedules");
                return;
            }
        };
        for row in due {
            self.fire_schedule(row).await;
            if self.core.destroy_requested || self.stopping {
                return;
            }
        }

        let items = match self.core.store.list_queue().await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to load queue items");
                return;
            }
        };
        for item in items {
            self.fire_queue_item(item).await;
            if self.core.destroy_requested || self.stopping {
                return;
            }
        }
    }

    async fn fire_schedule(&mut self, row: Schedule) {
        let registry = Arc::clone(&self.registry);
        let Some(handler) = registry.get_callback(&row.callback) else {
            // The handler name no longer resolves; log and drop (or advance
            // past) the row so it cannot wedge the alarm
            warn!(
                schedule = %row.id,
                callback = %row.callback,
                "schedule names an unknown callback"
            );
            self.retire_fired_row(&row).await;
            return;
        };

        let call = self.core.base_call();
        if let Err(e) = self.begin_handler(&call).await {
            error!(error = %e, "failed to open transaction for scheduled callback");
            self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
            return;
        }
        let payload = row.payload.clone().unwrap_or(Value::Null);
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: registry.as_ref(),
                };
                handler(&mut self.agent, ctx, payload).await
            })
            .await;
        match result {
            Ok(()) => {
                // Retire the row inside the same transaction as the
                // callback's writes
                self.retire_fired_row(&row).await;
                if let Err(e) = self.commit_effects().await {
                    error!(schedule = %row.id, error = %e, "failed to commit scheduled callback");
                    self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
                }
            }
            Err(e) => {
                self.abort_effects().await;
                if let Err(e) = self.agent.on_error(e).await {
                    warn!(schedule = %row.id, error = %e, "scheduled callback failed; will retry");
                }
                self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
            }
        }
    }

    /// Delete a one-shot row, or advance a cron row to its next fire
    async fn retire_fired_row(&mut self, row: &Schedule) {
        let result = match (row.kind, &row.cron) {
            (ScheduleKind::Cron, Some(expr)) => match next_cron_fire(expr, Utc::now()) {
                Ok(next) => self.core.store.update_schedule_time(&row.id, next).await,
                Err(e) => {
                    error!(schedule = %row.id, error = %e, "cron row stopped advancing; deleting");
                    self.core.store.delete_schedule(&row.id).await.map(|_| ())
                }
            },
            _ => self.core.store.delete_schedule(&row.id).await.map(|_| ()),
        };
        if let Err(e) = result {
            error!(schedule = %row.id, error = %e, "failed to retire fired schedule row");
        }
    }

    async fn fire_queue_item(&mut self, item: QueueItem) {
        let registry = Arc::clone(&self.registry);
        let Some(handler) = registry.get_callback(&item.callback) else {
            warn!(
                item = %item.id,
                callback = %item.callback,
                "queue item names an unknown callback"
            );
            if let Err(e) = self.core.store.delete_queue(&item.id).await {
                error!(item = %item.id, error = %e, "failed to drop queue item");
            }
            return;
        };

        let call = self.core.base_call();
        if let Err(e) = self.begin_handler(&call).await {
            error!(error = %e, "failed to open transaction for queued callback");
            self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
            return;
        }
        let payload = item.payload.clone().unwrap_or(Value::Null);
        let result = CURRENT_AGENT
            .scope(call, async {
                let ctx = AgentCtx {
                    core: &mut self.core,
                    registry: registry.as_ref(),
                };
                handler(&mut self.agent, ctx, payload).await
            })
            .await;
        match result {
            Ok(()) => {
                if let Err(e) = self.core.store.delete_queue(&item.id).await {
                    error!(item = %item.id, error = %e, "failed to delete completed queue item");
                }
                if let Err(e) = self.commit_effects().await {
                    error!(item = %item.id, error = %e, "failed to commit queued callback");
                    self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
                }
            }
            Err(e) => {
                self.abort_effects().await;
                if let Err(e) = self.agent.on_error(e).await {
                    warn!(item = %item.id, error = %e, "queued callback failed; will retry");
                }
                self.core.alarm_backoff = Some(Instant::now() + FIRE_RETRY_DELAY);
            }
        }
    }

    // --- teardown ---

    async fn do_destroy(&mut self) {
        info!(
            class = %self.core.ident.class,
            name = %self.core.ident.name,
            "destroying agent instance"
        );
        if let Err(e) = self.core.store.rollback().await {
            error!(error = %e, "failed to roll back before destroy");
        }
        if let Err(e) = self.core.store.wipe().await {
            error!(error = %e, "failed to wipe agent tables");
        }
        if let Err(e) = self.core.mcp.close_all_connections().await {
            warn!(error = %e, "failed to close MCP connections");
        }
        for (_, mut conn) in self.core.connections.drain() {
            conn.close(1000, "agent destroyed").await;
        }
        self.core.pending.clear();
        self.core.destroy_requested = false;
        self.remove_from_map();
        self.stopping = true;
    }

    fn remove_from_map(&self) {
        let key = (
            self.core.ident.class.clone(),
            self.core.ident.name.clone(),
        );
        self.host
            .instances
            .remove_if(&key, |_, handle| handle.generation == self.generation);
    }
}

// --- socket pump tasks ---

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let _ = sink
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    mailbox: mpsc::Sender<Command>,
    aborts: Arc<DashMap<String, CancellationToken>>,
    connection: String,
) {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                // Cancellation is handled here, off the mailbox, so a chat
                // handler already running can observe its abort token
                if let Some(PeerFrame::ChatCancel { id }) = parse_peer_frame(&text) {
                    if let Some((_, token)) = aborts.remove(&id) {
                        token.cancel();
                    }
                    continue;
                }
                if mailbox
                    .send(Command::Frame {
                        connection: connection.clone(),
                        text,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason.to_string()))
                    .unwrap_or((1005, String::new()));
                let _ = mailbox
                    .send(Command::Closed {
                        connection,
                        code,
                        reason,
                    })
                    .await;
                return;
            }
            // Binary frames are not part of the protocol; ping/pong is
            // handled by the transport
            Ok(_) => {}
            Err(e) => {
                debug!(connection = %connection, error = %e, "websocket read error");
                let _ = mailbox
                    .send(Command::Closed {
                        connection,
                        code: 1006,
                        reason: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
    let _ = mailbox
        .send(Command::Closed {
            connection,
            code: 1005,
            reason: String::new(),
        })
        .await;
}

// --- built-in endpoints ---

#[derive(Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: String,
    method: String,
    #[serde(default)]
    params: Vec<Value>,
    #[serde(default)]
    id: Value,
}

fn json_rpc_error(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    })
}

/// The default `on_request` behavior: MCP OAuth callbacks, `POST /setState`,
/// `GET /getState`, and JSON-RPC 2.0 on `POST /`
pub async fn default_routes<A: Agent>(
    agent: &mut A,
    mut ctx: AgentCtx<'_, A>,
    req: AgentRequest,
) -> Result<Response, AppError> {
    let (parts, body) = req.into_parts();

    if ctx.core.mcp.is_callback_request(&parts.method, &parts.uri) {
        let server_id = ctx
            .core
            .mcp
            .handle_callback_request(&parts.method, &parts.uri)
            .await?;
        return Ok(AppJson(json!({ "serverId": server_id })).into_response());
    }

    let path = parts.uri.path();
    if parts.method == Method::POST && path == "/setState" {
        let bytes = axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .map_err(|e| anyhow!("failed to read request body: {e}"))?;
        match AppJson::<Value>::from_bytes(&bytes) {
            Ok(AppJson(state)) => {
                ctx.set_state(state).await?;
                Ok(AppJson(json!({ "success": true })).into_response())
            }
            Err(e) => Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                AppJson(json!({ "error": e.to_string() })),
            )
                .into_response()),
        }
    } else if parts.method == Method::GET && path == "/getState" {
        Ok(AppJson(ctx.state().clone()).into_response())
    } else if parts.method == Method::POST && (path == "/" || path.is_empty()) {
        if !json_content_type(&parts.headers) {
            return Ok((
                StatusCode::BAD_REQUEST,
                AppJson(json!({ "error": "expected application/json" })),
            )
                .into_response());
        }
        let bytes = axum::body::to_bytes(body, BODY_LIMIT)
            .await
            .map_err(|e| anyhow!("failed to read request body: {e}"))?;
        let envelope = match AppJson::<JsonRpcRequest>::from_bytes(&bytes) {
            Ok(AppJson(envelope)) => envelope,
            Err(e) => {
                return Ok((
                    StatusCode::BAD_REQUEST,
                    AppJson(json_rpc_error(Value::Null, -32700, &e.to_string())),
                )
                    .into_response());
            }
        };
        if !envelope.jsonrpc.is_empty() && envelope.jsonrpc != "2.0" {
            return Ok((
                StatusCode::BAD_REQUEST,
                AppJson(json_rpc_error(
                    envelope.id,
                    -32600,
                    "unsupported jsonrpc version",
                )),
            )
                .into_response());
        }
        dispatch_json_rpc(agent, ctx, envelope).await
    } else {
        Ok(StatusCode::NOT_FOUND.into_response())
    }
}

/// JSON-RPC shares the WebSocket RPC pipeline: same registry, same ambient
/// context, same error strings
async fn dispatch_json_rpc<A: Agent>(
    agent: &mut A,
    ctx: AgentCtx<'_, A>,
    envelope: JsonRpcRequest,
) -> Result<Response, AppError> {
    let registry = ctx.registry;
    let JsonRpcRequest {
        method, params, id, ..
    } = envelope;

    match registry.rpc(&method) {
        None => Ok((
            StatusCode::NOT_FOUND,
            AppJson(json_rpc_error(
                id,
                -32601,
                &AppError::MethodNotFound.to_string(),
            )),
        )
            .into_response()),
        Some(RpcMethod::Unary(handler)) => match handler(agent, ctx, params).await {
            Ok(result) => Ok(AppJson(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }))
            .into_response()),
            Err(e) => Ok(AppJson(json_rpc_error(id, -32000, &e.to_string())).into_response()),
        },
        Some(RpcMethod::Streaming(handler)) => {
            // No transport to stream over; run against a discarding sink and
            // answer with the final value
            let sink = StreamingResponse::discarding(random_token(8));
            let monitor = sink.monitor();
            match handler(agent, ctx, sink, params).await {
                Ok(()) => {
                    let result = monitor.take_final().unwrap_or(Value::Null);
                    Ok(AppJson(json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": result,
                    }))
                    .into_response())
                }
                Err(e) => {
                    Ok(AppJson(json_rpc_error(id, -32000, &e.to_string())).into_response())
                }
            }
        }
    }
}
