/// Agent classes, instances, connections, and the control protocol.
pub mod agent;
/// Command-line arguments for the host binary.
pub mod cli;
/// The shared error type and JSON body plumbing.
pub mod error;
/// The MCP client manager: remote tool-server connections and OAuth.
pub mod mcp;
/// Class-name normalization and deterministic agent identifiers.
pub mod names;
/// URL routing, CORS, and WebSocket upgrades.
pub mod router;
/// Schedule normalization and cron math.
pub mod schedule;
/// The per-agent embedded store.
pub mod storage;
/// Small shared helpers: default paths and random tokens.
pub mod utils;

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tracing::info;

use agent::instance::{self, Command};
pub use agent::{
    current_agent, Agent, AgentCtx, AgentIdent, AgentRequest, CallContext, ChatRequest,
    ChatResponseStream, EmailMessage, StateSource,
};
pub use agent::{connection::Connection, registry::MethodRegistry, registry::StreamingResponse};
// Implementors of `Agent` need the same attribute macro the trait was
// declared with
pub use async_trait::async_trait;
pub use error::{AppError, AppJson, ErrorResponse};
use names::{agent_id, kebab_case};
pub use schedule::{Schedule, ScheduleKind, ScheduleQuery, ScheduleWhen};

/// Package name, reused for the data directory and the MCP client identity.
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// CORS behavior for matched agent routes
#[derive(Clone, Debug, Default)]
pub enum Cors {
    /// Preflight requests fall through to the agent
    #[default]
    Disabled,
    /// `Access-Control-Allow-Origin: *`, methods `GET, POST, HEAD, OPTIONS`,
    /// credentials `true`
    Defaults,
    /// The configured headers are written verbatim and nothing else
    Headers(Vec<(String, String)>),
}

/// Host-wide configuration
#[derive(Clone, Debug)]
pub struct HostOptions {
    /// Leading path segment of agent URLs
    pub prefix: String,
    /// Where per-agent databases live
    pub data_dir: PathBuf,
    pub cors: Cors,
    /// How long an instance with no connections and no traffic stays live
    pub idle_timeout: Duration,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            prefix: "agents".to_owned(),
            data_dir: utils::data_dir(),
            cors: Cors::Disabled,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

pub(crate) struct InstanceHandle {
    pub(crate) tx: mpsc::Sender<Command>,
    pub(crate) generation: u64,
}

type SpawnFn = fn(AgentIdent, Arc<HostInner>, u64) -> InstanceHandle;

pub(crate) struct ClassEntry {
    spawn: SpawnFn,
}

pub(crate) struct HostInner {
    pub(crate) classes: HashMap<String, ClassEntry>,
    pub(crate) instances: DashMap<(String, String), InstanceHandle>,
    pub(crate) options: HostOptions,
    pub(crate) generation: AtomicU64,
}

/// The application state that hosts every agent class. Resolving
/// `(class, name)` always lands on the same logical instance: live instances
/// are found in the map, evicted ones are re-hydrated transparently from
/// their database.
#[derive(Clone)]
pub struct AgentHost {
    pub(crate) inner: Arc<HostInner>,
}

/// Builder for [`AgentHost`]; register classes, then `build()`
#[derive(Default)]
pub struct AgentHostBuilder {
    classes: HashMap<String, ClassEntry>,
    options: HostOptions,
}

impl AgentHostBuilder {
    /// Register an agent class. The name is normalized to kebab-case for
    /// routing, so `register::<Counter>("CounterAgent")` serves under
    /// `/agents/counter-agent/...`.
    pub fn register<A: Agent>(mut self, class_name: &str) -> Self {
        let class = kebab_case(class_name);
        self.classes.insert(
            class,
            ClassEntry {
                spawn: instance::spawn::<A>,
            },
        );
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.options.prefix = prefix.into();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.data_dir = dir.into();
        self
    }

    pub fn cors(mut self, cors: Cors) -> Self {
        self.options.cors = cors;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.options.idle_timeout = timeout;
        self
    }

    pub fn build(self) -> AgentHost {
        AgentHost {
            inner: Arc::new(HostInner {
                classes: self.classes,
                instances: DashMap::new(),
                options: self.options,
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl AgentHost {
    pub fn builder() -> AgentHostBuilder {
        AgentHostBuilder::default()
    }

    /// The axum router serving this host. Requests that don't match the
    /// agent URL grammar fall through to a 404.
    pub fn router(&self) -> axum::Router {
        router::build_router(self.clone())
    }

    /// Bind and serve until shutdown
    pub async fn serve(&self, port: u16) -> Result<()> {
        let app = self.router();
        let tcp_listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        info!("Server listening on port {}", port);
        axum::serve(tcp_listener, app).await?;
        Ok(())
    }

    /// Whether a class is registered under the given (kebab-case) name
    pub(crate) fn has_class(&self, class: &str) -> bool {
        self.inner.classes.contains_key(class)
    }

    /// The mailbox for `(class, name)`, spawning the instance if it is not
    /// live. `class` must already be kebab-case.
    fn sender_for(&self, class: &str, name: &str) -> Option<mpsc::Sender<Command>> {
        let entry = self.inner.classes.get(class)?;
        let key = (class.to_owned(), name.to_owned());
        let tx = match self.inner.instances.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => occupied.get().tx.clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let ident = AgentIdent {
                    class: class.to_owned(),
                    name: name.to_owned(),
                    id: agent_id(class, name),
                };
                let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                let handle = (entry.spawn)(ident, Arc::clone(&self.inner), generation);
                let tx = handle.tx.clone();
                vacant.insert(handle);
                tx
            }
        };
        Some(tx)
    }

    /// Deliver a command, re-hydrating once if the resolved instance turns
    /// out to have stopped in the meantime
    pub(crate) async fn send_command(
        &self,
        class: &str,
        name: &str,
        cmd: Command,
    ) -> Result<(), AppError> {
        let Some(tx) = self.sender_for(class, name) else {
            return Err(anyhow!("no agent class registered as {class:?}").into());
        };
        let cmd = match tx.send(cmd).await {
            Ok(()) => return Ok(()),
            Err(mpsc::error::SendError(cmd)) => cmd,
        };
        // The instance stopped between resolution and delivery; drop the
        // stale entry and hydrate a fresh one
        let key = (class.to_owned(), name.to_owned());
        self.inner
            .instances
            .remove_if(&key, |_, handle| handle.tx.is_closed());
        let Some(tx) = self.sender_for(class, name) else {
            return Err(anyhow!("no agent class registered as {class:?}").into());
        };
        tx.send(cmd)
            .await
            .map_err(|_| anyhow!("agent instance {class}/{name} is unavailable").into())
    }

    /// Route an email to `(class, name)`, invoking its `on_email` handler
    pub async fn deliver_email(
        &self,
        class_name: &str,
        name: &str,
        email: EmailMessage,
    ) -> Result<(), AppError> {
        let class = kebab_case(class_name);
        let (reply, rx) = oneshot::channel();
        self.send_command(&class, name, Command::Email { email, reply })
            .await?;
        rx.await
            .map_err(|_| anyhow!("agent instance dropped the email"))?
    }

    /// Push a live instance out of memory without touching its rows. The
    /// next request re-hydrates it; persisted state, schedules, and queue
    /// items all survive.
    pub async fn evict(&self, class_name: &str, name: &str) {
        let class = kebab_case(class_name);
        let key = (class, name.to_owned());
        let tx = self.inner.instances.get(&key).map(|handle| handle.tx.clone());
        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(Command::Evict { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// Destroy `(class, name)`: cancel schedules, close connections, delete
    /// every persisted row
    pub async fn destroy(&self, class_name: &str, name: &str) -> Result<(), AppError> {
        let class = kebab_case(class_name);
        let (reply, rx) = oneshot::channel();
        self.send_command(&class, name, Command::Destroy { reply })
            .await?;
        rx.await
            .map_err(|_| anyhow!("agent instance dropped the destroy request"))?
    }
}
