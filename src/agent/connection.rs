use serde_json::Value;
use tokio::sync::mpsc;

/// Messages queued for a connection's writer task
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

/// A live WebSocket bound to one agent instance.
///
/// The instance owns the set of connections; handlers reach them through
/// `AgentCtx`. Each connection carries an immutable id, a mutable user-visible
/// state blob, and its ready state. Writes go through a per-connection channel
/// drained by a writer task, so a slow peer never blocks the instance.
pub struct Connection {
    id: String,
    tx: mpsc::Sender<Outbound>,
    user_state: Value,
    open: bool,
}

impl Connection {
    pub(crate) fn new(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx,
            user_state: Value::Null,
            open: true,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opaque per-connection state, settable by handlers. Not broadcast.
    pub fn user_state(&self) -> &Value {
        &self.user_state
    }

    pub fn set_user_state(&mut self, state: Value) {
        self.user_state = state;
    }

    /// Whether the connection can still accept outbound messages
    pub fn is_open(&self) -> bool {
        self.open && !self.tx.is_closed()
    }

    /// Queue a text message; returns false if the peer is gone
    pub(crate) async fn send_text(&self, text: String) -> bool {
        self.tx.send(Outbound::Text(text)).await.is_ok()
    }

    /// Ask the writer task to close the socket with the given code
    pub(crate) async fn close(&mut self, code: u16, reason: &str) {
        self.open = false;
        let _ = self
            .tx
            .send(Outbound::Close {
                code,
                reason: reason.to_owned(),
            })
            .await;
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Outbound> {
        self.tx.clone()
    }
}
