use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    agent::{connection::Outbound, protocol::HostFrame, AgentCtx},
    error::AppError,
};

pub type MethodFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'a>>;

/// A remotely callable method returning a single value
pub type UnaryHandler<A> =
    Box<dyn for<'a> Fn(&'a mut A, AgentCtx<'a, A>, Vec<Value>) -> MethodFuture<'a, Value> + Send + Sync>;

/// A remotely callable method writing chunks into a [`StreamingResponse`]
pub type StreamingHandler<A> = Box<
    dyn for<'a> Fn(&'a mut A, AgentCtx<'a, A>, StreamingResponse, Vec<Value>) -> MethodFuture<'a, ()>
        + Send
        + Sync,
>;

/// A named callback invokable by the scheduler and queue engine
pub type CallbackHandler<A> =
    Box<dyn for<'a> Fn(&'a mut A, AgentCtx<'a, A>, Value) -> MethodFuture<'a, ()> + Send + Sync>;

pub(crate) enum RpcMethod<'r, A> {
    Unary(&'r UnaryHandler<A>),
    Streaming(&'r StreamingHandler<A>),
}

/// Per-class method registry. Methods are opt-in: only what is registered
/// here is reachable over RPC, and only registered callbacks can be named by
/// `schedule()` and `queue()`. The registry is built once in
/// `Agent::methods` at class-definition time; nothing is discovered
/// reflectively.
///
/// Handlers are written as free async fns and registered with a boxing
/// closure:
///
/// ```ignore
/// async fn add_numbers(
///     agent: &mut Calculator,
///     ctx: AgentCtx<'_, Calculator>,
///     args: Vec<Value>,
/// ) -> Result<Value, AppError> { ... }
///
/// fn methods(registry: &mut MethodRegistry<Self>) {
///     registry.callable("addNumbers", |a, c, v| Box::pin(add_numbers(a, c, v)));
/// }
/// ```
pub struct MethodRegistry<A> {
    unary: HashMap<&'static str, UnaryHandler<A>>,
    streaming: HashMap<&'static str, StreamingHandler<A>>,
    callbacks: HashMap<&'static str, CallbackHandler<A>>,
}

impl<A> Default for MethodRegistry<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> MethodRegistry<A> {
    pub fn new() -> Self {
        Self {
            unary: HashMap::new(),
            streaming: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Mark a method as remotely callable
    pub fn callable<F>(&mut self, name: &'static str, handler: F)
    where
        F: for<'a> Fn(&'a mut A, AgentCtx<'a, A>, Vec<Value>) -> MethodFuture<'a, Value>
            + Send
            + Sync
            + 'static,
    {
        self.unary.insert(name, Box::new(handler));
    }

    /// Mark a streaming method as remotely callable
    pub fn streaming<F>(&mut self, name: &'static str, handler: F)
    where
        F: for<'a> Fn(&'a mut A, AgentCtx<'a, A>, StreamingResponse, Vec<Value>) -> MethodFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.streaming.insert(name, Box::new(handler));
    }

    /// Register a callback that `schedule()` and `queue()` may name
    pub fn callback<F>(&mut self, name: &'static str, handler: F)
    where
        F: for<'a> Fn(&'a mut A, AgentCtx<'a, A>, Value) -> MethodFuture<'a, ()>
            + Send
            + Sync
            + 'static,
    {
        self.callbacks.insert(name, Box::new(handler));
    }

    pub fn is_callable(&self, name: &str) -> bool {
        self.unary.contains_key(name) || self.streaming.contains_key(name)
    }

    pub fn has_callback(&self, name: &str) -> bool {
        self.callbacks.contains_key(name)
    }

    pub(crate) fn rpc(&self, name: &str) -> Option<RpcMethod<'_, A>> {
        if let Some(handler) = self.unary.get(name) {
            return Some(RpcMethod::Unary(handler));
        }
        self.streaming.get(name).map(RpcMethod::Streaming)
    }

    pub(crate) fn get_callback(&self, name: &str) -> Option<&CallbackHandler<A>> {
        self.callbacks.get(name)
    }
}

/// One-way sink handed to streaming methods. `send` emits a `done:false`
/// chunk, `end` emits the `done:true` final; writing after `end` fails.
pub struct StreamingResponse {
    id: String,
    tx: Option<mpsc::Sender<Outbound>>,
    ended: Arc<AtomicBool>,
    final_value: Arc<Mutex<Option<Value>>>,
}

/// Dispatcher-side view of a sink that was moved into a handler
pub(crate) struct StreamMonitor {
    ended: Arc<AtomicBool>,
    final_value: Arc<Mutex<Option<Value>>>,
}

impl StreamingResponse {
    /// A sink that frames chunks onto a connection's outbound channel
    pub(crate) fn for_connection(id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            tx: Some(tx),
            ended: Arc::new(AtomicBool::new(false)),
            final_value: Arc::new(Mutex::new(None)),
        }
    }

    /// A sink with no transport. Chunks are dropped and only the final value
    /// is retained; used when a streaming method is invoked over unary HTTP.
    pub(crate) fn discarding(id: String) -> Self {
        Self {
            id,
            tx: None,
            ended: Arc::new(AtomicBool::new(false)),
            final_value: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn monitor(&self) -> StreamMonitor {
        StreamMonitor {
            ended: Arc::clone(&self.ended),
            final_value: Arc::clone(&self.final_value),
        }
    }

    /// Emit one chunk. A disconnected peer is not an error; the chunk is
    /// dropped and the handler keeps running.
    pub async fn send(&mut self, chunk: Value) -> Result<(), AppError> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(AppError::StreamClosed);
        }
        if let Some(tx) = &self.tx {
            let frame = HostFrame::rpc_chunk(self.id.clone(), chunk);
            if tx.send(Outbound::Text(frame.to_text())).await.is_err() {
                debug!(id = %self.id, "dropping stream chunk for closed connection");
            }
        }
        Ok(())
    }

    /// Emit the final value and close the stream
    pub async fn end(&mut self, result: Value) -> Result<(), AppError> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(AppError::StreamClosed);
        }
        *self.final_value.lock().unwrap() = Some(result.clone());
        if let Some(tx) = &self.tx {
            let frame = HostFrame::rpc_final(self.id.clone(), result);
            let _ = tx.send(Outbound::Text(frame.to_text())).await;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl StreamMonitor {
    pub(crate) fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub(crate) fn take_final(&self) -> Option<Value> {
        self.final_value.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn sink_emits_chunks_then_final() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut sink = StreamingResponse::for_connection("s".into(), tx);
        let monitor = sink.monitor();

        sink.send(json!("chunk1")).await.unwrap();
        sink.send(json!("chunk2")).await.unwrap();
        assert!(!monitor.ended());
        sink.end(json!("final")).await.unwrap();
        assert!(monitor.ended());
        assert_eq!(monitor.take_final(), Some(json!("final")));

        let mut frames = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            frames.push(serde_json::from_str::<Value>(&text).unwrap());
        }
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0]["done"], json!(false));
        assert_eq!(frames[1]["result"], json!("chunk2"));
        assert_eq!(frames[2]["done"], json!(true));
    }

    #[tokio::test]
    async fn writing_after_end_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let mut sink = StreamingResponse::for_connection("s".into(), tx);
        sink.end(json!(null)).await.unwrap();

        let err = sink.send(json!("late")).await.unwrap_err();
        assert_eq!(err.to_string(), "StreamingResponse is already closed");
        assert!(sink.end(json!(null)).await.is_err());
        assert!(sink.is_closed());
    }

    #[tokio::test]
    async fn discarding_sink_keeps_only_the_final_value() {
        let mut sink = StreamingResponse::discarding("h".into());
        let monitor = sink.monitor();
        sink.send(json!("dropped")).await.unwrap();
        sink.end(json!({"kept": true})).await.unwrap();
        assert_eq!(monitor.take_final(), Some(json!({"kept": true})));
    }
}
