#![allow(dead_code)]

use std::time::Duration;

use agent_host::{
    async_trait, Agent, AgentCtx, AgentHost, AgentIdent, AppError, Cors, EmailMessage,
    MethodRegistry, ScheduleQuery, ScheduleWhen, StreamingResponse,
};
use serde_json::{json, Value};

/// The class under test. State shape: an arbitrary blob for the state tests,
/// plus `{"ticks": n}` maintained by the `tick` callback and `{"lastEmail"}`
/// set by `on_email`.
pub struct TestAgent;

async fn add_numbers(
    _agent: &mut TestAgent,
    _ctx: AgentCtx<'_, TestAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
    if sum.fract() == 0.0 {
        Ok(json!(sum as i64))
    } else {
        Ok(json!(sum))
    }
}

async fn boom(
    _agent: &mut TestAgent,
    _ctx: AgentCtx<'_, TestAgent>,
    _args: Vec<Value>,
) -> Result<Value, AppError> {
    Err(anyhow::anyhow!("kaboom").into())
}

async fn stream_chunks(
    _agent: &mut TestAgent,
    _ctx: AgentCtx<'_, TestAgent>,
    mut stream: StreamingResponse,
    _args: Vec<Value>,
) -> Result<(), AppError> {
    stream.send(json!("chunk1")).await?;
    stream.send(json!("chunk2")).await?;
    stream.end(json!("final")).await
}

async fn schedule_tick(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let seconds = args.first().and_then(Value::as_u64).unwrap_or(1);
    let payload = args.get(1).cloned();
    let schedule = ctx
        .schedule(ScheduleWhen::In(seconds), "tick", payload)
        .await?;
    Ok(serde_json::to_value(schedule)?)
}

async fn schedule_cron(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let expr = args
        .first()
        .and_then(Value::as_str)
        .unwrap_or("*/5 * * * *")
        .to_owned();
    let schedule = ctx.schedule(ScheduleWhen::Cron(expr), "tick", None).await?;
    Ok(serde_json::to_value(schedule)?)
}

async fn cancel_schedule(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let id = args.first().and_then(Value::as_str).unwrap_or_default();
    let cancelled = ctx.cancel_schedule(id).await?;
    Ok(json!(cancelled))
}

async fn list_schedules(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    _args: Vec<Value>,
) -> Result<Value, AppError> {
    let schedules = ctx.get_schedules(ScheduleQuery::default()).await?;
    Ok(serde_json::to_value(schedules)?)
}

async fn queue_tick(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let payload = args.first().cloned().unwrap_or(Value::Null);
    let id = ctx.queue("tick", payload).await?;
    Ok(json!(id))
}

async fn self_destruct(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    _args: Vec<Value>,
) -> Result<Value, AppError> {
    ctx.destroy();
    Ok(json!("destroyed"))
}

async fn tick(
    _agent: &mut TestAgent,
    mut ctx: AgentCtx<'_, TestAgent>,
    _payload: Value,
) -> Result<(), AppError> {
    let ticks = ctx.state()["ticks"].as_i64().unwrap_or(0) + 1;
    ctx.set_state(json!({ "ticks": ticks })).await?;
    Ok(())
}

#[async_trait]
impl Agent for TestAgent {
    fn create(_ident: &AgentIdent) -> Self {
        Self
    }

    fn methods(registry: &mut MethodRegistry<Self>) {
        registry.callable("addNumbers", |a, c, v| Box::pin(add_numbers(a, c, v)));
        registry.callable("boom", |a, c, v| Box::pin(boom(a, c, v)));
        registry.callable("scheduleTick", |a, c, v| Box::pin(schedule_tick(a, c, v)));
        registry.callable("scheduleCron", |a, c, v| Box::pin(schedule_cron(a, c, v)));
        registry.callable("cancelSchedule", |a, c, v| Box::pin(cancel_schedule(a, c, v)));
        registry.callable("listSchedules", |a, c, v| Box::pin(list_schedules(a, c, v)));
        registry.callable("queueTick", |a, c, v| Box::pin(queue_tick(a, c, v)));
        registry.callable("selfDestruct", |a, c, v| Box::pin(self_destruct(a, c, v)));
        registry.streaming("streamChunks", |a, c, s, v| Box::pin(stream_chunks(a, c, s, v)));
        registry.callback("tick", |a, c, p| Box::pin(tick(a, c, p)));
    }

    async fn on_email(
        &mut self,
        mut ctx: AgentCtx<'_, Self>,
        email: EmailMessage,
    ) -> Result<(), AppError> {
        ctx.set_state(json!({ "lastEmail": email.subject })).await
    }
}

pub struct TestHost {
    pub host: AgentHost,
    pub base: String,
    _data_dir: tempfile::TempDir,
}

impl TestHost {
    pub fn url(&self, tail: &str) -> String {
        format!("{}/agents/test-agent/{tail}", self.base)
    }

    pub fn ws_url(&self, name: &str) -> String {
        format!(
            "{}/agents/test-agent/{name}",
            self.base.replacen("http", "ws", 1)
        )
    }
}

/// Boot a host with `TestAgent` on an ephemeral port
pub async fn start_host() -> TestHost {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let host = AgentHost::builder()
        .register::<TestAgent>("TestAgent")
        .data_dir(data_dir.path())
        .cors(Cors::Defaults)
        .idle_timeout(Duration::from_secs(120))
        .build();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = host.router();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    TestHost {
        host,
        base: format!("http://{addr}"),
        _data_dir: data_dir,
    }
}

/// Poll `GET /getState` until the predicate holds or ~10s elapse
pub async fn wait_for_state<F>(client: &reqwest::Client, url: &str, predicate: F) -> Value
where
    F: Fn(&Value) -> bool,
{
    for _ in 0..50 {
        let state: Value = client
            .get(url)
            .send()
            .await
            .expect("getState")
            .json()
            .await
            .expect("state body");
        if predicate(&state) {
            return state;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    panic!("state never reached the expected shape");
}
