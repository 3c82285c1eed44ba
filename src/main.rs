use agent_host::{
    cli::Args, AgentCtx, AgentHost, AgentIdent, AppError, Cors, MethodRegistry, ScheduleWhen,
};
use anyhow::Result;
use clap::Parser;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

/// A small demo class: a persistent counter with a callable method, a
/// streaming method, and a scheduled callback.
struct CounterAgent;

impl agent_host::Agent for CounterAgent {
    fn create(_ident: &AgentIdent) -> Self {
        Self
    }

    fn initial_state() -> Value {
        json!({ "counter": 0 })
    }

    fn methods(registry: &mut MethodRegistry<Self>) {
        registry.callable("addNumbers", |a, c, v| Box::pin(add_numbers(a, c, v)));
        registry.callable("increment", |a, c, v| Box::pin(increment(a, c, v)));
        registry.callable("scheduleIncrement", |a, c, v| {
            Box::pin(schedule_increment(a, c, v))
        });
        registry.streaming("countTo", |a, c, s, v| Box::pin(count_to(a, c, s, v)));
        registry.callback("bump", |a, c, p| Box::pin(bump(a, c, p)));
    }
}

async fn add_numbers(
    _agent: &mut CounterAgent,
    _ctx: AgentCtx<'_, CounterAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
    if sum.fract() == 0.0 {
        Ok(json!(sum as i64))
    } else {
        Ok(json!(sum))
    }
}

async fn increment(
    _agent: &mut CounterAgent,
    mut ctx: AgentCtx<'_, CounterAgent>,
    _args: Vec<Value>,
) -> Result<Value, AppError> {
    let next = ctx.state()["counter"].as_i64().unwrap_or(0) + 1;
    ctx.set_state(json!({ "counter": next })).await?;
    Ok(json!(next))
}

/// Schedule a `bump` this many seconds from now (default 5)
async fn schedule_increment(
    _agent: &mut CounterAgent,
    mut ctx: AgentCtx<'_, CounterAgent>,
    args: Vec<Value>,
) -> Result<Value, AppError> {
    let seconds = args.first().and_then(Value::as_u64).unwrap_or(5);
    let schedule = ctx
        .schedule(ScheduleWhen::In(seconds), "bump", None)
        .await?;
    Ok(serde_json::to_value(schedule)?)
}

async fn count_to(
    _agent: &mut CounterAgent,
    _ctx: AgentCtx<'_, CounterAgent>,
    mut stream: agent_host::StreamingResponse,
    args: Vec<Value>,
) -> Result<(), AppError> {
    let n = args.first().and_then(Value::as_u64).unwrap_or(3);
    for i in 1..=n {
        stream.send(json!(i)).await?;
    }
    stream.end(json!("done")).await
}

async fn bump(
    _agent: &mut CounterAgent,
    mut ctx: AgentCtx<'_, CounterAgent>,
    _payload: Value,
) -> Result<(), AppError> {
    let next = ctx.state()["counter"].as_i64().unwrap_or(0) + 1;
    ctx.set_state(json!({ "counter": next })).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let host = AgentHost::builder()
        .register::<CounterAgent>("CounterAgent")
        .prefix(args.prefix.as_str())
        .data_dir(&args.data_dir)
        .cors(Cors::Defaults)
        .build();
    host.serve(args.port).await
}
