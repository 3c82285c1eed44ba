mod common;

use serde_json::{json, Value};

use common::{start_host, wait_for_state};

async fn rpc(client: &reqwest::Client, url: &str, method: &str, params: Value) -> Value {
    let body: Value = client
        .post(url)
        .json(&json!({"jsonrpc": "2.0", "method": method, "params": params, "id": "t"}))
        .send()
        .await
        .expect("rpc request")
        .json()
        .await
        .expect("rpc body");
    assert!(
        body.get("error").is_none(),
        "rpc {method} failed: {body}"
    );
    body["result"].clone()
}

#[tokio::test]
async fn delayed_schedules_fire_their_callback() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("timer/");

    let schedule = rpc(&client, &url, "scheduleTick", json!([1])).await;
    assert_eq!(schedule["type"], "delayed");
    assert_eq!(schedule["delaySeconds"], json!(1));
    assert_eq!(schedule["callback"], "tick");

    let state = wait_for_state(&client, &fixture.url("timer/getState"), |state| {
        state["ticks"] == json!(1)
    })
    .await;
    assert_eq!(state["ticks"], json!(1));

    // One-shot rows are gone after firing
    let schedules = rpc(&client, &url, "listSchedules", json!([])).await;
    assert_eq!(schedules, json!([]));
}

#[tokio::test]
async fn schedules_round_trip_across_eviction() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("durable/");

    let created = rpc(
        &client,
        &url,
        "scheduleTick",
        json!([3600, {"note": "later"}]),
    )
    .await;

    fixture.host.evict("TestAgent", "durable").await;

    let schedules = rpc(&client, &url, "listSchedules", json!([])).await;
    let listed = &schedules[0];
    assert_eq!(listed["id"], created["id"]);
    assert_eq!(listed["type"], created["type"]);
    assert_eq!(listed["time"], created["time"]);
    assert_eq!(listed["payload"], json!({"note": "later"}));
}

#[tokio::test]
async fn cron_schedules_record_their_next_fire() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("cron/");

    let before = chrono_now_seconds();
    let schedule = rpc(&client, &url, "scheduleCron", json!(["*/5 * * * *"])).await;
    assert_eq!(schedule["type"], "cron");
    assert_eq!(schedule["cron"], "*/5 * * * *");
    let time = schedule["time"].as_i64().unwrap();
    assert!(time > before, "next fire {time} is in the future");
    // A five-minute cadence never schedules more than 300s out
    assert!(time <= before + 301);
}

fn chrono_now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

#[tokio::test]
async fn cancelled_schedules_never_fire() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("cancel/");

    let schedule = rpc(&client, &url, "scheduleTick", json!([3600])).await;
    let id = schedule["id"].as_str().unwrap().to_owned();

    let cancelled = rpc(&client, &url, "cancelSchedule", json!([id])).await;
    assert_eq!(cancelled, json!(true));

    let schedules = rpc(&client, &url, "listSchedules", json!([])).await;
    assert_eq!(schedules, json!([]));

    // Cancelling twice is a no-op
    let again = rpc(&client, &url, "cancelSchedule", json!([schedule["id"]])).await;
    assert_eq!(again, json!(false));
}

#[tokio::test]
async fn queue_items_run_in_insertion_order() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("worker/");

    for i in 0..3 {
        rpc(&client, &url, "queueTick", json!([{"n": i}])).await;
    }

    let state = wait_for_state(&client, &fixture.url("worker/getState"), |state| {
        state["ticks"] == json!(3)
    })
    .await;
    assert_eq!(state["ticks"], json!(3));
}

#[tokio::test]
async fn missed_fires_replay_on_rehydration() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("sleeper/");

    // Queue work, then immediately evict; the item is persisted but unfired
    rpc(&client, &url, "queueTick", json!([null])).await;
    fixture.host.evict("TestAgent", "sleeper").await;

    // Hydration replays the due item before serving this read
    let state = wait_for_state(&client, &fixture.url("sleeper/getState"), |state| {
        state["ticks"] == json!(1)
    })
    .await;
    assert_eq!(state["ticks"], json!(1));
}

#[tokio::test]
async fn destroy_wipes_every_row() {
    let fixture = start_host().await;
    let client = reqwest::Client::new();
    let url = fixture.url("doomed/");

    client
        .post(fixture.url("doomed/setState"))
        .json(&json!({"keep": "nothing"}))
        .send()
        .await
        .unwrap();
    rpc(&client, &url, "scheduleTick", json!([3600])).await;
    rpc(&client, &url, "selfDestruct", json!([])).await;

    // The next request hydrates a fresh instance with no surviving rows
    let state: Value = client
        .get(fixture.url("doomed/getState"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state, Value::Null);

    let schedules = rpc(&client, &url, "listSchedules", json!([])).await;
    assert_eq!(schedules, json!([]));
}
