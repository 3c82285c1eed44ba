mod common;

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use common::start_host;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn connect(url: &str) -> WsClient {
    let (socket, _) = connect_async(url).await.expect("websocket connect");
    socket
}

/// Read frames until the next JSON text message, failing after 5s
async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("read error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("frame is json");
        }
    }
}

async fn send_json(socket: &mut WsClient, value: Value) {
    socket
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send frame");
}

#[tokio::test]
async fn peers_receive_the_current_state_on_connect() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("sync")).await;

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "cf_agent_state");
    assert_eq!(frame["state"], Value::Null);
}

#[tokio::test]
async fn state_pushed_by_one_peer_reaches_the_other() {
    let fixture = start_host().await;
    let mut c1 = connect(&fixture.ws_url("room")).await;
    let mut c2 = connect(&fixture.ws_url("room")).await;

    // Both start with the initial-state sync
    assert_eq!(next_json(&mut c1).await["type"], "cf_agent_state");
    assert_eq!(next_json(&mut c2).await["type"], "cf_agent_state");

    send_json(
        &mut c1,
        json!({"type": "cf_agent_state", "state": {"counter": 1}}),
    )
    .await;

    let frame = next_json(&mut c2).await;
    assert_eq!(frame["type"], "cf_agent_state");
    assert_eq!(frame["state"], json!({"counter": 1}));

    // The store agrees with what peers saw
    let client = reqwest::Client::new();
    let state: Value = client
        .get(fixture.url("room/getState"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(state, json!({"counter": 1}));
}

#[tokio::test]
async fn rpc_round_trips_a_result_by_id() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("rpc")).await;
    next_json(&mut socket).await; // initial state sync

    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "call-1", "method": "addNumbers", "args": [2, 3]}),
    )
    .await;

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "rpc");
    assert_eq!(frame["id"], "call-1");
    assert_eq!(frame["success"], json!(true));
    assert_eq!(frame["result"], json!(5));
    assert!(frame.get("done").is_none());
}

#[tokio::test]
async fn unknown_methods_fail_without_closing_the_connection() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("rpc-miss")).await;
    next_json(&mut socket).await;

    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "x", "method": "nothingHere", "args": []}),
    )
    .await;
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["success"], json!(false));
    assert_eq!(frame["error"], "method not found");

    // The connection is still usable
    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "y", "method": "addNumbers", "args": [1, 1]}),
    )
    .await;
    assert_eq!(next_json(&mut socket).await["result"], json!(2));
}

#[tokio::test]
async fn method_errors_report_as_unsuccessful_rpc_frames() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("rpc-err")).await;
    next_json(&mut socket).await;

    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "b", "method": "boom", "args": []}),
    )
    .await;
    let frame = next_json(&mut socket).await;
    assert_eq!(frame["id"], "b");
    assert_eq!(frame["success"], json!(false));
    assert_eq!(frame["error"], "kaboom");
}

#[tokio::test]
async fn streams_deliver_chunks_in_order_with_one_terminal_frame() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("stream")).await;
    next_json(&mut socket).await;

    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "s1", "method": "streamChunks", "args": []}),
    )
    .await;

    let first = next_json(&mut socket).await;
    assert_eq!(first["result"], json!("chunk1"));
    assert_eq!(first["done"], json!(false));

    let second = next_json(&mut socket).await;
    assert_eq!(second["result"], json!("chunk2"));
    assert_eq!(second["done"], json!(false));

    let last = next_json(&mut socket).await;
    assert_eq!(last["result"], json!("final"));
    assert_eq!(last["done"], json!(true));
    assert_eq!(last["id"], "s1");
}

#[tokio::test]
async fn invalid_json_and_unknown_types_are_ignored() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("noise")).await;
    next_json(&mut socket).await;

    socket
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();
    send_json(&mut socket, json!({"type": "not_a_real_frame"})).await;

    // The protocol keeps working afterwards
    send_json(
        &mut socket,
        json!({"type": "rpc", "id": "ok", "method": "addNumbers", "args": [20, 22]}),
    )
    .await;
    assert_eq!(next_json(&mut socket).await["result"], json!(42));
}

#[tokio::test]
async fn chat_requests_get_a_terminal_response_by_default() {
    let fixture = start_host().await;
    let mut socket = connect(&fixture.ws_url("chat")).await;
    next_json(&mut socket).await;

    send_json(
        &mut socket,
        json!({"type": "cf_agent_use_chat_request", "id": "req-1", "init": {"method": "POST"}}),
    )
    .await;

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "cf_agent_use_chat_response");
    assert_eq!(frame["id"], "req-1");
    assert_eq!(frame["done"], json!(true));
}

#[tokio::test]
async fn chat_messages_sync_to_other_peers_and_persist() {
    let fixture = start_host().await;
    let mut c1 = connect(&fixture.ws_url("chatlog")).await;
    let mut c2 = connect(&fixture.ws_url("chatlog")).await;
    next_json(&mut c1).await;
    next_json(&mut c2).await;

    let messages = json!([{"id": "m1", "role": "user", "content": "hi"}]);
    send_json(
        &mut c1,
        json!({"type": "cf_agent_chat_messages", "messages": messages}),
    )
    .await;

    let frame = next_json(&mut c2).await;
    assert_eq!(frame["type"], "cf_agent_chat_messages");
    assert_eq!(frame["messages"][0]["id"], "m1");

    // A later connection receives the stored log on attach
    let mut c3 = connect(&fixture.ws_url("chatlog")).await;
    assert_eq!(next_json(&mut c3).await["type"], "cf_agent_state");
    let sync = next_json(&mut c3).await;
    assert_eq!(sync["type"], "cf_agent_chat_messages");
    assert_eq!(sync["messages"][0]["content"], "hi");

    // Clearing broadcasts to the others
    send_json(&mut c3, json!({"type": "cf_agent_chat_clear"})).await;
    let frame = next_json(&mut c1).await;
    assert_eq!(frame["type"], "cf_agent_chat_clear");
}
