use serde::{Deserialize, Serialize};
use serde_json::Value;

// The WebSocket API works by exchanging JSON serialized frames tagged with a
// `type` field. Anything that doesn't parse as a known frame is not part of
// the control protocol and is handed to the agent's `on_message` handler
// instead.

/// Frames a connected peer may send to the agent
#[derive(Deserialize, Debug)]
#[serde(tag = "type")]
pub enum PeerFrame {
    /// Replace the agent state; the new state is broadcast to all other peers
    #[serde(rename = "cf_agent_state")]
    SetState { state: Value },
    /// Invoke a callable method
    #[serde(rename = "rpc")]
    Rpc {
        id: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Deliver an HTTP-shaped request to the chat handler
    #[serde(rename = "cf_agent_use_chat_request")]
    ChatRequest { id: String, init: Value },
    /// Abort the in-flight chat request with the same id
    #[serde(rename = "cf_agent_chat_request_cancel")]
    ChatCancel { id: String },
    /// Sync of the peer's message array
    #[serde(rename = "cf_agent_chat_messages")]
    ChatMessages { messages: Vec<Value> },
    /// Clear the message history
    #[serde(rename = "cf_agent_chat_clear")]
    ChatClear,
}

/// Frames the agent sends to connected peers
#[derive(Serialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum HostFrame {
    /// Notification of new agent state
    #[serde(rename = "cf_agent_state")]
    State { state: Value },
    /// RPC result, error, or streaming chunk. `done` is omitted for one-shot
    /// results, `false` for stream chunks, and `true` exactly once per stream.
    #[serde(rename = "rpc")]
    Rpc {
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        done: Option<bool>,
    },
    /// Chunked chat response body
    #[serde(rename = "cf_agent_use_chat_response")]
    ChatResponse { id: String, body: String, done: bool },
    /// Sync of the stored message array
    #[serde(rename = "cf_agent_chat_messages")]
    ChatMessages { messages: Vec<Value> },
    /// The message history was cleared
    #[serde(rename = "cf_agent_chat_clear")]
    ChatClear,
}

impl HostFrame {
    pub fn rpc_result(id: impl Into<String>, result: Value) -> Self {
        HostFrame::Rpc {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            done: None,
        }
    }

    pub fn rpc_chunk(id: impl Into<String>, chunk: Value) -> Self {
        HostFrame::Rpc {
            id: id.into(),
            success: true,
            result: Some(chunk),
            error: None,
            done: Some(false),
        }
    }

    pub fn rpc_final(id: impl Into<String>, result: Value) -> Self {
        HostFrame::Rpc {
            id: id.into(),
            success: true,
            result: Some(result),
            error: None,
            done: Some(true),
        }
    }

    pub fn rpc_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        HostFrame::Rpc {
            id: id.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            done: None,
        }
    }

    /// Serialize for the wire. `HostFrame` is a plain data enum, so
    /// serialization cannot fail.
    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap()
    }
}

/// Parse an inbound text message as a protocol frame. `None` means the text
/// is not a control frame (unknown type or invalid JSON) and belongs to the
/// user's `on_message` handler.
pub fn parse_peer_frame(text: &str) -> Option<PeerFrame> {
    serde_json::from_str(text).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_frames_parse() {
        let frame = parse_peer_frame(r#"{"type":"cf_agent_state","state":{"counter":1}}"#);
        assert!(matches!(frame, Some(PeerFrame::SetState { .. })));

        let frame = parse_peer_frame(r#"{"type":"rpc","id":"1","method":"add","args":[1,2]}"#);
        match frame {
            Some(PeerFrame::Rpc { id, method, args }) => {
                assert_eq!(id, "1");
                assert_eq!(method, "add");
                assert_eq!(args, vec![json!(1), json!(2)]);
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            parse_peer_frame(r#"{"type":"cf_agent_chat_clear"}"#),
            Some(PeerFrame::ChatClear)
        ));
    }

    #[test]
    fn unknown_and_invalid_frames_are_not_protocol() {
        assert!(parse_peer_frame(r#"{"type":"weird"}"#).is_none());
        assert!(parse_peer_frame("not json at all").is_none());
        assert!(parse_peer_frame(r#"{"no":"type"}"#).is_none());
    }

    #[test]
    fn rpc_frames_serialize_per_protocol() {
        let one_shot = serde_json::to_value(HostFrame::rpc_result("m", json!(42))).unwrap();
        assert_eq!(one_shot, json!({"type":"rpc","id":"m","success":true,"result":42}));

        let chunk = serde_json::to_value(HostFrame::rpc_chunk("s", json!("chunk1"))).unwrap();
        assert_eq!(chunk["done"], json!(false));

        let done = serde_json::to_value(HostFrame::rpc_final("s", json!("final"))).unwrap();
        assert_eq!(done["done"], json!(true));

        let err = serde_json::to_value(HostFrame::rpc_error("x", "boom")).unwrap();
        assert_eq!(err, json!({"type":"rpc","id":"x","success":false,"error":"boom"}));
    }

    #[test]
    fn state_frame_round_trips() {
        let frame = HostFrame::State { state: json!({"a": [1, 2]}) };
        let text = frame.to_text();
        match parse_peer_frame(&text) {
            Some(PeerFrame::SetState { state }) => assert_eq!(state, json!({"a": [1, 2]})),
            other => panic!("unexpected {other:?}"),
        }
    }
}
