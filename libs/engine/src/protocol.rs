//! Wire types for the engine control protocol.
//!
//! Frames are newline-delimited JSON. A request carries a client-assigned
//! `id`; the engine answers with a reply frame echoing that `id`. Frames
//! without an `id` are unsolicited events for active subscriptions.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum Request {
    Identify { token: String },
    ListScenes,
    CreateScene { scene: String },
    GetActiveScene,
    SetActiveScene { scene: String },
    SetSourceEnabled { source: String, enabled: bool },
    GetSourceSettings { source: String },
    SetSourceSettings { source: String, settings: serde_json::Value },
    GetSourceActive { source: String },
    StartStream,
    StopStream,
    GetStreamStatus,
    GetStats,
    GetVideoSettings,
    Subscribe { kind: EventKind },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    StreamState,
    ConnectionState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum Event {
    StreamState { active: bool, reconnecting: bool },
    ConnectionState { connected: bool },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::StreamState { .. } => EventKind::StreamState,
            Event::ConnectionState { .. } => EventKind::ConnectionState,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFrame {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Reply(ReplyFrame),
    Event(Event),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneList {
    pub scenes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveScene {
    pub scene: String,
}

/// Presence report for a single source.
///
/// `active` means the source is switched on; `live` means it carries a
/// non-trivial signal (frames/audio actually flowing).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SourceActive {
    pub active: bool,
    pub live: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub active: bool,
    pub reconnecting: bool,
    pub bytes_sent: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub cpu_pct: f64,
    pub fps: f64,
    pub skipped_frames: u64,
    pub total_frames: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSettings {
    pub base_width: u32,
    pub base_height: u32,
    pub fps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_and_event_frames_disambiguate() {
        let raw = r#"{"id":7,"ok":true,"data":{"scenes":["a","b"]}}"#;
        match serde_json::from_str::<Inbound>(raw).unwrap() {
            Inbound::Reply(reply) => {
                assert_eq!(reply.id, 7);
                assert!(reply.ok);
                let list: SceneList = serde_json::from_value(reply.data.unwrap()).unwrap();
                assert_eq!(list.scenes, vec!["a", "b"]);
            }
            other => panic!("expected reply, got {:?}", other),
        }

        let raw = r#"{"event":"stream-state","payload":{"active":true,"reconnecting":false}}"#;
        match serde_json::from_str::<Inbound>(raw).unwrap() {
            Inbound::Event(Event::StreamState {
                active,
                reconnecting,
            }) => {
                assert!(active);
                assert!(!reconnecting);
            }
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn call_frame_flattens_request() {
        let frame = CallFrame {
            id: 1,
            request: Request::SetActiveScene {
                scene: "Failover".to_string(),
            },
        };
        let raw = serde_json::to_string(&frame).unwrap();
        assert!(raw.contains(r#""id":1"#));
        assert!(raw.contains(r#""type":"setActiveScene"#));
        assert!(raw.contains(r#""scene":"Failover"#));
    }

    #[test]
    fn error_reply_keeps_error_text() {
        let raw = r#"{"id":3,"ok":false,"error":"no such scene"}"#;
        match serde_json::from_str::<Inbound>(raw).unwrap() {
            Inbound::Reply(reply) => {
                assert!(!reply.ok);
                assert_eq!(reply.error.as_deref(), Some("no such scene"));
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }
}
