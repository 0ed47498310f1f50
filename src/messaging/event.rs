//! Alert channel wire messages. JSON text frames, tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ai::{Bbox, Classification, ConfidenceBucket};

/// Messages the server sends to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    AnomalyDetected {
        user_id: Uuid,
        stream_id: Uuid,
        result: AlertResult,
        /// Base64-encoded annotated JPEG.
        annotated_frame: String,
        frame_format: String,
    },
}

impl ServerMessage {
    pub fn ping_now() -> Self {
        ServerMessage::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn pong_now() -> Self {
        ServerMessage::Pong {
            timestamp: Utc::now(),
        }
    }
}

/// Messages the client may send to the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping {
        #[serde(default)]
        timestamp: Option<String>,
    },
    Pong {
        #[serde(default)]
        timestamp: Option<String>,
    },
    Ack {
        #[serde(default)]
        stream_id: Option<Uuid>,
    },
}

/// Pixel-space bounding box in wire form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WireBbox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

impl From<Bbox> for WireBbox {
    fn from(bbox: Bbox) -> Self {
        Self {
            x: bbox.x as i32,
            y: bbox.y as i32,
            w: bbox.w as i32,
            h: bbox.h as i32,
        }
    }
}

/// One positive classification, as shipped to clients and recorded in
/// `extra` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertResult {
    pub person_id: u32,
    pub frame_number: u64,
    pub score: f32,
    pub classification: String,
    pub confidence: String,
    pub bbox: WireBbox,
}

impl AlertResult {
    pub fn new(
        person_id: u32,
        frame_number: u64,
        score: f32,
        classification: Classification,
        confidence: ConfidenceBucket,
        bbox: Bbox,
    ) -> Self {
        Self {
            person_id,
            frame_number,
            score,
            classification: classification.as_str().to_string(),
            confidence: confidence.as_str().to_string(),
            bbox: bbox.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_serializes_with_type_tag() {
        let json = serde_json::to_value(ServerMessage::ping_now()).unwrap();
        assert_eq!(json["type"], "ping");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn anomaly_message_shape() {
        let msg = ServerMessage::AnomalyDetected {
            user_id: Uuid::nil(),
            stream_id: Uuid::nil(),
            result: AlertResult::new(
                1,
                24,
                -3.2,
                Classification::Abnormal,
                ConfidenceBucket::High,
                Bbox::new(10.0, 20.0, 30.0, 40.0),
            ),
            annotated_frame: "aGVsbG8=".to_string(),
            frame_format: "jpeg".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "anomaly_detected");
        assert_eq!(json["result"]["person_id"], 1);
        assert_eq!(json["result"]["classification"], "Abnormal");
        assert_eq!(json["result"]["confidence"], "High");
        assert_eq!(json["result"]["bbox"]["x"], 10);
        assert_eq!(json["frame_format"], "jpeg");
    }

    #[test]
    fn client_messages_parse() {
        let ping: ClientMessage =
            serde_json::from_str(r#"{"type":"ping","timestamp":"2026-01-01T00:00:00Z"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping { .. }));

        let pong: ClientMessage = serde_json::from_str(r#"{"type":"pong"}"#).unwrap();
        assert!(matches!(pong, ClientMessage::Pong { .. }));

        let ack: ClientMessage = serde_json::from_str(
            r#"{"type":"ack","stream_id":"550e8400-e29b-41d4-a716-446655440000"}"#,
        )
        .unwrap();
        match ack {
            ClientMessage::Ack { stream_id } => assert!(stream_id.is_some()),
            _ => panic!("expected ack"),
        }

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"bogus"}"#).is_err());
    }
}
