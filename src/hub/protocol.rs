//! Subscriber protocol.
//!
//! Bidirectional JSON events over the hub's WebSocket. Clients render what
//! the core reports; state is never re-derived client-side.

use serde::{Deserialize, Serialize};

use crate::adapters::{Channel, DisplayMetadata, ProbeMethod};
use crate::analysis::TrackerState;
use crate::db::Measurement;

/// Requests a client may send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    AddTarget {
        identifier: String,
        channel: Channel,
    },
    RemoveTarget {
        target_id: String,
    },
    ListTargets,
    GetAvailableDays {
        target_id: String,
    },
    GetRawForDay {
        target_id: String,
        day: String,
    },
    SetProbeMethod {
        method: ProbeMethod,
    },
}

/// Events the core pushes to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    TargetAdded {
        target_id: String,
        channel: Channel,
        identifier: String,
        display: Option<DisplayMetadata>,
    },
    TargetRemoved {
        target_id: String,
    },
    Targets {
        targets: Vec<TargetSummary>,
    },
    Update(UpdatePayload),
    AvailableDays {
        target_id: String,
        days: Vec<String>,
    },
    RawForDay {
        target_id: String,
        day: String,
        rows: Vec<Measurement>,
    },
    AdapterStatus {
        channel: Channel,
        available: bool,
    },
    Error {
        message: String,
        target_id: Option<String>,
    },
}

/// Live display payload, pushed after every analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub target_id: String,
    pub channel: Channel,
    /// RTT and timestamp of the latest raw measurement in the window.
    pub rtt_ms: Option<u64>,
    pub timestamp_ms: Option<i64>,
    pub state: TrackerState,
    pub confidence: f64,
    pub noise: f64,
    pub responsiveness: f64,
    pub median: Option<f64>,
    pub threshold: Option<f64>,
}

/// One tracked target in a `targets` reply, with its latest verdict so a
/// reconnecting client can render immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    pub target_id: String,
    pub channel: Channel,
    pub identifier: String,
    pub state: Option<TrackerState>,
    pub confidence: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_use_kebab_tags_and_camel_fields() {
        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"add-target","data":{"identifier":"+1 555","channel":"whatsapp"}}"#,
        )
        .expect("parse add-target");
        assert!(matches!(
            event,
            ClientEvent::AddTarget { ref identifier, channel: Channel::Whatsapp }
                if identifier == "+1 555"
        ));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"get-raw-for-day","data":{"targetId":"t1","day":"2025-11-02"}}"#,
        )
        .expect("parse get-raw-for-day");
        assert!(matches!(
            event,
            ClientEvent::GetRawForDay { ref target_id, ref day }
                if target_id == "t1" && day == "2025-11-02"
        ));

        let event: ClientEvent =
            serde_json::from_str(r#"{"event":"list-targets"}"#).expect("parse list-targets");
        assert!(matches!(event, ClientEvent::ListTargets));

        let event: ClientEvent = serde_json::from_str(
            r#"{"event":"set-probe-method","data":{"method":"reaction"}}"#,
        )
        .expect("parse set-probe-method");
        assert!(matches!(
            event,
            ClientEvent::SetProbeMethod { method: ProbeMethod::Reaction }
        ));
    }

    #[test]
    fn update_event_serializes_for_display() {
        let payload = UpdatePayload {
            target_id: "t1".to_string(),
            channel: Channel::Signal,
            rtt_ms: Some(145),
            timestamp_ms: Some(1_700_000_000_000),
            state: TrackerState::Online,
            confidence: 0.9,
            noise: 0.1,
            responsiveness: 1.0,
            median: Some(150.0),
            threshold: Some(195.0),
        };

        let json = serde_json::to_value(ServerEvent::Update(payload)).expect("serialize");
        assert_eq!(json["event"], "update");
        assert_eq!(json["data"]["targetId"], "t1");
        assert_eq!(json["data"]["state"], "Online");
        assert_eq!(json["data"]["rttMs"], 145);
        assert_eq!(json["data"]["threshold"], 195.0);
    }

    #[test]
    fn offline_state_keeps_its_wire_casing() {
        let payload = UpdatePayload {
            target_id: "t1".to_string(),
            channel: Channel::Whatsapp,
            rtt_ms: None,
            timestamp_ms: None,
            state: TrackerState::Offline,
            confidence: 0.8,
            noise: 0.0,
            responsiveness: 0.0,
            median: None,
            threshold: None,
        };

        let json = serde_json::to_value(ServerEvent::Update(payload)).expect("serialize");
        assert_eq!(json["data"]["state"], "OFFLINE");
    }

    #[test]
    fn error_event_omits_nothing_a_client_needs() {
        let json = serde_json::to_value(ServerEvent::Error {
            message: "target is already tracked".to_string(),
            target_id: Some("t1".to_string()),
        })
        .expect("serialize");
        assert_eq!(json["event"], "error");
        assert_eq!(json["data"]["message"], "target is already tracked");
        assert_eq!(json["data"]["targetId"], "t1");
    }

    #[test]
    fn server_events_round_trip() {
        let events = vec![
            ServerEvent::TargetAdded {
                target_id: "t1".to_string(),
                channel: Channel::Whatsapp,
                identifier: "+1 555".to_string(),
                display: None,
            },
            ServerEvent::TargetRemoved {
                target_id: "t1".to_string(),
            },
            ServerEvent::AvailableDays {
                target_id: "t1".to_string(),
                days: vec!["2025-11-02".to_string()],
            },
            ServerEvent::AdapterStatus {
                channel: Channel::Signal,
                available: false,
            },
        ];

        for event in events {
            let json = serde_json::to_string(&event).expect("serialize");
            let parsed: ServerEvent = serde_json::from_str(&json).expect("parse back");
            let rejson = serde_json::to_string(&parsed).expect("re-serialize");
            assert_eq!(json, rejson);
        }
    }
}
