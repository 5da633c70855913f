//! Wire shapes exchanged with foreground app instances and the host bridge.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::alarms::notify::Notification;
use crate::cache::http::{Request, Response};

/// Contract version for bridge envelopes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Inbound message kinds the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    ScheduleAlarm,
    CancelAlarm,
    ListAlarms,
    CacheNewAssets,
    ClearCache,
    AlarmFired,
    AlarmActionTaken,
    AlarmActionSnoozed,
    ListNotifications,
    SkipWaiting,
}

impl MessageKind {
    /// Render kind to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ScheduleAlarm => "ScheduleAlarm",
            Self::CancelAlarm => "CancelAlarm",
            Self::ListAlarms => "ListAlarms",
            Self::CacheNewAssets => "CacheNewAssets",
            Self::ClearCache => "ClearCache",
            Self::AlarmFired => "AlarmFired",
            Self::AlarmActionTaken => "AlarmActionTaken",
            Self::AlarmActionSnoozed => "AlarmActionSnoozed",
            Self::ListNotifications => "ListNotifications",
            Self::SkipWaiting => "SkipWaiting",
        }
    }

    /// Parse a kind from wire format. Unknown kinds are `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ScheduleAlarm" => Some(Self::ScheduleAlarm),
            "CancelAlarm" => Some(Self::CancelAlarm),
            "ListAlarms" => Some(Self::ListAlarms),
            "CacheNewAssets" => Some(Self::CacheNewAssets),
            "ClearCache" => Some(Self::ClearCache),
            "AlarmFired" => Some(Self::AlarmFired),
            "AlarmActionTaken" => Some(Self::AlarmActionTaken),
            "AlarmActionSnoozed" => Some(Self::AlarmActionSnoozed),
            "ListNotifications" => Some(Self::ListNotifications),
            "SkipWaiting" => Some(Self::SkipWaiting),
            _ => None,
        }
    }

    /// Kinds answered through a reply channel.
    #[must_use]
    pub fn expects_reply(self) -> bool {
        matches!(
            self,
            Self::ListAlarms | Self::CacheNewAssets | Self::ListNotifications
        )
    }
}

/// Message posted by a foreground app instance.
///
/// `kind` stays a raw string so unknown kinds survive decoding and can be
/// ignored instead of rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl ClientMessage {
    #[must_use]
    pub fn new(kind: MessageKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_owned(),
            payload,
        }
    }

    /// Parsed kind, `None` when unknown.
    #[must_use]
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::parse(&self.kind)
    }
}

/// `CancelAlarm` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CancelAlarmPayload {
    pub id: String,
}

/// `AlarmFired` / `AlarmActionTaken` payload sent by the app.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AlarmRefPayload {
    pub id: String,
}

/// `AlarmActionSnoozed` payload sent by the app.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnoozePayload {
    pub id: String,
    #[serde(default)]
    pub delay_minutes: Option<u32>,
}

/// `CacheNewAssets` payload: paths or absolute URLs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheNewAssetsPayload {
    pub urls: Vec<String>,
}

/// `CacheNewAssets` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheNewAssetsReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Message broadcast from the worker to every app instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum OutboundMessage {
    AlarmFired {
        id: String,
        correlation: Value,
    },
    AlarmActionTaken {
        id: String,
        correlation: Value,
    },
    AlarmActionSnoozed {
        id: String,
        #[serde(rename = "newId")]
        new_id: String,
    },
    NotificationClicked {
        id: String,
        correlation: Value,
    },
    /// A background sync asked the app to re-check overdue alarms.
    CheckPendingAlarms,
    /// A periodic sync asked the app to re-check today's schedule.
    CheckMedicationTimes {
        /// Wall time as `H:MM`.
        #[serde(rename = "currentTime")]
        current_time: String,
    },
}

/// Lifecycle and platform event fed into the bridge, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostEvent {
    Install {
        #[serde(default)]
        request_id: Option<String>,
    },
    Activate {
        #[serde(default)]
        request_id: Option<String>,
    },
    Fetch {
        request_id: String,
        request: Request,
    },
    Message {
        #[serde(default)]
        request_id: Option<String>,
        message: ClientMessage,
    },
    NotificationClick {
        tag: String,
        #[serde(default)]
        action: Option<String>,
    },
    NotificationClose {
        tag: String,
    },
    Push {
        #[serde(default)]
        data: Option<String>,
    },
    Sync {
        tag: String,
    },
    PeriodicSync {
        tag: String,
    },
}

/// How a fetch event was answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum FetchReply {
    /// Host should perform the request itself.
    Bypass,
    Respond { response: Response },
    /// Neither network nor cache could answer.
    Failed { error: String },
}

/// Line written by the bridge, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum HostOutput {
    /// Completion of an install or activate event.
    Done {
        v: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        event: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FetchResult {
        v: u32,
        request_id: String,
        #[serde(flatten)]
        reply: FetchReply,
    },
    /// Reply to a request/response message.
    Reply {
        v: u32,
        request_id: String,
        payload: Value,
    },
    /// Message for every app instance.
    Client { v: u32, message: OutboundMessage },
    ShowNotification { v: u32, notification: Notification },
    CloseNotification { v: u32, tag: String },
    FocusOrOpenClient { v: u32, url: String },
    /// Unparseable input line or failed dispatch.
    Error { v: u32, message: String },
}

impl HostOutput {
    #[must_use]
    pub fn done(request_id: Option<String>, event: &str, result: &crate::Result<()>) -> Self {
        Self::Done {
            v: PROTOCOL_VERSION,
            request_id,
            event: event.to_owned(),
            ok: result.is_ok(),
            error: result.as_ref().err().map(ToString::to_string),
        }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            v: PROTOCOL_VERSION,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn kind_names_round_trip() {
        for kind in [
            MessageKind::ScheduleAlarm,
            MessageKind::CancelAlarm,
            MessageKind::ListAlarms,
            MessageKind::CacheNewAssets,
            MessageKind::ClearCache,
            MessageKind::AlarmFired,
            MessageKind::AlarmActionTaken,
            MessageKind::AlarmActionSnoozed,
            MessageKind::ListNotifications,
            MessageKind::SkipWaiting,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("scheduleAlarm"), None);
        assert_eq!(MessageKind::parse("SCHEDULE_NOTIFICATION"), None);
    }

    #[test]
    fn only_list_and_cache_kinds_expect_replies() {
        assert!(MessageKind::ListAlarms.expects_reply());
        assert!(MessageKind::CacheNewAssets.expects_reply());
        assert!(!MessageKind::ScheduleAlarm.expects_reply());
        assert!(!MessageKind::ClearCache.expects_reply());
    }

    #[test]
    fn unknown_kind_still_decodes() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"kind":"Telemetry","payload":{"x":1}}"#).unwrap();
        assert_eq!(msg.kind(), None);
    }

    #[test]
    fn outbound_wire_shape() {
        let json = serde_json::to_value(OutboundMessage::AlarmActionSnoozed {
            id: "m1".to_owned(),
            new_id: "m1#snooze".to_owned(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "AlarmActionSnoozed", "payload": {"id": "m1", "newId": "m1#snooze"}})
        );

        let json = serde_json::to_value(OutboundMessage::CheckPendingAlarms).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "CheckPendingAlarms"}));
    }

    #[test]
    fn host_event_decodes_from_bridge_line() {
        let event: HostEvent = serde_json::from_str(
            r#"{"event":"fetch","requestId":"r1","request":{"url":"http://localhost:8080/icon-72.png"}}"#,
        )
        .unwrap();
        let HostEvent::Fetch { request_id, request } = event else {
            panic!("expected fetch event");
        };
        assert_eq!(request_id, "r1");
        assert_eq!(request.method, "GET");

        let event: HostEvent = serde_json::from_str(
            r#"{"event":"notificationClick","tag":"m1","action":"tomei"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            HostEvent::NotificationClick {
                tag: "m1".to_owned(),
                action: Some("tomei".to_owned())
            }
        );
    }

    #[test]
    fn fetch_result_flattens_outcome() {
        let line = serde_json::to_value(HostOutput::FetchResult {
            v: PROTOCOL_VERSION,
            request_id: "r1".to_owned(),
            reply: FetchReply::Bypass,
        })
        .unwrap();
        assert_eq!(line["type"], "fetchResult");
        assert_eq!(line["requestId"], "r1");
        assert_eq!(line["outcome"], "bypass");
    }
}
