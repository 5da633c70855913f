//! Notification rendering and action handling.
//!
//! The dispatcher turns fired alarms into platform notifications tagged with
//! the alarm id, so showing the same alarm again replaces the old
//! notification. It also interprets what the user clicked.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::alarms::scheduler::{AlarmScheduler, ScheduledAlarm};
use crate::config::AlarmConfig;
use crate::error::{Result, WorkerError};
use crate::host::contract::OutboundMessage;

/// Action id for "mark taken".
pub const ACTION_TAKEN: &str = "tomei";

/// Action id for "snooze".
pub const ACTION_SNOOZE: &str = "adiar";

/// Tag used by push notifications that carry none.
pub const DEFAULT_PUSH_TAG: &str = "meu-remedio-notification";

/// A button attached to a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationAction {
    pub action: String,
    pub title: String,
    pub icon: String,
}

/// Everything the platform needs to render one notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub title: String,
    pub body: String,
    /// Equal to the alarm id for reminders.
    pub tag: String,
    pub icon: String,
    pub badge: String,
    pub actions: Vec<NotificationAction>,
    /// Best effort; ignored by platforms without vibration.
    pub vibrate: Vec<u32>,
    pub require_interaction: bool,
    pub silent: bool,
    /// Correlation payload, passed through untouched.
    pub data: serde_json::Value,
}

/// Live notification as tracked by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub correlation: serde_json::Value,
    pub shown_at: DateTime<Utc>,
}

/// What happened when asking the platform to bring the app forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientFocus {
    /// An existing window was focused.
    Focused,
    /// No window existed; a new one was opened.
    Opened,
    /// Handed to an out-of-process host; outcome not reported back.
    Requested,
    /// The platform could do neither.
    Unavailable,
}

/// Platform surface: notification tray plus app windows.
#[async_trait]
pub trait PlatformHost: Send + Sync + 'static {
    /// Show (or replace, by tag) a notification. Returns once the platform confirms.
    async fn show_notification(&self, notification: &Notification) -> Result<()>;

    /// Close every notification with this tag.
    async fn close_notification(&self, tag: &str) -> Result<()>;

    /// Focus an existing app window, or open one at `url`.
    async fn focus_or_open_client(&self, url: &str) -> Result<ClientFocus>;
}

/// Platform that renders nothing.
#[derive(Debug, Default)]
pub struct NoopPlatformHost;

#[async_trait]
impl PlatformHost for NoopPlatformHost {
    async fn show_notification(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }

    async fn close_notification(&self, _tag: &str) -> Result<()> {
        Ok(())
    }

    async fn focus_or_open_client(&self, _url: &str) -> Result<ClientFocus> {
        Ok(ClientFocus::Unavailable)
    }
}

/// Optional fields of a push payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PushPayload {
    pub title: Option<String>,
    pub body: Option<String>,
    pub icon: Option<String>,
    pub tag: Option<String>,
    pub silent: Option<bool>,
    pub data: Option<serde_json::Value>,
}

/// Send `message` to every connected app instance.
pub(crate) fn broadcast(events: &broadcast::Sender<OutboundMessage>, message: OutboundMessage) {
    if events.send(message).is_err() {
        debug!("no connected clients; message dropped");
    }
}

/// Renders alarms as notifications and routes user actions.
pub struct NotificationDispatcher {
    platform: Arc<dyn PlatformHost>,
    scheduler: AlarmScheduler,
    events: broadcast::Sender<OutboundMessage>,
    style: AlarmConfig,
    launch_url: String,
    live: Mutex<HashMap<String, NotificationRecord>>,
}

impl NotificationDispatcher {
    pub fn new(
        platform: Arc<dyn PlatformHost>,
        scheduler: AlarmScheduler,
        events: broadcast::Sender<OutboundMessage>,
        style: AlarmConfig,
        launch_url: impl Into<String>,
    ) -> Self {
        Self {
            platform,
            scheduler,
            events,
            style,
            launch_url: launch_url.into(),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Show a fired alarm with tag = alarm id and the taken/snooze actions.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Notification`] if the platform refuses.
    pub async fn show(&self, alarm: &ScheduledAlarm) -> Result<()> {
        let notification = self.render(
            &alarm.title,
            &alarm.body,
            &alarm.id,
            None,
            false,
            alarm.correlation.clone(),
        );
        self.display(notification).await
    }

    /// Show a server-pushed message.
    ///
    /// JSON payloads may set title, body, icon, tag, silent and data; any other
    /// text becomes the body.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Notification`] if the platform refuses.
    pub async fn show_push(&self, raw: &str) -> Result<()> {
        let payload = match serde_json::from_str::<PushPayload>(raw) {
            Ok(payload) => payload,
            Err(_) => PushPayload {
                body: Some(raw.to_owned()).filter(|b| !b.trim().is_empty()),
                ..PushPayload::default()
            },
        };

        let notification = self.render(
            payload.title.as_deref().unwrap_or(&self.style.app_title),
            payload.body.as_deref().unwrap_or("Lembrete do Meu Remédio"),
            payload.tag.as_deref().unwrap_or(DEFAULT_PUSH_TAG),
            payload.icon,
            payload.silent.unwrap_or(false),
            payload.data.unwrap_or_else(|| serde_json::json!({})),
        );
        self.display(notification).await
    }

    /// Handle a click on notification `tag`. `action` is `None` for the body.
    ///
    /// # Errors
    ///
    /// Returns an error if snoozing fails (e.g. the alarm is unknown).
    pub async fn on_action(&self, action: Option<&str>, tag: &str) -> Result<()> {
        match action.filter(|a| !a.is_empty()) {
            Some(ACTION_TAKEN) => {
                self.mark_taken(tag).await;
                Ok(())
            }
            Some(ACTION_SNOOZE) => self
                .snooze(tag, self.style.default_snooze_minutes)
                .await
                .map(|_| ()),
            other => {
                if let Some(unknown) = other {
                    debug!(action = unknown, tag, "unknown notification action; treating as click");
                }
                self.open_app(tag).await
            }
        }
    }

    /// The user swiped the notification away. Alarm state is untouched.
    pub fn on_dismiss(&self, tag: &str) {
        self.lock().remove(tag);
        debug!(tag, "notification dismissed");
    }

    /// Close the notification and report the dose as taken to every client.
    pub async fn mark_taken(&self, tag: &str) {
        let record = self.close(tag).await;
        let correlation = self
            .scheduler
            .mark_taken(tag)
            .map(|alarm| alarm.correlation)
            .or_else(|| record.map(|r| r.correlation))
            .unwrap_or_default();

        info!(id = tag, "dose marked as taken");
        self.broadcast(OutboundMessage::AlarmActionTaken {
            id: tag.to_owned(),
            correlation,
        });
    }

    /// Defer the reminder behind notification `tag` by `delay_minutes`, then
    /// close the notification.
    ///
    /// Notifications the scheduler never armed (pushes) are deferred from
    /// their live record. Nothing is closed when the snooze fails.
    ///
    /// # Errors
    ///
    /// Propagates [`AlarmScheduler::snooze`] errors; [`WorkerError::UnknownAlarm`]
    /// when `tag` is neither a known alarm nor a live notification.
    pub async fn snooze(&self, tag: &str, delay_minutes: u32) -> Result<ScheduledAlarm> {
        let copy = match self.scheduler.snooze(tag, delay_minutes) {
            Err(WorkerError::UnknownAlarm(_)) => {
                let record = self
                    .lock()
                    .get(tag)
                    .cloned()
                    .ok_or_else(|| WorkerError::UnknownAlarm(tag.to_owned()))?;
                debug!(tag, "snoozing untracked notification");
                self.scheduler
                    .snooze_untracked(&self.as_alarm(record), delay_minutes)?
            }
            other => other?,
        };

        self.close(tag).await;
        self.broadcast(OutboundMessage::AlarmActionSnoozed {
            id: tag.to_owned(),
            new_id: copy.id.clone(),
        });
        Ok(copy)
    }

    /// Close a notification by tag, returning its record if it was live.
    pub async fn close(&self, tag: &str) -> Option<NotificationRecord> {
        if let Err(e) = self.platform.close_notification(tag).await {
            warn!(tag, error = %e, "failed to close notification");
        }
        self.lock().remove(tag)
    }

    /// Live notifications, most recent first.
    #[must_use]
    pub fn live(&self) -> Vec<NotificationRecord> {
        let mut records: Vec<NotificationRecord> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| b.shown_at.cmp(&a.shown_at).then_with(|| a.tag.cmp(&b.tag)));
        records
    }

    async fn open_app(&self, tag: &str) -> Result<()> {
        let record = self.close(tag).await;
        let focus = self.platform.focus_or_open_client(&self.launch_url).await?;
        debug!(tag, ?focus, "notification body clicked");

        let correlation = record.map(|r| r.correlation).unwrap_or_else(|| {
            self.scheduler
                .history()
                .into_iter()
                .rev()
                .find(|r| r.alarm.id == tag)
                .map(|r| r.alarm.correlation)
                .unwrap_or_default()
        });
        self.broadcast(OutboundMessage::NotificationClicked {
            id: tag.to_owned(),
            correlation,
        });
        Ok(())
    }

    fn broadcast(&self, message: OutboundMessage) {
        broadcast(&self.events, message);
    }

    fn as_alarm(&self, record: NotificationRecord) -> ScheduledAlarm {
        let now = self.scheduler.now();
        ScheduledAlarm {
            id: record.tag,
            medication: None,
            fire_at: now,
            title: record.title,
            body: record.body,
            recurrence: None,
            anchor: now,
            snooze_of: None,
            correlation: record.correlation,
        }
    }

    async fn display(&self, notification: Notification) -> Result<()> {
        self.platform
            .show_notification(&notification)
            .await
            .map_err(|e| WorkerError::Notification(format!("{}: {e}", notification.tag)))?;

        debug!(tag = %notification.tag, "notification shown");
        let record = NotificationRecord {
            tag: notification.tag.clone(),
            title: notification.title,
            body: notification.body,
            correlation: notification.data,
            shown_at: self.scheduler.now(),
        };
        self.lock().insert(record.tag.clone(), record);
        Ok(())
    }

    fn render(
        &self,
        title: &str,
        body: &str,
        tag: &str,
        icon: Option<String>,
        silent: bool,
        data: serde_json::Value,
    ) -> Notification {
        Notification {
            title: title.to_owned(),
            body: body.to_owned(),
            tag: tag.to_owned(),
            icon: icon.unwrap_or_else(|| self.style.icon.clone()),
            badge: self.style.badge.clone(),
            actions: vec![
                NotificationAction {
                    action: ACTION_TAKEN.to_owned(),
                    title: "✅ Tomei".to_owned(),
                    icon: self.style.badge.clone(),
                },
                NotificationAction {
                    action: ACTION_SNOOZE.to_owned(),
                    title: format!("⏰ Adiar {}min", self.style.default_snooze_minutes),
                    icon: self.style.badge.clone(),
                },
            ],
            vibrate: self.style.vibration.clone(),
            require_interaction: self.style.require_interaction,
            silent,
            data,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, NotificationRecord>> {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::alarms::scheduler::SystemClock;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        shown: Mutex<Vec<Notification>>,
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl PlatformHost for Recorder {
        async fn show_notification(&self, notification: &Notification) -> Result<()> {
            self.shown.lock().unwrap().push(notification.clone());
            Ok(())
        }

        async fn close_notification(&self, tag: &str) -> Result<()> {
            self.closed.lock().unwrap().push(tag.to_owned());
            Ok(())
        }

        async fn focus_or_open_client(&self, _url: &str) -> Result<ClientFocus> {
            Ok(ClientFocus::Focused)
        }
    }

    fn dispatcher(platform: Arc<Recorder>) -> (NotificationDispatcher, broadcast::Receiver<OutboundMessage>) {
        let (fired_tx, _fired_rx) = mpsc::unbounded_channel();
        let config = AlarmConfig::default();
        let scheduler = AlarmScheduler::new(fired_tx, &config, Arc::new(SystemClock));
        let (events, rx) = broadcast::channel(16);
        (
            NotificationDispatcher::new(platform, scheduler, events, config, "/"),
            rx,
        )
    }

    #[tokio::test]
    async fn push_text_payload_becomes_body() {
        let platform = Arc::new(Recorder::default());
        let (dispatcher, _rx) = dispatcher(Arc::clone(&platform));

        dispatcher.show_push("Hora do remédio").await.unwrap();

        let shown = platform.shown.lock().unwrap();
        assert_eq!(shown[0].title, "Meu Remédio");
        assert_eq!(shown[0].body, "Hora do remédio");
        assert_eq!(shown[0].tag, DEFAULT_PUSH_TAG);
        assert_eq!(shown[0].actions.len(), 2);
    }

    #[tokio::test]
    async fn push_json_payload_overrides_defaults() {
        let platform = Arc::new(Recorder::default());
        let (dispatcher, _rx) = dispatcher(Arc::clone(&platform));

        dispatcher
            .show_push(r#"{"title":"Dipirona","tag":"p1","silent":true,"data":{"medId":3}}"#)
            .await
            .unwrap();

        let shown = platform.shown.lock().unwrap();
        assert_eq!(shown[0].title, "Dipirona");
        assert_eq!(shown[0].body, "Lembrete do Meu Remédio");
        assert!(shown[0].silent);
        assert_eq!(shown[0].data["medId"], 3);
    }

    #[tokio::test]
    async fn same_tag_replaces_live_record() {
        let platform = Arc::new(Recorder::default());
        let (dispatcher, _rx) = dispatcher(Arc::clone(&platform));

        dispatcher.show_push(r#"{"tag":"p1","body":"one"}"#).await.unwrap();
        dispatcher.show_push(r#"{"tag":"p1","body":"two"}"#).await.unwrap();

        let live = dispatcher.live();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].body, "two");
    }

    #[tokio::test]
    async fn body_click_focuses_and_forwards_correlation() {
        let platform = Arc::new(Recorder::default());
        let (dispatcher, mut rx) = dispatcher(Arc::clone(&platform));

        dispatcher
            .show_push(r#"{"tag":"p1","data":{"medId":9}}"#)
            .await
            .unwrap();
        dispatcher.on_action(None, "p1").await.unwrap();

        assert_eq!(platform.closed.lock().unwrap().as_slice(), ["p1".to_owned()]);
        assert!(dispatcher.live().is_empty());
        match rx.recv().await.unwrap() {
            OutboundMessage::NotificationClicked { id, correlation } => {
                assert_eq!(id, "p1");
                assert_eq!(correlation["medId"], 9);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn snoozing_unknown_alarm_is_an_error() {
        let platform = Arc::new(Recorder::default());
        let (dispatcher, _rx) = dispatcher(Arc::clone(&platform));
        let err = dispatcher.on_action(Some(ACTION_SNOOZE), "ghost").await;
        assert!(matches!(err, Err(WorkerError::UnknownAlarm(_))));
        assert!(platform.closed.lock().unwrap().is_empty());
    }
}
