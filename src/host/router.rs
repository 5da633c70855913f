//! Dispatch of foreground-app messages to the cache and alarm components.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::alarms::notify::NotificationDispatcher;
use crate::alarms::scheduler::{AlarmScheduler, AlarmSpec};
use crate::cache::lifecycle::CacheLifecycle;
use crate::cache::store::CacheStore;
use crate::error::{Result, WorkerError};
use crate::host::contract::{
    AlarmRefPayload, CacheNewAssetsPayload, CacheNewAssetsReply, CancelAlarmPayload,
    ClientMessage, MessageKind, SnoozePayload,
};

/// Single entry point for inbound [`ClientMessage`]s.
pub struct MessageRouter {
    scheduler: AlarmScheduler,
    dispatcher: Arc<NotificationDispatcher>,
    store: Arc<CacheStore>,
    lifecycle: Arc<CacheLifecycle>,
    default_snooze_minutes: u32,
}

impl MessageRouter {
    pub fn new(
        scheduler: AlarmScheduler,
        dispatcher: Arc<NotificationDispatcher>,
        store: Arc<CacheStore>,
        lifecycle: Arc<CacheLifecycle>,
        default_snooze_minutes: u32,
    ) -> Self {
        Self {
            scheduler,
            dispatcher,
            store,
            lifecycle,
            default_snooze_minutes,
        }
    }

    /// Handle one message.
    ///
    /// Unknown kinds are ignored. Failures are logged, never propagated: the
    /// sender of a fire-and-forget message has nobody to report to. A reply is
    /// sent only for request/response kinds and only if `reply` is present.
    pub async fn on_message(&self, message: ClientMessage, reply: Option<oneshot::Sender<Value>>) {
        let Some(kind) = message.kind() else {
            debug!(kind = %message.kind, "ignoring unknown message kind");
            return;
        };

        match self.route(kind, message.payload).await {
            Ok(Some(payload)) => match reply {
                Some(tx) if kind.expects_reply() => {
                    if tx.send(payload).is_err() {
                        debug!(kind = kind.as_str(), "reply receiver dropped");
                    }
                }
                _ => debug!(kind = kind.as_str(), "no reply channel; reply discarded"),
            },
            Ok(None) => {}
            Err(e) => warn!(kind = kind.as_str(), error = %e, "message rejected"),
        }
    }

    /// Route a message to its handler, returning the reply payload if any.
    ///
    /// # Errors
    ///
    /// Returns the handler's error, e.g. [`WorkerError::InvalidCommand`] for a
    /// malformed payload.
    pub async fn route(&self, kind: MessageKind, payload: Value) -> Result<Option<Value>> {
        match kind {
            MessageKind::ScheduleAlarm => self.handle_schedule_alarm(payload),
            MessageKind::CancelAlarm => self.handle_cancel_alarm(payload).await,
            MessageKind::ListAlarms => Ok(Some(self.handle_list_alarms())),
            MessageKind::CacheNewAssets => self.handle_cache_new_assets(payload).await.map(Some),
            MessageKind::ClearCache => self.handle_clear_cache().await,
            MessageKind::AlarmFired => self.handle_alarm_fired_ack(payload),
            MessageKind::AlarmActionTaken => self.handle_action_taken(payload).await,
            MessageKind::AlarmActionSnoozed => self.handle_action_snoozed(payload).await,
            MessageKind::ListNotifications => Ok(Some(self.handle_list_notifications())),
            MessageKind::SkipWaiting => {
                self.lifecycle.skip_waiting().await?;
                Ok(None)
            }
        }
    }

    fn handle_schedule_alarm(&self, payload: Value) -> Result<Option<Value>> {
        let spec: AlarmSpec = parse_payload(MessageKind::ScheduleAlarm, payload)?;
        self.scheduler.schedule(spec)?;
        Ok(None)
    }

    async fn handle_cancel_alarm(&self, payload: Value) -> Result<Option<Value>> {
        let CancelAlarmPayload { id } = parse_payload(MessageKind::CancelAlarm, payload)?;
        self.scheduler.cancel(&id);
        self.dispatcher.close(&id).await;
        Ok(None)
    }

    fn handle_list_alarms(&self) -> Value {
        serde_json::json!({
            "alarms": self.scheduler.list(),
            "awaitingAck": self.scheduler.awaiting_ack(),
        })
    }

    async fn handle_cache_new_assets(&self, payload: Value) -> Result<Value> {
        let reply = match parse_payload::<CacheNewAssetsPayload>(MessageKind::CacheNewAssets, payload)
        {
            Ok(CacheNewAssetsPayload { urls }) => match self.lifecycle.cache_assets(&urls).await {
                Ok(count) => {
                    info!(count, "cached new assets");
                    CacheNewAssetsReply {
                        success: true,
                        error: None,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to cache new assets");
                    CacheNewAssetsReply {
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            },
            Err(e) => CacheNewAssetsReply {
                success: false,
                error: Some(e.to_string()),
            },
        };
        Ok(serde_json::to_value(reply)?)
    }

    async fn handle_clear_cache(&self) -> Result<Option<Value>> {
        match self.store.current().await {
            Some(generation) => {
                self.store.purge_all(&generation).await?;
                info!(%generation, "cache cleared");
            }
            None => debug!("clear cache ignored; no active generation"),
        }
        Ok(None)
    }

    fn handle_alarm_fired_ack(&self, payload: Value) -> Result<Option<Value>> {
        let AlarmRefPayload { id } = parse_payload(MessageKind::AlarmFired, payload)?;
        if !self.scheduler.mark_delivered(&id) {
            debug!(id = %id, "delivery ack for alarm not awaiting one");
        }
        Ok(None)
    }

    async fn handle_action_taken(&self, payload: Value) -> Result<Option<Value>> {
        let AlarmRefPayload { id } = parse_payload(MessageKind::AlarmActionTaken, payload)?;
        self.dispatcher.close(&id).await;
        if self.scheduler.mark_taken(&id).is_none() {
            debug!(id = %id, "taken ack for alarm with no fire record");
        }
        Ok(None)
    }

    async fn handle_action_snoozed(&self, payload: Value) -> Result<Option<Value>> {
        let SnoozePayload { id, delay_minutes } =
            parse_payload(MessageKind::AlarmActionSnoozed, payload)?;
        self.dispatcher
            .snooze(&id, delay_minutes.unwrap_or(self.default_snooze_minutes))
            .await?;
        Ok(None)
    }

    fn handle_list_notifications(&self) -> Value {
        serde_json::json!({ "notifications": self.dispatcher.live() })
    }
}

fn parse_payload<T: DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| WorkerError::InvalidCommand(format!("{} payload: {e}", kind.as_str())))
}
