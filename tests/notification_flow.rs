use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use remedio::alarms::{
    ACTION_SNOOZE, ACTION_TAKEN, AckState, ClientFocus, Notification, PlatformHost, TokioClock,
};
use remedio::cache::{MemoryBackend, Network, Request, Response};
use remedio::host::contract::{ClientMessage, MessageKind, OutboundMessage};
use remedio::{Worker, WorkerConfig, WorkerError};
use serde_json::json;
use tokio::sync::broadcast;

#[derive(Default)]
struct RecordingPlatform {
    shown: Mutex<Vec<Notification>>,
    closed: Mutex<Vec<String>>,
    focused: Mutex<Vec<String>>,
}

impl RecordingPlatform {
    fn shown_tags(&self) -> Vec<String> {
        self.shown
            .lock()
            .expect("lock shown")
            .iter()
            .map(|n| n.tag.clone())
            .collect()
    }

    fn closed(&self) -> Vec<String> {
        self.closed.lock().expect("lock closed").clone()
    }
}

#[async_trait]
impl PlatformHost for RecordingPlatform {
    async fn show_notification(&self, notification: &Notification) -> remedio::Result<()> {
        self.shown
            .lock()
            .expect("lock shown")
            .push(notification.clone());
        Ok(())
    }

    async fn close_notification(&self, tag: &str) -> remedio::Result<()> {
        self.closed.lock().expect("lock closed").push(tag.to_owned());
        Ok(())
    }

    async fn focus_or_open_client(&self, url: &str) -> remedio::Result<ClientFocus> {
        self.focused.lock().expect("lock focused").push(url.to_owned());
        Ok(ClientFocus::Focused)
    }
}

struct NoNetwork;

#[async_trait]
impl Network for NoNetwork {
    async fn fetch(&self, request: &Request) -> remedio::Result<Response> {
        Err(WorkerError::Network(format!("offline: {}", request.url)))
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 10, 8, 0, 0)
        .single()
        .expect("valid start time")
}

fn start() -> (Worker, Arc<RecordingPlatform>, broadcast::Receiver<OutboundMessage>) {
    let platform = Arc::new(RecordingPlatform::default());
    let worker = Worker::new(
        &WorkerConfig::default(),
        Arc::new(NoNetwork),
        Arc::new(MemoryBackend::new()),
        Arc::clone(&platform) as Arc<dyn PlatformHost>,
        Arc::new(TokioClock::starting_at(t0())),
    )
    .expect("build worker");
    let events = worker.subscribe();
    (worker, platform, events)
}

async fn schedule(worker: &Worker, id: &str, fire_at: DateTime<Utc>) {
    worker
        .on_message(
            ClientMessage::new(
                MessageKind::ScheduleAlarm,
                json!({
                    "id": id,
                    "fireAt": fire_at,
                    "title": "Take pill",
                    "body": "Losartana 50mg",
                    "correlation": {"medId": 7}
                }),
            ),
            None,
        )
        .await;
}

#[tokio::test(start_paused = true)]
async fn fired_alarm_is_shown_once_then_snoozed() {
    let (worker, platform, mut events) = start();
    schedule(&worker, "m1", t0() + Duration::minutes(5)).await;

    tokio::time::sleep(std::time::Duration::from_secs(4 * 60)).await;
    assert!(platform.shown_tags().is_empty());

    match events.recv().await.expect("fired event") {
        OutboundMessage::AlarmFired { id, correlation } => {
            assert_eq!(id, "m1");
            assert_eq!(correlation, json!({"medId": 7}));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(worker.scheduler().now(), t0() + Duration::minutes(5));
    assert_eq!(platform.shown_tags(), ["m1".to_owned()]);

    let shown = platform.shown.lock().expect("lock shown")[0].clone();
    let actions: Vec<&str> = shown.actions.iter().map(|a| a.action.as_str()).collect();
    assert_eq!(actions, [ACTION_TAKEN, ACTION_SNOOZE]);
    assert!(shown.require_interaction);

    worker
        .on_notification_click("m1", Some(ACTION_SNOOZE))
        .await
        .expect("snooze");

    assert_eq!(platform.closed(), ["m1".to_owned()]);
    let copy = worker.scheduler().get("m1#snooze").expect("snoozed copy");
    assert_eq!(copy.fire_at, t0() + Duration::minutes(15));
    assert_eq!(
        events.recv().await.expect("snoozed event"),
        OutboundMessage::AlarmActionSnoozed {
            id: "m1".to_owned(),
            new_id: "m1#snooze".to_owned()
        }
    );

    match events.recv().await.expect("copy fires") {
        OutboundMessage::AlarmFired { id, .. } => assert_eq!(id, "m1#snooze"),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(worker.scheduler().now(), t0() + Duration::minutes(15));
    assert_eq!(platform.shown_tags(), ["m1".to_owned(), "m1#snooze".to_owned()]);

    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn taken_action_closes_and_broadcasts() {
    let (worker, platform, mut events) = start();
    schedule(&worker, "m1", t0() + Duration::minutes(1)).await;
    events.recv().await.expect("fired event");

    worker
        .on_notification_click("m1", Some(ACTION_TAKEN))
        .await
        .expect("taken");

    assert_eq!(platform.closed(), ["m1".to_owned()]);
    assert_eq!(
        events.recv().await.expect("taken event"),
        OutboundMessage::AlarmActionTaken {
            id: "m1".to_owned(),
            correlation: json!({"medId": 7})
        }
    );
    assert_eq!(worker.scheduler().history()[0].state, AckState::Taken);
    assert!(worker.dispatcher().live().is_empty());
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn body_click_focuses_app_with_correlation() {
    let (worker, platform, mut events) = start();
    schedule(&worker, "m1", t0() + Duration::minutes(1)).await;
    events.recv().await.expect("fired event");

    worker
        .on_notification_click("m1", None)
        .await
        .expect("click");

    assert_eq!(
        platform.focused.lock().expect("lock focused").as_slice(),
        ["http://localhost:8080/".to_owned()]
    );
    assert_eq!(
        events.recv().await.expect("clicked event"),
        OutboundMessage::NotificationClicked {
            id: "m1".to_owned(),
            correlation: json!({"medId": 7})
        }
    );
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn dismiss_only_drops_the_live_projection() {
    let (worker, platform, mut events) = start();
    schedule(&worker, "m1", t0() + Duration::minutes(1)).await;
    events.recv().await.expect("fired event");
    assert_eq!(worker.dispatcher().live().len(), 1);

    worker.on_notification_close("m1");

    assert!(worker.dispatcher().live().is_empty());
    assert!(platform.closed().is_empty());
    assert_eq!(worker.scheduler().awaiting_ack(), vec!["m1".to_owned()]);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn app_acknowledgements_update_ack_state() {
    let (worker, platform, mut events) = start();
    schedule(&worker, "m1", t0() + Duration::minutes(1)).await;
    events.recv().await.expect("fired event");

    worker
        .on_message(ClientMessage::new(MessageKind::AlarmFired, json!({"id": "m1"})), None)
        .await;
    assert_eq!(worker.scheduler().history()[0].state, AckState::Delivered);

    worker
        .on_message(
            ClientMessage::new(
                MessageKind::AlarmActionSnoozed,
                json!({"id": "m1", "delayMinutes": 30}),
            ),
            None,
        )
        .await;

    let copy = worker.scheduler().get("m1#snooze").expect("snoozed copy");
    assert_eq!(copy.fire_at, worker.scheduler().now() + Duration::minutes(30));
    assert_eq!(platform.closed(), ["m1".to_owned()]);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn push_payload_is_shown_with_defaults() {
    let (worker, platform, _events) = start();

    worker.on_push(None).await.expect("empty push ignored");
    worker
        .on_push(Some(r#"{"body":"Hora do remédio"}"#))
        .await
        .expect("push shown");

    let shown = platform.shown.lock().expect("lock shown").clone();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "Meu Remédio");
    assert_eq!(shown[0].tag, "meu-remedio-notification");
    assert_eq!(shown[0].vibrate, vec![200, 100, 200]);
    worker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn snoozed_push_reminder_comes_back() {
    let (worker, platform, mut events) = start();
    worker
        .on_push(Some(r#"{"title":"Dipirona","body":"500mg","data":{"medId":3}}"#))
        .await
        .expect("push shown");

    worker
        .on_notification_click("meu-remedio-notification", Some(ACTION_SNOOZE))
        .await
        .expect("push snoozed");

    assert!(worker.dispatcher().live().is_empty());
    assert_eq!(platform.closed(), ["meu-remedio-notification".to_owned()]);
    let copy = worker
        .scheduler()
        .get("meu-remedio-notification#snooze")
        .expect("deferred copy armed");
    assert_eq!(copy.fire_at, t0() + Duration::minutes(10));
    assert_eq!(
        events.recv().await.expect("snoozed event"),
        OutboundMessage::AlarmActionSnoozed {
            id: "meu-remedio-notification".to_owned(),
            new_id: "meu-remedio-notification#snooze".to_owned()
        }
    );

    match events.recv().await.expect("copy fires") {
        OutboundMessage::AlarmFired { id, correlation } => {
            assert_eq!(id, "meu-remedio-notification#snooze");
            assert_eq!(correlation, json!({"medId": 3}));
        }
        other => panic!("unexpected {other:?}"),
    }
    let shown = platform.shown.lock().expect("lock shown").clone();
    assert_eq!(shown.len(), 2);
    assert_eq!(shown[1].title, "Dipirona");
    assert_eq!(shown[1].body, "⏰ Adiado por 10 minutos: 500mg");
    worker.shutdown().await;
}
