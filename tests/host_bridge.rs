use std::sync::Arc;

use async_trait::async_trait;
use remedio::alarms::SystemClock;
use remedio::cache::{MemoryBackend, Network, Request, Response};
use remedio::host::stdio::run_bridge;
use remedio::WorkerConfig;
use serde_json::Value;
use tokio::io::AsyncReadExt;

struct EchoNetwork;

#[async_trait]
impl Network for EchoNetwork {
    async fn fetch(&self, request: &Request) -> remedio::Result<Response> {
        Ok(Response::ok("text/plain", request.url.path().to_owned()))
    }
}

fn config() -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.cache.origin = "http://app.test".to_owned();
    config.cache.static_assets = vec!["/".to_owned()];
    config
}

async fn run(input: &str) -> Vec<Value> {
    let (output, mut output_reader) = tokio::io::duplex(1 << 20);
    run_bridge(
        input.as_bytes(),
        output,
        &config(),
        Arc::new(EchoNetwork),
        Arc::new(MemoryBackend::new()),
        Arc::new(SystemClock),
    )
    .await
    .expect("bridge runs to EOF");

    let mut raw = String::new();
    output_reader
        .read_to_string(&mut raw)
        .await
        .expect("read bridge output");
    raw.lines()
        .map(|line| serde_json::from_str(line).expect("every output line is JSON"))
        .collect()
}

fn find<'a>(lines: &'a [Value], kind: &str) -> Vec<&'a Value> {
    lines.iter().filter(|l| l["type"] == kind).collect()
}

#[tokio::test]
async fn malformed_line_yields_error_and_bridge_continues() {
    let lines = run(concat!(
        "{not json\n",
        "\n",
        r#"{"event":"message","requestId":"r1","message":{"kind":"ListAlarms"}}"#,
        "\n",
    ))
    .await;

    let errors = find(&lines, "error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["message"]
        .as_str()
        .expect("error text")
        .contains("failed to parse host event"));

    let replies = find(&lines, "reply");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["requestId"], "r1");
    assert_eq!(replies[0]["payload"]["alarms"], serde_json::json!([]));
}

#[tokio::test]
async fn fetch_events_report_outcomes() {
    let lines = run(concat!(
        r#"{"event":"fetch","requestId":"f1","request":{"url":"https://cdn.test/lib.js"}}"#,
        "\n",
        r#"{"event":"fetch","requestId":"f2","request":{"url":"http://app.test/api/meds","accept":"application/json"}}"#,
        "\n",
    ))
    .await;

    let results = find(&lines, "fetchResult");
    assert_eq!(results.len(), 2);
    let by_id = |id: &str| {
        results
            .iter()
            .find(|r| r["requestId"] == id)
            .copied()
            .expect("result for request")
    };
    assert_eq!(by_id("f1")["outcome"], "bypass");
    assert_eq!(by_id("f2")["outcome"], "respond");
    assert_eq!(by_id("f2")["response"]["status"], 200);
}

#[tokio::test]
async fn install_and_sync_produce_done_and_client_lines() {
    let lines = run(concat!(
        r#"{"event":"install","requestId":"i1"}"#,
        "\n",
        r#"{"event":"sync","tag":"background-sync"}"#,
        "\n",
        r#"{"event":"message","requestId":"r2","message":{"kind":"ScheduleAlarm","payload":{"id":"m1","recurrence":"every 8 hours"}}}"#,
        "\n",
    ))
    .await;

    let done = find(&lines, "done");
    assert_eq!(done.len(), 1);
    assert_eq!(done[0]["event"], "install");
    assert_eq!(done[0]["ok"], true);

    let client = find(&lines, "client");
    assert!(client
        .iter()
        .any(|c| c["message"]["kind"] == "CheckPendingAlarms"));

    assert!(find(&lines, "reply").is_empty(), "ScheduleAlarm never replies");
}

#[tokio::test]
async fn notification_click_on_unknown_alarm_reports_error() {
    let lines = run(concat!(
        r#"{"event":"notificationClick","tag":"ghost","action":"adiar"}"#,
        "\n",
        r#"{"event":"notificationClick","tag":"ghost"}"#,
        "\n",
    ))
    .await;

    assert_eq!(find(&lines, "error").len(), 1);
    assert_eq!(find(&lines, "closeNotification").len(), 1);
    assert_eq!(find(&lines, "focusOrOpenClient").len(), 1);
    assert!(find(&lines, "client")
        .iter()
        .any(|c| c["message"]["kind"] == "NotificationClicked"));
}
