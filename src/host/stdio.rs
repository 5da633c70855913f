//! Stdin/stdout JSON bridge for out-of-process hosts.
//!
//! Reads newline-delimited JSON [`HostEvent`]s, hands each to the [`Worker`]
//! on its own task, and writes [`HostOutput`] lines: fetch results, replies,
//! messages for app instances and platform requests (show/close
//! notification, focus or open a window).
//!
//! Stdout is exclusively reserved for the JSON protocol; all diagnostic
//! output (tracing, logs) must be routed to stderr.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::task::TaskTracker;

use crate::alarms::notify::{ClientFocus, Notification, PlatformHost};
use crate::alarms::scheduler::{Clock, SystemClock};
use crate::cache::backend::CacheBackend;
use crate::cache::http::Network;
use crate::cache::strategy::FetchOutcome;
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::host::contract::{FetchReply, HostEvent, HostOutput, MessageKind, PROTOCOL_VERSION};
use crate::worker::Worker;

/// [`PlatformHost`] that forwards platform requests as output lines.
pub struct StdioPlatformHost {
    out: mpsc::Sender<HostOutput>,
}

impl StdioPlatformHost {
    #[must_use]
    pub fn new(out: mpsc::Sender<HostOutput>) -> Self {
        Self { out }
    }

    async fn emit(&self, output: HostOutput) -> Result<()> {
        self.out
            .send(output)
            .await
            .map_err(|e| WorkerError::Channel(format!("bridge output closed: {e}")))
    }
}

#[async_trait]
impl PlatformHost for StdioPlatformHost {
    async fn show_notification(&self, notification: &Notification) -> Result<()> {
        self.emit(HostOutput::ShowNotification {
            v: PROTOCOL_VERSION,
            notification: notification.clone(),
        })
        .await
    }

    async fn close_notification(&self, tag: &str) -> Result<()> {
        self.emit(HostOutput::CloseNotification {
            v: PROTOCOL_VERSION,
            tag: tag.to_owned(),
        })
        .await
    }

    async fn focus_or_open_client(&self, url: &str) -> Result<ClientFocus> {
        self.emit(HostOutput::FocusOrOpenClient {
            v: PROTOCOL_VERSION,
            url: url.to_owned(),
        })
        .await?;
        Ok(ClientFocus::Requested)
    }
}

/// Run the bridge on the process's stdin and stdout until stdin closes.
///
/// # Errors
///
/// Returns an error if the worker cannot be built or stdin cannot be read.
pub async fn run_stdio_bridge(
    config: &WorkerConfig,
    network: Arc<dyn Network>,
    backend: Arc<dyn CacheBackend>,
) -> Result<()> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    run_bridge(
        stdin,
        tokio::io::stdout(),
        config,
        network,
        backend,
        Arc::new(SystemClock),
    )
    .await
}

/// Run the bridge over arbitrary streams until `input` reaches EOF.
///
/// Three tasks run concurrently:
///
/// 1. **Reader** (this task) parses lines and spawns one handler per event.
/// 2. **Client forwarder** turns broadcast [`crate::host::contract::OutboundMessage`]s
///    into `client` lines.
/// 3. **Writer** owns `output` and writes every line in order of arrival.
///
/// On EOF the bridge waits for in-flight handlers and background refreshes,
/// stops the worker, and drains remaining output before returning.
///
/// # Errors
///
/// Returns an error if the worker cannot be built or `input` fails.
pub async fn run_bridge<R, W>(
    mut input: R,
    output: W,
    config: &WorkerConfig,
    network: Arc<dyn Network>,
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel(config.host.request_capacity.max(1));
    let writer_handle = tokio::spawn(run_writer(out_rx, output));

    let platform = Arc::new(StdioPlatformHost::new(out_tx.clone()));
    let worker = Worker::new(config, network, backend, platform, clock)?;
    let forwarder_handle = tokio::spawn(forward_client_messages(worker.subscribe(), out_tx.clone()));

    let handlers = TaskTracker::new();
    let mut line = String::new();
    let read_result = loop {
        line.clear();
        let bytes_read = match input.read_line(&mut line).await {
            Ok(n) => n,
            Err(e) => break Err(WorkerError::Channel(format!("failed to read input: {e}"))),
        };

        if bytes_read == 0 {
            tracing::info!("input closed (EOF); shutting down bridge");
            break Ok(());
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let event: HostEvent = match serde_json::from_str(trimmed) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "failed to parse host event");
                let _ = out_tx
                    .send(HostOutput::error(format!("failed to parse host event: {e}")))
                    .await;
                continue;
            }
        };

        let worker = worker.clone();
        let out = out_tx.clone();
        handlers.spawn(async move {
            if let Some(output) = handle_event(&worker, event).await {
                let _ = out.send(output).await;
            }
        });
    };

    handlers.close();
    handlers.wait().await;
    worker.settle().await;
    worker.shutdown().await;

    // Dropping the last worker handle closes the broadcast channel, which
    // lets the forwarder drain and exit; then the writer sees its last sender go.
    drop(worker);
    let _ = forwarder_handle.await;
    drop(out_tx);
    let _ = writer_handle.await;

    read_result
}

/// Handle one event, returning the line to write back, if any.
pub async fn handle_event(worker: &Worker, event: HostEvent) -> Option<HostOutput> {
    match event {
        HostEvent::Install { request_id } => {
            let result = worker.install().await.map(|_| ());
            Some(HostOutput::done(request_id, "install", &result))
        }
        HostEvent::Activate { request_id } => {
            let result = worker.activate().await.map(|_| ());
            Some(HostOutput::done(request_id, "activate", &result))
        }
        HostEvent::Fetch {
            request_id,
            request,
        } => {
            let reply = match worker.on_fetch(&request).await {
                Ok(FetchOutcome::Bypass) => FetchReply::Bypass,
                Ok(FetchOutcome::Respond(response)) => FetchReply::Respond { response },
                Err(e) => FetchReply::Failed {
                    error: e.to_string(),
                },
            };
            Some(HostOutput::FetchResult {
                v: PROTOCOL_VERSION,
                request_id,
                reply,
            })
        }
        HostEvent::Message {
            request_id,
            message,
        } => {
            let wants_reply = message.kind().is_some_and(MessageKind::expects_reply);
            match request_id.filter(|_| wants_reply) {
                Some(request_id) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    worker.on_message(message, Some(reply_tx)).await;
                    reply_rx.await.ok().map(|payload| HostOutput::Reply {
                        v: PROTOCOL_VERSION,
                        request_id,
                        payload,
                    })
                }
                None => {
                    worker.on_message(message, None).await;
                    None
                }
            }
        }
        HostEvent::NotificationClick { tag, action } => worker
            .on_notification_click(&tag, action.as_deref())
            .await
            .err()
            .map(|e| HostOutput::error(format!("notification click on {tag}: {e}"))),
        HostEvent::NotificationClose { tag } => {
            worker.on_notification_close(&tag);
            None
        }
        HostEvent::Push { data } => worker
            .on_push(data.as_deref())
            .await
            .err()
            .map(|e| HostOutput::error(format!("push: {e}"))),
        HostEvent::Sync { tag } => {
            worker.on_sync(&tag);
            None
        }
        HostEvent::PeriodicSync { tag } => {
            worker.on_periodic_sync(&tag);
            None
        }
    }
}

async fn forward_client_messages(
    mut events: broadcast::Receiver<crate::host::contract::OutboundMessage>,
    out: mpsc::Sender<HostOutput>,
) {
    loop {
        match events.recv().await {
            Ok(message) => {
                let line = HostOutput::Client {
                    v: PROTOCOL_VERSION,
                    message,
                };
                if out.send(line).await.is_err() {
                    tracing::warn!("bridge output closed; stopping client forwarder");
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(lagged = n, "client forwarder lagged; some messages were dropped");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::debug!("client broadcast closed; stopping forwarder");
                break;
            }
        }
    }
}

async fn run_writer<W: AsyncWrite + Unpin>(mut lines: mpsc::Receiver<HostOutput>, output: W) {
    let mut writer = BufWriter::new(output);
    while let Some(line) = lines.recv().await {
        let json = match serde_json::to_string(&line) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize output line; skipping");
                continue;
            }
        };
        if let Err(e) = write_line(&mut writer, &json).await {
            tracing::warn!(error = %e, "failed to write output; stopping writer");
            break;
        }
    }
}

/// Write a single JSON line to the buffered writer and flush.
async fn write_line<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, json: &str) -> Result<()> {
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| WorkerError::Channel(format!("failed to write output: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| WorkerError::Channel(format!("failed to write newline: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| WorkerError::Channel(format!("failed to flush output: {e}")))?;
    Ok(())
}
