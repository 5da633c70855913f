//! The worker: one owned instance wiring cache, alarms and messaging.
//!
//! A [`Worker`] is created once when the host starts the background process
//! and lives until it is torn down. Nothing survives a teardown except what
//! the cache backend persists; pending alarms are rebuilt by the app.

use std::sync::Arc;

use chrono::Timelike;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use crate::alarms::notify::{self, NotificationDispatcher, PlatformHost};
use crate::alarms::scheduler::{AlarmScheduler, Clock, ScheduledAlarm};
use crate::cache::backend::CacheBackend;
use crate::cache::http::{Network, Request};
use crate::cache::lifecycle::CacheLifecycle;
use crate::cache::store::{CacheStore, Generation};
use crate::cache::strategy::{CacheStrategy, FetchOutcome};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::host::contract::{ClientMessage, OutboundMessage};
use crate::host::router::MessageRouter;

/// Sync tag asking the app to re-check overdue alarms.
pub const SYNC_PENDING_ALARMS: &str = "background-sync";

/// Periodic sync tag asking the app to re-check the day's schedule.
pub const SYNC_CHECK_MEDICATIONS: &str = "check-medications";

struct Inner {
    store: Arc<CacheStore>,
    strategy: CacheStrategy,
    lifecycle: Arc<CacheLifecycle>,
    scheduler: AlarmScheduler,
    dispatcher: Arc<NotificationDispatcher>,
    router: MessageRouter,
    events: broadcast::Sender<OutboundMessage>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// Background worker handle. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
}

impl Worker {
    /// Build the worker and start its fired-alarm loop.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Config`] if the configuration is invalid.
    pub fn new(
        config: &WorkerConfig,
        network: Arc<dyn Network>,
        backend: Arc<dyn CacheBackend>,
        platform: Arc<dyn PlatformHost>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let origin = Url::parse(&config.cache.origin)
            .map_err(|e| WorkerError::Config(format!("cache.origin: {e}")))?;

        let store = Arc::new(CacheStore::new(backend, config.cache.name_prefix.clone()));
        let strategy = CacheStrategy::new(
            Arc::clone(&store),
            Arc::clone(&network),
            origin.clone(),
            config.cache.api_prefix.clone(),
            &config.cache.offline_page,
        )?;
        let lifecycle = Arc::new(CacheLifecycle::new(
            Arc::clone(&store),
            network,
            origin.clone(),
            Generation::new(config.cache.version.clone()),
            config.cache.static_assets.clone(),
        ));

        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        let scheduler = AlarmScheduler::new(fired_tx, &config.alarms, clock);
        let (events, _) = broadcast::channel(config.host.event_capacity.max(1));
        let launch_url = origin
            .join(&config.cache.offline_page)
            .map_or_else(|_| origin.to_string(), |u| u.to_string());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            platform,
            scheduler.clone(),
            events.clone(),
            config.alarms.clone(),
            launch_url,
        ));
        let router = MessageRouter::new(
            scheduler.clone(),
            Arc::clone(&dispatcher),
            Arc::clone(&store),
            Arc::clone(&lifecycle),
            config.alarms.default_snooze_minutes,
        );

        let worker = Self {
            inner: Arc::new(Inner {
                store,
                strategy,
                lifecycle,
                scheduler,
                dispatcher,
                router,
                events,
                tasks: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        };
        worker.spawn_fired_loop(fired_rx);
        info!(version = %config.cache.version, "worker started");
        Ok(worker)
    }

    /// Pre-cache static assets into this build's generation.
    ///
    /// # Errors
    ///
    /// Returns the fetch or storage error; nothing is cached in that case.
    pub async fn install(&self) -> Result<Generation> {
        self.inner.lifecycle.install().await
    }

    /// Make the installed generation current, deleting all others.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Activation`]; the old generation stays current.
    pub async fn activate(&self) -> Result<Generation> {
        self.inner.lifecycle.activate().await
    }

    /// Answer an intercepted request.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Offline`] when a data request cannot be served.
    pub async fn on_fetch(&self, request: &Request) -> Result<FetchOutcome> {
        self.inner.strategy.handle(request).await
    }

    /// Handle a message from a foreground instance.
    pub async fn on_message(&self, message: ClientMessage, reply: Option<oneshot::Sender<Value>>) {
        self.inner.router.on_message(message, reply).await;
    }

    /// The user clicked notification `tag` (an action button or the body).
    ///
    /// # Errors
    ///
    /// Returns the dispatcher error, e.g. snoozing an unknown alarm.
    pub async fn on_notification_click(&self, tag: &str, action: Option<&str>) -> Result<()> {
        self.inner.dispatcher.on_action(action, tag).await
    }

    /// The user dismissed notification `tag`.
    pub fn on_notification_close(&self, tag: &str) {
        self.inner.dispatcher.on_dismiss(tag);
    }

    /// A server push arrived. Empty pushes are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Notification`] if it cannot be shown.
    pub async fn on_push(&self, data: Option<&str>) -> Result<()> {
        match data {
            Some(raw) if !raw.trim().is_empty() => self.inner.dispatcher.show_push(raw).await,
            _ => {
                debug!("push without payload ignored");
                Ok(())
            }
        }
    }

    /// One-off background sync.
    pub fn on_sync(&self, tag: &str) {
        if tag == SYNC_PENDING_ALARMS {
            self.broadcast(OutboundMessage::CheckPendingAlarms);
        } else {
            debug!(tag, "ignoring sync tag");
        }
    }

    /// Periodic background sync.
    pub fn on_periodic_sync(&self, tag: &str) {
        if tag == SYNC_CHECK_MEDICATIONS {
            let now = self.inner.scheduler.now();
            self.broadcast(OutboundMessage::CheckMedicationTimes {
                current_time: format!("{}:{:02}", now.hour(), now.minute()),
            });
        } else {
            debug!(tag, "ignoring periodic sync tag");
        }
    }

    /// Receive every message broadcast to foreground instances.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn scheduler(&self) -> &AlarmScheduler {
        &self.inner.scheduler
    }

    #[must_use]
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.inner.dispatcher
    }

    /// Wait for in-flight background cache refreshes.
    pub async fn settle(&self) {
        self.inner.strategy.settle().await;
    }

    /// Stop timers and the fired-alarm loop, then wait for background work.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.scheduler.clear();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.strategy.settle().await;
        info!("worker stopped");
    }

    fn broadcast(&self, message: OutboundMessage) {
        notify::broadcast(&self.inner.events, message);
    }

    fn spawn_fired_loop(&self, mut fired_rx: mpsc::UnboundedReceiver<ScheduledAlarm>) {
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let events = self.inner.events.clone();
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn(async move {
            loop {
                let alarm = tokio::select! {
                    () = shutdown.cancelled() => break,
                    next = fired_rx.recv() => match next {
                        Some(alarm) => alarm,
                        None => break,
                    },
                };

                if let Err(e) = dispatcher.show(&alarm).await {
                    warn!(id = %alarm.id, error = %e, "failed to show alarm notification");
                }
                notify::broadcast(
                    &events,
                    OutboundMessage::AlarmFired {
                        id: alarm.id,
                        correlation: alarm.correlation,
                    },
                );
            }
            debug!("fired-alarm loop stopped");
        });
    }
}
