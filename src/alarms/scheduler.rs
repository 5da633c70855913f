//! Reminder timers.
//!
//! The scheduler owns a map from alarm id to a pending alarm and the tokio
//! task sleeping until it fires. Fired alarms are sent on the channel passed
//! to [`AlarmScheduler::new`]; whoever drains it shows the notification.
//!
//! Alarms live in memory only. If the process is torn down, pending alarms
//! are gone and the foreground app re-issues its `ScheduleAlarm` commands on
//! next load.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alarms::rule::Recurrence;
use crate::config::AlarmConfig;
use crate::error::{Result, WorkerError};

/// Suffix appended to the root id to name its snoozed copy.
pub const SNOOZE_SUFFIX: &str = "#snooze";

const DEFERRED_PREFIX: &str = "⏰ Adiado por ";

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// Real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock derived from the tokio runtime clock.
///
/// Advances with `tokio::time`, so it follows a paused or auto-advanced
/// runtime in tests while timers and timestamps stay consistent.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    wall_origin: DateTime<Utc>,
    origin: tokio::time::Instant,
}

impl TokioClock {
    #[must_use]
    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::starting_at(Utc::now())
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed =
            Duration::from_std(self.origin.elapsed()).unwrap_or_else(|_| Duration::zero());
        self.wall_origin + elapsed
    }
}

/// Recurrence as sent by the app: a structured rule or a free-text instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecurrenceSpec {
    Rule(Recurrence),
    Instruction(String),
}

impl RecurrenceSpec {
    /// Resolve to a validated rule.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidSchedule`] for zero or unparsable rules.
    pub fn resolve(&self) -> Result<Recurrence> {
        match self {
            Self::Rule(rule) => {
                rule.validate()?;
                Ok(rule.clone())
            }
            Self::Instruction(text) => Recurrence::parse(text),
        }
    }
}

/// `ScheduleAlarm` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSpec {
    pub id: String,
    /// Explicit fire instant (RFC 3339).
    #[serde(default)]
    pub fire_at: Option<DateTime<Utc>>,
    /// Explicit fire instant as epoch milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default, alias = "recurrenceSpec")]
    pub recurrence: Option<RecurrenceSpec>,
    /// Anchor for interval rules; defaults to now.
    #[serde(default)]
    pub base_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Medication reference, opaque here.
    #[serde(default)]
    pub medication: Option<String>,
    #[serde(default)]
    pub correlation: serde_json::Value,
}

/// A pending reminder firing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledAlarm {
    pub id: String,
    pub medication: Option<String>,
    pub fire_at: DateTime<Utc>,
    pub title: String,
    pub body: String,
    pub recurrence: Option<Recurrence>,
    /// Base time interval recurrences step from.
    pub anchor: DateTime<Utc>,
    /// Root alarm id when this is a snoozed copy.
    pub snooze_of: Option<String>,
    pub correlation: serde_json::Value,
}

/// `ListAlarms` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmSummary {
    pub id: String,
    pub fire_at: DateTime<Utc>,
    pub title: String,
    pub recurrence: Option<String>,
    pub snooze_of: Option<String>,
}

impl From<&ScheduledAlarm> for AlarmSummary {
    fn from(alarm: &ScheduledAlarm) -> Self {
        Self {
            id: alarm.id.clone(),
            fire_at: alarm.fire_at,
            title: alarm.title.clone(),
            recurrence: alarm.recurrence.as_ref().map(ToString::to_string),
            snooze_of: alarm.snooze_of.clone(),
        }
    }
}

/// What the user (or app) did with a fired alarm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AckState {
    /// Fired; nobody has reacted yet.
    Pending,
    /// The app confirmed it saw the `AlarmFired` event.
    Delivered,
    /// Marked as taken.
    Taken,
    /// Deferred into another alarm.
    Snoozed {
        new_id: String,
    },
}

/// One fire, kept until evicted by the history limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckRecord {
    pub alarm: ScheduledAlarm,
    pub fired_at: DateTime<Utc>,
    pub state: AckState,
}

impl AckRecord {
    /// Still waiting for "taken" or "snooze".
    #[must_use]
    pub fn awaiting_user(&self) -> bool {
        matches!(self.state, AckState::Pending | AckState::Delivered)
    }
}

struct PendingAlarm {
    alarm: ScheduledAlarm,
    token: u64,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct SchedulerState {
    pending: HashMap<String, PendingAlarm>,
    acks: VecDeque<AckRecord>,
    next_token: u64,
}

struct Shared {
    state: Mutex<SchedulerState>,
    clock: Arc<dyn Clock>,
    horizon: Duration,
    history_limit: usize,
    cancel_cascades_to_snooze: bool,
    fired_tx: mpsc::UnboundedSender<ScheduledAlarm>,
}

/// Reminder scheduler. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AlarmScheduler {
    shared: Arc<Shared>,
}

impl AlarmScheduler {
    /// Create a scheduler sending fired alarms to `fired_tx`.
    pub fn new(
        fired_tx: mpsc::UnboundedSender<ScheduledAlarm>,
        config: &AlarmConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                clock,
                horizon: config.horizon(),
                history_limit: config.history_limit.max(1),
                cancel_cascades_to_snooze: config.cancel_cascades_to_snooze,
                fired_tx,
            }),
        }
    }

    /// Current time according to the scheduler's clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Validate and arm an alarm, replacing any pending alarm with the same id.
    ///
    /// Only the next occurrence of a recurrence is computed. A past explicit
    /// time fires immediately (one-shot) or rolls forward (recurring).
    ///
    /// # Errors
    ///
    /// - [`WorkerError::InvalidSchedule`] if no fire time can be resolved.
    /// - [`WorkerError::BeyondHorizon`] if the fire time is too far out.
    pub fn schedule(&self, spec: AlarmSpec) -> Result<ScheduledAlarm> {
        let now = self.now();
        let alarm = resolve(spec, now)?;
        self.check_horizon(&alarm, now)?;

        info!(
            id = %alarm.id,
            fire_at = %alarm.fire_at,
            recurring = alarm.recurrence.is_some(),
            "alarm scheduled"
        );
        self.arm(alarm.clone());
        Ok(alarm)
    }

    /// Remove a pending alarm. Unknown or already-fired ids are a no-op.
    ///
    /// Returns `true` if something was cancelled. A timer that already
    /// started firing is not retracted.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let mut cancelled = remove_pending(&mut state, id);
        if self.shared.cancel_cascades_to_snooze {
            cancelled |= remove_pending(&mut state, &snooze_id(id));
        }
        drop(state);

        if cancelled {
            info!(id, "alarm cancelled");
        } else {
            debug!(id, "cancel ignored; no pending alarm");
        }
        cancelled
    }

    /// Defer alarm `id` by `delay_minutes` into a new alarm.
    ///
    /// The copy fires once at `now + delay`, is named `{root}#snooze`
    /// (replacing an earlier copy), and leaves the parent's own recurrence
    /// untouched.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::InvalidSchedule`] for a zero delay.
    /// - [`WorkerError::UnknownAlarm`] if `id` is neither pending nor recently fired.
    pub fn snooze(&self, id: &str, delay_minutes: u32) -> Result<ScheduledAlarm> {
        check_snooze_delay(delay_minutes)?;
        let source = self
            .find(id)
            .ok_or_else(|| WorkerError::UnknownAlarm(id.to_owned()))?;
        Ok(self.defer(&source, delay_minutes))
    }

    /// Defer a reminder this scheduler never armed, such as a pushed one.
    ///
    /// The copy is built exactly as for [`Self::snooze`], with `source.id` as root.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::InvalidSchedule`] for a zero delay.
    pub fn snooze_untracked(
        &self,
        source: &ScheduledAlarm,
        delay_minutes: u32,
    ) -> Result<ScheduledAlarm> {
        check_snooze_delay(delay_minutes)?;
        Ok(self.defer(source, delay_minutes))
    }

    fn defer(&self, source: &ScheduledAlarm, delay_minutes: u32) -> ScheduledAlarm {
        let now = self.now();
        let id = source.id.as_str();
        let root = source.snooze_of.clone().unwrap_or_else(|| source.id.clone());
        let fire_at = now + Duration::minutes(i64::from(delay_minutes));
        let copy = ScheduledAlarm {
            id: snooze_id(&root),
            medication: source.medication.clone(),
            fire_at,
            title: source.title.clone(),
            body: deferred_body(&source.body, delay_minutes),
            recurrence: None,
            anchor: fire_at,
            snooze_of: Some(root),
            correlation: source.correlation.clone(),
        };

        self.set_ack_state(
            id,
            AckState::Snoozed {
                new_id: copy.id.clone(),
            },
        );
        info!(id, new_id = %copy.id, fire_at = %copy.fire_at, "alarm snoozed");
        self.arm(copy.clone());
        copy
    }

    /// Fire a pending alarm now instead of waiting for its timer.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::UnknownAlarm`] if `id` is not pending.
    pub fn trigger_now(&self, id: &str) -> Result<()> {
        let alarm = {
            let mut state = self.lock();
            let entry = state
                .pending
                .remove(id)
                .ok_or_else(|| WorkerError::UnknownAlarm(id.to_owned()))?;
            entry.timer.abort();
            entry.alarm
        };
        self.fire(alarm);
        Ok(())
    }

    /// Post-timer work: record the fire, re-arm a recurrence under the same
    /// id, and hand the alarm to the dispatcher channel.
    pub fn fire(&self, alarm: ScheduledAlarm) {
        let now = self.now();
        info!(id = %alarm.id, title = %alarm.title, "alarm fired");

        {
            let mut state = self.lock();
            state.acks.push_back(AckRecord {
                alarm: alarm.clone(),
                fired_at: now,
                state: AckState::Pending,
            });
            while state.acks.len() > self.shared.history_limit {
                state.acks.pop_front();
            }
        }

        if let Some(rule) = &alarm.recurrence {
            let next = rule
                .next_after(alarm.anchor, now.max(alarm.fire_at))
                .map(|fire_at| ScheduledAlarm {
                    fire_at,
                    ..alarm.clone()
                });
            match next.and_then(|next| self.check_horizon(&next, now).map(|()| next)) {
                Ok(next) => {
                    debug!(id = %next.id, fire_at = %next.fire_at, "recurrence re-armed");
                    self.arm(next);
                }
                Err(e) => warn!(id = %alarm.id, error = %e, "recurrence not re-armed"),
            }
        }

        if self.shared.fired_tx.send(alarm).is_err() {
            debug!("fired-alarm channel closed; notification dropped");
        }
    }

    /// Mark the latest fire of `id` as seen by the app.
    pub fn mark_delivered(&self, id: &str) -> bool {
        let mut state = self.lock();
        match latest_ack_mut(&mut state, id) {
            Some(record) if record.state == AckState::Pending => {
                record.state = AckState::Delivered;
                true
            }
            _ => false,
        }
    }

    /// Mark the latest fire of `id` as taken, returning the fired alarm.
    pub fn mark_taken(&self, id: &str) -> Option<ScheduledAlarm> {
        let mut state = self.lock();
        let record = latest_ack_mut(&mut state, id)?;
        record.state = AckState::Taken;
        Some(record.alarm.clone())
    }

    /// Pending alarm by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ScheduledAlarm> {
        self.lock().pending.get(id).map(|p| p.alarm.clone())
    }

    /// Pending alarms ordered by fire time.
    #[must_use]
    pub fn list(&self) -> Vec<AlarmSummary> {
        let state = self.lock();
        let mut alarms: Vec<AlarmSummary> =
            state.pending.values().map(|p| AlarmSummary::from(&p.alarm)).collect();
        alarms.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        alarms
    }

    /// Fire records, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<AckRecord> {
        self.lock().acks.iter().cloned().collect()
    }

    /// Ids fired but not yet taken or snoozed.
    #[must_use]
    pub fn awaiting_ack(&self) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state
            .acks
            .iter()
            .filter(|r| r.awaiting_user())
            .map(|r| r.alarm.id.clone())
            .collect();
        ids.dedup();
        ids
    }

    /// Abort every timer. Used at worker shutdown.
    pub fn clear(&self) {
        let mut state = self.lock();
        for (_, entry) in state.pending.drain() {
            entry.timer.abort();
        }
    }

    fn check_horizon(&self, alarm: &ScheduledAlarm, now: DateTime<Utc>) -> Result<()> {
        let delay = alarm.fire_at - now;
        if delay > self.shared.horizon {
            return Err(WorkerError::BeyondHorizon {
                id: alarm.id.clone(),
                delay_secs: delay.num_seconds(),
                horizon_secs: self.shared.horizon.num_seconds(),
            });
        }
        Ok(())
    }

    fn find(&self, id: &str) -> Option<ScheduledAlarm> {
        let state = self.lock();
        if let Some(pending) = state.pending.get(id) {
            return Some(pending.alarm.clone());
        }
        state
            .acks
            .iter()
            .rev()
            .find(|r| r.alarm.id == id)
            .map(|r| r.alarm.clone())
    }

    fn set_ack_state(&self, id: &str, ack: AckState) {
        let mut state = self.lock();
        if let Some(record) = latest_ack_mut(&mut state, id) {
            record.state = ack;
        }
    }

    fn arm(&self, alarm: ScheduledAlarm) {
        let delay = (alarm.fire_at - self.now()).to_std().unwrap_or_default();
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);

        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        let id = alarm.id.clone();

        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                AlarmScheduler { shared }.timer_elapsed(&id, token);
            }
        });

        if let Some(previous) = state.pending.insert(
            alarm.id.clone(),
            PendingAlarm {
                alarm,
                token,
                timer,
            },
        ) {
            previous.timer.abort();
        }
    }

    fn timer_elapsed(&self, id: &str, token: u64) {
        let alarm = {
            let mut state = self.lock();
            let current = state.pending.get(id).is_some_and(|e| e.token == token);
            if current {
                state.pending.remove(id).map(|e| e.alarm)
            } else {
                None
            }
        };
        if let Some(alarm) = alarm {
            self.fire(alarm);
        }
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Id of the snoozed copy of `root`.
#[must_use]
pub fn snooze_id(root: &str) -> String {
    format!("{root}{SNOOZE_SUFFIX}")
}

fn check_snooze_delay(delay_minutes: u32) -> Result<()> {
    if delay_minutes == 0 {
        return Err(WorkerError::InvalidSchedule(
            "snooze delay must be positive".to_owned(),
        ));
    }
    Ok(())
}

/// Prefix `body` with the deferral notice, replacing an earlier one.
fn deferred_body(body: &str, delay_minutes: u32) -> String {
    let original = body
        .strip_prefix(DEFERRED_PREFIX)
        .and_then(|rest| rest.split_once(": "))
        .map_or(body, |(_, original)| original);
    format!("{DEFERRED_PREFIX}{delay_minutes} minutos: {original}")
}

fn remove_pending(state: &mut SchedulerState, id: &str) -> bool {
    match state.pending.remove(id) {
        Some(entry) => {
            entry.timer.abort();
            true
        }
        None => false,
    }
}

fn latest_ack_mut<'a>(state: &'a mut SchedulerState, id: &str) -> Option<&'a mut AckRecord> {
    state.acks.iter_mut().rev().find(|r| r.alarm.id == id)
}

fn resolve(spec: AlarmSpec, now: DateTime<Utc>) -> Result<ScheduledAlarm> {
    let id = spec.id.trim().to_owned();
    if id.is_empty() {
        return Err(WorkerError::InvalidSchedule("alarm id cannot be empty".to_owned()));
    }
    if id.ends_with(SNOOZE_SUFFIX) {
        return Err(WorkerError::InvalidSchedule(format!(
            "alarm id {id} uses the reserved {SNOOZE_SUFFIX} suffix"
        )));
    }

    let rule = spec.recurrence.as_ref().map(RecurrenceSpec::resolve).transpose()?;
    let explicit = match (spec.fire_at, spec.timestamp) {
        (Some(at), _) => Some(at),
        (None, Some(ms)) => Some(Utc.timestamp_millis_opt(ms).single().ok_or_else(|| {
            WorkerError::InvalidSchedule(format!("timestamp {ms} is out of range"))
        })?),
        (None, None) => None,
    };

    let (fire_at, anchor) = match (explicit, &rule) {
        (Some(at), _) if at > now => (at, at),
        (Some(at), Some(rule)) => (rule.next_after(at, now)?, at),
        (Some(at), None) => (now, at),
        (None, Some(rule)) => {
            let anchor = spec.base_time.unwrap_or(now);
            (rule.next_after(anchor, now)?, anchor)
        }
        (None, None) => {
            return Err(WorkerError::InvalidSchedule(format!(
                "alarm {id} has neither a fire time nor a recurrence"
            )));
        }
    };

    Ok(ScheduledAlarm {
        id,
        medication: spec.medication,
        fire_at,
        title: spec.title,
        body: spec.body,
        recurrence: rule,
        anchor,
        snooze_of: None,
        correlation: spec.correlation,
    })
}
