//! Medication reminders: recurrence rules, timers and notifications.

pub mod notify;
pub mod rule;
pub mod scheduler;

pub use notify::{
    ClientFocus, Notification, NotificationDispatcher, NotificationRecord, NoopPlatformHost,
    PlatformHost, ACTION_SNOOZE, ACTION_TAKEN,
};
pub use rule::Recurrence;
pub use scheduler::{
    AckRecord, AckState, AlarmScheduler, AlarmSpec, AlarmSummary, Clock, RecurrenceSpec,
    ScheduledAlarm, SystemClock, TokioClock,
};
