//! # Time-Driven Triggers
//!
//! Cron and fixed-tick daemons that start workflow runs through the
//! orchestration [`FlowExecutor`](crate::orchestration::FlowExecutor) port.

pub mod cron;
pub mod guard;
pub mod poller_daemon;
pub mod scheduler_daemon;

pub use self::cron::{CronError, CronSpec};
pub use guard::{InFlightGuard, InFlightPermit};
pub use poller_daemon::{PollTickReport, PollerDaemon, PollerStatus};
pub use scheduler_daemon::{JobKey, ScheduledJob, SchedulerDaemon, SchedulerStatus};
