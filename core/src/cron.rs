//! Cron expressions and the timer engine that dispatches them.
//!
//! Expressions use the standard 5-field layout
//! (`minute hour day-of-month month day-of-week`). They are evaluated with
//! the `cron` crate, which expects a leading seconds field and numbers
//! weekdays from 1 (Sunday), so parsing normalises both. When day-of-month and
//! day-of-week are both restricted a day matches if either does, which the
//! `cron` crate cannot express in one schedule, so such expressions keep two.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Errors raised while parsing a schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    /// The expression does not have exactly five fields.
    #[error("cron expression {expr:?} has {found} fields, expected 5")]
    FieldCount {
        /// Expression as given.
        expr: String,
        /// Number of whitespace-separated fields found.
        found: usize,
    },
    /// A field could not be parsed.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression {
        /// Expression as given.
        expr: String,
        /// Parser message.
        reason: String,
    },
    /// Not a known IANA timezone name.
    #[error("invalid timezone {0:?}")]
    InvalidTimezone(String),
}

/// A parsed 5-field schedule bound to a timezone.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    timezone: Tz,
    // One schedule, or two (day-of-month, day-of-week) whose union is the expression.
    schedules: Vec<cron::Schedule>,
}

impl CronSchedule {
    /// Parse `expr`; an empty `timezone` means UTC.
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount { expr: expr.to_string(), found: fields.len() });
        }
        let invalid = |reason: String| CronError::InvalidExpression { expr: expr.to_string(), reason };

        let dow = translate_weekdays(fields[4]).map_err(invalid)?;
        let (minute, hour, dom, month) = (fields[0], fields[1], fields[2], fields[3]);
        let layouts = if is_restricted(dom) && is_restricted(fields[4]) {
            vec![(dom, "*"), ("*", dow.as_str())]
        } else {
            vec![(dom, dow.as_str())]
        };
        let schedules = layouts
            .into_iter()
            .map(|(dom, dow)| {
                cron::Schedule::from_str(&format!("0 {minute} {hour} {dom} {month} {dow}"))
                    .map_err(|e| invalid(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let timezone = match timezone.trim() {
            "" => Tz::UTC,
            name => name
                .parse::<Tz>()
                .map_err(|_| CronError::InvalidTimezone(name.to_string()))?,
        };

        Ok(Self { expr: expr.trim().to_string(), timezone, schedules })
    }

    /// The expression as registered.
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Timezone the schedule is evaluated in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// First trigger strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedules
            .iter()
            .filter_map(|s| s.after(&local).next())
            .min()
            .map(|t| t.with_timezone(&Utc))
    }
}

// A day field starting with `*` (including `*/n`) is intersected with the other one.
fn is_restricted(field: &str) -> bool {
    !(field.starts_with('*') || field == "?")
}

// Standard cron numbers weekdays 0-7 with both 0 and 7 meaning Sunday.
fn translate_weekdays(field: &str) -> Result<String, String> {
    let mut out = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let suffix = step.map(|s| format!("/{s}")).unwrap_or_default();

        let translated = match base.split_once('-') {
            Some((lo, hi)) => match (weekday_number(lo)?, weekday_number(hi)?) {
                (Some(0), Some(7)) => format!("*{suffix}"),
                (Some(7), Some(7)) => format!("1{suffix}"),
                (Some(6), Some(7)) if step.is_none() => "7,1".to_string(),
                (Some(lo), Some(7)) if step.is_none() => format!("{}-7,1", lo + 1),
                (Some(_), Some(7)) => return Err(format!("unsupported weekday range {item:?}")),
                (Some(lo), Some(hi)) => format!("{}-{}{suffix}", lo + 1, hi + 1),
                _ => item.to_string(),
            },
            None => match weekday_number(base)? {
                Some(n) => format!("{}{suffix}", n % 7 + 1),
                None => item.to_string(),
            },
        };
        out.push(translated);
    }
    Ok(out.join(","))
}

fn weekday_number(token: &str) -> Result<Option<u32>, String> {
    if !token.chars().all(|c| c.is_ascii_digit()) || token.is_empty() {
        return Ok(None);
    }
    match token.parse::<u32>() {
        Ok(n) if n <= 7 => Ok(Some(n)),
        _ => Err(format!("weekday {token:?} out of range 0-7")),
    }
}

/// Handle identifying a registered engine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Work spawned on every trigger.
pub type CronCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    schedule: CronSchedule,
    callback: CronCallback,
    next: Option<DateTime<Utc>>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    entries: Mutex<HashMap<EntryId, Entry>>,
    next_id: AtomicU64,
    // Present while dispatching.
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

/// Timer engine firing callbacks on cron schedules.
///
/// Each entry gets its own dispatch task while the engine runs. Callbacks are
/// spawned as independent tasks, so a slow callback never delays a timer.
pub struct CronEngine {
    shared: Arc<Shared>,
}

impl Default for CronEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CronEngine {
    /// An engine with no entries, not yet dispatching.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                shutdown: Mutex::new(None),
            }),
        }
    }

    /// Register `callback` to run at every trigger of `schedule`.
    pub fn add(&self, schedule: CronSchedule, callback: CronCallback) -> EntryId {
        let id = EntryId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        let shutdown = self.shared.shutdown.lock();
        let mut entries = self.shared.entries.lock();
        let next = schedule.next_after(Utc::now());
        let task = shutdown
            .as_ref()
            .map(|tx| tokio::spawn(dispatch(self.shared.clone(), id, tx.subscribe())));
        entries.insert(id, Entry { schedule, callback, next, task });
        id
    }

    /// Unregister an entry. Returns false if unknown.
    pub fn remove(&self, id: EntryId) -> bool {
        let removed = self.shared.entries.lock().remove(&id);
        match removed {
            Some(entry) => {
                if let Some(task) = entry.task {
                    task.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Next trigger time of an entry.
    pub fn next(&self, id: EntryId) -> Option<DateTime<Utc>> {
        self.shared.entries.lock().get(&id).and_then(|e| e.next)
    }

    /// Number of registered entries.
    pub fn entry_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.shared.shutdown.lock().is_some()
    }

    /// Begin dispatching. No-op if already running.
    pub fn start(&self) {
        let mut shutdown = self.shared.shutdown.lock();
        if shutdown.is_some() {
            return;
        }
        let (tx, _) = watch::channel(false);
        let mut entries = self.shared.entries.lock();
        let now = Utc::now();
        for (id, entry) in entries.iter_mut() {
            entry.next = entry.schedule.next_after(now);
            entry.task = Some(tokio::spawn(dispatch(self.shared.clone(), *id, tx.subscribe())));
        }
        debug!(entries = entries.len(), "cron engine started");
        *shutdown = Some(tx);
    }

    /// Stop dispatching new triggers. Callbacks already spawned keep running.
    pub fn stop(&self) -> StopHandle {
        let Some(tx) = self.shared.shutdown.lock().take() else {
            return StopHandle { tasks: Vec::new() };
        };
        let _ = tx.send(true);
        let tasks = self
            .shared
            .entries
            .lock()
            .values_mut()
            .filter_map(|e| e.task.take())
            .collect();
        debug!("cron engine stopping");
        StopHandle { tasks }
    }
}

impl Drop for CronEngine {
    fn drop(&mut self) {
        if let Some(tx) = self.shared.shutdown.lock().take() {
            let _ = tx.send(true);
        }
    }
}

/// Completes once every dispatch task has exited.
#[must_use = "await `wait` to observe shutdown completion"]
pub struct StopHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl StopHandle {
    /// Wait for the dispatch tasks to drain.
    pub async fn wait(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn dispatch(shared: Arc<Shared>, id: EntryId, mut shutdown: watch::Receiver<bool>) {
    let mut after = Utc::now();
    loop {
        let (next, callback) = {
            let mut entries = shared.entries.lock();
            let Some(entry) = entries.get_mut(&id) else { return };
            entry.next = entry.schedule.next_after(after);
            (entry.next, entry.callback.clone())
        };
        let Some(next) = next else {
            debug!(entry = %id, "no upcoming trigger");
            return;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or_default();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                debug!(entry = %id, at = %next, "cron dispatch");
                tokio::spawn(callback());
                after = next.max(Utc::now());
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
