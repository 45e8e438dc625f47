use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use hearth_killswitch::{GlobalKillSwitch, ModuleSwitchboard};
use hearth_router::Router;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(&'static str),
}

/// When a task runs: every `seconds`, daily at a time of day, or once
/// at an absolute epoch time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Interval { seconds: u64 },
    FixedTime { hour: u32, minute: u32, second: u32 },
    OneShot { run_at: i64 },
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interval { seconds } => write!(f, "every {seconds}s"),
            Self::FixedTime {
                hour,
                minute,
                second,
            } => write!(f, "daily at {hour:02}:{minute:02}:{second:02}"),
            Self::OneShot { run_at } => write!(f, "once at epoch {run_at}"),
        }
    }
}

/// A persisted unit of schedulable work. `handler_ref` is a route name
/// resolved at fire time, never a live function, so the record survives
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub handler_ref: String,
    pub schedule: Schedule,
    pub next_run: i64,
}

pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// First `next_run` for a task created at `now`. Never in the past: a
/// one-shot whose `run_at` already passed fires on the next tick.
pub fn initial_next_run<Tz: TimeZone>(schedule: &Schedule, now: i64, tz: &Tz) -> i64 {
    match schedule {
        Schedule::Interval { seconds } => now + *seconds as i64,
        Schedule::FixedTime {
            hour,
            minute,
            second,
        } => next_fixed_occurrence(tz, now, *hour, *minute, *second),
        Schedule::OneShot { run_at } => (*run_at).max(now),
    }
}

/// The `next_run` that replaces `next_run_before` once a task fires.
/// Intervals advance by exactly one interval so late ticks do not
/// accumulate drift; fixed times roll to the next civil occurrence;
/// `None` means the task is done and must be removed.
pub fn advance_after_fire<Tz: TimeZone>(
    schedule: &Schedule,
    next_run_before: i64,
    now: i64,
    tz: &Tz,
) -> Option<i64> {
    match schedule {
        Schedule::Interval { seconds } => Some(next_run_before + *seconds as i64),
        Schedule::FixedTime {
            hour,
            minute,
            second,
        } => Some(next_fixed_occurrence(tz, now, *hour, *minute, *second)),
        Schedule::OneShot { .. } => None,
    }
}

/// Epoch of the first wall-clock `hour:minute:second` in `tz` strictly
/// after `after`, rolling forward a day at a time. Skips over civil
/// times that do not exist (DST gaps).
fn next_fixed_occurrence<Tz: TimeZone>(
    tz: &Tz,
    after: i64,
    hour: u32,
    minute: u32,
    second: u32,
) -> i64 {
    let after_dt = match tz.timestamp_opt(after, 0) {
        chrono::LocalResult::Single(dt) => dt,
        chrono::LocalResult::Ambiguous(dt, _) => dt,
        chrono::LocalResult::None => return after + 86_400,
    };
    let mut date = after_dt.date_naive();
    loop {
        if let Some(naive) = date.and_hms_opt(hour, minute, second)
            && let Some(candidate) = tz.from_local_datetime(&naive).earliest()
        {
            let ts = candidate.timestamp();
            if ts > after {
                return ts;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => return after + 86_400,
        }
    }
}

fn validate(schedule: &Schedule) -> Result<(), SchedulerError> {
    match schedule {
        Schedule::Interval { seconds } if *seconds == 0 => Err(SchedulerError::InvalidSchedule(
            "interval must be at least one second",
        )),
        Schedule::FixedTime {
            hour,
            minute,
            second,
        } if *hour > 23 || *minute > 59 || *second > 59 => Err(SchedulerError::InvalidSchedule(
            "time of day is out of range",
        )),
        _ => Ok(()),
    }
}

/// Fires due tasks through the router and keeps the persisted task list
/// consistent with what actually ran.
///
/// The task-list lock is held only to scan and to commit schedule
/// changes; execution happens on a thread per fired task, so one slow
/// or failing handler cannot delay the next tick. While the global kill
/// switch is active, due tasks are held entirely (no dispatch, no
/// `next_run` advance) and fire promptly once it is reset.
pub struct Scheduler {
    path: PathBuf,
    tasks: Mutex<Vec<Task>>,
    dirty: AtomicBool,
    router: Arc<Router>,
    kill: Arc<GlobalKillSwitch>,
    switches: Arc<ModuleSwitchboard>,
    tick: Duration,
    stop: AtomicBool,
}

impl Scheduler {
    /// Opens the task store at `path` (missing file starts empty,
    /// corrupt file logs and starts empty) and wires the collaborators
    /// every fire consults.
    pub fn new(
        path: PathBuf,
        router: Arc<Router>,
        kill: Arc<GlobalKillSwitch>,
        switches: Arc<ModuleSwitchboard>,
        tick_secs: u64,
    ) -> Self {
        let tasks = load_tasks(&path);
        if !tasks.is_empty() {
            info!(count = tasks.len(), "loaded persisted tasks");
        }
        Self {
            path,
            tasks: Mutex::new(tasks),
            dirty: AtomicBool::new(false),
            router,
            kill,
            switches,
            tick: Duration::from_secs(tick_secs),
            stop: AtomicBool::new(false),
        }
    }

    /// Adds a task and persists the list. Returns the generated task id.
    /// A failed write is logged and retried on the next tick; the task
    /// is scheduled either way.
    pub fn add_task(
        &self,
        name: impl Into<String>,
        handler_ref: impl Into<String>,
        schedule: Schedule,
    ) -> Result<String, SchedulerError> {
        validate(&schedule)?;
        let task = Task {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            handler_ref: handler_ref.into(),
            next_run: initial_next_run(&schedule, now_epoch(), &Local),
            schedule,
        };
        let id = task.id.clone();
        let mut tasks = self.lock_tasks();
        tasks.push(task);
        self.persist_locked(&tasks);
        info!(task_id = %id, "task added to the scheduler");
        Ok(id)
    }

    /// Removes a task by id. Removing an unknown id is a quiet no-op;
    /// the return value says whether anything went away.
    pub fn remove_task(&self, id: &str) -> bool {
        let mut tasks = self.lock_tasks();
        let before = tasks.len();
        tasks.retain(|task| task.id != id);
        let removed = tasks.len() != before;
        if removed {
            self.persist_locked(&tasks);
            info!(task_id = %id, "task removed from the scheduler");
        }
        removed
    }

    /// Snapshot of every scheduled task.
    pub fn list_tasks(&self) -> Vec<Task> {
        self.lock_tasks().clone()
    }

    /// One due-task scan. The blocking loop calls this every tick;
    /// tests can call it directly.
    pub fn tick_once(&self) {
        if self.dirty.load(Ordering::Acquire) {
            let tasks = self.lock_tasks();
            self.persist_locked(&tasks);
        }

        let now = now_epoch();
        let due: Vec<Task> = {
            let tasks = self.lock_tasks();
            tasks
                .iter()
                .filter(|task| task.next_run <= now)
                .cloned()
                .collect()
        };

        for task in due {
            if self.kill.is_active() {
                debug!(task = %task.name, "global kill active, holding due task");
                continue;
            }
            if self.switches.is_active(&task.handler_ref) {
                debug!(
                    task = %task.name,
                    module = %task.handler_ref,
                    "module disabled, holding due task"
                );
                continue;
            }
            self.commit_fire(&task, now);
            self.execute(task);
        }
    }

    /// Runs the tick loop until [`stop`](Self::stop). Blocking; callers
    /// that want a background scheduler use [`spawn`](Self::spawn).
    pub fn run(&self) {
        info!(tick_secs = self.tick.as_secs(), "scheduler started");
        while !self.stop.load(Ordering::Acquire) {
            self.tick_once();
            thread::sleep(self.tick);
        }
        info!("scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>) -> thread::JoinHandle<()> {
        thread::spawn(move || self.run())
    }

    /// Asks the loop to exit after its current tick. In-flight task
    /// executions are left to finish.
    pub fn stop(&self) {
        info!("stopping scheduler");
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Advances or removes the fired task in the stored list, then
    /// persists. Runs before execution so a task can never be selected
    /// as due twice for one firing.
    fn commit_fire(&self, fired: &Task, now: i64) {
        let mut tasks = self.lock_tasks();
        match advance_after_fire(&fired.schedule, fired.next_run, now, &Local) {
            Some(next) => {
                if let Some(task) = tasks.iter_mut().find(|task| task.id == fired.id) {
                    task.next_run = next;
                }
            }
            None => tasks.retain(|task| task.id != fired.id),
        }
        self.persist_locked(&tasks);
    }

    fn execute(&self, task: Task) {
        info!(task = %task.name, route = %task.handler_ref, "running scheduled task");
        let router = Arc::clone(&self.router);
        thread::spawn(move || match router.dispatch(&task.handler_ref, Value::Null) {
            Ok(_) => info!(task = %task.name, "scheduled task completed"),
            Err(err) => error!(task = %task.name, %err, "scheduled task failed"),
        });
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<Task>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist_locked(&self, tasks: &[Task]) {
        match write_tasks(&self.path, tasks) {
            Ok(()) => self.dirty.store(false, Ordering::Release),
            Err(err) => {
                self.dirty.store(true, Ordering::Release);
                error!(path = %self.path.display(), %err, "failed to persist task list");
            }
        }
    }
}

fn load_tasks(path: &Path) -> Vec<Task> {
    match fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(path = %path.display(), %err, "corrupt task file, starting empty");
                Vec::new()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => {
            error!(path = %path.display(), %err, "failed to read task file, starting empty");
            Vec::new()
        }
    }
}

/// Whole-file rewrite through a temp file so a crash mid-write never
/// truncates the task list.
fn write_tasks(path: &Path, tasks: &[Task]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let raw = serde_json::to_string_pretty(tasks)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, raw)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::FixedOffset;

    // 2021-01-01 12:00:00 UTC
    const NOON: i64 = 1_609_502_400;

    #[test]
    fn interval_advances_by_exactly_one_interval() {
        let schedule = Schedule::Interval { seconds: 5 };
        // A very late tick must not re-anchor the cadence to `now`.
        assert_eq!(advance_after_fire(&schedule, 100, 123, &Utc), Some(105));
    }

    #[test]
    fn one_shot_does_not_advance() {
        let schedule = Schedule::OneShot { run_at: 100 };
        assert_eq!(advance_after_fire(&schedule, 100, 100, &Utc), None);
    }

    #[test]
    fn initial_interval_counts_from_now() {
        let schedule = Schedule::Interval { seconds: 30 };
        assert_eq!(initial_next_run(&schedule, NOON, &Utc), NOON + 30);
    }

    #[test]
    fn initial_one_shot_in_the_past_clamps_to_now() {
        let schedule = Schedule::OneShot { run_at: NOON - 50 };
        assert_eq!(initial_next_run(&schedule, NOON, &Utc), NOON);

        let future = Schedule::OneShot { run_at: NOON + 50 };
        assert_eq!(initial_next_run(&future, NOON, &Utc), NOON + 50);
    }

    #[test]
    fn fixed_time_later_today_stays_today() {
        let schedule = Schedule::FixedTime {
            hour: 13,
            minute: 0,
            second: 0,
        };
        assert_eq!(initial_next_run(&schedule, NOON, &Utc), NOON + 3600);
    }

    #[test]
    fn fixed_time_already_passed_rolls_to_tomorrow() {
        let schedule = Schedule::FixedTime {
            hour: 11,
            minute: 0,
            second: 0,
        };
        assert_eq!(
            initial_next_run(&schedule, NOON, &Utc),
            NOON - 3600 + 86_400
        );
    }

    #[test]
    fn fixed_time_exactly_now_rolls_to_tomorrow() {
        let schedule = Schedule::FixedTime {
            hour: 12,
            minute: 0,
            second: 0,
        };
        assert_eq!(initial_next_run(&schedule, NOON, &Utc), NOON + 86_400);
    }

    #[test]
    fn fixed_time_respects_the_time_zone() {
        // UTC+2: noon UTC is 14:00 local, so a 13:00 schedule is already
        // past and lands on 13:00 local the next day (11:00 UTC).
        let tz = FixedOffset::east_opt(2 * 3600).expect("offset");
        let schedule = Schedule::FixedTime {
            hour: 13,
            minute: 0,
            second: 0,
        };
        assert_eq!(
            initial_next_run(&schedule, NOON, &tz),
            NOON - 3600 + 86_400
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = validate(&Schedule::Interval { seconds: 0 }).expect_err("must reject");
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[test]
    fn out_of_range_time_of_day_is_rejected() {
        let err = validate(&Schedule::FixedTime {
            hour: 24,
            minute: 0,
            second: 0,
        })
        .expect_err("must reject");
        assert!(matches!(err, SchedulerError::InvalidSchedule(_)));
    }

    #[test]
    fn schedule_wire_format_is_tagged() {
        let raw = serde_json::to_value(Schedule::Interval { seconds: 5 }).expect("serialize");
        assert_eq!(raw, serde_json::json!({ "type": "interval", "seconds": 5 }));

        let parsed: Schedule = serde_json::from_value(serde_json::json!({
            "type": "fixed_time", "hour": 14, "minute": 30, "second": 0
        }))
        .expect("deserialize");
        assert_eq!(
            parsed,
            Schedule::FixedTime {
                hour: 14,
                minute: 30,
                second: 0
            }
        );
    }
}
