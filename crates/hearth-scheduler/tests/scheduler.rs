use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::anyhow;
use hearth_killswitch::{GlobalKillSwitch, ModuleSwitchboard};
use hearth_router::{FnHandler, Router};
use hearth_scheduler::{Schedule, Scheduler, Task, now_epoch};
use tempfile::TempDir;

struct Rig {
    _dir: TempDir,
    tasks_path: PathBuf,
    router: Arc<Router>,
    kill: Arc<GlobalKillSwitch>,
    switches: Arc<ModuleSwitchboard>,
}

fn rig(reset_hash: Option<String>) -> Rig {
    let dir = tempfile::tempdir().expect("tempdir");
    let tasks_path = dir.path().join("tasks.json");
    let kill = Arc::new(GlobalKillSwitch::open(
        dir.path().join("kill_switch.token"),
        reset_hash,
    ));
    let switches = Arc::new(ModuleSwitchboard::open(dir.path().join("switches.json")));
    Rig {
        _dir: dir,
        tasks_path,
        router: Arc::new(Router::new()),
        kill,
        switches,
    }
}

fn scheduler(rig: &Rig) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        rig.tasks_path.clone(),
        Arc::clone(&rig.router),
        Arc::clone(&rig.kill),
        Arc::clone(&rig.switches),
        1,
    ))
}

fn counting_handler(rig: &Rig, route: &str) -> Arc<AtomicUsize> {
    let counter = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&counter);
    rig.router.register(Arc::new(FnHandler::new(route, move |payload| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(payload)
    })));
    counter
}

fn seed_tasks(path: &PathBuf, tasks: &[Task]) {
    let raw = serde_json::to_string_pretty(tasks).expect("serialize seed");
    std::fs::write(path, raw).expect("write seed");
}

fn interval_task(id: &str, route: &str, seconds: u64, next_run: i64) -> Task {
    Task {
        id: id.to_string(),
        name: format!("{id}-task"),
        handler_ref: route.to_string(),
        schedule: Schedule::Interval { seconds },
        next_run,
    }
}

fn one_shot_task(id: &str, route: &str, run_at: i64) -> Task {
    Task {
        id: id.to_string(),
        name: format!("{id}-task"),
        handler_ref: route.to_string(),
        schedule: Schedule::OneShot { run_at },
        next_run: run_at,
    }
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn added_task_persists_across_reopen() {
    let rig = rig(None);
    let sched = scheduler(&rig);

    let id = sched
        .add_task("weather poll", "weather", Schedule::Interval { seconds: 60 })
        .expect("add task");

    let reopened = scheduler(&rig);
    let tasks = reopened.list_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, id);
    assert_eq!(tasks[0].handler_ref, "weather");
    assert_eq!(tasks[0].schedule, Schedule::Interval { seconds: 60 });
    assert!(tasks[0].next_run >= now_epoch());
}

#[test]
fn due_interval_task_fires_and_advances_exactly() {
    let rig = rig(None);
    let counter = counting_handler(&rig, "count");
    let seeded_next_run = now_epoch() - 100;
    seed_tasks(
        &rig.tasks_path,
        &[interval_task("t1", "count", 5, seeded_next_run)],
    );

    let sched = scheduler(&rig);
    sched.tick_once();

    // Advance anchors on the previous next_run, not on the late tick.
    let tasks = sched.list_tasks();
    assert_eq!(tasks[0].next_run, seeded_next_run + 5);
    assert!(wait_for(|| counter.load(Ordering::SeqCst) == 1));
}

#[test]
fn one_shot_is_removed_after_firing_even_when_handler_fails() {
    let rig = rig(None);
    let invoked = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&invoked);
    rig.router
        .register(Arc::new(FnHandler::new("explode", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("deliberate failure"))
        })));
    seed_tasks(
        &rig.tasks_path,
        &[one_shot_task("b1", "explode", now_epoch() - 10)],
    );

    let sched = scheduler(&rig);
    sched.tick_once();

    // Removal is committed at fire time, outcome notwithstanding.
    assert!(sched.list_tasks().is_empty());
    assert!(wait_for(|| invoked.load(Ordering::SeqCst) == 1));

    let raw = std::fs::read_to_string(&rig.tasks_path).expect("task file");
    let on_disk: Vec<Task> = serde_json::from_str(&raw).expect("parse task file");
    assert!(on_disk.is_empty());
}

#[test]
fn global_kill_holds_due_tasks_until_reset() {
    let hash = hearth_security::hash_password("LongPass1!").expect("hash");
    let rig = rig(Some(hash));
    let count_a = counting_handler(&rig, "route-a");
    let count_b = counting_handler(&rig, "route-b");

    let a_next_run = now_epoch() - 30;
    seed_tasks(
        &rig.tasks_path,
        &[
            interval_task("a", "route-a", 5, a_next_run),
            one_shot_task("b", "route-b", now_epoch() - 2),
        ],
    );

    let sched = scheduler(&rig);
    rig.kill.activate("test harness");

    sched.tick_once();
    sched.tick_once();

    // Held entirely: no dispatch, no advance, one-shot still persisted.
    let tasks = sched.list_tasks();
    assert_eq!(tasks.len(), 2);
    let task_a = tasks.iter().find(|t| t.id == "a").expect("task a");
    assert_eq!(task_a.next_run, a_next_run);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(count_a.load(Ordering::SeqCst), 0);
    assert_eq!(count_b.load(Ordering::SeqCst), 0);

    assert!(!rig.kill.reset("WrongPass1!"));
    sched.tick_once();
    assert_eq!(sched.list_tasks().len(), 2);

    assert!(rig.kill.reset("LongPass1!"));
    sched.tick_once();

    assert!(wait_for(|| count_a.load(Ordering::SeqCst) == 1));
    assert!(wait_for(|| count_b.load(Ordering::SeqCst) == 1));
    let tasks = sched.list_tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].id, "a");
    assert_eq!(tasks[0].next_run, a_next_run + 5);
}

#[test]
fn disabled_module_holds_its_tasks() {
    let rig = rig(None);
    let counter = counting_handler(&rig, "email");
    let seeded_next_run = now_epoch() - 20;
    seed_tasks(
        &rig.tasks_path,
        &[interval_task("m1", "email", 5, seeded_next_run)],
    );

    let sched = scheduler(&rig);
    rig.switches.activate("email");
    sched.tick_once();

    assert_eq!(sched.list_tasks()[0].next_run, seeded_next_run);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    rig.switches.deactivate("email");
    sched.tick_once();

    assert!(wait_for(|| counter.load(Ordering::SeqCst) == 1));
    assert_eq!(sched.list_tasks()[0].next_run, seeded_next_run + 5);
}

#[test]
fn future_one_shot_waits_for_its_time() {
    let rig = rig(None);
    let counter = counting_handler(&rig, "later");
    let sched = scheduler(&rig);

    sched
        .add_task(
            "later task",
            "later",
            Schedule::OneShot {
                run_at: now_epoch() + 3600,
            },
        )
        .expect("add task");

    sched.tick_once();
    assert_eq!(sched.list_tasks().len(), 1);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[test]
fn handlers_can_reach_the_scheduler_mid_fire() {
    let rig = rig(None);
    seed_tasks(
        &rig.tasks_path,
        &[one_shot_task("seed", "installer", now_epoch() - 1)],
    );
    let sched = scheduler(&rig);

    let inner = Arc::clone(&sched);
    rig.router
        .register(Arc::new(FnHandler::new("installer", move |_| {
            let id = inner.add_task(
                "added mid fire",
                "noop",
                Schedule::Interval { seconds: 60 },
            )?;
            Ok(serde_json::Value::String(id))
        })));

    sched.tick_once();

    assert!(wait_for(|| {
        sched
            .list_tasks()
            .iter()
            .any(|task| task.name == "added mid fire")
    }));
}

#[test]
fn remove_task_is_idempotent() {
    let rig = rig(None);
    let sched = scheduler(&rig);
    let id = sched
        .add_task("short lived", "noop", Schedule::Interval { seconds: 60 })
        .expect("add task");

    assert!(sched.remove_task(&id));
    assert!(!sched.remove_task(&id));
    assert!(scheduler(&rig).list_tasks().is_empty());
}

#[test]
fn corrupt_task_file_starts_empty() {
    let rig = rig(None);
    std::fs::write(&rig.tasks_path, "not json at all").expect("write");

    let sched = scheduler(&rig);
    assert!(sched.list_tasks().is_empty());

    sched
        .add_task("fresh", "noop", Schedule::Interval { seconds: 60 })
        .expect("add task");
    let raw = std::fs::read_to_string(&rig.tasks_path).expect("task file");
    let on_disk: Vec<Task> = serde_json::from_str(&raw).expect("healed file");
    assert_eq!(on_disk.len(), 1);
}

#[test]
fn stop_ends_the_run_loop() {
    let rig = rig(None);
    let sched = scheduler(&rig);

    let handle = Arc::clone(&sched).spawn();
    std::thread::sleep(Duration::from_millis(50));
    sched.stop();
    handle.join().expect("scheduler thread exits");
}

#[cfg(unix)]
#[test]
fn failed_persist_is_retried_on_the_next_tick() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("tempdir");
    let store_dir = dir.path().join("store");
    std::fs::create_dir(&store_dir).expect("mkdir");
    let tasks_path = store_dir.join("tasks.json");

    let kill = Arc::new(GlobalKillSwitch::open(dir.path().join("kill.token"), None));
    let switches = Arc::new(ModuleSwitchboard::open(dir.path().join("switches.json")));
    let sched = Scheduler::new(
        tasks_path.clone(),
        Arc::new(Router::new()),
        kill,
        switches,
        1,
    );

    std::fs::set_permissions(&store_dir, std::fs::Permissions::from_mode(0o555))
        .expect("chmod readonly");

    // The write fails, the task is scheduled anyway.
    let id = sched
        .add_task("survives", "noop", Schedule::Interval { seconds: 60 })
        .expect("add task");
    assert_eq!(sched.list_tasks().len(), 1);
    assert!(!tasks_path.exists());

    std::fs::set_permissions(&store_dir, std::fs::Permissions::from_mode(0o755))
        .expect("chmod writable");
    sched.tick_once();

    let raw = std::fs::read_to_string(&tasks_path).expect("task file after retry");
    let on_disk: Vec<Task> = serde_json::from_str(&raw).expect("parse task file");
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].id, id);
}
