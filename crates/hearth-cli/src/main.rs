use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use hearth_common::{APP_NAME, HearthConfig, logging};
use hearth_controller::Controller;
use hearth_killswitch::{GlobalKillSwitch, ModuleSwitchboard};
use hearth_router::{FnHandler, Router};
use hearth_scheduler::{Schedule, Scheduler};
use hearth_security::{RotationPolicy, SecurityManager};

#[derive(Debug, Parser)]
#[command(name = "hearth", about = "Hearth orchestration core CLI", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate local setup and generate default config if missing.
    Doctor,
    /// Run the scheduler loop until Enter is pressed.
    Run,
    /// Route one payload through the controller.
    Dispatch {
        route: String,
        /// JSON payload; plain text is wrapped as a JSON string.
        #[arg(long, default_value = "null")]
        payload: String,
        #[arg(long, default_value = "operator")]
        user: String,
    },
    /// Scheduled task operations.
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Per-module switch operations.
    Module {
        #[command(subcommand)]
        command: ModuleCommand,
    },
    /// Global kill switch operations.
    Kill {
        #[command(subcommand)]
        command: KillCommand,
    },
    /// Key and password operations.
    Security {
        #[command(subcommand)]
        command: SecurityCommand,
    },
    /// User record operations.
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TaskCommand {
    /// Schedule a task against a registered route.
    Add {
        name: String,
        handler: String,
        /// Fire every N seconds.
        #[arg(long, group = "when")]
        every: Option<u64>,
        /// Fire daily at HH:MM or HH:MM:SS.
        #[arg(long, group = "when")]
        daily: Option<String>,
        /// Fire once at an absolute epoch second.
        #[arg(long, group = "when")]
        once_at: Option<i64>,
        /// Fire once, N seconds from now.
        #[arg(long, group = "when")]
        once_in: Option<u64>,
    },
    /// Remove a task by id.
    Remove { task_id: String },
    /// List every scheduled task.
    List,
}

#[derive(Debug, Subcommand)]
enum ModuleCommand {
    /// Stop a module; its routes and tasks are held until resumed.
    Stop { module: String },
    /// Let a stopped module run again.
    Resume { module: String },
    /// List every recorded module flag.
    List,
}

#[derive(Debug, Subcommand)]
enum KillCommand {
    /// Halt the entire system.
    Activate {
        #[arg(long, default_value = "cli")]
        origin: String,
    },
    /// Clear the halt with the reset password.
    Reset { password: String },
    /// Show the persisted switch state.
    Status,
}

#[derive(Debug, Subcommand)]
enum SecurityCommand {
    /// Hash a password after checking the strength policy.
    HashPassword { password: String },
    /// Verify a password against a PHC hash string.
    Verify { hash: String, password: String },
    /// Install a new encryption key and persist it to the key file.
    Rotate {
        /// Derive the key from a passphrase instead of random bytes.
        #[arg(long)]
        passphrase: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum UserCommand {
    /// Register a user with a policy-checked password.
    Register { user_id: String, password: String },
    /// Check a password against a registered user.
    Auth { user_id: String, password: String },
    /// Remove a user record.
    Remove { user_id: String },
    /// List registered user ids.
    List,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Command::Doctor) => doctor(),
        Some(Command::Run) => run(),
        Some(Command::Dispatch {
            route,
            payload,
            user,
        }) => dispatch(route, payload, user),
        Some(Command::Task { command }) => task(command),
        Some(Command::Module { command }) => module(command),
        Some(Command::Kill { command }) => kill(command),
        Some(Command::Security { command }) => security(command),
        Some(Command::User { command }) => user(command),
        None => {
            println!("{APP_NAME} CLI bootstrap complete.");
            println!("Run `hearth doctor` to generate and validate local config.");
            Ok(())
        }
    }
}

fn load_initialized_config() -> Result<HearthConfig> {
    let (config, _, _) = HearthConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);
    Ok(config)
}

/// The assembled orchestration core. Every command that touches shared
/// state goes through one of these services.
struct Core {
    config: HearthConfig,
    router: Arc<Router>,
    kill: Arc<GlobalKillSwitch>,
    switches: Arc<ModuleSwitchboard>,
    security: Arc<SecurityManager>,
    scheduler: Arc<Scheduler>,
    controller: Arc<Controller>,
}

impl Core {
    fn key_path(&self) -> PathBuf {
        self.config.state_dir.join("hearth.key")
    }
}

fn load_core() -> Result<Core> {
    let config = load_initialized_config()?;

    let router = Arc::new(Router::new());
    register_builtin_handlers(&router);

    let reset_hash = std::env::var(&config.kill_switch.reset_hash_env).ok();
    let kill = Arc::new(GlobalKillSwitch::open(
        config.state_dir.join("kill_switch.token"),
        reset_hash,
    ));
    let switches = Arc::new(ModuleSwitchboard::open(
        config.state_dir.join("module_switches.json"),
    ));
    let security = Arc::new(SecurityManager::new(RotationPolicy {
        max_operations: config.security.rotation_max_operations,
        max_age: Duration::from_secs(config.security.rotation_max_age_secs),
    }));

    let key_path = config.state_dir.join("hearth.key");
    if key_path.exists() {
        let version = security
            .load_key(&key_path)
            .with_context(|| format!("refusing key file {}", key_path.display()))?;
        info!(version, "loaded persisted encryption key");
    }

    let scheduler = Arc::new(Scheduler::new(
        config.state_dir.join("tasks.json"),
        Arc::clone(&router),
        Arc::clone(&kill),
        Arc::clone(&switches),
        config.scheduler.tick_secs,
    ));
    let controller = Arc::new(Controller::new(
        Arc::clone(&router),
        Arc::clone(&kill),
        Arc::clone(&switches),
        Arc::clone(&security),
        config.state_dir.join("users.json"),
    ));

    Ok(Core {
        config,
        router,
        kill,
        switches,
        security,
        scheduler,
        controller,
    })
}

/// Small built-in handlers so dispatch and scheduling run end to end
/// without real capability modules.
fn register_builtin_handlers(router: &Router) {
    router.register(Arc::new(FnHandler::new("echo", Ok)));
    router.register(Arc::new(FnHandler::new("clock", |_| {
        let now = chrono::Local::now();
        Ok(json!({
            "epoch": now.timestamp(),
            "local": now.to_rfc3339(),
        }))
    })));
    router.register(Arc::new(FnHandler::new("note", |payload: Value| {
        info!(%payload, "note recorded");
        Ok(json!({ "noted": true }))
    })));
}

fn doctor() -> Result<()> {
    let (config, path, created) = HearthConfig::load_or_create()?;
    config.validate_and_prepare()?;
    logging::init(&config.log_level);

    println!("{APP_NAME} doctor: OK");
    println!("config: {}", path.display());
    println!("state_dir: {}", config.state_dir.display());
    println!("tick_secs: {}", config.scheduler.tick_secs);
    println!("reset_hash_env: {}", config.kill_switch.reset_hash_env);
    println!("created_config: {created}");

    Ok(())
}

fn run() -> Result<()> {
    let core = load_core()?;

    println!("routes:");
    for name in core.router.route_names() {
        println!("- {name}");
    }
    println!("tasks: {}", core.scheduler.list_tasks().len());
    println!("halted: {}", core.kill.is_active());
    println!("Scheduler running; press Enter to stop.");

    let scheduler = Arc::clone(&core.scheduler);
    let handle = scheduler.spawn();

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;

    core.scheduler.stop();
    handle
        .join()
        .map_err(|_| anyhow::anyhow!("scheduler thread panicked"))?;
    println!("run_status: stopped");
    Ok(())
}

fn dispatch(route: String, payload: String, user: String) -> Result<()> {
    let core = load_core()?;
    let payload: Value =
        serde_json::from_str(&payload).unwrap_or_else(|_| Value::String(payload));

    match core.controller.process_input(&user, &route, payload) {
        Ok(result) => {
            println!("route: {route}");
            println!("status: ok");
            println!("result: {result}");
        }
        Err(err) => {
            println!("route: {route}");
            println!("status: error");
            println!("error: {err}");
        }
    }
    Ok(())
}

fn task(command: TaskCommand) -> Result<()> {
    let core = load_core()?;

    match command {
        TaskCommand::Add {
            name,
            handler,
            every,
            daily,
            once_at,
            once_in,
        } => {
            let schedule = parse_schedule(every, daily, once_at, once_in)?;
            if !core.router.contains(&handler) {
                println!("warning: no handler currently registered for '{handler}'");
            }
            let task_id = core.scheduler.add_task(name, handler, schedule)?;
            println!("task_added: true");
            println!("task_id: {task_id}");
        }
        TaskCommand::Remove { task_id } => {
            let removed = core.scheduler.remove_task(&task_id);
            println!("task_removed: {removed}");
            println!("task_id: {task_id}");
        }
        TaskCommand::List => {
            let tasks = core.scheduler.list_tasks();
            println!("tasks: {}", tasks.len());
            for task in tasks {
                println!(
                    "- {} | {} | {} | {} | next_run {}",
                    task.id, task.name, task.handler_ref, task.schedule, task.next_run
                );
            }
        }
    }
    Ok(())
}

fn parse_schedule(
    every: Option<u64>,
    daily: Option<String>,
    once_at: Option<i64>,
    once_in: Option<u64>,
) -> Result<Schedule> {
    if let Some(seconds) = every {
        return Ok(Schedule::Interval { seconds });
    }
    if let Some(time) = daily {
        let mut parts = time.split(':');
        let hour = next_time_part(&mut parts, &time)?;
        let minute = next_time_part(&mut parts, &time)?;
        let second = match parts.next() {
            Some(part) => part
                .parse()
                .with_context(|| format!("invalid time of day: {time}"))?,
            None => 0,
        };
        if parts.next().is_some() {
            bail!("invalid time of day: {time}");
        }
        return Ok(Schedule::FixedTime {
            hour,
            minute,
            second,
        });
    }
    if let Some(run_at) = once_at {
        return Ok(Schedule::OneShot { run_at });
    }
    if let Some(delay) = once_in {
        return Ok(Schedule::OneShot {
            run_at: hearth_scheduler::now_epoch() + delay as i64,
        });
    }
    bail!("one of --every, --daily, --once-at, or --once-in is required");
}

fn next_time_part<'a>(
    parts: &mut impl Iterator<Item = &'a str>,
    raw: &str,
) -> Result<u32> {
    parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("invalid time of day: {raw}"))?
        .parse()
        .with_context(|| format!("invalid time of day: {raw}"))
}

fn module(command: ModuleCommand) -> Result<()> {
    let core = load_core()?;

    match command {
        ModuleCommand::Stop { module } => {
            core.switches.activate(&module);
            println!("module: {module}");
            println!("stopped: true");
        }
        ModuleCommand::Resume { module } => {
            core.switches.deactivate(&module);
            println!("module: {module}");
            println!("stopped: false");
        }
        ModuleCommand::List => {
            let states = core.switches.states();
            println!("modules: {}", states.len());
            for (module, stopped) in states {
                println!("- {module} | stopped: {stopped}");
            }
        }
    }
    Ok(())
}

fn kill(command: KillCommand) -> Result<()> {
    let core = load_core()?;

    match command {
        KillCommand::Activate { origin } => {
            core.kill.activate(&origin);
            println!("kill_switch: active");
            println!("origin: {origin}");
        }
        KillCommand::Reset { password } => {
            let reset = core.kill.reset(&password);
            println!("reset_accepted: {reset}");
            println!("active: {}", core.kill.is_active());
        }
        KillCommand::Status => {
            let status = core.kill.status();
            println!("active: {}", status.active);
            println!("reset_protected: {}", status.reset_protected);
            println!("reset_hash_env: {}", core.config.kill_switch.reset_hash_env);
        }
    }
    Ok(())
}

fn security(command: SecurityCommand) -> Result<()> {
    match command {
        SecurityCommand::HashPassword { password } => {
            // No core needed; hashing is stateless.
            let hash = hearth_security::hash_password(&password)?;
            println!("hash: {hash}");
        }
        SecurityCommand::Verify { hash, password } => {
            let valid = hearth_security::verify_password(&hash, &password);
            println!("valid: {valid}");
        }
        SecurityCommand::Rotate { passphrase } => {
            let core = load_core()?;
            let version = core.security.rotate_key(passphrase.as_deref())?;
            core.security.save_key(&core.key_path())?;
            println!("key_rotated: true");
            println!("key_version: {version}");
            println!("key_file: {}", core.key_path().display());
        }
    }
    Ok(())
}

fn user(command: UserCommand) -> Result<()> {
    let core = load_core()?;

    match command {
        UserCommand::Register { user_id, password } => {
            core.controller.register_user(&user_id, &password)?;
            println!("user_registered: true");
            println!("user_id: {user_id}");
        }
        UserCommand::Auth { user_id, password } => {
            let authenticated = core.controller.authenticate_user(&user_id, &password);
            println!("user_id: {user_id}");
            println!("authenticated: {authenticated}");
        }
        UserCommand::Remove { user_id } => {
            let removed = core.controller.remove_user(&user_id);
            println!("user_removed: {removed}");
            println!("user_id: {user_id}");
        }
        UserCommand::List => {
            let users = core.controller.user_ids();
            println!("users: {}", users.len());
            for user_id in users {
                println!("- {user_id}");
            }
        }
    }
    Ok(())
}
