//! # Vigil — always-on orchestration daemon
//!
//! Watches external state, decides when to act, executes queued work, and
//! keeps an operator in the loop for risky actions.
//!
//! Usage:
//!   vigil run                                # Start the daemon
//!   vigil task add backup --priority 2      # Enqueue work
//!   vigil task list --status pending        # Inspect the queue
//!   vigil approvals                          # Pending approval requests
//!   vigil resolve <id> --decision approved   # Answer one
//!   vigil wait <id>                          # Block until one is resolved
//!   vigil pause / vigil resume / vigil status

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vigil_core::VigilConfig;
use vigil_engine::{
    ApprovalGate, CommandRunner, ConsoleChannel, Decision, DecisionEngine, FileStateProvider,
    NotificationRouter, PidFileProbe, Priority, ProcessState, QuietHours, RetryPolicy, Scheduler,
    ServiceSpec, StateProvider, TaskExecutor, TaskQueue, TaskStatus, TrackerState, Trigger,
    Watchdog,
};

#[derive(Parser)]
#[command(name = "vigil", version, about = "👁️ Vigil — always-on orchestration daemon")]
struct Cli {
    /// Config file (default: ~/.vigil/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon
    Run,
    /// Task queue operations
    Task {
        #[command(subcommand)]
        action: TaskAction,
    },
    /// List pending approval requests
    Approvals,
    /// Resolve a pending approval request
    Resolve {
        id: String,
        /// approved or denied
        #[arg(long)]
        decision: String,
    },
    /// Block until an approval request is resolved or times out
    Wait { id: String },
    /// Pause decision and health loops of a running daemon
    Pause,
    /// Resume a paused daemon
    Resume,
    /// Show daemon and queue status
    Status,
}

#[derive(Subcommand)]
enum TaskAction {
    /// Enqueue a task
    Add {
        /// Task type label
        task_type: String,
        /// JSON payload, e.g. '{"command": "backup.sh"}'
        #[arg(long, default_value = "{}")]
        payload: String,
        /// 1 (urgent) .. 10 (idle)
        #[arg(long, default_value = "5")]
        priority: i64,
    },
    /// List tasks
    List {
        /// Filter: pending, running, completed, failed, dead_letter, cancelled
        #[arg(long)]
        status: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Cancel a pending task
    Cancel { id: i64 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "vigil=debug" } else { "vigil=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => VigilConfig::load_from(path)?,
        None => VigilConfig::load()?,
    };
    let data_dir = VigilConfig::home_dir();

    match cli.command {
        Command::Run => run_daemon(config, data_dir).await,
        Command::Task { action } => task_command(&config, &data_dir, action),
        Command::Approvals => {
            let gate = open_gate(&config, &data_dir);
            let pending = gate.pending()?;
            if pending.is_empty() {
                println!("No pending approvals.");
                return Ok(());
            }
            for req in pending {
                println!(
                    "🔐 {}  {}  (requested {}, times out after {}s)",
                    req.id, req.action, req.requested_at, req.timeout_secs
                );
                if !req.description.is_empty() {
                    println!("     {}", req.description);
                }
            }
            Ok(())
        }
        Command::Resolve { id, decision } => {
            let approve = match decision.as_str() {
                "approved" => true,
                "denied" => false,
                other => anyhow::bail!("decision must be 'approved' or 'denied', got '{other}'"),
            };
            let gate = open_gate(&config, &data_dir);
            let status = gate.resolve(&id, approve)?;
            println!("✅ Approval {id} is now {}", status.as_str());
            Ok(())
        }
        Command::Wait { id } => {
            let gate = open_gate(&config, &data_dir);
            let status = gate.wait_for_approval(&id).await?;
            println!("🔐 Approval {id} is {}", status.as_str());
            Ok(())
        }
        Command::Pause => {
            ProcessState::pause(&data_dir)?;
            println!("⏸️ Paused. Decision and health loops will skip their ticks.");
            Ok(())
        }
        Command::Resume => {
            ProcessState::resume(&data_dir)?;
            println!("▶️ Resumed.");
            Ok(())
        }
        Command::Status => status_command(&config, &data_dir),
    }
}

fn task_command(config: &VigilConfig, data_dir: &std::path::Path, action: TaskAction) -> Result<()> {
    let queue = open_queue(config, data_dir)?;
    match action {
        TaskAction::Add {
            task_type,
            payload,
            priority,
        } => {
            let payload: serde_json::Value = serde_json::from_str(&payload)?;
            let id = queue.enqueue(&task_type, &payload, priority)?;
            println!("📥 Task #{id} queued ({task_type}, priority {priority})");
        }
        TaskAction::List { status, limit } => {
            let filter = status.as_deref().map(parse_status).transpose()?;
            let tasks = queue.list(filter, limit)?;
            if tasks.is_empty() {
                println!("No tasks.");
                return Ok(());
            }
            for t in tasks {
                println!(
                    "#{:<5} {:<12} p{} retries={} {}{}",
                    t.id,
                    t.status.as_str(),
                    t.priority,
                    t.retry_count,
                    t.task_type,
                    t.error.map(|e| format!("  ({e})")).unwrap_or_default()
                );
            }
        }
        TaskAction::Cancel { id } => {
            queue.cancel(id)?;
            println!("🚫 Task #{id} cancelled");
        }
    }
    Ok(())
}

fn status_command(config: &VigilConfig, data_dir: &std::path::Path) -> Result<()> {
    match ProcessState::running_pid(data_dir) {
        Some(pid) => {
            let paused = if ProcessState::is_paused(data_dir) {
                " (paused)"
            } else {
                ""
            };
            println!("👁️ Vigil running, pid {pid}{paused}");
        }
        None => println!("💤 Vigil is not running"),
    }

    let queue = open_queue(config, data_dir)?;
    let counts = queue.counts_by_status()?;
    if counts.is_empty() {
        println!("Queue: empty");
    } else {
        let line: Vec<String> = counts.iter().map(|(s, n)| format!("{s}={n}")).collect();
        println!("Queue: {}", line.join(" "));
    }

    let gate = open_gate(config, data_dir);
    println!("Pending approvals: {}", gate.pending()?.len());
    Ok(())
}

async fn run_daemon(config: VigilConfig, data_dir: PathBuf) -> Result<()> {
    // Only the daemon requeues orphaned claims. CLI invocations use the
    // plain open so they never disturb a live daemon's running tasks.
    let queue = Arc::new(TaskQueue::open_for_daemon(
        &data_dir.join("queue.db"),
        retry_policy(&config),
    )?);
    let tracker = Arc::new(TrackerState::open(&data_dir.join("tracker.json")));
    let gate = Arc::new(open_gate(&config, &data_dir));

    let mut router = NotificationRouter::new(
        QuietHours {
            start_hour: config.notify.quiet_hours_start,
            end_hour: config.notify.quiet_hours_end,
        },
        chrono::Duration::seconds(config.notify.dedup_window_secs as i64),
    );
    router.register_channel(Box::new(ConsoleChannel), 100);

    let mut engine = DecisionEngine::new(tracker.clone());
    register_system_triggers(&mut engine)?;

    let providers: Vec<Arc<dyn StateProvider>> = vec![Arc::new(FileStateProvider::new(
        "system",
        &data_dir.join("state.json"),
    ))];

    let services: Vec<ServiceSpec> = config
        .watchdog
        .services
        .iter()
        .map(|s| ServiceSpec {
            name: s.name.clone(),
            pid_file: PathBuf::from(&s.pid_file),
            start_command: s.start_command.clone(),
        })
        .collect();
    let watchdog = Watchdog::new(
        services,
        Box::new(PidFileProbe),
        tracker.clone(),
        config.watchdog.clone(),
    );

    let executor = TaskExecutor::new(queue.clone(), Arc::new(CommandRunner), config.executor.clone());

    let scheduler = Scheduler::new(
        config,
        &data_dir,
        engine,
        providers,
        queue,
        router,
        gate,
        tracker,
        watchdog,
        executor,
    )?;

    let (tx, rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Ctrl-C received");
            tx.send(true).ok();
        }
    });

    scheduler.run(rx).await?;
    Ok(())
}

/// Built-in triggers over the system state file.
fn register_system_triggers(engine: &mut DecisionEngine) -> Result<()> {
    engine.register(Trigger::new(
        "high_memory",
        chrono::Duration::minutes(30),
        |snap| {
            Ok(snap
                .get("/system/memory_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                > 90.0)
        },
        |snap| {
            let pct = snap
                .get("/system/memory_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            Ok(
                Decision::notify(Priority::High, "Memory pressure", &format!("{pct:.0}% used"))
                    .with_dedup_key("system:high_memory"),
            )
        },
    ))?;
    engine.register(Trigger::new(
        "low_disk",
        chrono::Duration::hours(6),
        |snap| {
            Ok(snap
                .get("/system/disk_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                > 90.0)
        },
        |snap| {
            let pct = snap
                .get("/system/disk_percent")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            Ok(
                Decision::notify(Priority::Medium, "Disk almost full", &format!("{pct:.0}% used"))
                    .with_dedup_key("system:low_disk"),
            )
        },
    ))?;
    Ok(())
}

fn open_queue(config: &VigilConfig, data_dir: &std::path::Path) -> Result<Arc<TaskQueue>> {
    let queue = TaskQueue::open(&data_dir.join("queue.db"), retry_policy(config))?;
    Ok(Arc::new(queue))
}

fn retry_policy(config: &VigilConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.queue.max_retries,
        backoff_base_secs: config.queue.backoff_base_secs,
        backoff_cap_secs: config.queue.backoff_cap_secs,
    }
}

fn open_gate(config: &VigilConfig, data_dir: &std::path::Path) -> ApprovalGate {
    ApprovalGate::open(
        &data_dir.join("approvals.json"),
        std::time::Duration::from_secs(config.approval.poll_interval_secs),
    )
}

fn parse_status(s: &str) -> Result<TaskStatus> {
    Ok(match s {
        "pending" => TaskStatus::Pending,
        "running" => TaskStatus::Running,
        "completed" => TaskStatus::Completed,
        "failed" => TaskStatus::Failed,
        "dead_letter" => TaskStatus::DeadLetter,
        "cancelled" => TaskStatus::Cancelled,
        other => anyhow::bail!("unknown status '{other}'"),
    })
}
