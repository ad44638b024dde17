//! `foreman` CLI: batch FSM driver, inbox bridge, heartbeat wrapper and
//! watcher over a shared filesystem.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use foreman::batch::{BatchDriver, BatchOptions};
use foreman::bridge::Bridge;
use foreman::core::envelope::{Envelope, MessageType};
use foreman::core::workflow::Workflow;
use foreman::error::{is_cancelled, is_config_error};
use foreman::exit_codes;
use foreman::fsm::Engine;
use foreman::io::config::{DEFAULT_CONFIG_PATH, FleetConfig, load_config, write_config};
use foreman::io::escalation::EscalationSink;
use foreman::io::evidence::EvidenceWriter;
use foreman::io::guards::ShellGuardRunner;
use foreman::io::heartbeat_store::CommsLayout;
use foreman::io::inbox::Inbox;
use foreman::io::kv::FsStore;
use foreman::io::procfs::ProcProbe;
use foreman::io::task_store::{OwnerFilter, TaskFilter, TaskStore};
use foreman::io::workflow_loader::{find_workflow, load_workflow};
use foreman::logging;
use foreman::schedule::{Pass, Shutdown};
use foreman::watch::Watcher;
use foreman::wrap::{WrapOptions, run_wrapped};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Filesystem-coordinated task and guard orchestration"
)]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file and create the directory layout.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Advance every task in an actionable state once and write the digest.
    BatchRun(BatchArgs),
    /// Classify heartbeat records and raise escalations.
    Watch(WatchArgs),
    /// Run a command under heartbeat supervision.
    Wrap(WrapArgs),
    /// Hand queued, unowned tasks to agents.
    Assign {
        /// Workflow file, or a name resolved in `workflows_dir`.
        #[arg(long)]
        workflow: String,
        /// Candidate agent (repeatable).
        #[arg(long = "agent", required = true)]
        agents: Vec<String>,
    },
    /// Consume `fsm_update` envelopes from the bridge inbox.
    Bridge {
        /// Ignore incoming states this workflow does not declare.
        #[arg(long)]
        workflow: Option<String>,
        /// Keep polling until interrupted.
        #[arg(long = "loop")]
        looping: bool,
        /// Seconds between scans (default: config `poll_interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Drop one envelope into an agent's inbox.
    Send(SendArgs),
    /// Inspect task records.
    Tasks {
        #[command(subcommand)]
        command: TasksCommand,
    },
    /// Inspect workflow files.
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommand,
    },
}

#[derive(Args)]
struct BatchArgs {
    /// Workflow file, or a name resolved in `workflows_dir`.
    #[arg(long)]
    workflow: String,
    /// Only process tasks bound to this workflow name (or unbound).
    #[arg(long)]
    workflow_name: Option<String>,
    /// Repeat the pass until interrupted.
    #[arg(long = "loop")]
    looping: bool,
    /// Seconds between passes with `--loop`.
    #[arg(long)]
    interval: Option<u64>,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long)]
    idle_secs: Option<u64>,
    #[arg(long)]
    cpu_threshold: Option<f64>,
    /// Seconds between scans with `--loop`.
    #[arg(long)]
    interval: Option<u64>,
    #[arg(long = "loop")]
    looping: bool,
}

#[derive(Args)]
struct WrapArgs {
    #[arg(long)]
    agent_id: String,
    /// Shell command to supervise.
    #[arg(long)]
    cmd: String,
    #[arg(long)]
    cwd: Option<PathBuf>,
    #[arg(long)]
    heartbeat_secs: Option<u64>,
    /// Do not echo child output.
    #[arg(long)]
    quiet: bool,
}

#[derive(Args)]
struct SendArgs {
    #[arg(long)]
    to: String,
    #[arg(long = "type")]
    kind: MessageType,
    #[arg(long, default_value = "operator")]
    from: String,
    #[arg(long)]
    task_id: Option<String>,
    #[arg(long)]
    state: Option<String>,
    #[arg(long)]
    summary: Option<String>,
    #[arg(long)]
    repo_path: Option<String>,
    #[arg(long)]
    ttl_secs: Option<u64>,
}

#[derive(Subcommand)]
enum TasksCommand {
    /// One line per task: id, state, owner.
    List {
        #[arg(long)]
        state: Vec<String>,
        #[arg(long, conflicts_with = "unowned")]
        owner: Option<String>,
        #[arg(long)]
        unowned: bool,
        /// Print full records as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Print one task record.
    Show { task_id: String },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// Load and validate a workflow file.
    Check { path: PathBuf },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) if is_config_error(&err) => {
            eprintln!("{err:#}");
            exit_codes::CONFIG
        }
        Err(err) if is_cancelled(&err) => {
            eprintln!("{err:#}");
            exit_codes::INTERRUPTED
        }
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::FAILED
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        command => {
            let cfg = load_config(&cli.config)?;
            dispatch(&cli.config, &cfg, command)
        }
    }
}

fn dispatch(config_path: &Path, cfg: &FleetConfig, command: Command) -> Result<i32> {
    match command {
        Command::Init { force } => cmd_init(config_path, force),
        Command::BatchRun(args) => cmd_batch_run(cfg, args),
        Command::Watch(args) => cmd_watch(cfg, args),
        Command::Wrap(args) => cmd_wrap(cfg, args),
        Command::Assign { workflow, agents } => cmd_assign(cfg, &workflow, &agents),
        Command::Bridge {
            workflow,
            looping,
            interval,
        } => cmd_bridge(cfg, workflow.as_deref(), looping, interval),
        Command::Send(args) => cmd_send(cfg, args),
        Command::Tasks { command } => cmd_tasks(cfg, command),
        Command::Workflow {
            command: WorkflowCommand::Check { path },
        } => cmd_workflow_check(&path),
    }
}

fn cmd_init(config_path: &Path, force: bool) -> Result<i32> {
    let cfg = if config_path.exists() && !force {
        info!(path = %config_path.display(), "config exists, keeping it");
        load_config(config_path)?
    } else {
        let cfg = FleetConfig::default();
        write_config(config_path, &cfg)?;
        cfg
    };
    for dir in [
        &cfg.tasks_root,
        &cfg.inbox_root,
        &cfg.comms_root,
        &cfg.workspaces_root,
        &cfg.evidence_root,
        &cfg.digest_dir,
        &cfg.workflows_dir,
    ] {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    println!("{}", config_path.display());
    Ok(exit_codes::OK)
}

fn task_store(cfg: &FleetConfig) -> TaskStore<FsStore> {
    TaskStore::new(FsStore::new(&cfg.tasks_root))
}

fn inbox(cfg: &FleetConfig) -> Inbox {
    Inbox::new(&cfg.inbox_root).with_default_ttl(cfg.default_ttl())
}

/// `arg` is a path if it names a file, otherwise a workflow name.
fn resolve_workflow(cfg: &FleetConfig, arg: &str) -> Result<Workflow> {
    let path = Path::new(arg);
    if path.is_file() {
        return load_workflow(path);
    }
    load_workflow(&find_workflow(&cfg.workflows_dir, arg)?)
}

fn interval_or(cfg: &FleetConfig, secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or_else(|| cfg.poll_interval())
}

fn cmd_batch_run(cfg: &FleetConfig, args: BatchArgs) -> Result<i32> {
    let workflow = resolve_workflow(cfg, &args.workflow)?;
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;

    let runner = ShellGuardRunner::new(cfg.guard_output_limit_bytes).with_shutdown(shutdown.clone());
    let engine = Engine::new(
        task_store(cfg),
        runner,
        EvidenceWriter::new(&cfg.evidence_root),
        cfg.guard_timeout(),
    )
    .with_shutdown(shutdown.clone());
    let mut driver = BatchDriver::new(
        engine,
        workflow,
        BatchOptions {
            workspaces_root: cfg.workspaces_root.clone(),
            digest_dir: cfg.digest_dir.clone(),
            workflow_filter: args.workflow_name,
            fleet_health: Some((CommsLayout::new(&cfg.comms_root), cfg.thresholds())),
        },
    );

    if args.looping {
        driver.run_forever(interval_or(cfg, args.interval), &shutdown)?;
        return Ok(exit_codes::OK);
    }
    let digest = driver.run_pass()?;
    println!(
        "processed {} task(s): {} advanced, {} failed",
        digest.processed, digest.moved, digest.failed
    );
    Ok(exit_codes::OK)
}

fn cmd_watch(cfg: &FleetConfig, args: WatchArgs) -> Result<i32> {
    let mut thresholds = cfg.thresholds();
    if let Some(idle) = args.idle_secs {
        thresholds.idle_secs = idle;
    }
    if let Some(cpu) = args.cpu_threshold {
        thresholds.cpu_threshold = cpu;
    }
    if thresholds.idle_secs == 0 {
        bail!(foreman::error::FleetError::config("--idle-secs must be > 0"));
    }
    let layout = CommsLayout::new(&cfg.comms_root);
    let sink = EscalationSink::new(layout.events_path(), inbox(cfg).escalations_dir(&cfg.supervisor)?);
    let mut watcher = Watcher::new(layout, sink, ProcProbe, thresholds);

    if args.looping {
        let shutdown = Shutdown::new();
        shutdown.install_signal_handler()?;
        watcher.run_forever(interval_or(cfg, args.interval), &shutdown)?;
        return Ok(exit_codes::OK);
    }
    let report = watcher.scan(chrono::Utc::now())?;
    for finding in &report.findings {
        println!(
            "{}\t{}\toutput {:.0}s\theartbeat {:.0}s",
            finding.agent_id,
            finding.status.as_str(),
            finding.output_age_secs,
            finding.heartbeat_age_secs
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_wrap(cfg: &FleetConfig, args: WrapArgs) -> Result<i32> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler()?;
    let options = WrapOptions {
        agent_id: args.agent_id,
        cmd: args.cmd,
        cwd: args.cwd,
        heartbeat: Duration::from_secs(args.heartbeat_secs.unwrap_or(cfg.heartbeat_secs).max(1)),
        echo: !args.quiet,
    };
    let outcome = run_wrapped(&CommsLayout::new(&cfg.comms_root), &options, &shutdown)?;
    if outcome.terminated {
        return Ok(exit_codes::INTERRUPTED);
    }
    Ok(outcome.exit_code.unwrap_or(exit_codes::FAILED))
}

fn cmd_assign(cfg: &FleetConfig, workflow: &str, agents: &[String]) -> Result<i32> {
    let workflow = resolve_workflow(cfg, workflow)?;
    let bridge = Bridge::new(task_store(cfg), inbox(cfg), &cfg.bridge_identity, &cfg.supervisor);
    let assigned = bridge.assign(&workflow, agents)?;
    println!("assigned {assigned} task(s)");
    Ok(exit_codes::OK)
}

fn cmd_bridge(
    cfg: &FleetConfig,
    workflow: Option<&str>,
    looping: bool,
    interval: Option<u64>,
) -> Result<i32> {
    let mut bridge = Bridge::new(task_store(cfg), inbox(cfg), &cfg.bridge_identity, &cfg.supervisor);
    if let Some(workflow) = workflow {
        bridge = bridge.with_workflow(resolve_workflow(cfg, workflow)?);
    }
    let mut poller = bridge.poller()?;
    if looping {
        let shutdown = Shutdown::new();
        shutdown.install_signal_handler()?;
        poller.run_forever(interval_or(cfg, interval), &shutdown)?;
        return Ok(exit_codes::OK);
    }
    let deliveries = poller.poll_once(chrono::Utc::now())?;
    println!("processed {} envelope(s)", deliveries.len());
    Ok(exit_codes::OK)
}

fn cmd_send(cfg: &FleetConfig, args: SendArgs) -> Result<i32> {
    let mut envelope = Envelope::new(args.kind, args.from, &args.to);
    envelope.task_id = args.task_id;
    envelope.state = args.state;
    envelope.summary = args.summary;
    envelope.repo_path = args.repo_path;
    envelope.ttl_s = args.ttl_secs;
    let path = inbox(cfg).enqueue(&args.to, &envelope)?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_tasks(cfg: &FleetConfig, command: TasksCommand) -> Result<i32> {
    let store = task_store(cfg);
    match command {
        TasksCommand::List {
            state,
            owner,
            unowned,
            json,
        } => {
            let filter = TaskFilter {
                states: (!state.is_empty()).then(|| state.into_iter().collect()),
                owner: match (owner, unowned) {
                    (Some(owner), _) => OwnerFilter::Is(owner),
                    (None, true) => OwnerFilter::Unowned,
                    (None, false) => OwnerFilter::Any,
                },
                workflow: None,
            };
            for task in store.list_tasks(filter)? {
                let task = task?;
                if json {
                    println!("{}", serde_json::to_string(&task)?);
                } else {
                    let owner = if task.is_unowned() { "-" } else { task.owner.as_str() };
                    println!("{}\t{}\t{}", task.task_id, task.state, owner);
                }
            }
        }
        TasksCommand::Show { task_id } => {
            let task = store.read_task(&task_id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_workflow_check(path: &Path) -> Result<i32> {
    let workflow = load_workflow(path)?;
    println!(
        "{}: ok ({} states, {} guards, initial '{}')",
        workflow.name,
        workflow.states.len(),
        workflow.guards.len(),
        workflow.initial
    );
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_batch_run() {
        let cli = Cli::parse_from(["foreman", "batch-run", "--workflow", "review"]);
        assert!(matches!(
            cli.command,
            Command::BatchRun(BatchArgs { ref workflow, looping: false, .. }) if workflow == "review"
        ));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_PATH));
    }

    #[test]
    fn parse_watch_flags() {
        let cli = Cli::parse_from([
            "foreman",
            "watch",
            "--idle-secs",
            "120",
            "--cpu-threshold",
            "2.5",
            "--loop",
        ]);
        let Command::Watch(args) = cli.command else {
            panic!("expected watch");
        };
        assert_eq!(args.idle_secs, Some(120));
        assert_eq!(args.cpu_threshold, Some(2.5));
        assert!(args.looping);
    }

    #[test]
    fn parse_send_type() {
        let cli = Cli::parse_from([
            "foreman", "send", "--to", "w1", "--type", "fsm_update", "--task-id", "t1",
        ]);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.kind, MessageType::FsmUpdate);
    }

    #[test]
    fn global_config_after_subcommand() {
        let cli = Cli::parse_from(["foreman", "tasks", "list", "--config", "x.toml"]);
        assert_eq!(cli.config, PathBuf::from("x.toml"));
    }
}
