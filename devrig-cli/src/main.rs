mod builder;
mod commands;
mod compose_file;
mod config;
mod docker;
mod logging;
mod tui;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use devrig_core::cancel::{cancel_pair, CancelToken};
use devrig_core::command::Command;
use devrig_core::commander::Commander;
use devrig_core::compose::{ComposeCommand, ComposeRuntime};
use devrig_core::init::InitWrapper;
use devrig_core::pipe::pipe;
use devrig_core::ports::resolve_port_conflicts;
use devrig_core::process::ProcessCommand;
use devrig_core::tree::CommandTree;

use builder::ShellBuilder;
use config::{RigConfig, TaskConfig, TaskKind, WatchConfig};
use docker::DockerCompose;
use tui::{TabSource, TuiSession};

#[derive(Parser)]
#[command(name = "devrig")]
#[command(about = "Run a development workspace: processes, init scripts, containers", long_about = None)]
struct Cli {
    /// Verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file path; otherwise devrig.yml is discovered upward
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log destination; TUI runs default to devrig.log
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the workspace up in the TUI, optionally just one task
    Run { task: Option<String> },
    /// Headless control over the compose tasks
    Compose {
        #[command(subcommand)]
        action: ComposeAction,
    },
    /// Scaffold a starter devrig.yml
    Init {
        #[arg(short, long)]
        force: bool,
    },
    /// Tear down leftover compose containers
    Clean,
}

#[derive(Subcommand)]
enum ComposeAction {
    Up,
    Down,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run { task: None });

    // TUI sessions log to a file so stderr never draws over the
    // alternate screen.
    let wants_tui = matches!(command, Commands::Run { .. });
    match (&cli.log_file, wants_tui) {
        (Some(path), _) => logging::init_file(cli.verbose, path)?,
        (None, true) => logging::init_file(cli.verbose, Path::new("devrig.log"))?,
        (None, false) => logging::init_stderr(cli.verbose),
    }

    match command {
        Commands::Init { force } => commands::run_init(force),
        Commands::Run { task } => {
            let (base_dir, config) = load_config(cli.config.as_deref())?;
            run_workspace(config, &base_dir, task).await
        }
        Commands::Compose { action } => {
            let (base_dir, config) = load_config(cli.config.as_deref())?;
            match action {
                ComposeAction::Up => compose_up(&config, &base_dir).await,
                ComposeAction::Down => commands::run_clean(&config, &base_dir).await,
            }
        }
        Commands::Clean => {
            let (base_dir, config) = load_config(cli.config.as_deref())?;
            commands::run_clean(&config, &base_dir).await
        }
    }
}

fn load_config(explicit: Option<&Path>) -> Result<(PathBuf, RigConfig)> {
    let (path, config) = match explicit {
        Some(path) => (path.to_path_buf(), RigConfig::load(path)?),
        None => {
            let cwd = std::env::current_dir().context("cannot determine current directory")?;
            RigConfig::discover(&cwd)?
        }
    };
    info!(config = %path.display(), "loaded config");
    let base_dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok((base_dir, config))
}

/// Builds the full command set from the config, hands it to a commander and
/// runs the TUI session over it until shutdown.
async fn run_workspace(config: RigConfig, base_dir: &Path, only: Option<String>) -> Result<()> {
    let tasks: Vec<&TaskConfig> = match &only {
        Some(name) => vec![config.task(name)?],
        None => config.tasks.iter().collect(),
    };

    let (cancel, token) = cancel_pair();
    let (status_tx, status_rx) = pipe();
    // Docker is dialed only when the selection has compose tasks.
    let mut docker: Option<Arc<DockerCompose>> = None;

    let mut children: Vec<Arc<dyn Command>> = Vec::new();
    let mut sources: Vec<TabSource> = Vec::new();
    for task in tasks {
        match task.kind {
            TaskKind::Process => {
                let (child, mut task_sources) = build_process_task(task, base_dir, &token);
                sources.append(&mut task_sources);
                children.push(child);
            }
            TaskKind::Compose => {
                let runtime = docker_runtime(&mut docker).await?;
                let child = build_compose_task(task, base_dir, runtime)?;
                sources.push(TabSource::from_command(child.as_ref()));
                children.push(child);
            }
        }
    }

    let builder = ShellBuilder::new(
        config.build.clone(),
        base_dir,
        status_tx.clone(),
        token.clone(),
    );
    let commander = Commander::new(token, Arc::new(builder), children);

    let session = TuiSession::new(Arc::clone(&commander), sources, status_rx);
    let result = session.run().await;

    // Normally a no-op by now; on a UI error it still takes the rig down.
    cancel.cancel();
    commander.done().wait().await;
    result
}

/// Process task: the subprocess itself, an init wrapper when scripts are
/// configured, and a command tree when watch helpers ride along.
fn build_process_task(
    task: &TaskConfig,
    base_dir: &Path,
    token: &CancelToken,
) -> (Arc<dyn Command>, Vec<TabSource>) {
    let dir = task_dir(base_dir, task.dir.as_deref());

    let mut process = ProcessCommand::new(
        &task.name,
        task.command.clone().unwrap_or_default(),
        task.path.clone().unwrap_or_default(),
        task.args.clone(),
    )
    .dir(dir.clone());
    for (key, value) in &task.env {
        process = process.env(key.as_str(), value.as_str());
    }

    let root: Arc<dyn Command> = if task.init_once.is_empty() && task.init.is_empty() {
        Arc::new(process)
    } else {
        Arc::new(InitWrapper::new(
            Box::new(process),
            task.init_once.clone(),
            task.init.clone(),
            dir.clone(),
            token.clone(),
        ))
    };

    // Streams come off the outermost command so init chatter lands in the
    // tab too.
    let mut sources = vec![TabSource::from_command(root.as_ref())];

    if task.watch.is_empty() {
        return (root, sources);
    }
    let mut subs: Vec<Arc<dyn Command>> = Vec::new();
    for watch in &task.watch {
        let sub = build_watch_command(watch, &dir, base_dir);
        sources.push(TabSource::from_command(sub.as_ref()));
        subs.push(sub);
    }
    (Arc::new(CommandTree::new(root, subs)), sources)
}

fn build_watch_command(watch: &WatchConfig, parent_dir: &Path, base_dir: &Path) -> Arc<dyn Command> {
    let dir = match &watch.dir {
        Some(dir) => base_dir.join(dir),
        None => parent_dir.to_path_buf(),
    };
    let mut process = ProcessCommand::new(
        &watch.name,
        watch.command.clone(),
        String::new(),
        watch.args.clone(),
    )
    .dir(dir);
    for (key, value) in &watch.env {
        process = process.env(key.as_str(), value.as_str());
    }
    Arc::new(process)
}

fn build_compose_task(
    task: &TaskConfig,
    base_dir: &Path,
    runtime: Arc<dyn ComposeRuntime>,
) -> Result<Arc<ComposeCommand>> {
    let file = task
        .file
        .as_ref()
        .context("compose task without a file survived validation")?;
    let mut project = compose_file::load(&base_dir.join(file), &task.name)
        .with_context(|| format!("cannot load {}", file.display()))?;
    let resolution = resolve_port_conflicts(&mut project)?;
    let resolution = if resolution.is_empty() {
        None
    } else {
        Some(resolution)
    };
    Ok(Arc::new(ComposeCommand::new(
        project,
        runtime,
        resolution.as_ref(),
    )?))
}

async fn docker_runtime(slot: &mut Option<Arc<DockerCompose>>) -> Result<Arc<DockerCompose>> {
    if let Some(docker) = slot {
        return Ok(Arc::clone(docker));
    }
    let docker = Arc::new(DockerCompose::connect().await?);
    *slot = Some(Arc::clone(&docker));
    Ok(docker)
}

fn task_dir(base_dir: &Path, dir: Option<&Path>) -> PathBuf {
    match dir {
        Some(dir) => base_dir.join(dir),
        None => base_dir.to_path_buf(),
    }
}

/// Brings the compose tasks up without the TUI, echoes their log streams to
/// stdout and tears everything down again on Ctrl-C.
async fn compose_up(config: &RigConfig, base_dir: &Path) -> Result<()> {
    let compose_tasks: Vec<_> = config
        .tasks
        .iter()
        .filter(|task| task.kind == TaskKind::Compose)
        .collect();
    if compose_tasks.is_empty() {
        println!("No compose tasks configured.");
        return Ok(());
    }

    let docker: Arc<dyn ComposeRuntime> = Arc::new(DockerCompose::connect().await?);
    let mut commands = Vec::new();
    for task in compose_tasks {
        let command = build_compose_task(task, base_dir, Arc::clone(&docker))?;
        if let Some(stdout) = command.stdout() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    println!("{line}");
                }
            });
        }
        command.up().await?;
        commands.push(command);
    }

    println!("Compose projects are up; Ctrl-C tears them down.");
    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for Ctrl-C")?;

    let mut first_err = None;
    for command in &commands {
        if let Err(err) = command.down().await {
            eprintln!("Failed to bring {} down: {err}", command.name());
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
