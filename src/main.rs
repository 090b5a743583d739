use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gha_watch::config::Config;
use gha_watch::github::{ActionsMirror, WorkflowRun, WATCH_RUN_ATTEMPTS};
use gha_watch::sync::Change;

#[derive(Parser, Debug)]
#[command(name = "gha-watch")]
#[command(about = "A live terminal mirror of GitHub Actions workflow runs")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/gha-watch/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Repository to watch as owner/repo (overrides the config file)
  #[arg(short, long)]
  repo: Option<String>,

  /// Only watch runs for this branch
  #[arg(short, long)]
  branch: Option<String>,

  /// Watch a single run by id instead of the whole repository
  #[arg(long)]
  run: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = Config::load(args.config.as_deref())?;
  if let Some(repo) = &args.repo {
    let (owner, name) = repo
      .split_once('/')
      .ok_or_else(|| eyre!("--repo expects owner/repo"))?;
    config.github.owner = owner.to_string();
    config.github.repo = name.to_string();
  }

  let _log_guard = init_logging(&config)?;

  let mirror = ActionsMirror::new(&config)?;

  if let Some(run_id) = args.run {
    let handle = mirror.watch_run(run_id, WATCH_RUN_ATTEMPTS);
    match handle.get(&run_id).await? {
      Some(run) => println!("{}", describe_run(&run)),
      None => println!("run {run_id} not found yet"),
    }
    let _subscription = handle.feed().subscribe(print_run_changes);
    tokio::signal::ctrl_c().await?;
    handle.dispose();
  } else {
    let handle = mirror.workflow_runs(args.branch.as_deref());
    let runs = handle.items().await?;
    println!(
      "{} runs for {}/{}",
      runs.len(),
      config.github.owner,
      config.github.repo
    );
    for run in runs.iter().take(10) {
      println!("  {}", describe_run(run));
    }
    let _subscription = handle.feed().subscribe(print_run_changes);
    tokio::signal::ctrl_c().await?;
    handle.dispose();
  }

  mirror.shutdown();

  Ok(())
}

fn init_logging(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gha_watch=info"));

  match &config.log_file {
    Some(path) => {
      let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| eyre!("Failed to open log file {}: {}", path.display(), e))?;
      let (writer, guard) = tracing_appender::non_blocking(file);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}

fn print_run_changes(changes: &[Change<u64, WorkflowRun>]) {
  for change in changes {
    match change {
      Change::Insert { value, .. } => println!("+ {}", describe_run(value)),
      Change::Update { value, .. } => println!("~ {}", describe_run(value)),
      Change::Delete { key } => println!("- run {key} left the listing window"),
    }
  }
}

fn describe_run(run: &WorkflowRun) -> String {
  let state = match (&run.status, &run.conclusion) {
    (_, Some(conclusion)) => conclusion.clone(),
    (Some(status), None) => status.clone(),
    (None, None) => "unknown".to_string(),
  };
  format!(
    "#{} {} [{}] {} on {}",
    run.run_number,
    run.display_name(),
    state,
    run.event,
    run.head_branch.as_deref().unwrap_or("-")
  )
}
