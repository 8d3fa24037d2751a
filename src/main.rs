mod local;

use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use braid_config::Pipeline;
use braid_driver::{Driver, DriverConfig, DriverDeps, JobOutcome, JobState};
use braid_store::SqliteStore;

use crate::local::LocalDispatcher;

/// Braid - a pipeline execution engine
#[derive(Parser)]
#[command(name = "braid")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.braid)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a JSON driver config file
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Run a pipeline with the builtin local algorithms
  Run {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,

    /// Flow input as inline JSON (default: read from stdin, else the
    /// pipeline's own flowInput)
    #[arg(long)]
    flow_input: Option<String>,

    /// Job id to use (default: a new uuid)
    #[arg(long)]
    job_id: Option<String>,
  },

  /// Resume a job from its persisted state
  Resume {
    /// Path to the pipeline file (JSON)
    pipeline_file: PathBuf,

    #[arg(long)]
    job_id: String,
  },

  /// Print the last graph snapshot of a job
  Graph { job_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".braid"),
  };
  let config = load_config(cli.config.as_deref())?;

  match cli.command {
    Some(Commands::Run {
      pipeline_file,
      flow_input,
      job_id,
    }) => {
      let mut pipeline = load_pipeline(&pipeline_file)?;
      if let Some(input) = read_flow_input(flow_input)? {
        pipeline.flow_input = Some(input);
      }
      let job_id = job_id.unwrap_or_else(|| Uuid::new_v4().to_string());
      run_job(&data_dir, config, &job_id, pipeline).await
    }
    Some(Commands::Resume {
      pipeline_file,
      job_id,
    }) => {
      let pipeline = load_pipeline(&pipeline_file)?;
      run_job(&data_dir, config, &job_id, pipeline).await
    }
    Some(Commands::Graph { job_id }) => print_graph(&data_dir, config, &job_id).await,
    None => {
      println!("braid - use --help to see available commands");
      Ok(())
    }
  }
}

fn load_config(path: Option<&Path>) -> Result<DriverConfig> {
  let Some(path) = path else {
    return Ok(DriverConfig::default());
  };
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read config file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse config file: {}", path.display()))
}

fn load_pipeline(path: &Path) -> Result<Pipeline> {
  let content = std::fs::read_to_string(path)
    .with_context(|| format!("failed to read pipeline file: {}", path.display()))?;
  serde_json::from_str(&content)
    .with_context(|| format!("failed to parse pipeline file: {}", path.display()))
}

/// Flow input from `--flow-input`, else from a piped stdin.
fn read_flow_input(inline: Option<String>) -> Result<Option<serde_json::Value>> {
  use std::io::IsTerminal;

  if let Some(inline) = inline {
    let value = serde_json::from_str(&inline).context("failed to parse --flow-input JSON")?;
    return Ok(Some(value));
  }
  if io::stdin().is_terminal() {
    return Ok(None);
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read flow input from stdin")?;
  if input.trim().is_empty() {
    return Ok(None);
  }
  let value = serde_json::from_str(&input).context("failed to parse flow input JSON from stdin")?;
  Ok(Some(value))
}

async fn open_driver(data_dir: &Path, config: DriverConfig) -> Result<Arc<Driver>> {
  tokio::fs::create_dir_all(data_dir)
    .await
    .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  let db_path = data_dir.join("braid.db");
  let store = SqliteStore::open(&db_path)
    .await
    .with_context(|| format!("failed to open database: {}", db_path.display()))?;

  let (events_tx, mut events_rx) = mpsc::unbounded_channel();
  let dispatcher = LocalDispatcher::new(events_tx);
  let driver = Arc::new(Driver::new(
    DriverDeps::new(Arc::new(store), Arc::new(dispatcher)),
    config,
  ));

  let router = driver.clone();
  tokio::spawn(async move {
    while let Some(event) = events_rx.recv().await {
      router.task_event(event).await;
    }
  });
  Ok(driver)
}

async fn run_job(
  data_dir: &Path,
  config: DriverConfig,
  job_id: &str,
  pipeline: Pipeline,
) -> Result<()> {
  let driver = open_driver(data_dir, config).await?;
  info!(job_id = %job_id, pipeline = %pipeline.name, "loaded_pipeline");

  let handle = driver
    .start(job_id, pipeline)
    .await
    .context("failed to start job")?;

  let stopper = driver.clone();
  let stop_id = job_id.to_string();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      stopper.stop(&stop_id).await;
    }
  });

  let outcome = handle.wait().await.context("job did not finish")?;
  print_outcome(&outcome)?;

  match outcome.state {
    JobState::Failed => bail!("job {} failed", outcome.job_id),
    _ => Ok(()),
  }
}

fn print_outcome(outcome: &JobOutcome) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(outcome)?);
  Ok(())
}

async fn print_graph(data_dir: &Path, config: DriverConfig, job_id: &str) -> Result<()> {
  let driver = open_driver(data_dir, config).await?;
  let Some(snapshot) = driver
    .get_graph(job_id)
    .await
    .context("failed to read graph")?
  else {
    bail!("no graph stored for job {}", job_id);
  };
  println!("{}", serde_json::to_string_pretty(&snapshot)?);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn write_json(dir: &Path, name: &str, value: serde_json::Value) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_string(&value).unwrap()).unwrap();
    path
  }

  #[test]
  fn test_load_config_defaults_and_overrides() {
    assert_eq!(load_config(None).unwrap(), DriverConfig::default());

    let dir = tempfile::tempdir().unwrap();
    let path = write_json(dir.path(), "config.json", json!({ "default_batch_tolerance": 10 }));
    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.default_batch_tolerance, 10.0);
    assert_eq!(config.snapshot_interval_ms, 4000);
  }

  #[test]
  fn test_inline_flow_input() {
    let value = read_flow_input(Some(r#"{"x": 1}"#.to_string())).unwrap();
    assert_eq!(value, Some(json!({ "x": 1 })));
    assert!(read_flow_input(Some("not json".to_string())).is_err());
  }

  #[tokio::test]
  async fn test_run_and_resume_with_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_json(
      dir.path(),
      "pipeline.json",
      json!({
        "name": "local",
        "flowInput": { "files": [1, 2] },
        "nodes": [
          { "nodeName": "a", "algorithmName": "echo", "input": ["#@flowInput.files"] },
          { "nodeName": "b", "algorithmName": "echo", "input": ["@a"] }
        ]
      }),
    );
    let data_dir = dir.path().join("data");

    let pipeline = load_pipeline(&path).unwrap();
    run_job(&data_dir, DriverConfig::default(), "job-1", pipeline.clone())
      .await
      .unwrap();
    assert!(data_dir.join("braid.db").exists());

    // a finished job resumes straight to completion
    run_job(&data_dir, DriverConfig::default(), "job-1", pipeline)
      .await
      .unwrap();
    print_graph(&data_dir, DriverConfig::default(), "job-1")
      .await
      .unwrap();
  }

  #[tokio::test]
  async fn test_failing_job_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_json(
      dir.path(),
      "pipeline.json",
      json!({
        "name": "doomed",
        "nodes": [{ "nodeName": "a", "algorithmName": "fail", "input": ["disk full"] }]
      }),
    );
    let pipeline = load_pipeline(&path).unwrap();
    let result = run_job(dir.path(), DriverConfig::default(), "job-1", pipeline).await;
    assert!(result.is_err());
  }
}
