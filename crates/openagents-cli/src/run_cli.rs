#![allow(clippy::print_stdout)]

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use openagents_run_monitor::{
    CoarseStatus, ConnectionState, DEFAULT_LIST_LIMIT, MonitorConfig, RunApiClient,
    RunController, RunEvent, RunId, RunRequest, RunSnapshot,
};
use tracing::{info, warn};

#[derive(Args)]
pub struct RunArgs {
    /// Run service base URL (defaults to OPENAGENTS_RUN_MONITOR_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,
    /// Bearer key (defaults to OPENAGENTS_RUN_MONITOR_API_KEY)
    #[arg(long, global = true)]
    api_key: Option<String>,
    /// Snapshot poll interval used when the live stream drops
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,
    #[command(subcommand)]
    command: RunCommand,
}

#[derive(Subcommand)]
enum RunCommand {
    /// Start a single-shot run and follow it
    Start(StartArgs),
    /// Start an iterative run and follow it
    Loop(LoopArgs),
    /// Follow an existing run
    Attach { run_id: String },
    /// Ask the service to cancel a run
    Cancel { run_id: String },
    /// List recent runs
    List {
        #[arg(long, default_value_t = DEFAULT_LIST_LIMIT)]
        limit: usize,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct LaunchArgs {
    #[arg(long, default_value = "copilot")]
    executor: String,
    #[arg(long)]
    workdir: Option<String>,
    #[arg(long)]
    dry_run: bool,
    /// Print the run id and exit instead of following
    #[arg(long)]
    detach: bool,
    /// Print the final snapshot as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct StartArgs {
    prompt: String,
    #[command(flatten)]
    launch: LaunchArgs,
}

#[derive(Args)]
struct LoopArgs {
    task: String,
    #[arg(long)]
    max_retries: Option<u32>,
    #[command(flatten)]
    launch: LaunchArgs,
}

pub fn run(args: RunArgs) -> Result<()> {
    let config = monitor_config(&args, |key| std::env::var(key).ok())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(dispatch(args.command, config))
}

fn monitor_config<F>(args: &RunArgs, lookup: F) -> Result<MonitorConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = MonitorConfig::from_lookup(lookup)?;
    if let Some(base_url) = args.base_url.as_deref() {
        config.base_url = base_url.to_string();
    }
    if let Some(api_key) = args.api_key.as_deref() {
        config = config.with_api_key(api_key);
    }
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config = config.with_poll_interval_ms(poll_interval_ms);
    }
    Ok(config)
}

async fn dispatch(command: RunCommand, config: MonitorConfig) -> Result<()> {
    match command {
        RunCommand::Start(args) => {
            let request = launch_request(
                RunRequest::single(args.prompt, args.launch.executor.as_str()),
                &args.launch,
            );
            launch_and_follow(&config, request, &args.launch).await
        }
        RunCommand::Loop(args) => {
            let request = launch_request(
                RunRequest::iterative(args.task, args.launch.executor.as_str(), args.max_retries),
                &args.launch,
            );
            launch_and_follow(&config, request, &args.launch).await
        }
        RunCommand::Attach { run_id } => {
            let controller = RunController::from_config(&config)?;
            controller.attach(RunId::new(run_id)?).await?;
            let last = follow(&controller).await?;
            controller.dispose().await;
            finish(&last, false)
        }
        RunCommand::Cancel { run_id } => {
            let client = RunApiClient::new(&config)?;
            let run_id = RunId::new(run_id)?;
            client.cancel_run(&run_id).await?;
            println!("cancellation requested for {run_id}");
            Ok(())
        }
        RunCommand::List { limit, json } => {
            let client = RunApiClient::new(&config)?;
            let runs = client.list_runs(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }
            for run in runs {
                println!(
                    "{}  {:<10}  {:<10}  {}",
                    run.run_id,
                    run.coarse_status().label(),
                    run.executor.as_deref().unwrap_or("-"),
                    run.updated_at
                        .as_deref()
                        .or(run.created_at.as_deref())
                        .unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

fn launch_request(request: RunRequest, args: &LaunchArgs) -> RunRequest {
    let request = request.with_dry_run(args.dry_run);
    match args.workdir.as_deref() {
        Some(workdir) => request.with_working_dir(workdir),
        None => request,
    }
}

async fn launch_and_follow(config: &MonitorConfig, request: RunRequest, args: &LaunchArgs) -> Result<()> {
    let controller = RunController::from_config(config)?;
    let run_id = controller.launch(request).await?;
    if args.detach {
        println!("{run_id}");
        controller.dispose().await;
        return Ok(());
    }

    info!(run_id = %run_id, "following run; ctrl-c requests cancellation");
    let last = follow(&controller).await?;
    controller.dispose().await;
    finish(&last, args.json)
}

/// Prints transcript entries and status changes until the connection closes.
/// The first ctrl-c requests cancellation; the run keeps being followed until
/// the service confirms it.
async fn follow(controller: &RunController) -> Result<RunSnapshot> {
    let mut updates = controller.watch();
    let mut printed = 0;
    let mut last_status = CoarseStatus::Idle;
    let mut cancel_requested = false;

    loop {
        let snapshot = updates.borrow_and_update().clone();
        let (lines, next) = transcript_tail(&snapshot, printed);
        for line in lines {
            println!("{line}");
        }
        printed = next;
        if snapshot.status != last_status {
            println!("== {} ({})", snapshot.status, snapshot.connection);
            last_status = snapshot.status;
        }
        if snapshot.connection == ConnectionState::Closed {
            return Ok(snapshot);
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    return Ok(controller.current_snapshot());
                }
            }
            signal = tokio::signal::ctrl_c(), if !cancel_requested => {
                signal.context("failed to listen for ctrl-c")?;
                cancel_requested = true;
                warn!("cancellation requested");
                controller.cancel().await;
            }
        }
    }
}

/// Lines for transcript entries past `printed`. A poll tick may replace the
/// transcript with a shorter one; nothing is reprinted in that case.
fn transcript_tail(snapshot: &RunSnapshot, printed: usize) -> (Vec<String>, usize) {
    let lines = snapshot
        .transcript
        .iter()
        .skip(printed)
        .map(format_event)
        .collect();
    (lines, snapshot.transcript.len())
}

fn format_event(event: &RunEvent) -> String {
    let timestamp = if event.timestamp.is_empty() {
        "-"
    } else {
        event.timestamp.as_str()
    };
    format!("{timestamp} {:<11} {}", event.kind, event.message)
}

fn finish(snapshot: &RunSnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
    } else if let Some(result) = snapshot.result.as_deref() {
        println!("result: {result}");
    }

    match snapshot.status {
        CoarseStatus::Failed => bail!(
            "run failed: {}",
            snapshot.error.as_deref().unwrap_or("no error reported")
        ),
        CoarseStatus::Cancelled => bail!("run cancelled"),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use openagents_run_monitor::RunKind;

    use super::*;
    use crate::{Commands, OpenAgentsCli};

    fn parse(args: &[&str]) -> RunArgs {
        match OpenAgentsCli::try_parse_from(args) {
            Ok(OpenAgentsCli {
                command: Commands::Run(args),
            }) => args,
            Err(err) => panic!("parse failed: {err}"),
        }
    }

    #[test]
    fn start_parses_launch_flags() {
        let args = parse(&[
            "openagents", "run", "start", "list files", "--executor", "codex", "--workdir",
            "/tmp/repo", "--dry-run",
        ]);
        let RunCommand::Start(start) = args.command else {
            panic!("expected start");
        };
        let request = launch_request(
            RunRequest::single(start.prompt, start.launch.executor.as_str()),
            &start.launch,
        );
        assert_eq!(request.kind, RunKind::Single);
        assert_eq!(request.instruction, "list files");
        assert_eq!(request.executor_name, "codex");
        assert_eq!(request.working_dir.as_deref(), Some("/tmp/repo"));
        assert!(request.dry_run);
    }

    #[test]
    fn loop_defaults_executor_and_accepts_retries() {
        let args = parse(&["openagents", "run", "loop", "fix tests", "--max-retries", "5"]);
        let RunCommand::Loop(looped) = args.command else {
            panic!("expected loop");
        };
        assert_eq!(looped.max_retries, Some(5));
        assert_eq!(looped.launch.executor, "copilot");
        assert!(!looped.launch.detach);
    }

    #[test]
    fn flags_override_environment() {
        let args = parse(&[
            "openagents", "run", "list", "--base-url", "http://runs.local:9000", "--limit", "3",
        ]);
        let config = monitor_config(&args, |key| match key {
            "OPENAGENTS_RUN_MONITOR_BASE_URL" => Some("http://from-env:1".to_string()),
            "OPENAGENTS_RUN_MONITOR_API_KEY" => Some("env-key".to_string()),
            _ => None,
        })
        .expect("config");
        assert_eq!(config.base_url, "http://runs.local:9000");
        assert_eq!(config.api_key.as_deref(), Some("env-key"));
        assert!(matches!(args.command, RunCommand::List { limit: 3, json: false }));
    }

    #[test]
    fn invalid_environment_is_reported() {
        let args = parse(&["openagents", "run", "list"]);
        let result = monitor_config(&args, |key| {
            (key == "OPENAGENTS_RUN_MONITOR_POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn transcript_tail_prints_only_new_entries() {
        let mut snapshot = RunSnapshot::default();
        snapshot.transcript = vec![
            RunEvent::new("user_prompt", "list files", "T0"),
            RunEvent::new("log", "found 3 files", ""),
        ];
        let (lines, printed) = transcript_tail(&snapshot, 1);
        assert_eq!(printed, 2);
        assert_eq!(lines, vec![format!("- {:<11} found 3 files", "log")]);

        snapshot.transcript.truncate(1);
        let (lines, printed) = transcript_tail(&snapshot, 2);
        assert!(lines.is_empty());
        assert_eq!(printed, 1);
    }

    #[test]
    fn failed_runs_exit_with_error() {
        let mut snapshot = RunSnapshot::default();
        snapshot.status = CoarseStatus::Failed;
        snapshot.error = Some("executor crashed".to_string());
        let err = finish(&snapshot, false).expect_err("failed run");
        assert!(err.to_string().contains("executor crashed"));

        snapshot.status = CoarseStatus::Completed;
        assert!(finish(&snapshot, false).is_ok());
    }
}
