use std::path::PathBuf;

use shelfsyncd::catalog::TaskState;
use shelfsyncd::daemon::{DaemonConfig, DaemonRuntime, ImportRun};
use shelfsyncd::import::TaskOutcome;
use shelfsyncd::logging::init_logging;

#[derive(Debug, Clone, PartialEq, Eq)]
enum CliMode {
    Run,
    Import(Vec<PathBuf>),
    Tasks,
    Retry(i64),
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter().skip(1);
    let mut mode = CliMode::Run;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--import" => {
                let files: Vec<PathBuf> = args.by_ref().map(PathBuf::from).collect();
                if files.is_empty() {
                    anyhow::bail!("--import needs at least one file");
                }
                mode = CliMode::Import(files);
            }
            "--tasks" => mode = CliMode::Tasks,
            "--retry" => {
                let Some(id) = args.next() else {
                    anyhow::bail!("--retry needs a task id");
                };
                let id = id
                    .parse::<i64>()
                    .map_err(|_| anyhow::anyhow!("invalid task id: {id}"))?;
                mode = CliMode::Retry(id);
            }
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

fn describe_state(state: &TaskState) -> String {
    match state {
        TaskState::Pending => "pending".to_string(),
        TaskState::Running => "running".to_string(),
        TaskState::Done => "done".to_string(),
        TaskState::Error(message) => format!("error: {message}"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: shelfsyncd [--import <file>... | --tasks | --retry <id>]");
        println!("  --import <file>...  Copy files into the library and exit, or hand them");
        println!("                      to the running daemon");
        println!("  --tasks             List queued and failed copy tasks");
        println!("  --retry <id>        Move a failed copy task back to pending");
        return Ok(());
    }

    let config = DaemonConfig::from_env()?;
    init_logging(&config.log_filter)?;
    let daemon = DaemonRuntime::bootstrap(config).await?;
    match mode {
        CliMode::Import(files) => {
            match daemon.import_files(&files).await? {
                ImportRun::Copied(outcomes) => {
                    for outcome in outcomes {
                        match outcome {
                            TaskOutcome::Copied(target) => {
                                println!("copied {}", target.display())
                            }
                            TaskOutcome::Failed(message) => println!("failed: {message}"),
                            TaskOutcome::Skipped => {}
                        }
                    }
                }
                ImportRun::Queued(count) => {
                    println!("queued {count} file(s) for the running shelfsyncd")
                }
            }
            Ok(())
        }
        CliMode::Tasks => {
            for task in daemon.queue().list().await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    task.id,
                    describe_state(&task.state),
                    task.destination_dir,
                    task.filename
                );
            }
            Ok(())
        }
        CliMode::Retry(id) => {
            if !daemon.queue().retry(id).await? {
                anyhow::bail!("task {id} is not in an error state");
            }
            println!("task {id} queued again");
            Ok(())
        }
        CliMode::Run | CliMode::Help => daemon.run().await,
    }
}
