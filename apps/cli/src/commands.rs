//! CLI command implementations

use crate::output::{print_json_line, print_summary};
use crate::progress::DownloadProgress;
use crate::{GetArgs, OutputFormat};
use anyhow::{Context, Result};
use console::style;
use omnidl_core::Scheduler;
use omnidl_types::{AddTaskOptions, ProxySettings, Settings, Task, TaskListUpdate, TaskStatus};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};

/// Where task list updates are rendered
enum Reporter {
    Human(DownloadProgress),
    Json,
}

impl Reporter {
    fn new(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Human => Reporter::Human(DownloadProgress::new()),
            OutputFormat::Json => Reporter::Json,
        }
    }

    fn report(&mut self, update: &TaskListUpdate) -> Result<()> {
        match self {
            Reporter::Human(progress) => progress.handle_update(update),
            Reporter::Json => print_json_line(update)?,
        }
        Ok(())
    }

    fn finish(&mut self, tasks: &[Task]) -> Result<()> {
        match self {
            Reporter::Human(progress) => {
                progress.clear();
                print_summary(tasks);
            }
            Reporter::Json => print_json_line(&tasks)?,
        }
        Ok(())
    }
}

fn settings_from_args(args: &GetArgs, download_path: PathBuf) -> Settings {
    Settings {
        download_path,
        max_concurrent: args.jobs,
        speed_limit: args.limit,
        timeout_secs: args.timeout,
        proxy: ProxySettings {
            enabled: args.proxy.is_some(),
            url: args.proxy.clone(),
        },
        ..Default::default()
    }
}

fn all_settled(tasks: &[Task]) -> bool {
    tasks.iter().all(|task| !task.status.is_pending())
}

/// Download every URL; returns false if any of them failed
pub async fn get(args: GetArgs, format: OutputFormat) -> Result<bool> {
    let save_path = match &args.dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine the current directory")?,
    };
    let settings = settings_from_args(&args, save_path.clone());
    let scheduler = Scheduler::with_default_transports(settings)?;
    let mut updates = scheduler.subscribe();
    let mut reporter = Reporter::new(format);

    let mut all_ok = true;
    for url in &args.urls {
        let options = AddTaskOptions {
            resume: args.resume,
            ..AddTaskOptions::new(url.clone(), save_path.clone())
        };
        if let Err(e) = scheduler.add_task(options) {
            all_ok = false;
            eprintln!("{} {}: {}", style("✗").red().bold(), url, e);
        }
    }

    let mut interrupted = false;
    while !all_settled(&scheduler.get_tasks()) {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => reporter.report(&update)?,
                Err(RecvError::Lagged(skipped)) => debug!("Skipped {} task list updates", skipped),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("Cannot listen for Ctrl-C")?;
                info!("Interrupted, pausing all downloads");
                pause_all(&scheduler)?;
                interrupted = true;
                break;
            }
        }
    }

    // Lifecycle updates still buffered; progress ones are superseded by the summary
    while let Ok(update) = updates.try_recv() {
        if !update.cause.is_progress() {
            reporter.report(&update)?;
        }
    }

    let tasks = scheduler.get_tasks();
    reporter.finish(&tasks)?;
    if interrupted && format == OutputFormat::Human {
        println!(
            "{}",
            style("Interrupted. Partial files were kept; rerun with -c to continue.").yellow()
        );
    }

    Ok(all_ok && !tasks.iter().any(|task| task.status == TaskStatus::Error))
}

/// Pause every task, including ones admitted while earlier ones were paused
fn pause_all(scheduler: &Scheduler) -> Result<()> {
    // Admission is FIFO, so a task started by a pause below always comes
    // later in this list and is paused in turn
    for task in scheduler.get_tasks() {
        if task.status.is_pending() {
            scheduler.pause_task(task.id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn get_args(argv: &[&str]) -> GetArgs {
        let mut full = vec!["omnidl", "get"];
        full.extend_from_slice(argv);
        match crate::Cli::try_parse_from(full).unwrap().command {
            crate::Commands::Get(args) => args,
            crate::Commands::Completions { .. } => panic!("expected get"),
        }
    }

    #[test]
    fn test_settings_follow_flags() {
        let args = get_args(&[
            "--limit",
            "1024",
            "--proxy",
            "http://127.0.0.1:3128",
            "--timeout",
            "0",
            "https://example.com/a",
        ]);
        let settings = settings_from_args(&args, PathBuf::from("/downloads"));

        assert_eq!(settings.download_path, PathBuf::from("/downloads"));
        assert_eq!(settings.speed_limit, 1024);
        assert_eq!(settings.timeout_secs, 0);
        assert!(settings.proxy.enabled);
        assert_eq!(settings.proxy.url.as_deref(), Some("http://127.0.0.1:3128"));
    }

    #[tokio::test]
    async fn test_pause_all_leaves_nothing_pending() {
        let settings = Settings {
            max_concurrent: 1,
            ..Default::default()
        };
        let scheduler = Scheduler::with_default_transports(settings).unwrap();
        let dir = std::env::temp_dir().join("omnidl-pause-all");
        for name in ["a", "b", "c"] {
            scheduler
                .add_task(AddTaskOptions::new(
                    format!("http://127.0.0.1:9/{}", name),
                    dir.clone(),
                ))
                .unwrap();
        }

        pause_all(&scheduler).unwrap();
        let tasks = scheduler.get_tasks();
        assert!(all_settled(&tasks));
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Paused));
    }
}
