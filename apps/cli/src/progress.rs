//! Progress bar utilities for CLI downloads

use crate::output::{eta_seconds, format_eta, format_speed};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use omnidl_types::{Task, TaskId, TaskListUpdate, TaskStatus, UpdateCause};
use std::collections::HashMap;

const BAR_TEMPLATE: &str =
    "{spinner:.green} {prefix:30!} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}";

/// One progress bar per task, kept in sync with task list snapshots
pub struct DownloadProgress {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stdout()),
            bars: HashMap::new(),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  ")
    }

    /// Apply a snapshot; only the task named by a lifecycle cause changes state
    pub fn handle_update(&mut self, update: &TaskListUpdate) {
        for task in &update.tasks {
            self.sync(task);
        }

        match &update.cause {
            UpdateCause::StatusChanged { id, .. } => {
                if let Some(task) = update.tasks.iter().find(|t| t.id == *id) {
                    self.finish_if_settled(task);
                }
            }
            UpdateCause::TaskRemoved { id } => {
                if let Some(bar) = self.bars.remove(id) {
                    bar.finish_and_clear();
                }
            }
            UpdateCause::TaskAdded { .. } | UpdateCause::Progress => {}
        }
    }

    fn sync(&mut self, task: &Task) {
        let multi = &self.multi;
        let bar = self.bars.entry(task.id).or_insert_with(|| {
            let bar = multi.add(ProgressBar::new(task.total_size.unwrap_or(0)));
            bar.set_style(Self::bar_style());
            bar.set_prefix(task.file_name.clone());
            bar
        });
        if bar.is_finished() {
            return;
        }

        if let Some(total) = task.total_size {
            bar.set_length(total);
        }
        bar.set_position(task.start_byte);

        let message = match task.status {
            TaskStatus::Waiting => style("waiting").dim().to_string(),
            TaskStatus::Downloading => match eta_seconds(task) {
                Some(eta) => format!("{} eta {}", format_speed(task.speed), format_eta(eta)),
                None => format_speed(task.speed),
            },
            TaskStatus::Paused => format!("{} Paused", style("⏸").yellow()),
            TaskStatus::Completed | TaskStatus::Error => return,
        };
        bar.set_message(message);
    }

    fn finish_if_settled(&self, task: &Task) {
        let Some(bar) = self.bars.get(&task.id) else {
            return;
        };
        match task.status {
            TaskStatus::Completed => {
                bar.finish_with_message(format!(
                    "{} Download complete",
                    style("✓").green().bold()
                ));
            }
            TaskStatus::Error => {
                bar.abandon_with_message(format!(
                    "{} Failed: {}",
                    style("✗").red().bold(),
                    task.error.as_deref().unwrap_or("Unknown error")
                ));
            }
            _ => {}
        }
    }

    /// Clear all progress bars
    pub fn clear(&mut self) {
        for (_, bar) in self.bars.drain() {
            bar.finish_and_clear();
        }
    }
}

impl Default for DownloadProgress {
    fn default() -> Self {
        Self::new()
    }
}
