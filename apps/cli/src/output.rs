//! Output formatting utilities

use console::style;
use omnidl_types::{Task, TaskStatus};
use serde::Serialize;

/// Print one compact JSON document per line
pub fn print_json_line<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Format bytes as human-readable
pub fn format_bytes(bytes: u64) -> String {
    human_bytes::human_bytes(bytes as f64)
}

/// Format speed as human-readable
pub fn format_speed(bytes_per_sec: u64) -> String {
    format!("{}/s", human_bytes::human_bytes(bytes_per_sec as f64))
}

/// Format duration as human-readable
pub fn format_eta(seconds: u64) -> String {
    if seconds == 0 {
        return "-".to_string();
    }

    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Seconds left at the current speed, if it can be estimated
pub fn eta_seconds(task: &Task) -> Option<u64> {
    let total = task.total_size?;
    if task.speed == 0 {
        return None;
    }
    Some(total.saturating_sub(task.start_byte) / task.speed)
}

/// One line per task once the run is over
pub fn print_summary(tasks: &[Task]) {
    for task in tasks {
        let name = style(&task.file_name).bold();
        match task.status {
            TaskStatus::Completed => println!(
                "{} {} {}",
                style("✓").green().bold(),
                name,
                style(format_bytes(task.total_size.unwrap_or(task.start_byte))).dim()
            ),
            TaskStatus::Error => println!(
                "{} {} {}",
                style("✗").red().bold(),
                name,
                style(task.error.as_deref().unwrap_or("Unknown error")).red()
            ),
            TaskStatus::Paused => println!(
                "{} {} paused at {}",
                style("⏸").yellow(),
                name,
                format_bytes(task.start_byte)
            ),
            TaskStatus::Waiting | TaskStatus::Downloading => {
                println!("{} {} {}", style("·").dim(), name, style(task.status).dim())
            }
        }
    }
}
