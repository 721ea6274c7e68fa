//! Shared types for OmniDL
//!
//! This crate contains the data structures shared between the core
//! engine and whatever front end drives it (the CLI, a desktop shell).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of a task, assigned once at creation
pub type TaskId = Uuid;

// ============================================================================
// Task Types
// ============================================================================

/// A single download task as seen by consumers of the task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub url: String,
    pub protocol: Protocol,
    pub save_path: PathBuf,
    pub file_name: String,
    pub status: TaskStatus,
    /// Percentage 0-100
    pub progress: u8,
    /// Bytes per second, 0 when not downloading
    pub speed: u64,
    /// Last known written offset of the partial artifact
    pub start_byte: u64,
    pub total_size: Option<u64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(url: String, protocol: Protocol, save_path: PathBuf, file_name: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            url,
            protocol,
            save_path,
            file_name,
            status: TaskStatus::Waiting,
            progress: 0,
            speed: 0,
            start_byte: 0,
            total_size: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Final location of the downloaded file
    pub fn destination(&self) -> PathBuf {
        self.save_path.join(&self.file_name)
    }

    /// Location of the in-progress artifact next to the destination
    pub fn artifact_path(&self) -> PathBuf {
        self.save_path.join(artifact_name(&self.file_name))
    }
}

/// Name of the temporary artifact for a destination file name
pub fn artifact_name(file_name: &str) -> String {
    format!("{}.tmp", file_name)
}

/// Status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    /// Whether the task still has work ahead of it without user action
    pub fn is_pending(self) -> bool {
        matches!(self, TaskStatus::Waiting | TaskStatus::Downloading)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Transfer protocols a task can name
///
/// Only some of them have a transport behind them; the rest fail at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Https,
    Ftp,
    Bt,
    Magnet,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Ftp => "ftp",
            Protocol::Bt => "bt",
            Protocol::Magnet => "magnet",
        }
    }

    /// Infer the protocol from a URL scheme
    pub fn from_url(url: &url::Url) -> Option<Self> {
        url.scheme().parse().ok()
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Protocol::Http),
            "https" => Ok(Protocol::Https),
            "ftp" => Ok(Protocol::Ftp),
            "bt" | "torrent" => Ok(Protocol::Bt),
            "magnet" => Ok(Protocol::Magnet),
            other => Err(format!("Unknown protocol: {}", other)),
        }
    }
}

/// Options for creating a task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddTaskOptions {
    pub url: String,
    /// Inferred from the URL scheme when absent
    pub protocol: Option<Protocol>,
    pub save_path: PathBuf,
    /// Derived from the URL when absent
    pub file_name: Option<String>,
    /// `Some(false)` keeps the task waiting until it is started explicitly
    pub auto_start: Option<bool>,
    /// Build on an artifact left over from an earlier run instead of discarding it
    #[serde(default)]
    pub resume: bool,
}

impl AddTaskOptions {
    pub fn new(url: impl Into<String>, save_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            save_path: save_path.into(),
            ..Default::default()
        }
    }
}

/// Derive a safe file name from a URL
///
/// Takes the last non-empty path segment, percent-decoded. Anything that
/// could escape the save directory is rejected in favour of `download`.
pub fn file_name_from_url(url: &url::Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .and_then(|segment| urlencoding::decode(segment).ok())
        .and_then(|decoded| sanitize_file_name(&decoded))
        .unwrap_or_else(|| "download".to_string())
}

/// Reject names that are empty, relative components, or contain separators
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let name = name.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    if name.contains(['/', '\\', '\0']) {
        return None;
    }
    Some(name.to_string())
}

// ============================================================================
// Settings Types
// ============================================================================

/// Engine settings supplied by the host application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_path: PathBuf,
    /// Upper bound on simultaneously downloading tasks
    pub max_concurrent: u32,
    /// Global speed limit in bytes per second, 0 = unlimited
    pub speed_limit: u64,
    /// Connect and read inactivity timeout
    pub timeout_secs: u64,
    pub user_agent: String,
    pub proxy: ProxySettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            max_concurrent: 3,
            speed_limit: 0,
            timeout_secs: 30,
            user_agent: concat!("OmniDL/", env!("CARGO_PKG_VERSION")).to_string(),
            proxy: ProxySettings::default(),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: bool,
    /// Proxy URL used for both http and https, e.g. `http://127.0.0.1:8080`
    pub url: Option<String>,
}

// ============================================================================
// Event Types
// ============================================================================

/// Snapshot of the whole task list delivered to subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskListUpdate {
    pub cause: UpdateCause,
    pub tasks: Vec<Task>,
}

/// What triggered a task list update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UpdateCause {
    TaskAdded {
        id: TaskId,
    },
    TaskRemoved {
        id: TaskId,
    },
    StatusChanged {
        id: TaskId,
        status: TaskStatus,
        error: Option<String>,
    },
    /// Coalesced progress samples, throttled
    Progress,
}

impl UpdateCause {
    pub fn is_progress(&self) -> bool {
        matches!(self, UpdateCause::Progress)
    }
}
