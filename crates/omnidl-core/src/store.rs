//! Ordered task store owned by the scheduler

use crate::transport::TransferControl;
use omnidl_types::{Task, TaskId, TaskStatus};

/// The transfer currently bound to a task
pub(crate) struct ActiveAttempt {
    /// Distinguishes this run from earlier ones of the same task
    pub id: u64,
    pub control: TransferControl,
}

pub(crate) struct TaskEntry {
    pub task: Task,
    pub attempt: Option<ActiveAttempt>,
    /// Whether an artifact found on the next admission is a resume checkpoint
    pub trust_artifact: bool,
}

impl TaskEntry {
    pub fn new(task: Task, trust_artifact: bool) -> Self {
        Self {
            task,
            attempt: None,
            trust_artifact,
        }
    }

    /// True if `attempt` is the transfer this entry is bound to
    pub fn is_current(&self, attempt: u64) -> bool {
        self.attempt.as_ref().map(|a| a.id) == Some(attempt)
    }
}

/// Tasks in insertion order
#[derive(Default)]
pub(crate) struct TaskStore {
    entries: Vec<TaskEntry>,
}

impl TaskStore {
    pub fn push(&mut self, entry: TaskEntry) {
        self.entries.push(entry);
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskEntry> {
        self.entries.iter().find(|e| e.task.id == id)
    }

    pub fn get_mut(&mut self, id: TaskId) -> Option<&mut TaskEntry> {
        self.entries.iter_mut().find(|e| e.task.id == id)
    }

    pub fn remove(&mut self, id: TaskId) -> Option<TaskEntry> {
        let index = self.entries.iter().position(|e| e.task.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Oldest task still waiting for a slot
    pub fn first_waiting_mut(&mut self) -> Option<&mut TaskEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.task.status == TaskStatus::Waiting)
    }

    pub fn snapshot(&self) -> Vec<Task> {
        self.entries.iter().map(|e| e.task.clone()).collect()
    }
}
