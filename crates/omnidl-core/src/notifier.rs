//! Progress notifier - coalesced task list updates
//!
//! Lifecycle changes go out immediately. Progress samples only arm a
//! timer; when it fires, one snapshot covering everything that changed
//! during the window is sent.

use omnidl_types::{Task, TaskListUpdate, UpdateCause};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1000;

pub struct ProgressNotifier {
    tx: broadcast::Sender<TaskListUpdate>,
    /// A progress flush is already scheduled
    pending: Arc<AtomicBool>,
    window: Duration,
}

impl ProgressNotifier {
    pub fn new(window: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            pending: Arc::new(AtomicBool::new(false)),
            window,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskListUpdate> {
        self.tx.subscribe()
    }

    /// Send a snapshot right away
    pub fn publish(&self, cause: UpdateCause, tasks: Vec<Task>) {
        let _ = self.tx.send(TaskListUpdate { cause, tasks });
    }

    /// Note a progress change; `snapshot` runs when the window closes
    pub fn schedule<F>(&self, snapshot: F)
    where
        F: FnOnce() -> Option<Vec<Task>> + Send + 'static,
    {
        if self.tx.receiver_count() == 0 {
            return;
        }
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }

        let tx = self.tx.clone();
        let pending = self.pending.clone();
        let window = self.window;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Cleared first so samples taken during the snapshot arm the next window
            pending.store(false, Ordering::Release);
            if let Some(tasks) = snapshot() {
                let _ = tx.send(TaskListUpdate {
                    cause: UpdateCause::Progress,
                    tasks,
                });
            }
        });
    }
}
