//! Scheduler - bounded FIFO admission of tasks onto transports
//!
//! Owns the task store behind one lock. Every mutation (commands,
//! admission, settlement, progress samples) happens under that lock and
//! never across an await, so slot release and the next admission are a
//! single step.

use crate::error::CoreError;
use crate::notifier::ProgressNotifier;
use crate::store::{ActiveAttempt, TaskEntry, TaskStore};
use crate::transport::{
    ProgressSink, TransferJob, TransferProgress, TransferSummary, TransportRegistry,
};
use crate::THROTTLE_WINDOW;
use chrono::Utc;
use omnidl_types::{
    file_name_from_url, sanitize_file_name, AddTaskOptions, Protocol, Settings, Task, TaskId,
    TaskListUpdate, TaskStatus, UpdateCause,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

struct SchedulerState {
    store: TaskStore,
    /// Tasks holding a slot
    active: usize,
    max_concurrent: usize,
    next_attempt: u64,
}

struct Inner {
    state: Mutex<SchedulerState>,
    registry: TransportRegistry,
    notifier: ProgressNotifier,
    settings: RwLock<Settings>,
    /// Transfers and their watchers run here, whichever thread issued the command
    runtime: Handle,
}

/// Cheap to clone; all clones drive the same task list
///
/// When the last clone is dropped, running transfers are detached and
/// stop with their artifacts kept.
///
/// Commands are synchronous and may be called from any thread; the
/// runtime captured at construction drives the transfers.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    /// Scheduler bound to the current tokio runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime; use
    /// [`Scheduler::with_runtime`] there.
    pub fn new(settings: Settings, registry: TransportRegistry) -> Self {
        Self::with_runtime(settings, registry, Handle::current())
    }

    /// Scheduler spawning its transfers on `runtime`
    pub fn with_runtime(settings: Settings, registry: TransportRegistry, runtime: Handle) -> Self {
        let state = SchedulerState {
            store: TaskStore::default(),
            active: 0,
            max_concurrent: concurrency_bound(&settings),
            next_attempt: 0,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                registry,
                notifier: ProgressNotifier::new(THROTTLE_WINDOW),
                settings: RwLock::new(settings),
                runtime,
            }),
        }
    }

    /// Scheduler with the built-in HTTP/HTTPS transport registered
    pub fn with_default_transports(settings: Settings) -> Result<Self, CoreError> {
        let registry = TransportRegistry::with_defaults(&settings)?;
        Ok(Self::new(settings, registry))
    }

    /// Create a task and queue it
    pub fn add_task(&self, options: AddTaskOptions) -> Result<TaskId, CoreError> {
        let url = Url::parse(&options.url)
            .map_err(|e| CoreError::InvalidUrl(format!("{}: {}", options.url, e)))?;
        let protocol = match options.protocol {
            Some(protocol) => protocol,
            None => Protocol::from_url(&url)
                .ok_or_else(|| CoreError::InvalidProtocol(url.scheme().to_string()))?,
        };
        let file_name = options
            .file_name
            .as_deref()
            .and_then(sanitize_file_name)
            .unwrap_or_else(|| file_name_from_url(&url));

        let task = Task::new(options.url, protocol, options.save_path, file_name);
        let id = task.id;
        info!(task_id = %id, file = %task.file_name, protocol = %protocol, "Task added");

        let mut state = self.inner.state.lock();
        state.store.push(TaskEntry::new(task, options.resume));
        self.inner.publish(&state, UpdateCause::TaskAdded { id });
        if options.auto_start != Some(false) {
            self.inner.admit(&mut state);
        }
        Ok(id)
    }

    /// Admit a waiting task if a slot is free
    pub fn start_task(&self, id: TaskId) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        let entry = state.store.get(id).ok_or(CoreError::NotFound(id))?;
        if entry.task.status == TaskStatus::Waiting {
            self.inner.admit(&mut state);
        }
        Ok(())
    }

    /// Stop a downloading task, keeping its artifact
    pub fn pause_task(&self, id: TaskId) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        let entry = state.store.get_mut(id).ok_or(CoreError::NotFound(id))?;
        if entry.task.status != TaskStatus::Downloading {
            return Ok(());
        }

        // Dropping the control after the signal detaches the transfer
        let released = match entry.attempt.take() {
            Some(attempt) => {
                attempt.control.pause();
                true
            }
            None => false,
        };
        entry.task.status = TaskStatus::Paused;
        entry.task.speed = 0;
        info!(task_id = %id, start_byte = entry.task.start_byte, "Task paused");

        if released {
            state.active = state.active.saturating_sub(1);
        }
        self.inner.publish_status(&state, id);
        self.inner.admit(&mut state);
        Ok(())
    }

    /// Queue a paused task again; it continues from its artifact
    pub fn resume_task(&self, id: TaskId) -> Result<(), CoreError> {
        self.requeue(id, TaskStatus::Paused)
    }

    /// Queue a failed task again; it continues from its artifact
    pub fn retry_task(&self, id: TaskId) -> Result<(), CoreError> {
        self.requeue(id, TaskStatus::Error)
    }

    fn requeue(&self, id: TaskId, from: TaskStatus) -> Result<(), CoreError> {
        let mut state = self.inner.state.lock();
        let entry = state.store.get_mut(id).ok_or(CoreError::NotFound(id))?;
        if entry.task.status != from {
            return Ok(());
        }

        entry.task.status = TaskStatus::Waiting;
        entry.task.error = None;
        entry.trust_artifact = true;
        info!(task_id = %id, "Task queued from {}", from);

        self.inner.publish_status(&state, id);
        self.inner.admit(&mut state);
        Ok(())
    }

    /// Delete a task in any state
    ///
    /// A running transfer is aborted first. Unless the task completed, its
    /// artifact is gone when this returns.
    pub async fn remove_task(&self, id: TaskId) -> Result<(), CoreError> {
        let (entry, transport) = {
            let mut state = self.inner.state.lock();
            let entry = state.store.remove(id).ok_or(CoreError::NotFound(id))?;
            if let Some(attempt) = &entry.attempt {
                attempt.control.abort();
                state.active = state.active.saturating_sub(1);
            }
            info!(task_id = %id, status = %entry.task.status, "Task removed");

            self.inner.publish(&state, UpdateCause::TaskRemoved { id });
            self.inner.admit(&mut state);
            let transport = self.inner.registry.get(entry.task.protocol);
            (entry, transport)
        };

        if entry.task.status == TaskStatus::Completed {
            return Ok(());
        }
        if let Some(transport) = transport {
            // Waits for an aborting transfer to let go of the artifact
            transport
                .discard(&TransferJob::for_task(&entry.task, true))
                .await?;
        }
        Ok(())
    }

    /// Snapshot of every task in insertion order
    pub fn get_tasks(&self) -> Vec<Task> {
        self.inner.state.lock().store.snapshot()
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.inner
            .state
            .lock()
            .store
            .get(id)
            .map(|entry| entry.task.clone())
    }

    /// Receive a task list snapshot on every change
    pub fn subscribe(&self) -> broadcast::Receiver<TaskListUpdate> {
        self.inner.notifier.subscribe()
    }

    /// Apply new settings to the scheduler and every transport
    pub fn reload_settings(&self, settings: Settings) -> Result<(), CoreError> {
        for transport in self.inner.registry.unique() {
            transport.reconfigure(&settings)?;
        }

        let mut state = self.inner.state.lock();
        state.max_concurrent = concurrency_bound(&settings);
        info!(
            max_concurrent = state.max_concurrent,
            speed_limit = settings.speed_limit,
            "Settings reloaded"
        );
        *self.inner.settings.write() = settings;
        self.inner.admit(&mut state);
        Ok(())
    }

    /// Number of tasks currently holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn settings(&self) -> Settings {
        self.inner.settings.read().clone()
    }
}

fn concurrency_bound(settings: &Settings) -> usize {
    if settings.max_concurrent == 0 {
        warn!("max_concurrent of 0 would never admit a task, using 1");
        1
    } else {
        settings.max_concurrent as usize
    }
}

impl Inner {
    fn publish(&self, state: &SchedulerState, cause: UpdateCause) {
        self.notifier.publish(cause, state.store.snapshot());
    }

    fn publish_status(&self, state: &SchedulerState, id: TaskId) {
        if let Some(entry) = state.store.get(id) {
            let cause = UpdateCause::StatusChanged {
                id,
                status: entry.task.status,
                error: entry.task.error.clone(),
            };
            self.publish(state, cause);
        }
    }

    /// Fill free slots with waiting tasks in store order
    fn admit(self: &Arc<Self>, state: &mut SchedulerState) {
        // Transports spawn their transfer inside `start`
        let _runtime = self.runtime.enter();
        while state.active < state.max_concurrent {
            let Some(entry) = state.store.first_waiting_mut() else {
                break;
            };
            let id = entry.task.id;

            let Some(transport) = self.registry.get(entry.task.protocol) else {
                let err = CoreError::UnsupportedProtocol(entry.task.protocol);
                error!(task_id = %id, "Cannot start task: {}", err);
                entry.task.status = TaskStatus::Error;
                entry.task.error = Some(err.to_string());
                self.publish_status(state, id);
                continue;
            };

            state.next_attempt += 1;
            let attempt = state.next_attempt;

            entry.task.status = TaskStatus::Downloading;
            entry.task.error = None;
            entry.task.speed = 0;
            let job = TransferJob::for_task(&entry.task, entry.trust_artifact);
            entry.trust_artifact = true;
            info!(task_id = %id, file = %entry.task.file_name, resume = job.resume, "Task started");

            let handle = transport.start(job, self.progress_sink(id, attempt));
            let (control, outcome) = handle.into_parts();
            entry.attempt = Some(ActiveAttempt {
                id: attempt,
                control,
            });
            state.active += 1;
            self.publish_status(state, id);

            let inner = Arc::downgrade(self);
            self.runtime.spawn(async move {
                let result = outcome.wait().await;
                if let Some(inner) = inner.upgrade() {
                    inner.settle(id, attempt, result);
                }
            });
        }
    }

    fn progress_sink(self: &Arc<Self>, id: TaskId, attempt: u64) -> ProgressSink {
        let inner = Arc::downgrade(self);
        Arc::new(move |sample: TransferProgress| {
            if let Some(inner) = inner.upgrade() {
                inner.record_progress(id, attempt, sample);
            }
        })
    }

    fn record_progress(self: &Arc<Self>, id: TaskId, attempt: u64, sample: TransferProgress) {
        {
            let mut state = self.state.lock();
            let Some(entry) = state.store.get_mut(id) else {
                return;
            };
            if !entry.is_current(attempt) {
                return;
            }
            entry.task.progress = sample.progress;
            entry.task.speed = sample.speed;
            entry.task.start_byte = sample.received;
            if sample.total.is_some() {
                entry.task.total_size = sample.total;
            }
        }

        let inner = Arc::downgrade(self);
        self.notifier.schedule(move || {
            let inner: Arc<Inner> = inner.upgrade()?;
            let tasks = inner.state.lock().store.snapshot();
            Some(tasks)
        });
    }

    /// Record how a transfer ended, free its slot and admit the next task
    fn settle(
        self: &Arc<Self>,
        id: TaskId,
        attempt: u64,
        result: Result<TransferSummary, CoreError>,
    ) {
        let mut state = self.state.lock();
        let Some(entry) = state.store.get_mut(id) else {
            return;
        };
        if !entry.is_current(attempt) {
            debug!(task_id = %id, attempt, "Ignoring settlement of a released transfer");
            return;
        }

        entry.attempt = None;
        entry.task.speed = 0;
        match result {
            Ok(summary) => {
                entry.task.status = TaskStatus::Completed;
                entry.task.progress = 100;
                entry.task.start_byte = summary.bytes;
                entry.task.total_size = Some(summary.total_size);
                entry.task.error = None;
                entry.task.completed_at = Some(Utc::now());
                info!(task_id = %id, bytes = summary.bytes, "Task completed");
            }
            Err(e) if e.is_cancellation() => {
                // Stopped without a pause or remove command, e.g. runtime shutdown
                debug!(task_id = %id, "Transfer stopped: {}", e);
                if entry.task.status == TaskStatus::Downloading {
                    entry.task.status = TaskStatus::Paused;
                }
            }
            Err(e) => {
                error!(task_id = %id, "Task failed: {}", e);
                entry.task.status = TaskStatus::Error;
                entry.task.error = Some(e.to_string());
            }
        }

        state.active = state.active.saturating_sub(1);
        self.publish_status(&state, id);
        self.admit(&mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        TransferControl, TransferHandle, TransferOutcome, TransferSignal, Transport,
    };
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::oneshot;

    type Finisher = oneshot::Sender<Result<TransferSummary, CoreError>>;

    /// Transport whose transfers run until the test finishes them
    #[derive(Default)]
    struct FakeTransport {
        started: Mutex<Vec<TransferJob>>,
        finishers: Mutex<HashMap<TaskId, Finisher>>,
        sinks: Mutex<HashMap<TaskId, ProgressSink>>,
        discarded: Mutex<Vec<TaskId>>,
    }

    impl FakeTransport {
        fn finish(&self, id: TaskId, result: Result<TransferSummary, CoreError>) {
            let finisher = self.finishers.lock().remove(&id).expect("transfer not running");
            let _ = finisher.send(result);
        }

        fn started_ids(&self) -> Vec<TaskId> {
            self.started.lock().iter().map(|job| job.task_id).collect()
        }

        fn last_job(&self, id: TaskId) -> TransferJob {
            self.started
                .lock()
                .iter()
                .rev()
                .find(|job| job.task_id == id)
                .cloned()
                .expect("transfer never started")
        }

        fn sink(&self, id: TaskId) -> ProgressSink {
            self.sinks.lock().get(&id).cloned().expect("no sink")
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn start(&self, job: TransferJob, progress: ProgressSink) -> TransferHandle {
            let (control, mut signal) = TransferControl::channel();
            let (tx, rx) = oneshot::channel();
            self.finishers.lock().insert(job.task_id, tx);
            self.sinks.lock().insert(job.task_id, progress);
            self.started.lock().push(job);

            let stopped = async move {
                loop {
                    if signal.changed().await.is_err() {
                        return Err(CoreError::Paused);
                    }
                    let current = *signal.borrow();
                    if current == TransferSignal::Abort {
                        return Err(CoreError::Cancelled);
                    }
                }
            };
            let outcome = TransferOutcome::new(tokio::spawn(async move {
                tokio::select! {
                    result = rx => result.unwrap_or(Err(CoreError::Cancelled)),
                    stopped = stopped => stopped,
                }
            }));
            TransferHandle { control, outcome }
        }

        async fn discard(&self, job: &TransferJob) -> Result<(), CoreError> {
            self.discarded.lock().push(job.task_id);
            Ok(())
        }
    }

    fn fake_registry() -> (TransportRegistry, Arc<FakeTransport>) {
        let fake = Arc::new(FakeTransport::default());
        let mut registry = TransportRegistry::new();
        registry.register(Protocol::Http, fake.clone());
        registry.register(Protocol::Https, fake.clone());
        (registry, fake)
    }

    fn bounded(max_concurrent: u32) -> Settings {
        Settings {
            max_concurrent,
            download_path: PathBuf::from("/tmp"),
            ..Default::default()
        }
    }

    fn scheduler(max_concurrent: u32) -> (Scheduler, Arc<FakeTransport>) {
        let (registry, fake) = fake_registry();
        (Scheduler::new(bounded(max_concurrent), registry), fake)
    }

    fn add(scheduler: &Scheduler, name: &str) -> TaskId {
        scheduler
            .add_task(AddTaskOptions::new(
                format!("https://example.com/{}", name),
                "/tmp/omnidl",
            ))
            .unwrap()
    }

    fn status(scheduler: &Scheduler, id: TaskId) -> TaskStatus {
        scheduler.get_task(id).unwrap().status
    }

    fn count(scheduler: &Scheduler, status: TaskStatus) -> usize {
        scheduler
            .get_tasks()
            .iter()
            .filter(|t| t.status == status)
            .count()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn summary(bytes: u64) -> Result<TransferSummary, CoreError> {
        Ok(TransferSummary {
            bytes,
            total_size: bytes,
        })
    }

    #[tokio::test]
    async fn test_bound_is_respected_and_backfilled_in_order() {
        let (scheduler, fake) = scheduler(10);
        let ids: Vec<_> = (0..12).map(|i| add(&scheduler, &format!("f{}", i))).collect();

        assert_eq!(count(&scheduler, TaskStatus::Downloading), 10);
        assert_eq!(count(&scheduler, TaskStatus::Waiting), 2);
        assert_eq!(scheduler.active_count(), 10);
        assert_eq!(fake.started_ids(), ids[..10]);

        fake.finish(ids[3], summary(1024));
        wait_until(|| status(&scheduler, ids[3]) == TaskStatus::Completed).await;

        assert_eq!(count(&scheduler, TaskStatus::Downloading), 10);
        assert_eq!(count(&scheduler, TaskStatus::Waiting), 1);
        assert_eq!(status(&scheduler, ids[10]), TaskStatus::Downloading);
        assert_eq!(status(&scheduler, ids[11]), TaskStatus::Waiting);

        let done = scheduler.get_task(ids[3]).unwrap();
        assert_eq!(done.progress, 100);
        assert_eq!(done.total_size, Some(1024));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_unsupported_protocol_fails_without_using_a_slot() {
        let (scheduler, fake) = scheduler(1);
        let torrent = scheduler
            .add_task(AddTaskOptions {
                protocol: Some(Protocol::Bt),
                ..AddTaskOptions::new("https://example.com/x.torrent", "/tmp")
            })
            .unwrap();
        let next = add(&scheduler, "next.bin");

        let failed = scheduler.get_task(torrent).unwrap();
        assert_eq!(failed.status, TaskStatus::Error);
        assert!(failed.error.unwrap().contains("bt"));
        assert_eq!(status(&scheduler, next), TaskStatus::Downloading);
        assert_eq!(scheduler.active_count(), 1);
        assert_eq!(fake.started_ids(), vec![next]);
    }

    #[tokio::test]
    async fn test_pause_frees_one_slot_and_resume_trusts_artifact() {
        let (scheduler, fake) = scheduler(1);
        let first = add(&scheduler, "first.bin");
        let second = add(&scheduler, "second.bin");
        assert!(!fake.last_job(first).resume);

        scheduler.pause_task(first).unwrap();
        assert_eq!(status(&scheduler, first), TaskStatus::Paused);
        assert_eq!(status(&scheduler, second), TaskStatus::Downloading);
        assert_eq!(scheduler.active_count(), 1);

        // The detached transfer settles as paused; that must not change the record
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(status(&scheduler, first), TaskStatus::Paused);
        assert_eq!(scheduler.active_count(), 1);

        scheduler.resume_task(first).unwrap();
        assert_eq!(status(&scheduler, first), TaskStatus::Waiting);

        fake.finish(second, summary(10));
        wait_until(|| status(&scheduler, first) == TaskStatus::Downloading).await;
        assert!(fake.last_job(first).resume);
        assert!(fake.discarded.lock().is_empty());
    }

    #[tokio::test]
    async fn test_remove_aborts_without_error_and_discards_artifact() {
        let (scheduler, fake) = scheduler(1);
        let first = add(&scheduler, "first.bin");
        let second = add(&scheduler, "second.bin");

        scheduler.remove_task(first).await.unwrap();
        assert!(scheduler.get_task(first).is_none());
        assert_eq!(*fake.discarded.lock(), vec![first]);
        assert_eq!(status(&scheduler, second), TaskStatus::Downloading);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count(&scheduler, TaskStatus::Error), 0);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn test_removing_completed_task_keeps_destination() {
        let (scheduler, fake) = scheduler(1);
        let id = add(&scheduler, "done.bin");
        fake.finish(id, summary(5));
        wait_until(|| status(&scheduler, id) == TaskStatus::Completed).await;

        scheduler.remove_task(id).await.unwrap();
        assert!(fake.discarded.lock().is_empty());
        assert!(matches!(
            scheduler.remove_task(id).await,
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_retry_requeues() {
        let (scheduler, fake) = scheduler(2);
        let id = add(&scheduler, "broken.bin");

        fake.finish(id, Err(CoreError::Protocol { status: 404 }));
        wait_until(|| status(&scheduler, id) == TaskStatus::Error).await;
        let failed = scheduler.get_task(id).unwrap();
        assert!(failed.error.unwrap().contains("404"));
        assert_eq!(scheduler.active_count(), 0);

        scheduler.retry_task(id).unwrap();
        let retried = scheduler.get_task(id).unwrap();
        assert_eq!(retried.status, TaskStatus::Downloading);
        assert!(retried.error.is_none());
        assert!(fake.last_job(id).resume);
    }

    #[tokio::test]
    async fn test_commands_outside_their_state_are_no_ops() {
        let (scheduler, _fake) = scheduler(1);
        let running = add(&scheduler, "a.bin");
        let queued = add(&scheduler, "b.bin");

        scheduler.resume_task(running).unwrap();
        scheduler.retry_task(running).unwrap();
        scheduler.pause_task(queued).unwrap();
        scheduler.pause_task(running).unwrap();
        scheduler.pause_task(running).unwrap();

        assert_eq!(status(&scheduler, running), TaskStatus::Paused);
        assert_eq!(status(&scheduler, queued), TaskStatus::Downloading);
        assert_eq!(scheduler.active_count(), 1);
    }

    #[tokio::test]
    async fn test_auto_start_false_waits_for_an_admission_pass() {
        let (scheduler, fake) = scheduler(2);
        let id = scheduler
            .add_task(AddTaskOptions {
                auto_start: Some(false),
                ..AddTaskOptions::new("http://example.com/later.iso", "/tmp")
            })
            .unwrap();
        assert_eq!(status(&scheduler, id), TaskStatus::Waiting);
        assert!(fake.started_ids().is_empty());

        scheduler.start_task(id).unwrap();
        assert_eq!(status(&scheduler, id), TaskStatus::Downloading);
        assert!(matches!(
            scheduler.start_task(uuid::Uuid::new_v4()),
            Err(CoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_task_validates_url_and_protocol() {
        let (scheduler, _fake) = scheduler(1);

        let bad_url = scheduler.add_task(AddTaskOptions::new("not a url", "/tmp"));
        assert!(matches!(bad_url, Err(CoreError::InvalidUrl(_))));

        let bad_scheme = scheduler.add_task(AddTaskOptions::new("gopher://example.com/x", "/tmp"));
        assert!(matches!(bad_scheme, Err(CoreError::InvalidProtocol(_))));

        assert!(scheduler.get_tasks().is_empty());
    }

    #[tokio::test]
    async fn test_file_name_is_derived_or_sanitized() {
        let (scheduler, _fake) = scheduler(1);
        let derived = scheduler
            .add_task(AddTaskOptions::new(
                "https://example.com/files/report%202024.pdf",
                "/tmp",
            ))
            .unwrap();
        let unsafe_name = scheduler
            .add_task(AddTaskOptions {
                file_name: Some("../escape".to_string()),
                ..AddTaskOptions::new("https://example.com/data.bin", "/tmp")
            })
            .unwrap();

        assert_eq!(scheduler.get_task(derived).unwrap().file_name, "report 2024.pdf");
        assert_eq!(scheduler.get_task(unsafe_name).unwrap().file_name, "data.bin");
    }

    #[tokio::test]
    async fn test_progress_from_released_attempt_is_ignored() {
        let (scheduler, fake) = scheduler(1);
        let id = add(&scheduler, "movie.mkv");
        let sink = fake.sink(id);

        sink(TransferProgress {
            received: 500,
            total: Some(1000),
            progress: 50,
            speed: 2048,
        });
        let task = scheduler.get_task(id).unwrap();
        assert_eq!((task.progress, task.speed, task.start_byte), (50, 2048, 500));
        assert_eq!(task.total_size, Some(1000));

        scheduler.pause_task(id).unwrap();
        sink(TransferProgress {
            received: 900,
            total: Some(1000),
            progress: 90,
            speed: 4096,
        });
        let task = scheduler.get_task(id).unwrap();
        assert_eq!(task.progress, 50);
        assert_eq!(task.speed, 0);
    }

    #[tokio::test]
    async fn test_reload_settings_raises_bound() {
        let (scheduler, _fake) = scheduler(1);
        for name in ["a", "b", "c"] {
            add(&scheduler, name);
        }
        assert_eq!(scheduler.active_count(), 1);

        let settings = Settings {
            max_concurrent: 3,
            ..scheduler.settings()
        };
        scheduler.reload_settings(settings).unwrap();
        assert_eq!(scheduler.active_count(), 3);
        assert_eq!(scheduler.settings().max_concurrent, 3);
    }

    #[tokio::test]
    async fn test_lifecycle_updates_are_published() {
        let (scheduler, _fake) = scheduler(1);
        let mut rx = scheduler.subscribe();
        let id = add(&scheduler, "a.bin");

        let added = rx.recv().await.unwrap();
        assert_eq!(added.cause, UpdateCause::TaskAdded { id });
        assert_eq!(added.tasks[0].status, TaskStatus::Waiting);

        let started = rx.recv().await.unwrap();
        assert!(matches!(
            started.cause,
            UpdateCause::StatusChanged { status: TaskStatus::Downloading, .. }
        ));
        assert_eq!(started.tasks[0].status, TaskStatus::Downloading);
    }

    #[test]
    fn test_commands_work_from_a_thread_without_runtime() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let (registry, fake) = fake_registry();
        let scheduler = Scheduler::with_runtime(bounded(1), registry, runtime.handle().clone());

        let caller = scheduler.clone();
        let (first, second) = std::thread::spawn(move || {
            let first = add(&caller, "a.bin");
            let second = add(&caller, "b.bin");
            caller.pause_task(first).unwrap();
            caller.resume_task(first).unwrap();
            caller
                .reload_settings(Settings {
                    max_concurrent: 2,
                    ..caller.settings()
                })
                .unwrap();
            (first, second)
        })
        .join()
        .expect("commands must not need a runtime on the calling thread");

        assert_eq!(status(&scheduler, first), TaskStatus::Downloading);
        assert_eq!(status(&scheduler, second), TaskStatus::Downloading);
        assert_eq!(fake.started_ids(), vec![first, second, first]);

        // The watcher spawned on the runtime settles the transfer
        fake.finish(second, summary(10));
        runtime.block_on(wait_until(|| status(&scheduler, second) == TaskStatus::Completed));
    }
}
