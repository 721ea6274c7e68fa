//! Resumable HTTP/HTTPS transport
//!
//! Streams a response body into `<name>.tmp`, resuming with a `Range`
//! request when the artifact already holds bytes, and renames the
//! artifact onto the destination only once the body ended cleanly.

use crate::error::CoreError;
use crate::transport::{
    artifact_len, promote_artifact, remove_artifact, ArtifactLocks, ProgressSink, RateLimiter,
    TransferControl, TransferHandle, TransferJob, TransferOutcome, TransferProgress,
    TransferSignal, TransferSummary, Transport,
};
use crate::THROTTLE_WINDOW;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use omnidl_types::Settings;
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Transport for `http` and `https` URLs
pub struct HttpTransport {
    config: RwLock<HttpConfig>,
    limiter: RateLimiter,
    locks: ArtifactLocks,
}

#[derive(Clone)]
struct HttpConfig {
    client: Client,
    read_timeout: Option<Duration>,
}

impl HttpConfig {
    fn from_settings(settings: &Settings) -> Result<Self, CoreError> {
        let timeout = (settings.timeout_secs > 0).then(|| Duration::from_secs(settings.timeout_secs));

        let mut builder = Client::builder().user_agent(settings.user_agent.as_str());
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }
        if settings.proxy.enabled {
            if let Some(proxy) = settings.proxy.url.as_deref() {
                info!("Routing downloads through proxy {}", proxy);
                builder = builder.proxy(reqwest::Proxy::all(proxy)?);
            }
        }

        Ok(Self {
            client: builder.build()?,
            read_timeout: timeout,
        })
    }
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self, CoreError> {
        Ok(Self {
            config: RwLock::new(HttpConfig::from_settings(settings)?),
            limiter: RateLimiter::new(settings.speed_limit),
            locks: ArtifactLocks::default(),
        })
    }

    /// The limiter shared by every transfer of this transport
    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn start(&self, job: TransferJob, progress: ProgressSink) -> TransferHandle {
        let (control, signal) = TransferControl::channel();
        let config = self.config.read().clone();

        let transfer = HttpTransfer {
            job,
            client: config.client,
            read_timeout: config.read_timeout,
            limiter: self.limiter.clone(),
            locks: self.locks.clone(),
            signal,
            detached: false,
            progress,
        };

        TransferHandle {
            control,
            outcome: TransferOutcome::new(tokio::spawn(transfer.run())),
        }
    }

    async fn discard(&self, job: &TransferJob) -> Result<(), CoreError> {
        let guard = self.locks.acquire(&job.artifact).await;
        remove_artifact(guard.path()).await?;
        debug!(task_id = %job.task_id, "Discarded artifact {:?}", guard.path());
        Ok(())
    }

    fn reconfigure(&self, settings: &Settings) -> Result<(), CoreError> {
        *self.config.write() = HttpConfig::from_settings(settings)?;
        self.limiter.set_limit(settings.speed_limit);
        Ok(())
    }
}

/// How one request/stream cycle ended without an error
enum AttemptEnd {
    Finished(TransferSummary),
    /// Paused, aborted or detached before the body was complete
    Interrupted,
}

enum StreamEvent<T> {
    Stop { detached: bool },
    Chunk(Option<Result<T, CoreError>>),
}

/// One transfer, owned by its background task
struct HttpTransfer {
    job: TransferJob,
    client: Client,
    read_timeout: Option<Duration>,
    limiter: RateLimiter,
    locks: ArtifactLocks,
    signal: watch::Receiver<TransferSignal>,
    /// Every control handle was dropped
    detached: bool,
    progress: ProgressSink,
}

impl HttpTransfer {
    async fn run(mut self) -> Result<TransferSummary, CoreError> {
        let _guard = self.locks.acquire(&self.job.artifact).await;

        if !self.job.resume {
            let stale = artifact_len(&self.job.artifact).await?;
            if stale > 0 {
                info!(task_id = %self.job.task_id, "Discarding stale artifact ({} bytes)", stale);
                remove_artifact(&self.job.artifact).await?;
            }
        }

        loop {
            let signal = *self.signal.borrow_and_update();
            match signal {
                TransferSignal::Abort => return self.cancel().await,
                TransferSignal::Pause => {
                    info!(task_id = %self.job.task_id, "Transfer paused");
                    if !self.wait_while_paused().await {
                        return Err(CoreError::Paused);
                    }
                    continue;
                }
                TransferSignal::Run if self.detached => return Err(CoreError::Paused),
                TransferSignal::Run => {}
            }

            match self.attempt().await {
                Ok(AttemptEnd::Finished(summary)) => return Ok(summary),
                Ok(AttemptEnd::Interrupted) => continue,
                Err(_) if *self.signal.borrow() == TransferSignal::Abort => {
                    return self.cancel().await
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns false when the transfer was detached while paused
    async fn wait_while_paused(&mut self) -> bool {
        while *self.signal.borrow_and_update() == TransferSignal::Pause {
            if self.signal.changed().await.is_err() {
                self.detached = true;
                return *self.signal.borrow() != TransferSignal::Pause;
            }
        }
        true
    }

    async fn cancel(&self) -> Result<TransferSummary, CoreError> {
        if let Err(e) = remove_artifact(&self.job.artifact).await {
            warn!(task_id = %self.job.task_id, "Failed to remove artifact {:?}: {}", self.job.artifact, e);
        }
        info!(task_id = %self.job.task_id, "Transfer aborted");
        Err(CoreError::Cancelled)
    }

    /// One pass of request, stream and finalize, starting from the artifact
    async fn attempt(&mut self) -> Result<AttemptEnd, CoreError> {
        let task_id = self.job.task_id;
        let mut start_byte = artifact_len(&self.job.artifact).await?;

        let response = loop {
            let mut request = self.client.get(&self.job.url);
            if start_byte > 0 {
                request = request.header(RANGE, format!("bytes={}-", start_byte));
            }
            debug!(task_id = %task_id, start_byte, "Requesting {}", self.job.url);

            let sent = tokio::select! {
                biased;
                detached = stop_requested(&mut self.signal) => Err(detached),
                response = request.send() => Ok(response),
            };
            let response = match sent {
                Ok(response) => response?,
                Err(detached) => {
                    self.detached |= detached;
                    return Ok(AttemptEnd::Interrupted);
                }
            };

            match check_status(start_byte, response.status()) {
                Ok(()) => break response,
                Err(CoreError::RangeNotSupported) => {
                    // start_byte is 0 on the next pass, so this happens once per attempt
                    warn!(
                        task_id = %task_id,
                        status = response.status().as_u16(),
                        "Server ignored range request, restarting from zero"
                    );
                    drop(response);
                    remove_artifact(&self.job.artifact).await?;
                    start_byte = 0;
                }
                Err(e) => return Err(e),
            }
        };

        let total = total_size(response.headers(), start_byte);
        info!(task_id = %task_id, start_byte, total = ?total, "Transfer started");

        if let Some(parent) = self.job.artifact.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = if start_byte > 0 {
            OpenOptions::new().append(true).open(&self.job.artifact).await?
        } else {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.job.artifact)
                .await?
        };

        let read_timeout = self.read_timeout;
        let mut stream = Box::pin(response.bytes_stream());
        let mut received = start_byte;
        let mut last_emit = Instant::now();
        let mut received_at_emit = received;
        let limiter = self.limiter.clone();

        loop {
            let event = tokio::select! {
                biased;
                detached = stop_requested(&mut self.signal) => StreamEvent::Stop { detached },
                chunk = next_chunk(&mut stream, read_timeout) => StreamEvent::Chunk(chunk),
            };

            let chunk = match event {
                StreamEvent::Stop { detached } => {
                    self.detached |= detached;
                    file.flush().await?;
                    return Ok(AttemptEnd::Interrupted);
                }
                StreamEvent::Chunk(None) => break,
                StreamEvent::Chunk(Some(Err(e))) => {
                    let _ = file.flush().await;
                    return Err(e);
                }
                StreamEvent::Chunk(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            let throttled = tokio::select! {
                biased;
                detached = stop_requested(&mut self.signal) => Err(detached),
                _ = limiter.acquire(len) => Ok(()),
            };
            if let Err(detached) = throttled {
                self.detached |= detached;
                file.flush().await?;
                return Ok(AttemptEnd::Interrupted);
            }
            file.write_all(&chunk).await?;
            received += len;

            let elapsed = last_emit.elapsed();
            if elapsed >= THROTTLE_WINDOW {
                let speed = ((received - received_at_emit) as f64 / elapsed.as_secs_f64()) as u64;
                (self.progress)(TransferProgress {
                    received,
                    total,
                    progress: percent(received, total),
                    speed,
                });
                last_emit = Instant::now();
                received_at_emit = received;
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = total {
            if received < expected {
                return Err(CoreError::Incomplete { received, expected });
            }
        }

        // Pause or abort that raced the end of the body wins over completion
        if self.detached || *self.signal.borrow() != TransferSignal::Run {
            return Ok(AttemptEnd::Interrupted);
        }

        promote_artifact(&self.job.artifact, &self.job.destination).await?;
        info!(task_id = %task_id, bytes = received, "Transfer complete: {:?}", self.job.destination);

        Ok(AttemptEnd::Finished(TransferSummary {
            bytes: received,
            total_size: total.unwrap_or(received),
        }))
    }
}

/// Resolves once the transfer should stop; true means every control was dropped
async fn stop_requested(signal: &mut watch::Receiver<TransferSignal>) -> bool {
    loop {
        if signal.changed().await.is_err() {
            return true;
        }
        if *signal.borrow_and_update() != TransferSignal::Run {
            return false;
        }
    }
}

async fn next_chunk<S, T>(stream: &mut S, timeout: Option<Duration>) -> Option<Result<T, CoreError>>
where
    S: Stream<Item = Result<T, reqwest::Error>> + Unpin,
{
    let next = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, stream.next()).await {
            Ok(next) => next,
            Err(_) => return Some(Err(CoreError::Timeout)),
        },
        None => stream.next().await,
    };
    next.map(|chunk| chunk.map_err(CoreError::from))
}

/// Classify a response status for a request that started at `start_byte`
fn check_status(start_byte: u64, status: StatusCode) -> Result<(), CoreError> {
    if start_byte > 0 {
        if status == StatusCode::PARTIAL_CONTENT {
            Ok(())
        } else {
            Err(CoreError::RangeNotSupported)
        }
    } else if status.is_success() {
        Ok(())
    } else {
        Err(CoreError::Protocol {
            status: status.as_u16(),
        })
    }
}

/// Total length from `Content-Range`, else `Content-Length` past `start_byte`
fn total_size(headers: &HeaderMap, start_byte: u64) -> Option<u64> {
    let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    if let Some(total) = header(CONTENT_RANGE).and_then(content_range_total) {
        return Some(total);
    }
    header(CONTENT_LENGTH)
        .and_then(|len| len.trim().parse::<u64>().ok())
        .map(|len| start_byte + len)
}

/// Parse the complete length out of `bytes 0-1023/1024`; `*` means unknown
fn content_range_total(value: &str) -> Option<u64> {
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = range.split_once('/')?;
    total.trim().parse().ok()
}

fn percent(received: u64, total: Option<u64>) -> u8 {
    match total {
        Some(total) if total > 0 => ((received.min(total) as u128 * 100) / total as u128) as u8,
        _ => 0,
    }
}
