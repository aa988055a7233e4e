//! Cancellable single-file downloads.
//!
//! A transfer streams into `<dest>.part` and renames it onto `<dest>` only after the
//! last byte is written, so `<dest>` exists exactly when the transfer completed.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::util::{cancel_requested, progress_percent};

const WRITE_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("server answered HTTP {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("connection error: {0}")]
    Connection(String),
    #[error("download incomplete: received {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
    #[error("file error at {path}: {message}")]
    Filesystem { path: PathBuf, message: String },
    #[error("another download is still running")]
    Busy,
}

impl TransferError {
    fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            TransferError::HttpStatus {
                url: url.to_owned(),
                status: status.as_u16(),
            }
        } else {
            TransferError::Connection(err.to_string())
        }
    }

    fn fs(path: &Path, err: std::io::Error) -> Self {
        TransferError::Filesystem {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// Whole percent, only sent when the content length is known and the value changed.
    Progress(u8),
    Completed(PathBuf),
    Failed(TransferError),
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferState {
    Pending,
    Running,
    Canceled,
    Failed,
    Completed,
}

/// Book-keeping for one download; lives inside its worker task.
#[derive(Debug)]
struct TransferJob {
    url: String,
    destination: PathBuf,
    state: TransferState,
    bytes_total: Option<u64>,
    bytes_done: u64,
}

impl TransferJob {
    fn new(url: String, destination: PathBuf) -> Self {
        Self {
            url,
            destination,
            state: TransferState::Pending,
            bytes_total: None,
            bytes_done: 0,
        }
    }

    fn part_path(&self) -> Result<PathBuf, TransferError> {
        part_path(&self.destination)
    }
}

enum Halt {
    Canceled,
    Failed(TransferError),
}

impl From<TransferError> for Halt {
    fn from(err: TransferError) -> Self {
        Halt::Failed(err)
    }
}

/// Cancels the transfer it was returned for.
#[derive(Clone, Debug)]
pub struct TransferHandle {
    cancel: Arc<AtomicBool>,
}

impl TransferHandle {
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

struct ActiveTransfer {
    handle: TransferHandle,
    /// Cleared by the worker before it sends its terminal event.
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct TransferManager {
    client: Client,
    active: Option<ActiveTransfer>,
}

impl TransferManager {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|active| {
            active.running.load(Ordering::SeqCst) && !active.task.is_finished()
        })
    }

    /// Start downloading `url` to `dest`. Returns `None` without side effects while
    /// another transfer is still running.
    pub fn start(
        &mut self,
        url: &str,
        dest: &Path,
        events: mpsc::Sender<TransferEvent>,
    ) -> Option<TransferHandle> {
        if self.is_running() {
            warn!("transfer: already running; ignoring start for {url}");
            return None;
        }
        let handle = TransferHandle {
            cancel: Arc::new(AtomicBool::new(false)),
        };
        let job = TransferJob::new(url.to_owned(), dest.to_path_buf());
        let client = self.client.clone();
        let cancel = Some(handle.cancel.clone());
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();
        let task = tokio::spawn(async move {
            run_job(client, job, cancel, worker_running, events).await;
        });
        self.active = Some(ActiveTransfer {
            handle: handle.clone(),
            running,
            task,
        });
        Some(handle)
    }

    pub fn cancel(&self) {
        if let Some(active) = &self.active {
            active.handle.cancel();
        }
    }
}

async fn run_job(
    client: Client,
    mut job: TransferJob,
    cancel: Option<Arc<AtomicBool>>,
    running: Arc<AtomicBool>,
    events: mpsc::Sender<TransferEvent>,
) {
    job.state = TransferState::Running;
    info!("transfer: {} -> {}", job.url, job.destination.display());

    let terminal = match download(&client, &mut job, &cancel, &events).await {
        Ok(()) => {
            job.state = TransferState::Completed;
            info!(
                "transfer: completed {} ({} bytes)",
                job.destination.display(),
                job.bytes_done
            );
            TransferEvent::Completed(job.destination.clone())
        }
        Err(halt) => {
            if let Ok(part) = job.part_path() {
                let _ = fs::remove_file(&part).await;
            }
            match halt {
                Halt::Canceled => {
                    job.state = TransferState::Canceled;
                    warn!("transfer: canceled after {} bytes", job.bytes_done);
                    TransferEvent::Canceled
                }
                Halt::Failed(err) => {
                    job.state = TransferState::Failed;
                    warn!("transfer: failed: {err}");
                    TransferEvent::Failed(err)
                }
            }
        }
    };
    debug!("transfer: final state {:?}", job.state);
    running.store(false, Ordering::SeqCst);
    let _ = events.send(terminal).await;
}

async fn download(
    client: &Client,
    job: &mut TransferJob,
    cancel: &Option<Arc<AtomicBool>>,
    events: &mpsc::Sender<TransferEvent>,
) -> Result<(), Halt> {
    let part = job.part_path()?;
    if let Some(parent) = job.destination.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransferError::fs(parent, e))?;
    }
    // Leftover from an interrupted run.
    if fs::metadata(&part).await.is_ok() {
        debug!("transfer: removing stale {}", part.display());
        fs::remove_file(&part)
            .await
            .map_err(|e| TransferError::fs(&part, e))?;
    }

    let response = client
        .get(&job.url)
        .send()
        .await
        .map_err(|e| TransferError::from_reqwest(&job.url, e))?
        .error_for_status()
        .map_err(|e| TransferError::from_reqwest(&job.url, e))?;
    if cancel_requested(cancel) {
        return Err(Halt::Canceled);
    }

    job.bytes_total = response.content_length();
    let mut file = File::create(&part)
        .await
        .map_err(|e| TransferError::fs(&part, e))?;
    let mut stream = response.bytes_stream();
    let mut last_percent: Option<u8> = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| TransferError::from_reqwest(&job.url, e))?;
        for piece in chunk.chunks(WRITE_CHUNK) {
            if cancel_requested(cancel) {
                return Err(Halt::Canceled);
            }
            file.write_all(piece)
                .await
                .map_err(|e| TransferError::fs(&part, e))?;
            job.bytes_done += piece.len() as u64;

            if let Some(pct) = progress_percent(job.bytes_done, job.bytes_total)
                && last_percent != Some(pct)
            {
                last_percent = Some(pct);
                let _ = events.send(TransferEvent::Progress(pct)).await;
            }
        }
    }
    if cancel_requested(cancel) {
        return Err(Halt::Canceled);
    }

    file.flush().await.map_err(|e| TransferError::fs(&part, e))?;
    file.sync_all()
        .await
        .map_err(|e| TransferError::fs(&part, e))?;
    drop(file);

    if let Some(expected) = job.bytes_total
        && job.bytes_done < expected
    {
        return Err(Halt::Failed(TransferError::Incomplete {
            received: job.bytes_done,
            expected,
        }));
    }

    fs::rename(&part, &job.destination)
        .await
        .map_err(|e| TransferError::fs(&job.destination, e))?;
    Ok(())
}

/// `<dest>.part`, the in-flight name of a transfer.
pub fn part_path(dest: &Path) -> Result<PathBuf, TransferError> {
    let name = dest.file_name().ok_or_else(|| TransferError::Filesystem {
        path: dest.to_path_buf(),
        message: "destination has no file name".into(),
    })?;
    let mut part: OsString = name.to_os_string();
    part.push(".part");
    Ok(dest.with_file_name(part))
}
