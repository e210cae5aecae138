//! Byte-stream download capability with progress events.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress { current: u64, total: Option<u64> },
    Success,
}

impl DownloadEvent {
    /// Completed fraction, when the total size is known.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            DownloadEvent::Progress {
                current,
                total: Some(total),
            } if *total > 0 => Some((*current as f64 / *total as f64).min(1.0)),
            DownloadEvent::Progress { .. } => None,
            DownloadEvent::Success => Some(1.0),
        }
    }
}

/// A running download: its event stream and the handle to abort it.
///
/// The stream ends after `Ok(Success)` or a single `Err`.
#[derive(Debug)]
pub struct DownloadTask {
    pub events: mpsc::Receiver<Result<DownloadEvent>>,
    pub cancel: CancellationToken,
}

impl DownloadTask {
    /// Sender half plus the task handed to the caller.
    pub fn channel() -> (mpsc::Sender<Result<DownloadEvent>>, Self) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        (
            tx,
            Self {
                events: rx,
                cancel: CancellationToken::new(),
            },
        )
    }

    /// A task that has already succeeded.
    pub fn completed() -> Self {
        let (tx, task) = Self::channel();
        // Capacity is non-zero, so this cannot fail.
        let _ = tx.try_send(Ok(DownloadEvent::Success));
        task
    }

    pub fn failed(error: EngineError) -> Self {
        let (tx, task) = Self::channel();
        let _ = tx.try_send(Err(error));
        task
    }

    /// Drain the stream, returning once it succeeded.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(event) = self.events.recv().await {
            if event? == DownloadEvent::Success {
                return Ok(());
            }
        }
        Err(EngineError::Download("download ended without success".into()))
    }
}

pub trait Downloader: Send + Sync {
    /// Start fetching `url` into `dest`. No partial file is left at `dest`.
    fn download(&self, url: &str, dest: &Path) -> DownloadTask;
}

/// reqwest-backed downloader streaming into `<dest>.part`.
#[derive(Debug, Clone, Default)]
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

impl Downloader for HttpDownloader {
    fn download(&self, url: &str, dest: &Path) -> DownloadTask {
        let (tx, task) = DownloadTask::channel();
        let client = self.client.clone();
        let cancel = task.cancel.clone();
        let url = url.to_string();
        let dest = dest.to_path_buf();

        tokio::spawn(async move {
            let part = part_path(&dest);
            let result = transfer(&client, &url, &dest, &part, &tx, &cancel).await;
            match result {
                Ok(bytes) => {
                    tracing::info!(url = %url, path = %dest.display(), bytes, "download complete");
                    let _ = tx.send(Ok(DownloadEvent::Success)).await;
                }
                Err(e) => {
                    if let Err(rm) = tokio::fs::remove_file(&part).await {
                        if rm.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %part.display(), "failed to remove partial download: {rm}");
                        }
                    }
                    tracing::warn!(url = %url, "download failed: {e}");
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        task
    }
}

async fn transfer(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
    part: &Path,
    tx: &mpsc::Sender<Result<DownloadEvent>>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let url = url::Url::parse(url)
        .map_err(|e| EngineError::Download(format!("invalid url '{url}': {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::Download(format!(
            "unsupported scheme '{}' in {url}",
            url.scheme()
        )));
    }

    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        response = client.get(url.clone()).send() => response
            .map_err(|e| EngineError::Download(format!("request to {url} failed: {e}")))?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(EngineError::Download(format!(
            "{url} answered with status {status}"
        )));
    }

    let total = response.content_length();
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(part).await?;
    let mut response = response;
    let mut current = 0u64;

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            chunk = response.chunk() => chunk
                .map_err(|e| EngineError::Download(format!("reading {url} failed: {e}")))?,
        };
        let Some(chunk) = chunk else { break };

        file.write_all(&chunk).await?;
        current += chunk.len() as u64;
        // Receiver gone means nobody observes progress any more; keep going.
        let _ = tx.send(Ok(DownloadEvent::Progress { current, total })).await;
    }

    file.flush().await?;
    drop(file);
    tokio::fs::rename(part, dest).await?;
    Ok(current)
}
