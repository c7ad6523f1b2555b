// src/fetch/zips.rs

use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
    sync::Semaphore,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::FetchOptions;
use crate::error::{FetchFailure, Result, TransportClass};

/// Statuses worth asking again for: rate limiting and transient server errors.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Build the one HTTP client shared by every download in a run.
pub fn build_client(opts: &FetchOptions) -> Result<Client> {
    Ok(Client::builder()
        .connect_timeout(opts.connect_timeout)
        .timeout(opts.timeout)
        .user_agent(opts.user_agent.clone())
        .build()?)
}

/// A file that made it to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub status: u16,
}

/// What happened to one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub url: String,
    pub attempts: u32,
    pub result: std::result::Result<FetchedFile, FetchFailure>,
}

impl FetchOutcome {
    fn failed(url: impl Into<String>, attempts: u32, failure: FetchFailure) -> Self {
        Self {
            url: url.into(),
            attempts,
            result: Err(failure),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn path(&self) -> Option<&Path> {
        self.result.as_ref().ok().map(|f| f.path.as_path())
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        self.result.as_ref().err()
    }
}

/// Outcomes of a batch, one per input URL, in input order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FetchReport {
    pub outcomes: Vec<FetchOutcome>,
}

impl FetchReport {
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &FetchOutcome> {
        self.outcomes.iter().filter(|o| o.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FetchOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Paths of every archive that landed on disk.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.outcomes
            .iter()
            .filter_map(|o| o.path().map(Path::to_path_buf))
            .collect()
    }
}

/// Whether a failure is worth another attempt.
pub fn is_retryable(failure: &FetchFailure) -> bool {
    match failure {
        FetchFailure::Http { status } => RETRYABLE_STATUSES.contains(status),
        FetchFailure::Transport { class, .. } => {
            matches!(class, TransportClass::Timeout | TransportClass::Connect)
        }
        _ => false,
    }
}

fn classify(err: &reqwest::Error) -> TransportClass {
    if err.is_timeout() {
        TransportClass::Timeout
    } else if mentions_tls(err) {
        TransportClass::Tls
    } else if err.is_connect() {
        TransportClass::Connect
    } else if err.is_body() || err.is_decode() {
        TransportClass::Body
    } else {
        TransportClass::Other
    }
}

// reqwest folds handshake failures into connect errors; the causes below
// it still name them. The top-level message carries the URL, so only the
// causes are inspected.
fn mentions_tls(err: &reqwest::Error) -> bool {
    let mut cur = std::error::Error::source(err);
    while let Some(e) = cur {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            // rustls reports handshake and certificate errors as InvalidData
            if io.kind() == std::io::ErrorKind::InvalidData {
                return true;
            }
        }
        let msg = e.to_string().to_ascii_lowercase();
        if ["certificate", "tls", "handshake"].iter().any(|w| msg.contains(w)) {
            return true;
        }
        cur = e.source();
    }
    false
}

fn transport_failure(err: reqwest::Error) -> FetchFailure {
    FetchFailure::Transport {
        class: classify(&err),
        message: err.to_string(),
    }
}

fn io_failure(err: std::io::Error) -> FetchFailure {
    FetchFailure::Io {
        message: err.to_string(),
    }
}

/// Last path segment of `url`, or `download.zip` when there is none.
pub fn basename(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .unwrap_or("download.zip")
        .to_string()
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Per-URL lifecycle. Each download walks
/// `Pending → (Retrying)* → Succeeded | Failed`.
#[derive(Debug)]
enum FetchState {
    Pending,
    Retrying { retry: u32, last: FetchFailure },
    Succeeded(FetchedFile),
    Failed(FetchFailure),
}

/// Download every URL into `target_dir`.
///
/// URLs are independent: a failure on one never stops the others, and the
/// returned report has exactly one outcome per URL in the order given.
/// At most `opts.concurrency` downloads run at once. Cancelling `cancel`
/// stops new attempts; URLs not yet finished report
/// [`FetchFailure::Cancelled`].
#[instrument(level = "info", skip_all, fields(count = urls.len(), dir = %target_dir.display()))]
pub async fn fetch_batch(
    client: &Client,
    urls: &[String],
    target_dir: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    fs::create_dir_all(target_dir).await?;

    let sem = Arc::new(Semaphore::new(opts.concurrency.max(1)));
    let mut handles = Vec::with_capacity(urls.len());

    for url in urls {
        let client = client.clone();
        let url = url.clone();
        let dir = target_dir.to_path_buf();
        let opts = opts.clone();
        let cancel = cancel.clone();
        let sem = sem.clone();

        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                permit = sem.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            let Some(_permit) = permit else {
                let failure = FetchFailure::Cancelled;
                warn!(url = %url, attempts = 0, error = %failure, "fetch failed");
                return FetchOutcome::failed(url, 0, failure);
            };
            fetch_one(&client, &url, &dir, &opts, &cancel).await
        }));
    }

    // await in spawn order so the report lines up with `urls`
    let mut outcomes = Vec::with_capacity(handles.len());
    for (url, handle) in urls.iter().zip(handles) {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(url = %url, error = %e, "download task died");
                FetchOutcome::failed(
                    url.clone(),
                    0,
                    FetchFailure::TaskPanicked {
                        message: e.to_string(),
                    },
                )
            }
        };
        outcomes.push(outcome);
    }

    let ok = outcomes.iter().filter(|o| o.is_success()).count();
    info!(ok, failed = outcomes.len() - ok, "batch finished");
    Ok(FetchReport { outcomes })
}

/// Download a single URL with retries. Never returns an error: every way
/// this can go wrong ends up in the outcome.
pub async fn fetch_one(
    client: &Client,
    url_str: &str,
    target_dir: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> FetchOutcome {
    let url = match Url::parse(url_str) {
        Ok(u) => u,
        Err(e) => {
            let failure = FetchFailure::Transport {
                class: TransportClass::Other,
                message: format!("invalid URL: {}", e),
            };
            warn!(url = %url_str, attempts = 0, error = %failure, "fetch failed");
            return FetchOutcome::failed(url_str, 0, failure);
        }
    };
    let dest = target_dir.join(basename(&url));
    let start = Instant::now();

    let mut attempts = 0u32;
    let mut state = FetchState::Pending;
    let result = loop {
        state = match state {
            FetchState::Pending => attempt(client, &url, &dest, opts, cancel, &mut attempts).await,
            FetchState::Retrying { retry, last } => {
                let delay = opts.backoff_delay(retry);
                debug!(url = %url, retry, delay_ms = delay.as_millis() as u64, error = %last, "retrying");
                tokio::select! {
                    _ = cancel.cancelled() => FetchState::Failed(FetchFailure::Cancelled),
                    _ = sleep(delay) => attempt(client, &url, &dest, opts, cancel, &mut attempts).await,
                }
            }
            FetchState::Succeeded(file) => break Ok(file),
            FetchState::Failed(failure) => break Err(failure),
        };
    };

    match &result {
        Ok(file) => info!(
            url = %url,
            status = file.status,
            attempts,
            bytes = file.bytes,
            elapsed = ?start.elapsed(),
            "fetched"
        ),
        Err(failure) => warn!(url = %url, attempts, error = %failure, "fetch failed"),
    }

    FetchOutcome {
        url: url_str.to_string(),
        attempts,
        result,
    }
}

async fn attempt(
    client: &Client,
    url: &Url,
    dest: &Path,
    opts: &FetchOptions,
    cancel: &CancellationToken,
    attempts: &mut u32,
) -> FetchState {
    if cancel.is_cancelled() {
        return FetchState::Failed(FetchFailure::Cancelled);
    }
    *attempts += 1;
    match download_once(client, url, dest, opts.chunk_size).await {
        Ok(file) => FetchState::Succeeded(file),
        Err(failure) if is_retryable(&failure) && *attempts <= opts.max_retries => {
            FetchState::Retrying {
                retry: *attempts,
                last: failure,
            }
        }
        Err(failure) => FetchState::Failed(failure),
    }
}

async fn download_once(
    client: &Client,
    url: &Url,
    dest: &Path,
    chunk_size: usize,
) -> std::result::Result<FetchedFile, FetchFailure> {
    let resp = client
        .get(url.clone())
        .send()
        .await
        .map_err(transport_failure)?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchFailure::Http {
            status: status.as_u16(),
        });
    }

    // stream into a side file so a broken transfer never leaves a
    // truncated archive under the real name
    let part = part_path(dest);
    let written = match stream_body(resp, &part, chunk_size).await {
        Ok(n) => n,
        Err(failure) => {
            let _ = fs::remove_file(&part).await;
            return Err(failure);
        }
    };
    if let Err(e) = fs::rename(&part, dest).await {
        let _ = fs::remove_file(&part).await;
        return Err(io_failure(e));
    }

    Ok(FetchedFile {
        path: dest.to_path_buf(),
        bytes: written,
        status: status.as_u16(),
    })
}

async fn stream_body(
    resp: reqwest::Response,
    part: &Path,
    chunk_size: usize,
) -> std::result::Result<u64, FetchFailure> {
    let file = fs::File::create(part).await.map_err(io_failure)?;
    let mut out = BufWriter::with_capacity(chunk_size.max(1), file);
    let mut body = resp.bytes_stream();
    let mut written = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(transport_failure)?;
        out.write_all(&chunk).await.map_err(io_failure)?;
        written += chunk.len() as u64;
    }
    out.flush().await.map_err(io_failure)?;
    Ok(written)
}
