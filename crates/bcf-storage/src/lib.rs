//! Snapshot archival and bounded snapshot download for the sync pipeline.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use bcf_core::{JobType, SnapshotFormat};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "bcf-storage";

const ARCHIVE_DIR_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same payload was already archived under this path.
    pub deduplicated: bool,
    /// Older archive directories removed to honour the retention count.
    pub pruned: usize,
}

/// Archive of ingested snapshot payloads, grouped into one directory per sync timestamp.
/// Only the newest `retention` directories are kept; zero keeps everything.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
    retention: usize,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            retention: 0,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<timestamp>/<job-type>/<sha256>.<json|xlsx>`
    pub fn relative_path(
        &self,
        archived_at: DateTime<Utc>,
        job_type: JobType,
        content_hash: &str,
        format: SnapshotFormat,
    ) -> PathBuf {
        PathBuf::from(archived_at.format(ARCHIVE_DIR_FORMAT).to_string())
            .join(job_type.as_str())
            .join(format!("{content_hash}.{}", format.extension()))
    }

    pub async fn store(
        &self,
        archived_at: DateTime<Utc>,
        job_type: JobType,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.relative_path(archived_at, job_type, &content_hash, SnapshotFormat::sniff(bytes));
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?;
        if !deduplicated {
            write_via_rename(&absolute_path, bytes).await?;
        }

        let current = archived_at.format(ARCHIVE_DIR_FORMAT).to_string();
        let pruned = match self.prune(&current).await {
            Ok(pruned) => pruned,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "pruning snapshot archive failed");
                0
            }
        };

        Ok(ArchivedSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
            pruned,
        })
    }

    /// Removes the oldest timestamp directories beyond the retention count, never `keep`.
    pub async fn prune(&self, keep: &str) -> anyhow::Result<usize> {
        if self.retention == 0 {
            return Ok(0);
        }
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing archive {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if NaiveDateTime::parse_from_str(&name, ARCHIVE_DIR_FORMAT).is_ok()
                && entry.file_type().await?.is_dir()
            {
                dirs.push(name);
            }
        }
        // The directory format sorts chronologically as text.
        dirs.sort();

        let excess = dirs.len().saturating_sub(self.retention);
        let mut pruned = 0;
        for name in dirs.iter().take(excess).filter(|name| name.as_str() != keep) {
            let path = self.root.join(name);
            fs::remove_dir_all(&path)
                .await
                .with_context(|| format!("removing old archive {}", path.display()))?;
            info!(archive = %name, "pruned old snapshot archive");
            pruned += 1;
        }
        Ok(pruned)
    }
}

async fn write_via_rename(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .with_context(|| format!("archive path {} has no parent", path.display()))?;
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating archive directory {}", dir.display()))?;

    let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
    fs::write(&partial, bytes)
        .await
        .with_context(|| format!("writing {}", partial.display()))?;
    if let Err(err) = fs::rename(&partial, path).await {
        let _ = fs::remove_file(&partial).await;
        return Err(err).with_context(|| format!("publishing archive {}", path.display()));
    }
    Ok(())
}

/// Attempt budget for one snapshot download. Delays double from `first_delay` up to
/// `max_delay`; a server's `Retry-After` replaces the computed delay, within the same cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            first_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Wall-clock bound on the whole download, retries included.
    pub deadline: Duration,
    pub max_bytes: u64,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(300),
            max_bytes: 64 * 1024 * 1024,
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedSnapshot {
    pub final_url: String,
    pub attempts: u32,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus {
        status: u16,
        url: String,
        retry_after: Option<Duration>,
    },
    /// Signed export links expire; only a fresh export can be downloaded.
    #[error("export link refused with status {status}; a new export is required")]
    LinkRejected { status: u16 },
    #[error("snapshot exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("snapshot download exceeded {secs}s deadline")]
    TimedOut { secs: u64 },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("building http client: {0}")]
    Client(String),
}

impl FetchError {
    /// How long to wait before attempt number `attempt + 1`, or `None` when another attempt
    /// cannot succeed: refused links, oversized payloads and local failures.
    pub fn retry_delay(&self, policy: &RetryPolicy, attempt: u32) -> Option<Duration> {
        let backoff = policy
            .first_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
            .min(policy.max_delay);
        match self {
            Self::Request(err) if err.is_timeout() || err.is_connect() || err.is_body() => {
                Some(backoff)
            }
            Self::HttpStatus {
                status,
                retry_after,
                ..
            } => match *status {
                408 | 429 | 500 | 502 | 503 | 504 => {
                    Some(retry_after.map_or(backoff, |wait| wait.min(policy.max_delay)))
                }
                _ => None,
            },
            _ => None,
        }
    }
}

/// Downloads snapshot payloads with retries, a hard deadline and a size ceiling.
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    client: reqwest::Client,
    config: FetchConfig,
}

impl SnapshotFetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.deadline);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub async fn fetch(&self, job_id: Uuid, url: &str) -> Result<FetchedSnapshot, FetchError> {
        let span = info_span!("snapshot_fetch", %job_id, url);
        let deadline = self.config.deadline;
        tokio::time::timeout(deadline, self.fetch_within(url, Instant::now() + deadline))
            .instrument(span)
            .await
            .unwrap_or(Err(FetchError::TimedOut {
                secs: deadline.as_secs(),
            }))
    }

    /// Retries until the policy's attempts run out or the next wait would overrun `deadline`.
    async fn fetch_within(&self, url: &str, deadline: Instant) -> Result<FetchedSnapshot, FetchError> {
        let policy = self.config.retry;
        let mut attempt = 1;
        loop {
            let err = match self.attempt(url).await {
                Ok((final_url, body)) => {
                    debug!(attempt, bytes = body.len(), "snapshot downloaded");
                    return Ok(FetchedSnapshot {
                        final_url,
                        attempts: attempt,
                        body,
                    });
                }
                Err(err) => err,
            };
            let Some(wait) = err.retry_delay(&policy, attempt) else {
                return Err(err);
            };
            if attempt >= policy.attempts || Instant::now() + wait >= deadline {
                return Err(err);
            }
            warn!(attempt, wait_ms = wait.as_millis() as u64, error = %err, "snapshot download failed, retrying");
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<(String, Vec<u8>), FetchError> {
        let limit = self.config.max_bytes;
        let mut resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FetchError::LinkRejected {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                retry_after,
            });
        }
        if resp.content_length().is_some_and(|len| len > limit) {
            return Err(FetchError::TooLarge { limit });
        }

        let mut body = Vec::with_capacity(resp.content_length().unwrap_or(0) as usize);
        while let Some(chunk) = resp.chunk().await? {
            if (body.len() + chunk.len()) as u64 > limit {
                return Err(FetchError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }
        Ok((final_url, body))
    }
}

/// Reads a locally supplied snapshot, enforcing the same size ceiling as downloads.
pub async fn read_local_snapshot(path: &Path, max_bytes: u64) -> Result<Vec<u8>, FetchError> {
    let io_err = |source| FetchError::Io {
        path: path.to_path_buf(),
        source,
    };
    let meta = fs::metadata(path).await.map_err(io_err)?;
    if meta.len() > max_bytes {
        return Err(FetchError::TooLarge { limit: max_bytes });
    }
    fs::read(path).await.map_err(io_err)
}
