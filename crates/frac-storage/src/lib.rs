//! Archive acquisition, staging, and file selection for the ingestion pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "frac-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed, write-once copy of every downloaded archive.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(label)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.artifact_relative_path(fetched_at, label, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating artifact directory {}", parent.display()))?;

        let artifact = |deduplicated| StoredArtifact {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?
        {
            return Ok(artifact(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(artifact(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(artifact(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp artifact {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let shift = u32::try_from(attempt_index).unwrap_or(u32::MAX);
        let factor = 1u32.checked_shl(shift).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retry budget is spent. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &BackoffPolicy,
    operation: &str,
    classify: C,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryDisposition,
    E: fmt::Display,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => {
                debug!(operation, attempt, "attempt succeeded");
                return Ok(value);
            }
            Err(err) => {
                let disposition = classify(&err);
                if disposition == RetryDisposition::Retryable && attempt < policy.max_retries {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                warn!(operation, attempt, ?disposition, error = %err, "giving up");
                return Err(err);
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("truncated body from {url}: expected {expected} bytes, received {received}")]
    Truncated {
        url: String,
        expected: u64,
        received: u64,
    },
}

impl NetworkError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            NetworkError::Request(err) => classify_reqwest_error(err),
            NetworkError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            NetworkError::Truncated { .. } => RetryDisposition::Retryable,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, NetworkError> {
        retry_with_backoff(&self.backoff, url, NetworkError::disposition, |_| {
            self.fetch_once(url)
        })
        .await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, NetworkError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            return Err(NetworkError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let expected = resp.content_length();
        let body = resp.bytes().await?.to_vec();
        let received = body.len() as u64;
        if let Some(expected) = expected {
            if expected != received {
                return Err(NetworkError::Truncated {
                    url: final_url,
                    expected,
                    received,
                });
            }
        }

        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

/// A downloaded archive plus the transfer measurements emitted for observability.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub url: String,
    pub final_url: String,
    pub fetched_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
    pub byte_size: u64,
    pub elapsed: Duration,
    pub content_hash: String,
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("payload is not a valid archive: {0}")]
    Invalid(#[from] zip::result::ZipError),
    #[error("archive entry {name:?} escapes the staging directory")]
    UnsafeEntry { name: String },
    #[error("staging i/o on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ArchiveError {
    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ArchiveError + '_ {
        move |source| ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug)]
pub struct ArchiveFetcher {
    http: HttpFetcher,
}

impl ArchiveFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedArchive, NetworkError> {
        let span = info_span!("archive_fetch", url);
        async move {
            info!("starting download");
            let fetched_at = Utc::now();
            let started = Instant::now();
            let response = self.http.fetch_bytes(url).await?;
            let elapsed = started.elapsed();
            let byte_size = response.body.len() as u64;
            let content_hash = ArtifactStore::sha256_hex(&response.body);

            info!(
                download_bytes = byte_size,
                download_seconds = elapsed.as_secs_f64(),
                size = %hf_size(byte_size),
                sha256 = %content_hash,
                "download successful"
            );

            Ok(FetchedArchive {
                url: url.to_string(),
                final_url: response.final_url,
                fetched_at,
                bytes: response.body,
                byte_size,
                elapsed,
                content_hash,
            })
        }
        .instrument(span)
        .await
    }

    /// Unpack every entry of a zip payload into `destination`, overwriting
    /// same-named files so a re-run over the same archive is idempotent.
    pub fn extract(bytes: &[u8], destination: &Path) -> Result<Vec<FileDescriptor>, ArchiveError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
        std::fs::create_dir_all(destination).map_err(ArchiveError::io(destination))?;

        let mut files = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            let relative = entry
                .enclosed_name()
                .map(|p| p.to_path_buf())
                .ok_or_else(|| ArchiveError::UnsafeEntry {
                    name: entry.name().to_string(),
                })?;
            let target = destination.join(relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(ArchiveError::io(parent))?;
            }
            let mut out = std::fs::File::create(&target).map_err(ArchiveError::io(&target))?;
            std::io::copy(&mut entry, &mut out).map_err(ArchiveError::io(&target))?;
            files.push(FileDescriptor::from_path(target));
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            destination = %destination.display(),
            files = files.len(),
            "unpacked archive"
        );
        Ok(files)
    }

    /// Describe the files already present in `destination` without any network call.
    pub fn reconcile_existing(destination: &Path) -> Result<Vec<FileDescriptor>, ArchiveError> {
        let mut files = Vec::new();
        collect_staged_files(destination, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        info!(
            destination = %destination.display(),
            files = files.len(),
            "reconciled existing staging directory"
        );
        Ok(files)
    }
}

fn collect_staged_files(dir: &Path, out: &mut Vec<FileDescriptor>) -> Result<(), ArchiveError> {
    for entry in std::fs::read_dir(dir).map_err(ArchiveError::io(dir))? {
        let entry = entry.map_err(ArchiveError::io(dir))?;
        let path = entry.path();
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let file_type = entry.file_type().map_err(ArchiveError::io(&path))?;
        if file_type.is_dir() {
            collect_staged_files(&path, out)?;
        } else if file_type.is_file() {
            out.push(FileDescriptor::from_path(path));
        }
    }
    Ok(())
}

/// A staged file plus the sort key derived from its name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub name: String,
    pub sequence_key: u64,
}

impl FileDescriptor {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sequence_key = sequence_key(&name);
        Self {
            path,
            name,
            sequence_key,
        }
    }

    pub fn group_name(&self) -> &str {
        group_name(&self.name)
    }
}

/// First run of ASCII digits in `filename`, or 0 when there is none.
/// Runs too long for a u64 saturate.
pub fn sequence_key(filename: &str) -> u64 {
    let digits: String = filename
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    if digits.is_empty() {
        0
    } else {
        digits.parse().unwrap_or(u64::MAX)
    }
}

/// Segment of the filename before the first underscore.
pub fn group_name(filename: &str) -> &str {
    filename.split('_').next().unwrap_or(filename)
}

pub fn filter_by_suffix(files: Vec<FileDescriptor>, suffix: &str) -> Vec<FileDescriptor> {
    let before = files.len();
    let extension = format!(".{}", suffix.trim_start_matches('.'));
    let kept: Vec<_> = files
        .into_iter()
        .filter(|f| f.name.ends_with(&extension))
        .collect();
    debug!(suffix, filtered = before - kept.len(), "filtered files by suffix");
    kept
}

pub fn filter_by_prefix(files: Vec<FileDescriptor>, prefix: &str) -> Vec<FileDescriptor> {
    let before = files.len();
    let kept: Vec<_> = files.into_iter().filter(|f| f.name.contains(prefix)).collect();
    debug!(prefix, filtered = before - kept.len(), "filtered files by prefix");
    kept
}

/// Stable sort by sequence key; ties keep their input order in both directions.
pub fn order(mut files: Vec<FileDescriptor>, descending: bool) -> Vec<FileDescriptor> {
    if descending {
        files.sort_by(|a, b| b.sequence_key.cmp(&a.sequence_key));
    } else {
        files.sort_by_key(|f| f.sequence_key);
    }
    files
}

/// Group by [`group_name`]; each group is ordered newest-first.
pub fn group(files: Vec<FileDescriptor>) -> BTreeMap<String, Vec<FileDescriptor>> {
    let mut groups: BTreeMap<String, Vec<FileDescriptor>> = BTreeMap::new();
    for file in files {
        groups.entry(file.group_name().to_string()).or_default().push(file);
    }
    groups
        .into_iter()
        .map(|(name, members)| (name, order(members, true)))
        .collect()
}

/// Suffix + prefix filter followed by grouping, as configured for one source.
#[derive(Debug, Clone)]
pub struct FileSelector {
    pub prefix: String,
    pub suffix: String,
}

impl FileSelector {
    pub fn select(&self, files: Vec<FileDescriptor>) -> BTreeMap<String, Vec<FileDescriptor>> {
        let files = filter_by_suffix(files, &self.suffix);
        let files = filter_by_prefix(files, &self.prefix);
        group(files)
    }
}

/// Human friendly byte size, e.g. `299553704` -> `285.68 MB`.
pub fn hf_size(size_bytes: u64) -> String {
    const SUFFIXES: [&str; 9] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];
    if size_bytes == 0 {
        return "0B".to_string();
    }
    let mut scaled = size_bytes as f64;
    let mut index = 0;
    while scaled >= 1024.0 && index < SUFFIXES.len() - 1 {
        scaled /= 1024.0;
        index += 1;
    }
    let rounded = (scaled * 100.0).round() / 100.0;
    format!("{rounded} {}", SUFFIXES[index])
}
