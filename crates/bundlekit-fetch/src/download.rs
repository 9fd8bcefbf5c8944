use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bundlekit_core::{is_out_of_space, ArtifactIdentity, UpdateError};
use bundlekit_installer::{
    ensure_available_space, fsync_dir, partial_path_for, remove_path_if_exists, PARTIAL_SUFFIX,
};
use bundlekit_security::{digests_match, sha256_file_hex};
use reqwest::blocking::{Client, Response};
use reqwest::header::{CONTENT_RANGE, RANGE};
use tracing::{debug, info, warn};

use crate::client::network_error;
use crate::retry::{run_with_retry, RetryPolicy};

const COPY_BUFFER: usize = 64 * 1024;

pub trait ProgressObserver: Send + Sync {
    fn on_start(&self, label: &str, resumed_from: u64, total: Option<u64>);
    fn on_progress(&self, bytes: u64);
    fn on_finish(&self);
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub final_path: PathBuf,
    pub identity: ArtifactIdentity,
    pub expected_size: Option<u64>,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub cached: bool,
    pub resumed_from: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialDownload {
    pub path: PathBuf,
    pub identity: ArtifactIdentity,
    pub offset: u64,
    pub total: Option<u64>,
}

impl PartialDownload {
    pub fn inspect(final_path: &Path, identity: &ArtifactIdentity, total: Option<u64>) -> Self {
        let path = partial_path_for(final_path, identity);
        let offset = fs::metadata(&path).map(|metadata| metadata.len()).unwrap_or(0);
        Self {
            path,
            identity: identity.clone(),
            offset,
            total,
        }
    }

    pub fn remaining(&self) -> Option<u64> {
        self.total.map(|total| total.saturating_sub(self.offset))
    }
}

pub fn discard_stale_partials(dir: &Path, keep: &Path) -> Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
        let path = entry.path();
        if path == keep || !entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX) {
            continue;
        }
        info!(path = %path.display(), "discarding partial download for a different target");
        remove_path_if_exists(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
        removed += 1;
    }
    Ok(removed)
}

#[derive(Clone)]
pub struct FetchClient {
    client: Client,
    policy: RetryPolicy,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl FetchClient {
    pub fn new(client: Client, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// One GET of `url` into `dest`, starting at byte `start`.
    ///
    /// A server that answers a range request with anything but a matching 206
    /// makes the file restart from zero. Returns the bytes written by this call.
    pub fn fetch_range(&self, url: &str, dest: &Path, start: u64) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut request = self.client.get(url);
        if start > 0 {
            request = request.header(RANGE, format!("bytes={start}-"));
        }
        let response = request.send().map_err(|err| network_error(url, &err))?;
        let status = response.status().as_u16();

        let (append, total) = match status {
            206 if start > 0 => match content_range(&response) {
                Some((range_start, total)) if range_start == start => (true, total),
                other => {
                    warn!(url, expected = start, got = ?other, "server returned a mismatched range; restarting");
                    truncate(dest)?;
                    return Err(UpdateError::Network {
                        url: url.to_string(),
                        message: "mismatched Content-Range in partial response".to_string(),
                    }
                    .into());
                }
            },
            200 | 206 => {
                if start > 0 {
                    info!(url, offset = start, "server does not support resume; restarting download");
                }
                (false, response.content_length())
            }
            416 if start > 0 => {
                debug!(url, offset = start, "range not satisfiable; treating partial as complete");
                return Ok(0);
            }
            _ => {
                return Err(UpdateError::HttpStatus {
                    url: url.to_string(),
                    status,
                }
                .into());
            }
        };

        let mut file = if append {
            OpenOptions::new().append(true).open(dest)
        } else {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(dest)
        }
        .with_context(|| format!("failed to open {}", dest.display()))?;

        let offset = if append { start } else { 0 };
        if let Some(observer) = &self.observer {
            observer.on_start(url, offset, total);
        }
        let written = self.copy_body(url, response, &mut file, dest);
        if let Some(observer) = &self.observer {
            observer.on_finish();
        }
        let written = written?;
        file.sync_all()
            .with_context(|| format!("failed to sync {}", dest.display()))?;
        Ok(written)
    }

    pub fn fetch_verified(&self, request: &FetchRequest) -> Result<FetchedFile> {
        let final_path = &request.final_path;
        let expected = request.identity.sha256.as_str();
        let dir = final_path
            .parent()
            .with_context(|| format!("{} has no parent directory", final_path.display()))?;
        fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

        if final_path.is_file() {
            let actual = sha256_file_hex(final_path)?;
            if digests_match(&actual, expected) {
                debug!(path = %final_path.display(), "using cached download");
                return Ok(FetchedFile {
                    path: final_path.clone(),
                    size: fs::metadata(final_path).map(|m| m.len()).unwrap_or(0),
                    cached: true,
                    resumed_from: 0,
                });
            }
            warn!(
                label = %request.label,
                path = %final_path.display(),
                "cached copy is corrupted; re-fetching"
            );
            remove_path_if_exists(final_path)
                .with_context(|| format!("failed to remove {}", final_path.display()))?;
        }

        let partial = PartialDownload::inspect(final_path, &request.identity, request.expected_size);
        discard_stale_partials(dir, &partial.path)?;
        if let Some(remaining) = partial.remaining() {
            ensure_available_space(dir, remaining)?;
        }

        let resumed_from = partial.offset;
        if resumed_from > 0 {
            info!(label = %request.label, offset = resumed_from, "resuming partial download");
        }

        let mut verification_retry = false;
        loop {
            run_with_retry(&self.policy, &request.label, |_| {
                let start = fs::metadata(&partial.path).map(|m| m.len()).unwrap_or(0);
                self.fetch_range(&request.url, &partial.path, start)
            })?;

            let actual = sha256_file_hex(&partial.path)?;
            if digests_match(&actual, expected) {
                fs::rename(&partial.path, final_path).with_context(|| {
                    format!(
                        "failed to move {} to {}",
                        partial.path.display(),
                        final_path.display()
                    )
                })?;
                fsync_dir(dir)?;
                let size = fs::metadata(final_path).map(|m| m.len()).unwrap_or(0);
                debug!(label = %request.label, size, "download verified");
                return Ok(FetchedFile {
                    path: final_path.clone(),
                    size,
                    cached: false,
                    resumed_from,
                });
            }

            remove_path_if_exists(&partial.path)
                .with_context(|| format!("failed to remove {}", partial.path.display()))?;
            if verification_retry {
                return Err(UpdateError::ChecksumMismatch {
                    path: final_path.clone(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }
            warn!(
                label = %request.label,
                expected,
                actual = %actual,
                "download is corrupted; re-fetching from scratch"
            );
            verification_retry = true;
        }
    }

    pub fn get_text(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| network_error(url, &err))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(UpdateError::HttpStatus {
                url: url.to_string(),
                status,
            }
            .into());
        }
        response.text().map_err(|err| network_error(url, &err).into())
    }

    fn copy_body(&self, url: &str, mut response: Response, file: &mut File, dest: &Path) -> Result<u64> {
        let mut buffer = vec![0_u8; COPY_BUFFER];
        let mut written = 0_u64;
        loop {
            let read = response
                .read(&mut buffer)
                .map_err(|err| network_error(url, &err))?;
            if read == 0 {
                break;
            }
            if let Err(err) = file.write_all(&buffer[..read]) {
                if is_out_of_space(&err) {
                    return Err(UpdateError::DiskSpace {
                        path: dest.to_path_buf(),
                        detail: err.to_string(),
                    }
                    .into());
                }
                return Err(err).with_context(|| format!("failed to write {}", dest.display()));
            }
            written += read as u64;
            if let Some(observer) = &self.observer {
                observer.on_progress(read as u64);
            }
        }
        Ok(written)
    }
}

fn truncate(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).open(path) {
        Ok(file) => file
            .set_len(0)
            .with_context(|| format!("failed to truncate {}", path.display())),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("failed to open {}", path.display())),
    }
}

fn content_range(response: &Response) -> Option<(u64, Option<u64>)> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim();
    let (span, total) = range.split_once('/')?;
    let (start, _end) = span.split_once('-')?;
    let start = start.trim().parse().ok()?;
    let total = total.trim().parse().ok();
    Some((start, total))
}
