// SPDX-FileCopyrightText: Copyright © 2020-2024 Serpent OS Developers
//
// SPDX-License-Identifier: MPL-2.0

//! The download executor: a pool of P workers draining a queue of
//! [`crate::sync::DownloadTask`]s, each retried with exponential
//! backoff on transport or checksum failure. Grounded on `request.rs`'s
//! streaming reqwest client and on `client::cache_packages`'s
//! `buffer_unordered(MAX_NETWORK_CONCURRENCY)` pattern, with retry and
//! cooperative cancellation added fresh (absent from the teacher).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::sync::DownloadTask;

/// Worker-pool tuning, mirroring the component design's `P`/`R`/backoff
/// parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    pub backoff_cap: Duration,
    /// `user:pass` HTTP Basic auth credentials for the repository.
    pub credentials: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        use crate::environment;
        Self {
            workers: environment::DOWNLOAD_WORKERS,
            max_retries: environment::DOWNLOAD_MAX_RETRIES,
            backoff_base: Duration::from_secs(environment::DOWNLOAD_BACKOFF_BASE_SECS),
            backoff_factor: environment::DOWNLOAD_BACKOFF_FACTOR,
            backoff_cap: Duration::from_secs(environment::DOWNLOAD_BACKOFF_CAP_SECS),
            credentials: None,
        }
    }
}

/// A single outcome of attempting to fetch one [`DownloadTask`].
#[derive(Debug)]
pub enum Outcome {
    Fetched { path: String },
    Failed { path: String, cause: Error },
}

/// A cooperative cancellation flag: checked between tasks and at each
/// chunk boundary within a task.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Run every task in `tasks` through the worker pool, writing completed
/// files under `staging_root` (mirroring the repository layout).
pub async fn run(
    tasks: Vec<DownloadTask>,
    staging_root: &Path,
    config: Config,
    cancel: CancelToken,
) -> Vec<Outcome> {
    let staging_root = staging_root.to_path_buf();

    let workers = config.workers;
    stream::iter(tasks.into_iter().map(|task| {
        let staging_root = staging_root.clone();
        let cancel = cancel.clone();
        let config = config.clone();
        async move {
            if cancel.is_cancelled() {
                return Outcome::Failed {
                    path: task.path.clone(),
                    cause: Error::Cancelled,
                };
            }
            match fetch_with_retry(&task, &staging_root, &config, &cancel).await {
                Ok(()) => Outcome::Fetched { path: task.path },
                Err(cause) => Outcome::Failed { path: task.path, cause },
            }
        }
    }))
    .buffer_unordered(workers)
    .collect()
    .await
}

async fn fetch_with_retry(
    task: &DownloadTask,
    staging_root: &Path,
    config: &Config,
    cancel: &CancelToken,
) -> Result<(), Error> {
    let mut delay = config.backoff_base;
    let mut attempt = 0;

    loop {
        match fetch_once(task, staging_root, config, cancel).await {
            Ok(()) => return Ok(()),
            Err(err) if attempt < config.max_retries => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay = (delay * config.backoff_factor).min(config.backoff_cap);
                log::warn!("retrying download of {} after {err} (attempt {attempt})", task.path);
            }
            Err(err) => return Err(err),
        }
    }
}

async fn fetch_once(task: &DownloadTask, staging_root: &Path, config: &Config, cancel: &CancelToken) -> Result<(), Error> {
    let target = staging_root.join(&task.path);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let url = Url::parse(&task.url).map_err(|_| Error::InvalidUrl(task.url.clone()))?;
    let mut request = reqwest::Client::new().get(url);
    if let Some(creds) = &config.credentials {
        let (user, pass) = creds.split_once(':').unwrap_or((creds.as_str(), ""));
        request = request.basic_auth(user, Some(pass));
    }
    let response = request.send().await?.error_for_status()?;

    let tmp_path = temp_sibling(&target);
    let mut file = fs::File::create(&tmp_path).await?;
    let mut hasher = Sha1::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if cancel.is_cancelled() {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::Cancelled);
        }
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }

    file.sync_all().await?;
    drop(file);

    if let Some(expected) = &task.expected_checksum {
        let actual = hex::encode(hasher.finalize());
        if &actual != expected {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(Error::ChecksumMismatch {
                path: task.path.clone(),
                expected: expected.clone(),
                actual,
            });
        }
    }

    fs::rename(&tmp_path, &target).await?;
    Ok(())
}

fn temp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("fetch")]
    Fetch(#[from] reqwest::Error),
    #[error("io")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("download cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = Config::default();
        let mut delay = config.backoff_base;
        for _ in 0..10 {
            delay = (delay * config.backoff_factor).min(config.backoff_cap);
        }
        assert_eq!(delay, config.backoff_cap);
    }

    #[test]
    fn cancel_token_observes_cancel() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn already_cancelled_pool_fails_every_task() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let tasks = vec![DownloadTask {
            path: "a".to_string(),
            url: "https://example.invalid/a".to_string(),
            expected_checksum: None,
        }];

        let outcomes = run(tasks, Path::new("/tmp/instl-test-staging"), Config::default(), cancel).await;
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], Outcome::Failed { .. }));
    }
}
