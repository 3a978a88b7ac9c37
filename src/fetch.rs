//! Model artifact downloading and caching via hf-hub.
//!
//! Byte-level download callbacks are converted into [`ProgressSignal`]s so
//! the worker can aggregate them and forward annotated progress events.

use crate::error::{ChatError, Result};
use crate::progress::{ProgressSignal, RecordStatus, SignalCallback};
use std::path::PathBuf;
use tracing::info;

/// Downloads and caches model artifacts.
pub struct ModelFetcher;

impl ModelFetcher {
    /// Check whether an artifact is already in the local hf-hub cache.
    #[must_use]
    pub fn is_cached(repo_id: &str, filename: &str) -> bool {
        hf_hub::Cache::default()
            .model(repo_id.to_owned())
            .get(filename)
            .is_some()
    }

    /// Get the path to an artifact, downloading it if necessary.
    ///
    /// A cached artifact short-circuits to an immediate `Done` signal.
    /// During a real download, every chunk emits a `Progress` record with
    /// the running percentage and byte count.
    ///
    /// Blocking; callers on an async runtime should wrap this in
    /// `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact cannot be downloaded.
    pub fn fetch(
        repo_id: &str,
        filename: &str,
        callback: Option<SignalCallback>,
    ) -> Result<PathBuf> {
        let cache = hf_hub::Cache::default();
        if let Some(path) = cache.model(repo_id.to_owned()).get(filename) {
            info!("{repo_id}/{filename} already cached");
            if let Some(cb) = &callback {
                cb(done_record(filename));
            }
            return Ok(path);
        }

        let api = hf_hub::api::sync::Api::new()
            .map_err(|e| ChatError::Model(format!("failed to create HF API: {e}")))?;

        if let Some(cb) = &callback {
            cb(ProgressSignal::Record {
                status: RecordStatus::Started,
                file: Some(filename.to_owned()),
                percent: None,
                loaded_bytes: None,
            });
        }

        let repo = api.model(repo_id.to_owned());
        let forwarder = ForwardingProgress::new(filename, callback.clone());
        let path = repo.download_with_progress(filename, forwarder).map_err(|e| {
            ChatError::Model(format!("failed to download {filename} from {repo_id}: {e}"))
        })?;

        if let Some(cb) = &callback {
            cb(done_record(filename));
        }

        Ok(path)
    }

    /// Best-effort artifact size via HTTP `HEAD` on the `resolve/main` URL.
    ///
    /// Returns `None` if the request fails or the server omits
    /// `content-length`; callers degrade gracefully.
    #[must_use]
    pub fn file_size_bytes(repo_id: &str, filename: &str) -> Option<u64> {
        let url = format!("https://huggingface.co/{repo_id}/resolve/main/{filename}");
        let resp = ureq::head(&url).call().ok()?;
        resp.header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
    }
}

fn done_record(filename: &str) -> ProgressSignal {
    ProgressSignal::Record {
        status: RecordStatus::Done,
        file: Some(filename.to_owned()),
        percent: None,
        loaded_bytes: None,
    }
}

/// Adapts hf-hub's byte-count progress into [`ProgressSignal`] records.
struct ForwardingProgress {
    file: String,
    total_bytes: usize,
    downloaded: usize,
    callback: Option<SignalCallback>,
}

impl ForwardingProgress {
    fn new(file: &str, callback: Option<SignalCallback>) -> Self {
        Self {
            file: file.to_owned(),
            total_bytes: 0,
            downloaded: 0,
            callback,
        }
    }

    fn emit(&self) {
        let Some(cb) = &self.callback else { return };
        let percent = if self.total_bytes == 0 {
            0.0
        } else {
            self.downloaded as f64 / self.total_bytes as f64 * 100.0
        };
        cb(ProgressSignal::Record {
            status: RecordStatus::Progress,
            file: Some(self.file.clone()),
            percent: Some(percent),
            loaded_bytes: Some(self.downloaded as u64),
        });
    }
}

impl hf_hub::api::Progress for ForwardingProgress {
    fn init(&mut self, size: usize, _filename: &str) {
        self.total_bytes = size;
        self.downloaded = 0;
        self.emit();
    }

    fn update(&mut self, size: usize) {
        self.downloaded += size;
        self.emit();
    }

    fn finish(&mut self) {
        // The fetch wrapper emits the terminal Done record so cached files
        // and real downloads share one code path.
    }
}
