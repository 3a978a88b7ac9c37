//! Configuration types for the chat runtime.

use crate::error::{ChatError, Result};
use crate::progress::CompletionWeighting;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// Model artifact selection.
    pub model: ModelConfig,
    /// Decoding parameters (process-wide, not per-request).
    pub generation: GenerationConfig,
    /// Worker timeout and supervision settings.
    pub worker: WorkerConfig,
    /// Persistence settings.
    pub store: StoreConfig,
}

/// Model artifact selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// HuggingFace repo ID for the GGUF model.
    pub model_id: String,
    /// Preferred quantized artifact, tried first.
    pub preferred_file: String,
    /// Default artifact used as the single fallback when the preferred
    /// artifact fails to load. A second failure is fatal.
    pub fallback_file: String,
    /// HuggingFace repo ID for the tokenizer. Leave empty to use the
    /// tokenizer bundled with the GGUF repo.
    pub tokenizer_id: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_id: "unsloth/gemma-3-1b-it-GGUF".to_owned(),
            preferred_file: "gemma-3-1b-it-Q4_K_M.gguf".to_owned(),
            fallback_file: "gemma-3-1b-it-Q8_0.gguf".to_owned(),
            tokenizer_id: "google/gemma-3-1b-it".to_owned(),
        }
    }
}

/// Decoding parameters applied to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum new tokens per reply.
    pub max_new_tokens: usize,
    /// Sampling temperature.
    pub temperature: f64,
    /// Top-p (nucleus) sampling threshold.
    pub top_p: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 128,
            temperature: 0.7,
            top_p: 0.8,
        }
    }
}

/// Worker timeout and supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Hard deadline for one request (load + generation), in seconds.
    pub generation_timeout_secs: u64,
    /// Liveness probe interval, in seconds.
    pub probe_interval_secs: u64,
    /// Consecutive unanswered probes before the worker is declared dead.
    pub missed_probe_limit: u32,
    /// How completed files weigh into the overall download percentage.
    pub completion_weighting: CompletionWeighting,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            generation_timeout_secs: 70,
            probe_interval_secs: 5,
            missed_probe_limit: 2,
            completion_weighting: CompletionWeighting::Retained,
        }
    }
}

/// Minimum allowed request deadline.
const MIN_GENERATION_TIMEOUT_SECS: u64 = 1;

impl WorkerConfig {
    /// Request deadline with a sanity floor.
    #[must_use]
    pub fn effective_timeout_secs(&self) -> u64 {
        if self.generation_timeout_secs < MIN_GENERATION_TIMEOUT_SECS {
            tracing::warn!(
                "worker.generation_timeout_secs={} too small, clamping to {}",
                self.generation_timeout_secs,
                MIN_GENERATION_TIMEOUT_SECS
            );
            return MIN_GENERATION_TIMEOUT_SECS;
        }
        self.generation_timeout_secs
    }

    /// Missed-probe limit, never below 1.
    #[must_use]
    pub fn effective_missed_probe_limit(&self) -> u32 {
        self.missed_probe_limit.max(1)
    }
}

/// Persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the conversation store and config.
    pub root_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root(),
        }
    }
}

/// Default root directory (`~/.wren`, falling back to a relative dir when
/// the home directory cannot be determined).
#[must_use]
pub fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".wren"))
        .unwrap_or_else(|| PathBuf::from(".wren"))
}

impl ChatConfig {
    /// Default config file path (`<root>/config.toml`).
    #[must_use]
    pub fn default_path() -> PathBuf {
        default_root().join("config.toml")
    }

    /// Load from a TOML file, or return defaults when the file is absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path)?;
        toml::from_str(&body)
            .map_err(|e| ChatError::Config(format!("invalid config {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[test]
    fn defaults_match_worker_contract() {
        let config = ChatConfig::default();
        assert_eq!(config.worker.generation_timeout_secs, 70);
        assert_eq!(config.worker.probe_interval_secs, 5);
        assert_eq!(config.worker.missed_probe_limit, 2);
        assert_eq!(config.generation.max_new_tokens, 128);
        assert!((config.generation.temperature - 0.7).abs() < f64::EPSILON);
        assert!((config.generation.top_p - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn effective_values_clamp_zeroes() {
        let worker = WorkerConfig {
            generation_timeout_secs: 0,
            missed_probe_limit: 0,
            ..WorkerConfig::default()
        };
        assert_eq!(worker.effective_timeout_secs(), 1);
        assert_eq!(worker.effective_missed_probe_limit(), 1);
    }

    #[test]
    fn load_or_default_on_missing_file() {
        let config = ChatConfig::load_or_default(Path::new("/nonexistent/wren/config.toml"))
            .expect("missing file should fall back to defaults");
        assert_eq!(config.model.model_id, ModelConfig::default().model_id);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[worker]\ngeneration_timeout_secs = 60\n").unwrap();
        let config = ChatConfig::load_or_default(&path).unwrap();
        assert_eq!(config.worker.generation_timeout_secs, 60);
        assert_eq!(config.worker.probe_interval_secs, 5);
    }

    #[test]
    fn invalid_toml_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let err = ChatConfig::load_or_default(&path).unwrap_err();
        assert!(err.to_string().contains("config error"));
    }
}
