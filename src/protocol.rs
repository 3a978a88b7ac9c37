//! Message contract between the page-side controller and the inference worker.
//!
//! Events are tagged by a `status` field so the serialized form matches the
//! wire table: `initiate`, `progress`, `fileLoaded`, `done`, `ready`,
//! `complete`, `error`, `heartbeat`.

use serde::{Deserialize, Serialize};

/// One generation result entry. `complete` events carry a sequence of these;
/// consumers read the first entry's `generated_text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    pub generated_text: String,
}

/// Events sent from the worker to the page side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum WorkerEvent {
    /// A model download cycle is starting.
    Initiate {
        file: String,
        progress: f64,
        overall: f64,
    },
    /// Incremental download progress for one file, annotated with the
    /// aggregated overall percentage.
    Progress {
        file: String,
        progress: f64,
        overall: f64,
        /// Human-readable size hint (e.g. `"12.5MB"`), when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<String>,
    },
    /// One artifact finished downloading.
    FileLoaded { file: String, overall: f64 },
    /// The whole load cycle finished.
    Done { file: String, overall: f64 },
    /// Model available; generation begins.
    Ready,
    /// Generation result for the current request.
    Complete { output: Vec<Generation> },
    /// Unrecoverable failure for this request.
    Error { message: String },
    /// Liveness probe reply.
    Heartbeat,
}

/// Requests sent from the page side to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WorkerRequest {
    /// Run one generation for the given prompt.
    Generate { text: String },
    /// Liveness probe.
    Heartbeat,
}
