//! Wren: a local chat runtime built around a supervised inference worker.
//!
//! A page-side controller owns the conversation and forwards prompts to a
//! background worker over async channels. The worker lazily loads a GGUF
//! text-generation model (reporting multi-file download progress aggregated
//! into one overall percentage), runs one generation at a time under a hard
//! deadline, and reports completion or failure. A supervisor probes the
//! worker's liveness and tears it down when it stops responding, so a hung
//! worker surfaces as an error rather than a silent stall.
//!
//! # Architecture
//!
//! - **Controller** (page side): conversation state, persistence, event
//!   handling, markdown rendering.
//! - **Supervisor**: heartbeat probing, explicit liveness state machine,
//!   teardown-and-recreate.
//! - **Worker**: one background task owning the model singleton; events out,
//!   requests in, strictly one request at a time.
//! - **Pipeline**: GGUF inference via `mistralrs`, artifacts via `hf-hub`.

pub mod config;
pub mod controller;
pub mod conversation;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod progress;
pub mod protocol;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::ChatConfig;
pub use controller::{ChatController, LoadStatus};
pub use conversation::{ChatMessage, Conversation, Role};
pub use error::{ChatError, Result};
pub use pipeline::{GenerationBackend, TextPipeline};
pub use progress::{CompletionWeighting, ProgressSignal, ProgressTracker, ProgressUpdate};
pub use protocol::{Generation, WorkerEvent, WorkerRequest};
pub use supervisor::{Liveness, Supervisor};
