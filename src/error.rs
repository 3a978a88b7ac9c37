//! Error types for the wren chat runtime.

/// Top-level error type for the chat runtime.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Model download or loading error (including a failed artifact fallback).
    #[error("model error: {0}")]
    Model(String),

    /// Text generation error.
    #[error("generation error: {0}")]
    Generate(String),

    /// A request did not complete within its deadline.
    #[error("operation timed out after {0}s")]
    Timeout(u64),

    /// Worker channel send/receive error, or a dead worker.
    #[error("channel error: {0}")]
    Channel(String),

    /// Structured failure reported by the worker for one request.
    #[error("worker error: {0}")]
    Worker(String),

    /// Conversation / flag persistence error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, ChatError>;
