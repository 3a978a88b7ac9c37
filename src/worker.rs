//! Background inference worker.
//!
//! One tokio task owns the pipeline and serves requests off an mpsc channel,
//! strictly one at a time. Per request:
//! `idle → initiate → (progress)* → ready → generating → complete | error`.
//! Every request runs under a hard deadline; when it fires, exactly one
//! `error` event is emitted and the in-flight future is dropped, so nothing
//! can late-fire for that request.

use crate::config::WorkerConfig;
use crate::error::{ChatError, Result};
use crate::pipeline::GenerationBackend;
use crate::progress::{
    ProgressSignal, ProgressTracker, ProgressUpdate, SignalCallback, UNATTRIBUTED_FILE,
};
use crate::protocol::{Generation, WorkerEvent, WorkerRequest};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Channel buffer sizes.
const REQUEST_CHANNEL_SIZE: usize = 8;
const EVENT_CHANNEL_SIZE: usize = 64;

/// Handle to a spawned worker: the request sender plus the task itself.
pub struct WorkerHandle {
    requests: mpsc::Sender<WorkerRequest>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Queue a request without blocking.
    ///
    /// # Errors
    ///
    /// Returns a channel error when the worker is gone or its queue is full.
    pub fn send(&self, request: WorkerRequest) -> Result<()> {
        self.requests
            .try_send(request)
            .map_err(|e| ChatError::Channel(format!("worker request channel: {e}")))
    }

    /// Whether the worker can still accept requests.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Tear the worker down. Pending work is dropped.
    pub fn terminate(self) {
        self.join.abort();
    }
}

/// Spawn a worker task over `backend`, returning its handle and event stream.
pub fn spawn(
    backend: Arc<dyn GenerationBackend>,
    config: &WorkerConfig,
) -> (WorkerHandle, mpsc::Receiver<WorkerEvent>) {
    let (request_tx, request_rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let config = config.clone();
    let join = tokio::spawn(run(backend, config, request_rx, event_tx));
    (
        WorkerHandle {
            requests: request_tx,
            join,
        },
        event_rx,
    )
}

async fn run(
    backend: Arc<dyn GenerationBackend>,
    config: WorkerConfig,
    mut requests: mpsc::Receiver<WorkerRequest>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let mut tracker = ProgressTracker::new(config.completion_weighting);
    let timeout_secs = config.effective_timeout_secs();
    // Prompts that arrived while a request was in flight. Concurrent
    // submission is not defined as safe for callers, but the worker still
    // serializes instead of dropping user input.
    let mut pending: VecDeque<String> = VecDeque::new();
    let mut closed = false;

    loop {
        let text = match pending.pop_front() {
            Some(text) => text,
            None => {
                if closed {
                    break;
                }
                match requests.recv().await {
                    None => break,
                    Some(WorkerRequest::Heartbeat) => {
                        let _ = events.send(WorkerEvent::Heartbeat).await;
                        continue;
                    }
                    Some(WorkerRequest::Generate { text }) => text,
                }
            }
        };

        let deadline = Duration::from_secs(timeout_secs);
        let request = tokio::time::timeout(
            deadline,
            serve_generate(backend.as_ref(), &mut tracker, &events, &text),
        );
        tokio::pin!(request);

        // Keep answering heartbeats while the request runs; probes and
        // generation are logically distinct handler invocations.
        let outcome = loop {
            tokio::select! {
                outcome = &mut request => break outcome,
                incoming = requests.recv(), if !closed => match incoming {
                    None => closed = true,
                    Some(WorkerRequest::Heartbeat) => {
                        let _ = events.send(WorkerEvent::Heartbeat).await;
                    }
                    Some(WorkerRequest::Generate { text }) => pending.push_back(text),
                },
            }
        };

        let event = match outcome {
            Ok(Ok(output)) => WorkerEvent::Complete {
                output: normalize_output(output),
            },
            Ok(Err(e)) => {
                warn!("request failed: {e}");
                WorkerEvent::Error {
                    message: e.to_string(),
                }
            }
            Err(_) => {
                warn!("request deadline elapsed after {timeout_secs}s");
                WorkerEvent::Error {
                    message: ChatError::Timeout(timeout_secs).to_string(),
                }
            }
        };
        let _ = events.send(event).await;
    }
    info!("worker request channel closed; shutting down");
}

/// Load the model if needed (streaming progress events), then generate.
async fn serve_generate(
    backend: &dyn GenerationBackend,
    tracker: &mut ProgressTracker,
    events: &mpsc::Sender<WorkerEvent>,
    text: &str,
) -> Result<Vec<Generation>> {
    if !backend.is_ready() {
        tracker.reset();
        let _ = events
            .send(WorkerEvent::Initiate {
                file: UNATTRIBUTED_FILE.to_owned(),
                progress: 0.0,
                overall: 0.0,
            })
            .await;

        // Download callbacks fire on blocking threads; bridge them through
        // an unbounded channel so sending is safe from any context.
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<ProgressSignal>();
        let callback: SignalCallback = Arc::new(move |signal| {
            let _ = signal_tx.send(signal);
        });

        let ready = backend.ensure_ready(Some(callback));
        tokio::pin!(ready);
        loop {
            tokio::select! {
                result = &mut ready => {
                    result?;
                    break;
                }
                Some(signal) = signal_rx.recv() => {
                    forward_signal(tracker, events, signal).await;
                }
            }
        }
        // Stragglers buffered before the last sender dropped.
        while let Ok(signal) = signal_rx.try_recv() {
            forward_signal(tracker, events, signal).await;
        }

        let _ = events
            .send(WorkerEvent::Done {
                file: UNATTRIBUTED_FILE.to_owned(),
                overall: 100.0,
            })
            .await;
        let _ = events.send(WorkerEvent::Ready).await;
    }

    backend.generate(text).await
}

async fn forward_signal(
    tracker: &mut ProgressTracker,
    events: &mpsc::Sender<WorkerEvent>,
    signal: ProgressSignal,
) {
    let update = signal.normalize();
    let overall = tracker.apply(&update);
    let event = match update {
        ProgressUpdate::Started { file } => WorkerEvent::Initiate {
            file,
            progress: 0.0,
            overall,
        },
        ProgressUpdate::Advanced {
            file,
            percent,
            loaded_bytes,
        } => WorkerEvent::Progress {
            file,
            progress: percent.clamp(0.0, 100.0),
            overall,
            total: loaded_bytes.map(format_megabytes),
        },
        ProgressUpdate::Finished { file } => WorkerEvent::FileLoaded { file, overall },
    };
    let _ = events.send(event).await;
}

fn format_megabytes(bytes: u64) -> String {
    format!("{:.1}MB", bytes as f64 / 1024.0 / 1024.0)
}

/// Guarantee `complete` events always carry usable text: an empty sequence
/// or blank text becomes a diagnostic string rather than a crash or an
/// empty bot message.
#[must_use]
pub fn normalize_output(output: Vec<Generation>) -> Vec<Generation> {
    let Some(first) = output.into_iter().next() else {
        return vec![Generation {
            generated_text: "No output generated".to_owned(),
        }];
    };
    if first.generated_text.trim().is_empty() {
        return vec![Generation {
            generated_text: "Received response in unexpected format: empty generated text"
                .to_owned(),
        }];
    }
    vec![first]
}
