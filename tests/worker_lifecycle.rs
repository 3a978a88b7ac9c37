//! Worker lifecycle integration tests over a stub backend.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wren::config::WorkerConfig;
use wren::pipeline::GenerationBackend;
use wren::progress::{ProgressSignal, RecordStatus, SignalCallback};
use wren::protocol::{Generation, WorkerEvent, WorkerRequest};
use wren::{ChatError, worker};

#[derive(Clone, Copy)]
enum Behavior {
    Reply,
    Hang,
    Malformed,
    FailLoad,
}

struct StubBackend {
    behavior: Behavior,
    emit_download_events: bool,
    ready: AtomicBool,
}

impl StubBackend {
    fn new(behavior: Behavior, emit_download_events: bool) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            emit_download_events,
            ready: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl GenerationBackend for StubBackend {
    async fn ensure_ready(&self, callback: Option<SignalCallback>) -> wren::Result<()> {
        if matches!(self.behavior, Behavior::FailLoad) {
            return Err(ChatError::Model("artifact missing".to_owned()));
        }
        if self.emit_download_events
            && let Some(cb) = callback
        {
            cb(ProgressSignal::Record {
                status: RecordStatus::Started,
                file: Some("weights.gguf".to_owned()),
                percent: None,
                loaded_bytes: None,
            });
            cb(ProgressSignal::Record {
                status: RecordStatus::Progress,
                file: Some("weights.gguf".to_owned()),
                percent: Some(50.0),
                loaded_bytes: Some(13_107_200),
            });
            cb(ProgressSignal::Record {
                status: RecordStatus::Done,
                file: Some("weights.gguf".to_owned()),
                percent: None,
                loaded_bytes: None,
            });
        }
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn generate(&self, prompt: &str) -> wren::Result<Vec<Generation>> {
        match self.behavior {
            Behavior::Reply => Ok(vec![Generation {
                generated_text: format!("echo: {prompt}"),
            }]),
            Behavior::Hang => std::future::pending().await,
            Behavior::Malformed => Ok(vec![]),
            Behavior::FailLoad => Err(ChatError::Generate("unreachable".to_owned())),
        }
    }
}

fn status_of(event: &WorkerEvent) -> &'static str {
    match event {
        WorkerEvent::Initiate { .. } => "initiate",
        WorkerEvent::Progress { .. } => "progress",
        WorkerEvent::FileLoaded { .. } => "fileLoaded",
        WorkerEvent::Done { .. } => "done",
        WorkerEvent::Ready => "ready",
        WorkerEvent::Complete { .. } => "complete",
        WorkerEvent::Error { .. } => "error",
        WorkerEvent::Heartbeat => "heartbeat",
    }
}

async fn collect_until_terminal(events: &mut tokio::sync::mpsc::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = matches!(
            event,
            WorkerEvent::Complete { .. } | WorkerEvent::Error { .. }
        );
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn first_request_emits_full_lifecycle() {
    let backend = StubBackend::new(Behavior::Reply, true);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "hi".into() })
        .unwrap();
    let seen = collect_until_terminal(&mut events).await;
    let statuses: Vec<_> = seen.iter().map(status_of).collect();
    assert_eq!(
        statuses,
        vec![
            "initiate",   // load cycle starting
            "initiate",   // weights.gguf registered
            "progress",
            "fileLoaded",
            "done",
            "ready",
            "complete",
        ]
    );

    match &seen[2] {
        WorkerEvent::Progress {
            file,
            progress,
            overall,
            total,
        } => {
            assert_eq!(file, "weights.gguf");
            assert!((progress - 50.0).abs() < 1e-9);
            assert!((overall - 50.0).abs() < 1e-9);
            assert_eq!(total.as_deref(), Some("12.5MB"));
        }
        other => panic!("expected progress event, got {other:?}"),
    }
    match seen.last().unwrap() {
        WorkerEvent::Complete { output } => {
            assert_eq!(output[0].generated_text, "echo: hi");
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn second_request_skips_loading() {
    let backend = StubBackend::new(Behavior::Reply, true);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "one".into() })
        .unwrap();
    collect_until_terminal(&mut events).await;

    handle
        .send(WorkerRequest::Generate { text: "two".into() })
        .unwrap();
    let seen = collect_until_terminal(&mut events).await;
    let statuses: Vec<_> = seen.iter().map(status_of).collect();
    assert_eq!(statuses, vec!["complete"]);
}

#[tokio::test(start_paused = true)]
async fn timeout_yields_exactly_one_error() {
    let backend = StubBackend::new(Behavior::Hang, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "hi".into() })
        .unwrap();
    let seen = collect_until_terminal(&mut events).await;
    let statuses: Vec<_> = seen.iter().map(status_of).collect();
    assert_eq!(statuses, vec!["initiate", "done", "ready", "error"]);
    match seen.last().unwrap() {
        WorkerEvent::Error { message } => {
            assert!(message.contains("timed out after 70s"), "got: {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    // No further events for that request: the next event must be the
    // heartbeat echo, not a late completion.
    handle.send(WorkerRequest::Heartbeat).unwrap();
    assert_eq!(events.recv().await, Some(WorkerEvent::Heartbeat));
}

#[tokio::test]
async fn malformed_output_becomes_diagnostic_complete() {
    let backend = StubBackend::new(Behavior::Malformed, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "hi".into() })
        .unwrap();
    let seen = collect_until_terminal(&mut events).await;
    match seen.last().unwrap() {
        WorkerEvent::Complete { output } => {
            assert_eq!(output[0].generated_text, "No output generated");
        }
        other => panic!("expected complete, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_echoes_before_any_generation() {
    let backend = StubBackend::new(Behavior::Reply, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle.send(WorkerRequest::Heartbeat).unwrap();
    assert_eq!(events.recv().await, Some(WorkerEvent::Heartbeat));
}

#[tokio::test(start_paused = true)]
async fn heartbeat_echoes_during_generation() {
    let backend = StubBackend::new(Behavior::Hang, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "hi".into() })
        .unwrap();
    // Drain the load-cycle events so the worker is mid-generation.
    for _ in 0..3 {
        events.recv().await.unwrap();
    }
    handle.send(WorkerRequest::Heartbeat).unwrap();
    assert_eq!(events.recv().await, Some(WorkerEvent::Heartbeat));
}

#[tokio::test]
async fn load_failure_is_an_error_and_worker_survives() {
    let backend = StubBackend::new(Behavior::FailLoad, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "hi".into() })
        .unwrap();
    let seen = collect_until_terminal(&mut events).await;
    match seen.last().unwrap() {
        WorkerEvent::Error { message } => {
            assert!(message.contains("artifact missing"), "got: {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }

    handle.send(WorkerRequest::Heartbeat).unwrap();
    assert_eq!(events.recv().await, Some(WorkerEvent::Heartbeat));
}

#[tokio::test]
async fn concurrent_generate_is_served_after_current() {
    let backend = StubBackend::new(Behavior::Reply, false);
    let (handle, mut events) = worker::spawn(backend, &WorkerConfig::default());

    handle
        .send(WorkerRequest::Generate { text: "one".into() })
        .unwrap();
    handle
        .send(WorkerRequest::Generate { text: "two".into() })
        .unwrap();

    let first = collect_until_terminal(&mut events).await;
    let second = collect_until_terminal(&mut events).await;
    match (first.last().unwrap(), second.last().unwrap()) {
        (WorkerEvent::Complete { output: a }, WorkerEvent::Complete { output: b }) => {
            assert_eq!(a[0].generated_text, "echo: one");
            assert_eq!(b[0].generated_text, "echo: two");
        }
        other => panic!("expected two completions, got {other:?}"),
    }
}
