//! Page-side chat controller.
//!
//! Owns the conversation, the persistence store, and the worker supervisor.
//! `send` appends and forwards a prompt; `await_reply` pumps worker events
//! (interleaved with liveness probes) until the request terminates.

use crate::config::ChatConfig;
use crate::conversation::Conversation;
use crate::error::{ChatError, Result};
use crate::pipeline::{GenerationBackend, TextPipeline};
use crate::protocol::WorkerEvent;
use crate::store::KvStore;
use crate::supervisor::{BackendFactory, Liveness, Supervisor};
use crate::worker;
use pulldown_cmark::{Event as MarkdownEvent, Parser, Tag, TagEnd};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::info;

/// Snapshot of the model-load progress, for rendering.
#[derive(Debug, Clone, Default)]
pub struct LoadStatus {
    /// File currently downloading.
    pub file: String,
    /// Percent for that file.
    pub progress: f64,
    /// Aggregated overall percent.
    pub overall: f64,
    /// Whether the model is ready to generate.
    pub ready: bool,
}

/// Chat controller: conversation + persistence + supervised worker.
pub struct ChatController {
    supervisor: Supervisor,
    events: Option<mpsc::Receiver<WorkerEvent>>,
    store: KvStore,
    conversation: Conversation,
    load_status: LoadStatus,
    last_error: Option<String>,
    model_previously_loaded: bool,
    probe_interval: Duration,
}

impl ChatController {
    /// Build a controller over the real mistralrs pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub fn new(config: ChatConfig) -> Result<Self> {
        let model = config.model.clone();
        let generation = config.generation.clone();
        let factory: BackendFactory = Arc::new(move || {
            Arc::new(TextPipeline::new(model.clone(), generation.clone()))
                as Arc<dyn GenerationBackend>
        });
        Self::with_backend_factory(config, factory)
    }

    /// Build a controller over an arbitrary backend factory (test seam).
    ///
    /// # Errors
    ///
    /// Returns an error if persisted state cannot be read.
    pub fn with_backend_factory(config: ChatConfig, factory: BackendFactory) -> Result<Self> {
        let store = KvStore::new(&config.store.root_dir);
        let conversation = store.load_conversation()?;
        let model_previously_loaded = store.model_loaded()?;
        if !conversation.is_empty() {
            info!("restored {} persisted messages", conversation.len());
        }
        let probe_interval = Duration::from_secs(config.worker.probe_interval_secs.max(1));
        Ok(Self {
            supervisor: Supervisor::new(config.worker, factory),
            events: None,
            store,
            conversation,
            load_status: LoadStatus::default(),
            last_error: None,
            model_previously_loaded,
            probe_interval,
        })
    }

    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    #[must_use]
    pub fn load_status(&self) -> &LoadStatus {
        &self.load_status
    }

    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    #[must_use]
    pub fn liveness(&self) -> Liveness {
        self.supervisor.liveness()
    }

    /// Whether the loading UI can be skipped because a load completed on a
    /// previous visit. The worker itself still reloads.
    #[must_use]
    pub fn skip_loading_ui(&self) -> bool {
        self.model_previously_loaded
    }

    /// Append the user message, persist it, and forward the prompt to the
    /// worker (spawning or respawning one as needed).
    ///
    /// # Errors
    ///
    /// Returns an error if persistence or the channel send fails.
    pub fn send(&mut self, text: &str) -> Result<()> {
        if let Some(events) = self.supervisor.ensure_worker() {
            // A fresh worker invalidates any stream from a dead instance.
            self.events = Some(events);
        }
        self.conversation.push_user(text);
        self.store.save_conversation(&self.conversation)?;
        self.supervisor.send_generate(text.to_owned())
    }

    /// Pump events until the outstanding request completes, running liveness
    /// probes in between. `on_progress` observes every load-status change.
    ///
    /// On success the bot reply is appended, persisted, and returned.
    ///
    /// # Errors
    ///
    /// Returns a worker error for a failed request (conversation unaffected)
    /// or a channel error when the worker dies.
    pub async fn await_reply<F>(&mut self, mut on_progress: F) -> Result<String>
    where
        F: FnMut(&LoadStatus),
    {
        let Some(mut events) = self.events.take() else {
            return Err(ChatError::Channel("worker not running".to_owned()));
        };
        let mut ticker = tokio::time::interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; consume it so probes start one
        // full interval from now.
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(message) = self.supervisor.probe_tick() {
                        break Err(ChatError::Channel(message));
                    }
                }
                event = events.recv() => {
                    match event {
                        None => {
                            self.supervisor.fail("worker event channel closed");
                            break Err(ChatError::Channel(
                                "worker died: event channel closed".to_owned(),
                            ));
                        }
                        Some(WorkerEvent::Heartbeat) => self.supervisor.note_echo(),
                        Some(event) => match self.apply_event(event, &mut on_progress) {
                            Ok(Some(reply)) => break Ok(reply),
                            Ok(None) => {}
                            Err(e) => break Err(e),
                        },
                    }
                }
            }
        };

        if self.supervisor.liveness() == Liveness::Alive {
            self.events = Some(events);
        }
        if let Err(e) = &outcome {
            self.last_error = Some(e.to_string());
        }
        outcome
    }

    /// Apply one worker event. Returns the bot reply on `complete`.
    fn apply_event<F>(&mut self, event: WorkerEvent, on_progress: &mut F) -> Result<Option<String>>
    where
        F: FnMut(&LoadStatus),
    {
        match event {
            WorkerEvent::Initiate {
                file,
                progress,
                overall,
            }
            | WorkerEvent::Progress {
                file,
                progress,
                overall,
                ..
            } => {
                self.load_status = LoadStatus {
                    file,
                    progress,
                    overall,
                    ready: false,
                };
                on_progress(&self.load_status);
            }
            WorkerEvent::FileLoaded { file, overall } => {
                self.load_status = LoadStatus {
                    file,
                    progress: 100.0,
                    overall,
                    ready: false,
                };
                on_progress(&self.load_status);
            }
            WorkerEvent::Done { file, overall } => {
                self.load_status = LoadStatus {
                    file,
                    progress: 100.0,
                    overall,
                    ready: false,
                };
                on_progress(&self.load_status);
            }
            WorkerEvent::Ready => {
                self.load_status.ready = true;
                if !self.model_previously_loaded {
                    self.store.set_model_loaded(true)?;
                    self.model_previously_loaded = true;
                }
                on_progress(&self.load_status);
            }
            WorkerEvent::Complete { output } => {
                let text = worker::normalize_output(output)
                    .into_iter()
                    .next()
                    .map(|g| g.generated_text)
                    .unwrap_or_else(|| "No output generated".to_owned());
                self.conversation.push_bot(&text);
                self.store.save_conversation(&self.conversation)?;
                self.last_error = None;
                return Ok(Some(text));
            }
            WorkerEvent::Error { message } => {
                return Err(ChatError::Worker(message));
            }
            WorkerEvent::Heartbeat => {}
        }
        Ok(None)
    }
}

/// Render markdown to plain terminal text: inline markup is stripped, block
/// boundaries become newlines. Unknown constructs pass through as their
/// literal text.
#[must_use]
pub fn render_plain(markdown: &str) -> String {
    let mut out = String::new();
    for event in Parser::new(markdown) {
        match event {
            MarkdownEvent::Text(text) | MarkdownEvent::Code(text) => out.push_str(&text),
            MarkdownEvent::SoftBreak | MarkdownEvent::HardBreak => out.push('\n'),
            MarkdownEvent::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::Item) => {
                out.push('\n');
            }
            MarkdownEvent::End(TagEnd::CodeBlock) => out.push('\n'),
            MarkdownEvent::Start(Tag::Item) => out.push_str("- "),
            _ => {}
        }
    }
    out.trim_end().to_owned()
}
