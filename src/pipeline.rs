//! Text-generation pipeline over a local GGUF model.
//!
//! The model handle is a lazily-initialized singleton: the first caller pays
//! the download/load cost, every later caller reuses the handle. Concurrent
//! first calls share a single initialization future via `tokio::sync::OnceCell`.

use crate::config::{GenerationConfig, ModelConfig};
use crate::error::{ChatError, Result};
use crate::fetch::ModelFetcher;
use crate::progress::{ProgressSignal, SignalCallback};
use crate::protocol::Generation;
use mistralrs::{
    ChatCompletionResponse, GgufModelBuilder, Model, RequestBuilder, TextMessageRole, TextMessages,
};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

/// A backend that can lazily load a model and run one generation at a time.
///
/// The worker only speaks to this trait; tests drive it with stub backends.
#[async_trait::async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Ensure the model is loaded, reporting download progress to `callback`.
    async fn ensure_ready(&self, callback: Option<SignalCallback>) -> Result<()>;

    /// Whether the model handle has already been constructed.
    fn is_ready(&self) -> bool;

    /// Run one generation with the process-wide decoding parameters.
    async fn generate(&self, prompt: &str) -> Result<Vec<Generation>>;
}

/// Local GGUF pipeline backed by mistralrs.
pub struct TextPipeline {
    model_config: ModelConfig,
    generation: GenerationConfig,
    model: OnceCell<Arc<Model>>,
}

impl TextPipeline {
    #[must_use]
    pub fn new(model_config: ModelConfig, generation: GenerationConfig) -> Self {
        Self {
            model_config,
            generation,
            model: OnceCell::new(),
        }
    }

    /// Build the model handle: preferred artifact first, the default
    /// artifact as a single fallback, a second failure is fatal.
    async fn build(&self, callback: Option<SignalCallback>) -> Result<Arc<Model>> {
        let preferred = self.model_config.preferred_file.clone();
        match self.load_artifact(&preferred, callback.clone()).await {
            Ok(model) => Ok(model),
            Err(e) => {
                let fallback = self.model_config.fallback_file.clone();
                warn!("preferred artifact {preferred} failed ({e}); falling back to {fallback}");
                self.load_artifact(&fallback, callback).await.map_err(|e2| {
                    ChatError::Model(format!("fallback artifact {fallback} also failed: {e2}"))
                })
            }
        }
    }

    async fn load_artifact(
        &self,
        filename: &str,
        callback: Option<SignalCallback>,
    ) -> Result<Arc<Model>> {
        let repo_id = self.model_config.model_id.clone();
        let file = filename.to_owned();
        let fetch_callback = callback.clone();

        if let Some(size) = ModelFetcher::file_size_bytes(&repo_id, &file) {
            info!("artifact {repo_id}/{file} is {:.1}MB", size as f64 / 1024.0 / 1024.0);
        }

        // hf-hub is blocking; keep the runtime responsive during the download.
        let path = tokio::task::spawn_blocking(move || {
            ModelFetcher::fetch(&repo_id, &file, fetch_callback)
        })
        .await
        .map_err(|e| ChatError::Model(format!("download task failed: {e}")))??;
        info!("artifact ready at {}", path.display());

        let mut builder =
            GgufModelBuilder::new(&self.model_config.model_id, vec![filename.to_owned()])
                .with_logging();
        if !self.model_config.tokenizer_id.is_empty() {
            builder = builder.with_tok_model_id(&self.model_config.tokenizer_id);
        }

        let model = builder
            .build()
            .await
            .map_err(|e| ChatError::Model(format!("model build failed: {e}")))?;

        // The builder phase has no per-file callbacks; report it as a bare
        // completed fraction for the unattributed "model" entry.
        if let Some(cb) = callback {
            cb(ProgressSignal::Fraction(1.0));
        }

        info!("pipeline loaded");
        Ok(Arc::new(model))
    }
}

#[async_trait::async_trait]
impl GenerationBackend for TextPipeline {
    async fn ensure_ready(&self, callback: Option<SignalCallback>) -> Result<()> {
        self.model
            .get_or_try_init(|| self.build(callback))
            .await
            .map(|_| ())
    }

    fn is_ready(&self) -> bool {
        self.model.initialized()
    }

    async fn generate(&self, prompt: &str) -> Result<Vec<Generation>> {
        let model = self
            .model
            .get()
            .ok_or_else(|| ChatError::Model("pipeline not initialized".to_owned()))?;

        let messages = TextMessages::new().add_message(TextMessageRole::User, prompt);
        // Sampling is enabled by setting temperature/top-p; these are
        // process-wide parameters, never per-request options.
        let request = RequestBuilder::from(messages)
            .set_sampler_temperature(self.generation.temperature)
            .set_sampler_topp(self.generation.top_p)
            .set_sampler_max_len(self.generation.max_new_tokens);

        let response = model
            .send_chat_request(request)
            .await
            .map_err(|e| ChatError::Generate(format!("chat request failed: {e}")))?;

        Ok(vec![Generation {
            generated_text: extract_text(&response),
        }])
    }
}

/// Reduce a chat response to plain text, degrading to a diagnostic string
/// for unexpected shapes instead of failing the request.
fn extract_text(response: &ChatCompletionResponse) -> String {
    let Some(choice) = response.choices.first() else {
        return "No output generated".to_owned();
    };
    match choice.message.content.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => text.to_owned(),
        _ => "Received response in unexpected format: empty assistant message".to_owned(),
    }
}
