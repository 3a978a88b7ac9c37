//! JSON file-backed key-value store for page-side state.
//!
//! The file lives under `<root_dir>/chat_store.json` so it is easy to
//! inspect and back up. Fixed keys: the serialized conversation and a flag
//! recording that the model has completed loading at least once (used to
//! skip the loading UI on a returning visit; the worker itself always
//! reloads).

use crate::conversation::Conversation;
use crate::error::{ChatError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Key holding the serialized conversation array.
pub const CONVERSATION_KEY: &str = "conversation";
/// Key holding the "model has loaded before" flag.
pub const MODEL_LOADED_KEY: &str = "model_loaded";

#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    #[must_use]
    pub fn new(root_dir: &Path) -> Self {
        Self {
            path: root_dir.join("chat_store.json"),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, serde_json::Value>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let body = std::fs::read_to_string(&self.path)?;
        serde_json::from_str(&body)
            .map_err(|e| ChatError::Store(format!("corrupt store {}: {e}", self.path.display())))
    }

    fn write_map(&self, map: &BTreeMap<String, serde_json::Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(map)
            .map_err(|e| ChatError::Store(format!("failed to serialize store: {e}")))?;
        std::fs::write(&self.path, body)?;
        Ok(())
    }

    /// Fetch and decode one key. `Ok(None)` when the key is absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let map = self.read_map()?;
        let Some(value) = map.get(key) else {
            return Ok(None);
        };
        let decoded = serde_json::from_value(value.clone())
            .map_err(|e| ChatError::Store(format!("invalid value for key {key:?}: {e}")))?;
        Ok(Some(decoded))
    }

    /// Encode and persist one key.
    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let mut map = self.read_map()?;
        let encoded = serde_json::to_value(value)
            .map_err(|e| ChatError::Store(format!("failed to encode key {key:?}: {e}")))?;
        map.insert(key.to_owned(), encoded);
        self.write_map(&map)
    }

    /// Load the persisted conversation; empty when never saved.
    pub fn load_conversation(&self) -> Result<Conversation> {
        Ok(self.get(CONVERSATION_KEY)?.unwrap_or_default())
    }

    pub fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.set(CONVERSATION_KEY, conversation)
    }

    /// Whether a model load has completed before on this machine.
    pub fn model_loaded(&self) -> Result<bool> {
        Ok(self.get(MODEL_LOADED_KEY)?.unwrap_or(false))
    }

    pub fn set_model_loaded(&self, loaded: bool) -> Result<()> {
        self.set(MODEL_LOADED_KEY, &loaded)
    }
}
