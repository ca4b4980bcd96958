use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::paths::AppPaths;
use crate::core::errors::CoreError;
use crate::rag::backend::VectorDbConfig;

/// Top-level configuration for the orchestration core, loaded from `config.yml`.
///
/// Every section has serde defaults so a missing or partial file still yields
/// a usable configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub backends: Vec<VectorDbConfig>,
}

/// OpenAI-compatible completion/embeddings endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_embeddings_model")]
    pub embeddings_model: String,
    /// When false the client buffers the full response and delivers it as a
    /// single token callback.
    #[serde(default = "default_true")]
    pub streaming: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: String::new(),
            model: String::new(),
            embeddings_model: default_embeddings_model(),
            streaming: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Upper bound on references returned per turn (topK).
    #[serde(default = "default_max_documents")]
    pub max_documents: usize,
    /// Aggregate ceiling across all backends for one retrieval step.
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
    /// What to do when a session has document tags but no enabled backend
    /// matches them.
    #[serde(default)]
    pub empty_backend_policy: EmptyBackendPolicy,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_documents: default_max_documents(),
            timeout_secs: default_retrieval_timeout(),
            empty_backend_policy: EmptyBackendPolicy::default(),
        }
    }
}

/// Policy for tagged sessions with no enabled backends: still issue a RAG
/// turn with an empty context block, or fall back to plain completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyBackendPolicy {
    #[default]
    Rag,
    Plain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Maximum chunk size in characters for document ingestion.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8553/v1".to_string()
}

fn default_embeddings_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_max_documents() -> usize {
    5
}

fn default_retrieval_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    500
}

fn default_true() -> bool {
    true
}

#[derive(Clone)]
pub struct ConfigService {
    paths: Arc<AppPaths>,
}

impl ConfigService {
    pub fn new(paths: Arc<AppPaths>) -> Self {
        Self { paths }
    }

    pub fn config_path(&self) -> PathBuf {
        if let Ok(path) = env::var("PARLEY_CONFIG_PATH") {
            return PathBuf::from(path);
        }

        let user_config = self.paths.user_data_dir.join("config.yml");
        if user_config.exists() {
            return user_config;
        }

        self.paths.project_root.join("config.yml")
    }

    /// Load the configuration, falling back to defaults when no file exists.
    pub fn load(&self) -> Result<CoreConfig, CoreError> {
        Self::load_from(&self.config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<CoreConfig, CoreError> {
        if !path.exists() {
            return Ok(CoreConfig::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| CoreError::Config(format!("failed to parse {}: {}", path.display(), e)))
    }
}
