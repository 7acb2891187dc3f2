/// Configuration module for embed2vecdb.
///
/// Handles loading, validating, and providing default configuration values.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::embedder::normalize::Norm;
use crate::embedder::pipeline::EmbedOptions;
use crate::engine::Pooling;
use crate::sink::{CollectionSpec, Distance};

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

// ── Default value functions ──────────────────────────────────────────

fn default_n_batch() -> usize {
    2048
}

fn default_n_seq_max() -> usize {
    1
}

fn default_prompt_separator() -> String {
    "\n".to_string()
}

fn default_pair_separator() -> String {
    "\t".to_string()
}

fn default_true() -> bool {
    true
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models/multilingual-e5-small")
}

fn default_dimensions() -> usize {
    384
}

fn default_sep_token() -> Option<String> {
    Some("[SEP]".to_string())
}

fn default_qdrant_uri() -> String {
    "http://localhost:6333".to_string()
}

fn default_collection() -> String {
    "embeddings".to_string()
}

fn default_payload_key() -> String {
    "text".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

// ── Config structs ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub text: TextConfig,

    /// `-1` none, `0` max-absolute, `2` Euclidean, other `p > 0` p-norm.
    #[serde(default)]
    pub embed_norm: Norm,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub qdrant: QdrantConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BatchConfig {
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,

    #[serde(default = "default_n_seq_max")]
    pub n_seq_max: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TextConfig {
    #[serde(default = "default_prompt_separator")]
    pub prompt_separator: String,

    #[serde(default = "default_pair_separator")]
    pub pair_separator: String,

    #[serde(default = "default_true")]
    pub add_special: bool,

    #[serde(default = "default_true")]
    pub parse_special: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ModelConfig {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,

    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    #[serde(default)]
    pub pooling: Pooling,

    /// Intra-op threads, 0 for half the available cores.
    #[serde(default)]
    pub threads: usize,

    #[serde(default = "default_true")]
    pub token_type_ids: bool,

    #[serde(default = "default_sep_token")]
    pub sep_token: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos_token: Option<String>,

    /// Join rank pairs with the SEP/EOS token texts.
    #[serde(default = "default_true")]
    pub insert_pair_tokens: bool,

    /// Rerank prompt with `{query}` and `{document}` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_template: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct QdrantConfig {
    #[serde(default = "default_qdrant_uri")]
    pub uri: String,

    #[serde(default = "default_collection")]
    pub collection: String,

    #[serde(default)]
    pub distance: Distance,

    #[serde(default = "default_payload_key")]
    pub payload_key: String,

    #[serde(default)]
    pub create_collection: bool,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// ── Default impls ────────────────────────────────────────────────────

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            n_batch: default_n_batch(),
            n_seq_max: default_n_seq_max(),
        }
    }
}

impl Default for TextConfig {
    fn default() -> Self {
        Self {
            prompt_separator: default_prompt_separator(),
            pair_separator: default_pair_separator(),
            add_special: default_true(),
            parse_special: default_true(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: default_model_dir(),
            dimensions: default_dimensions(),
            pooling: Pooling::default(),
            threads: 0,
            token_type_ids: default_true(),
            sep_token: default_sep_token(),
            eos_token: None,
            insert_pair_tokens: default_true(),
            rerank_template: None,
        }
    }
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            uri: default_qdrant_uri(),
            collection: default_collection(),
            distance: Distance::default(),
            payload_key: default_payload_key(),
            create_collection: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

// ── Config implementation ────────────────────────────────────────────

impl Config {
    /// Load configuration from a JSON file.
    ///
    /// If `config_path` is empty, defaults to `"config.json"`.
    /// If the file does not exist, returns a default config and generates a
    /// template file for the default path only. An existing file that does
    /// not parse is an error.
    pub fn load(config_path: &str) -> Result<Self> {
        let path = if config_path.is_empty() {
            DEFAULT_CONFIG_PATH
        } else {
            config_path
        };

        if !Path::new(path).exists() {
            info!("{path} not found, using defaults");
            let cfg = Self::default();

            if path == DEFAULT_CONFIG_PATH {
                match cfg.save(path) {
                    Ok(()) => info!("Generated config template: {path}"),
                    Err(e) => warn!("Failed to generate config template: {e}"),
                }
            }

            return Ok(cfg);
        }

        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;

        let cfg: Config =
            serde_json::from_str(&data).with_context(|| format!("invalid config: {path}"))?;

        info!("Loaded configuration from {path}");
        Ok(cfg)
    }

    /// Save configuration to a JSON file.
    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("failed to marshal config")?;
        std::fs::write(path, data).with_context(|| format!("failed to write config: {path}"))?;
        Ok(())
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.batch.n_batch > 0, "batch.n_batch must be positive");
        anyhow::ensure!(self.batch.n_seq_max > 0, "batch.n_seq_max must be positive");
        anyhow::ensure!(
            !self.text.prompt_separator.is_empty(),
            "text.prompt_separator must not be empty"
        );
        anyhow::ensure!(
            !self.text.pair_separator.is_empty(),
            "text.pair_separator must not be empty"
        );
        anyhow::ensure!(
            self.model.dimensions > 0,
            "model.dimensions must be positive"
        );
        if let Some(template) = &self.model.rerank_template {
            anyhow::ensure!(
                template.contains("{query}") && template.contains("{document}"),
                "model.rerank_template needs {{query}} and {{document}} placeholders"
            );
        }
        anyhow::ensure!(
            !self.qdrant.collection.is_empty(),
            "qdrant.collection must not be empty"
        );
        anyhow::ensure!(
            !self.qdrant.payload_key.is_empty(),
            "qdrant.payload_key must not be empty"
        );
        anyhow::ensure!(self.qdrant.timeout_secs > 0, "qdrant.timeout_secs must be positive");
        Ok(())
    }

    /// Pipeline settings for one run.
    #[must_use]
    pub fn embed_options(&self) -> EmbedOptions {
        EmbedOptions {
            n_batch: self.batch.n_batch,
            n_seq_max: self.batch.n_seq_max,
            prompt_separator: self.text.prompt_separator.clone(),
            pair_separator: self.text.pair_separator.clone(),
            add_special: self.text.add_special,
            parse_special: self.text.parse_special,
            norm: self.embed_norm,
        }
    }

    /// Collection to create for vectors of `size` dimensions.
    #[must_use]
    pub fn collection_spec(&self, size: usize) -> CollectionSpec {
        CollectionSpec {
            name: self.qdrant.collection.clone(),
            size,
            distance: self.qdrant.distance,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
