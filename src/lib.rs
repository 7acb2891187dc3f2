//! # embed2vecdb: text embeddings into a vector store
//!
//! Splits text into prompts, tokenizes them, packs them into capacity-bounded
//! batches, runs an embedding model over each batch, normalizes the pooled
//! or per-token vectors and writes them to Qdrant.
//!
//! ## Architecture
//!
//! - **[`config`]**: Configuration loading, validation, and defaults
//! - **[`text`]**: Prompt and rank-pair splitting
//! - **[`embedder`]**: Token encoding, batch assembly, extraction, normalization
//! - **[`engine`]**: Inference engine traits, ONNX Runtime engine, mock engine
//! - **[`sink`]**: Vector store boundary (Qdrant REST client, in-memory sink)

pub mod config;
pub mod embedder;
pub mod engine;
pub mod sink;
pub mod text;
