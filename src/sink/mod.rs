/// Vector storage boundary.
///
/// A run's vectors become [`StoragePoint`]s and are handed to a
/// [`VectorSink`]. [`qdrant::QdrantSink`] talks to the Qdrant REST API;
/// [`memory::MemorySink`] keeps points in process for tests.
pub mod memory;
pub mod qdrant;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::embedder::pipeline::EmbeddingRun;

/// Errors that can occur while writing to a vector store.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    #[error("vector store rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("failed to serialize request: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid vector store uri: {0}")]
    InvalidUri(String),
}

/// One id/payload/vector triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePoint {
    pub id: String,
    pub payload: BTreeMap<String, serde_json::Value>,
    pub vector: Vec<f32>,
}

impl StoragePoint {
    /// Point with a single `{payload_key: text}` payload. A fresh UUID v4 is
    /// used when `id` is `None`.
    #[must_use]
    pub fn new(id: Option<String>, payload_key: &str, text: &str, vector: Vec<f32>) -> Self {
        let mut payload = BTreeMap::new();
        payload.insert(
            payload_key.to_string(),
            serde_json::Value::String(text.to_string()),
        );
        Self {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            payload,
            vector,
        }
    }
}

/// Vector similarity of a collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distance {
    Dot,
    #[default]
    Cosine,
    Euclid,
    Manhattan,
}

/// Parameters of a collection to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub size: usize,
    pub distance: Distance,
}

/// A store that persists embedding points.
pub trait VectorSink {
    /// Inserts or replaces `points` in `collection`.
    fn upsert_points(&self, collection: &str, points: &[StoragePoint]) -> Result<(), SinkError>;

    fn create_collection(&self, spec: &CollectionSpec) -> Result<(), SinkError>;

    fn delete_collection(&self, name: &str) -> Result<(), SinkError>;

    /// Checks that the store is reachable.
    fn ping(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One point per extracted vector of `run`, in buffer order.
///
/// `ids[k]` names the k-th point; points beyond the supplied ids get a
/// fresh UUID v4.
#[must_use]
pub fn build_points(run: &EmbeddingRun, payload_key: &str, ids: &[String]) -> Vec<StoragePoint> {
    run.vectors()
        .enumerate()
        .map(|(k, (item, vector))| {
            StoragePoint::new(
                ids.get(k).cloned(),
                payload_key,
                run.prompt_text(item),
                vector.to_vec(),
            )
        })
        .collect()
}

/// Upserts every vector of `run` into `collection`. Returns the number of
/// points written; nothing is sent for an empty run.
pub fn write_run<S: VectorSink + ?Sized>(
    sink: &S,
    run: &EmbeddingRun,
    collection: &str,
    payload_key: &str,
) -> Result<usize, SinkError> {
    let points = build_points(run, payload_key, &[]);
    if points.is_empty() {
        info!(collection, "no vectors to store");
        return Ok(0);
    }

    sink.upsert_points(collection, &points)?;
    info!(collection, points = points.len(), "points stored");
    Ok(points.len())
}
