/// Qdrant REST client.
///
/// Uses the blocking `reqwest` client; every call is a single request with
/// no retries.
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder};
use serde::Serialize;
use tracing::{debug, info};

use super::{CollectionSpec, Distance, SinkError, StoragePoint, VectorSink};

#[derive(Serialize)]
struct UpsertBody<'a> {
    points: &'a [StoragePoint],
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: Distance,
}

#[derive(Serialize)]
struct CreateBody {
    vectors: VectorParams,
}

/// [`VectorSink`] backed by a Qdrant server.
pub struct QdrantSink {
    client: Client,
    base: String,
}

impl QdrantSink {
    /// Client for the server at `uri` (e.g. `http://localhost:6333`).
    pub fn new(uri: &str, timeout: Duration) -> Result<Self, SinkError> {
        let base = uri.trim_end_matches('/');
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(SinkError::InvalidUri(uri.to_string()));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SinkError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base: base.to_string(),
        })
    }

    #[must_use]
    pub fn base_uri(&self) -> &str {
        &self.base
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{name}", self.base)
    }

    fn points_url(&self, name: &str) -> String {
        format!("{}/collections/{name}/points", self.base)
    }

    fn send(&self, request: RequestBuilder, what: &str) -> Result<(), SinkError> {
        let resp = request
            .send()
            .map_err(|e| SinkError::Unavailable(format!("{what}: {e}")))?;

        let status = resp.status();
        debug!(status = status.as_u16(), "{what}");
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(SinkError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

fn upsert_body(points: &[StoragePoint]) -> Result<String, SinkError> {
    Ok(serde_json::to_string(&UpsertBody { points })?)
}

fn create_body(spec: &CollectionSpec) -> Result<String, SinkError> {
    Ok(serde_json::to_string(&CreateBody {
        vectors: VectorParams {
            size: spec.size,
            distance: spec.distance,
        },
    })?)
}

impl VectorSink for QdrantSink {
    fn upsert_points(&self, collection: &str, points: &[StoragePoint]) -> Result<(), SinkError> {
        let body = upsert_body(points)?;
        info!(collection, points = points.len(), "upserting points");
        self.send(
            self.client
                .put(self.points_url(collection))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body),
            "upsert points",
        )
    }

    fn create_collection(&self, spec: &CollectionSpec) -> Result<(), SinkError> {
        let body = create_body(spec)?;
        info!(
            collection = %spec.name,
            size = spec.size,
            distance = ?spec.distance,
            "creating collection"
        );
        self.send(
            self.client
                .put(self.collection_url(&spec.name))
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body),
            "create collection",
        )
    }

    fn delete_collection(&self, name: &str) -> Result<(), SinkError> {
        info!(collection = name, "deleting collection");
        self.send(self.client.delete(self.collection_url(name)), "delete collection")
    }

    fn ping(&self) -> Result<(), SinkError> {
        self.send(self.client.head(&self.base), "ping")
    }
}
