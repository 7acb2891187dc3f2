/// In-process vector sink for tests.
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{CollectionSpec, SinkError, StoragePoint, VectorSink};

/// Keeps upserted points per collection. Upserts replace points by id.
#[derive(Debug, Default)]
pub struct MemorySink {
    points: Mutex<BTreeMap<String, Vec<StoragePoint>>>,
    collections: Mutex<Vec<CollectionSpec>>,
    fail: bool,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every call fails with [`SinkError::Unavailable`].
    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Points stored in `collection`, in insertion order.
    #[must_use]
    pub fn points(&self, collection: &str) -> Vec<StoragePoint> {
        self.points
            .lock()
            .map(|p| p.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Collections created and not deleted.
    #[must_use]
    pub fn collections(&self) -> Vec<CollectionSpec> {
        self.collections
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    fn check(&self) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Unavailable("memory sink set to fail".to_string()));
        }
        Ok(())
    }
}

fn poisoned<T>(_: T) -> SinkError {
    SinkError::Unavailable("lock poisoned".to_string())
}

impl VectorSink for MemorySink {
    fn upsert_points(&self, collection: &str, points: &[StoragePoint]) -> Result<(), SinkError> {
        self.check()?;
        let mut stored = self.points.lock().map_err(poisoned)?;
        let existing = stored.entry(collection.to_string()).or_default();
        for point in points {
            match existing.iter_mut().find(|p| p.id == point.id) {
                Some(slot) => *slot = point.clone(),
                None => existing.push(point.clone()),
            }
        }
        Ok(())
    }

    fn create_collection(&self, spec: &CollectionSpec) -> Result<(), SinkError> {
        self.check()?;
        let mut collections = self.collections.lock().map_err(poisoned)?;
        collections.retain(|c| c.name != spec.name);
        collections.push(spec.clone());
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<(), SinkError> {
        self.check()?;
        self.collections
            .lock()
            .map_err(poisoned)?
            .retain(|c| c.name != name);
        self.points.lock().map_err(poisoned)?.remove(name);
        Ok(())
    }

    fn ping(&self) -> Result<(), SinkError> {
        self.check()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::Distance;

    fn point(id: &str, v: f32) -> StoragePoint {
        StoragePoint::new(Some(id.to_string()), "text", id, vec![v])
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let sink = MemorySink::new();
        sink.upsert_points("c", &[point("a", 1.0), point("b", 2.0)]).unwrap();
        sink.upsert_points("c", &[point("a", 3.0)]).unwrap();

        let stored = sink.points("c");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].vector, vec![3.0]);
        assert!(sink.points("other").is_empty());
    }

    #[test]
    fn test_create_and_delete_collection() {
        let sink = MemorySink::new();
        let spec = CollectionSpec {
            name: "c".to_string(),
            size: 4,
            distance: Distance::Dot,
        };
        sink.create_collection(&spec).unwrap();
        sink.upsert_points("c", &[point("a", 1.0)]).unwrap();
        assert_eq!(sink.collections(), vec![spec]);

        sink.delete_collection("c").unwrap();
        assert!(sink.collections().is_empty());
        assert!(sink.points("c").is_empty());
    }

    #[test]
    fn test_failing_sink() {
        let sink = MemorySink::failing();
        assert!(sink.ping().is_err());
        assert!(sink.upsert_points("c", &[point("a", 1.0)]).is_err());
    }
}
