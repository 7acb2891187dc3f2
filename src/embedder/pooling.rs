//! Vector extraction from a decoded batch.

use tracing::error;

use super::batch::BatchSlot;
use super::normalize::{Norm, normalize_into};
use super::{EmbedError, ExtractTarget};
use crate::engine::{InferenceEngine, Pooling, SeqId};

/// Flat, zero-initialised store for every vector of a run.
#[derive(Debug, Clone)]
pub struct EmbeddingBuffer {
    data: Vec<f32>,
    filled: Vec<bool>,
    n_embd: usize,
}

impl EmbeddingBuffer {
    /// Allocates `count` vectors of `n_embd` floats.
    #[must_use]
    pub fn new(count: usize, n_embd: usize) -> Self {
        Self {
            data: vec![0.0; count * n_embd],
            filled: vec![false; count],
            n_embd,
        }
    }

    /// Number of vectors the buffer holds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filled.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filled.is_empty()
    }

    #[must_use]
    pub fn n_embd(&self) -> usize {
        self.n_embd
    }

    /// Vector at `index`, whether or not it was extracted.
    #[must_use]
    pub fn vector(&self, index: usize) -> Option<&[f32]> {
        if index >= self.len() {
            return None;
        }
        let start = index * self.n_embd;
        Some(&self.data[start..start + self.n_embd])
    }

    /// Whether a vector was extracted into `index`.
    #[must_use]
    pub fn is_filled(&self, index: usize) -> bool {
        self.filled.get(index).copied().unwrap_or(false)
    }

    /// Number of extracted vectors.
    #[must_use]
    pub fn filled_count(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    /// The whole buffer as one flat slice.
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// Normalizes `raw` into slot `index`.
    fn store(
        &mut self,
        index: usize,
        raw: &[f32],
        norm: Norm,
        target: ExtractTarget,
    ) -> Result<(), EmbedError> {
        if raw.len() != self.n_embd {
            return Err(EmbedError::DimensionMismatch {
                target,
                expected: self.n_embd,
                got: raw.len(),
            });
        }
        if index >= self.len() {
            return Err(EmbedError::InvalidOptions(format!(
                "output index {index} outside embedding buffer of {}",
                self.len()
            )));
        }
        let start = index * self.n_embd;
        normalize_into(raw, &mut self.data[start..start + self.n_embd], norm);
        self.filled[index] = true;
        Ok(())
    }
}

/// Number of output slots a flush of `slot` with `n_seq` sequences consumes.
#[must_use]
pub fn flush_width(pooling: Pooling, slot: &BatchSlot, n_seq: usize) -> usize {
    if pooling.per_token() { slot.len() } else { n_seq }
}

/// Copies the vectors of the last decode into `output` starting at
/// `offset`, normalizing each one.
///
/// Per-token pooling writes the token at batch index `i` to
/// `offset + i`; every other mode writes sequence `s` to `offset + s`.
/// The first missing vector aborts the extraction; slots written before it
/// stay valid. Returns the number of slots this flush owns, see
/// [`flush_width`].
pub fn extract<E: InferenceEngine + ?Sized>(
    engine: &E,
    slot: &BatchSlot,
    n_seq: usize,
    norm: Norm,
    output: &mut EmbeddingBuffer,
    offset: usize,
) -> Result<usize, EmbedError> {
    let pooling = engine.pooling();

    if pooling.per_token() {
        for (i, _) in slot.logits().iter().enumerate().filter(|(_, l)| **l) {
            let target = ExtractTarget::Token(i);
            let Some(embd) = engine.token_embedding(i) else {
                error!("failed to get token embeddings for batch index {i}");
                return Err(EmbedError::ExtractionMissing(target));
            };
            output.store(offset + i, embd, norm, target)?;
        }
    } else {
        for s in 0..n_seq {
            let seq = SeqId::try_from(s).map_err(|_| {
                EmbedError::InvalidOptions(format!("sequence id {s} out of range"))
            })?;
            let target = ExtractTarget::Sequence(seq);
            let Some(embd) = engine.sequence_embedding(seq) else {
                error!("failed to get sequence embeddings for sequence {seq}");
                return Err(EmbedError::ExtractionMissing(target));
            };
            output.store(offset + s, embd, norm, target)?;
        }
    }

    Ok(flush_width(pooling, slot, n_seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::normalize::normalize;
    use crate::engine::mock::MockEngine;

    fn decoded(engine: &mut MockEngine, seqs: &[&[i32]]) -> (BatchSlot, usize) {
        let mut slot = BatchSlot::new(16, 1);
        for (s, tokens) in seqs.iter().enumerate() {
            slot.add_sequence(tokens, s as SeqId).unwrap();
        }
        engine.decode(&slot).unwrap();
        (slot, seqs.len())
    }

    #[test]
    fn test_buffer_starts_zeroed() {
        let buffer = EmbeddingBuffer::new(3, 4);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.as_slice(), &[0.0; 12]);
        assert!(!buffer.is_filled(0));
        assert_eq!(buffer.vector(3), None);
    }

    #[test]
    fn test_extract_per_sequence() {
        let mut engine = MockEngine::new(4);
        let (slot, n_seq) = decoded(&mut engine, &[&[1000, 1001], &[1002]]);
        let mut buffer = EmbeddingBuffer::new(2, 4);

        let width = extract(&engine, &slot, n_seq, Norm::Euclidean, &mut buffer, 0).unwrap();
        assert_eq!(width, 2);
        assert_eq!(buffer.filled_count(), 2);

        let expected = normalize(engine.sequence_embedding(1).unwrap(), Norm::Euclidean);
        assert_eq!(buffer.vector(1).unwrap(), expected.as_slice());
    }

    #[test]
    fn test_extract_per_token_at_offset() {
        let mut engine = MockEngine::new(3).with_pooling(Pooling::None);
        let (slot, n_seq) = decoded(&mut engine, &[&[1000, 1001], &[1002]]);
        let mut buffer = EmbeddingBuffer::new(5, 3);

        let width = extract(&engine, &slot, n_seq, Norm::None, &mut buffer, 2).unwrap();
        assert_eq!(width, 3);
        assert!(!buffer.is_filled(0));
        assert!(!buffer.is_filled(1));
        assert_eq!(buffer.vector(4).unwrap(), engine.token_embedding(2).unwrap());
    }

    #[test]
    fn test_extract_missing_sequence_keeps_earlier_rows() {
        let mut engine = MockEngine::new(4).with_missing_sequence(1);
        let (slot, n_seq) = decoded(&mut engine, &[&[1000], &[1001], &[1002]]);
        let mut buffer = EmbeddingBuffer::new(3, 4);

        let err = extract(&engine, &slot, n_seq, Norm::Euclidean, &mut buffer, 0).unwrap_err();
        assert!(matches!(
            err,
            EmbedError::ExtractionMissing(ExtractTarget::Sequence(1))
        ));
        assert!(buffer.is_filled(0));
        assert!(!buffer.is_filled(1));
        assert!(!buffer.is_filled(2));
    }

    #[test]
    fn test_extract_dimension_mismatch() {
        let mut engine = MockEngine::new(4);
        let (slot, n_seq) = decoded(&mut engine, &[&[1000]]);
        let mut buffer = EmbeddingBuffer::new(1, 8);

        let err = extract(&engine, &slot, n_seq, Norm::None, &mut buffer, 0).unwrap_err();
        assert!(matches!(
            err,
            EmbedError::DimensionMismatch {
                expected: 8,
                got: 4,
                ..
            }
        ));
    }

    #[test]
    fn test_flush_width() {
        let mut slot = BatchSlot::new(8, 1);
        slot.add_sequence(&[1, 2, 3], 0).unwrap();
        slot.add_sequence(&[4], 1).unwrap();
        assert_eq!(flush_width(Pooling::None, &slot, 2), 4);
        assert_eq!(flush_width(Pooling::Mean, &slot, 2), 2);
    }
}
