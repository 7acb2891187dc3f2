//! Batch slot and the two-limit batch assembler.
//!
//! A [`BatchSlot`] is allocated once with room for `n_batch` tokens and is
//! logically cleared between flushes. The [`BatchAssembler`] packs whole
//! sequences into it and flushes whenever the next sequence would exceed the
//! token capacity or the slot already holds `n_seq_max` sequences.

use tracing::{debug, warn};

use super::EmbedError;
use crate::engine::{SeqId, TokenId};

/// Fixed-capacity token buffer handed to the inference engine.
#[derive(Debug, Clone)]
pub struct BatchSlot {
    token: Vec<TokenId>,
    pos: Vec<i32>,
    seq_id: Vec<Vec<SeqId>>,
    logits: Vec<bool>,
    n_tokens: usize,
}

impl BatchSlot {
    /// Allocates storage for `capacity` tokens, each carrying up to
    /// `n_seq_per_token` sequence ids without reallocating.
    #[must_use]
    pub fn new(capacity: usize, n_seq_per_token: usize) -> Self {
        Self {
            token: vec![0; capacity],
            pos: vec![0; capacity],
            seq_id: (0..capacity)
                .map(|_| Vec::with_capacity(n_seq_per_token.max(1)))
                .collect(),
            logits: vec![false; capacity],
            n_tokens: 0,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.token.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.n_tokens
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.n_tokens == 0
    }

    /// Resets the token count; backing storage is kept.
    pub fn clear(&mut self) {
        self.n_tokens = 0;
    }

    /// Appends one token.
    pub fn add(
        &mut self,
        token: TokenId,
        pos: i32,
        seq_ids: &[SeqId],
        logits: bool,
    ) -> Result<(), EmbedError> {
        if self.n_tokens >= self.capacity() {
            return Err(EmbedError::BatchFull {
                capacity: self.capacity(),
            });
        }
        if seq_ids.is_empty() {
            return Err(EmbedError::InvalidOptions(
                "a batch token needs at least one sequence id".to_string(),
            ));
        }

        let i = self.n_tokens;
        self.token[i] = token;
        self.pos[i] = pos;
        self.seq_id[i].clear();
        self.seq_id[i].extend_from_slice(seq_ids);
        self.logits[i] = logits;
        self.n_tokens += 1;

        Ok(())
    }

    /// Appends a whole sequence at positions `0..tokens.len()`, every token
    /// tagged with `seq` and flagged for output. Nothing is written if the
    /// sequence does not fit.
    pub fn add_sequence(&mut self, tokens: &[TokenId], seq: SeqId) -> Result<(), EmbedError> {
        if self.n_tokens + tokens.len() > self.capacity() {
            return Err(EmbedError::BatchFull {
                capacity: self.capacity(),
            });
        }
        for (pos, &token) in (0i32..).zip(tokens) {
            self.add(token, pos, &[seq], true)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn tokens(&self) -> &[TokenId] {
        &self.token[..self.n_tokens]
    }

    #[must_use]
    pub fn positions(&self) -> &[i32] {
        &self.pos[..self.n_tokens]
    }

    #[must_use]
    pub fn logits(&self) -> &[bool] {
        &self.logits[..self.n_tokens]
    }

    /// Sequence ids of the token at `i`.
    #[must_use]
    pub fn seq_ids(&self, i: usize) -> &[SeqId] {
        if i < self.n_tokens {
            &self.seq_id[i]
        } else {
            &[]
        }
    }

    /// First sequence id of the token at `i`.
    #[must_use]
    pub fn primary_seq_id(&self, i: usize) -> Option<SeqId> {
        self.seq_ids(i).first().copied()
    }
}

/// Summary of one [`BatchAssembler::assemble`] call.
#[derive(Debug, Default)]
pub struct AssemblyReport {
    pub flushes: usize,
    /// Inputs that could never fit a batch, by input index.
    pub rejected: Vec<(usize, EmbedError)>,
}

/// Packs token sequences into [`BatchSlot`]s under a token and a sequence
/// limit.
pub struct BatchAssembler {
    slot: BatchSlot,
    n_batch: usize,
    n_seq_max: usize,
    n_seq: usize,
}

impl BatchAssembler {
    #[must_use]
    pub fn new(n_batch: usize, n_seq_max: usize) -> Self {
        Self {
            slot: BatchSlot::new(n_batch, 1),
            n_batch,
            n_seq_max,
            n_seq: 0,
        }
    }

    #[must_use]
    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    #[must_use]
    pub fn n_seq_max(&self) -> usize {
        self.n_seq_max
    }

    /// Feeds `inputs` through the slot, calling `flush(slot, n_seq)` for
    /// every full batch and once more for the final partial one.
    ///
    /// Sequences longer than `n_batch` (and empty ones) are skipped and
    /// listed in the report. An error from `flush` stops assembly.
    pub fn assemble<'s, I, F>(
        &mut self,
        inputs: I,
        mut flush: F,
    ) -> Result<AssemblyReport, EmbedError>
    where
        I: IntoIterator<Item = &'s [TokenId]>,
        F: FnMut(&BatchSlot, usize) -> Result<(), EmbedError>,
    {
        let mut report = AssemblyReport::default();
        self.reset();

        for (index, seq) in inputs.into_iter().enumerate() {
            let n_toks = seq.len();

            if n_toks == 0 {
                warn!(input = index, "skipping empty token sequence");
                report.rejected.push((index, EmbedError::EmptyInput));
                continue;
            }
            if n_toks > self.n_batch {
                let err = EmbedError::InputTooLarge {
                    tokens: n_toks,
                    n_batch: self.n_batch,
                };
                warn!(input = index, "{err}");
                report.rejected.push((index, err));
                continue;
            }

            // encode if at capacity
            if self.slot.len() + n_toks > self.n_batch || self.n_seq >= self.n_seq_max {
                self.flush_slot(&mut flush)?;
                report.flushes += 1;
            }

            let seq_id = SeqId::try_from(self.n_seq).map_err(|_| {
                EmbedError::InvalidOptions(format!("sequence id {} out of range", self.n_seq))
            })?;
            self.slot.add_sequence(seq, seq_id)?;
            self.n_seq += 1;
        }

        if !self.slot.is_empty() {
            self.flush_slot(&mut flush)?;
            report.flushes += 1;
        }

        Ok(report)
    }

    fn flush_slot<F>(&mut self, flush: &mut F) -> Result<(), EmbedError>
    where
        F: FnMut(&BatchSlot, usize) -> Result<(), EmbedError>,
    {
        debug!(n_tokens = self.slot.len(), n_seq = self.n_seq, "flushing batch");
        let result = flush(&self.slot, self.n_seq);
        self.reset();
        result
    }

    fn reset(&mut self) {
        self.slot.clear();
        self.n_seq = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    /// Records `(n_tokens, distinct seq ids, n_seq)` for every flush.
    fn collect_flushes(
        assembler: &mut BatchAssembler,
        inputs: &[Vec<TokenId>],
    ) -> (Vec<(usize, usize, usize)>, AssemblyReport) {
        let mut flushes = Vec::new();
        let report = assembler
            .assemble(inputs.iter().map(Vec::as_slice), |slot, n_seq| {
                let ids: BTreeSet<SeqId> = (0..slot.len())
                    .filter_map(|i| slot.primary_seq_id(i))
                    .collect();
                flushes.push((slot.len(), ids.len(), n_seq));
                Ok(())
            })
            .unwrap();
        (flushes, report)
    }

    #[test]
    fn test_slot_add_and_clear() {
        let mut slot = BatchSlot::new(4, 1);
        slot.add_sequence(&[10, 11, 12], 0).unwrap();
        assert_eq!(slot.len(), 3);
        assert_eq!(slot.tokens(), &[10, 11, 12]);
        assert_eq!(slot.positions(), &[0, 1, 2]);
        assert_eq!(slot.seq_ids(2), &[0]);
        assert!(slot.logits().iter().all(|&l| l));

        slot.clear();
        assert!(slot.is_empty());
        assert_eq!(slot.capacity(), 4);
        assert!(slot.tokens().is_empty());
    }

    #[test]
    fn test_slot_rejects_overflow_without_partial_write() {
        let mut slot = BatchSlot::new(4, 1);
        slot.add_sequence(&[1, 2, 3], 0).unwrap();
        let err = slot.add_sequence(&[4, 5], 1).unwrap_err();
        assert!(matches!(err, EmbedError::BatchFull { capacity: 4 }));
        assert_eq!(slot.len(), 3);
    }

    #[test]
    fn test_positions_are_per_sequence() {
        let mut slot = BatchSlot::new(8, 1);
        slot.add_sequence(&[1, 2, 3], 0).unwrap();
        slot.add_sequence(&[4, 5], 1).unwrap();
        assert_eq!(slot.positions(), &[0, 1, 2, 0, 1]);
        assert_eq!(slot.primary_seq_id(3), Some(1));
        assert_eq!(slot.primary_seq_id(9), None);
    }

    #[test]
    fn test_two_short_prompts_share_one_flush() {
        let mut assembler = BatchAssembler::new(8, 2);
        let (flushes, report) = collect_flushes(&mut assembler, &[vec![1, 2, 3], vec![4, 5, 6]]);
        assert_eq!(flushes, vec![(6, 2, 2)]);
        assert_eq!(report.flushes, 1);
        assert!(report.rejected.is_empty());
    }

    #[test]
    fn test_flush_on_token_capacity() {
        let mut assembler = BatchAssembler::new(8, 4);
        let (flushes, _) = collect_flushes(&mut assembler, &[vec![1; 5], vec![2; 4], vec![3; 4]]);
        assert_eq!(flushes, vec![(5, 1, 1), (8, 2, 2)]);
    }

    #[test]
    fn test_flush_on_sequence_limit() {
        let mut assembler = BatchAssembler::new(64, 1);
        let (flushes, _) = collect_flushes(&mut assembler, &[vec![1], vec![2], vec![3]]);
        assert_eq!(flushes, vec![(1, 1, 1), (1, 1, 1), (1, 1, 1)]);
    }

    #[test]
    fn test_sequence_ids_restart_after_flush() {
        let mut assembler = BatchAssembler::new(4, 8);
        let mut seen = Vec::new();
        assembler
            .assemble([&[1, 1, 1][..], &[2, 2][..], &[3][..]], |slot, _| {
                seen.push(
                    (0..slot.len())
                        .filter_map(|i| slot.primary_seq_id(i))
                        .collect::<Vec<_>>(),
                );
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![vec![0, 0, 0], vec![0, 0, 1]]);
    }

    #[test]
    fn test_oversized_sequence_is_rejected() {
        let mut assembler = BatchAssembler::new(8, 2);
        let (flushes, report) = collect_flushes(&mut assembler, &[vec![7; 9], vec![1, 2]]);
        assert_eq!(flushes, vec![(2, 1, 1)]);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            report.rejected[0],
            (0, EmbedError::InputTooLarge { tokens: 9, n_batch: 8 })
        ));
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        let mut assembler = BatchAssembler::new(8, 2);
        let (flushes, report) = collect_flushes(&mut assembler, &[vec![], vec![1]]);
        assert_eq!(flushes, vec![(1, 1, 1)]);
        assert!(matches!(report.rejected[0], (0, EmbedError::EmptyInput)));
    }

    #[test]
    fn test_no_inputs_no_flush() {
        let mut assembler = BatchAssembler::new(8, 2);
        let (flushes, report) = collect_flushes(&mut assembler, &[]);
        assert!(flushes.is_empty());
        assert_eq!(report.flushes, 0);
    }

    #[test]
    fn test_flush_error_stops_assembly() {
        let mut assembler = BatchAssembler::new(2, 1);
        let mut calls = 0;
        let result = assembler.assemble([&[1][..], &[2][..], &[3][..]], |_, _| {
            calls += 1;
            Err(EmbedError::EmptyInput)
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    proptest! {
        #[test]
        fn flushes_respect_both_limits(
            lens in proptest::collection::vec(1usize..12, 0..40),
            n_batch in 1usize..16,
            n_seq_max in 1usize..6,
        ) {
            let inputs: Vec<Vec<TokenId>> = lens.iter().map(|&n| vec![1; n]).collect();
            let mut assembler = BatchAssembler::new(n_batch, n_seq_max);
            let (flushes, report) = collect_flushes(&mut assembler, &inputs);

            for &(n_tokens, distinct, n_seq) in &flushes {
                prop_assert!(n_tokens <= n_batch);
                prop_assert!(distinct <= n_seq_max);
                prop_assert_eq!(distinct, n_seq);
            }

            let packed: usize = flushes.iter().map(|f| f.0).sum();
            let accepted: usize = lens.iter().filter(|&&n| n <= n_batch).sum();
            prop_assert_eq!(packed, accepted);
            prop_assert_eq!(report.rejected.len(), lens.iter().filter(|&&n| n > n_batch).count());
        }
    }
}
