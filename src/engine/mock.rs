/// Mock inference engine for testing purposes.
///
/// Tokenizes on whitespace with hash-derived word ids and produces
/// deterministic token vectors, so pipeline behaviour can be checked without
/// loading a model.
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{DefaultHasher, Hash, Hasher};

use super::{
    EngineError, InferenceEngine, Pooling, SeqId, SpecialTokens, TokenCount, TokenId, Tokenize,
};
use crate::embedder::batch::BatchSlot;

/// Prepended when special tokens are added.
pub const CLS_TOKEN: TokenId = 101;
/// Appended when special tokens are added; also the pair separator.
pub const SEP_TOKEN: TokenId = 102;
/// Text form of [`SEP_TOKEN`], recognised when special parsing is on.
pub const SEP_TEXT: &str = "[SEP]";

const FIRST_WORD_TOKEN: TokenId = 1000;
const WORD_TOKENS: u64 = 29_000;

/// Shape of one `decode` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeCall {
    pub n_tokens: usize,
    pub n_seq: usize,
}

/// A mock engine producing deterministic vectors from token ids and positions.
pub struct MockEngine {
    dimensions: usize,
    pooling: Pooling,
    special: SpecialTokens,
    rerank_template: Option<String>,
    missing_sequence: Option<SeqId>,
    missing_token: Option<usize>,
    fail_decode: bool,
    unsized_tokenize: bool,
    calls: Vec<DecodeCall>,
    token_rows: Vec<f32>,
    logits: Vec<bool>,
    seq_rows: BTreeMap<SeqId, Vec<f32>>,
}

impl MockEngine {
    /// Create a mean-pooling `MockEngine` with the given dimensionality.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            pooling: Pooling::Mean,
            special: SpecialTokens {
                sep: Some(SEP_TOKEN),
                eos: None,
                pair_eos_text: None,
                pair_sep_text: Some(SEP_TEXT.to_string()),
            },
            rerank_template: None,
            missing_sequence: None,
            missing_token: None,
            fail_decode: false,
            unsized_tokenize: false,
            calls: Vec::new(),
            token_rows: Vec::new(),
            logits: Vec::new(),
            seq_rows: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_pooling(mut self, pooling: Pooling) -> Self {
        self.pooling = pooling;
        self
    }

    #[must_use]
    pub fn with_rerank_template(mut self, template: &str) -> Self {
        self.rerank_template = Some(template.to_string());
        self
    }

    /// Every decode omits the pooled vector of `seq`.
    #[must_use]
    pub fn with_missing_sequence(mut self, seq: SeqId) -> Self {
        self.missing_sequence = Some(seq);
        self
    }

    /// Every decode omits the vector of the token at batch index `i`.
    #[must_use]
    pub fn with_missing_token(mut self, i: usize) -> Self {
        self.missing_token = Some(i);
        self
    }

    /// Every decode fails.
    #[must_use]
    pub fn failing_decode(mut self) -> Self {
        self.fail_decode = true;
        self
    }

    /// Every tokenize call asks for more room than it was given and writes
    /// nothing.
    #[must_use]
    pub fn always_needs_capacity(mut self) -> Self {
        self.unsized_tokenize = true;
        self
    }

    /// Decode calls seen so far.
    #[must_use]
    pub fn decode_calls(&self) -> &[DecodeCall] {
        &self.calls
    }

    /// Token id the mock assigns to `word`.
    #[must_use]
    pub fn word_token(&self, word: &str) -> TokenId {
        let mut hasher = DefaultHasher::new();
        word.hash(&mut hasher);
        let offset = TokenId::try_from(hasher.finish() % WORD_TOKENS).unwrap_or(0);
        FIRST_WORD_TOKEN + offset
    }

    /// Vector of `token` at `pos`.
    #[must_use]
    pub fn token_vector(&self, token: TokenId, pos: i32) -> Vec<f32> {
        (0..self.dimensions)
            .map(|d| {
                let d = i64::try_from(d).unwrap_or(0);
                let v = (i64::from(token) * 31 + i64::from(pos) * 7 + d * 13).rem_euclid(17);
                // never zero
                (v - 8) as f32 + 0.5
            })
            .collect()
    }

    fn encode_words(&self, text: &str, add_special: bool, parse_special: bool) -> Vec<TokenId> {
        let mut out = Vec::new();
        if add_special {
            out.push(CLS_TOKEN);
        }

        let parts: Vec<&str> = if parse_special {
            text.split(SEP_TEXT).collect()
        } else {
            vec![text]
        };
        for (i, part) in parts.iter().enumerate() {
            if i > 0 {
                out.push(SEP_TOKEN);
            }
            out.extend(part.split_whitespace().map(|w| self.word_token(w)));
        }

        if add_special {
            out.push(SEP_TOKEN);
        }
        out
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new(384)
    }
}

impl Tokenize for MockEngine {
    fn tokenize(
        &self,
        text: &str,
        tokens: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> Result<TokenCount, EngineError> {
        if self.unsized_tokenize {
            return Ok(TokenCount::NeedsCapacity(tokens.len() + 1));
        }
        let encoded = self.encode_words(text, add_special, parse_special);
        if i32::try_from(encoded.len()).is_err() {
            return Ok(TokenCount::Overflow);
        }
        if encoded.len() > tokens.len() {
            return Ok(TokenCount::NeedsCapacity(encoded.len()));
        }
        tokens[..encoded.len()].copy_from_slice(&encoded);
        Ok(TokenCount::Written(encoded.len()))
    }
}

impl InferenceEngine for MockEngine {
    fn pooling(&self) -> Pooling {
        self.pooling
    }

    fn n_embd(&self) -> usize {
        self.dimensions
    }

    fn special_tokens(&self) -> &SpecialTokens {
        &self.special
    }

    fn rerank_template(&self) -> Option<&str> {
        self.rerank_template.as_deref()
    }

    fn decode(&mut self, batch: &BatchSlot) -> Result<(), EngineError> {
        if self.fail_decode {
            return Err(EngineError::DecodeFailed("mock decode failure".to_string()));
        }

        let n = batch.len();
        let mut rows = Vec::with_capacity(n * self.dimensions);
        let mut sums: BTreeMap<SeqId, (Vec<f32>, usize)> = BTreeMap::new();
        let mut seqs = BTreeSet::new();

        for i in 0..n {
            let row = self.token_vector(batch.tokens()[i], batch.positions()[i]);
            for &seq in batch.seq_ids(i) {
                seqs.insert(seq);
                let entry = sums
                    .entry(seq)
                    .or_insert_with(|| (vec![0.0; self.dimensions], 0));
                for (acc, v) in entry.0.iter_mut().zip(&row) {
                    *acc += v;
                }
                entry.1 += 1;
            }
            rows.extend_from_slice(&row);
        }

        self.seq_rows = sums
            .into_iter()
            .map(|(seq, (sum, count))| {
                let mean = sum.into_iter().map(|v| v / count as f32).collect();
                (seq, mean)
            })
            .collect();
        self.token_rows = rows;
        self.logits = batch.logits().to_vec();
        self.calls.push(DecodeCall {
            n_tokens: n,
            n_seq: seqs.len(),
        });

        Ok(())
    }

    fn token_embedding(&self, i: usize) -> Option<&[f32]> {
        if self.missing_token == Some(i) || !self.logits.get(i).copied().unwrap_or(false) {
            return None;
        }
        let start = i * self.dimensions;
        self.token_rows.get(start..start + self.dimensions)
    }

    fn sequence_embedding(&self, seq: SeqId) -> Option<&[f32]> {
        if self.missing_sequence == Some(seq) {
            return None;
        }
        self.seq_rows.get(&seq).map(Vec::as_slice)
    }
}
