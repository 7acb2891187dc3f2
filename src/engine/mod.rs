/// Inference engine boundary.
///
/// The pipeline only talks to a model through [`Tokenize`] and
/// [`InferenceEngine`]; [`onnx::OnnxEngine`] backs them with ONNX Runtime and
/// [`mock::MockEngine`] with deterministic in-process data for tests.
pub mod mock;
pub mod onnx;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::embedder::batch::BatchSlot;

/// Token identifier as produced by the engine's vocabulary.
pub type TokenId = i32;

/// Sequence identifier inside one batch.
pub type SeqId = i32;

/// Errors reported by an inference engine.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    ModelLoadFailed(String),

    #[error("tokenizer error: {0}")]
    TokenizerError(String),

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("unexpected model output: {0}")]
    UnexpectedOutput(String),
}

/// Outcome of one tokenizer call against a caller-sized buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenCount {
    /// The buffer was large enough; this many tokens were written.
    Written(usize),
    /// The buffer was too small; this many slots are required.
    NeedsCapacity(usize),
    /// The token count does not fit in an `i32`.
    Overflow,
}

impl TokenCount {
    /// Decodes the sign-encoded count returned by C-style tokenizers, where
    /// `i32::MIN` flags an overflow and other negatives carry the required
    /// capacity.
    #[must_use]
    pub fn from_raw(n: i32) -> Self {
        match n {
            i32::MIN => Self::Overflow,
            n if n < 0 => Self::NeedsCapacity(n.unsigned_abs() as usize),
            n => Self::Written(n.unsigned_abs() as usize),
        }
    }
}

/// How the engine turns a decoded batch into vectors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pooling {
    /// One vector per token.
    None,
    #[default]
    Mean,
    Cls,
    Last,
    /// Query/document relevance scoring.
    Rank,
}

impl Pooling {
    /// Whether vectors are extracted per token rather than per sequence.
    #[must_use]
    pub fn per_token(self) -> bool {
        self == Self::None
    }
}

/// Special-token information of the engine's vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sep: Option<TokenId>,
    pub eos: Option<TokenId>,
    /// Text inserted between the parts of a rank pair when the vocabulary
    /// adds an EOS token.
    pub pair_eos_text: Option<String>,
    /// Text inserted between the parts of a rank pair when the vocabulary
    /// adds a separator token.
    pub pair_sep_text: Option<String>,
}

impl SpecialTokens {
    /// Whether `token` terminates a sequence (SEP or EOS).
    #[must_use]
    pub fn is_terminal(&self, token: TokenId) -> bool {
        self.sep == Some(token) || self.eos == Some(token)
    }
}

/// Capacity-probing tokenizer.
pub trait Tokenize {
    /// Tokenizes `text` into `tokens`.
    ///
    /// Must return [`TokenCount::NeedsCapacity`] without writing a partial
    /// result when `tokens` is too small.
    fn tokenize(
        &self,
        text: &str,
        tokens: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> Result<TokenCount, EngineError>;
}

/// A model that decodes assembled batches into embedding vectors.
pub trait InferenceEngine: Tokenize {
    fn pooling(&self) -> Pooling;

    /// Dimensionality of every returned vector.
    fn n_embd(&self) -> usize;

    fn special_tokens(&self) -> &SpecialTokens;

    /// Prompt template with `{query}` and `{document}` placeholders, if the
    /// model ships one for reranking.
    fn rerank_template(&self) -> Option<&str> {
        None
    }

    /// Runs the model over `batch`. Embeddings of the previous decode are
    /// discarded.
    fn decode(&mut self, batch: &BatchSlot) -> Result<(), EngineError>;

    /// Vector of the token at batch index `i` from the last decode.
    fn token_embedding(&self, i: usize) -> Option<&[f32]>;

    /// Pooled vector of sequence `seq` from the last decode.
    fn sequence_embedding(&self, seq: SeqId) -> Option<&[f32]>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_count_from_raw() {
        assert_eq!(TokenCount::from_raw(7), TokenCount::Written(7));
        assert_eq!(TokenCount::from_raw(0), TokenCount::Written(0));
        assert_eq!(TokenCount::from_raw(-12), TokenCount::NeedsCapacity(12));
        assert_eq!(TokenCount::from_raw(i32::MIN), TokenCount::Overflow);
    }

    #[test]
    fn test_pooling_serde() {
        let p: Pooling = serde_json::from_str("\"rank\"").unwrap();
        assert_eq!(p, Pooling::Rank);
        assert_eq!(serde_json::to_string(&Pooling::None).unwrap(), "\"none\"");
        assert!(Pooling::None.per_token());
        assert!(!Pooling::Cls.per_token());
    }

    #[test]
    fn test_special_tokens_terminal() {
        let special = SpecialTokens {
            sep: Some(102),
            eos: Some(2),
            ..Default::default()
        };
        assert!(special.is_terminal(102));
        assert!(special.is_terminal(2));
        assert!(!special.is_terminal(7));
    }
}
