/// Embedding pipeline: tokenization, batch assembly, extraction and
/// normalization.
pub mod batch;
pub mod normalize;
pub mod pipeline;
pub mod pooling;
pub mod tokenizer;

use std::fmt;

use thiserror::Error;

use crate::engine::{EngineError, SeqId};

/// Sequence of token ids for one prompt.
pub type TokenSequence = Vec<crate::engine::TokenId>;

/// What a missing extraction was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractTarget {
    Token(usize),
    Sequence(SeqId),
}

impl fmt::Display for ExtractTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(i) => write!(f, "token {i}"),
            Self::Sequence(s) => write!(f, "sequence {s}"),
        }
    }
}

/// Errors that can occur while turning text into embeddings.
#[derive(Error, Debug, Clone)]
pub enum EmbedError {
    #[error("separator must not be empty")]
    EmptySeparator,

    #[error("rank prompt splits into {parts} parts, expected a query and a document")]
    MalformedPair { parts: usize },

    #[error("prompt produced no tokens")]
    EmptyInput,

    #[error(
        "number of tokens in input ({tokens}) exceeds batch size ({n_batch}), increase batch size and re-run"
    )]
    InputTooLarge { tokens: usize, n_batch: usize },

    #[error("tokenization result exceeds the i32 range")]
    EncodingOverflow,

    #[error("tokenizer sizing mismatch: expected {expected} tokens, got {written}")]
    SizingInconsistency { expected: usize, written: usize },

    #[error("batch capacity of {capacity} tokens exceeded")]
    BatchFull { capacity: usize },

    #[error("failed to get embeddings for {0}")]
    ExtractionMissing(ExtractTarget),

    #[error("embedding for {target} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        target: ExtractTarget,
        expected: usize,
        got: usize,
    },

    #[error("invalid pipeline options: {0}")]
    InvalidOptions(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
