//! One embedding run: split → tokenize → assemble → decode → extract.
//!
//! Per-prompt problems (oversized input, tokenizer overflow, malformed rank
//! pairs, missing vectors) are collected in the run's failure list and never
//! abort the run. An engine decode failure does.

use std::collections::BTreeSet;
use std::ops::Range;

use tracing::{Dispatch, debug, error, info, info_span, warn};

use super::batch::BatchAssembler;
use super::normalize::Norm;
use super::pooling::{EmbeddingBuffer, extract, flush_width};
use super::tokenizer::PromptEncoder;
use super::{EmbedError, TokenSequence};
use crate::engine::{InferenceEngine, Pooling, TokenId};
use crate::text;

/// Settings the pipeline consumes for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedOptions {
    /// Token capacity of one batch.
    pub n_batch: usize,
    /// Maximum number of sequences per batch.
    pub n_seq_max: usize,
    pub prompt_separator: String,
    pub pair_separator: String,
    pub add_special: bool,
    pub parse_special: bool,
    pub norm: Norm,
}

impl Default for EmbedOptions {
    fn default() -> Self {
        Self {
            n_batch: 2048,
            n_seq_max: 1,
            prompt_separator: "\n".to_string(),
            pair_separator: "\t".to_string(),
            add_special: true,
            parse_special: true,
            norm: Norm::Euclidean,
        }
    }
}

impl EmbedOptions {
    pub fn validate(&self) -> Result<(), EmbedError> {
        if self.prompt_separator.is_empty() || self.pair_separator.is_empty() {
            return Err(EmbedError::EmptySeparator);
        }
        if self.n_batch == 0 {
            return Err(EmbedError::InvalidOptions("n_batch must be positive".to_string()));
        }
        if self.n_seq_max == 0 {
            return Err(EmbedError::InvalidOptions("n_seq_max must be positive".to_string()));
        }
        Ok(())
    }
}

/// A prompt that was skipped, with the reason.
#[derive(Debug)]
pub struct PromptFailure {
    pub prompt: usize,
    pub error: EmbedError,
}

/// A prompt that tokenized cleanly.
#[derive(Debug, Clone)]
pub struct EncodedPrompt {
    pub prompt: usize,
    pub tokens: TokenSequence,
}

/// Output of the tokenization stage.
#[derive(Debug, Default)]
pub struct Tokenized {
    /// Every prompt unit of the input, accepted or not.
    pub prompts: Vec<String>,
    pub accepted: Vec<EncodedPrompt>,
    pub failures: Vec<PromptFailure>,
}

/// Which prompt (and, for per-token pooling, which token) a buffer slot
/// belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddingItem {
    pub prompt: usize,
    pub token: Option<usize>,
}

/// Result of a run.
#[derive(Debug)]
pub struct EmbeddingRun {
    pub pooling: Pooling,
    pub prompts: Vec<String>,
    pub buffer: EmbeddingBuffer,
    /// One entry per buffer slot.
    pub items: Vec<EmbeddingItem>,
    pub failures: Vec<PromptFailure>,
    pub flushes: usize,
}

impl EmbeddingRun {
    /// Number of prompts that produced no (or incomplete) output.
    #[must_use]
    pub fn failure_count(&self) -> usize {
        self.failures.len()
    }

    /// Extracted vectors with their item, in buffer order.
    pub fn vectors(&self) -> impl Iterator<Item = (&EmbeddingItem, &[f32])> + '_ {
        self.items
            .iter()
            .enumerate()
            .filter(|(i, _)| self.buffer.is_filled(*i))
            .filter_map(|(i, item)| self.buffer.vector(i).map(|v| (item, v)))
    }

    /// Prompt text of `item`.
    #[must_use]
    pub fn prompt_text(&self, item: &EmbeddingItem) -> &str {
        self.prompts.get(item.prompt).map_or("", String::as_str)
    }
}

/// Runs prompts through an [`InferenceEngine`].
pub struct Pipeline<'a, E: InferenceEngine + ?Sized> {
    engine: &'a mut E,
    options: EmbedOptions,
    dispatch: Option<Dispatch>,
}

impl<'a, E: InferenceEngine + ?Sized> Pipeline<'a, E> {
    pub fn new(engine: &'a mut E, options: EmbedOptions) -> Result<Self, EmbedError> {
        options.validate()?;
        Ok(Self {
            engine,
            options,
            dispatch: None,
        })
    }

    /// Routes the pipeline's log events to `dispatch` instead of the
    /// default subscriber.
    #[must_use]
    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    #[must_use]
    pub fn options(&self) -> &EmbedOptions {
        &self.options
    }

    /// Splits and embeds `text`.
    pub fn run(&mut self, text: &str) -> Result<EmbeddingRun, EmbedError> {
        match self.dispatch.clone() {
            Some(dispatch) => {
                tracing::dispatcher::with_default(&dispatch, || self.run_inner(text))
            }
            None => self.run_inner(text),
        }
    }

    fn run_inner(&mut self, text: &str) -> Result<EmbeddingRun, EmbedError> {
        let _span = info_span!("embed_run", n_batch = self.options.n_batch).entered();
        let tokenized = self.tokenize(text)?;
        self.embed(tokenized)
    }

    /// Splits `text` into prompts and tokenizes each one.
    ///
    /// Only an invalid separator is an error; every per-prompt problem lands
    /// in [`Tokenized::failures`].
    pub fn tokenize(&self, text: &str) -> Result<Tokenized, EmbedError> {
        let prompts = text::split(text, &self.options.prompt_separator)?;
        let encoder = PromptEncoder::new(
            &*self.engine,
            &self.options.pair_separator,
            self.options.add_special,
            self.options.parse_special,
        );

        let mut tokenized = Tokenized {
            prompts: prompts.iter().map(|p| (*p).to_string()).collect(),
            ..Default::default()
        };

        for (index, prompt) in prompts.iter().enumerate() {
            let result = encoder.encode_prompt(prompt).and_then(|tokens| {
                check_capacity(&tokens, self.options.n_batch)?;
                Ok(tokens)
            });

            match result {
                Ok(tokens) => {
                    debug!(prompt = index, n_tokens = tokens.len(), "prompt tokenized");
                    tokenized.accepted.push(EncodedPrompt {
                        prompt: index,
                        tokens,
                    });
                }
                Err(err) => {
                    warn!(prompt = index, "skipping prompt: {err}");
                    tokenized.failures.push(PromptFailure {
                        prompt: index,
                        error: err,
                    });
                }
            }
        }

        Ok(tokenized)
    }

    /// Embeds already tokenized prompts.
    pub fn embed(&mut self, tokenized: Tokenized) -> Result<EmbeddingRun, EmbedError> {
        let Tokenized {
            prompts,
            accepted: encoded,
            mut failures,
        } = tokenized;

        let mut accepted = Vec::with_capacity(encoded.len());
        for p in encoded {
            match check_capacity(&p.tokens, self.options.n_batch) {
                Ok(()) => accepted.push(p),
                Err(error) => failures.push(PromptFailure {
                    prompt: p.prompt,
                    error,
                }),
            }
        }

        let pooling = self.engine.pooling();
        let n_embd = self.engine.n_embd();
        let norm = self.options.norm;

        let items: Vec<EmbeddingItem> = if pooling.per_token() {
            accepted
                .iter()
                .flat_map(|p| {
                    (0..p.tokens.len()).map(move |t| EmbeddingItem {
                        prompt: p.prompt,
                        token: Some(t),
                    })
                })
                .collect()
        } else {
            accepted
                .iter()
                .map(|p| EmbeddingItem {
                    prompt: p.prompt,
                    token: None,
                })
                .collect()
        };

        let mut buffer = EmbeddingBuffer::new(items.len(), n_embd);
        let mut assembler = BatchAssembler::new(self.options.n_batch, self.options.n_seq_max);
        let mut offset = 0usize;
        let mut aborted: Vec<(Range<usize>, EmbedError)> = Vec::new();
        let engine = &mut *self.engine;

        let inputs = accepted.iter().map(|p| p.tokens.as_slice());
        let report = assembler.assemble(inputs, |slot, n_seq| {
            info!(n_tokens = slot.len(), n_seq, "decoding batch");
            engine.decode(slot)?;

            // The region is reserved even when extraction stops early, so the
            // next flush never lands on top of it.
            let width = flush_width(pooling, slot, n_seq);
            if let Err(err) = extract(&*engine, slot, n_seq, norm, &mut buffer, offset) {
                error!(offset, "extraction aborted for this batch: {err}");
                aborted.push((offset..offset + width, err));
            }
            offset += width;
            Ok(())
        })?;

        // Everything fed to the assembler passed check_capacity.
        debug_assert!(report.rejected.is_empty());

        for (region, err) in aborted {
            let affected: BTreeSet<usize> = region
                .filter(|&i| !buffer.is_filled(i))
                .filter_map(|i| items.get(i).map(|item| item.prompt))
                .collect();
            for prompt in affected {
                failures.push(PromptFailure {
                    prompt,
                    error: err.clone(),
                });
            }
        }
        failures.sort_by_key(|f| f.prompt);

        info!(
            prompts = prompts.len(),
            vectors = buffer.filled_count(),
            failed = failures.len(),
            flushes = report.flushes,
            "embedding run complete"
        );

        Ok(EmbeddingRun {
            pooling,
            prompts,
            buffer,
            items,
            failures,
            flushes: report.flushes,
        })
    }
}

/// A sequence must be non-empty and fit one batch on its own.
fn check_capacity(tokens: &[TokenId], n_batch: usize) -> Result<(), EmbedError> {
    if tokens.is_empty() {
        return Err(EmbedError::EmptyInput);
    }
    if tokens.len() > n_batch {
        return Err(EmbedError::InputTooLarge {
            tokens: tokens.len(),
            n_batch,
        });
    }
    Ok(())
}
