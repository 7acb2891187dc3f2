/// Prompt tokenization against a capacity-probing engine tokenizer.
///
/// [`encode`] implements the probe-then-retry sizing protocol; the
/// [`PromptEncoder`] adds rank-pair handling on top of it.
use tracing::{info, warn};

use super::{EmbedError, TokenSequence};
use crate::engine::{InferenceEngine, Pooling, TokenCount, Tokenize};
use crate::text;

/// Tokenizes `text`, resizing the buffer once if the first guess is too
/// small.
///
/// The first buffer holds `text.len() + 2` slots when special tokens are
/// added. If the tokenizer asks for more, the buffer is resized to exactly
/// that and the call repeated. A second call that disagrees is logged as a
/// [`EmbedError::SizingInconsistency`] and whatever was written is kept; a
/// second request for more room writes nothing, so the result is empty.
pub fn encode<T: Tokenize + ?Sized>(
    oracle: &T,
    text: &str,
    add_special: bool,
    parse_special: bool,
) -> Result<TokenSequence, EmbedError> {
    let mut tokens = vec![0; text.len() + 2 * usize::from(add_special)];

    match oracle.tokenize(text, &mut tokens, add_special, parse_special)? {
        TokenCount::Written(n) => tokens.truncate(n),
        TokenCount::Overflow => return Err(EmbedError::EncodingOverflow),
        TokenCount::NeedsCapacity(needed) => {
            tokens.resize(needed, 0);
            match oracle.tokenize(text, &mut tokens, add_special, parse_special)? {
                TokenCount::Written(n) if n == needed => {}
                TokenCount::Written(n) => {
                    let err = EmbedError::SizingInconsistency {
                        expected: needed,
                        written: n,
                    };
                    warn!("{err}");
                    tokens.truncate(n);
                }
                TokenCount::NeedsCapacity(again) => {
                    let err = EmbedError::SizingInconsistency {
                        expected: needed,
                        written: again,
                    };
                    warn!("{err}");
                    tokens.clear();
                }
                TokenCount::Overflow => return Err(EmbedError::EncodingOverflow),
            }
        }
    }

    Ok(tokens)
}

/// Encodes prompt units for one engine.
pub struct PromptEncoder<'a, E: InferenceEngine + ?Sized> {
    engine: &'a E,
    pair_separator: &'a str,
    add_special: bool,
    parse_special: bool,
}

impl<'a, E: InferenceEngine + ?Sized> PromptEncoder<'a, E> {
    pub fn new(
        engine: &'a E,
        pair_separator: &'a str,
        add_special: bool,
        parse_special: bool,
    ) -> Self {
        Self {
            engine,
            pair_separator,
            add_special,
            parse_special,
        }
    }

    /// Encodes one prompt unit.
    ///
    /// With rank pooling, a prompt holding the pair separator is encoded as a
    /// single (query, document) input: through the model's rerank template
    /// when it has one, otherwise by joining the parts with the vocabulary's
    /// EOS and SEP texts.
    pub fn encode_prompt(&self, prompt: &str) -> Result<TokenSequence, EmbedError> {
        let pair = if self.engine.pooling() == Pooling::Rank {
            text::split_pair(prompt, self.pair_separator)?
        } else {
            None
        };

        let tokens = match pair {
            Some((query, document)) => {
                let joined = self.join_pair(query, document);
                encode(self.engine, &joined, self.add_special, self.parse_special)?
            }
            None => encode(self.engine, prompt, self.add_special, self.parse_special)?,
        };

        self.check_terminal_token(&tokens);
        Ok(tokens)
    }

    fn join_pair(&self, query: &str, document: &str) -> String {
        if let Some(template) = self.engine.rerank_template() {
            let with_query = text::replace_all(template, "{query}", query);
            return text::replace_all(&with_query, "{document}", document);
        }

        let special = self.engine.special_tokens();
        let mut joined = String::with_capacity(query.len() + document.len() + 16);
        joined.push_str(query);
        if let Some(eos) = &special.pair_eos_text {
            joined.push_str(eos);
        }
        if let Some(sep) = &special.pair_sep_text {
            joined.push_str(sep);
        }
        joined.push_str(document);
        joined
    }

    /// Some vocabularies append SEP/EOS on their own and some do not, so a
    /// missing terminal token is only reported.
    fn check_terminal_token(&self, tokens: &[crate::engine::TokenId]) {
        let special = self.engine.special_tokens();
        if special.sep.is_none() && special.eos.is_none() {
            return;
        }
        match tokens.last() {
            Some(&last) if special.is_terminal(last) => {}
            _ => {
                info!(
                    n_tokens = tokens.len(),
                    "last token is not SEP or EOS; the tokenizer may not add it automatically"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::engine::{EngineError, TokenId};
    use std::cell::Cell;

    /// Writes one token per byte, twice over, so the first buffer guess is
    /// always too small.
    struct DoublingOracle {
        calls: Cell<usize>,
    }

    impl Tokenize for DoublingOracle {
        fn tokenize(
            &self,
            text: &str,
            tokens: &mut [TokenId],
            _add_special: bool,
            _parse_special: bool,
        ) -> Result<TokenCount, EngineError> {
            self.calls.set(self.calls.get() + 1);
            let needed = text.len() * 2;
            if tokens.len() < needed {
                return Ok(TokenCount::NeedsCapacity(needed));
            }
            for (i, slot) in tokens.iter_mut().take(needed).enumerate() {
                *slot = i as TokenId;
            }
            Ok(TokenCount::Written(needed))
        }
    }

    /// Asks for more room on the first call and then writes fewer tokens.
    struct InconsistentOracle;

    impl Tokenize for InconsistentOracle {
        fn tokenize(
            &self,
            text: &str,
            tokens: &mut [TokenId],
            _add_special: bool,
            _parse_special: bool,
        ) -> Result<TokenCount, EngineError> {
            let needed = text.len() * 3;
            if tokens.len() < needed {
                return Ok(TokenCount::NeedsCapacity(needed));
            }
            tokens[0] = 42;
            Ok(TokenCount::Written(1))
        }
    }

    struct OverflowOracle;

    impl Tokenize for OverflowOracle {
        fn tokenize(
            &self,
            _text: &str,
            _tokens: &mut [TokenId],
            _add_special: bool,
            _parse_special: bool,
        ) -> Result<TokenCount, EngineError> {
            Ok(TokenCount::from_raw(i32::MIN))
        }
    }

    #[test]
    fn test_encode_first_guess_fits() {
        let engine = MockEngine::new(4);
        let tokens = encode(&engine, "hello world", true, true).unwrap();
        assert_eq!(tokens.len(), 4);
    }

    #[test]
    fn test_encode_retries_with_exact_capacity() {
        let oracle = DoublingOracle { calls: Cell::new(0) };
        let tokens = encode(&oracle, "abcd", false, false).unwrap();
        assert_eq!(oracle.calls.get(), 2);
        assert_eq!(tokens, (0..8).collect::<Vec<TokenId>>());
    }

    #[test]
    fn test_encode_inconsistent_retry_is_not_fatal() {
        let tokens = encode(&InconsistentOracle, "abc", false, false).unwrap();
        assert_eq!(tokens, vec![42]);
    }

    /// Always asks for more room than it was given.
    struct GreedyOracle;

    impl Tokenize for GreedyOracle {
        fn tokenize(
            &self,
            _text: &str,
            tokens: &mut [TokenId],
            _add_special: bool,
            _parse_special: bool,
        ) -> Result<TokenCount, EngineError> {
            Ok(TokenCount::NeedsCapacity(tokens.len() + 3))
        }
    }

    /// Asks for more room, then overflows on the retry.
    struct OverflowOnRetryOracle {
        calls: Cell<usize>,
    }

    impl Tokenize for OverflowOnRetryOracle {
        fn tokenize(
            &self,
            text: &str,
            _tokens: &mut [TokenId],
            _add_special: bool,
            _parse_special: bool,
        ) -> Result<TokenCount, EngineError> {
            self.calls.set(self.calls.get() + 1);
            if self.calls.get() == 1 {
                Ok(TokenCount::NeedsCapacity(text.len() * 4))
            } else {
                Ok(TokenCount::Overflow)
            }
        }
    }

    #[test]
    fn test_encode_second_needs_capacity_yields_nothing() {
        let tokens = encode(&GreedyOracle, "abc", false, false).unwrap();
        assert!(tokens.is_empty(), "no tokens were written, got {tokens:?}");
    }

    #[test]
    fn test_encode_overflow_on_retry() {
        let oracle = OverflowOnRetryOracle { calls: Cell::new(0) };
        let err = encode(&oracle, "abc", true, true).unwrap_err();
        assert_eq!(oracle.calls.get(), 2);
        assert!(matches!(err, EmbedError::EncodingOverflow));
    }

    #[test]
    fn test_encode_overflow() {
        let err = encode(&OverflowOracle, "abc", true, true).unwrap_err();
        assert!(matches!(err, EmbedError::EncodingOverflow));
    }

    #[test]
    fn test_prompt_encoder_plain() {
        let engine = MockEngine::new(4);
        let encoder = PromptEncoder::new(&engine, "\t", true, true);
        let tokens = encoder.encode_prompt("one two three").unwrap();
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens.first(), Some(&crate::engine::mock::CLS_TOKEN));
        assert_eq!(tokens.last(), Some(&crate::engine::mock::SEP_TOKEN));
    }

    #[test]
    fn test_prompt_encoder_ignores_pair_separator_without_rank() {
        let engine = MockEngine::new(4);
        let encoder = PromptEncoder::new(&engine, "\t", false, true);
        let tokens = encoder.encode_prompt("q\td").unwrap();
        // The tab is whitespace for the mock tokenizer: two words.
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn test_prompt_encoder_rank_pair_inserts_separator() {
        let engine = MockEngine::new(1).with_pooling(Pooling::Rank);
        let encoder = PromptEncoder::new(&engine, "\t", false, true);
        let tokens = encoder.encode_prompt("query\tdocument").unwrap();
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens[1], crate::engine::mock::SEP_TOKEN);
    }

    #[test]
    fn test_prompt_encoder_rank_template() {
        let engine = MockEngine::new(1)
            .with_pooling(Pooling::Rank)
            .with_rerank_template("query: {query} document: {document}");
        let encoder = PromptEncoder::new(&engine, "\t", false, true);
        let tokens = encoder.encode_prompt("rust\tborrow checker").unwrap();
        // "query:" "rust" "document:" "borrow" "checker"
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[1], engine.word_token("rust"));
        assert_eq!(tokens[4], engine.word_token("checker"));
    }

    #[test]
    fn test_prompt_encoder_rank_rejects_extra_parts() {
        let engine = MockEngine::new(1).with_pooling(Pooling::Rank);
        let encoder = PromptEncoder::new(&engine, "\t", true, true);
        let err = encoder.encode_prompt("q\td1\td2").unwrap_err();
        assert!(matches!(err, EmbedError::MalformedPair { parts: 3 }));
    }
}
