/// ONNX Runtime engine using the `ort` crate.
///
/// Loads a BERT-style encoder (or cross-encoder) from `model.onnx` and its
/// HuggingFace `tokenizer.json`. Each sequence of a batch is run as its own
/// `[1, len]` input; token rows and pooled sequence rows are kept until the
/// next decode.
use std::collections::BTreeMap;
use std::path::Path;

use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use super::{
    EngineError, InferenceEngine, Pooling, SeqId, SpecialTokens, TokenCount, TokenId, Tokenize,
};
use crate::config::ModelConfig;
use crate::embedder::batch::BatchSlot;

/// ONNX-backed engine implementing [`InferenceEngine`].
pub struct OnnxEngine {
    session: Session,
    tokenizer: Tokenizer,
    /// Same vocabulary with special-token parsing disabled.
    literal_tokenizer: Tokenizer,
    dimensions: usize,
    pooling: Pooling,
    special: SpecialTokens,
    rerank_template: Option<String>,
    token_type_ids: bool,
    token_embd: Vec<f32>,
    logits: Vec<bool>,
    seq_embd: BTreeMap<SeqId, Vec<f32>>,
}

impl OnnxEngine {
    /// Loads `model.onnx` and `tokenizer.json` from `config.dir`.
    pub fn new(config: &ModelConfig) -> Result<Self, EngineError> {
        let model_dir = config.dir.as_path();
        let model_path = model_dir.join("model.onnx");

        if !model_path.exists() {
            return Err(EngineError::ModelLoadFailed(format!(
                "model.onnx not found in {}",
                model_dir.display()
            )));
        }

        let threads = resolve_threads(config.threads);
        info!(threads, "Initializing ONNX Runtime...");

        let session = Session::builder()
            .map_err(|e| EngineError::ModelLoadFailed(format!("session builder error: {e}")))?
            .with_intra_threads(threads)
            .map_err(|e| EngineError::ModelLoadFailed(format!("thread config error: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EngineError::ModelLoadFailed(format!("model load error: {e}")))?;

        info!("ONNX model loaded successfully");

        let tokenizer = load_tokenizer(model_dir)?;
        let mut literal_tokenizer = tokenizer.clone();
        literal_tokenizer.set_encode_special_tokens(true);

        let special = special_tokens(&tokenizer, config);
        info!(
            vocab = tokenizer.get_vocab_size(true),
            sep = ?special.sep,
            eos = ?special.eos,
            "Tokenizer loaded"
        );

        Ok(Self {
            session,
            tokenizer,
            literal_tokenizer,
            dimensions: config.dimensions,
            pooling: config.pooling,
            special,
            rerank_template: config.rerank_template.clone(),
            token_type_ids: config.token_type_ids,
            token_embd: Vec::new(),
            logits: Vec::new(),
            seq_embd: BTreeMap::new(),
        })
    }

    /// Runs one sequence and returns the flat output with its shape.
    fn run_sequence(&mut self, ids: &[TokenId]) -> Result<(Vec<i64>, Vec<f32>), EngineError> {
        let seq_len = ids.len();
        let input_ids: Vec<i64> = ids.iter().map(|&id| i64::from(id)).collect();

        let input_ids_val = Tensor::from_array(([1usize, seq_len], input_ids))
            .map_err(|e| EngineError::DecodeFailed(format!("input_ids error: {e}")))?;
        let attention_mask_val = Tensor::from_array(([1usize, seq_len], vec![1i64; seq_len]))
            .map_err(|e| EngineError::DecodeFailed(format!("attention_mask error: {e}")))?;

        let outputs = if self.token_type_ids {
            let token_type_ids_val = Tensor::from_array(([1usize, seq_len], vec![0i64; seq_len]))
                .map_err(|e| EngineError::DecodeFailed(format!("token_type_ids error: {e}")))?;
            self.session.run(ort::inputs![
                "input_ids" => input_ids_val,
                "attention_mask" => attention_mask_val,
                "token_type_ids" => token_type_ids_val,
            ])
        } else {
            self.session.run(ort::inputs![
                "input_ids" => input_ids_val,
                "attention_mask" => attention_mask_val,
            ])
        }
        .map_err(|e| EngineError::DecodeFailed(format!("inference failed: {e}")))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EngineError::UnexpectedOutput(format!("output extraction: {e}")))?;

        Ok((shape.to_vec(), data.to_vec()))
    }
}

impl Tokenize for OnnxEngine {
    fn tokenize(
        &self,
        text: &str,
        tokens: &mut [TokenId],
        add_special: bool,
        parse_special: bool,
    ) -> Result<TokenCount, EngineError> {
        let tokenizer = if parse_special {
            &self.tokenizer
        } else {
            &self.literal_tokenizer
        };
        let encoding = tokenizer
            .encode(text, add_special)
            .map_err(|e| EngineError::TokenizerError(format!("failed to encode text: {e}")))?;

        let ids = encoding.get_ids();
        let mut converted = Vec::with_capacity(ids.len());
        for &id in ids {
            match TokenId::try_from(id) {
                Ok(id) => converted.push(id),
                Err(_) => return Ok(TokenCount::Overflow),
            }
        }
        if i32::try_from(converted.len()).is_err() {
            return Ok(TokenCount::Overflow);
        }

        if converted.len() > tokens.len() {
            return Ok(TokenCount::NeedsCapacity(converted.len()));
        }
        tokens[..converted.len()].copy_from_slice(&converted);
        Ok(TokenCount::Written(converted.len()))
    }
}

impl InferenceEngine for OnnxEngine {
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
        let n = batch.len();
        let dim = self.dimensions;
        let mut token_embd = vec![0.0f32; n * dim];
        let mut seq_embd = BTreeMap::new();

        for (seq, range) in sequence_ranges(batch) {
            let (shape, data) = self.run_sequence(&batch.tokens()[range.clone()])?;
            debug!(seq, n_tokens = range.len(), ?shape, "sequence decoded");

            match shape.as_slice() {
                // [1, seq_len, hidden]
                [1, len, hidden] if *len as usize == range.len() && *hidden as usize == dim => {
                    token_embd[range.start * dim..range.end * dim].copy_from_slice(&data);
                    if let Some(pooled) = pool(self.pooling, &data, range.len(), dim) {
                        seq_embd.insert(seq, pooled);
                    }
                }
                // [1, hidden], already pooled (or a relevance score)
                [1, hidden] if *hidden as usize == dim && !self.pooling.per_token() => {
                    seq_embd.insert(seq, data);
                }
                _ => {
                    return Err(EngineError::UnexpectedOutput(format!(
                        "output shape {shape:?} does not match {} tokens of {dim} dimensions",
                        range.len()
                    )));
                }
            }
        }

        self.token_embd = token_embd;
        self.logits = batch.logits().to_vec();
        self.seq_embd = seq_embd;
        Ok(())
    }

    fn token_embedding(&self, i: usize) -> Option<&[f32]> {
        if !self.logits.get(i).copied().unwrap_or(false) {
            return None;
        }
        let start = i * self.dimensions;
        self.token_embd.get(start..start + self.dimensions)
    }

    fn sequence_embedding(&self, seq: SeqId) -> Option<&[f32]> {
        self.seq_embd.get(&seq).map(Vec::as_slice)
    }
}

fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer, EngineError> {
    let tokenizer_path = model_dir.join("tokenizer.json");
    if !tokenizer_path.exists() {
        return Err(EngineError::ModelLoadFailed(format!(
            "tokenizer.json not found in {}",
            model_dir.display()
        )));
    }

    let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| EngineError::ModelLoadFailed(format!("failed to load tokenizer: {e}")))?;

    // Oversized prompts are rejected by the pipeline, never cut.
    tokenizer
        .with_truncation(None)
        .map_err(|e| EngineError::ModelLoadFailed(format!("truncation config error: {e}")))?;
    tokenizer.with_padding(None);

    Ok(tokenizer)
}

fn special_tokens(tokenizer: &Tokenizer, config: &ModelConfig) -> SpecialTokens {
    let lookup = |name: &Option<String>| {
        name.as_deref()
            .and_then(|t| tokenizer.token_to_id(t))
            .and_then(|id| TokenId::try_from(id).ok())
    };
    let sep = lookup(&config.sep_token);
    let eos = lookup(&config.eos_token);

    let pair_text = |name: &Option<String>, id: Option<TokenId>| {
        if config.insert_pair_tokens && id.is_some() {
            name.clone()
        } else {
            None
        }
    };

    SpecialTokens {
        sep,
        eos,
        pair_eos_text: pair_text(&config.eos_token, eos),
        pair_sep_text: pair_text(&config.sep_token, sep),
    }
}

/// Zero means half the available cores.
fn resolve_threads(threads: usize) -> usize {
    if threads > 0 {
        return threads;
    }
    std::thread::available_parallelism()
        .map(|n| (n.get() / 2).max(1))
        .unwrap_or(1)
}

/// Contiguous batch index ranges per sequence id, in batch order.
fn sequence_ranges(batch: &BatchSlot) -> Vec<(SeqId, std::ops::Range<usize>)> {
    let mut ranges: Vec<(SeqId, std::ops::Range<usize>)> = Vec::new();
    for i in 0..batch.len() {
        let Some(seq) = batch.primary_seq_id(i) else {
            continue;
        };
        match ranges.last_mut() {
            Some((last, range)) if *last == seq && range.end == i => range.end = i + 1,
            _ => ranges.push((seq, i..i + 1)),
        }
    }
    ranges
}

/// Pools `[seq_len, hidden]` rows into one vector.
fn pool(pooling: Pooling, rows: &[f32], seq_len: usize, hidden: usize) -> Option<Vec<f32>> {
    if seq_len == 0 {
        return None;
    }
    match pooling {
        Pooling::None | Pooling::Rank => None,
        Pooling::Cls => Some(rows[..hidden].to_vec()),
        Pooling::Last => Some(rows[(seq_len - 1) * hidden..seq_len * hidden].to_vec()),
        Pooling::Mean => {
            let mut result = vec![0.0f32; hidden];
            for row in rows.chunks_exact(hidden) {
                for (acc, v) in result.iter_mut().zip(row) {
                    *acc += v;
                }
            }
            for v in &mut result {
                *v /= seq_len as f32;
            }
            Some(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_mean_pooling_simple() {
        let rows = vec![1.0, 2.0, 3.0, 5.0];
        assert_eq!(pool(Pooling::Mean, &rows, 2, 2), Some(vec![2.0, 3.5]));
    }

    #[test]
    fn test_cls_and_last_pooling() {
        let rows = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(pool(Pooling::Cls, &rows, 3, 2), Some(vec![1.0, 2.0]));
        assert_eq!(pool(Pooling::Last, &rows, 3, 2), Some(vec![5.0, 6.0]));
        assert_eq!(pool(Pooling::None, &rows, 3, 2), None);
    }

    #[test]
    fn test_sequence_ranges() {
        let mut slot = BatchSlot::new(8, 1);
        slot.add_sequence(&[1, 2, 3], 0).unwrap();
        slot.add_sequence(&[4], 1).unwrap();
        slot.add_sequence(&[5, 6], 2).unwrap();
        assert_eq!(
            sequence_ranges(&slot),
            vec![(0, 0..3), (1, 3..4), (2, 4..6)]
        );
    }

    #[test]
    fn test_resolve_threads() {
        assert_eq!(resolve_threads(3), 3);
        assert!(resolve_threads(0) >= 1);
    }

    #[test]
    fn test_missing_model_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ModelConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let err = OnnxEngine::new(&config).err().unwrap();
        assert!(matches!(err, EngineError::ModelLoadFailed(_)));
    }

    /// Integration test requiring actual model files.
    #[test]
    #[ignore]
    fn test_onnx_decode() {
        let config = ModelConfig {
            dir: PathBuf::from("models/multilingual-e5-small"),
            ..Default::default()
        };
        if !config.dir.join("model.onnx").exists() {
            eprintln!("Skipping: model files not present");
            return;
        }

        let mut engine = OnnxEngine::new(&config).unwrap();
        let mut buf = vec![0; 64];
        let TokenCount::Written(n) = engine.tokenize("Hello, world!", &mut buf, true, true).unwrap()
        else {
            panic!("buffer too small");
        };

        let mut slot = BatchSlot::new(64, 1);
        slot.add_sequence(&buf[..n], 0).unwrap();
        engine.decode(&slot).unwrap();
        assert_eq!(engine.sequence_embedding(0).unwrap().len(), 384);
        assert_eq!(engine.token_embedding(0).unwrap().len(), 384);
    }
}
