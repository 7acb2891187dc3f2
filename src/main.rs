use std::io::Read;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Dispatch, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use embed2vecdb::config::Config;
use embed2vecdb::embedder::pipeline::Pipeline;
use embed2vecdb::engine::onnx::OnnxEngine;
use embed2vecdb::sink::qdrant::QdrantSink;
use embed2vecdb::sink::{VectorSink, write_run};

/// Embed text prompts with an ONNX model and store the vectors in Qdrant
#[derive(Parser, Debug)]
#[command(name = "embed2vecdb")]
#[command(version)]
#[command(about = "Embed text prompts and upsert the vectors into Qdrant")]
struct Cli {
    /// JSON config file (default: config.json)
    #[arg(short, long, default_value = "")]
    config: String,

    /// Model directory with model.onnx and tokenizer.json
    #[arg(short, long)]
    model: Option<PathBuf>,

    /// Source text file; stdin when omitted
    #[arg(short, long)]
    source: Option<PathBuf>,

    /// Qdrant base URI
    #[arg(long)]
    qdrant: Option<String>,

    /// Target collection
    #[arg(long)]
    collection: Option<String>,

    /// Token capacity of one batch
    #[arg(long)]
    n_batch: Option<usize>,

    /// Maximum number of sequences per batch
    #[arg(long)]
    n_seq_max: Option<usize>,

    /// Inference threads (0 = half the available cores)
    #[arg(long)]
    threads: Option<usize>,

    /// Create the collection before upserting
    #[arg(long)]
    create_collection: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(model) = &self.model {
            config.model.dir.clone_from(model);
        }
        if let Some(uri) = &self.qdrant {
            config.qdrant.uri.clone_from(uri);
        }
        if let Some(collection) = &self.collection {
            config.qdrant.collection.clone_from(collection);
        }
        if let Some(n) = self.n_batch {
            config.batch.n_batch = n;
        }
        if let Some(n) = self.n_seq_max {
            config.batch.n_seq_max = n;
        }
        if let Some(n) = self.threads {
            config.model.threads = n;
        }
        if self.create_collection {
            config.qdrant.create_collection = true;
        }
    }

    fn read_source(&self) -> Result<String> {
        match &self.source {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read source: {}", path.display())),
            None => {
                let mut text = String::new();
                std::io::stdin()
                    .read_to_string(&mut text)
                    .context("failed to read source from stdin")?;
                Ok(text)
            }
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let dispatch = Dispatch::new(
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .finish(),
    );

    tracing::dispatcher::with_default(&dispatch, || run(&cli, dispatch.clone()))
}

fn run(cli: &Cli, dispatch: Dispatch) -> Result<()> {
    // 1. Load config
    let mut config = Config::load(&cli.config)?;
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    // 2. Read prompts
    let text = cli.read_source()?;

    // 3. Check the vector store before spending time on inference
    let sink = QdrantSink::new(
        &config.qdrant.uri,
        Duration::from_secs(config.qdrant.timeout_secs),
    )?;
    sink.ping()
        .with_context(|| format!("Qdrant is not reachable at {}", config.qdrant.uri))?;

    // 4. Init engine
    let mut engine = OnnxEngine::new(&config.model).context("failed to load model")?;

    // 5. Embed
    let run = Pipeline::new(&mut engine, config.embed_options())?
        .with_dispatch(dispatch)
        .run(&text)
        .context("embedding run failed")?;

    for failure in &run.failures {
        warn!(prompt = failure.prompt, "prompt not embedded: {}", failure.error);
    }

    // 6. Store
    if config.qdrant.create_collection {
        sink.create_collection(&config.collection_spec(run.buffer.n_embd()))
            .with_context(|| format!("failed to create collection {}", config.qdrant.collection))?;
    }

    let stored = write_run(
        &sink,
        &run,
        &config.qdrant.collection,
        &config.qdrant.payload_key,
    )
    .context("failed to store embeddings")?;

    info!(
        prompts = run.prompts.len(),
        stored,
        failed = run.failure_count(),
        collection = %config.qdrant.collection,
        "done"
    );

    Ok(())
}
