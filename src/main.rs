//! RNNVIS: streaming evaluation of recurrent language models.
//!
//! This is the CLI binary entry point.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use rnnvis::core::StackedRnn;
use rnnvis::eval::{Evaluator, SequenceFeeder};
use rnnvis::io::files::save_json;
use rnnvis::record::{JsonDirStore, Recorder};
use rnnvis::runtime::RunSettings;

/// RNNVIS evaluation CLI.
#[derive(Parser, Debug)]
#[command(
    name = "rnnvis",
    about = "RNNVIS: evaluate recurrent language models and record their internals",
    version
)]
struct Cli {
    /// JSON run configuration; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model checkpoint (bincode). A seeded random model is used when omitted.
    #[arg(short, long)]
    weights: Option<PathBuf>,

    /// Override `eval.batch_size`.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Reset recurrent state before every block.
    #[arg(long, default_value_t = false)]
    refresh_state: bool,

    /// Suppress progress lines.
    #[arg(short, long, default_value_t = false)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Average loss and accuracy over a flat token stream (JSON array).
    Evaluate {
        /// JSON file holding `[id, id, ...]`.
        tokens: PathBuf,

        /// Time-steps per evaluation block.
        #[arg(long)]
        record_every: Option<usize>,

        /// Limit the number of blocks; defaults to one full pass.
        #[arg(long)]
        steps: Option<usize>,

        /// Write the summary as JSON.
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Record every step's signals for a `[batch, length]` token matrix.
    Record {
        /// JSON file holding `[[id, ...], ...]`.
        inputs: PathBuf,

        /// JSON file of targets with the same shape.
        #[arg(long)]
        targets: Option<PathBuf>,

        /// Store directory.
        #[arg(long, default_value = "./evaluations")]
        store_dir: PathBuf,

        #[arg(long)]
        dataset: Option<String>,

        #[arg(long)]
        model_name: Option<String>,

        #[arg(long)]
        flush_every: Option<usize>,

        /// Also capture loss gradients w.r.t. the inputs (needs targets).
        #[arg(long, default_value_t = false)]
        gradients: bool,
    },

    /// Write a freshly initialised checkpoint from the model configuration.
    Init {
        /// Output path.
        out: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    tracing::info!("RNNVIS v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = match &cli.config {
        Some(path) => RunSettings::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RunSettings::default(),
    };
    if let Some(b) = cli.batch_size {
        settings.eval.batch_size = b;
    }
    settings.eval.refresh_state |= cli.refresh_state;
    if cli.quiet {
        settings.eval.verbose = false;
    }

    match cli.command {
        Command::Evaluate {
            tokens,
            record_every,
            steps,
            summary,
        } => {
            if let Some(r) = record_every {
                settings.eval.record_every = r;
            }
            settings.validate()?;
            let model = load_model(cli.weights.as_deref(), &settings)?;

            let stream: Vec<u32> = read_json(&tokens)?;
            let (mut x, mut y) = SequenceFeeder::pair(&stream, settings.eval.batch_size)?;
            let epoch = x.epoch_size(settings.eval.record_every);
            let input_size = steps.unwrap_or(epoch).min(epoch);
            if input_size == 0 {
                bail!(
                    "{} tokens are too few for batch {} and record_every {}",
                    stream.len(),
                    settings.eval.batch_size,
                    settings.eval.record_every
                );
            }

            let mut evaluator = Evaluator::from_settings(model, &settings.eval)?;
            let result = evaluator.evaluate(
                &mut x,
                &mut y,
                input_size,
                settings.eval.verbose,
                settings.eval.refresh_state,
            )?;
            if let Some(path) = summary {
                save_json(&result, &path)?;
                tracing::info!("Summary written to {}", path.display());
            }
        }

        Command::Record {
            inputs,
            targets,
            store_dir,
            dataset,
            model_name,
            flush_every,
            gradients,
        } => {
            if let Some(d) = dataset {
                settings.recorder.dataset_name = d;
            }
            if let Some(m) = model_name {
                settings.recorder.model_name = m;
            }
            if let Some(f) = flush_every {
                settings.recorder.flush_every = f;
            }
            settings.eval.log_gradients |= gradients;

            let inputs: serde_json::Value = read_json(&inputs)?;
            let targets: Option<serde_json::Value> =
                targets.as_deref().map(read_json::<serde_json::Value>).transpose()?;
            if settings.eval.log_gradients && targets.is_none() {
                tracing::warn!("gradients requested without targets; none will be recorded");
            }
            if let Some(rows) = inputs.as_array() {
                if cli.batch_size.is_none() && !rows.is_empty() {
                    settings.eval.batch_size = rows.len();
                }
            }
            settings.validate()?;
            let model = load_model(cli.weights.as_deref(), &settings)?;

            let store = JsonDirStore::new(&store_dir)?;
            let mut recorder = Recorder::new(
                store,
                settings.recorder.dataset_name.clone(),
                settings.recorder.model_name.clone(),
                settings.recorder.flush_every,
            );
            let mut evaluator = Evaluator::from_settings(model, &settings.eval)?;
            evaluator.evaluate_and_record(
                &inputs,
                targets.as_ref().map(|t| t as &dyn rnnvis::TokenSource),
                &mut recorder,
                settings.eval.verbose,
                settings.eval.refresh_state,
            )?;

            let stats = recorder.stats();
            tracing::info!(
                "Stored {} documents and {} rows in {} ({} flushes)",
                stats.documents,
                stats.rows_pushed,
                store_dir.display(),
                stats.flushes,
            );
        }

        Command::Init { out } => {
            settings.validate()?;
            let model = StackedRnn::new(&settings.model, settings.eval.batch_size)?;
            model.save(&out)?;
            tracing::info!(
                "Wrote {} parameters to {}",
                model.weights().param_count(),
                out.display()
            );
        }
    }

    tracing::info!("Done.");
    Ok(())
}

fn load_model(weights: Option<&Path>, settings: &RunSettings) -> anyhow::Result<StackedRnn> {
    let batch = settings.eval.batch_size;
    let model = match weights {
        Some(path) => StackedRnn::load(path, batch)
            .with_context(|| format!("loading checkpoint {}", path.display()))?,
        None => {
            tracing::warn!("No checkpoint given; using a seeded random model.");
            StackedRnn::new(&settings.model, batch)?
        }
    };
    let w = model.weights();
    tracing::info!(
        "Model: {} layers, vocab={}, embedding={}, {} parameters",
        w.cells.len(),
        w.vocab_size(),
        w.embedding.is_some(),
        w.param_count(),
    );
    Ok(model)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
