//! Text generation binary.
//!
//! Loads the model bundle for an identifier and samples text from a seed,
//! streaming characters as they are produced.

use anyhow::{Context, Result};
use charnn::checkpoint::load_model;
use charnn::{EventSink, SequenceModel, TextSampler, TracingSink};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "charnn-generate",
    about = "Generate text from a trained character model"
)]
struct Args {
    /// User identifier the model was trained for
    identifier: String,

    /// Directory holding model bundles
    #[arg(long, default_value = "saved_models")]
    model_dir: PathBuf,

    /// Number of characters to generate
    #[arg(long, default_value_t = 200)]
    length: usize,

    /// Text to start generation from
    #[arg(long, default_value = "Merhaba")]
    seed: String,

    /// Sampling temperature (> 0); lower is more conservative
    #[arg(long, default_value_t = 0.5)]
    temperature: f32,

    /// Interactive mode: each input line is used as a seed
    #[arg(long)]
    interactive: bool,

    /// Seed for the random source, for reproducible output
    #[arg(long)]
    rng_seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("charnn=info")),
        )
        .init();

    let args = Args::parse();
    let sink = TracingSink;

    let loaded = load_model(&args.model_dir, &args.identifier, None)
        .with_context(|| format!("loading model for `{}`", args.identifier))?;
    sink.info(&format!(
        "loaded model: {} characters, embedding_dim={}, rnn_hidden_units={}, {} epochs",
        loaded.vocab.size(),
        loaded.config.embedding_dim,
        loaded.config.rnn_hidden_units,
        loaded.stats.epoch
    ));

    let sampler = TextSampler::new(&loaded.model, &loaded.vocab, args.temperature, &sink)?;
    let mut rng = match args.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if args.interactive {
        interactive_mode(&sampler, &args, &mut rng)
    } else {
        stream(&sampler, &args.seed, args.length, &mut rng)
    }
}

/// Print the seed, then each character as soon as it is sampled.
fn stream(
    sampler: &TextSampler<'_, SequenceModel>,
    seed: &str,
    length: usize,
    rng: &mut StdRng,
) -> Result<()> {
    let mut stdout = io::stdout().lock();
    let mut session = sampler.session(seed, rng);
    write!(stdout, "{}", session.seed())?;
    for c in session.by_ref().take(length) {
        write!(stdout, "{}", c?)?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn interactive_mode(
    sampler: &TextSampler<'_, SequenceModel>,
    args: &Args,
    rng: &mut StdRng,
) -> Result<()> {
    eprintln!("Interactive mode. Type a seed and press Enter; 'quit' exits.");
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        eprint!("> ");
        io::stderr().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let seed = line.trim_end_matches(['\r', '\n']);
        if seed == "quit" || seed == "exit" {
            break;
        }
        if seed.trim().is_empty() {
            continue;
        }
        stream(sampler, seed, args.length, rng)?;
    }
    Ok(())
}
