//! Streams a completion from a local Mistral-family checkpoint.
//!
//! Run with: cargo run --release --example generate -- --model-dir <dir> "Once upon a time"

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use futures_util::{pin_mut, StreamExt};
use kjarni_decode::GenerateParameters;
use kjarni_mistral::TextGenerator;

#[derive(Parser, Debug)]
#[command(name = "generate")]
#[command(about = "Generate text with a Mistral-family model", long_about = None)]
struct Args {
    /// Prompt to complete
    prompt: String,

    /// Directory with config.json, tokenizer.json and safetensors weights
    #[arg(short, long)]
    model_dir: PathBuf,

    /// Maximum tokens to generate
    #[arg(short = 'n', long, default_value_t = 128)]
    max_tokens: usize,

    /// Sampling temperature (0.0 = greedy)
    #[arg(short, long, default_value_t = 0.6)]
    temperature: f32,

    /// Top-P (nucleus) sampling threshold
    #[arg(long, default_value_t = 1.0)]
    top_p: f32,

    /// Repetition penalty; disabled when omitted
    #[arg(long)]
    repetition_penalty: Option<f32>,

    /// Number of recent tokens the repetition penalty considers
    #[arg(long, default_value_t = 20)]
    repetition_context: usize,

    /// Prompt tokens processed per prefill chunk
    #[arg(long, default_value_t = 512)]
    prefill_step: usize,

    /// Seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let params = GenerateParameters {
        prefill_step_size: args.prefill_step,
        temperature: args.temperature,
        top_p: args.top_p,
        repetition_penalty: args.repetition_penalty,
        repetition_context_size: args.repetition_context,
        seed: args.seed,
    };
    params.validate()?;

    let generator = TextGenerator::from_pretrained(&args.model_dir)?;

    print!("{}", args.prompt);
    let stream = generator.generate_stream(&args.prompt, &params, args.max_tokens)?;
    pin_mut!(stream);
    let mut stdout = std::io::stdout();
    while let Some(token) = stream.next().await {
        print!("{}", token?.text);
        stdout.flush()?;
    }
    println!();
    Ok(())
}
