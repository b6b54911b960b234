mod benchmark;
mod inference;
mod model;
mod serving;

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

use inference::tokenizer::Tokenizer;
use serving::runner::RunnerConfig;
use serving::scheduler::SchedulerConfig;

#[derive(Parser)]
#[command(
    name = "paged-llm",
    version,
    about = "CPU inference server for Llama-style models with paged KV cache and continuous batching"
)]
struct Cli {
    /// Path to the model checkpoint (tokenizer.bin is resolved next to it)
    model_path: PathBuf,

    /// Prompt for single-generation mode
    #[arg(short = 'i', long)]
    prompt: Option<String>,

    /// JSON benchmark input with a "requests" array
    #[arg(long, conflicts_with = "prompt")]
    input_json: Option<PathBuf>,

    /// Sampling temperature
    #[arg(short = 't', long, default_value_t = 1.0)]
    temperature: f32,

    /// Top-p (nucleus) sampling mass
    #[arg(short = 'p', long, default_value_t = 0.9)]
    top_p: f32,

    /// Number of decode steps in single-prompt mode
    #[arg(short = 'n', long, default_value_t = 256)]
    steps: usize,

    /// Use the contiguous KV cache instead of paged attention
    #[arg(long)]
    without_paged_attn: bool,

    /// Legacy prefill chunk size; folded into the scheduler token budget
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Maximum requests per scheduled batch
    #[arg(long, default_value_t = 8)]
    max_batch_size: usize,

    /// Maximum total tokens per scheduled batch
    #[arg(long, default_value_t = 512)]
    max_tokens_per_batch: usize,

    /// Tokens per KV-cache block
    #[arg(long, default_value_t = 16)]
    block_size: usize,

    /// Total physical KV-cache blocks
    #[arg(long, default_value_t = 256)]
    num_blocks: usize,

    /// End-of-sequence token id
    #[arg(long, default_value_t = 2)]
    eos_id: u32,

    /// Replay arrival_delay_ms from the JSON input on a producer thread
    #[arg(long = "async", requires = "input_json")]
    async_arrivals: bool,

    /// Sampler base seed (defaults to wall clock)
    #[arg(long)]
    seed: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    if cli.prompt.is_none() && cli.input_json.is_none() {
        bail!("exactly one of --prompt and --input-json must be given");
    }
    if cli.without_paged_attn && cli.input_json.is_some() && cli.max_batch_size > 1 {
        bail!(
            "--without-paged-attn holds a single sequence; use --max-batch-size 1 in JSON mode"
        );
    }

    let (mut config, weights) = model::loader::load(&cli.model_path)?;
    config.use_paged_attention = !cli.without_paged_attn;
    config.block_size = cli.block_size;
    config.num_blocks = cli.num_blocks;
    let mut model = model::LlamaModel::new(config, weights)?;

    let tokenizer_path = match cli.model_path.parent() {
        Some(dir) => dir.join("tokenizer.bin"),
        None => PathBuf::from("tokenizer.bin"),
    };
    let tokenizer = Tokenizer::from_file(&tokenizer_path, model.config.vocab_size)?;

    let seed = cli.seed.unwrap_or_else(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    });

    if let Some(prompt) = &cli.prompt {
        info!(
            "single-prompt mode: temperature={} top_p={} steps={}",
            cli.temperature, cli.top_p, cli.steps
        );
        serving::runner::run_single_prompt(
            &mut model,
            &tokenizer,
            prompt,
            cli.temperature,
            cli.top_p,
            cli.steps,
            seed,
        )?;
        return Ok(());
    }

    let Some(json_path) = &cli.input_json else {
        unreachable!("argument validation guarantees a mode");
    };

    let mut max_tokens_per_batch = cli.max_tokens_per_batch;
    if let Some(chunk_size) = cli.chunk_size {
        warn!("--chunk-size is legacy; using it as the scheduler token budget");
        max_tokens_per_batch = chunk_size;
    }
    let scheduler_config = SchedulerConfig {
        max_batch_size: cli.max_batch_size,
        max_tokens_per_batch,
    };
    let runner_config = RunnerConfig {
        eos_id: cli.eos_id,
        seed,
        stream_output: true,
    };

    benchmark::run_json_benchmark(
        &mut model,
        &tokenizer,
        json_path,
        scheduler_config,
        runner_config,
        cli.async_arrivals,
    )
}
