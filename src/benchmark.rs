//! JSON benchmark input and run-mode entry points
//!
//! The input file is an object with a `requests` array; each entry carries a
//! required non-empty `prompt` plus optional `temperature`, `top_p`,
//! `max_tokens`, and `arrival_delay_ms`. Unknown keys are ignored.
//!
//! Three run modes: sequential (one request at a time on a reset cache),
//! batched (continuous batching over the paged pool), and async (batched,
//! with a producer thread replaying arrival delays).

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::inference::tokenizer::Tokenizer;
use crate::model::LlamaModel;
use crate::serving::arrival_queue::ArrivalQueue;
use crate::serving::metrics::BenchmarkMetrics;
use crate::serving::request::{Request, SamplingParams};
use crate::serving::runner::{process_request, BatchedRunner, RunnerConfig};
use crate::serving::scheduler::{Scheduler, SchedulerConfig};
use crate::serving::submitter::spawn_submitter;

/// Parse the benchmark input file into requests, ids assigned in order.
pub fn parse_benchmark_input(path: &Path) -> Result<Vec<Request>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read benchmark input: {}", path.display()))?;
    parse_benchmark_json(&content)
}

fn parse_benchmark_json(content: &str) -> Result<Vec<Request>> {
    let root: Value = serde_json::from_str(content).context("invalid benchmark JSON")?;
    let Some(entries) = root.get("requests").and_then(Value::as_array) else {
        bail!("benchmark input has no 'requests' array");
    };

    let mut requests = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let prompt = entry.get("prompt").and_then(Value::as_str).unwrap_or("");
        if prompt.is_empty() {
            bail!("request {i} has an empty prompt");
        }
        let params = SamplingParams {
            temperature: entry
                .get("temperature")
                .and_then(Value::as_f64)
                .unwrap_or(1.0) as f32,
            top_p: entry.get("top_p").and_then(Value::as_f64).unwrap_or(0.9) as f32,
            max_tokens: entry
                .get("max_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(256) as usize,
        };
        let mut request = Request::new(i as u64, prompt, params);
        request.arrival_delay_ms = entry
            .get("arrival_delay_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        requests.push(request);
    }
    Ok(requests)
}

/// One request at a time, resetting the cache in between.
pub fn run_sequential(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    requests: Vec<Request>,
    config: &RunnerConfig,
) -> BenchmarkMetrics {
    let mut metrics = BenchmarkMetrics::default();
    let total_start = Instant::now();

    for mut request in requests {
        println!("\n--- Request {} ---", request.id);
        let preview: String = request.prompt.chars().take(50).collect();
        println!(
            "Prompt: {}{}",
            preview,
            if request.prompt.chars().count() > 50 { "..." } else { "" }
        );
        print!("Output: ");

        process_request(model, tokenizer, &mut request, config);
        println!();

        metrics.add_request(&request);
        model.reset_cache();
    }

    metrics.total_time_ms = total_start.elapsed().as_secs_f64() * 1000.0;
    metrics
}

/// Continuous batching over the paged pool.
pub fn run_batched(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    requests: Vec<Request>,
    scheduler_config: SchedulerConfig,
    runner_config: RunnerConfig,
) -> BenchmarkMetrics {
    info!(
        "batched mode: max_batch_size={} max_tokens_per_batch={}",
        scheduler_config.max_batch_size, scheduler_config.max_tokens_per_batch
    );
    let mut scheduler = Scheduler::new(scheduler_config);
    let mut runner = BatchedRunner::new(model, tokenizer, runner_config);
    let (metrics, _) = runner.run_all(requests, &mut scheduler);
    metrics
}

/// Continuous batching fed by a producer thread that replays each request's
/// arrival delay.
pub fn run_async(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    requests: Vec<Request>,
    scheduler_config: SchedulerConfig,
    runner_config: RunnerConfig,
) -> Result<BenchmarkMetrics> {
    info!("async mode: {} requests with simulated arrivals", requests.len());
    let queue = Arc::new(ArrivalQueue::new());
    let producer = spawn_submitter(requests, Arc::clone(&queue));

    let mut scheduler = Scheduler::new(scheduler_config);
    let mut runner = BatchedRunner::new(model, tokenizer, runner_config);
    let (metrics, _) = runner.run_async(&queue, &mut scheduler);

    if producer.join().is_err() {
        bail!("arrival producer thread panicked");
    }
    Ok(metrics)
}

/// Parse the input file and dispatch to the right mode.
pub fn run_json_benchmark(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    json_path: &Path,
    scheduler_config: SchedulerConfig,
    runner_config: RunnerConfig,
    async_arrivals: bool,
) -> Result<()> {
    let requests = parse_benchmark_input(json_path)?;
    info!("loaded {} requests from {}", requests.len(), json_path.display());

    let metrics = if async_arrivals {
        run_async(model, tokenizer, requests, scheduler_config, runner_config)?
    } else if scheduler_config.max_batch_size <= 1 {
        info!("sequential mode");
        run_sequential(model, tokenizer, requests, &runner_config)
    } else {
        run_batched(model, tokenizer, requests, scheduler_config, runner_config)
    };

    metrics.print();
    Ok(())
}
