//! Forward driver: executes scheduled batches end to end
//!
//! Continuous batching with interleaved execution: decode-first scheduling,
//! single-phase batches, per-request progress cursors, one transformer forward
//! per scheduled token. Requests share nothing but the physical KV pool, at
//! disjoint block ids, so the traversal order inside a batch is stable but
//! observationally independent.
//!
//! An allocation failure during a forward step is contained to the request
//! that hit it: the request is marked failed with an OOM reason, its blocks go
//! back to the pool, and the loop moves on.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::inference::sampler::Sampler;
use crate::inference::tokenizer::Tokenizer;
use crate::model::{ForwardError, LlamaModel};
use crate::serving::arrival_queue::ArrivalQueue;
use crate::serving::block_allocator::BlockAllocator;
use crate::serving::metrics::BenchmarkMetrics;
use crate::serving::request::{FinishReason, Request, RequestId, RequestStatus};
use crate::serving::scheduler::{ScheduledBatch, Scheduler};

/// How long the async loop waits on the arrival queue before re-checking
/// termination.
const IDLE_WAIT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// End-of-sequence token id
    pub eos_id: u32,
    /// Base sampler seed; request `id` samples with `seed + id`
    pub seed: u64,
    /// Echo generated pieces to stdout as they appear
    pub stream_output: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            eos_id: crate::inference::tokenizer::EOS_ID,
            seed: 0,
            stream_output: false,
        }
    }
}

pub struct BatchedRunner<'m> {
    model: &'m mut LlamaModel,
    tokenizer: &'m Tokenizer,
    config: RunnerConfig,
    allocator: Option<Arc<BlockAllocator>>,
    requests: HashMap<RequestId, Request>,
    samplers: HashMap<RequestId, Sampler>,
}

impl<'m> BatchedRunner<'m> {
    pub fn new(model: &'m mut LlamaModel, tokenizer: &'m Tokenizer, config: RunnerConfig) -> Self {
        let allocator = model.block_allocator();
        Self {
            model,
            tokenizer,
            config,
            allocator,
            requests: HashMap::new(),
            samplers: HashMap::new(),
        }
    }

    /// Tokenize (if needed) and hand a request to the scheduler.
    pub fn admit(&mut self, mut request: Request, scheduler: &mut Scheduler) {
        if request.prompt_tokens.is_empty() {
            request.prompt_tokens = self.tokenizer.encode(&request.prompt, true, false);
        }
        if request.prompt_tokens.is_empty() {
            warn!("dropping request {} with an empty prompt", request.id);
            return;
        }
        clamp_prompt(&mut request, self.model.config.max_seq_len);
        self.samplers.insert(
            request.id,
            Sampler::new(
                request.sampling_params.temperature,
                request.sampling_params.top_p,
                self.config.seed.wrapping_add(request.id),
            ),
        );
        scheduler.add_request(&mut request);
        self.requests.insert(request.id, request);
    }

    /// Run a fixed set of requests to completion. Returns the aggregate
    /// metrics and the requests themselves, ordered by id.
    pub fn run_all(
        &mut self,
        requests: Vec<Request>,
        scheduler: &mut Scheduler,
    ) -> (BenchmarkMetrics, Vec<Request>) {
        for request in requests {
            self.admit(request, scheduler);
        }

        let start = Instant::now();
        let mut iteration = 0usize;
        while scheduler.has_work() {
            let batch = scheduler.schedule(&mut self.requests);
            if batch.is_empty() {
                break;
            }
            info!(
                "iteration {}: {} requests ({}), {} tokens",
                iteration,
                batch.size(),
                if batch.is_prefill { "prefill" } else { "decode" },
                batch.total_scheduled_tokens
            );
            self.execute_batch(batch, scheduler);
            iteration += 1;
        }

        self.collect_metrics(start)
    }

    /// Serve requests arriving through the queue until the producer signals
    /// done and all admitted work drains.
    pub fn run_async(
        &mut self,
        queue: &ArrivalQueue,
        scheduler: &mut Scheduler,
    ) -> (BenchmarkMetrics, Vec<Request>) {
        let start = Instant::now();

        loop {
            for request in queue.drain() {
                self.admit(request, scheduler);
            }

            if scheduler.has_work() {
                let batch = scheduler.schedule(&mut self.requests);
                if !batch.is_empty() {
                    self.execute_batch(batch, scheduler);
                    continue;
                }
            }

            if queue.is_done() && !queue.has_pending() && !scheduler.has_work() {
                break;
            }
            queue.wait_for_arrivals(IDLE_WAIT);
        }

        self.collect_metrics(start)
    }

    /// Execute one scheduled batch.
    pub fn execute_batch(&mut self, batch: ScheduledBatch, scheduler: &mut Scheduler) {
        if batch.is_prefill {
            self.run_prefill_batch(batch, scheduler);
        } else {
            self.run_decode_batch(batch, scheduler);
        }
    }

    // Advance each request by its scheduled chunk of prompt tokens.
    fn run_prefill_batch(&mut self, batch: ScheduledBatch, scheduler: &mut Scheduler) {
        for (id, chunk) in batch.entries {
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            let start = Instant::now();
            let mut failed = false;

            for t in 0..chunk {
                let token_idx = request.prefill_cursor + t;
                if token_idx >= request.num_prompt_tokens() {
                    break;
                }
                let token = request.prompt_tokens[token_idx];
                let result = if self.model.config.use_paged_attention {
                    self.model.forward_with_request(token, request.current_pos, request)
                } else {
                    self.model.forward(token, request.current_pos)
                };
                if let Err(ForwardError::OutOfBlocks { pos }) = result {
                    warn!("request {} out of blocks at position {}", id, pos);
                    failed = true;
                    break;
                }
                request.current_pos += 1;
                request.num_computed_tokens += 1;
            }

            request.prefill_time_ms += start.elapsed().as_secs_f64() * 1000.0;

            if failed {
                Self::fail_oom(request, scheduler, self.allocator.as_deref());
                continue;
            }

            request.prefill_cursor += chunk;

            if !request.is_prefill() {
                if let Some(&last) = request.prompt_tokens.last() {
                    request.last_token = last;
                }
                request.status = RequestStatus::Decoding;
                info!(
                    "request {} prefill complete: {} tokens",
                    id,
                    request.num_prompt_tokens()
                );
                if self.config.stream_output {
                    print!("\n[{}] ", id);
                    let _ = std::io::stdout().flush();
                }
            }
        }
    }

    // Generate exactly one token for each request in the batch.
    fn run_decode_batch(&mut self, batch: ScheduledBatch, scheduler: &mut Scheduler) {
        for (id, _) in batch.entries {
            let Some(request) = self.requests.get_mut(&id) else {
                continue;
            };
            let start = Instant::now();

            let result = if self.model.config.use_paged_attention {
                self.model
                    .forward_with_request(request.last_token, request.current_pos, request)
            } else {
                self.model.forward(request.last_token, request.current_pos)
            };
            if let Err(ForwardError::OutOfBlocks { pos }) = result {
                warn!("request {} out of blocks at position {}", id, pos);
                request.decode_time_ms += start.elapsed().as_secs_f64() * 1000.0;
                Self::fail_oom(request, scheduler, self.allocator.as_deref());
                continue;
            }

            let sampler = self
                .samplers
                .get(&id)
                .expect("sampler created at admission");
            let next_token = sampler.sample(&mut self.model.state.logits);

            request.generated_tokens.push(next_token);
            request.current_pos += 1;
            request.num_computed_tokens += 1;
            request.last_token = next_token;

            let piece = self.tokenizer.decode(next_token);
            request.output_text.push_str(&piece);
            if self.config.stream_output {
                print!("{piece}");
                let _ = std::io::stdout().flush();
            }

            request.decode_time_ms += start.elapsed().as_secs_f64() * 1000.0;

            // Completion checks, in priority order
            let reason = if next_token == self.config.eos_id {
                Some(FinishReason::Eos)
            } else if !request.can_generate_more() {
                Some(FinishReason::MaxTokens)
            } else if request.current_pos >= self.model.config.max_seq_len {
                Some(FinishReason::MaxSeqLen)
            } else {
                None
            };

            if let Some(reason) = reason {
                request.finished_reason = reason;
                if self.config.stream_output {
                    println!();
                }
                info!(
                    "request {} finished ({}): {} tokens",
                    id,
                    reason,
                    request.num_generated_tokens()
                );
                if let Some(allocator) = &self.allocator {
                    allocator.free_request(id);
                }
                scheduler.finish_request(request);
            }
        }
    }

    fn fail_oom(request: &mut Request, scheduler: &mut Scheduler, allocator: Option<&BlockAllocator>) {
        request.finished_reason = FinishReason::Oom;
        if let Some(allocator) = allocator {
            allocator.free_request(request.id);
        }
        scheduler.fail_request(request);
    }

    fn collect_metrics(&mut self, start: Instant) -> (BenchmarkMetrics, Vec<Request>) {
        let mut metrics = BenchmarkMetrics {
            total_time_ms: start.elapsed().as_secs_f64() * 1000.0,
            ..Default::default()
        };
        let mut requests: Vec<Request> = self.requests.drain().map(|(_, r)| r).collect();
        requests.sort_by_key(|r| r.id);
        for request in &requests {
            metrics.add_request(request);
        }
        self.samplers.clear();
        (metrics, requests)
    }
}

// The last prompt position must leave room for one decode forward, so the
// usable prompt length is max_seq_len - 1.
fn clamp_prompt(request: &mut Request, max_seq_len: usize) {
    let limit = max_seq_len.saturating_sub(1);
    if request.prompt_tokens.len() > limit {
        warn!(
            "request {} prompt of {} tokens exceeds context, truncating to {}",
            request.id,
            request.prompt_tokens.len(),
            limit
        );
        request.prompt_tokens.truncate(limit);
    }
}

/// Generate from a single prompt using model-global cache state. Runs `steps`
/// decode steps or until the context fills, echoing pieces to stdout.
pub fn run_single_prompt(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    prompt: &str,
    temperature: f32,
    top_p: f32,
    steps: usize,
    seed: u64,
) -> anyhow::Result<()> {
    let sampler = Sampler::new(temperature, top_p, seed);
    let mut tokens = tokenizer.encode(prompt, true, false);
    let limit = model.config.max_seq_len.saturating_sub(1);
    if tokens.len() > limit {
        warn!("prompt of {} tokens exceeds context, truncating to {}", tokens.len(), limit);
        tokens.truncate(limit);
    }
    info!("encoded prompt into {} tokens", tokens.len());

    print!("\n{prompt}");
    let _ = std::io::stdout().flush();

    let mut pos = 0usize;
    for &token in &tokens[..tokens.len().saturating_sub(1)] {
        model.forward(token, pos)?;
        pos += 1;
    }
    let mut token = *tokens.last().unwrap_or(&crate::inference::tokenizer::BOS_ID);

    let start = Instant::now();
    for _ in 0..steps {
        model.forward(token, pos)?;
        let next_token = sampler.sample(&mut model.state.logits);
        print!("{}", tokenizer.decode(next_token));
        let _ = std::io::stdout().flush();
        token = next_token;
        pos += 1;
        if pos >= model.config.max_seq_len {
            break;
        }
    }
    println!();
    info!(
        "generation completed in {:.2}s",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}

/// Process one request to completion on model-global cache state. Used by the
/// sequential benchmark mode; the caller resets the cache between requests.
///
/// An OOM during the forward pass fails the request in place and returns Ok.
pub fn process_request(
    model: &mut LlamaModel,
    tokenizer: &Tokenizer,
    request: &mut Request,
    config: &RunnerConfig,
) {
    if request.prompt_tokens.is_empty() {
        request.prompt_tokens = tokenizer.encode(&request.prompt, true, false);
    }
    clamp_prompt(request, model.config.max_seq_len);
    request.status = RequestStatus::Prefilling;

    let sampler = Sampler::new(
        request.sampling_params.temperature,
        request.sampling_params.top_p,
        config.seed.wrapping_add(request.id),
    );

    // Prefill everything but the final prompt token
    let prefill_start = Instant::now();
    for i in 0..request.num_prompt_tokens().saturating_sub(1) {
        let token = request.prompt_tokens[i];
        if model.forward(token, request.current_pos).is_err() {
            request.prefill_time_ms += prefill_start.elapsed().as_secs_f64() * 1000.0;
            request.finished_reason = FinishReason::Oom;
            request.status = RequestStatus::Failed;
            return;
        }
        request.current_pos += 1;
        request.num_computed_tokens += 1;
    }
    request.prefill_cursor = request.num_prompt_tokens();
    request.prefill_time_ms += prefill_start.elapsed().as_secs_f64() * 1000.0;

    request.status = RequestStatus::Decoding;
    let Some(&last) = request.prompt_tokens.last() else {
        request.status = RequestStatus::Finished;
        return;
    };
    let mut token = last;

    let decode_start = Instant::now();
    loop {
        if model.forward(token, request.current_pos).is_err() {
            request.finished_reason = FinishReason::Oom;
            request.status = RequestStatus::Failed;
            break;
        }
        let next_token = sampler.sample(&mut model.state.logits);
        request.generated_tokens.push(next_token);
        request.current_pos += 1;
        request.num_computed_tokens += 1;
        request.last_token = next_token;

        let piece = tokenizer.decode(next_token);
        request.output_text.push_str(&piece);
        if config.stream_output {
            print!("{piece}");
            let _ = std::io::stdout().flush();
        }

        if next_token == config.eos_id {
            request.finished_reason = FinishReason::Eos;
            request.status = RequestStatus::Finished;
            break;
        }
        if !request.can_generate_more() {
            request.finished_reason = FinishReason::MaxTokens;
            request.status = RequestStatus::Finished;
            break;
        }
        if request.current_pos >= model.config.max_seq_len {
            request.finished_reason = FinishReason::MaxSeqLen;
            request.status = RequestStatus::Finished;
            break;
        }
        token = next_token;
    }
    request.decode_time_ms += decode_start.elapsed().as_secs_f64() * 1000.0;
}
