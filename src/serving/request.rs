//! Request lifecycle model
//!
//! A request carries its prompt, sampling parameters, generation cursors, and
//! per-layer block tables. The scheduler and the forward driver communicate
//! entirely through these fields; there is no shared global state.
//!
//! Lifecycle: Pending → Prefilling → Decoding → Finished (or Failed). Blocks
//! are released the moment a request leaves the running set.

use std::fmt;

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Waiting in the pending queue
    Pending,
    /// Processing prompt tokens
    Prefilling,
    /// Generating output tokens
    Decoding,
    /// Completed successfully
    Finished,
    /// Failed with an error
    Failed,
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestStatus::Pending => "PENDING",
            RequestStatus::Prefilling => "PREFILLING",
            RequestStatus::Decoding => "DECODING",
            RequestStatus::Finished => "FINISHED",
            RequestStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Why a request stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Still running
    None,
    /// Sampled the end-of-sequence token
    Eos,
    /// Reached the request's max_tokens
    MaxTokens,
    /// Reached the model's max sequence length
    MaxSeqLen,
    /// No free KV-cache blocks
    Oom,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FinishReason::None => "NONE",
            FinishReason::Eos => "EOS",
            FinishReason::MaxTokens => "MAX_TOKENS",
            FinishReason::MaxSeqLen => "MAX_SEQ_LEN",
            FinishReason::Oom => "OOM",
        };
        f.write_str(s)
    }
}

/// Per-request generation configuration.
#[derive(Debug, Clone, Copy)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: usize,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
            max_tokens: 256,
        }
    }
}

pub struct Request {
    pub id: RequestId,

    // Input
    pub prompt: String,
    pub prompt_tokens: Vec<u32>,
    pub sampling_params: SamplingParams,

    // State
    pub status: RequestStatus,
    /// Next absolute position to be written; advances by one per forward step.
    pub current_pos: usize,
    /// Total tokens (prompt + generated) pushed through the model.
    pub num_computed_tokens: usize,
    /// Prompt tokens whose forward pass has completed.
    pub prefill_cursor: usize,
    /// Token to feed at the next decode step. Valid once status is Decoding.
    pub last_token: u32,
    pub finished_reason: FinishReason,
    pub generated_tokens: Vec<u32>,

    /// Per-layer block tables: `block_tables[layer][logical] = physical`.
    /// Each request owns its tables; the allocator guarantees disjointness.
    pub block_tables: Vec<Vec<usize>>,

    // Output
    pub output_text: String,

    // Metrics
    pub prefill_time_ms: f64,
    pub decode_time_ms: f64,
    /// Delay before this request "arrives", for the arrival simulator.
    pub arrival_delay_ms: u64,
}

impl Request {
    pub fn new(id: RequestId, prompt: impl Into<String>, params: SamplingParams) -> Self {
        Self {
            id,
            prompt: prompt.into(),
            prompt_tokens: Vec::new(),
            sampling_params: params,
            status: RequestStatus::Pending,
            current_pos: 0,
            num_computed_tokens: 0,
            prefill_cursor: 0,
            last_token: 0,
            finished_reason: FinishReason::None,
            generated_tokens: Vec::new(),
            block_tables: Vec::new(),
            output_text: String::new(),
            prefill_time_ms: 0.0,
            decode_time_ms: 0.0,
            arrival_delay_ms: 0,
        }
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.prompt_tokens.len()
    }

    pub fn num_generated_tokens(&self) -> usize {
        self.generated_tokens.len()
    }

    pub fn total_tokens(&self) -> usize {
        self.num_prompt_tokens() + self.num_generated_tokens()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, RequestStatus::Finished | RequestStatus::Failed)
    }

    pub fn can_generate_more(&self) -> bool {
        self.num_generated_tokens() < self.sampling_params.max_tokens
    }

    /// Still has prompt tokens left to prefill.
    pub fn is_prefill(&self) -> bool {
        self.prefill_cursor < self.num_prompt_tokens()
    }

    pub fn remaining_prompt(&self) -> usize {
        self.num_prompt_tokens() - self.prefill_cursor
    }
}
