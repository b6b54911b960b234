//! Llama model: configuration, weights, and the forward pass
//!
//! The forward pass runs one token at one position through the full layer
//! stack, appending K/V into the cache as it goes. Two cache addressing modes
//! exist, chosen once at init:
//!
//! - contiguous: one full-length reservation, positions addressed directly
//! - paged: fixed-size blocks from a shared pool, addressed via a block table
//!
//! `forward` uses model-global state (single sequence); `forward_with_request`
//! routes the paged cache through a request's own block tables so many
//! sequences can interleave on the same pool.

pub mod loader;

use std::sync::Arc;
use tracing::info;

use crate::inference::attention;
use crate::inference::kv_cache::KvCache;
use crate::inference::ops;
use crate::serving::block_allocator::{AllocError, BlockAllocator};
use crate::serving::request::Request;

/// Model shape (from the checkpoint header) plus serving knobs.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub vocab_size: usize,
    pub max_seq_len: usize,

    // Paged-attention serving knobs
    pub use_paged_attention: bool,
    /// Tokens per physical block
    pub block_size: usize,
    /// Total physical blocks in the pool
    pub num_blocks: usize,

    // Derived
    pub head_dim: usize,
    pub rope_theta: f32,
}

impl ModelConfig {
    pub fn kv_dim(&self) -> usize {
        self.n_kv_heads * self.head_dim
    }
}

pub struct LayerWeights {
    pub rms_att_weight: Vec<f32>, // [dim]
    pub wq: Vec<f32>,             // [n_heads * head_dim, dim]
    pub wk: Vec<f32>,             // [n_kv_heads * head_dim, dim]
    pub wv: Vec<f32>,             // [n_kv_heads * head_dim, dim]
    pub wo: Vec<f32>,             // [dim, n_heads * head_dim]
    pub rms_ffn_weight: Vec<f32>, // [dim]
    pub w_gate: Vec<f32>,         // [hidden_dim, dim]
    pub w_up: Vec<f32>,           // [hidden_dim, dim]
    pub w_down: Vec<f32>,         // [dim, hidden_dim]
}

pub struct TransformerWeights {
    pub token_embedding_table: Vec<f32>, // [vocab_size, dim]
    pub layers: Vec<LayerWeights>,
    pub rms_final_weight: Vec<f32>, // [dim]
    pub lm_head: Vec<f32>,          // [vocab_size, dim]
    /// lm_head is a copy of the embedding table (checkpoint had no separate head)
    pub tied_lm_head: bool,
}

/// Scratch buffers reused across forward calls.
pub struct RunState {
    x: Vec<f32>,
    xb: Vec<f32>,
    xb2: Vec<f32>,
    hb: Vec<f32>,
    hb2: Vec<f32>,
    q: Vec<f32>,
    k: Vec<f32>,
    v: Vec<f32>,
    att: Vec<f32>,
    pub logits: Vec<f32>,
}

impl RunState {
    fn new(config: &ModelConfig) -> Self {
        Self {
            x: vec![0.0; config.dim],
            xb: vec![0.0; config.dim],
            xb2: vec![0.0; config.dim],
            hb: vec![0.0; config.hidden_dim],
            hb2: vec![0.0; config.hidden_dim],
            q: vec![0.0; config.n_heads * config.head_dim],
            k: vec![0.0; config.kv_dim()],
            v: vec![0.0; config.kv_dim()],
            att: vec![0.0; config.n_heads * config.max_seq_len],
            logits: vec![0.0; config.vocab_size],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("out of KV-cache blocks at position {pos}")]
    OutOfBlocks { pos: usize },
}

pub struct LlamaModel {
    pub config: ModelConfig,
    pub weights: TransformerWeights,
    pub state: RunState,
    cache: KvCache,
    /// Pool shared by every sequence; present only in paged mode.
    allocator: Option<Arc<BlockAllocator>>,
    /// Block tables for the single-sequence paged path.
    block_tables: Vec<Vec<usize>>,
}

impl LlamaModel {
    pub fn new(config: ModelConfig, weights: TransformerWeights) -> anyhow::Result<Self> {
        let cache = if config.use_paged_attention {
            KvCache::paged(
                config.n_layers,
                config.num_blocks,
                config.block_size,
                config.kv_dim(),
            )?
        } else {
            KvCache::contiguous(config.n_layers, config.max_seq_len, config.kv_dim())?
        };

        let allocator = config
            .use_paged_attention
            .then(|| Arc::new(BlockAllocator::new(config.num_blocks, config.block_size)));

        info!(
            "Model ready: dim={} layers={} heads={} kv_heads={} vocab={} max_seq={} cache={}",
            config.dim,
            config.n_layers,
            config.n_heads,
            config.n_kv_heads,
            config.vocab_size,
            config.max_seq_len,
            if config.use_paged_attention {
                "paged"
            } else {
                "contiguous"
            }
        );

        let state = RunState::new(&config);
        let block_tables = vec![Vec::new(); config.n_layers];
        Ok(Self {
            config,
            weights,
            state,
            cache,
            allocator,
            block_tables,
        })
    }

    /// The shared block pool, when running paged.
    pub fn block_allocator(&self) -> Option<Arc<BlockAllocator>> {
        self.allocator.clone()
    }

    /// Zero the cache and release blocks held by the single-sequence path.
    /// Called between independent runs.
    pub fn reset_cache(&mut self) {
        self.cache.clear();
        if let Some(allocator) = &self.allocator {
            for table in &mut self.block_tables {
                for block_id in table.drain(..) {
                    allocator.free_block(block_id);
                }
            }
        }
    }

    /// Forward one token at `pos` using model-global cache state. Single
    /// sequence only: in paged mode the global block tables grow with `pos`.
    pub fn forward(&mut self, token: u32, pos: usize) -> Result<(), ForwardError> {
        if self.config.use_paged_attention {
            // Each layer claims a fresh block at every block boundary. If the
            // pool runs dry midway, the blocks taken by this call go back.
            if pos % self.config.block_size == 0 {
                let allocator = self.allocator.as_ref().expect("paged mode has an allocator");
                let mut claimed = Vec::with_capacity(self.block_tables.len());
                for _ in 0..self.block_tables.len() {
                    match allocator.allocate_block() {
                        Ok(block_id) => claimed.push(block_id),
                        Err(AllocError::OutOfBlocks) => {
                            for block_id in claimed {
                                allocator.free_block(block_id);
                            }
                            return Err(ForwardError::OutOfBlocks { pos });
                        }
                    }
                }
                for (table, block_id) in self.block_tables.iter_mut().zip(claimed) {
                    table.push(block_id);
                }
            }
            self.forward_paged_tables(token, pos, None)
        } else {
            self.forward_contiguous(token, pos);
            Ok(())
        }
    }

    /// Forward one token at `pos` against a request's own block tables,
    /// allocating blocks for the request at block boundaries.
    pub fn forward_with_request(
        &mut self,
        token: u32,
        pos: usize,
        request: &mut Request,
    ) -> Result<(), ForwardError> {
        let allocator = self
            .allocator
            .as_ref()
            .expect("forward_with_request requires paged attention");

        if request.block_tables.is_empty() {
            request.block_tables = vec![Vec::new(); self.config.n_layers];
        }

        if pos % self.config.block_size == 0 {
            for table in &mut request.block_tables {
                let block_id = allocator
                    .allocate_block_for_request(request.id)
                    .map_err(|AllocError::OutOfBlocks| ForwardError::OutOfBlocks { pos })?;
                table.push(block_id);
            }
        }

        self.forward_paged_tables(token, pos, Some(&request.block_tables))
    }

    fn forward_contiguous(&mut self, token: u32, pos: usize) {
        let config = &self.config;
        let weights = &self.weights;
        let state = &mut self.state;
        let kv_dim = config.kv_dim();

        let emb_off = token as usize * config.dim;
        state
            .x
            .copy_from_slice(&weights.token_embedding_table[emb_off..emb_off + config.dim]);

        for i in 0..config.n_layers {
            let l = &weights.layers[i];

            ops::rms_norm(&mut state.xb, &state.x, &l.rms_att_weight, 1e-5);

            ops::matmul(&mut state.q, &state.xb, &l.wq, config.dim, config.n_heads * config.head_dim);
            ops::matmul(&mut state.k, &state.xb, &l.wk, config.dim, kv_dim);
            ops::matmul(&mut state.v, &state.xb, &l.wv, config.dim, kv_dim);

            ops::apply_rope(
                &mut state.q,
                &mut state.k,
                pos,
                config.head_dim,
                config.n_heads,
                config.n_kv_heads,
                config.rope_theta,
            );

            self.cache.write_contiguous(i, pos, &state.k, &state.v);

            attention::standard_attention(
                &mut state.xb2,
                &state.q,
                self.cache.layer_key(i),
                self.cache.layer_value(i),
                &mut state.att,
                pos,
                config.head_dim,
                config.n_heads,
                config.n_kv_heads,
                config.max_seq_len,
            );

            ops::matmul(
                &mut state.xb,
                &state.xb2,
                &l.wo,
                config.n_heads * config.head_dim,
                config.dim,
            );
            for j in 0..config.dim {
                state.x[j] += state.xb[j];
            }

            ops::rms_norm(&mut state.xb, &state.x, &l.rms_ffn_weight, 1e-5);
            ops::matmul(&mut state.hb, &state.xb, &l.w_gate, config.dim, config.hidden_dim);
            ops::matmul(&mut state.hb2, &state.xb, &l.w_up, config.dim, config.hidden_dim);
            ops::swiglu(&mut state.hb, &state.hb2);
            ops::matmul(&mut state.xb, &state.hb, &l.w_down, config.hidden_dim, config.dim);
            for j in 0..config.dim {
                state.x[j] += state.xb[j];
            }
        }

        let mut normed = vec![0.0f32; config.dim];
        ops::rms_norm(&mut normed, &state.x, &weights.rms_final_weight, 1e-5);
        state.x.copy_from_slice(&normed);

        ops::matmul(&mut state.logits, &state.x, &weights.lm_head, config.dim, config.vocab_size);
    }

    /// Shared paged-mode layer stack. `tables` selects per-request block
    /// tables; `None` uses the model-global tables. Blocks must already be
    /// allocated for `pos`.
    fn forward_paged_tables(
        &mut self,
        token: u32,
        pos: usize,
        tables: Option<&Vec<Vec<usize>>>,
    ) -> Result<(), ForwardError> {
        let config = &self.config;
        let weights = &self.weights;
        let state = &mut self.state;
        let kv_dim = config.kv_dim();
        let block_size = config.block_size;
        let num_tokens = pos + 1;

        let emb_off = token as usize * config.dim;
        state
            .x
            .copy_from_slice(&weights.token_embedding_table[emb_off..emb_off + config.dim]);

        for i in 0..config.n_layers {
            let l = &weights.layers[i];
            let table: &[usize] = match tables {
                Some(t) => &t[i],
                None => &self.block_tables[i],
            };

            ops::rms_norm(&mut state.xb, &state.x, &l.rms_att_weight, 1e-5);

            ops::matmul(&mut state.q, &state.xb, &l.wq, config.dim, config.n_heads * config.head_dim);
            ops::matmul(&mut state.k, &state.xb, &l.wk, config.dim, kv_dim);
            ops::matmul(&mut state.v, &state.xb, &l.wv, config.dim, kv_dim);

            ops::apply_rope(
                &mut state.q,
                &mut state.k,
                pos,
                config.head_dim,
                config.n_heads,
                config.n_kv_heads,
                config.rope_theta,
            );

            let physical_block = table[pos / block_size];
            self.cache
                .write_paged(i, physical_block, pos % block_size, &state.k, &state.v);

            attention::paged_attention(
                &mut state.xb2,
                &state.q,
                self.cache.layer_key(i),
                self.cache.layer_value(i),
                table,
                &mut state.att,
                num_tokens,
                block_size,
                config.head_dim,
                config.n_heads,
                config.n_kv_heads,
            );

            ops::matmul(
                &mut state.xb,
                &state.xb2,
                &l.wo,
                config.n_heads * config.head_dim,
                config.dim,
            );
            for j in 0..config.dim {
                state.x[j] += state.xb[j];
            }

            ops::rms_norm(&mut state.xb, &state.x, &l.rms_ffn_weight, 1e-5);
            ops::matmul(&mut state.hb, &state.xb, &l.w_gate, config.dim, config.hidden_dim);
            ops::matmul(&mut state.hb2, &state.xb, &l.w_up, config.dim, config.hidden_dim);
            ops::swiglu(&mut state.hb, &state.hb2);
            ops::matmul(&mut state.xb, &state.hb, &l.w_down, config.hidden_dim, config.dim);
            for j in 0..config.dim {
                state.x[j] += state.xb[j];
            }
        }

        let mut normed = vec![0.0f32; config.dim];
        ops::rms_norm(&mut normed, &state.x, &weights.rms_final_weight, 1e-5);
        state.x.copy_from_slice(&normed);

        ops::matmul(&mut state.logits, &state.x, &weights.lm_head, config.dim, config.vocab_size);
        Ok(())
    }
}

#[cfg(test)]
pub mod testing {
    //! Tiny deterministic models for unit tests.

    use super::*;

    pub fn tiny_config(use_paged: bool, block_size: usize, num_blocks: usize) -> ModelConfig {
        ModelConfig {
            dim: 8,
            hidden_dim: 16,
            n_layers: 2,
            n_heads: 2,
            n_kv_heads: 1,
            vocab_size: 16,
            max_seq_len: 32,
            use_paged_attention: use_paged,
            block_size,
            num_blocks,
            head_dim: 4,
            rope_theta: 10000.0,
        }
    }

    fn tensor(len: usize, salt: usize) -> Vec<f32> {
        (0..len)
            .map(|i| ((i * 31 + salt * 17) as f32 * 0.7).sin() * 0.1)
            .collect()
    }

    pub fn tiny_weights(config: &ModelConfig) -> TransformerWeights {
        let dim = config.dim;
        let hidden = config.hidden_dim;
        let kv_dim = config.kv_dim();
        let layers = (0..config.n_layers)
            .map(|i| LayerWeights {
                rms_att_weight: tensor(dim, i + 1),
                wq: tensor(dim * config.n_heads * config.head_dim, i + 2),
                wk: tensor(dim * kv_dim, i + 3),
                wv: tensor(dim * kv_dim, i + 4),
                wo: tensor(config.n_heads * config.head_dim * dim, i + 5),
                rms_ffn_weight: tensor(dim, i + 6),
                w_gate: tensor(dim * hidden, i + 7),
                w_up: tensor(dim * hidden, i + 8),
                w_down: tensor(hidden * dim, i + 9),
            })
            .collect();

        TransformerWeights {
            token_embedding_table: tensor(config.vocab_size * dim, 99),
            layers,
            rms_final_weight: tensor(dim, 100),
            lm_head: tensor(config.vocab_size * dim, 101),
            tied_lm_head: false,
        }
    }

    pub fn tiny_model(use_paged: bool, block_size: usize, num_blocks: usize) -> LlamaModel {
        let config = tiny_config(use_paged, block_size, num_blocks);
        let weights = tiny_weights(&config);
        LlamaModel::new(config, weights).unwrap()
    }
}
