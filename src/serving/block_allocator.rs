//! Physical block pool for the paged KV cache
//!
//! Owns the free list for `num_blocks` fixed-size blocks and tracks which
//! blocks each request holds, so that a finished or failed request can return
//! everything in one call. All mutation is serialized by a single internal
//! lock; no callback runs inside it, and no lock is held across a forward
//! step.
//!
//! Allocation failure is a value (`AllocError::OutOfBlocks`), never a panic:
//! the forward driver turns it into a per-request OOM failure.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::serving::request::RequestId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of physical KV-cache blocks")]
    OutOfBlocks,
}

struct AllocState {
    /// `free[i]` is true when physical block `i` is available.
    free: Vec<bool>,
    num_free: usize,
    /// Blocks currently held per request, in allocation order.
    request_blocks: HashMap<RequestId, Vec<usize>>,
}

impl AllocState {
    fn allocate_block(&mut self) -> Option<usize> {
        if self.num_free == 0 {
            return None;
        }
        // First-fit scan; the order is not observable to callers.
        let block_id = self.free.iter().position(|&f| f)?;
        self.free[block_id] = false;
        self.num_free -= 1;
        Some(block_id)
    }

    fn free_block(&mut self, block_id: usize) {
        if block_id >= self.free.len() {
            warn!("ignoring free of out-of-range block {}", block_id);
            return;
        }
        if self.free[block_id] {
            warn!("block {} is already free", block_id);
            return;
        }
        self.free[block_id] = true;
        self.num_free += 1;
    }
}

pub struct BlockAllocator {
    inner: Mutex<AllocState>,
    num_blocks: usize,
    block_size: usize,
}

impl BlockAllocator {
    pub fn new(num_blocks: usize, block_size: usize) -> Self {
        info!(
            "Block allocator initialized: {} blocks of {} tokens",
            num_blocks, block_size
        );
        Self {
            inner: Mutex::new(AllocState {
                free: vec![true; num_blocks],
                num_free: num_blocks,
                request_blocks: HashMap::new(),
            }),
            num_blocks,
            block_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AllocState> {
        // A poisoned lock means another thread panicked mid-update; the state
        // itself is a flat free list, still safe to read.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate one block without request tracking.
    ///
    /// Used by the single-sequence paged path, where the model keeps a global
    /// block table instead of per-request tables.
    pub fn allocate_block(&self) -> Result<usize, AllocError> {
        let mut state = self.lock();
        let block_id = state.allocate_block().ok_or(AllocError::OutOfBlocks)?;
        debug!("allocated block {}", block_id);
        Ok(block_id)
    }

    /// Free one untracked block. Double-frees and out-of-range ids are
    /// ignored with a warning.
    pub fn free_block(&self, block_id: usize) {
        self.lock().free_block(block_id);
    }

    /// Allocate one block and record it against `request_id`.
    pub fn allocate_block_for_request(&self, request_id: RequestId) -> Result<usize, AllocError> {
        let mut state = self.lock();
        let block_id = state.allocate_block().ok_or(AllocError::OutOfBlocks)?;
        state.request_blocks.entry(request_id).or_default().push(block_id);
        Ok(block_id)
    }

    /// Allocate enough blocks for `num_tokens` tokens and record them against
    /// `request_id`. If the pool runs dry midway, every block acquired during
    /// this call is returned before the error.
    pub fn allocate_for_request(
        &self,
        request_id: RequestId,
        num_tokens: usize,
    ) -> Result<Vec<usize>, AllocError> {
        let blocks_needed = num_tokens.div_ceil(self.block_size);
        let mut state = self.lock();

        if blocks_needed > state.num_free {
            return Err(AllocError::OutOfBlocks);
        }

        let mut allocated = Vec::with_capacity(blocks_needed);
        for _ in 0..blocks_needed {
            match state.allocate_block() {
                Some(block_id) => allocated.push(block_id),
                None => {
                    for &b in &allocated {
                        state.free_block(b);
                    }
                    return Err(AllocError::OutOfBlocks);
                }
            }
        }

        state
            .request_blocks
            .entry(request_id)
            .or_default()
            .extend_from_slice(&allocated);
        Ok(allocated)
    }

    /// Return every block held by `request_id` to the pool. Idempotent:
    /// unknown ids are a no-op.
    pub fn free_request(&self, request_id: RequestId) {
        let mut state = self.lock();
        let Some(blocks) = state.request_blocks.remove(&request_id) else {
            return;
        };
        for block_id in &blocks {
            state.free_block(*block_id);
        }
        debug!("freed {} blocks for request {}", blocks.len(), request_id);
    }

    /// Blocks currently held by a request, in allocation order.
    pub fn request_blocks(&self, request_id: RequestId) -> Vec<usize> {
        self.lock()
            .request_blocks
            .get(&request_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn request_block_count(&self, request_id: RequestId) -> usize {
        self.lock()
            .request_blocks
            .get(&request_id)
            .map_or(0, Vec::len)
    }

    pub fn num_free_blocks(&self) -> usize {
        self.lock().num_free
    }

    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn is_free(&self, block_id: usize) -> bool {
        let state = self.lock();
        block_id < state.free.len() && state.free[block_id]
    }

    /// Fraction of the pool in use, 0.0 to 1.0.
    pub fn utilization(&self) -> f32 {
        if self.num_blocks == 0 {
            return 0.0;
        }
        1.0 - self.lock().num_free as f32 / self.num_blocks as f32
    }

    pub fn num_active_requests(&self) -> usize {
        self.lock().request_blocks.len()
    }
}
