//! KV cache storage for transformer attention
//!
//! One flat `f32` buffer per key and per value, in one of two layouts:
//!
//! - Contiguous: `[n_layers, max_seq_len, n_kv_heads, head_dim]`, a full
//!   reservation for a single sequence. Simple addressing, wasteful when many
//!   sequences coexist.
//! - Paged: `[n_layers, num_blocks, block_size, n_kv_heads, head_dim]`, a
//!   shared pool of fixed-size blocks handed out by the block allocator, with
//!   per-sequence block tables mapping logical to physical blocks.
//!
//! The layout is a closed choice made at model init; the forward path
//! branches on it directly rather than going through a trait object.

use tracing::debug;

/// Hard ceiling on cache elements per buffer (~100 GiB of f32).
pub const MAX_CACHE_ELEMENTS: usize = 25_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("KV cache of {0} elements exceeds the hard limit")]
    TooLarge(usize),
}

/// Addressing scheme for the cache buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvLayout {
    Contiguous { max_seq_len: usize },
    Paged { num_blocks: usize, block_size: usize },
}

impl KvLayout {
    /// Elements per layer (one buffer).
    fn layer_stride(&self, kv_dim: usize) -> usize {
        match *self {
            KvLayout::Contiguous { max_seq_len } => max_seq_len * kv_dim,
            KvLayout::Paged {
                num_blocks,
                block_size,
            } => num_blocks * block_size * kv_dim,
        }
    }
}

/// Key and value buffers for all layers, in a single layout.
pub struct KvCache {
    layout: KvLayout,
    key: Vec<f32>,
    value: Vec<f32>,
    n_layers: usize,
    /// `n_kv_heads * head_dim`
    kv_dim: usize,
}

impl KvCache {
    /// Contiguous per-sequence cache reserving the full `max_seq_len`.
    pub fn contiguous(n_layers: usize, max_seq_len: usize, kv_dim: usize) -> Result<Self, CacheError> {
        Self::new(KvLayout::Contiguous { max_seq_len }, n_layers, kv_dim)
    }

    /// Paged cache backing `num_blocks` physical blocks of `block_size` tokens.
    pub fn paged(
        n_layers: usize,
        num_blocks: usize,
        block_size: usize,
        kv_dim: usize,
    ) -> Result<Self, CacheError> {
        Self::new(
            KvLayout::Paged {
                num_blocks,
                block_size,
            },
            n_layers,
            kv_dim,
        )
    }

    fn new(layout: KvLayout, n_layers: usize, kv_dim: usize) -> Result<Self, CacheError> {
        let total = n_layers * layout.layer_stride(kv_dim);
        if total > MAX_CACHE_ELEMENTS {
            return Err(CacheError::TooLarge(total));
        }
        debug!(
            "KV cache allocated: layout={:?}, layers={}, {:.1} MB per buffer",
            layout,
            n_layers,
            (total * std::mem::size_of::<f32>()) as f64 / (1024.0 * 1024.0)
        );
        Ok(Self {
            layout,
            key: vec![0.0; total],
            value: vec![0.0; total],
            n_layers,
            kv_dim,
        })
    }

    pub fn layout(&self) -> KvLayout {
        self.layout
    }

    pub fn is_paged(&self) -> bool {
        matches!(self.layout, KvLayout::Paged { .. })
    }

    /// Key buffer slice for one layer.
    pub fn layer_key(&self, layer: usize) -> &[f32] {
        let stride = self.layout.layer_stride(self.kv_dim);
        &self.key[layer * stride..(layer + 1) * stride]
    }

    /// Value buffer slice for one layer.
    pub fn layer_value(&self, layer: usize) -> &[f32] {
        let stride = self.layout.layer_stride(self.kv_dim);
        &self.value[layer * stride..(layer + 1) * stride]
    }

    /// Write one position's K and V vectors in contiguous layout.
    pub fn write_contiguous(&mut self, layer: usize, pos: usize, k: &[f32], v: &[f32]) {
        debug_assert!(matches!(self.layout, KvLayout::Contiguous { .. }));
        let stride = self.layout.layer_stride(self.kv_dim);
        let off = layer * stride + pos * self.kv_dim;
        self.key[off..off + self.kv_dim].copy_from_slice(k);
        self.value[off..off + self.kv_dim].copy_from_slice(v);
    }

    /// Write one position's K and V vectors into a physical block slot.
    pub fn write_paged(
        &mut self,
        layer: usize,
        physical_block: usize,
        block_offset: usize,
        k: &[f32],
        v: &[f32],
    ) {
        let KvLayout::Paged { block_size, .. } = self.layout else {
            unreachable!("write_paged on a contiguous cache");
        };
        let stride = self.layout.layer_stride(self.kv_dim);
        let off = layer * stride
            + physical_block * block_size * self.kv_dim
            + block_offset * self.kv_dim;
        self.key[off..off + self.kv_dim].copy_from_slice(k);
        self.value[off..off + self.kv_dim].copy_from_slice(v);
    }

    /// Zero both buffers (reused between sequential runs).
    pub fn clear(&mut self) {
        self.key.fill(0.0);
        self.value.fill(0.0);
    }

    pub fn n_layers(&self) -> usize {
        self.n_layers
    }

    /// Total memory for key + value buffers.
    pub fn size_bytes(&self) -> usize {
        (self.key.len() + self.value.len()) * std::mem::size_of::<f32>()
    }
}
