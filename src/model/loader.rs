//! Checkpoint loader for the llama2.c binary format
//!
//! Layout: 7 little-endian i32 config fields, then raw f32 tensor data in a
//! fixed order, grouped by parameter type (all layers' rms_att weights, then
//! all wq, and so on). If the file ends before a separate lm-head tensor, the
//! head is tied to the token embedding table.
//!
//! The file is memory-mapped and tensors are copied out into owned buffers.

use anyhow::{ensure, Context, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use std::fs::File;
use std::io::Cursor;
use std::path::Path;
use tracing::info;

use super::{LayerWeights, ModelConfig, TransformerWeights};

pub const DEFAULT_BLOCK_SIZE: usize = 16;
pub const DEFAULT_NUM_BLOCKS: usize = 256;

const HEADER_BYTES: usize = 7 * 4;

struct TensorReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TensorReader<'a> {
    fn take(&mut self, n_elements: usize, name: &str) -> Result<Vec<f32>> {
        let bytes = n_elements * 4;
        ensure!(
            self.offset + bytes <= self.data.len(),
            "checkpoint truncated while reading {name}"
        );
        let mut out = vec![0.0f32; n_elements];
        LittleEndian::read_f32_into(&self.data[self.offset..self.offset + bytes], &mut out);
        self.offset += bytes;
        Ok(out)
    }

    fn remaining_bytes(&self) -> usize {
        self.data.len() - self.offset
    }
}

/// Load a checkpoint. Serving knobs on the returned config start at their
/// defaults; the caller overrides them from the command line.
pub fn load(path: &Path) -> Result<(ModelConfig, TransformerWeights)> {
    info!("Loading model: {}", path.display());
    let file =
        File::open(path).with_context(|| format!("failed to open model file: {}", path.display()))?;
    // Safety: the mapping is read-only and lives only for the load
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("failed to mmap model file: {}", path.display()))?;

    ensure!(mmap.len() >= HEADER_BYTES, "model file too small for header");

    let mut header = Cursor::new(&mmap[..HEADER_BYTES]);
    let mut field = |name: &str| -> Result<usize> {
        let v = header.read_i32::<LittleEndian>()?;
        ensure!(v > 0, "invalid {name} in model header: {v}");
        Ok(v as usize)
    };
    let dim = field("dim")?;
    let hidden_dim = field("hidden_dim")?;
    let n_layers = field("n_layers")?;
    let n_heads = field("n_heads")?;
    let n_kv_heads = field("n_kv_heads")?;
    let vocab_size = field("vocab_size")?;
    let max_seq_len = field("max_seq_len")?;

    ensure!(dim % n_heads == 0, "dim {dim} not divisible by n_heads {n_heads}");
    ensure!(
        n_heads % n_kv_heads == 0,
        "n_heads {n_heads} not divisible by n_kv_heads {n_kv_heads}"
    );

    let config = ModelConfig {
        dim,
        hidden_dim,
        n_layers,
        n_heads,
        n_kv_heads,
        vocab_size,
        max_seq_len,
        use_paged_attention: true,
        block_size: DEFAULT_BLOCK_SIZE,
        num_blocks: DEFAULT_NUM_BLOCKS,
        head_dim: dim / n_heads,
        rope_theta: 10000.0,
    };
    info!(
        "Config: dim={} hidden={} layers={} heads={} kv_heads={} vocab={} max_seq={}",
        dim, hidden_dim, n_layers, n_heads, n_kv_heads, vocab_size, max_seq_len
    );

    let mut reader = TensorReader {
        data: &mmap[HEADER_BYTES..],
        offset: 0,
    };

    let token_embedding_table = reader.take(vocab_size * dim, "token_embedding_table")?;

    // Weights are grouped by parameter type, not by layer.
    let per_layer = |n: usize, name: &str, reader: &mut TensorReader| -> Result<Vec<Vec<f32>>> {
        (0..n_layers).map(|_| reader.take(n, name)).collect()
    };

    let q_dim = n_heads * config.head_dim;
    let kv_dim = n_kv_heads * config.head_dim;
    let mut rms_att = per_layer(dim, "rms_att_weight", &mut reader)?;
    let mut wq = per_layer(dim * q_dim, "wq", &mut reader)?;
    let mut wk = per_layer(dim * kv_dim, "wk", &mut reader)?;
    let mut wv = per_layer(dim * kv_dim, "wv", &mut reader)?;
    let mut wo = per_layer(q_dim * dim, "wo", &mut reader)?;
    let mut rms_ffn = per_layer(dim, "rms_ffn_weight", &mut reader)?;
    let mut w_gate = per_layer(dim * hidden_dim, "w_gate", &mut reader)?;
    let mut w_down = per_layer(hidden_dim * dim, "w_down", &mut reader)?;
    let mut w_up = per_layer(dim * hidden_dim, "w_up", &mut reader)?;

    let layers = (0..n_layers)
        .map(|i| LayerWeights {
            rms_att_weight: std::mem::take(&mut rms_att[i]),
            wq: std::mem::take(&mut wq[i]),
            wk: std::mem::take(&mut wk[i]),
            wv: std::mem::take(&mut wv[i]),
            wo: std::mem::take(&mut wo[i]),
            rms_ffn_weight: std::mem::take(&mut rms_ffn[i]),
            w_gate: std::mem::take(&mut w_gate[i]),
            w_up: std::mem::take(&mut w_up[i]),
            w_down: std::mem::take(&mut w_down[i]),
        })
        .collect();

    let rms_final_weight = reader.take(dim, "rms_final_weight")?;

    // A shared-weight checkpoint ends here; otherwise a separate head follows.
    let (lm_head, tied_lm_head) = if reader.remaining_bytes() >= vocab_size * dim * 4 {
        (reader.take(vocab_size * dim, "lm_head")?, false)
    } else {
        info!("lm_head tied to token embedding table");
        (token_embedding_table.clone(), true)
    };

    let weights = TransformerWeights {
        token_embedding_table,
        layers,
        rms_final_weight,
        lm_head,
        tied_lm_head,
    };

    Ok((config, weights))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    // dim=4, hidden=8, layers=2, heads=2, kv_heads=1, vocab=6, max_seq=16
    const DIM: usize = 4;
    const HIDDEN: usize = 8;
    const LAYERS: usize = 2;
    const HEADS: usize = 2;
    const KV_HEADS: usize = 1;
    const VOCAB: usize = 6;

    fn write_header(buf: &mut Vec<u8>) {
        for v in [DIM, HIDDEN, LAYERS, HEADS, KV_HEADS, VOCAB, 16] {
            buf.write_i32::<LittleEndian>(v as i32).unwrap();
        }
    }

    fn write_floats(buf: &mut Vec<u8>, n: usize, fill: f32) {
        for _ in 0..n {
            buf.write_f32::<LittleEndian>(fill).unwrap();
        }
    }

    fn write_body(buf: &mut Vec<u8>, with_lm_head: bool) {
        let kv_dim = KV_HEADS * (DIM / HEADS);
        let q_dim = DIM;
        write_floats(buf, VOCAB * DIM, 0.5); // embedding
        write_floats(buf, LAYERS * DIM, 1.0); // rms_att
        write_floats(buf, LAYERS * DIM * q_dim, 2.0); // wq
        write_floats(buf, LAYERS * DIM * kv_dim, 3.0); // wk
        write_floats(buf, LAYERS * DIM * kv_dim, 4.0); // wv
        write_floats(buf, LAYERS * q_dim * DIM, 5.0); // wo
        write_floats(buf, LAYERS * DIM, 6.0); // rms_ffn
        write_floats(buf, LAYERS * DIM * HIDDEN, 7.0); // w_gate
        write_floats(buf, LAYERS * HIDDEN * DIM, 8.0); // w_down
        write_floats(buf, LAYERS * DIM * HIDDEN, 9.0); // w_up
        write_floats(buf, DIM, 10.0); // rms_final
        if with_lm_head {
            write_floats(buf, VOCAB * DIM, 11.0);
        }
    }

    fn load_from_bytes(buf: &[u8]) -> Result<(ModelConfig, TransformerWeights)> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        std::fs::write(&path, buf).unwrap();
        load(&path)
    }

    #[test]
    fn test_load_full_checkpoint() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        write_body(&mut buf, true);

        let (config, weights) = load_from_bytes(&buf).unwrap();
        assert_eq!(config.dim, DIM);
        assert_eq!(config.n_layers, LAYERS);
        assert_eq!(config.head_dim, DIM / HEADS);
        assert_eq!(weights.layers.len(), LAYERS);
        assert_eq!(weights.token_embedding_table[0], 0.5);
        assert_eq!(weights.layers[0].rms_att_weight[0], 1.0);
        assert_eq!(weights.layers[1].w_up[0], 9.0);
        assert_eq!(weights.rms_final_weight[0], 10.0);
        assert_eq!(weights.lm_head[0], 11.0);
        assert!(!weights.tied_lm_head);
    }

    #[test]
    fn test_load_tied_lm_head() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        write_body(&mut buf, false);

        let (_, weights) = load_from_bytes(&buf).unwrap();
        assert!(weights.tied_lm_head);
        assert_eq!(weights.lm_head, weights.token_embedding_table);
    }

    #[test]
    fn test_truncated_checkpoint_fails() {
        let mut buf = Vec::new();
        write_header(&mut buf);
        write_floats(&mut buf, VOCAB * DIM / 2, 0.5);
        assert!(load_from_bytes(&buf).is_err());
    }

    #[test]
    fn test_invalid_header_fails() {
        let mut buf = Vec::new();
        // dim=5 with n_heads=2 does not divide
        for v in [5, HIDDEN, LAYERS, HEADS, KV_HEADS, VOCAB, 16] {
            buf.write_i32::<LittleEndian>(v as i32).unwrap();
        }
        // Some float payload so only the header check can fail
        write_floats(&mut buf, 10_000, 0.0);
        assert!(load_from_bytes(&buf).is_err());
    }

    #[test]
    fn test_missing_file_fails() {
        assert!(load(Path::new("/nonexistent/model.bin")).is_err());
    }

    #[test]
    fn test_negative_header_field_fails() {
        let mut buf = Vec::new();
        for v in [DIM as i32, -1, LAYERS as i32, HEADS as i32, KV_HEADS as i32, VOCAB as i32, 16] {
            buf.write_i32::<LittleEndian>(v).unwrap();
        }
        write_floats(&mut buf, 1024, 0.0);
        assert!(load_from_bytes(&buf).is_err());
    }
}
