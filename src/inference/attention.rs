//! Attention kernels over the two KV-cache layouts
//!
//! Both kernels score the current query against every cached position
//! `0..num_tokens`, softmax per head, and accumulate the weighted value sum.
//! The per-position accumulation order is identical in both, so a sequence
//! generated greedily is bitwise-identical between contiguous and paged mode.
//!
//! Grouped-query attention: `kv_mul = n_heads / n_kv_heads` query heads share
//! each KV head.

/// Attention over the contiguous cache layout `[max_seq_len, n_kv_heads, head_dim]`.
///
/// `key_cache` / `value_cache` must already be offset to the current layer.
/// `att_scores` is scratch of at least `n_heads * max_seq_len`.
#[allow(clippy::too_many_arguments)]
pub fn standard_attention(
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    att_scores: &mut [f32],
    pos: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
    max_seq_len: usize,
) {
    let kv_mul = n_heads / n_kv_heads;
    let kv_dim = n_kv_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    out[..n_heads * head_dim].fill(0.0);

    for h in 0..n_heads {
        let q_head = &q[h * head_dim..(h + 1) * head_dim];
        let att_head = &mut att_scores[h * max_seq_len..h * max_seq_len + pos + 1];
        let kv_h = h / kv_mul;

        // Score: Q · K^T
        for t in 0..=pos {
            let k_off = t * kv_dim + kv_h * head_dim;
            let k_head = &key_cache[k_off..k_off + head_dim];
            let mut score = 0.0f32;
            for i in 0..head_dim {
                score += q_head[i] * k_head[i];
            }
            att_head[t] = score * scale;
        }

        crate::inference::ops::softmax(att_head);

        // Weighted sum: softmax(Q·K^T) · V
        let out_head = &mut out[h * head_dim..(h + 1) * head_dim];
        for t in 0..=pos {
            let v_off = t * kv_dim + kv_h * head_dim;
            let v_head = &value_cache[v_off..v_off + head_dim];
            let prob = att_head[t];
            for i in 0..head_dim {
                out_head[i] += prob * v_head[i];
            }
        }
    }
}

/// Attention over the paged cache layout `[num_blocks, block_size, n_kv_heads, head_dim]`.
///
/// `key_cache` / `value_cache` must already be offset to the current layer;
/// `block_table` maps the sequence's logical blocks to physical block ids.
#[allow(clippy::too_many_arguments)]
pub fn paged_attention(
    out: &mut [f32],
    q: &[f32],
    key_cache: &[f32],
    value_cache: &[f32],
    block_table: &[usize],
    att_scores: &mut [f32],
    num_tokens: usize,
    block_size: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
) {
    let kv_mul = n_heads / n_kv_heads;
    let kv_dim = n_kv_heads * head_dim;
    let scale = 1.0 / (head_dim as f32).sqrt();

    out[..n_heads * head_dim].fill(0.0);

    for h in 0..n_heads {
        let q_head = &q[h * head_dim..(h + 1) * head_dim];
        let att_head = &mut att_scores[h * num_tokens..(h + 1) * num_tokens];
        let kv_h = h / kv_mul;

        for t in 0..num_tokens {
            let physical_block = block_table[t / block_size];
            let k_off =
                physical_block * block_size * kv_dim + (t % block_size) * kv_dim + kv_h * head_dim;
            let k_head = &key_cache[k_off..k_off + head_dim];
            let mut score = 0.0f32;
            for i in 0..head_dim {
                score += q_head[i] * k_head[i];
            }
            att_head[t] = score * scale;
        }

        crate::inference::ops::softmax(att_head);

        let out_head = &mut out[h * head_dim..(h + 1) * head_dim];
        for t in 0..num_tokens {
            let physical_block = block_table[t / block_size];
            let v_off =
                physical_block * block_size * kv_dim + (t % block_size) * kv_dim + kv_h * head_dim;
            let v_head = &value_cache[v_off..v_off + head_dim];
            let prob = att_head[t];
            for i in 0..head_dim {
                out_head[i] += prob * v_head[i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Fill a contiguous-layout cache and a paged-layout cache with the same
    // positions and check the kernels agree bit for bit.
    #[test]
    fn test_standard_and_paged_agree() {
        let n_heads = 4;
        let n_kv_heads = 2;
        let head_dim = 4;
        let kv_dim = n_kv_heads * head_dim;
        let max_seq_len = 16;
        let block_size = 4;
        let num_blocks = 8;
        let pos = 9; // 10 cached positions, spanning 3 blocks

        let mut key_contig = vec![0.0f32; max_seq_len * kv_dim];
        let mut val_contig = vec![0.0f32; max_seq_len * kv_dim];
        let mut key_paged = vec![0.0f32; num_blocks * block_size * kv_dim];
        let mut val_paged = vec![0.0f32; num_blocks * block_size * kv_dim];

        // Non-trivial block table: logical 0,1,2 -> physical 5,2,7
        let block_table = vec![5usize, 2, 7];

        for t in 0..=pos {
            for d in 0..kv_dim {
                let k = ((t * kv_dim + d) as f32 * 0.37).sin();
                let v = ((t * kv_dim + d) as f32 * 0.11).cos();
                key_contig[t * kv_dim + d] = k;
                val_contig[t * kv_dim + d] = v;
                let pb = block_table[t / block_size];
                let off = pb * block_size * kv_dim + (t % block_size) * kv_dim + d;
                key_paged[off] = k;
                val_paged[off] = v;
            }
        }

        let q: Vec<f32> = (0..n_heads * head_dim)
            .map(|i| (i as f32 * 0.61).sin())
            .collect();

        let mut out_std = vec![0.0f32; n_heads * head_dim];
        let mut out_paged = vec![0.0f32; n_heads * head_dim];
        let mut att = vec![0.0f32; n_heads * max_seq_len];

        standard_attention(
            &mut out_std,
            &q,
            &key_contig,
            &val_contig,
            &mut att,
            pos,
            head_dim,
            n_heads,
            n_kv_heads,
            max_seq_len,
        );
        let mut att2 = vec![0.0f32; n_heads * (pos + 1)];
        paged_attention(
            &mut out_paged,
            &q,
            &key_paged,
            &val_paged,
            &block_table,
            &mut att2,
            pos + 1,
            block_size,
            head_dim,
            n_heads,
            n_kv_heads,
        );

        assert_eq!(out_std, out_paged);
    }

    #[test]
    fn test_single_position_attends_to_itself() {
        // With one cached position the softmax weight is 1.0 and the output
        // is exactly the cached value vector, regardless of scores.
        let n_heads = 2;
        let n_kv_heads = 1;
        let head_dim = 2;
        let kv_dim = n_kv_heads * head_dim;
        let max_seq_len = 4;

        let mut key = vec![0.0f32; max_seq_len * kv_dim];
        let mut val = vec![0.0f32; max_seq_len * kv_dim];
        key[0] = 0.3;
        key[1] = -0.2;
        val[0] = 7.0;
        val[1] = -3.0;

        let q = vec![1.0f32; n_heads * head_dim];
        let mut out = vec![0.0f32; n_heads * head_dim];
        let mut att = vec![0.0f32; n_heads * max_seq_len];

        standard_attention(
            &mut out,
            &q,
            &key,
            &val,
            &mut att,
            0,
            head_dim,
            n_heads,
            n_kv_heads,
            max_seq_len,
        );

        // Both query heads share the single KV head
        assert_eq!(&out[0..2], &[7.0, -3.0]);
        assert_eq!(&out[2..4], &[7.0, -3.0]);
    }
}
