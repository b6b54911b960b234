//! Core math kernels for the transformer forward pass
//!
//! All kernels operate on flat `f32` slices with explicit shape arguments.
//! They are deliberately scalar loops: the serving core is the interesting
//! part of this crate, and any faithful kernel implementation suffices.

/// RMS normalization: `out[i] = in[i] * rms * weight[i]`
pub fn rms_norm(out: &mut [f32], input: &[f32], weight: &[f32], eps: f32) {
    let size = input.len();
    let mut sum = 0.0f32;
    for &v in input {
        sum += v * v;
    }
    let rms = 1.0 / (sum / size as f32 + eps).sqrt();
    for i in 0..size {
        out[i] = input[i] * rms * weight[i];
    }
}

/// Matrix-vector product: `out[i] = dot(in, weight[i])`
///
/// `weight` is stored row-major as `[out_dim, in_dim]`.
pub fn matmul(out: &mut [f32], input: &[f32], weight: &[f32], in_dim: usize, out_dim: usize) {
    for i in 0..out_dim {
        let row = &weight[i * in_dim..(i + 1) * in_dim];
        let mut val = 0.0f32;
        for j in 0..in_dim {
            val += input[j] * row[j];
        }
        out[i] = val;
    }
}

/// In-place softmax over `x`
pub fn softmax(x: &mut [f32]) {
    let mut max_val = x[0];
    for &v in x.iter().skip(1) {
        if v > max_val {
            max_val = v;
        }
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max_val).exp();
        sum += *v;
    }
    for v in x.iter_mut() {
        *v /= sum;
    }
}

/// SwiGLU gate, in place: `gate[i] = silu(gate[i]) * up[i]`
pub fn swiglu(gate: &mut [f32], up: &[f32]) {
    for i in 0..gate.len() {
        let silu = gate[i] / (1.0 + (-gate[i]).exp());
        gate[i] = silu * up[i];
    }
}

/// Rotary position embedding applied in place to query and key projections.
///
/// `q` holds `n_heads` heads of `head_dim`, `k` holds `n_kv_heads` heads.
/// Pairs `(i, i+1)` within each head are rotated by `pos * theta^(-i/head_dim)`.
pub fn apply_rope(
    q: &mut [f32],
    k: &mut [f32],
    pos: usize,
    head_dim: usize,
    n_heads: usize,
    n_kv_heads: usize,
    theta: f32,
) {
    for i in (0..head_dim).step_by(2) {
        let freq = 1.0 / theta.powf(i as f32 / head_dim as f32);
        let val = pos as f32 * freq;
        let fcr = val.cos();
        let fci = val.sin();

        for h in 0..n_heads {
            let base = h * head_dim;
            let v0 = q[base + i];
            let v1 = q[base + i + 1];
            q[base + i] = v0 * fcr - v1 * fci;
            q[base + i + 1] = v0 * fci + v1 * fcr;
        }

        for h in 0..n_kv_heads {
            let base = h * head_dim;
            let v0 = k[base + i];
            let v1 = k[base + i + 1];
            k[base + i] = v0 * fcr - v1 * fci;
            k[base + i + 1] = v0 * fci + v1 * fcr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rms_norm_unit_weight() {
        let input = vec![1.0f32, 2.0, 3.0, 4.0];
        let weight = vec![1.0f32; 4];
        let mut out = vec![0.0f32; 4];
        rms_norm(&mut out, &input, &weight, 1e-5);

        // mean square = 7.5, rms ≈ 1/sqrt(7.5)
        let rms = 1.0 / (7.5f32 + 1e-5).sqrt();
        for i in 0..4 {
            assert!((out[i] - input[i] * rms).abs() < 1e-6);
        }
    }

    #[test]
    fn test_matmul_identity() {
        // 3x3 identity
        let weight = vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let input = vec![2.0f32, -1.0, 0.5];
        let mut out = vec![0.0f32; 3];
        matmul(&mut out, &input, &weight, 3, 3);
        assert_eq!(out, input);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let mut x = vec![1.0f32, 2.0, 3.0, 4.0];
        softmax(&mut x);
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        // Monotone: larger input, larger probability
        assert!(x[3] > x[2] && x[2] > x[1] && x[1] > x[0]);
    }

    #[test]
    fn test_softmax_large_values_stable() {
        let mut x = vec![1000.0f32, 1001.0, 1002.0];
        softmax(&mut x);
        assert!(x.iter().all(|v| v.is_finite()));
        let sum: f32 = x.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_swiglu_zero_gate() {
        let mut gate = vec![0.0f32; 4];
        let up = vec![2.0f32; 4];
        swiglu(&mut gate, &up);
        // silu(0) = 0
        assert!(gate.iter().all(|&v| v.abs() < 1e-7));
    }

    #[test]
    fn test_swiglu_positive_gate() {
        let mut gate = vec![10.0f32];
        let up = vec![3.0f32];
        swiglu(&mut gate, &up);
        // silu(10) ≈ 10, so the product is close to 30
        assert!((gate[0] - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_rope_position_zero_is_identity() {
        let mut q = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut k = vec![5.0f32, 6.0, 7.0, 8.0];
        let q0 = q.clone();
        let k0 = k.clone();
        apply_rope(&mut q, &mut k, 0, 4, 1, 1, 10000.0);
        // cos(0)=1, sin(0)=0 for every frequency
        assert_eq!(q, q0);
        assert_eq!(k, k0);
    }

    #[test]
    fn test_rope_preserves_norm() {
        let mut q = vec![1.0f32, 2.0, 3.0, 4.0];
        let mut k = vec![0.5f32, -1.0, 2.0, 0.0];
        let qn: f32 = q.iter().map(|v| v * v).sum();
        let kn: f32 = k.iter().map(|v| v * v).sum();
        apply_rope(&mut q, &mut k, 17, 4, 1, 1, 10000.0);
        let qn2: f32 = q.iter().map(|v| v * v).sum();
        let kn2: f32 = k.iter().map(|v| v * v).sum();
        assert!((qn - qn2).abs() < 1e-4);
        assert!((kn - kn2).abs() < 1e-4);
    }
}
