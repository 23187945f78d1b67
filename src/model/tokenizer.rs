use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

/// Turns a `(B, T, K, 3)` keypoint batch into `T + K` tokens per clip.
///
/// Frame tokens come first: token `t` sums `fcs_spatial[k](kp[t, k])` over
/// the valid keypoints of frame `t`. Keypoint tokens follow: token `T + k`
/// sums `fcs_temporal[t](kp[t, k])` over the frames where keypoint `k` is
/// valid. Each sum is scaled by `(total + 1) / (valid + 1)` and the result
/// passes through a ReLU.
///
/// The per-keypoint and per-frame layers are stacked so each family runs as
/// one batched matmul.
#[derive(Clone, Debug)]
pub struct Tokenizer {
    /// `(K, 3, C)` and `(K, 1, C)`
    spatial_weight: Tensor,
    spatial_bias: Tensor,
    /// `(max_len, 3, C)` and `(max_len, 1, C)`
    temporal_weight: Tensor,
    temporal_bias: Tensor,
}

/// Reads `count` `Linear(3, n_embd)` layers named `0..count` under `vb`.
fn stacked_linears(count: usize, n_embd: usize, vb: VarBuilder) -> Result<(Tensor, Tensor)> {
    let mut weights = Vec::with_capacity(count);
    let mut biases = Vec::with_capacity(count);
    for i in 0..count {
        let vb = vb.pp(i);
        weights.push(vb.get((n_embd, 3), "weight")?.t()?);
        biases.push(vb.get(n_embd, "bias")?.unsqueeze(0)?);
    }
    Ok((
        Tensor::stack(&weights, 0)?.contiguous()?,
        Tensor::stack(&biases, 0)?,
    ))
}

impl Tokenizer {
    pub fn new(n_embd: usize, n_keypoints: usize, max_len: usize, vb: VarBuilder) -> Result<Self> {
        let (spatial_weight, spatial_bias) =
            stacked_linears(n_keypoints, n_embd, vb.pp("fcs_spatial"))?;
        let (temporal_weight, temporal_bias) =
            stacked_linears(max_len, n_embd, vb.pp("fcs_temporal"))?;
        Ok(Self {
            spatial_weight,
            spatial_bias,
            temporal_weight,
            temporal_bias,
        })
    }

    pub fn n_keypoints(&self) -> usize {
        self.spatial_weight.dims()[0]
    }

    pub fn max_len(&self) -> usize {
        self.temporal_weight.dims()[0]
    }

    /// `keypoints` is `(B, T, K, 3)`, `valid` is the `(B, T, K)` mask as
    /// 0/1 floats. Callers guarantee `K == n_keypoints()` and
    /// `T <= max_len()`.
    pub fn forward(&self, keypoints: &Tensor, valid: &Tensor) -> Result<Tensor> {
        let (batch, frames, points, _) = keypoints.dims4()?;
        let n_embd = self.spatial_weight.dim(2)?;
        let mask = valid.to_dtype(DType::F32)?.unsqueeze(3)?;

        // keypoint k through fcs_spatial[k]: (K, B*T, 3) x (K, 3, C)
        let spatial = keypoints
            .permute((2, 0, 1, 3))?
            .reshape((points, batch * frames, 3))?
            .matmul(&self.spatial_weight)?
            .broadcast_add(&self.spatial_bias)?
            .reshape((points, batch, frames, n_embd))?
            .permute((1, 2, 0, 3))?
            .broadcast_mul(&mask)?;
        let frame_tokens = spatial
            .sum(2)?
            .broadcast_mul(&rescale(&mask.sum(2)?, points)?)?;

        // frame t through fcs_temporal[t]: (T, B*K, 3) x (T, 3, C)
        let temporal = keypoints
            .permute((1, 0, 2, 3))?
            .reshape((frames, batch * points, 3))?
            .matmul(&self.temporal_weight.narrow(0, 0, frames)?)?
            .broadcast_add(&self.temporal_bias.narrow(0, 0, frames)?)?
            .reshape((frames, batch, points, n_embd))?
            .permute((1, 0, 2, 3))?
            .broadcast_mul(&mask)?;
        let keypoint_tokens = temporal
            .sum(1)?
            .broadcast_mul(&rescale(&mask.sum(1)?, frames)?)?;

        Tensor::cat(&[&frame_tokens, &keypoint_tokens], 1)?.relu()
    }
}

/// `(total + 1) / (count + 1)` for every count.
fn rescale(counts: &Tensor, total: usize) -> Result<Tensor> {
    counts.affine(1.0, 1.0)?.recip()?.affine((total + 1) as f64, 0.0)
}
