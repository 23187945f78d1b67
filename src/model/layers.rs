use candle_core::{Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, layer_norm, linear, ops::softmax_last_dim};

pub(crate) const LAYER_NORM_EPS: f64 = 1e-5;

/// Unmasked multi-head self-attention with a fused query/key/value
/// projection.
#[derive(Clone, Debug)]
pub struct SelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl SelfAttention {
    pub fn new(n_embd: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_attn: linear(n_embd, 3 * n_embd, vb.pp("c_attn"))?,
            c_proj: linear(n_embd, n_embd, vb.pp("c_proj"))?,
            n_head,
            head_dim: n_embd / n_head,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, dim) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        // [batch, seq, dim] -> [batch, heads, seq, head_dim]
        let split = |part: usize| -> Result<Tensor> {
            qkv.narrow(2, part * dim, dim)?
                .reshape((batch, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (split(0)?, split(1)?, split(2)?);

        let scale = (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?)? / scale)?;
        let attn = softmax_last_dim(&scores)?;

        let out = attn.matmul(&v)?.transpose(1, 2)?.reshape((batch, seq_len, dim))?;
        self.c_proj.forward(&out)
    }
}

#[derive(Clone, Debug)]
pub struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    pub fn new(n_embd: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            c_fc: linear(n_embd, 4 * n_embd, vb.pp("c_fc"))?,
            c_proj: linear(4 * n_embd, n_embd, vb.pp("c_proj"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // exact (erf) GELU
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu_erf()?)
    }
}

/// Pre-norm transformer block: `x + attn(ln_1(x))`, then `x + mlp(ln_2(x))`.
#[derive(Clone, Debug)]
pub struct Block {
    ln_1: LayerNorm,
    attn: SelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    pub fn new(n_embd: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            ln_1: layer_norm(n_embd, LAYER_NORM_EPS, vb.pp("ln_1"))?,
            attn: SelfAttention::new(n_embd, n_head, vb.pp("attn"))?,
            ln_2: layer_norm(n_embd, LAYER_NORM_EPS, vb.pp("ln_2"))?,
            mlp: Mlp::new(n_embd, vb.pp("mlp"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }
}
