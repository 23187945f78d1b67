//! Transformer encoder that maps a keypoint clip to one embedding, scored
//! by dataset-specific linear heads.

mod layers;
mod tokenizer;
pub mod weights;

use std::path::Path;

use candle_core::{D, DType, Device, Module, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, linear_no_bias};
use ndarray::{Array2, Array3, Array4};

pub use self::layers::{Block, Mlp, SelfAttention};
pub use self::tokenizer::Tokenizer;
use self::weights::{LoadReport, Parameters};
use crate::error::{RecognitionError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct ClassifierConfig {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_keypoints: usize,
    /// Longest clip (in frames) the position table covers.
    pub max_len: usize,
    /// Output heads by name, with their class counts. The first one is the
    /// default head.
    pub heads: Vec<(String, usize)>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            n_embd: 1024,
            n_head: 16,
            n_layer: 6,
            n_keypoints: 63,
            max_len: 64,
            heads: [
                ("asl_citizen", 2305),
                ("lsfb", 4657),
                ("wlasl", 2000),
                ("autsl", 226),
                ("rsl", 1001),
            ]
            .into_iter()
            .map(|(name, n)| (name.to_string(), n))
            .collect(),
        }
    }
}

impl ClassifierConfig {
    fn validate(&self) -> Result<()> {
        let problem = if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            Some(format!(
                "n_embd {} is not divisible into {} heads",
                self.n_embd, self.n_head
            ))
        } else if self.n_keypoints == 0 || self.max_len == 0 {
            Some("n_keypoints and max_len must be positive".to_string())
        } else if self.heads.is_empty() {
            Some("at least one output head is required".to_string())
        } else {
            None
        };
        match problem {
            Some(msg) => Err(RecognitionError::InvalidConfig(msg)),
            None => Ok(()),
        }
    }
}

/// Encoder-only transformer over `[cls] + frame tokens + keypoint tokens`.
///
/// The classification token gets no position embedding; the `T + K` tokens
/// after it use positions `0..T + K`. Attention is unmasked.
#[derive(Clone, Debug)]
pub struct Classifier {
    cfg: ClassifierConfig,
    cls_token: Tensor,
    tokenizer: Tokenizer,
    pos_embd: Tensor,
    blocks: Vec<Block>,
    layernorm: LayerNorm,
    heads: Vec<(String, Linear)>,
}

impl Classifier {
    /// Builds the model from a complete parameter table.
    pub fn from_parameters(cfg: ClassifierConfig, params: Parameters) -> Result<Self> {
        cfg.validate()?;
        let vb = VarBuilder::from_tensors(params, DType::F32, &Device::Cpu);
        Self::build(cfg, vb).map_err(|err| RecognitionError::Weights(err.to_string()))
    }

    fn build(cfg: ClassifierConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let c = cfg.n_embd;
        let cls_token = vb.get(c, "cls_token")?;
        let pos_embd = vb.pp("pos_embd").get((cfg.max_len + cfg.n_keypoints, c), "weight")?;
        let tokenizer = Tokenizer::new(c, cfg.n_keypoints, cfg.max_len, vb.pp("tokenizer"))?;
        let blocks = (0..cfg.n_layer)
            .map(|l| Block::new(c, cfg.n_head, vb.pp("blocks").pp(l)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let layernorm = LayerNorm::new_no_bias(
            vb.pp("layernorm").get(c, "weight")?,
            layers::LAYER_NORM_EPS,
        );
        let heads = cfg
            .heads
            .iter()
            .map(|(name, classes)| {
                linear_no_bias(c, *classes, vb.pp("heads").pp(name)).map(|head| (name.clone(), head))
            })
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self {
            cfg,
            cls_token,
            tokenizer,
            pos_embd,
            blocks,
            layernorm,
            heads,
        })
    }

    /// Freshly initialized weights; see [`weights::random_parameters`].
    pub fn new_random(cfg: ClassifierConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let params = weights::random_parameters(&cfg, seed)?;
        Self::from_parameters(cfg, params)
    }

    /// Random weights overlaid with whatever the snapshot at `path` provides.
    pub fn from_safetensors(
        cfg: ClassifierConfig,
        seed: u64,
        path: &Path,
    ) -> Result<(Self, LoadReport)> {
        cfg.validate()?;
        let mut params = weights::random_parameters(&cfg, seed)?;
        let report = weights::load_weights(&mut params, &cfg, path)?;
        Ok((Self::from_parameters(cfg, params)?, report))
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.cfg
    }

    pub fn default_head(&self) -> &str {
        self.heads.first().map(|(name, _)| name.as_str()).unwrap_or_default()
    }

    pub fn head(&self, name: &str) -> Option<&Linear> {
        self.heads
            .iter()
            .find_map(|(head, layer)| (head == name).then_some(layer))
    }

    fn check_input(&self, keypoints: &Array4<f32>, valid: &Array3<bool>) -> Result<()> {
        let (b, t, k, c) = keypoints.dim();
        if c != 3 || k != self.cfg.n_keypoints {
            return Err(RecognitionError::inference(format!(
                "expected keypoints of shape (B, T, {}, 3), got {:?}",
                self.cfg.n_keypoints,
                keypoints.shape()
            )));
        }
        if t == 0 || t > self.cfg.max_len {
            return Err(RecognitionError::inference(format!(
                "clip length {t} outside 1..={}",
                self.cfg.max_len
            )));
        }
        if valid.dim() != (b, t, k) {
            return Err(RecognitionError::inference(format!(
                "validity mask shape {:?} does not match keypoints {:?}",
                valid.shape(),
                keypoints.shape()
            )));
        }
        if keypoints.iter().any(|v| !v.is_finite()) {
            return Err(RecognitionError::inference("keypoints contain non-finite values"));
        }
        Ok(())
    }

    fn input_tensors(keypoints: &Array4<f32>, valid: &Array3<bool>) -> candle_core::Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let kp = Tensor::from_iter(keypoints.iter().copied(), &device)?.reshape(keypoints.dim())?;
        let mask = Tensor::from_iter(valid.iter().map(|&v| u8::from(v)), &device)?
            .reshape(valid.dim())?;
        Ok((kp, mask))
    }

    /// Tokens for a batch: `(B, T + K, n_embd)`, before position embeddings.
    pub fn tokenize(&self, keypoints: &Array4<f32>, valid: &Array3<bool>) -> Result<Array3<f32>> {
        self.check_input(keypoints, valid)?;
        let tokens = Self::input_tensors(keypoints, valid)
            .and_then(|(kp, mask)| self.tokenizer.forward(&kp, &mask))
            .and_then(|tokens| {
                let dims = tokens.dims3()?;
                Ok((dims, tokens.flatten_all()?.to_vec1::<f32>()?))
            })
            .map_err(RecognitionError::inference)?;
        let (dims, values) = tokens;
        Array3::from_shape_vec(dims, values).map_err(RecognitionError::inference)
    }

    fn embed(&self, keypoints: &Tensor, valid: &Tensor) -> candle_core::Result<Tensor> {
        let tokens = self.tokenizer.forward(keypoints, valid)?;
        let (b, n, c) = tokens.dims3()?;
        let tokens = tokens.broadcast_add(&self.pos_embd.narrow(0, 0, n)?)?;
        let cls = self.cls_token.reshape((1, 1, c))?.repeat((b, 1, 1))?;

        let mut x = Tensor::cat(&[&cls, &tokens], 1)?;
        for block in &self.blocks {
            x = block.forward(&x)?;
        }
        let pooled = x.narrow(1, 0, 1)?.squeeze(1)?.contiguous()?;
        self.layernorm.forward(&pooled)
    }

    /// Pooled embeddings `(B, n_embd)`.
    pub fn forward(&self, keypoints: &Array4<f32>, valid: &Array3<bool>) -> Result<Array2<f32>> {
        self.check_input(keypoints, valid)?;
        let out = Self::input_tensors(keypoints, valid)
            .and_then(|(kp, mask)| self.embed(&kp, &mask))
            .and_then(|emb| to_array2(&emb))
            .map_err(RecognitionError::inference)?;
        if out.iter().any(|v| !v.is_finite()) {
            return Err(RecognitionError::inference("embedding contains non-finite values"));
        }
        Ok(out)
    }

    /// Scores embeddings with the named head: `(B, classes)`.
    pub fn head_logits(&self, name: &str, embedding: &Array2<f32>) -> Result<Array2<f32>> {
        let head = self
            .head(name)
            .ok_or_else(|| RecognitionError::InvalidConfig(format!("unknown head {name:?}")))?;
        let in_features = head.weight().dim(D::Minus1).map_err(RecognitionError::inference)?;
        if embedding.ncols() != in_features {
            return Err(RecognitionError::inference(format!(
                "embedding width {} does not match head input {in_features}",
                embedding.ncols(),
            )));
        }
        let logits = Tensor::from_iter(embedding.iter().copied(), &Device::Cpu)
            .and_then(|t| t.reshape(embedding.dim()))
            .and_then(|t| head.forward(&t))
            .and_then(|t| to_array2(&t))
            .map_err(RecognitionError::inference)?;
        if logits.iter().any(|v| !v.is_finite()) {
            return Err(RecognitionError::inference("logits contain non-finite values"));
        }
        Ok(logits)
    }

    pub fn classify(
        &self,
        head: &str,
        keypoints: &Array4<f32>,
        valid: &Array3<bool>,
    ) -> Result<Array2<f32>> {
        let embedding = self.forward(keypoints, valid)?;
        self.head_logits(head, &embedding)
    }
}

fn to_array2(t: &Tensor) -> candle_core::Result<Array2<f32>> {
    let dims = t.dims2()?;
    let values = t.flatten_all()?.to_vec1::<f32>()?;
    Array2::from_shape_vec(dims, values).map_err(|err| candle_core::Error::Msg(err.to_string()))
}

#[cfg(test)]
pub(crate) fn tiny_config(n_keypoints: usize, max_len: usize) -> ClassifierConfig {
    ClassifierConfig {
        n_embd: 16,
        n_head: 4,
        n_layer: 2,
        n_keypoints,
        max_len,
        heads: vec![("asl_citizen".to_string(), 7), ("autsl".to_string(), 3)],
    }
}
