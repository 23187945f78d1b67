//! Parameter tables for the [`Classifier`](super::Classifier).
//!
//! Every parameter is named the way training checkpoints name it. A fresh
//! table comes from [`random_parameters`]; [`load_weights`] then overlays a
//! `safetensors` snapshot on top of it. Loading is best effort: parameters
//! absent from the file, or stored with a different shape or a non-float
//! dtype, keep their current values and are listed in the returned
//! [`LoadReport`].

use std::{collections::HashMap, fs, path::Path};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use safetensors::SafeTensors;

use super::ClassifierConfig;
use crate::error::{RecognitionError, Result};

/// Prefix added to every parameter name by compiled training artifacts.
const COMPILED_PREFIX: &str = "_orig_mod.";

pub type Parameters = HashMap<String, Tensor>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum Init {
    Normal(f32),
    /// `[0, 1)`
    Uniform,
    Zeros,
    Ones,
}

#[derive(Clone, Debug)]
pub(crate) struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: Init,
}

fn push(specs: &mut Vec<ParamSpec>, name: String, shape: Vec<usize>, init: Init) {
    specs.push(ParamSpec { name, shape, init });
}

fn push_linear(specs: &mut Vec<ParamSpec>, prefix: &str, inp: usize, out: usize, std: f32, bias: bool) {
    push(specs, format!("{prefix}.weight"), vec![out, inp], Init::Normal(std));
    if bias {
        push(specs, format!("{prefix}.bias"), vec![out], Init::Zeros);
    }
}

fn push_norm(specs: &mut Vec<ParamSpec>, prefix: &str, dim: usize, bias: bool) {
    push(specs, format!("{prefix}.weight"), vec![dim], Init::Ones);
    if bias {
        push(specs, format!("{prefix}.bias"), vec![dim], Init::Zeros);
    }
}

/// Every parameter of a model built from `cfg`, in a fixed order.
///
/// Linear layers and embeddings start from normal(0, 0.01); the residual
/// projections use `0.02 / sqrt(2 * n_layer)`. Biases start at zero, norm
/// weights at one and the classification token uniform in `[0, 1)`.
pub(crate) fn parameter_specs(cfg: &ClassifierConfig) -> Vec<ParamSpec> {
    let c = cfg.n_embd;
    let std = 0.01;
    let proj_std = 0.02 / (2.0 * cfg.n_layer.max(1) as f32).sqrt();
    let mut specs = Vec::new();

    push(&mut specs, "cls_token".into(), vec![c], Init::Uniform);
    push(
        &mut specs,
        "pos_embd.weight".into(),
        vec![cfg.max_len + cfg.n_keypoints, c],
        Init::Normal(std),
    );
    for i in 0..cfg.n_keypoints {
        push_linear(&mut specs, &format!("tokenizer.fcs_spatial.{i}"), 3, c, std, true);
    }
    for t in 0..cfg.max_len {
        push_linear(&mut specs, &format!("tokenizer.fcs_temporal.{t}"), 3, c, std, true);
    }
    for l in 0..cfg.n_layer {
        let block = format!("blocks.{l}");
        push_norm(&mut specs, &format!("{block}.ln_1"), c, true);
        push_linear(&mut specs, &format!("{block}.attn.c_attn"), c, 3 * c, std, true);
        push_linear(&mut specs, &format!("{block}.attn.c_proj"), c, c, proj_std, true);
        push_norm(&mut specs, &format!("{block}.ln_2"), c, true);
        push_linear(&mut specs, &format!("{block}.mlp.c_fc"), c, 4 * c, std, true);
        push_linear(&mut specs, &format!("{block}.mlp.c_proj"), 4 * c, c, proj_std, true);
    }
    push_norm(&mut specs, "layernorm", c, false);
    for (name, classes) in &cfg.heads {
        push_linear(&mut specs, &format!("heads.{name}"), c, *classes, std, false);
    }
    specs
}

/// Draws a full parameter table. The same seed always yields the same table.
pub fn random_parameters(cfg: &ClassifierConfig, seed: u64) -> Result<Parameters> {
    let mut rng = StdRng::seed_from_u64(seed);
    let device = Device::Cpu;
    let mut params = Parameters::new();

    for spec in parameter_specs(cfg) {
        let count: usize = spec.shape.iter().product();
        let values: Vec<f32> = match spec.init {
            Init::Normal(std) => {
                let dist = Normal::new(0.0, std).map_err(|err| {
                    RecognitionError::InvalidConfig(format!("bad init scale {std}: {err}"))
                })?;
                (0..count).map(|_| dist.sample(&mut rng)).collect()
            }
            Init::Uniform => (0..count).map(|_| rng.r#gen::<f32>()).collect(),
            Init::Zeros => vec![0.0; count],
            Init::Ones => vec![1.0; count],
        };
        let tensor = Tensor::from_vec(values, spec.shape.as_slice(), &device)
            .map_err(RecognitionError::inference)?;
        params.insert(spec.name, tensor);
    }
    Ok(params)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
    /// Tensors in the file that match no parameter.
    pub unexpected: Vec<String>,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty()
    }
}

/// Shapes match when they agree after dropping leading unit dimensions, so
/// a `(1, 1, C)` token binds to a `(C,)` parameter.
fn same_shape(stored: &[usize], expected: &[usize]) -> bool {
    fn trim(shape: &[usize]) -> &[usize] {
        let lead = shape.iter().take_while(|&&d| d == 1).count();
        &shape[lead.min(shape.len().saturating_sub(1))..]
    }
    trim(stored) == trim(expected)
}

fn float_dtype(dtype: safetensors::Dtype) -> Option<DType> {
    use safetensors::Dtype as S;
    match dtype {
        S::F32 => Some(DType::F32),
        S::F64 => Some(DType::F64),
        S::F16 => Some(DType::F16),
        S::BF16 => Some(DType::BF16),
        _ => None,
    }
}

/// Overlays the snapshot at `path` onto `params`, for the names `cfg`
/// defines.
pub fn load_weights(params: &mut Parameters, cfg: &ClassifierConfig, path: &Path) -> Result<LoadReport> {
    read_weights(params, cfg, path).map_err(|err| RecognitionError::Weights(format!("{err:#}")))
}

fn read_weights(params: &mut Parameters, cfg: &ClassifierConfig, path: &Path) -> anyhow::Result<LoadReport> {
    let data =
        fs::read(path).with_context(|| format!("failed to read weights {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&data)
        .with_context(|| format!("failed to parse safetensors {}", path.display()))?;
    let device = Device::Cpu;

    let mut stored: HashMap<String, _> = tensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let name = name
                .strip_prefix(COMPILED_PREFIX)
                .map(str::to_string)
                .unwrap_or(name);
            (name, view)
        })
        .collect();

    let mut report = LoadReport::default();
    for spec in parameter_specs(cfg) {
        let Some(view) = stored.remove(&spec.name) else {
            report.missing.push(spec.name);
            continue;
        };
        let dtype = float_dtype(view.dtype());
        let Some(dtype) = dtype.filter(|_| same_shape(view.shape(), &spec.shape)) else {
            log::warn!(
                "skipping {}: stored {:?} {:?}, expected float {:?}",
                spec.name,
                view.dtype(),
                view.shape(),
                spec.shape
            );
            report.mismatched.push(spec.name);
            continue;
        };
        let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), &device)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t| t.reshape(spec.shape.as_slice()))
            .with_context(|| format!("failed to bind {}", spec.name))?;
        params.insert(spec.name.clone(), tensor);
        report.loaded.push(spec.name);
    }

    report.unexpected = stored.into_keys().collect();
    report.unexpected.sort();

    log::info!(
        "loaded {} parameters from {} ({} missing, {} mismatched, {} unused)",
        report.loaded.len(),
        path.display(),
        report.missing.len(),
        report.mismatched.len(),
        report.unexpected.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use tempfile::{NamedTempFile, tempdir};

    use super::*;
    use crate::model::{Classifier, tiny_config};

    fn write_tensors(dir: &Path, tensors: &[(&str, Vec<usize>, f32)]) -> std::path::PathBuf {
        let map: HashMap<String, Tensor> = tensors
            .iter()
            .map(|(name, shape, value)| {
                let tensor = Tensor::full(*value, shape.as_slice(), &Device::Cpu).unwrap();
                (name.to_string(), tensor)
            })
            .collect();
        let path = dir.join("weights.safetensors");
        candle_core::safetensors::save(&map, &path).unwrap();
        path
    }

    fn values(params: &Parameters, name: &str) -> Vec<f32> {
        params[name].flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn binds_prefixed_and_reshaped_tensors() {
        let cfg = tiny_config(4, 8);
        let mut params = random_parameters(&cfg, 0).unwrap();
        let dir = tempdir().unwrap();
        let path = write_tensors(
            dir.path(),
            &[
                ("_orig_mod.layernorm.weight", vec![16], 2.0),
                ("heads.autsl.weight", vec![3, 16], 0.5),
                ("cls_token", vec![1, 1, 16], 0.25),
                ("blocks.1.attn.c_attn.bias", vec![48], -0.1),
                ("pos_embd.weight", vec![2, 2], 9.0),
                ("word_proj.lm.weight", vec![4], 1.0),
            ],
        );

        let report = load_weights(&mut params, &cfg, &path).unwrap();
        assert!(values(&params, "layernorm.weight").iter().all(|&v| v == 2.0));
        assert!(values(&params, "heads.autsl.weight").iter().all(|&v| v == 0.5));
        assert_eq!(params["cls_token"].dims(), &[16]);
        assert!(values(&params, "cls_token").iter().all(|&v| v == 0.25));
        assert!(values(&params, "blocks.1.attn.c_attn.bias").iter().all(|&v| v == -0.1));

        assert_eq!(report.loaded.len(), 4);
        assert_eq!(report.mismatched, vec!["pos_embd.weight".to_string()]);
        assert_eq!(report.unexpected, vec!["word_proj.lm.weight".to_string()]);
        assert!(report.missing.contains(&"blocks.0.ln_1.weight".to_string()));
        assert!(report.missing.contains(&"tokenizer.fcs_temporal.7.bias".to_string()));
        assert!(!report.is_complete());
        assert_eq!(params["pos_embd.weight"].dims(), &[12, 16]);
    }

    #[test]
    fn integer_tensors_are_mismatched() {
        let cfg = tiny_config(4, 8);
        let mut params = random_parameters(&cfg, 0).unwrap();
        let before = values(&params, "layernorm.weight");
        let dir = tempdir().unwrap();
        let path = dir.path().join("ints.safetensors");
        let ints = Tensor::from_vec(vec![3i64; 16], 16, &Device::Cpu).unwrap();
        candle_core::safetensors::save(&HashMap::from([("layernorm.weight", ints)]), &path).unwrap();

        let report = load_weights(&mut params, &cfg, &path).unwrap();
        assert_eq!(report.mismatched, vec!["layernorm.weight".to_string()]);
        assert_eq!(values(&params, "layernorm.weight"), before);
    }

    #[test]
    fn loaded_heads_change_the_model_output() {
        let cfg = tiny_config(4, 8);
        let mut params = random_parameters(&cfg, 3).unwrap();
        let dir = tempdir().unwrap();
        let path = write_tensors(dir.path(), &[("heads.autsl.weight", vec![3, 16], 0.0)]);
        load_weights(&mut params, &cfg, &path).unwrap();

        let model = Classifier::from_parameters(cfg, params).unwrap();
        let emb = ndarray::Array2::from_elem((2, 16), 0.5);
        let logits = model.head_logits("autsl", &emb).unwrap();
        assert!(logits.iter().all(|&v| v == 0.0));
        assert!(model.head_logits("asl_citizen", &emb).unwrap().iter().any(|&v| v != 0.0));
    }

    #[test]
    fn parameter_names_cover_the_whole_model() {
        let specs = parameter_specs(&tiny_config(4, 8));
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        // 2 + 2*(4+8) tokenizer + 12 per block + 1 final norm + 2 heads
        assert_eq!(names.len(), 2 + 24 + 2 * 12 + 1 + 2);
        assert!(names.contains(&"heads.asl_citizen.weight"));
        assert!(!names.contains(&"layernorm.bias"));
        assert!(!names.iter().any(|n| n.starts_with("heads.") && n.ends_with(".bias")));

        let params = random_parameters(&tiny_config(4, 8), 1).unwrap();
        assert_eq!(params.len(), names.len());
        assert_eq!(params["blocks.0.attn.c_attn.weight"].dims(), &[48, 16]);
        assert!(values(&params, "cls_token").iter().all(|v| (0.0..1.0).contains(v)));
    }

    #[test]
    fn unreadable_file_is_a_weights_error() {
        let cfg = tiny_config(4, 8);
        let mut params = random_parameters(&cfg, 0).unwrap();
        let err = load_weights(&mut params, &cfg, Path::new("/nonexistent/weights.safetensors"))
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Weights(_)));

        let garbage = NamedTempFile::new().unwrap();
        std::fs::write(garbage.path(), b"not a safetensors file").unwrap();
        assert!(load_weights(&mut params, &cfg, garbage.path()).is_err());
    }
}
