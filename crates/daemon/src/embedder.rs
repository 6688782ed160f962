//! Embedding backend: BERT inference via `candle`, weights fetched from the
//! HuggingFace Hub via `hf-hub` (spec §4.C, treated as an opaque `Embedder`
//! capability per §1 — out of scope is *which* model architecture, not this
//! module's existence). Carried over from `codescope::semantic.rs`
//! (`resolve_model`, `load_model`, `encode_batch`) essentially verbatim: the
//! tensor math is exactly the part the spec calls out as an opaque backend,
//! so the registry's job is caching and scheduling around it, not
//! reinventing it.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};
use tokenizers::Tokenizer;

use crate::error::ModelError;

/// Curated model presets plus support for an arbitrary HuggingFace model id
/// (§4.C: "a model id not resolvable against the curated registry is a
/// fatal configuration error").
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub model_id: String,
    pub dim: usize,
    pub max_chunk_chars: usize,
}

pub fn resolve_model(name: &str) -> Result<ModelConfig, ModelError> {
    Ok(match name {
        "minilm" => ModelConfig {
            model_id: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            dim: 384,
            max_chunk_chars: 1500,
        },
        "bge-small" => ModelConfig {
            model_id: "BAAI/bge-small-en-v1.5".to_string(),
            dim: 384,
            max_chunk_chars: 1500,
        },
        "" => return Err(ModelError::UnknownModel(name.to_string())),
        custom if custom.contains('/') => {
            ModelConfig { model_id: custom.to_string(), dim: 768, max_chunk_chars: 2000 }
        }
        unknown => return Err(ModelError::UnknownModel(unknown.to_string())),
    })
}

fn select_device() -> Device {
    Device::Cpu
}

/// A loaded BERT model, tokenizer, and the device it runs on. Opaque to
/// everything outside this module except through [`ModelHandle::encode`].
pub struct ModelHandle {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    pub model_id: String,
    pub dim: usize,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("model_id", &self.model_id)
            .field("dim", &self.dim)
            .finish_non_exhaustive()
    }
}

impl ModelHandle {
    pub fn load(config: &ModelConfig) -> Result<Self, ModelError> {
        let wrap = |message: String| ModelError::LoadFailed { model_id: config.model_id.clone(), message };
        let device = select_device();

        let api = Api::new().map_err(|e| wrap(format!("failed to create HF API: {e}")))?;
        let repo = api.repo(Repo::with_revision(config.model_id.clone(), RepoType::Model, "main".to_string()));

        let config_path = repo.get("config.json").map_err(|e| wrap(format!("failed to fetch config.json: {e}")))?;
        let tokenizer_path =
            repo.get("tokenizer.json").map_err(|e| wrap(format!("failed to fetch tokenizer.json: {e}")))?;
        let weights_path =
            repo.get("model.safetensors").map_err(|e| wrap(format!("failed to fetch model.safetensors: {e}")))?;

        let config_str = std::fs::read_to_string(&config_path).map_err(|e| wrap(format!("failed to read config: {e}")))?;
        let bert_config: BertConfig =
            serde_json::from_str(&config_str).map_err(|e| wrap(format!("failed to parse config: {e}")))?;

        let tokenizer =
            Tokenizer::from_file(&tokenizer_path).map_err(|e| wrap(format!("failed to load tokenizer: {e}")))?;

        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights_path], DType::F32, &device)
                .map_err(|e| wrap(format!("failed to load weights: {e}")))?
        };
        let model = BertModel::load(vb, &bert_config).map_err(|e| wrap(format!("failed to load BERT model: {e}")))?;

        Ok(Self { model, tokenizer, device, model_id: config.model_id.clone(), dim: config.dim })
    }

    /// Mean-pool and L2-normalize a batch of texts into fixed-dimensional
    /// vectors. Safe to call concurrently on the same handle (§4.C:
    /// "inference on a loaded handle is safe to call concurrently").
    pub fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let wrap = |message: String| ModelError::InferenceFailed { model_id: self.model_id.clone(), message };

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| wrap(format!("tokenization failed: {e}")))?;

        let max_len = encodings.iter().map(|e| e.get_ids().len()).max().unwrap_or(0);
        let batch_size = texts.len();

        let mut all_ids = Vec::with_capacity(batch_size * max_len);
        let mut all_mask = Vec::with_capacity(batch_size * max_len);
        let mut all_type_ids = Vec::with_capacity(batch_size * max_len);

        for enc in &encodings {
            let pad_len = max_len - enc.get_ids().len();
            all_ids.extend_from_slice(enc.get_ids());
            all_ids.extend(std::iter::repeat(0u32).take(pad_len));
            all_mask.extend_from_slice(enc.get_attention_mask());
            all_mask.extend(std::iter::repeat(0u32).take(pad_len));
            all_type_ids.extend_from_slice(enc.get_type_ids());
            all_type_ids.extend(std::iter::repeat(0u32).take(pad_len));
        }

        let input_ids = Tensor::from_vec(all_ids, (batch_size, max_len), &self.device)
            .map_err(|e| wrap(format!("tensor creation failed: {e}")))?;
        let attention_mask = Tensor::from_vec(
            all_mask.iter().map(|&x| x as f32).collect::<Vec<_>>(),
            (batch_size, max_len),
            &self.device,
        )
        .map_err(|e| wrap(format!("tensor creation failed: {e}")))?;
        let token_type_ids = Tensor::from_vec(all_type_ids, (batch_size, max_len), &self.device)
            .map_err(|e| wrap(format!("tensor creation failed: {e}")))?;

        let output = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(|e| wrap(format!("forward pass failed: {e}")))?;

        let mask_expanded = attention_mask
            .unsqueeze(2)
            .and_then(|t| t.broadcast_as(output.shape()))
            .map_err(|e| wrap(format!("mask broadcast failed: {e}")))?;

        let summed = output
            .mul(&mask_expanded)
            .and_then(|t| t.sum(1))
            .map_err(|e| wrap(format!("mean-pool sum failed: {e}")))?;

        let mask_sum = mask_expanded
            .sum(1)
            .and_then(|t| t.clamp(1e-9, f64::MAX))
            .map_err(|e| wrap(format!("mask sum failed: {e}")))?;

        let mean_pooled = summed.div(&mask_sum).map_err(|e| wrap(format!("mean-pool div failed: {e}")))?;

        let norms = mean_pooled
            .sqr()
            .and_then(|t| t.sum(1))
            .and_then(|t| t.sqrt())
            .and_then(|t| t.unsqueeze(1))
            .and_then(|t| t.broadcast_as(mean_pooled.shape()))
            .and_then(|t| t.clamp(1e-9, f64::MAX))
            .map_err(|e| wrap(format!("l2 norm failed: {e}")))?;

        let normalized = mean_pooled.div(&norms).map_err(|e| wrap(format!("l2 normalize failed: {e}")))?;

        let flat: Vec<f32> = normalized
            .flatten_all()
            .and_then(|t| t.to_vec1())
            .map_err(|e| wrap(format!("flatten failed: {e}")))?;

        Ok((0..batch_size).map(|i| flat[i * self.dim..(i + 1) * self.dim].to_vec()).collect())
    }
}
