use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use candle::{DType, Device, Tensor};
use candle_nn::{Linear, Module, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::t5::{Config as T5Config, T5EncoderModel};
use hf_hub::{
    api::sync::{Api, ApiRepo},
    Repo, RepoType,
};
use serde::Deserialize;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};
use tracing::{debug, info};

use super::device::{describe, DevicePreference};
use crate::config::EmbedConfig;
use crate::embeddings::EmbeddingDelegate;

const WEIGHT_CANDIDATES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

/// Files that make up one sentence-transformer snapshot.
struct Snapshot {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
    /// `Dense` modules listed in `modules.json`, in pipeline order.
    dense: Vec<DenseFiles>,
}

struct DenseFiles {
    config: PathBuf,
    weights: PathBuf,
}

/// One entry of a sentence-transformers `modules.json`.
#[derive(Debug, Deserialize)]
struct ModuleEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct DenseConfig {
    in_features: usize,
    out_features: usize,
    #[serde(default = "default_bias")]
    bias: bool,
    #[serde(default)]
    activation_function: Option<String>,
}

fn default_bias() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activation {
    Identity,
    Tanh,
}

impl Activation {
    // sentence-transformers defaults a Dense layer to Tanh.
    fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None => Ok(Self::Tanh),
            Some(name) if name.ends_with("Identity") => Ok(Self::Identity),
            Some(name) if name.ends_with("Tanh") => Ok(Self::Tanh),
            Some(other) => Err(anyhow!("unsupported Dense activation '{other}'")),
        }
    }
}

/// Linear projection applied to the pooled sentence vector (`2_Dense` and friends).
struct DenseProjection {
    linear: Linear,
    activation: Activation,
    in_features: usize,
    out_features: usize,
}

impl DenseProjection {
    fn load(files: &DenseFiles, device: &Device) -> Result<Self> {
        let raw = fs::read(&files.config)
            .with_context(|| format!("failed to read {}", files.config.display()))?;
        let cfg: DenseConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", files.config.display()))?;
        let activation = Activation::parse(cfg.activation_function.as_deref())?;

        let vb = build_var_builder(&files.weights, DType::F32, device)?.pp("linear");
        let linear = if cfg.bias {
            candle_nn::linear(cfg.in_features, cfg.out_features, vb)
        } else {
            candle_nn::linear_no_bias(cfg.in_features, cfg.out_features, vb)
        }
        .map_err(|e| anyhow!("failed to load {}: {e}", files.weights.display()))?;

        Ok(Self {
            linear,
            activation,
            in_features: cfg.in_features,
            out_features: cfg.out_features,
        })
    }

    fn forward(&self, pooled: &Tensor) -> candle::Result<Tensor> {
        let projected = self.linear.forward(pooled)?;
        match self.activation {
            Activation::Identity => Ok(projected),
            Activation::Tanh => projected.tanh(),
        }
    }
}

enum Encoder {
    Bert(BertModel),
    // T5 caches position bias and needs `&mut self` on forward.
    T5(Mutex<T5EncoderModel>),
}

/// Sentence-embedding model running in-process on candle.
pub struct SentenceEmbedder {
    model_id: String,
    encoder: Encoder,
    tokenizer: Tokenizer,
    dense: Vec<DenseProjection>,
    device: Device,
    dims: usize,
    batch_size: usize,
    normalize: bool,
}

impl SentenceEmbedder {
    pub fn load(cfg: &EmbedConfig) -> Result<Self> {
        let device = DevicePreference::parse(&cfg.device).build()?;
        info!("embedding device → {}", describe(&device));

        let snapshot = match &cfg.model_dir {
            Some(dir) => local_snapshot(dir)?,
            None => fetch_snapshot(&cfg.model_id, &cfg.revision)?,
        };
        info!("embedding snapshot: {}", snapshot.weights.display());

        let raw_config = fs::read(&snapshot.config)
            .with_context(|| format!("failed to read {}", snapshot.config.display()))?;
        let meta: serde_json::Value = serde_json::from_slice(&raw_config)
            .with_context(|| format!("failed to parse {}", snapshot.config.display()))?;
        let model_type = meta
            .get("model_type")
            .and_then(|v| v.as_str())
            .unwrap_or("bert")
            .to_ascii_lowercase();

        let mut tokenizer = Tokenizer::from_file(&snapshot.tokenizer).map_err(|e| {
            anyhow!(
                "Tokenizer load failed ({}): {e}",
                snapshot.tokenizer.display()
            )
        })?;
        let pad_id = pad_token_id(&tokenizer);
        let pad_token = tokenizer
            .id_to_token(pad_id)
            .unwrap_or_else(|| "[PAD]".to_string());
        tokenizer.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            pad_id,
            pad_token,
            ..Default::default()
        }));
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length: cfg.max_len,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Tokenizer truncation setup failed: {e}"))?;

        let vb = build_var_builder(&snapshot.weights, DType::F32, &device)?;

        let (encoder, mut dims) = match model_type.as_str() {
            "bert" => {
                let config: BertConfig = serde_json::from_slice(&raw_config)
                    .with_context(|| format!("failed to parse {}", snapshot.config.display()))?;
                let dims = config_usize(&meta, "hidden_size")?;
                let model = BertModel::load(vb, &config)
                    .map_err(|e| anyhow!("failed to load bert weights: {e}"))?;
                (Encoder::Bert(model), dims)
            }
            "t5" => {
                let config: T5Config = serde_json::from_slice(&raw_config)
                    .with_context(|| format!("failed to parse {}", snapshot.config.display()))?;
                let dims = config_usize(&meta, "d_model")?;
                let model = T5EncoderModel::load(vb, &config)
                    .map_err(|e| anyhow!("failed to load t5 encoder weights: {e}"))?;
                (Encoder::T5(Mutex::new(model)), dims)
            }
            other => return Err(anyhow!("unsupported embedding model_type '{other}'")),
        };

        let mut dense = Vec::with_capacity(snapshot.dense.len());
        for files in &snapshot.dense {
            let layer = DenseProjection::load(files, &device)?;
            if layer.in_features != dims {
                return Err(anyhow!(
                    "{} expects {} input features but the encoder yields {dims}",
                    files.config.display(),
                    layer.in_features
                ));
            }
            info!("dense projection {dims} → {}", layer.out_features);
            dims = layer.out_features;
            dense.push(layer);
        }

        info!(
            "🚀 Loaded {} ({model_type}, {dims} dims) on {}",
            cfg.model_id,
            describe(&device)
        );

        Ok(Self {
            model_id: cfg.model_id.clone(),
            encoder,
            tokenizer,
            dense,
            device,
            dims,
            batch_size: cfg.batch_size,
            normalize: cfg.normalize,
        })
    }

    fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.encoder {
            Encoder::Bert(model) => {
                let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                let encodings = self
                    .tokenizer
                    .encode_batch(refs, true)
                    .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
                let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);
                let rows = encodings.len();

                let mut ids = Vec::with_capacity(rows * seq_len);
                let mut mask = Vec::with_capacity(rows * seq_len);
                for enc in &encodings {
                    ids.extend_from_slice(enc.get_ids());
                    mask.extend_from_slice(enc.get_attention_mask());
                }

                let ids = Tensor::from_vec(ids, (rows, seq_len), &self.device)?;
                let mask = Tensor::from_vec(mask, (rows, seq_len), &self.device)?;
                let token_type_ids = ids.zeros_like()?;

                let hidden = model.forward(&ids, &token_type_ids, Some(&mask))?;
                let pooled = mean_pool(&hidden, &mask)?;
                self.finish(pooled)
            }
            Encoder::T5(model) => {
                // No attention mask on the T5 encoder; encode unpadded, one text at a time.
                let mut model = model
                    .lock()
                    .map_err(|_| anyhow!("t5 encoder lock poisoned"))?;
                let mut out = Vec::with_capacity(texts.len());
                for text in texts {
                    let enc = self
                        .tokenizer
                        .encode(text.as_str(), true)
                        .map_err(|e| anyhow!("Tokenizer encode error: {e}"))?;
                    let ids = enc.get_ids().to_vec();
                    let len = ids.len();
                    let ids = Tensor::from_vec(ids, (1, len), &self.device)?;
                    let mask = Tensor::ones((1, len), DType::U32, &self.device)?;
                    let hidden = model.forward(&ids)?;
                    let pooled = mean_pool(&hidden, &mask)?;
                    out.extend(self.finish(pooled)?);
                }
                Ok(out)
            }
        }
    }

    fn finish(&self, mut pooled: Tensor) -> Result<Vec<Vec<f32>>> {
        for layer in &self.dense {
            pooled = layer.forward(&pooled)?;
        }
        let pooled = if self.normalize {
            l2_normalize(&pooled)?
        } else {
            pooled
        };
        pooled
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()
            .map_err(|e| anyhow!("failed to decode embeddings: {e}"))
    }
}

impl EmbeddingDelegate for SentenceEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            embeddings.extend(self.embed_chunk(chunk)?);
        }
        Ok(embeddings)
    }
}

/// Attention-masked mean over the sequence axis: `(batch, seq, hidden) -> (batch, hidden)`.
pub fn mean_pool(hidden: &Tensor, attention_mask: &Tensor) -> candle::Result<Tensor> {
    let hidden = hidden.to_dtype(DType::F32)?;
    let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
    let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
    let counts = mask.sum(1)?.clamp(1f32, f32::MAX)?;
    summed.broadcast_div(&counts)
}

pub fn l2_normalize(t: &Tensor) -> candle::Result<Tensor> {
    let norm = t.sqr()?.sum_keepdim(1)?.sqrt()?.clamp(1e-12f32, f32::MAX)?;
    t.broadcast_div(&norm)
}

fn local_snapshot(dir: &Path) -> Result<Snapshot> {
    let config = dir.join("config.json");
    if !config.exists() {
        return Err(anyhow!("config.json not found under {}", dir.display()));
    }
    let tokenizer = dir.join("tokenizer.json");
    if !tokenizer.exists() {
        return Err(anyhow!("tokenizer.json not found under {}", dir.display()));
    }
    let weights = local_weights(dir)?;

    let modules = dir.join("modules.json");
    let dense = if modules.exists() {
        dense_paths(&fs::read(&modules)?)
            .with_context(|| format!("failed to parse {}", modules.display()))?
            .into_iter()
            .map(|path| {
                let module_dir = dir.join(path);
                Ok(DenseFiles {
                    config: module_dir.join("config.json"),
                    weights: local_weights(&module_dir)?,
                })
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    Ok(Snapshot {
        config,
        tokenizer,
        weights,
        dense,
    })
}

fn local_weights(dir: &Path) -> Result<PathBuf> {
    WEIGHT_CANDIDATES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .ok_or_else(|| anyhow!("no model weights found under {}", dir.display()))
}

/// Directories of the `Dense` modules in a `modules.json` pipeline.
fn dense_paths(raw: &[u8]) -> Result<Vec<String>> {
    let modules: Vec<ModuleEntry> = serde_json::from_slice(raw)?;
    Ok(modules
        .into_iter()
        .filter(|m| m.kind.ends_with(".Dense"))
        .map(|m| m.path)
        .collect())
}

fn fetch_snapshot(model_id: &str, revision: &str) -> Result<Snapshot> {
    info!("📦 fetching {model_id}@{revision} from the Hugging Face hub");
    let api = Api::new().context("failed to initialise hf-hub client")?;
    let repo = api.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    let config = repo
        .get("config.json")
        .with_context(|| format!("failed to fetch config.json for {model_id}"))?;
    let tokenizer = repo
        .get("tokenizer.json")
        .with_context(|| format!("failed to fetch tokenizer.json for {model_id}"))?;

    let weights = fetch_weights(&repo, "")
        .with_context(|| format!("no model weights found for {model_id}"))?;

    // Plain transformer repos ship no modules.json; pooled output is used as is.
    let dense = match repo.get("modules.json") {
        Ok(modules) => dense_paths(&fs::read(&modules)?)
            .with_context(|| format!("failed to parse modules.json for {model_id}"))?
            .into_iter()
            .map(|path| {
                let config = repo
                    .get(&format!("{path}/config.json"))
                    .with_context(|| format!("failed to fetch {path}/config.json for {model_id}"))?;
                let weights = fetch_weights(&repo, &format!("{path}/"))
                    .with_context(|| format!("no {path} weights found for {model_id}"))?;
                Ok(DenseFiles { config, weights })
            })
            .collect::<Result<Vec<_>>>()?,
        Err(err) => {
            debug!("no modules.json for {model_id}: {err}");
            Vec::new()
        }
    };

    Ok(Snapshot {
        config,
        tokenizer,
        weights,
        dense,
    })
}

fn fetch_weights(repo: &ApiRepo, prefix: &str) -> Result<PathBuf> {
    let mut last_err = None;
    for name in WEIGHT_CANDIDATES {
        match repo.get(&format!("{prefix}{name}")) {
            Ok(weights) => return Ok(weights),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err
        .map(anyhow::Error::from)
        .unwrap_or_else(|| anyhow!("no weight candidates to try")))
}

fn build_var_builder(path: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if ext == "safetensors" {
        let files = vec![path.to_path_buf()];
        unsafe {
            VarBuilder::from_mmaped_safetensors(&files, dtype, device)
                .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
        }
    } else {
        VarBuilder::from_pth(path, dtype, device)
            .map_err(|e| anyhow!("failed to load {}: {e}", path.display()))
    }
}

fn config_usize(meta: &serde_json::Value, key: &str) -> Result<usize> {
    meta.get(key)
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("config.json is missing `{key}`"))
}

fn pad_token_id(tokenizer: &Tokenizer) -> u32 {
    tokenizer
        .get_padding()
        .map(|params| params.pad_id)
        .or_else(|| tokenizer.token_to_id("[PAD]"))
        .or_else(|| tokenizer.token_to_id("<pad>"))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_pool_ignores_padding_positions() {
        let device = Device::Cpu;
        // batch of 2, seq 3, hidden 2; second row has one padded slot
        let hidden = Tensor::new(
            &[
                [[1f32, 2.], [3., 4.], [5., 6.]],
                [[2f32, 2.], [4., 4.], [100., 100.]],
            ],
            &device,
        )
        .unwrap();
        let mask = Tensor::new(&[[1u32, 1, 1], [1, 1, 0]], &device).unwrap();

        let pooled = mean_pool(&hidden, &mask).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(pooled, vec![vec![3., 4.], vec![3., 3.]]);
    }

    #[test]
    fn l2_normalize_yields_unit_rows() {
        let device = Device::Cpu;
        let t = Tensor::new(&[[3f32, 4.], [0., 0.]], &device).unwrap();
        let rows = l2_normalize(&t).unwrap().to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.6).abs() < 1e-6);
        assert!((rows[0][1] - 0.8).abs() < 1e-6);
        // zero vectors stay zero instead of turning into NaN
        assert_eq!(rows[1], vec![0., 0.]);
    }

    #[test]
    fn local_snapshot_requires_weights() {
        let dir = std::env::temp_dir().join(format!("ragserve-snapshot-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), "{}").unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();

        let err = local_snapshot(&dir).err().expect("weights are missing");
        assert!(err.to_string().contains("no model weights"));

        fs::write(dir.join("pytorch_model.bin"), b"").unwrap();
        let snap = local_snapshot(&dir).unwrap();
        assert!(snap.weights.ends_with("pytorch_model.bin"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn local_snapshot_picks_up_dense_projection() {
        let dir = std::env::temp_dir().join(format!("ragserve-dense-{}", std::process::id()));
        let dense_dir = dir.join("2_Dense");
        fs::create_dir_all(&dense_dir).unwrap();
        fs::write(dir.join("config.json"), "{}").unwrap();
        fs::write(dir.join("tokenizer.json"), "{}").unwrap();
        fs::write(dir.join("model.safetensors"), b"").unwrap();
        fs::write(
            dir.join("modules.json"),
            r#"[
                {"idx":0,"name":"0","path":"","type":"sentence_transformers.models.Transformer"},
                {"idx":1,"name":"1","path":"1_Pooling","type":"sentence_transformers.models.Pooling"},
                {"idx":2,"name":"2","path":"2_Dense","type":"sentence_transformers.models.Dense"},
                {"idx":3,"name":"3","path":"3_Normalize","type":"sentence_transformers.models.Normalize"}
            ]"#,
        )
        .unwrap();
        fs::write(
            dense_dir.join("config.json"),
            r#"{"in_features":3,"out_features":2,"bias":false,
                "activation_function":"torch.nn.modules.linear.Identity"}"#,
        )
        .unwrap();

        let device = Device::Cpu;
        let weight = Tensor::new(&[[1f32, 0., 0.], [0., 1., 1.]], &device).unwrap();
        let tensors = std::collections::HashMap::from([("linear.weight", weight)]);
        candle::safetensors::save(&tensors, dense_dir.join("model.safetensors")).unwrap();

        let snap = local_snapshot(&dir).unwrap();
        assert_eq!(snap.dense.len(), 1);

        let layer = DenseProjection::load(&snap.dense[0], &device).unwrap();
        assert_eq!((layer.in_features, layer.out_features), (3, 2));
        let pooled = Tensor::new(&[[1f32, 2., 3.]], &device).unwrap();
        let projected = layer.forward(&pooled).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(projected, vec![vec![1., 5.]]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn dense_activation_defaults_to_tanh() {
        assert_eq!(Activation::parse(None).unwrap(), Activation::Tanh);
        assert_eq!(
            Activation::parse(Some("torch.nn.modules.linear.Identity")).unwrap(),
            Activation::Identity
        );
        assert!(Activation::parse(Some("torch.nn.modules.activation.GELU")).is_err());
    }

    #[test]
    fn load_real_snapshot_if_present() {
        let snapshot = PathBuf::from("models/all-MiniLM-L6-v2");
        if !snapshot.join("config.json").exists() {
            eprintln!(
                "embedding snapshot missing under {}, skipping test",
                snapshot.display()
            );
            return;
        }
        let cfg = EmbedConfig {
            model_id: "all-MiniLM-L6-v2".into(),
            revision: "main".into(),
            model_dir: Some(snapshot),
            device: "cpu".into(),
            batch_size: 32,
            max_len: 256,
            normalize: true,
        };
        let embedder = SentenceEmbedder::load(&cfg).expect("failed to load embedder");
        let out = embedder
            .embed(&["a".to_string(), "a much longer sentence".to_string()])
            .expect("embedding failed");
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|v| v.len() == embedder.dimensions()));
    }
}
