//! GPT-2 style forward pass with per-layer read-out
//!
//! Small causal transformer trained from scratch on chain samples. The
//! decoding head is tied to the token embedding, so the same head can be
//! applied to any intermediate hidden state ("what would the model predict if
//! it stopped at layer ℓ").
//!
//! Hidden-state indexing follows the usual GPT-2 convention:
//! - `0`: token + position embeddings
//! - `1..n_layer`: residual stream after block `ℓ`
//! - `n_layer`: final layer norm applied to the last block's output
//!
//! Layer norms are built from primitive tensor ops so every path supports
//! backpropagation.

use anyhow::Result;
use candle_core::{DType, IndexOp, Module, Tensor, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::LayerCache;
use crate::masks::create_causal_mask;

/// Architecture hyperparameters (vocabulary size comes from the tokenizer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub n_positions: usize,
    pub n_embd: usize,
    pub n_layer: usize,
    pub n_head: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_initializer_range")]
    pub initializer_range: f64,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

fn default_initializer_range() -> f64 {
    0.02
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            n_positions: 512,
            n_embd: 256,
            n_layer: 8,
            n_head: 2,
            layer_norm_epsilon: default_layer_norm_epsilon(),
            initializer_range: default_initializer_range(),
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.n_layer > 0, "n_layer must be positive");
        anyhow::ensure!(self.n_head > 0, "n_head must be positive");
        anyhow::ensure!(
            self.n_embd % self.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            self.n_embd,
            self.n_head
        );
        anyhow::ensure!(self.n_positions > 1, "n_positions must exceed 1");
        Ok(())
    }
}

fn linear_init(in_dim: usize, out_dim: usize, stdev: f64, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (out_dim, in_dim),
        "weight",
        Init::Randn { mean: 0.0, stdev },
    )?;
    let bias = vb.get_with_hints(out_dim, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Layer norm with learned affine parameters
struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        Ok(normed.broadcast_mul(&self.weight)?.broadcast_add(&self.bias)?)
    }
}

/// Causal multi-head self-attention with a fused QKV projection
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let c_attn = linear_init(
            config.n_embd,
            3 * config.n_embd,
            config.initializer_range,
            vb.pp("c_attn"),
        )?;
        let c_proj = linear_init(
            config.n_embd,
            config.n_embd,
            config.initializer_range,
            vb.pp("c_proj"),
        )?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: config.n_head,
            head_dim: config.n_embd / config.n_head,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, seq_len, n_embd) = x.dims3()?;

        let qkv = self.c_attn.forward(x)?;
        let split = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(2, i * n_embd, n_embd)?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = split(0)?;
        let k = split(1)?;
        let v = split(2)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;

        let mask = create_causal_mask(seq_len, x.device(), x.dtype())?;
        let attn_weights = attn_weights.broadcast_add(&mask)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, n_embd))?;
        Ok(self.c_proj.forward(&attn_output)?)
    }
}

/// Position-wise feed-forward block
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let inner = 4 * config.n_embd;
        Ok(Self {
            c_fc: linear_init(config.n_embd, inner, config.initializer_range, vb.pp("c_fc"))?,
            c_proj: linear_init(inner, config.n_embd, config.initializer_range, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&hidden)?)
    }
}

/// Pre-norm transformer block
struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    fn load(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::load(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: LayerNorm::load(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_2"))?,
            mlp: MLP::load(vb.pp("mlp"), config)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?)?)?;
        let x = (&x + self.mlp.forward(&self.ln_2.forward(&x)?)?)?;
        Ok(x)
    }
}

/// GPT-2 style language model with tied decoding head
pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    n_positions: usize,
    n_embd: usize,
    vocab_size: usize,
}

impl Gpt2 {
    /// Build the model, creating (or fetching) its variables through `vb`
    pub fn new(config: &ModelConfig, vocab_size: usize, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        anyhow::ensure!(vocab_size > 0, "vocab_size must be positive");

        let init = Init::Randn {
            mean: 0.0,
            stdev: config.initializer_range,
        };
        let wte = Embedding::new(
            vb.pp("wte")
                .get_with_hints((vocab_size, config.n_embd), "weight", init)?,
            config.n_embd,
        );
        let wpe = Embedding::new(
            vb.pp("wpe")
                .get_with_hints((config.n_positions, config.n_embd), "weight", init)?,
            config.n_embd,
        );

        let blocks = (0..config.n_layer)
            .map(|i| Block::load(vb.pp(format!("h.{i}")), config))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = LayerNorm::load(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        debug!(
            "Built GPT-2: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, vocab_size
        );

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            n_positions: config.n_positions,
            n_embd: config.n_embd,
            vocab_size,
        })
    }

    /// Number of transformer blocks
    pub fn n_layers(&self) -> usize {
        self.blocks.len()
    }

    /// Hidden dimension
    pub fn d_model(&self) -> usize {
        self.n_embd
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Token + position embeddings for `(batch, seq)` ids
    fn embed(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(seq_len > 0, "Empty input sequence");
        anyhow::ensure!(
            seq_len <= self.n_positions,
            "Sequence length {seq_len} exceeds n_positions {}",
            self.n_positions
        );
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let tok = self.wte.forward(input_ids)?;
        let pos = self.wpe.forward(&positions)?;
        Ok(tok.broadcast_add(&pos)?)
    }

    /// Hidden states at read-out `layer` for every position: `(batch, seq, d_model)`
    ///
    /// Only the first `layer` blocks are evaluated.
    pub fn hidden_state(&self, input_ids: &Tensor, layer: usize) -> Result<Tensor> {
        let n_layers = self.n_layers();
        anyhow::ensure!(
            layer <= n_layers,
            "Read-out layer {layer} out of range (model has {n_layers} layers)"
        );

        let mut hidden = self.embed(input_ids)?;
        for block in &self.blocks[..layer] {
            hidden = block.forward(&hidden)?;
        }
        if layer == n_layers {
            hidden = self.ln_f.forward(&hidden)?;
        }
        Ok(hidden)
    }

    /// Full forward pass: logits for every position, `(batch, seq, vocab)`
    pub fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        let hidden = self.hidden_state(input_ids, self.n_layers())?;
        self.project_to_vocab(&hidden)
    }

    /// Forward pass capturing the last-position hidden state at every read-out layer
    ///
    /// Expects a single sequence, `(1, seq)`. Returns the final-layer logits
    /// for the last position alongside the cache.
    pub fn forward_with_cache(&self, input_ids: &Tensor) -> Result<(Tensor, LayerCache)> {
        let (_b, seq_len) = input_ids.dims2()?;
        let n_layers = self.n_layers();
        let mut cache = LayerCache::with_capacity(n_layers);

        let mut hidden = self.embed(input_ids)?;
        cache.push(hidden.i((0, seq_len - 1))?);

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden)?;
            if i + 1 == n_layers {
                hidden = self.ln_f.forward(&hidden)?;
            }
            cache.push(hidden.i((0, seq_len - 1))?);
        }

        let last = hidden.i((0, seq_len - 1))?;
        Ok((self.project_to_vocab(&last)?, cache))
    }

    /// Next-token logits at the last position, read out from `layer`: `(vocab,)`
    pub fn layer_logits(&self, input_ids: &Tensor, layer: usize) -> Result<Tensor> {
        let (_b, seq_len) = input_ids.dims2()?;
        let hidden = self.hidden_state(input_ids, layer)?;
        self.project_to_vocab(&hidden.i((0, seq_len - 1))?)
    }

    /// Apply the tied decoding head to hidden states of any leading shape
    pub fn project_to_vocab(&self, hidden: &Tensor) -> Result<Tensor> {
        let mut out_dims = hidden.dims().to_vec();
        let flat = hidden.reshape(((), self.n_embd))?;
        let logits = flat.matmul(&self.wte.embeddings().t()?)?;
        if let Some(last) = out_dims.last_mut() {
            *last = self.vocab_size;
        }
        Ok(logits.reshape(out_dims)?)
    }

    /// Mean next-token cross-entropy over a `(batch, seq)` batch of ids
    pub fn loss(&self, input_ids: &Tensor) -> Result<Tensor> {
        let (b, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(seq_len >= 2, "Need at least two tokens to compute a loss");

        let logits = self.forward(input_ids)?;
        let predictions = logits
            .narrow(1, 0, seq_len - 1)?
            .reshape((b * (seq_len - 1), self.vocab_size))?;
        let targets = input_ids.narrow(1, 1, seq_len - 1)?.reshape(b * (seq_len - 1))?;
        let loss = candle_nn::loss::cross_entropy(&predictions.to_dtype(DType::F32)?, &targets)?;
        Ok(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;
    use serial_test::serial;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            n_positions: 32,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            ..ModelConfig::default()
        }
    }

    fn tiny_model() -> (Gpt2, VarMap) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Gpt2::new(&tiny_config(), 7, vb).unwrap();
        (model, varmap)
    }

    fn ids(values: &[u32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap().unsqueeze(0).unwrap()
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let mut config = tiny_config();
        config.n_head = 3;
        assert!(config.validate().is_err());
        assert!(ModelConfig::default().validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_forward_shapes() {
        let (model, _varmap) = tiny_model();
        let input = ids(&[0, 1, 2, 3, 4]);
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[1, 5, 7]);
        assert_eq!(model.layer_logits(&input, 0).unwrap().dims(), &[7]);
    }

    #[test]
    #[serial]
    fn test_final_layer_readout_matches_forward() {
        let (model, _varmap) = tiny_model();
        let input = ids(&[5, 2, 3, 1, 6, 2]);
        let full = model.forward(&input).unwrap().i((0, 5)).unwrap();
        let readout = model.layer_logits(&input, model.n_layers()).unwrap();
        assert!(max_abs_diff(&full, &readout) < 1e-5);
    }

    #[test]
    #[serial]
    fn test_cache_agrees_with_layer_readout() {
        let (model, _varmap) = tiny_model();
        let input = ids(&[0, 5, 2, 3]);
        let (logits, cache) = model.forward_with_cache(&input).unwrap();
        assert_eq!(cache.n_layers(), model.n_layers() + 1);

        for layer in 0..=model.n_layers() {
            let from_cache = model
                .project_to_vocab(cache.get_layer(layer).unwrap())
                .unwrap();
            let direct = model.layer_logits(&input, layer).unwrap();
            assert!(max_abs_diff(&from_cache, &direct) < 1e-5, "layer {layer}");
        }
        let final_readout = model.layer_logits(&input, model.n_layers()).unwrap();
        assert!(max_abs_diff(&logits, &final_readout) < 1e-5);
    }

    #[test]
    #[serial]
    fn test_layer_out_of_range() {
        let (model, _varmap) = tiny_model();
        assert!(model.layer_logits(&ids(&[0, 1]), 3).is_err());
    }

    #[test]
    #[serial]
    fn test_sequence_too_long() {
        let (model, _varmap) = tiny_model();
        let long: Vec<u32> = (0..40).map(|i| i % 7).collect();
        assert!(model.forward(&ids(&long)).is_err());
    }

    #[test]
    #[serial]
    fn test_loss_is_finite_scalar() {
        let (model, varmap) = tiny_model();
        let batch = Tensor::new(&[[0u32, 1, 2, 3], [4, 5, 6, 0]], &Device::Cpu).unwrap();
        let loss = model.loss(&batch).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value > 0.0);

        let grads = loss.backward().unwrap();
        let with_grad = varmap
            .all_vars()
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert_eq!(with_grad, varmap.all_vars().len());
    }
}
