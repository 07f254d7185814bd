//! Sequence-model abstraction and the trainable GPT-2 implementation
//!
//! Two traits separate what the estimator needs from what the training loop
//! needs:
//!
//! - [`SequenceModel`]: read-only next-token and per-layer logits
//! - [`CriterionModel`]: gradient steps, schedule, and terminal-token accuracy
//!
//! [`ReasoningModel`] implements both on top of [`Gpt2`] and owns its
//! checkpoint format:
//!
//! ```text
//! <models_root>/<model_name>/
//!     model.safetensors   # VarMap weights
//!     config.json         # ModelConfig, vocab size, batch mode
//!     vocab.json          # ChainTokenizer
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::batch::BatchMode;
use crate::forward_gpt2::{Gpt2, ModelConfig};
use crate::logit_lens::{decode_predictions, top_k, LogitLensAnalysis, LogitLensResult};
use crate::optim::{LearningRateSchedule, OptimizerConfig, ScheduleConfig, UpdateRule};
use crate::tokenizer::ChainTokenizer;

const WEIGHTS_FILE: &str = "model.safetensors";
const CONFIG_FILE: &str = "config.json";
const VOCAB_FILE: &str = "vocab.json";

/// Read access to an autoregressive model
///
/// Distributions are returned as unnormalized logits over the vocabulary.
pub trait SequenceModel {
    /// Number of transformer blocks; read-out layers are `0..=n_layers()`
    fn n_layers(&self) -> usize;

    /// Vocabulary id of a single-symbol token
    fn token_id(&self, symbol: &str) -> Option<u32>;

    /// Logits for the token following `prompt`, from the final layer
    fn next_token_distribution(&self, prompt: &str) -> Result<Vec<f32>>;

    /// Logits from applying the decoding head to hidden state `layer` at the
    /// last prompt position
    fn layer_readout(&self, prompt: &str, layer: usize) -> Result<Vec<f32>>;

    /// `P("1")` under a softmax over the "0" and "1" logits only
    fn binary_probability(&self, logits: &[f32]) -> Result<f64> {
        let zero = self.token_id("0").context("Vocabulary has no \"0\" token")? as usize;
        let one = self.token_id("1").context("Vocabulary has no \"1\" token")? as usize;
        anyhow::ensure!(
            zero < logits.len() && one < logits.len(),
            "Logit vector of length {} does not cover the binary tokens",
            logits.len()
        );
        Ok(binary_softmax(logits[zero], logits[one]))
    }
}

/// A model that can be trained to criterion
pub trait CriterionModel {
    /// Batch-construction variant fixed at model creation
    fn batch_mode(&self) -> BatchMode;

    /// One gradient update on next-token cross-entropy; returns the loss
    fn train_step(&mut self, batch: &[String]) -> Result<f32>;

    /// Advance the learning-rate schedule, returning the new rate
    fn advance_schedule(&mut self) -> f64;

    fn learning_rate(&self) -> f64;

    /// Mean probability assigned to each string's final token
    fn accuracy(&self, dataset: &[String]) -> Result<f64>;
}

/// Two-way softmax, returning the weight of the second logit
pub fn binary_softmax(logit_zero: f32, logit_one: f32) -> f64 {
    1.0 / (1.0 + (f64::from(logit_zero) - f64::from(logit_one)).exp())
}

/// Full-vocabulary softmax of a logit vector
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Mean probability of each string's last character given the rest
///
/// `prompt_prefix` is prepended to every prompt, matching how the model saw
/// samples during training.
pub fn terminal_token_accuracy<M: SequenceModel + ?Sized>(
    model: &M,
    dataset: &[String],
    prompt_prefix: &str,
) -> Result<f64> {
    anyhow::ensure!(!dataset.is_empty(), "Cannot measure accuracy on an empty dataset");

    let mut total = 0.0;
    for sample in dataset {
        let mut chars = sample.chars();
        let label = chars
            .next_back()
            .with_context(|| "Empty string in accuracy dataset")?;
        let prompt = format!("{prompt_prefix}{}", chars.as_str());

        let label_id = model
            .token_id(&label.to_string())
            .with_context(|| format!("Label {label:?} is not in the vocabulary"))?
            as usize;
        let probs = softmax(&model.next_token_distribution(&prompt)?);
        let p = probs
            .get(label_id)
            .copied()
            .with_context(|| format!("Label id {label_id} out of range"))?;
        total += f64::from(p);
    }
    Ok(total / dataset.len() as f64)
}

/// Directory holding a named checkpoint
pub fn checkpoint_dir(models_root: &Path, model_name: &str) -> PathBuf {
    models_root.join(model_name)
}

/// Pick CUDA when available unless `force_cpu`
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointConfig {
    model: ModelConfig,
    vocab_size: usize,
    batch_mode: BatchMode,
}

/// GPT-2 reasoning model with its tokenizer and optional optimizer state
pub struct ReasoningModel {
    backbone: Gpt2,
    varmap: VarMap,
    /// Trainable variables sorted by name, so update rules see a stable order
    parameters: Vec<Var>,
    tokenizer: ChainTokenizer,
    config: ModelConfig,
    batch_mode: BatchMode,
    device: Device,
    update_rule: Option<Box<dyn UpdateRule>>,
    schedule: Option<Box<dyn LearningRateSchedule>>,
    learning_rate: f64,
    schedule_step: usize,
}

impl ReasoningModel {
    /// Fresh randomly initialised model
    pub fn new(
        config: ModelConfig,
        tokenizer: ChainTokenizer,
        batch_mode: BatchMode,
        device: &Device,
    ) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let backbone = Gpt2::new(&config, tokenizer.vocab_size(), vb)?;
        let parameters = sorted_parameters(&varmap)?;
        debug!(
            "Initialised model with {} parameter tensors ({} mode)",
            parameters.len(),
            batch_mode
        );

        Ok(Self {
            backbone,
            varmap,
            parameters,
            tokenizer,
            config,
            batch_mode,
            device: device.clone(),
            update_rule: None,
            schedule: None,
            learning_rate: 0.0,
            schedule_step: 0,
        })
    }

    /// Attach an update rule and learning-rate schedule
    pub fn with_training(mut self, optimizer: &OptimizerConfig, schedule: &ScheduleConfig) -> Self {
        let schedule = schedule.build(optimizer.base_learning_rate());
        self.learning_rate = schedule.next_learning_rate(0);
        self.schedule_step = 0;
        self.schedule = Some(schedule);
        self.update_rule = Some(optimizer.build());
        self
    }

    /// Load a checkpoint written by [`ReasoningModel::save`]
    pub fn load(dir: &Path, device: &Device) -> Result<Self> {
        let config_path = dir.join(CONFIG_FILE);
        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let checkpoint: CheckpointConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let tokenizer = ChainTokenizer::from_file(&dir.join(VOCAB_FILE))?;
        anyhow::ensure!(
            tokenizer.vocab_size() == checkpoint.vocab_size,
            "Vocab file has {} tokens but config expects {}",
            tokenizer.vocab_size(),
            checkpoint.vocab_size
        );

        let mut model = Self::new(checkpoint.model, tokenizer, checkpoint.batch_mode, device)?;
        let weights = dir.join(WEIGHTS_FILE);
        model
            .varmap
            .load(&weights)
            .with_context(|| format!("Failed to load weights from {}", weights.display()))?;

        info!(
            "Loaded model from {}: {} layers, {} hidden, {} vocab",
            dir.display(),
            model.n_layers(),
            model.d_model(),
            model.tokenizer.vocab_size()
        );
        Ok(model)
    }

    /// Write weights, config and vocabulary into `dir`
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        self.varmap.save(dir.join(WEIGHTS_FILE))?;
        let checkpoint = CheckpointConfig {
            model: self.config.clone(),
            vocab_size: self.tokenizer.vocab_size(),
            batch_mode: self.batch_mode,
        };
        std::fs::write(
            dir.join(CONFIG_FILE),
            serde_json::to_string_pretty(&checkpoint)?,
        )?;
        self.tokenizer.save(&dir.join(VOCAB_FILE))?;

        info!("Saved model to {}", dir.display());
        Ok(())
    }

    pub fn d_model(&self) -> usize {
        self.backbone.d_model()
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &ChainTokenizer {
        &self.tokenizer
    }

    fn prompt_ids(&self, prompt: &str) -> Result<Tensor> {
        let ids = self.tokenizer.encode(prompt)?;
        Ok(Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Mean next-token loss over a batch of strings
    ///
    /// Equal-length strings are stacked into one `(batch, seq)` tensor;
    /// otherwise per-string losses are averaged.
    fn batch_loss(&self, batch: &[String]) -> Result<Tensor> {
        let encoded = batch
            .iter()
            .map(|s| self.tokenizer.encode(s))
            .collect::<Result<Vec<_>>>()?;

        let seq_len = encoded[0].len();
        if encoded.iter().all(|ids| ids.len() == seq_len) {
            let flat: Vec<u32> = encoded.concat();
            let ids = Tensor::from_vec(flat, (encoded.len(), seq_len), &self.device)?;
            return self.backbone.loss(&ids);
        }

        let losses = encoded
            .iter()
            .map(|ids| {
                let t = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
                self.backbone.loss(&t)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&losses, 0)?.mean_all()?)
    }

    /// Top-k tokens and binary probability at every read-out layer
    pub fn logit_lens(&self, prompt: &str, k: usize) -> Result<LogitLensAnalysis> {
        let ids = self.prompt_ids(prompt)?;
        let (_logits, cache) = self.backbone.forward_with_cache(&ids)?;

        let mut analysis = LogitLensAnalysis::new(prompt.to_string(), cache.n_layers());
        for layer in 0..cache.n_layers() {
            let hidden = cache
                .get_layer(layer)
                .with_context(|| format!("Layer {layer} missing from cache"))?;
            let logits: Vec<f32> = self
                .backbone
                .project_to_vocab(hidden)?
                .to_dtype(DType::F32)?
                .to_vec1()?;
            let probs = softmax(&logits);
            analysis.push(LogitLensResult {
                layer,
                predictions: decode_predictions(&top_k(&probs, k), &self.tokenizer),
                binary_probability: self.binary_probability(&logits)?,
            });
        }
        Ok(analysis)
    }
}

impl SequenceModel for ReasoningModel {
    fn n_layers(&self) -> usize {
        self.backbone.n_layers()
    }

    fn token_id(&self, symbol: &str) -> Option<u32> {
        self.tokenizer.token_id(symbol)
    }

    fn next_token_distribution(&self, prompt: &str) -> Result<Vec<f32>> {
        self.layer_readout(prompt, self.backbone.n_layers())
    }

    fn layer_readout(&self, prompt: &str, layer: usize) -> Result<Vec<f32>> {
        let ids = self.prompt_ids(prompt)?;
        let logits = self.backbone.layer_logits(&ids, layer)?;
        Ok(logits.to_dtype(DType::F32)?.to_vec1()?)
    }
}

impl CriterionModel for ReasoningModel {
    fn batch_mode(&self) -> BatchMode {
        self.batch_mode
    }

    fn train_step(&mut self, batch: &[String]) -> Result<f32> {
        anyhow::ensure!(!batch.is_empty(), "Cannot train on an empty batch");
        let loss = self.batch_loss(batch)?;
        let grads = loss.backward()?;

        let rule = self
            .update_rule
            .as_mut()
            .context("Model has no update rule; build it with `with_training`")?;
        rule.step(&self.parameters, &grads, self.learning_rate)?;

        Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
    }

    fn advance_schedule(&mut self) -> f64 {
        if let Some(schedule) = &self.schedule {
            self.schedule_step += 1;
            self.learning_rate = schedule.next_learning_rate(self.schedule_step);
        }
        self.learning_rate
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn accuracy(&self, dataset: &[String]) -> Result<f64> {
        terminal_token_accuracy(self, dataset, &self.batch_mode.prompt_prefix())
    }
}

fn sorted_parameters(varmap: &VarMap) -> Result<Vec<Var>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|e| anyhow::anyhow!("VarMap lock poisoned: {e}"))?;
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    Ok(named.into_iter().map(|(_, var)| var.clone()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::cell::RefCell;

    fn tiny_model(batch_mode: BatchMode) -> ReasoningModel {
        let config = ModelConfig {
            n_positions: 32,
            n_embd: 16,
            n_layer: 2,
            n_head: 2,
            ..ModelConfig::default()
        };
        let tokenizer = ChainTokenizer::for_variables(&["A", "B", "C"]);
        ReasoningModel::new(config, tokenizer, batch_mode, &Device::Cpu).unwrap()
    }

    /// Fixed logits over a `0`/`1`-only vocabulary
    struct FixedLogits(Vec<f32>);

    impl SequenceModel for FixedLogits {
        fn n_layers(&self) -> usize {
            1
        }
        fn token_id(&self, symbol: &str) -> Option<u32> {
            match symbol {
                "0" => Some(0),
                "1" => Some(1),
                _ => None,
            }
        }
        fn next_token_distribution(&self, _prompt: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
        fn layer_readout(&self, _prompt: &str, _layer: usize) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_binary_softmax() {
        assert!((binary_softmax(0.0, 0.0) - 0.5).abs() < 1e-12);
        assert!(binary_softmax(0.0, 30.0) > 0.999_999);
        assert!(binary_softmax(30.0, 0.0) < 1e-6);
        let p = binary_softmax(1.0, 2.0);
        assert!((p - 1.0 / (1.0 + (-1.0f64).exp())).abs() < 1e-9);
    }

    #[test]
    fn test_binary_probability_ignores_other_tokens() {
        // a huge logit elsewhere in the vocabulary does not dilute P("1")
        let model = FixedLogits(vec![0.0, 0.0, 50.0]);
        let p = model.binary_probability(&[0.0, 0.0, 50.0]).unwrap();
        assert!((p - 0.5).abs() < 1e-12);
        assert!(model.binary_probability(&[0.0]).is_err());
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probs = softmax(&[1.0, 2.0, 3.0, -100.0]);
        let total: f32 = probs.iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn test_terminal_token_accuracy() {
        let model = FixedLogits(vec![0.0, (3.0f32).ln()]);
        let dataset = vec!["A=0\nB=1".to_string(), "A=1\nB=0".to_string()];
        // P("1") = 0.75, P("0") = 0.25
        let acc = terminal_token_accuracy(&model, &dataset, "").unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
        assert!(terminal_token_accuracy(&model, &[], "").is_err());
    }

    /// Uniform over `0`/`1`, remembering every prompt it is asked about
    #[derive(Default)]
    struct RecordingModel {
        prompts: RefCell<Vec<String>>,
    }

    impl SequenceModel for RecordingModel {
        fn n_layers(&self) -> usize {
            1
        }
        fn token_id(&self, symbol: &str) -> Option<u32> {
            FixedLogits(Vec::new()).token_id(symbol)
        }
        fn next_token_distribution(&self, prompt: &str) -> Result<Vec<f32>> {
            self.prompts.borrow_mut().push(prompt.to_string());
            Ok(vec![0.0, 0.0])
        }
        fn layer_readout(&self, prompt: &str, _layer: usize) -> Result<Vec<f32>> {
            self.next_token_distribution(prompt)
        }
    }

    #[test]
    fn test_accuracy_prompts_carry_batch_mode_prefix() {
        let dataset = vec!["A=0\nB=1".to_string()];

        let model = RecordingModel::default();
        let prefix = BatchMode::BatchWithSeparator.prompt_prefix();
        let acc = terminal_token_accuracy(&model, &dataset, &prefix).unwrap();
        assert!((acc - 0.5).abs() < 1e-6);
        assert_eq!(*model.prompts.borrow(), vec!["#\nA=0\nB=".to_string()]);

        let model = RecordingModel::default();
        let prefix = BatchMode::BatchNoSeparator.prompt_prefix();
        terminal_token_accuracy(&model, &dataset, &prefix).unwrap();
        assert_eq!(*model.prompts.borrow(), vec!["A=0\nB=".to_string()]);
    }

    #[test]
    #[serial]
    fn test_accuracy_follows_batch_mode() {
        let dataset = vec!["A=1\nB=1".to_string(), "B=0\nC=0".to_string()];
        let model = tiny_model(BatchMode::BatchWithSeparator);
        let acc = model.accuracy(&dataset).unwrap();
        let with_prefix = terminal_token_accuracy(&model, &dataset, "#\n").unwrap();
        assert!((acc - with_prefix).abs() < 1e-9);
    }

    #[test]
    #[serial]
    fn test_final_readout_matches_next_token() {
        let model = tiny_model(BatchMode::SingleSample);
        let prompt = "#\nA=1\nB=";
        let next = model.next_token_distribution(prompt).unwrap();
        let readout = model.layer_readout(prompt, model.n_layers()).unwrap();
        assert_eq!(next.len(), model.tokenizer().vocab_size());
        for (a, b) in next.iter().zip(&readout) {
            assert!((a - b).abs() < 1e-5);
        }
        assert!(model.layer_readout(prompt, model.n_layers() + 1).is_err());
    }

    #[test]
    #[serial]
    fn test_train_step_requires_update_rule() {
        let mut model = tiny_model(BatchMode::SingleSample);
        assert!(model.train_step(&["A=1\nB=1".to_string()]).is_err());
    }

    #[test]
    #[serial]
    fn test_train_step_reduces_loss() {
        let mut model = tiny_model(BatchMode::SingleSample).with_training(
            &OptimizerConfig::Adam {
                lr: 1e-2,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
            },
            &ScheduleConfig::Constant,
        );
        let batch = vec!["A=1\nB=1".to_string(), "A=0\nB=0".to_string()];
        let first = model.train_step(&batch).unwrap();
        let mut last = first;
        for _ in 0..30 {
            last = model.train_step(&batch).unwrap();
        }
        assert!(first.is_finite());
        assert!(last < first, "loss {first} -> {last}");
    }

    #[test]
    #[serial]
    fn test_ragged_batch_loss() {
        let mut model = tiny_model(BatchMode::BatchNoSeparator)
            .with_training(&OptimizerConfig::Sgd { lr: 0.1 }, &ScheduleConfig::Constant);
        let batch = vec!["A=1\nB=1".to_string(), "B=0\nC=1\nA".to_string()];
        assert!(model.train_step(&batch).unwrap().is_finite());
    }

    #[test]
    #[serial]
    fn test_schedule_advances() {
        let mut model = tiny_model(BatchMode::SingleSample)
            .with_training(&OptimizerConfig::Sgd { lr: 0.3 }, &ScheduleConfig::default());
        assert!((model.learning_rate() - 0.1).abs() < 1e-12);
        for _ in 0..5 {
            model.advance_schedule();
        }
        assert!((model.learning_rate() - 0.3).abs() < 1e-12);
    }

    #[test]
    #[serial]
    fn test_logit_lens_covers_every_layer() {
        let model = tiny_model(BatchMode::BatchWithSeparator);
        let analysis = model.logit_lens("#\nA=1\nB=", 3).unwrap();
        assert_eq!(analysis.layer_results.len(), model.n_layers() + 1);
        for (layer, result) in analysis.layer_results.iter().enumerate() {
            assert_eq!(result.layer, layer);
            assert_eq!(result.predictions.len(), 3);
            let direct = model.layer_readout("#\nA=1\nB=", layer).unwrap();
            let p = model.binary_probability(&direct).unwrap();
            assert!((p - result.binary_probability).abs() < 1e-5);
        }
    }
}
