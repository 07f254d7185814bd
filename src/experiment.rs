//! Experiment entry points: train one model to criterion, evaluate it
//!
//! Everything a run needs lives in [`ExperimentConfig`]; nothing is read from
//! the process environment.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::BatchMode;
use crate::chain::ChainProcess;
use crate::corpus::Corpus;
use crate::estimator::ScaffoldedEstimator;
use crate::evaluation::{run_evaluation, EvaluationTable};
use crate::forward_gpt2::ModelConfig;
use crate::model::{checkpoint_dir, select_device, CriterionModel, ReasoningModel};
use crate::optim::{OptimizerConfig, ScheduleConfig};
use crate::sweep::{chain_path, SweepEntry, CRITERION_SUFFIX};
use crate::tokenizer::{ChainTokenizer, SEPARATOR};
use crate::training::{CriterionConfig, CriterionTrainer, TrainingReport};

const TRAINING_REPORT_FILE: &str = "training.json";

/// Configuration for one training or evaluation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Chain interchange file
    pub chain_path: PathBuf,
    /// Base model name; the trained checkpoint carries a `_criterion` suffix
    pub model_name: String,
    pub models_root: PathBuf,
    pub results_dir: PathBuf,
    pub model: ModelConfig,
    pub optimizer: OptimizerConfig,
    pub schedule: ScheduleConfig,
    pub batch_mode: BatchMode,
    pub batch_size: usize,
    pub sample_length: usize,
    pub criterion_threshold: f64,
    /// `None` trains until convergence
    pub max_iterations: Option<usize>,
    pub log_every: usize,
    /// Rollouts per query during evaluation
    pub n_samples: usize,
    /// Prefix estimator prompts with the separator line; `None` follows the
    /// batch mode the checkpoint was trained with
    pub start_with_separator: Option<bool>,
    pub seed: u64,
    pub force_cpu: bool,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            chain_path: PathBuf::from("data/chains/chain_0.json"),
            model_name: "embd-256_chain-0_dataset-batch-with-separator_seed-2024".to_string(),
            models_root: PathBuf::from("models"),
            results_dir: PathBuf::from("data/results"),
            model: ModelConfig::default(),
            optimizer: OptimizerConfig::default(),
            schedule: ScheduleConfig::default(),
            batch_mode: BatchMode::default(),
            batch_size: 16,
            sample_length: 16,
            criterion_threshold: 0.9,
            max_iterations: None,
            log_every: 100,
            n_samples: 10,
            start_with_separator: None,
            seed: 2024,
            force_cpu: false,
        }
    }
}

impl ExperimentConfig {
    /// Configuration for one entry of the sweep grid
    pub fn from_sweep(
        entry: &SweepEntry,
        data_root: &Path,
        models_root: &Path,
        results_dir: &Path,
    ) -> Self {
        Self {
            chain_path: chain_path(data_root, entry.chain_index),
            model_name: entry.model_name(),
            models_root: models_root.to_path_buf(),
            results_dir: results_dir.to_path_buf(),
            batch_mode: entry.batch_mode,
            seed: entry.seed,
            ..Self::default()
        }
    }

    /// Load from JSON; missing fields take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn trained_model_name(&self) -> String {
        format!("{}{CRITERION_SUFFIX}", self.model_name)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        checkpoint_dir(&self.models_root, &self.trained_model_name())
    }

    pub fn results_path(&self) -> PathBuf {
        self.results_dir
            .join(format!("evaluation_model-{}.csv", self.trained_model_name()))
    }

    pub fn criterion(&self) -> CriterionConfig {
        CriterionConfig {
            threshold: self.criterion_threshold,
            batch_size: self.batch_size,
            sample_length: self.sample_length,
            max_iterations: self.max_iterations,
            log_every: self.log_every,
        }
    }

    /// Estimator prompt prefix for a checkpoint trained under `trained_with`
    ///
    /// An explicit `start_with_separator` wins, with a warning when it
    /// disagrees with what the model saw during training.
    pub fn prompt_prefix(&self, trained_with: BatchMode) -> String {
        let trained_prefix = trained_with.prompt_prefix();
        let Some(with_separator) = self.start_with_separator else {
            return trained_prefix;
        };
        let prefix = if with_separator {
            format!("{SEPARATOR}\n")
        } else {
            String::new()
        };
        if prefix != trained_prefix {
            warn!(
                "start_with_separator={} but {} was trained with {}",
                with_separator, self.model_name, trained_with
            );
        }
        prefix
    }

    fn device(&self) -> Device {
        let device = select_device(self.force_cpu);
        if let Err(e) = device.set_seed(self.seed) {
            debug!("Device does not accept a seed: {e}");
        }
        device
    }
}

/// Result of an evaluation request
#[derive(Debug)]
pub enum EvaluationOutcome {
    Completed {
        table: EvaluationTable,
        path: PathBuf,
    },
    /// The checkpoint does not exist yet
    Skipped { model_name: String, path: PathBuf },
}

/// Train a fresh model to criterion on the configured chain and save it
///
/// Unconverged runs (iteration budget exhausted) are not saved.
pub fn train(config: &ExperimentConfig) -> Result<TrainingReport> {
    info!("Training {}", config.model_name);
    debug!("Config: {:?}", config);

    let chain = ChainProcess::load(&config.chain_path)?;
    let mut rng = StdRng::seed_from_u64(config.seed);
    let device = config.device();

    let tokenizer = ChainTokenizer::for_variables(chain.variables());
    let mut model =
        ReasoningModel::new(config.model.clone(), tokenizer, config.batch_mode, &device)?
            .with_training(&config.optimizer, &config.schedule);

    let corpus = Corpus::compile(&chain, &mut rng)?;
    let criterion = config.criterion();
    let report = CriterionTrainer::new(&criterion, &corpus).run(&mut model, &mut rng)?;

    if report.converged {
        let dir = config.checkpoint_dir();
        model.save(&dir)?;
        let report_path = dir.join(TRAINING_REPORT_FILE);
        std::fs::write(&report_path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write {}", report_path.display()))?;
    } else {
        warn!(
            "{} did not converge in {} iterations; checkpoint not saved",
            config.model_name, report.iterations
        );
    }
    Ok(report)
}

/// Evaluate the trained checkpoint, skipping it if it has not been written
pub fn evaluate(config: &ExperimentConfig) -> Result<EvaluationOutcome> {
    let model_name = config.trained_model_name();
    let dir = config.checkpoint_dir();
    if !dir.exists() {
        warn!("Model not found: {} ({})", model_name, dir.display());
        return Ok(EvaluationOutcome::Skipped {
            model_name,
            path: dir,
        });
    }

    info!("Evaluating {}", model_name);
    let chain = ChainProcess::load(&config.chain_path)?;
    let device = config.device();
    let model = ReasoningModel::load(&dir, &device)?;

    let prefix = config.prompt_prefix(model.batch_mode());
    let estimator = ScaffoldedEstimator::new(config.n_samples, prefix);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let table = run_evaluation(&model, &chain, &estimator, &mut rng)?;

    let path = config.results_path();
    table.write_csv(&path)?;
    Ok(EvaluationOutcome::Completed { table, path })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sweep::select;

    #[test]
    fn test_defaults_follow_sweep() {
        let config = ExperimentConfig::default();
        assert_eq!(config.model.n_embd, 256);
        assert_eq!(config.model.n_layer, 8);
        assert_eq!(config.batch_mode, BatchMode::BatchWithSeparator);
        assert_eq!(config.max_iterations, None);
        assert_eq!(config.start_with_separator, None);
    }

    #[test]
    fn test_prompt_prefix_follows_checkpoint() {
        let config = ExperimentConfig::default();
        assert_eq!(config.prompt_prefix(BatchMode::BatchWithSeparator), "#\n");
        assert_eq!(config.prompt_prefix(BatchMode::BatchNoSeparator), "");
        assert_eq!(config.prompt_prefix(BatchMode::SingleSample), "");

        let forced = ExperimentConfig {
            start_with_separator: Some(true),
            ..ExperimentConfig::default()
        };
        assert_eq!(forced.prompt_prefix(BatchMode::BatchNoSeparator), "#\n");
        let stripped = ExperimentConfig {
            start_with_separator: Some(false),
            ..ExperimentConfig::default()
        };
        assert_eq!(stripped.prompt_prefix(BatchMode::BatchWithSeparator), "");
    }

    #[test]
    fn test_from_sweep_paths() {
        let entry = select(5).unwrap();
        let config = ExperimentConfig::from_sweep(
            &entry,
            Path::new("data"),
            Path::new("models"),
            Path::new("results"),
        );
        assert_eq!(config.chain_path, Path::new("data/chains/chain_1.json"));
        assert_eq!(config.seed, 2025);
        assert_eq!(
            config.checkpoint_dir(),
            Path::new("models/embd-256_chain-1_dataset-batch-with-separator_seed-2025_criterion")
        );
        assert_eq!(
            config.results_path(),
            Path::new(
                "results/evaluation_model-embd-256_chain-1_dataset-batch-with-separator_seed-2025_criterion.csv"
            )
        );
    }

    #[test]
    fn test_partial_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "model_name": "tiny", "max_iterations": 50, "optimizer": { "kind": "sgd", "lr": 0.1 } }"#,
        )
        .unwrap();
        let config = ExperimentConfig::from_file(&path).unwrap();
        assert_eq!(config.model_name, "tiny");
        assert_eq!(config.max_iterations, Some(50));
        assert_eq!(config.optimizer, OptimizerConfig::Sgd { lr: 0.1 });
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.criterion().threshold, 0.9);
    }
}
