// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `prior`/`priors`
#![allow(clippy::module_name_repetitions)] // ChainProcess in chain.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! chain-reasoning: layer-wise scaffolded estimation
//!
//! Trains small causal transformers on samples from chain-structured binary
//! processes, then asks at which depth they can answer conditional queries
//! ("given A=1, what is P(E=1)?") by walking the chain one variable at a time.
//!
//! ## Architecture
//!
//! - `chain`: ChainProcess, exact conditionals, scaffolds, interchange file
//! - `tokenizer`: character tokenizer over the chain alphabet
//! - `forward_gpt2`: GPT-2 forward pass with per-layer read-out
//! - `cache`: LayerCache of last-position hidden states
//! - `masks`: cached causal attention masks
//! - `optim`: update rules and learning-rate schedules
//! - `batch`: batch-construction variants
//! - `corpus`: training corpus compilation
//! - `model`: SequenceModel / CriterionModel traits and ReasoningModel
//! - `training`: criterion training loop
//! - `estimator`: scaffolded Monte Carlo estimator
//! - `evaluation`: exact vs. estimated comparison table
//! - `logit_lens`: per-layer read-out inspection
//! - `sweep`: canonical chains and the hyperparameter grid
//! - `experiment`: `train` / `evaluate` entry points

pub mod batch;
pub mod cache;
pub mod chain;
pub mod corpus;
pub mod error;
pub mod estimator;
pub mod evaluation;
pub mod experiment;
pub mod forward_gpt2;
pub mod logit_lens;
pub mod masks;
pub mod model;
pub mod optim;
pub mod sweep;
pub mod tokenizer;
pub mod training;

pub use batch::BatchMode;
pub use cache::LayerCache;
pub use chain::{ChainProcess, ConditionalTable, Query};
pub use corpus::Corpus;
pub use error::{ChainError, ChainResult};
pub use estimator::{LayerEstimates, ScaffoldedEstimator};
pub use evaluation::{layer_column, run_evaluation, EvaluationRow, EvaluationTable};
pub use experiment::{evaluate, train, EvaluationOutcome, ExperimentConfig};
pub use forward_gpt2::{Gpt2, ModelConfig};
pub use logit_lens::{LogitLensAnalysis, LogitLensResult, TokenPrediction};
pub use masks::{clear_mask_caches, create_causal_mask};
pub use model::{
    binary_softmax, checkpoint_dir, select_device, terminal_token_accuracy, CriterionModel,
    ReasoningModel, SequenceModel,
};
pub use optim::{
    Adam, ConstantSchedule, LearningRateSchedule, LinearSchedule, OptimizerConfig,
    ScheduleConfig, Sgd, UpdateRule,
};
pub use sweep::SweepEntry;
pub use tokenizer::ChainTokenizer;
pub use training::{CriterionConfig, CriterionTrainer, TrainingReport, TrainingState};
