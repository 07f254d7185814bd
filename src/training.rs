//! Criterion training loop
//!
//! Trains until terminal-token accuracy on the full corpus exceeds the
//! threshold on two consecutive measurements. A single measurement above the
//! threshold is not enough. There is no iteration cap unless
//! `max_iterations` is set.

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::corpus::Corpus;
use crate::model::CriterionModel;

/// Training loop state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Training,
    Converged,
}

/// Stopping rule and batch sizes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub threshold: f64,
    pub batch_size: usize,
    pub sample_length: usize,
    /// Optional escape hatch; `None` trains until convergence
    pub max_iterations: Option<usize>,
    /// Iterations between INFO progress lines
    pub log_every: usize,
}

impl Default for CriterionConfig {
    fn default() -> Self {
        Self {
            threshold: 0.9,
            batch_size: 16,
            sample_length: 16,
            max_iterations: None,
            log_every: 100,
        }
    }
}

/// Result of a training run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Number of iterations run
    pub iterations: usize,
    pub accuracy: f64,
    pub last_accuracy: f64,
    pub loss: f32,
    pub learning_rate: f64,
    pub converged: bool,
}

/// Drives a [`CriterionModel`] over a fixed corpus
pub struct CriterionTrainer<'a> {
    config: &'a CriterionConfig,
    corpus: &'a Corpus,
    state: TrainingState,
    iteration: usize,
    accuracy: f64,
    last_accuracy: f64,
    loss: f32,
}

impl<'a> CriterionTrainer<'a> {
    pub fn new(config: &'a CriterionConfig, corpus: &'a Corpus) -> Self {
        Self {
            config,
            corpus,
            state: TrainingState::Training,
            iteration: 0,
            accuracy: 0.0,
            last_accuracy: 0.0,
            loss: f32::NAN,
        }
    }

    pub fn state(&self) -> TrainingState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Run one iteration: batch, update, schedule, accuracy, transition
    pub fn step<M, R>(&mut self, model: &mut M, rng: &mut R) -> Result<TrainingState>
    where
        M: CriterionModel + ?Sized,
        R: Rng + ?Sized,
    {
        if self.state == TrainingState::Converged {
            return Ok(self.state);
        }

        let batch = model.batch_mode().draw(
            self.corpus.samples(),
            self.config.batch_size,
            self.config.sample_length,
            rng,
        )?;
        self.loss = model.train_step(&batch)?;
        let learning_rate = model.advance_schedule();

        self.last_accuracy = self.accuracy;
        self.accuracy = model.accuracy(self.corpus.samples())?;

        debug!(
            "iteration {}: loss={:.4}, accuracy={:.3}, lr={:.6}",
            self.iteration, self.loss, self.accuracy, learning_rate
        );
        if self.config.log_every > 0 && self.iteration % self.config.log_every == 0 {
            info!(
                "Iteration {}: loss {:.4}, accuracy {:.3}",
                self.iteration, self.loss, self.accuracy
            );
        }

        if self.accuracy >= self.config.threshold && self.last_accuracy >= self.config.threshold {
            self.state = TrainingState::Converged;
        }
        self.iteration += 1;
        Ok(self.state)
    }

    /// Iterate until converged or the optional iteration budget runs out
    pub fn run<M, R>(mut self, model: &mut M, rng: &mut R) -> Result<TrainingReport>
    where
        M: CriterionModel + ?Sized,
        R: Rng + ?Sized,
    {
        anyhow::ensure!(!self.corpus.is_empty(), "Training corpus is empty");
        info!(
            "Training to criterion {} on {} samples ({} mode)",
            self.config.threshold,
            self.corpus.len(),
            model.batch_mode()
        );

        while self.step(model, rng)? == TrainingState::Training {
            if let Some(max) = self.config.max_iterations {
                if self.iteration >= max {
                    warn!(
                        "Stopped after {} iterations without convergence (accuracy {:.3})",
                        self.iteration, self.accuracy
                    );
                    break;
                }
            }
        }

        let converged = self.state == TrainingState::Converged;
        if converged {
            info!(
                "Converged after {} iterations: accuracy {:.3}, previous {:.3}",
                self.iteration, self.accuracy, self.last_accuracy
            );
        }
        Ok(TrainingReport {
            iterations: self.iteration,
            accuracy: self.accuracy,
            last_accuracy: self.last_accuracy,
            loss: self.loss,
            learning_rate: model.learning_rate(),
            converged,
        })
    }
}
