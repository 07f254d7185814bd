//! Scaffolded layer-wise Monte Carlo estimator
//!
//! For each read-out layer and query, walk the chain from the observed
//! variable to the target. Every intermediate variable is sampled from the
//! model's layer read-out. The prompt is then reset to just that sampled
//! `key=value` line, so each step conditions only on its predecessor. The
//! final read-out at the target is used as the rollout's estimate directly
//! (no draw). Rollouts are averaged per query.
//!
//! ```text
//! #\nA=1\nB=      -> P(B=1) = 0.97, draw B=1
//! #\nB=1\nC=      -> P(C=1) = 0.02, draw C=0
//! #\nC=0\nD=      -> P(D=1) is the rollout estimate
//! ```

use std::collections::BTreeMap;

use anyhow::Result;
use rand::Rng;
use tracing::{debug, info};

use crate::chain::{ChainProcess, Query};
use crate::corpus::encode_pair;
use crate::model::SequenceModel;

/// Per-layer estimates, each aligned with the query list
pub type LayerEstimates = BTreeMap<usize, Vec<f64>>;

/// Monte Carlo estimator over scaffolded rollouts
#[derive(Debug, Clone)]
pub struct ScaffoldedEstimator {
    /// Rollouts averaged per query
    pub n_samples: usize,
    /// Prepended to every prompt (`"#\n"` for separator-trained models)
    pub prompt_prefix: String,
}

impl ScaffoldedEstimator {
    pub fn new(n_samples: usize, prompt_prefix: impl Into<String>) -> Self {
        Self {
            n_samples,
            prompt_prefix: prompt_prefix.into(),
        }
    }

    /// Estimate every query at every layer `0..=model.n_layers()`
    pub fn estimate<M, R>(
        &self,
        model: &M,
        chain: &ChainProcess,
        queries: &[Query],
        rng: &mut R,
    ) -> Result<LayerEstimates>
    where
        M: SequenceModel + ?Sized,
        R: Rng + ?Sized,
    {
        anyhow::ensure!(self.n_samples > 0, "n_samples must be positive");

        let scaffolds = queries
            .iter()
            .map(|q| chain.scaffold(&q.observed, &q.target))
            .collect::<Result<Vec<_>, _>>()?;

        let mut estimates = LayerEstimates::new();
        for layer in 0..=model.n_layers() {
            let mut layer_estimates = Vec::with_capacity(queries.len());
            for (query, scaffold) in queries.iter().zip(&scaffolds) {
                let mut total = 0.0;
                for _ in 0..self.n_samples {
                    total += self.rollout(model, query, scaffold, layer, rng)?;
                }
                layer_estimates.push(total / self.n_samples as f64);
            }
            debug!("Layer {layer}: estimated {} queries", layer_estimates.len());
            estimates.insert(layer, layer_estimates);
        }

        info!(
            "Estimated {} queries at {} layers with {} rollouts each",
            queries.len(),
            model.n_layers() + 1,
            self.n_samples
        );
        Ok(estimates)
    }

    /// One walk along `scaffold`, returning the final read-out probability
    fn rollout<M, R>(
        &self,
        model: &M,
        query: &Query,
        scaffold: &[String],
        layer: usize,
        rng: &mut R,
    ) -> Result<f64>
    where
        M: SequenceModel + ?Sized,
        R: Rng + ?Sized,
    {
        let mut context = self.line(&query.observed, query.value);
        for variable in scaffold {
            let p = self.read_out(model, &context, variable, layer)?;
            let value = u8::from(rng.gen::<f64>() < p);
            context = self.line(variable, value);
        }
        self.read_out(model, &context, &query.target, layer)
    }

    fn line(&self, variable: &str, value: u8) -> String {
        format!("{}{}\n", self.prompt_prefix, encode_pair(variable, value))
    }

    fn read_out<M: SequenceModel + ?Sized>(
        &self,
        model: &M,
        context: &str,
        variable: &str,
        layer: usize,
    ) -> Result<f64> {
        let prompt = format!("{context}{variable}=");
        let logits = model.layer_readout(&prompt, layer)?;
        model.binary_probability(&logits)
    }
}
