//! Evaluation harness: exact conditionals against per-layer estimates
//!
//! One row per query (ordered pair of distinct variables × observed value).
//! Written as CSV with columns
//! `observed_var,observed_val,query_var,distance,true_prob,markovian_scaff_gen_layer_{i}...`.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use tracing::info;

use crate::chain::ChainProcess;
use crate::estimator::ScaffoldedEstimator;
use crate::model::SequenceModel;

const FIXED_COLUMNS: [&str; 5] = [
    "observed_var",
    "observed_val",
    "query_var",
    "distance",
    "true_prob",
];

/// Column name for the estimate read out at `layer`
pub fn layer_column(layer: usize) -> String {
    format!("markovian_scaff_gen_layer_{layer}")
}

/// One evaluated query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRow {
    pub observed_var: String,
    pub observed_val: u8,
    pub query_var: String,
    pub distance: usize,
    pub true_prob: f64,
    /// Estimate per read-out layer, index = layer
    pub layer_estimates: Vec<f64>,
}

/// Comparison table for one chain and model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationTable {
    pub n_layers: usize,
    pub rows: Vec<EvaluationRow>,
}

impl EvaluationTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn columns(&self) -> Vec<String> {
        FIXED_COLUMNS
            .iter()
            .map(ToString::to_string)
            .chain((0..=self.n_layers).map(layer_column))
            .collect()
    }

    /// Mean absolute error between exact and estimated probabilities per layer
    pub fn mean_absolute_error(&self) -> Vec<f64> {
        if self.rows.is_empty() {
            return vec![0.0; self.n_layers + 1];
        }
        (0..=self.n_layers)
            .map(|layer| {
                let total: f64 = self
                    .rows
                    .iter()
                    .map(|r| (r.true_prob - r.layer_estimates[layer]).abs())
                    .sum();
                total / self.rows.len() as f64
            })
            .collect()
    }

    pub fn to_csv(&self) -> String {
        let mut out = self.columns().join(",");
        out.push('\n');
        for row in &self.rows {
            let _ = write!(
                out,
                "{},{},{},{},{}",
                csv_field(&row.observed_var),
                row.observed_val,
                csv_field(&row.query_var),
                row.distance,
                row.true_prob
            );
            for estimate in &row.layer_estimates {
                let _ = write!(out, ",{estimate}");
            }
            out.push('\n');
        }
        out
    }

    pub fn write_csv(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_csv())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} rows to {}", self.rows.len(), path.display());
        Ok(())
    }
}

/// Quote a field if it contains a delimiter, quote or newline
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Evaluate every query of `chain` against `model`
///
/// The estimator runs once over the full query list.
pub fn run_evaluation<M, R>(
    model: &M,
    chain: &ChainProcess,
    estimator: &ScaffoldedEstimator,
    rng: &mut R,
) -> Result<EvaluationTable>
where
    M: SequenceModel + ?Sized,
    R: Rng + ?Sized,
{
    let queries = chain.all_queries();
    info!(
        "Evaluating {} queries over {} variables",
        queries.len(),
        chain.len()
    );

    let mut rows = Vec::with_capacity(queries.len());
    for query in &queries {
        rows.push(EvaluationRow {
            observed_var: query.observed.clone(),
            observed_val: query.value,
            query_var: query.target.clone(),
            distance: chain.graph_distance(&query.observed, &query.target)?,
            true_prob: chain.exact_conditional(&query.observed, query.value, &query.target)?,
            layer_estimates: Vec::with_capacity(model.n_layers() + 1),
        });
    }

    let estimates = estimator.estimate(model, chain, &queries, rng)?;
    for per_query in estimates.values() {
        for (row, &estimate) in rows.iter_mut().zip(per_query) {
            row.layer_estimates.push(estimate);
        }
    }

    let table = EvaluationTable {
        n_layers: model.n_layers(),
        rows,
    };
    for (layer, mae) in table.mean_absolute_error().iter().enumerate() {
        info!("Layer {layer}: mean absolute error {mae:.4}");
    }
    Ok(table)
}
