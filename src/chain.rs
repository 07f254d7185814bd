//! Chain-structured causal process over binary variables
//!
//! A [`ChainProcess`] is a Bayesian network whose DAG is a simple path
//! `v0 -> v1 -> ... -> vk`. Each non-root variable carries a 2x2 conditional
//! table (row = parent value, column = child value), the root carries a
//! marginal prior. Because the graph never branches, the undirected path
//! between two variables is unique, and exact inference reduces to composing
//! the transition matrices along that path:
//!
//! - downstream query: `e_x · T_{o+1} · ... · T_q`
//! - upstream query: Bayes' rule on the marginal of the query variable and the
//!   downstream composition back to the observation
//!
//! Chains are persisted as JSON interchange files ([`ChainProcess::load`],
//! [`ChainProcess::save`]); loading re-runs full validation.

use std::path::Path;

use anyhow::Context;
use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ChainError, ChainResult};

/// Allowed deviation of a table row (or the prior) from summing to one
pub const STOCHASTIC_TOLERANCE: f64 = 1e-9;

/// Characters reserved by the training text format
const RESERVED_CHARS: [char; 2] = ['=', '#'];

/// A 2x2 conditional table `P(child | parent)`, rows indexed by the parent value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConditionalTable(pub [[f64; 2]; 2]);

impl ConditionalTable {
    /// Child copies its parent
    pub const MATCH: Self = Self([[1.0, 0.0], [0.0, 1.0]]);
    /// Child is the complement of its parent
    pub const MISMATCH: Self = Self([[0.0, 1.0], [1.0, 0.0]]);

    pub fn new(rows: [[f64; 2]; 2]) -> Self {
        Self(rows)
    }

    /// Symmetric noisy copy: the child flips the parent with probability `p_flip`
    pub fn noisy(p_flip: f64) -> Self {
        Self([[1.0 - p_flip, p_flip], [p_flip, 1.0 - p_flip]])
    }

    fn matrix(&self) -> Array2<f64> {
        Array2::from_shape_fn((2, 2), |(i, j)| self.0[i][j])
    }

    fn validate(&self, child: &str) -> ChainResult<()> {
        for (parent_val, row) in self.0.iter().enumerate() {
            if row.iter().any(|p| !p.is_finite() || *p < 0.0 || *p > 1.0) {
                return Err(ChainError::Validation(format!(
                    "table for '{child}' has an entry outside [0, 1] in row {parent_val}"
                )));
            }
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > STOCHASTIC_TOLERANCE {
                return Err(ChainError::Validation(format!(
                    "table for '{child}' row {parent_val} sums to {sum}, expected 1"
                )));
            }
        }
        Ok(())
    }
}

/// A conditional query: given `observed = value`, what is `P(target = 1)`?
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    pub observed: String,
    pub value: u8,
    pub target: String,
}

impl Query {
    pub fn new(observed: impl Into<String>, value: u8, target: impl Into<String>) -> Self {
        Self {
            observed: observed.into(),
            value,
            target: target.into(),
        }
    }
}

/// On-disk layout of a chain interchange file
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChainFile {
    variables: Vec<String>,
    prior: [f64; 2],
    tables: Vec<ConditionalTable>,
}

/// Immutable chain-structured process with exact conditional inference
#[derive(Debug, Clone, PartialEq)]
pub struct ChainProcess {
    variables: Vec<String>,
    prior: [f64; 2],
    /// `tables[i]` is the table of `variables[i + 1]` given `variables[i]`
    tables: Vec<ConditionalTable>,
}

impl ChainProcess {
    /// Build a chain with default names (`A`, `B`, ...) and a uniform root prior.
    ///
    /// `tables` holds one table per non-root variable, in chain order.
    pub fn build(tables: Vec<ConditionalTable>) -> ChainResult<Self> {
        let variables = (0..=tables.len()).map(default_variable_name).collect();
        Self::new(variables, [0.5, 0.5], tables)
    }

    /// Build a chain with explicit variable names and root prior
    pub fn new(
        variables: Vec<String>,
        prior: [f64; 2],
        tables: Vec<ConditionalTable>,
    ) -> ChainResult<Self> {
        if variables.is_empty() {
            return Err(ChainError::Validation("chain has no variables".into()));
        }
        if tables.len() + 1 != variables.len() {
            return Err(ChainError::Validation(format!(
                "{} variables need {} conditional tables, got {}",
                variables.len(),
                variables.len() - 1,
                tables.len()
            )));
        }

        for (i, name) in variables.iter().enumerate() {
            if name.is_empty()
                || name
                    .chars()
                    .any(|c| c.is_whitespace() || RESERVED_CHARS.contains(&c))
            {
                return Err(ChainError::Validation(format!(
                    "variable name {name:?} is empty or contains reserved characters"
                )));
            }
            if variables[..i].contains(name) {
                return Err(ChainError::Validation(format!(
                    "duplicate variable name '{name}'"
                )));
            }
        }

        if prior.iter().any(|p| !p.is_finite() || *p < 0.0)
            || (prior[0] + prior[1] - 1.0).abs() > STOCHASTIC_TOLERANCE
        {
            return Err(ChainError::Validation(format!(
                "root prior {prior:?} is not a distribution"
            )));
        }

        for (table, child) in tables.iter().zip(variables.iter().skip(1)) {
            table.validate(child)?;
        }

        let chain = Self {
            variables,
            prior,
            tables,
        };
        // every query conditions on both values of every variable
        for (index, name) in chain.variables.iter().enumerate() {
            let marginal = chain.marginal(index);
            if let Some(value) = (0..2).find(|&v| marginal[v] <= 0.0) {
                return Err(ChainError::Validation(format!(
                    "'{name}'={value} has zero marginal probability"
                )));
            }
        }
        Ok(chain)
    }

    /// Load and validate a chain interchange file
    pub fn load(path: impl AsRef<Path>) -> ChainResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ChainError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file: ChainFile = serde_json::from_str(&content).map_err(|e| ChainError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let chain = Self::new(file.variables, file.prior, file.tables)?;
        info!(
            "Loaded chain with {} variables from {}",
            chain.len(),
            path.display()
        );
        Ok(chain)
    }

    /// Write the chain as a JSON interchange file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, self.to_json()?)
            .with_context(|| format!("Failed to write chain to {}", path.display()))?;
        Ok(())
    }

    /// Serialize to the interchange format
    pub fn to_json(&self) -> anyhow::Result<String> {
        let file = ChainFile {
            variables: self.variables.clone(),
            prior: self.prior,
            tables: self.tables.clone(),
        };
        Ok(serde_json::to_string_pretty(&file)?)
    }

    /// Variable names in chain order
    pub fn variables(&self) -> &[String] {
        &self.variables
    }

    /// Number of variables
    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn prior(&self) -> [f64; 2] {
        self.prior
    }

    pub fn tables(&self) -> &[ConditionalTable] {
        &self.tables
    }

    /// Directed edges `(parent, child)` in chain order
    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.variables
            .windows(2)
            .map(|pair| (pair[0].as_str(), pair[1].as_str()))
    }

    /// Position of a variable along the chain
    pub fn index_of(&self, variable: &str) -> ChainResult<usize> {
        self.variables
            .iter()
            .position(|v| v == variable)
            .ok_or_else(|| ChainError::UnknownVariable(variable.to_string()))
    }

    /// Number of edges on the path between two variables
    pub fn graph_distance(&self, a: &str, b: &str) -> ChainResult<usize> {
        Ok(self.index_of(a)?.abs_diff(self.index_of(b)?))
    }

    /// Variables strictly between `from` and `to`, ordered from `from` toward `to`
    pub fn scaffold(&self, from: &str, to: &str) -> ChainResult<Vec<String>> {
        let i = self.index_of(from)?;
        let j = self.index_of(to)?;
        let path = if i <= j {
            self.variables[(i + 1).min(j)..j].to_vec()
        } else {
            self.variables[j + 1..i].iter().rev().cloned().collect()
        };
        Ok(path)
    }

    /// Every ordered pair of distinct variables crossed with both observed values
    pub fn all_queries(&self) -> Vec<Query> {
        let mut queries = Vec::with_capacity(self.len() * self.len().saturating_sub(1) * 2);
        for observed in &self.variables {
            for target in &self.variables {
                if observed == target {
                    continue;
                }
                for value in 0..=1 {
                    queries.push(Query::new(observed.clone(), value, target.clone()));
                }
            }
        }
        queries
    }

    /// Marginal distribution of the variable at `index`
    fn marginal(&self, index: usize) -> Array1<f64> {
        let prior = Array1::from_vec(self.prior.to_vec());
        prior.dot(&self.transition(0, index))
    }

    /// Composition of the transition matrices on the edges from `from` down to `to`
    fn transition(&self, from: usize, to: usize) -> Array2<f64> {
        self.tables[from..to]
            .iter()
            .fold(Array2::eye(2), |acc, table| acc.dot(&table.matrix()))
    }

    /// Exact `P(query = 1 | observed = value)`
    pub fn exact_conditional(&self, observed: &str, value: u8, query: &str) -> ChainResult<f64> {
        if value > 1 {
            return Err(ChainError::Validation(format!(
                "observed value {value} is not binary"
            )));
        }
        let o = self.index_of(observed)?;
        let q = self.index_of(query)?;
        let x = usize::from(value);

        if o == q {
            return Ok(f64::from(value));
        }

        if q > o {
            return Ok(self.transition(o, q)[[x, 1]]);
        }

        // Upstream: P(q = y | o = x) ∝ P(q = y) · P(o = x | q = y)
        // The evidence is P(o = x), positive for every chain that passed construction.
        let joint = self.marginal(q) * self.transition(q, o).column(x);
        let evidence = joint.sum();
        Ok(joint[1] / evidence)
    }

    /// Draw `query` from its exact conditional given `observed = value`
    pub fn sample_conditional<R: Rng + ?Sized>(
        &self,
        observed: &str,
        value: u8,
        query: &str,
        rng: &mut R,
    ) -> ChainResult<u8> {
        let p = self.exact_conditional(observed, value, query)?;
        Ok(u8::from(rng.gen::<f64>() < p))
    }
}

/// `A`..`Z`, then `V26`, `V27`, ...
fn default_variable_name(index: usize) -> String {
    if index < 26 {
        char::from(b'A' + index as u8).to_string()
    } else {
        format!("V{index}")
    }
}
