//! Training corpus compiled from a chain by ancestral sampling
//!
//! For every edge, in both directions, and for both observed values, one
//! sample is drawn from the exact conditional and rendered as two
//! `key=value` lines:
//!
//! ```text
//! A=1
//! B=1
//! ```

use anyhow::Result;
use rand::Rng;

use crate::chain::ChainProcess;

/// Render one observation line, without a trailing newline
pub fn encode_pair(variable: &str, value: u8) -> String {
    format!("{variable}={value}")
}

/// Collection of training strings for one chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Corpus {
    samples: Vec<String>,
}

impl Corpus {
    /// Sample a fresh corpus: `4 × (number of edges)` strings
    pub fn compile<R: Rng + ?Sized>(chain: &ChainProcess, rng: &mut R) -> Result<Self> {
        let mut pairs = Vec::new();
        for (parent, child) in chain.edges() {
            pairs.push((parent, child));
            pairs.push((child, parent));
        }

        let mut samples = Vec::with_capacity(pairs.len() * 2);
        for (observed, query) in pairs {
            for observed_val in 0..=1 {
                let query_val = chain.sample_conditional(observed, observed_val, query, rng)?;
                samples.push(format!(
                    "{}\n{}",
                    encode_pair(observed, observed_val),
                    encode_pair(query, query_val)
                ));
            }
        }

        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<String>) -> Self {
        Self { samples }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }
}
