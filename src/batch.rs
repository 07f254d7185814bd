//! Training-batch construction
//!
//! Three fixed variants, selected when the model is built:
//!
//! - `single-sample`: the corpus itself is the batch
//! - `batch-no-separator`: `batch_size` strings, each `sample_length` samples
//!   drawn with replacement and joined by newlines, then trimmed by
//!   [`TRUNCATION_CHARS`] at the front or the back (fair coin)
//! - `batch-with-separator`: as above, but every sample is preceded by a
//!   `#` line; prompts at inference time carry the same `#\n` prefix

use std::fmt;

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::tokenizer::SEPARATOR;

/// Characters dropped from one end of a joined batch-no-separator string.
///
/// Assumes single-character variable names, where one `X=v\n` line is four
/// characters; longer names shift the cut inside a line.
pub const TRUNCATION_CHARS: usize = 4;

/// How training strings are assembled from the corpus
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum BatchMode {
    SingleSample,
    BatchNoSeparator,
    #[default]
    BatchWithSeparator,
}

impl BatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SingleSample => "single-sample",
            Self::BatchNoSeparator => "batch-no-separator",
            Self::BatchWithSeparator => "batch-with-separator",
        }
    }

    /// Prefix prepended to prompts at inference time
    pub fn prompt_prefix(self) -> String {
        match self {
            Self::BatchWithSeparator => format!("{SEPARATOR}\n"),
            Self::SingleSample | Self::BatchNoSeparator => String::new(),
        }
    }

    /// Draw one training batch from `corpus`
    pub fn draw<R: Rng + ?Sized>(
        self,
        corpus: &[String],
        batch_size: usize,
        sample_length: usize,
        rng: &mut R,
    ) -> Result<Vec<String>> {
        anyhow::ensure!(!corpus.is_empty(), "Cannot draw a batch from an empty corpus");

        if self == Self::SingleSample {
            return Ok(corpus.to_vec());
        }
        anyhow::ensure!(
            batch_size > 0 && sample_length > 0,
            "batch_size and sample_length must be positive"
        );

        let mut batch = Vec::with_capacity(batch_size);
        for _ in 0..batch_size {
            let group: Vec<&str> = (0..sample_length)
                .filter_map(|_| corpus.choose(rng).map(String::as_str))
                .collect();

            let joined = match self {
                Self::BatchNoSeparator => truncate_one_end(&group.join("\n"), rng),
                _ => {
                    let sep = format!("\n{SEPARATOR}\n");
                    format!("{SEPARATOR}\n{}", group.join(&sep))
                }
            };
            batch.push(joined);
        }
        Ok(batch)
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drop [`TRUNCATION_CHARS`] characters from the front or the back
fn truncate_one_end<R: Rng + ?Sized>(s: &str, rng: &mut R) -> String {
    if rng.gen::<f64>() <= 0.5 {
        s.chars().skip(TRUNCATION_CHARS).collect()
    } else {
        let keep = s.chars().count().saturating_sub(TRUNCATION_CHARS);
        s.chars().take(keep).collect()
    }
}
