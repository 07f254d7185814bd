//! Static hyperparameter grid and the canonical chains it runs over

use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::info;

use crate::batch::BatchMode;
use crate::chain::{ChainProcess, ConditionalTable};

pub const SWEEP_SEEDS: std::ops::RangeInclusive<u64> = 2024..=2028;
pub const SWEEP_EMBEDDING: usize = 256;
pub const CRITERION_SUFFIX: &str = "_criterion";

/// The four five-variable chains A-B-C-D-E
pub fn canonical_chains() -> Result<Vec<ChainProcess>> {
    use ConditionalTable as T;
    let layouts = [
        [T::MATCH, T::MATCH, T::MISMATCH, T::MATCH],
        [T::MATCH, T::MISMATCH, T::MATCH, T::MATCH],
        [T::MISMATCH, T::MATCH, T::MISMATCH, T::MATCH],
        [T::MATCH, T::MISMATCH, T::MATCH, T::MISMATCH],
    ];
    layouts
        .into_iter()
        .map(|tables| Ok(ChainProcess::build(tables.to_vec())?))
        .collect()
}

pub fn chain_path(data_root: &Path, index: usize) -> PathBuf {
    data_root.join("chains").join(format!("chain_{index}.json"))
}

/// Write every canonical chain under `<data_root>/chains/`
pub fn define_chains(data_root: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (i, chain) in canonical_chains()?.iter().enumerate() {
        let path = chain_path(data_root, i);
        chain.save(&path)?;
        written.push(path);
    }
    info!("Wrote {} chains under {}", written.len(), data_root.display());
    Ok(written)
}

/// One training/evaluation configuration of the sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepEntry {
    pub chain_index: usize,
    pub seed: u64,
    pub batch_mode: BatchMode,
}

impl SweepEntry {
    /// Name used for the training run
    pub fn model_name(&self) -> String {
        format!(
            "embd-{SWEEP_EMBEDDING}_chain-{}_dataset-{}_seed-{}",
            self.chain_index, self.batch_mode, self.seed
        )
    }
}

/// Seeds outer, chains inner
pub fn grid() -> Vec<SweepEntry> {
    SWEEP_SEEDS
        .flat_map(|seed| {
            (0..4).map(move |chain_index| SweepEntry {
                chain_index,
                seed,
                batch_mode: BatchMode::BatchWithSeparator,
            })
        })
        .collect()
}

pub fn select(index: usize) -> Result<SweepEntry> {
    let entries = grid();
    let n = entries.len();
    entries
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Sweep index {index} out of range (grid has {n} entries)"))
}
