//! Logit lens over a trained reasoning model
//!
//! Projects the hidden state of every read-out layer through the tied
//! decoding head to see what the model would predict at that depth, and
//! reports the two-way `P("1")` the estimator would use there.

use crate::tokenizer::ChainTokenizer;

/// Read-out at a single layer
#[derive(Debug, Clone)]
pub struct LogitLensResult {
    /// Read-out layer (0 = embeddings)
    pub layer: usize,
    /// Top-k token predictions with full-vocabulary probabilities
    pub predictions: Vec<TokenPrediction>,
    /// Two-way softmax over the "0"/"1" logits
    pub binary_probability: f64,
}

/// A single token prediction
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    pub token_id: u32,
    pub token: String,
    pub probability: f32,
}

/// Read-outs for one prompt across all layers
#[derive(Debug)]
pub struct LogitLensAnalysis {
    pub prompt: String,
    pub layer_results: Vec<LogitLensResult>,
}

impl LogitLensAnalysis {
    pub fn new(prompt: String, n_readouts: usize) -> Self {
        Self {
            prompt,
            layer_results: Vec::with_capacity(n_readouts),
        }
    }

    pub fn push(&mut self, result: LogitLensResult) {
        self.layer_results.push(result);
    }

    pub fn print_summary(&self) {
        println!("=== Logit Lens ===");
        println!("Prompt: {}", format_token(&self.prompt));
        for result in &self.layer_results {
            let top = result
                .predictions
                .iter()
                .map(|p| format!("{:>4} {:5.1}%", format!("{:?}", p.token), p.probability * 100.0))
                .collect::<Vec<_>>()
                .join("  ");
            println!(
                "  Layer {:2}: P(1) = {:.3} | {}",
                result.layer, result.binary_probability, top
            );
        }
    }
}

/// Top-k `(token_id, probability)` pairs from a probability vector
pub fn top_k(probs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed
        .into_iter()
        .take(k)
        .map(|(idx, prob)| (idx as u32, prob))
        .collect()
}

/// Decode token IDs to strings using the tokenizer
pub fn decode_predictions(
    predictions: &[(u32, f32)],
    tokenizer: &ChainTokenizer,
) -> Vec<TokenPrediction> {
    predictions
        .iter()
        .map(|&(token_id, probability)| TokenPrediction {
            token_id,
            token: tokenizer.decode(&[token_id]),
            probability,
        })
        .collect()
}

pub fn format_token(token: &str) -> String {
    token.replace('\n', "\\n")
}
