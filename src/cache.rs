//! Per-layer hidden-state cache for a single forward pass

use candle_core::Tensor;

/// Last-position hidden states, one per read-out layer
///
/// Index 0 is the embedding output, index `i` the output of block `i`, and
/// the final entry has the final layer norm applied, so a full pass over an
/// `n`-block model holds `n + 1` tensors of shape `(d_model,)`.
#[derive(Debug)]
pub struct LayerCache {
    hidden_states: Vec<Tensor>,
}

impl LayerCache {
    /// Create an empty cache with capacity for `n_layers + 1` states
    pub fn with_capacity(n_layers: usize) -> Self {
        Self {
            hidden_states: Vec::with_capacity(n_layers + 1),
        }
    }

    /// Add the next layer's hidden state
    pub fn push(&mut self, tensor: Tensor) {
        self.hidden_states.push(tensor);
    }

    /// Hidden state at a read-out layer
    pub fn get_layer(&self, layer: usize) -> Option<&Tensor> {
        self.hidden_states.get(layer)
    }

    /// Number of cached read-out layers
    pub fn n_layers(&self) -> usize {
        self.hidden_states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hidden_states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_push_and_get() {
        let device = Device::Cpu;
        let mut cache = LayerCache::with_capacity(2);
        assert!(cache.is_empty());

        for _ in 0..3 {
            cache.push(Tensor::zeros((16,), DType::F32, &device).unwrap());
        }

        assert_eq!(cache.n_layers(), 3);
        assert!(cache.get_layer(2).is_some());
        assert!(cache.get_layer(3).is_none());
        assert_eq!(cache.get_layer(0).unwrap().dims(), &[16]);
    }
}
