/// Per-layer key/value history.
///
/// `key` and `value` are `[max_seq_len, num_kv_heads * head_dim]` f32
/// buffers; `len` counts the valid prefix rows. The cache is append-only
/// within a generation and reset (not rewound) between prompts.
#[derive(Debug)]
pub struct LayerKvCache {
    pub key: Vec<f32>,
    pub value: Vec<f32>,
    pub len: usize,
}

impl LayerKvCache {
    fn new(max_seq_len: usize, kv_dim: usize) -> Self {
        LayerKvCache {
            key: vec![0.0; max_seq_len * kv_dim],
            value: vec![0.0; max_seq_len * kv_dim],
            len: 0,
        }
    }
}

/// KV caches for every layer, allocated once at model load.
#[derive(Debug)]
pub struct KvCache {
    pub layers: Vec<LayerKvCache>,
}

impl KvCache {
    pub fn new(num_layers: usize, max_seq_len: usize, kv_dim: usize) -> Self {
        KvCache {
            layers: (0..num_layers)
                .map(|_| LayerKvCache::new(max_seq_len, kv_dim))
                .collect(),
        }
    }

    /// Clears the valid prefix of every layer. Cache contents are not
    /// zeroed; rows past `len` are never read.
    pub fn reset(&mut self) {
        for layer in &mut self.layers {
            layer.len = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_cache_empty() {
        let cache = KvCache::new(3, 16, 8);
        assert_eq!(cache.layers.len(), 3);
        for layer in &cache.layers {
            assert_eq!(layer.len, 0);
            assert_eq!(layer.key.len(), 16 * 8);
            assert_eq!(layer.value.len(), 16 * 8);
        }
    }

    #[test]
    fn test_reset_clears_lengths_only() {
        let mut cache = KvCache::new(2, 4, 4);
        cache.layers[0].len = 3;
        cache.layers[0].key[0] = 1.5;
        cache.layers[1].len = 2;
        cache.reset();
        assert_eq!(cache.layers[0].len, 0);
        assert_eq!(cache.layers[1].len, 0);
        assert_eq!(cache.layers[0].key[0], 1.5);
    }
}
