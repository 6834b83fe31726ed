//! KV-cache append.
//!
//! The operation is memcpy-equivalent; it exists as a named operator so
//! the `[max_seq_len, num_kv_heads, head_dim]` cache layout stays
//! encapsulated here. Callers (or the model wrapper on their behalf)
//! advance `cache_len` after a successful append.

use crate::dtype::Element;

/// Copies `num_tokens` rows of new keys and values into the caches
/// starting at row `cache_len`. Rows that would extend past the end of
/// the cache are dropped (saturation at the boundary, never a fault).
/// Returns the number of token rows actually appended.
pub fn kv_cache_append<T: Element>(
    key_cache: &mut [T],
    value_cache: &mut [T],
    key: &[T],
    value: &[T],
    cache_len: usize,
    num_tokens: usize,
    num_kv_heads: usize,
    head_dim: usize,
) -> usize {
    let kv_dim = num_kv_heads * head_dim;
    if num_tokens == 0 || kv_dim == 0 {
        return 0;
    }
    assert!(
        key.len() >= num_tokens * kv_dim && value.len() >= num_tokens * kv_dim,
        "kv_cache_append: new rows smaller than [num_tokens, num_kv_heads, head_dim]"
    );
    assert_eq!(
        key_cache.len(),
        value_cache.len(),
        "kv_cache_append: key and value caches differ in size"
    );

    let max_rows = key_cache.len() / kv_dim;
    if cache_len >= max_rows {
        return 0;
    }
    let take = num_tokens.min(max_rows - cache_len);

    let dst = cache_len * kv_dim;
    key_cache[dst..dst + take * kv_dim].copy_from_slice(&key[..take * kv_dim]);
    value_cache[dst..dst + take * kv_dim].copy_from_slice(&value[..take * kv_dim]);
    take
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn test_append_is_bitwise_copy() {
        let kv_dim = 2 * 4;
        let mut key_cache = vec![0.0f32; 8 * kv_dim];
        let mut value_cache = vec![0.0f32; 8 * kv_dim];
        let key: Vec<f32> = (0..3 * kv_dim).map(|i| i as f32 + 0.5).collect();
        let value: Vec<f32> = (0..3 * kv_dim).map(|i| -(i as f32)).collect();

        let appended = kv_cache_append(&mut key_cache, &mut value_cache, &key, &value, 2, 3, 2, 4);
        assert_eq!(appended, 3);
        assert_eq!(&key_cache[2 * kv_dim..5 * kv_dim], &key[..]);
        assert_eq!(&value_cache[2 * kv_dim..5 * kv_dim], &value[..]);
        // Rows outside the appended range stay untouched.
        assert!(key_cache[..2 * kv_dim].iter().all(|&v| v == 0.0));
        assert!(key_cache[5 * kv_dim..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_append_saturates_at_boundary() {
        let kv_dim = 4;
        let mut key_cache = vec![0.0f32; 4 * kv_dim];
        let mut value_cache = vec![0.0f32; 4 * kv_dim];
        let rows: Vec<f32> = (0..3 * kv_dim).map(|i| i as f32).collect();

        // Only one row of space left: the overflow is dropped silently.
        let appended = kv_cache_append(&mut key_cache, &mut value_cache, &rows, &rows, 3, 3, 1, 4);
        assert_eq!(appended, 1);
        assert_eq!(&key_cache[3 * kv_dim..], &rows[..kv_dim]);

        // Full cache: nothing happens.
        let appended = kv_cache_append(&mut key_cache, &mut value_cache, &rows, &rows, 4, 3, 1, 4);
        assert_eq!(appended, 0);
    }

    #[test]
    fn test_append_f16_bitwise() {
        let kv_dim = 4;
        let mut key_cache = vec![f16::from_bits(0); 4 * kv_dim];
        let mut value_cache = vec![f16::from_bits(0); 4 * kv_dim];
        let rows: Vec<f16> = (0..kv_dim).map(|i| f16::from_f32(i as f32 * 0.25)).collect();
        kv_cache_append(&mut key_cache, &mut value_cache, &rows, &rows, 0, 1, 1, 4);
        for j in 0..kv_dim {
            assert_eq!(key_cache[j].to_bits(), rows[j].to_bits());
        }
    }
}
