use std::sync::OnceLock;

/// Runtime CPU capability record. Constant for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuCaps {
    /// ARM NEON 128-bit SIMD (always true on aarch64).
    pub has_neon: bool,
    /// Apple matrix coprocessor (aarch64 macOS).
    pub has_amx: bool,
    /// AVX2 + FMA (`x86_64` only, detected at runtime).
    pub has_avx2: bool,
    /// AVX-512F (`x86_64` only, detected at runtime).
    pub has_avx512: bool,
}

static CAPS: OnceLock<CpuCaps> = OnceLock::new();

fn detect() -> CpuCaps {
    #[allow(unused_mut)]
    let mut caps = CpuCaps {
        has_neon: false,
        has_amx: false,
        has_avx2: false,
        has_avx512: false,
    };

    #[cfg(target_arch = "aarch64")]
    {
        caps.has_neon = true;
        #[cfg(target_os = "macos")]
        {
            caps.has_amx = true;
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        caps.has_avx2 = is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma");
        caps.has_avx512 = is_x86_feature_detected!("avx512f");
    }

    caps
}

/// Returns the cached capability record, probing once on first use.
///
/// A missing capability is never an error: every operator keeps a scalar
/// reference path that is correct on any target, so dispatch only ever
/// selects between equivalent implementations.
#[inline]
pub fn caps() -> CpuCaps {
    *CAPS.get_or_init(detect)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caps_stable_across_calls() {
        assert_eq!(caps(), caps());
    }

    #[test]
    #[cfg(target_arch = "aarch64")]
    fn test_neon_on_aarch64() {
        assert!(caps().has_neon);
    }

    #[test]
    #[cfg(not(target_arch = "aarch64"))]
    fn test_no_neon_off_aarch64() {
        assert!(!caps().has_neon);
        assert!(!caps().has_amx);
    }
}
