//! CPU feature detection.
//!
//! Queries instruction-set support once per process and hands out copies.
//! The JIT context keeps its own copy so tests can narrow it (e.g. pretend
//! AVX2 is missing) without touching the real hardware answer.

use std::fmt;
use std::sync::OnceLock;

/// ISA flags relevant to kernel selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct CpuFeatures {
    pub sse2: bool,
    pub sse3: bool,
    pub ssse3: bool,
    pub sse41: bool,
    pub sse42: bool,
    pub avx: bool,
    pub avx2: bool,
    pub fma: bool,
    pub avx512f: bool,
}

impl CpuFeatures {
    /// No SIMD support at all: every kernel takes the fallback path.
    pub fn none() -> Self {
        Self::default()
    }

    /// Detect the features of the current machine (cached).
    pub fn detect() -> Self {
        detect_features()
    }

    /// Copy with AVX2 (and everything layered on it) switched off.
    pub fn without_avx2(mut self) -> Self {
        self.avx2 = false;
        self.avx512f = false;
        self
    }

    /// Copy with FMA3 switched off.
    pub fn without_fma(mut self) -> Self {
        self.fma = false;
        self
    }

    /// AVX2 + FMA3: the baseline every generated kernel assumes.
    #[inline]
    pub fn has_avx2_fma(&self) -> bool {
        self.avx && self.avx2 && self.fma
    }
}

impl fmt::Display for CpuFeatures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut feats = Vec::new();
        if self.sse2 {
            feats.push("SSE2");
        }
        if self.sse3 {
            feats.push("SSE3");
        }
        if self.ssse3 {
            feats.push("SSSE3");
        }
        if self.sse41 {
            feats.push("SSE4.1");
        }
        if self.sse42 {
            feats.push("SSE4.2");
        }
        if self.avx {
            feats.push("AVX");
        }
        if self.avx2 {
            feats.push("AVX2");
        }
        if self.fma {
            feats.push("FMA");
        }
        if self.avx512f {
            feats.push("AVX-512");
        }
        if feats.is_empty() {
            feats.push("Scalar");
        }
        write!(f, "{}", feats.join("+"))
    }
}

static FEATURES: OnceLock<CpuFeatures> = OnceLock::new();

/// Instruction-set support of the host, detected on first use.
///
/// Cannot fail: on other architectures every flag reads false.
pub fn detect_features() -> CpuFeatures {
    *FEATURES.get_or_init(probe)
}

fn probe() -> CpuFeatures {
    #[cfg(target_arch = "x86_64")]
    {
        let feats = CpuFeatures {
            sse2: is_x86_feature_detected!("sse2"),
            sse3: is_x86_feature_detected!("sse3"),
            ssse3: is_x86_feature_detected!("ssse3"),
            sse41: is_x86_feature_detected!("sse4.1"),
            sse42: is_x86_feature_detected!("sse4.2"),
            avx: is_x86_feature_detected!("avx"),
            avx2: is_x86_feature_detected!("avx2"),
            fma: is_x86_feature_detected!("fma"),
            avx512f: is_x86_feature_detected!("avx512f"),
        };
        log::debug!("detected CPU features: {feats}");
        return feats;
    }
    #[allow(unreachable_code)]
    CpuFeatures::none()
}
