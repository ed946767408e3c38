//! Property-based tests for generated kernels and profiler thresholds.
//!
//! Invariants that must hold for all inputs:
//! - compiled GEMM agrees with the reference within relative L2 1e-5
//! - compiled tanh/sigmoid agree within the documented tolerance, ReLU exactly
//! - `threshold_calls - 1` calls never promote; the threshold-th call does
//! - code generation is deterministic

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use neural_jit::compiler::codegen::{generate, math_approx::ACTIVATION_TOLERANCE};
use neural_jit::compiler::code_capacity;
use neural_jit::profiling::NeuralProfiler;
use neural_jit::{
    detect_cpu_features, scalar_ops, CpuFeatures, JitConfig, KernelSignature, NeuralJit, OpKind, ProfilerConfig,
    SignatureState,
};

fn jit_available() -> bool {
    cfg!(all(target_arch = "x86_64", unix)) && detect_cpu_features().has_avx2_fma()
}

/// Compile on the first call.
fn eager_jit() -> NeuralJit {
    NeuralJit::new(JitConfig {
        exec_memory_bytes: 256 * 1024,
        cache_capacity: 16,
        max_compile_failures: 3,
        profiler: ProfilerConfig { threshold_calls: 1, threshold_cycles: 0, bucket_count: 16, ..Default::default() },
    })
    .unwrap()
}

fn seeded(seed: u64, len: usize, lo: f32, hi: f32) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen_range(lo..hi)).collect()
}

fn relative_l2(got: &[f32], want: &[f32]) -> f64 {
    let diff: f64 = got.iter().zip(want).map(|(g, w)| (*g as f64 - *w as f64).powi(2)).sum();
    let norm: f64 = want.iter().map(|w| (*w as f64).powi(2)).sum();
    diff.sqrt() / norm.sqrt().max(1.0)
}

// ═══════════════════════════════════════════════════════════════════════
// 1. GEMM: compiled vs reference
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_gemm_matches_reference(
        m in 1usize..=24,
        n in 1usize..=40,
        k in 1usize..=40,
        alpha in 0.5f32..2.0,
        beta in -1.0f32..1.0,
        seed in any::<u64>(),
    ) {
        prop_assume!(jit_available());
        let a = seeded(seed, m * k, -1.0, 1.0);
        let b = seeded(seed ^ 1, k * n, -1.0, 1.0);
        let c0 = seeded(seed ^ 2, m * n, -1.0, 1.0);

        let mut want = c0.clone();
        scalar_ops::gemm(&a, &b, &mut want, m, n, k, alpha, beta);

        let mut jit = eager_jit();
        let mut got = c0.clone();
        jit.gemm_f32(&a, &b, &mut got, m, n, k, alpha, beta);
        prop_assert_eq!(jit.stats().compiled_calls, 1);

        let err = relative_l2(&got, &want);
        prop_assert!(err < 1e-5, "{}x{}x{}: relative L2 {}", m, n, k, err);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 2. Activations: compiled vs reference
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_activations_match_reference(
        x in prop::collection::vec(-20.0f32..20.0, 1..300),
    ) {
        prop_assume!(jit_available());
        let mut jit = eager_jit();
        let mut got = vec![0.0f32; x.len()];
        let mut want = vec![0.0f32; x.len()];

        jit.tanh_f32(&x, &mut got);
        scalar_ops::tanh(&x, &mut want);
        for (i, (g, w)) in got.iter().zip(&want).enumerate() {
            prop_assert!((g - w).abs() < ACTIVATION_TOLERANCE, "tanh({}) = {} vs {}", x[i], g, w);
        }

        jit.sigmoid_f32(&x, &mut got);
        scalar_ops::sigmoid(&x, &mut want);
        for (i, (g, w)) in got.iter().zip(&want).enumerate() {
            prop_assert!((g - w).abs() < ACTIVATION_TOLERANCE, "sigmoid({}) = {} vs {}", x[i], g, w);
        }

        jit.relu_f32(&x, &mut got);
        scalar_ops::relu(&x, &mut want);
        prop_assert_eq!(&got, &want);

        prop_assert_eq!(jit.stats().compiled_calls, 3);
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 3. Profiler thresholds
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn prop_threshold_minus_one_never_promotes(
        threshold in 1u64..200,
        m in 1u32..64,
        cycles in 0u64..10_000,
    ) {
        let mut profiler = NeuralProfiler::new(ProfilerConfig {
            threshold_calls: threshold,
            threshold_cycles: 0,
            bucket_count: 16,
            ..Default::default()
        });
        let sig = KernelSignature::gemm(m, m, m);
        for _ in 1..threshold {
            prop_assert!(!profiler.record(&sig, cycles));
        }
        prop_assert!(profiler.record(&sig, cycles));
        prop_assert_eq!(profiler.entry(&sig).unwrap().call_count, threshold);
    }

    #[test]
    fn prop_cycle_threshold_gates_promotion(
        calls in 1u64..50,
        per_call in 1u64..1000,
        threshold_cycles in 1u64..100_000,
    ) {
        let mut profiler = NeuralProfiler::new(ProfilerConfig {
            threshold_calls: 1,
            threshold_cycles,
            bucket_count: 16,
            ..Default::default()
        });
        let sig = KernelSignature::activation(OpKind::Tanh, 256);
        let mut promoted_at = None;
        for call in 1..=calls {
            if profiler.record(&sig, per_call) && promoted_at.is_none() {
                promoted_at = Some(call);
            }
        }
        let first = threshold_cycles.div_ceil(per_call);
        if first <= calls {
            prop_assert_eq!(promoted_at, Some(first));
        } else {
            prop_assert_eq!(promoted_at, None);
        }
    }

    /// Through the public API: the threshold-th call changes state.
    #[test]
    fn prop_dispatch_promotes_on_threshold_call(threshold in 1u64..40, count in 1usize..100) {
        let mut jit = NeuralJit::with_cpu_features(
            JitConfig {
                exec_memory_bytes: 64 * 1024,
                profiler: ProfilerConfig { threshold_calls: threshold, threshold_cycles: 0, bucket_count: 16, ..Default::default() },
                ..JitConfig::default()
            },
            CpuFeatures::none(),
        ).unwrap();
        let x = vec![0.5f32; count];
        let mut y = vec![0.0f32; count];
        for _ in 1..threshold {
            jit.relu_f32(&x, &mut y);
        }
        let before = if threshold == 1 { SignatureState::Unprofiled } else { SignatureState::Profiling };
        prop_assert_eq!(jit.state(OpKind::Relu, count as u32, 0, 0), before);
        jit.relu_f32(&x, &mut y);
        prop_assert!(matches!(jit.state(OpKind::Relu, count as u32, 0, 0), SignatureState::PermanentFallback(_)));
        prop_assert!(y.iter().all(|&v| v == 0.5));
    }
}

// ═══════════════════════════════════════════════════════════════════════
// 4. Codegen determinism
// ═══════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn prop_codegen_deterministic(
        op in prop::sample::select(OpKind::ALL.to_vec()),
        m in 1u32..100,
        n in 1u32..100,
        k in 1u32..100,
    ) {
        let sig = if op == OpKind::Gemm {
            KernelSignature::gemm(m, n, k)
        } else {
            KernelSignature::activation(op, m)
        };
        let first = generate(&sig, code_capacity(op)).unwrap();
        let second = generate(&sig, code_capacity(op)).unwrap();
        prop_assert_eq!(first.code, second.code);
    }
}
