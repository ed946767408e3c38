//! Reference GEMM.

/// `C = alpha * A * B + beta * C`, row-major, A is [M,K], B is [K,N],
/// C is [M,N].
///
/// i-k-j loop order: the inner loop streams one row of B against one row of
/// C, which keeps both accesses unit-stride. `beta` scales C first, so a
/// NaN in C survives `beta = 0` exactly as the generated kernel behaves.
#[allow(clippy::too_many_arguments)]
pub fn gemm(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize, alpha: f32, beta: f32) {
    assert!(a.len() >= m * k, "A has {} elements, need {}", a.len(), m * k);
    assert!(b.len() >= k * n, "B has {} elements, need {}", b.len(), k * n);
    assert!(c.len() >= m * n, "C has {} elements, need {}", c.len(), m * n);
    if n == 0 {
        return;
    }
    for (i, c_row) in c[..m * n].chunks_exact_mut(n).enumerate() {
        for cj in c_row.iter_mut() {
            *cj *= beta;
        }
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            let scaled = alpha * a_ip;
            let b_row = &b[p * n..(p + 1) * n];
            for (cj, &bj) in c_row.iter_mut().zip(b_row) {
                *cj += scaled * bj;
            }
        }
    }
}

/// Fallback with the GEMM-kernel ABI.
///
/// # Safety
/// `a`, `b`, `c` must be valid for `m*k`, `k*n`, `m*n` elements.
#[no_mangle]
#[inline(never)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn scalar_gemm_f32(
    a: *const f32,
    b: *const f32,
    c: *mut f32,
    m: u32,
    n: u32,
    k: u32,
    alpha: f32,
    beta: f32,
) {
    let (m, n, k) = (m as usize, n as usize, k as usize);
    if m == 0 || n == 0 {
        return;
    }
    let a = if k == 0 { &[][..] } else { std::slice::from_raw_parts(a, m * k) };
    let b = if k == 0 { &[][..] } else { std::slice::from_raw_parts(b, k * n) };
    let c = std::slice::from_raw_parts_mut(c, m * n);
    gemm(a, b, c, m, n, k, alpha, beta);
}
