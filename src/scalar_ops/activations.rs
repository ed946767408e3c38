//! Scalar elementwise activations.

/// `out[i] = tanh(x[i])`
pub fn tanh(x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x) {
        *o = v.tanh();
    }
}

/// `out[i] = 1 / (1 + exp(-x[i]))`
pub fn sigmoid(x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x) {
        *o = 1.0 / (1.0 + (-v).exp());
    }
}

/// `out[i] = max(0, x[i])`; NaN maps to 0.
pub fn relu(x: &[f32], out: &mut [f32]) {
    for (o, &v) in out.iter_mut().zip(x) {
        *o = if v > 0.0 { v } else { 0.0 };
    }
}

macro_rules! activation_entry {
    ($(#[$doc:meta])* $name:ident => $f:path) => {
        $(#[$doc])*
        ///
        /// # Safety
        /// `x` and `out` must be valid for `n` reads/writes respectively.
        #[no_mangle]
        pub unsafe extern "C" fn $name(x: *const f32, out: *mut f32, n: u32) {
            let n = n as usize;
            if n == 0 {
                return;
            }
            let x = std::slice::from_raw_parts(x, n);
            let out = std::slice::from_raw_parts_mut(out, n);
            $f(x, out)
        }
    };
}

activation_entry!(
    /// Fallback with the activation-kernel ABI.
    scalar_tanh_f32 => tanh
);
activation_entry!(
    /// Fallback with the activation-kernel ABI.
    scalar_sigmoid_f32 => sigmoid
);
activation_entry!(
    /// Fallback with the activation-kernel ABI.
    scalar_relu_f32 => relu
);

#[cfg(test)]
mod tests {
    use super::*;

    fn run_scalar(f: unsafe extern "C" fn(*const f32, *mut f32, u32), input: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0_f32; input.len()];
        unsafe { f(input.as_ptr(), out.as_mut_ptr(), input.len() as u32) };
        out
    }

    #[test]
    fn test_scalar_ops_tanh() {
        let out = run_scalar(scalar_tanh_f32, &[-20.0, -1.0, 0.0, 1.0, 20.0]);
        assert_eq!(out[2], 0.0);
        assert!((out[3] - 0.761_594_2).abs() < 1e-6);
        assert_eq!(out[0], -1.0);
        assert_eq!(out[4], 1.0);
    }

    #[test]
    fn test_scalar_ops_sigmoid() {
        let out = run_scalar(scalar_sigmoid_f32, &[-100.0, 0.0, 2.0, 100.0]);
        assert!(out[0] < 1e-30);
        assert_eq!(out[1], 0.5);
        assert!((out[2] - 0.880_797).abs() < 1e-6);
        assert_eq!(out[3], 1.0);
    }

    #[test]
    fn test_scalar_ops_relu() {
        let out = run_scalar(scalar_relu_f32, &[-2.0, 0.0, 3.5, f32::NAN]);
        assert_eq!(out, vec![0.0, 0.0, 3.5, 0.0]);
    }

    #[test]
    fn test_zero_count_is_noop() {
        unsafe { scalar_tanh_f32(std::ptr::null(), std::ptr::null_mut(), 0) };
    }

    #[test]
    fn test_slice_forms_match_entries() {
        let x: Vec<f32> = (-8..8).map(|i| i as f32 * 0.37).collect();
        let mut a = vec![0.0; x.len()];
        sigmoid(&x, &mut a);
        assert_eq!(a, run_scalar(scalar_sigmoid_f32, &x));
    }
}
