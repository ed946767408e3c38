//! Portable reference kernels: the fallback path and the correctness oracle.
//!
//! Each operation comes in two forms:
//! 1. a safe slice function (`gemm`, `tanh`, ...) used by tests and benches;
//! 2. an `extern "C"` entry point with exactly the ABI of the generated
//!    kernel for the same op, so dispatch can call a compiled kernel and
//!    its fallback through the same function-pointer type.

pub mod activations;
pub mod blas;

pub use activations::{relu, scalar_relu_f32, scalar_sigmoid_f32, scalar_tanh_f32, sigmoid, tanh};
pub use blas::{gemm, scalar_gemm_f32};
