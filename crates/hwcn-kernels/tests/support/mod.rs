//! Shared helpers for hwcn-kernels integration tests

pub mod naive;

pub use naive::{ConvDims, assert_close, pattern};
