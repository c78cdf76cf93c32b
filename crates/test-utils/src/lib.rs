//! Shared test utilities for the cloud-retrieval workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Synthetic retrieval input generators
//! - A deterministic predictor and an in-memory input reader
//! - Approximate-equality assertions
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{gradient_raster, ScriptedPredictor};
//! ```
//!
//! `tiled-inference` itself depends on this crate for its integration tests
//! only; its inline unit tests must not use these fixtures, since they would
//! see a different copy of the library types.

pub mod fixtures;
pub mod generators;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;

/// Creates a temporary directory for test output.
///
/// The directory is automatically cleaned up when the returned `TempDir` is dropped.
pub fn temp_test_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("Failed to create temporary test directory")
}

/// Macro for approximate floating-point equality assertions.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_approx_eq;
///
/// assert_approx_eq!(1.0001_f64, 1.0_f64, 0.001_f64); // passes
/// assert_approx_eq!(1.1_f32, 1.0_f32, 0.001_f32);    // fails
/// ```
#[macro_export]
macro_rules! assert_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left: f64 = $left as f64;
        let right: f64 = $right as f64;
        let epsilon: f64 = $epsilon as f64;
        let diff = (left - right).abs();
        if diff > epsilon {
            panic!(
                "assertion failed: `(left ≈ right)`\n  left: `{:?}`,\n right: `{:?}`,\n  diff: `{:?}` > epsilon `{:?}`",
                left, right, diff, epsilon
            );
        }
    }};
}

/// Asserts that two float arrays have the same shape and agree element-wise,
/// treating NaN as equal to NaN.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_arrays_approx_eq;
///
/// assert_arrays_approx_eq!(assembled, expected, 1e-6);
/// ```
#[macro_export]
macro_rules! assert_arrays_approx_eq {
    ($left:expr, $right:expr, $epsilon:expr) => {{
        let left = &$left;
        let right = &$right;
        assert_eq!(left.shape(), right.shape(), "array shapes differ");
        for ((index, l), r) in left.indexed_iter().zip(right.iter()) {
            let (l, r) = (*l as f64, *r as f64);
            if l.is_nan() || r.is_nan() {
                if !(l.is_nan() && r.is_nan()) {
                    panic!("NaN mismatch at {:?}: left `{:?}`, right `{:?}`", index, l, r);
                }
                continue;
            }
            let diff = (l - r).abs();
            if diff > $epsilon as f64 {
                panic!(
                    "arrays differ at {:?}: left `{:?}`, right `{:?}`, diff `{:?}`",
                    index, l, r, diff
                );
            }
        }
    }};
}
