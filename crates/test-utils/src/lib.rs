//! Shared test utilities for the era5-prep workspace.
//!
//! This crate provides common testing infrastructure including:
//! - Temporary observation and cache directories
//! - Stamped observation file fixtures
//! - Cache tree listing for "nothing was written" assertions
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
//! use test_utils::{fixtures, TestDirs};
//! ```

pub mod fixtures;
pub mod paths;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use paths::*;

/// Assert that a path exists on disk.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_present;
///
/// assert_present!(cache.join("model-levels/20191105-2130-ml-int.nc"));
/// ```
#[macro_export]
macro_rules! assert_present {
    ($path:expr) => {{
        let owned = $path;
        let path: &std::path::Path = owned.as_ref();
        if !path.exists() {
            panic!("assertion failed: expected `{}` to exist", path.display());
        }
    }};
}

/// Assert that a path does not exist on disk.
#[macro_export]
macro_rules! assert_absent {
    ($path:expr) => {{
        let owned = $path;
        let path: &std::path::Path = owned.as_ref();
        if path.exists() {
            panic!("assertion failed: expected `{}` to be absent", path.display());
        }
    }};
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
