//! Test harness for Ashlar.
//!
//! Provides a headless device and image readback for GPU tests.

pub mod harness;

pub use harness::{image_difference, read_image_rgba, HeadlessDevice};

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Error, Debug)]
pub enum TestError {
    #[error("GPU error: {0}")]
    Gpu(#[from] ashlar_gpu::GpuError),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("Unsupported readback format: {0:?}")]
    UnsupportedFormat(ash::vk::Format),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Install a test-writer subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
