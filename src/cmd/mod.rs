//! Command-line entry points.

use std::time::Duration;

use clap::Args;

use crate::pool::{PoolConfig, default_pool_size};

pub mod extract;
pub mod schema;

/// Options for the OCR worker pool.
#[derive(Debug, Clone, Args)]
pub struct PoolOpts {
    /// Number of OCR workers to run at a time. Defaults to one less than the
    /// number of CPUs.
    #[clap(short = 'j', long = "jobs", default_value_t = default_pool_size())]
    pub job_count: usize,

    /// Tesseract language(s) to recognize, like `eng` or `eng+hin`.
    #[clap(long, default_value = "eng")]
    pub lang: String,

    /// Give up if the OCR workers haven't started after this many seconds.
    #[clap(long)]
    pub init_timeout_secs: Option<u64>,
}

impl PoolOpts {
    /// Convert to a [`PoolConfig`].
    pub fn to_config(&self) -> PoolConfig {
        PoolConfig {
            size: self.job_count,
            lang: self.lang.clone(),
            init_timeout: self.init_timeout_secs.map(Duration::from_secs),
        }
    }
}
