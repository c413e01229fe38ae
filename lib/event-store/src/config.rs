use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use snafu::Snafu;

use crate::block::Compression;

/// Uncompressed bytes a block may accumulate before it is sealed. 256KB
/// aligns with the I/O size exposed by major cloud providers.
pub const DEFAULT_BLOCK_SIZE_LIMIT: usize = 256 * 1024;

/// How long hour files are kept on disk before the retention sweep deletes
/// them.
pub const DEFAULT_RETENTION_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How often the retention sweep runs.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Snafu)]
pub enum BuildError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Storage engine configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory where hour files are written.
    pub(crate) data_dir: PathBuf,

    /// Uncompressed size at which a block is sealed.
    pub(crate) block_size_limit: usize,

    /// Compression applied to sealed blocks.
    pub(crate) compression: Compression,

    /// Whether the index checksum is computed and verified.
    pub(crate) checksums: bool,

    /// Age past which whole hour files are deleted.
    pub(crate) retention_window: Duration,

    /// Interval between retention sweeps.
    pub(crate) sweep_interval: Duration,
}

impl StoreConfig {
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Builder for [`StoreConfig`].
#[derive(Clone, Debug)]
pub struct StoreConfigBuilder {
    data_dir: PathBuf,
    block_size_limit: Option<usize>,
    compression: Option<Compression>,
    checksums: Option<bool>,
    retention_window: Option<Duration>,
    sweep_interval: Option<Duration>,
}

impl StoreConfigBuilder {
    pub fn from_path<P>(data_dir: P) -> StoreConfigBuilder
    where
        P: AsRef<Path>,
    {
        StoreConfigBuilder {
            data_dir: data_dir.as_ref().to_path_buf(),
            block_size_limit: None,
            compression: None,
            checksums: None,
            retention_window: None,
            sweep_interval: None,
        }
    }

    /// Sets the uncompressed size at which a block is sealed.
    ///
    /// Defaults to 256KB.
    pub fn block_size_limit(mut self, limit: usize) -> Self {
        self.block_size_limit = Some(limit);
        self
    }

    /// Sets the compression applied to sealed blocks.
    ///
    /// Defaults to gzip.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Enables or disables the index checksum.
    ///
    /// Defaults to enabled.
    pub fn checksums(mut self, enabled: bool) -> Self {
        self.checksums = Some(enabled);
        self
    }

    /// Sets the age past which whole hour files are deleted.
    ///
    /// Defaults to 7 days.
    pub fn retention_window(mut self, window: Duration) -> Self {
        self.retention_window = Some(window);
        self
    }

    /// Sets the interval between retention sweeps.
    ///
    /// Defaults to 1 hour.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Consumes this builder and constructs a `StoreConfig`.
    pub fn build(self) -> Result<StoreConfig, BuildError> {
        let block_size_limit = self.block_size_limit.unwrap_or(DEFAULT_BLOCK_SIZE_LIMIT);
        if block_size_limit == 0 {
            return Err(BuildError::InvalidParameter {
                param_name: "block_size_limit",
                reason: "cannot be zero".to_string(),
            });
        }

        let block_size_limit_max = i32::MAX as usize;
        if block_size_limit > block_size_limit_max {
            return Err(BuildError::InvalidParameter {
                param_name: "block_size_limit",
                reason: format!("cannot exceed {block_size_limit_max} bytes"),
            });
        }

        let retention_window = self.retention_window.unwrap_or(DEFAULT_RETENTION_WINDOW);
        if retention_window.is_zero() {
            return Err(BuildError::InvalidParameter {
                param_name: "retention_window",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(StoreConfig {
            data_dir: self.data_dir,
            block_size_limit,
            compression: self.compression.unwrap_or(Compression::Gzip),
            checksums: self.checksums.unwrap_or(true),
            retention_window,
            sweep_interval: self.sweep_interval.unwrap_or(DEFAULT_SWEEP_INTERVAL),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let config = StoreConfigBuilder::from_path("/tmp/spectre").build().unwrap();
        assert_eq!(config.block_size_limit, DEFAULT_BLOCK_SIZE_LIMIT);
        assert_eq!(config.compression, Compression::Gzip);
        assert!(config.checksums);
        assert_eq!(config.retention_window, DEFAULT_RETENTION_WINDOW);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let result = StoreConfigBuilder::from_path("/tmp/spectre")
            .block_size_limit(0)
            .build();
        assert!(matches!(result, Err(BuildError::InvalidParameter { .. })));
    }
}
