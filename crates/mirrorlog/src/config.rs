//! WAL configuration.

use mirrorlog_ring::RingConfig;

use crate::error::WalError;

/// Configuration for a [`MirrorWal`](crate::MirrorWal).
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Submission ring queue depth (power of 2, typically 64-256).
    pub ring_entries: u32,
    /// Open the log files with `O_DIRECT` when the filesystem accepts it.
    ///
    /// Writes then bypass the page cache entirely and verification reads
    /// are served from the device. Filesystems that reject the flag fall
    /// back to `O_DSYNC` alone.
    pub direct_io: bool,
    /// Read every record back after both fsyncs complete and require a
    /// checksum match before the append is reported durable. Off by
    /// default; doubles the I/O per append.
    pub verify_on_flush: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            ring_entries: 128,
            direct_io: true,
            verify_on_flush: false,
        }
    }
}

impl WalConfig {
    /// Create a new builder for `WalConfig`.
    #[must_use]
    pub fn builder() -> WalConfigBuilder {
        WalConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the ring depth is invalid.
    pub fn validate(&self) -> Result<(), WalError> {
        self.ring_config().validate()?;
        Ok(())
    }

    pub(crate) fn ring_config(&self) -> RingConfig {
        RingConfig::builder().entries(self.ring_entries).build_unchecked()
    }
}

/// Builder for [`WalConfig`].
#[derive(Debug, Default)]
pub struct WalConfigBuilder {
    config: WalConfig,
}

impl WalConfigBuilder {
    /// Set the submission ring queue depth.
    #[must_use]
    pub const fn ring_entries(mut self, entries: u32) -> Self {
        self.config.ring_entries = entries;
        self
    }

    /// Enable or disable `O_DIRECT`.
    #[must_use]
    pub const fn direct_io(mut self, enabled: bool) -> Self {
        self.config.direct_io = enabled;
        self
    }

    /// Enable or disable post-fsync verification reads.
    #[must_use]
    pub const fn verify_on_flush(mut self, enabled: bool) -> Self {
        self.config.verify_on_flush = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<WalConfig, WalError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation (for testing).
    #[must_use]
    pub fn build_unchecked(self) -> WalConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WalConfig::default();
        assert_eq!(config.ring_entries, 128);
        assert!(config.direct_io);
        assert!(!config.verify_on_flush);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WalConfig::builder()
            .ring_entries(64)
            .direct_io(false)
            .verify_on_flush(true)
            .build()
            .unwrap();

        assert_eq!(config.ring_entries, 64);
        assert!(!config.direct_io);
        assert!(config.verify_on_flush);
    }

    #[test]
    fn test_invalid_ring_depth_rejected() {
        let result = WalConfig::builder().ring_entries(100).build();
        assert!(result.is_err());
    }
}
