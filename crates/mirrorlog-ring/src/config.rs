//! Configuration for the submission ring.

use crate::error::RingError;

/// Configuration for a [`WalRing`](crate::WalRing).
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of submission queue entries (power of 2, typically 64-256).
    ///
    /// Each append consumes four entries (a write→fsync chain per file), so
    /// the depth bounds how many appends can be in flight between flushes.
    pub entries: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { entries: 128 }
    }
}

impl RingConfig {
    /// Create a new builder for `RingConfig`.
    #[must_use]
    pub fn builder() -> RingConfigBuilder {
        RingConfigBuilder::default()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), RingError> {
        if !self.entries.is_power_of_two() {
            return Err(RingError::InvalidConfig(format!(
                "entries must be a power of 2, got {}",
                self.entries
            )));
        }

        // One append needs four adjacent slots.
        if self.entries < 4 {
            return Err(RingError::InvalidConfig(
                "entries must be at least 4".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`RingConfig`].
#[derive(Debug, Default)]
pub struct RingConfigBuilder {
    config: RingConfig,
}

impl RingConfigBuilder {
    /// Set the number of submission queue entries.
    #[must_use]
    pub const fn entries(mut self, entries: u32) -> Self {
        self.config.entries = entries;
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> Result<RingConfig, RingError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation (for testing).
    #[must_use]
    pub fn build_unchecked(self) -> RingConfig {
        self.config
    }
}
