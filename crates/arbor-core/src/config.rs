//! Tree configuration
//!
//! Two knobs matter to the engine: how many versions accumulate between
//! automatic checkpoints (dirty-set memory vs. I/O batching) and how many
//! nodes the pool keeps resident (memory footprint vs. cold reads from the
//! backend).

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    /// Versions between automatic checkpoints triggered by `save_version`
    pub checkpoint_interval: i64,
    /// Soft cap on pool-resident nodes; overflow is tolerated, never fatal
    pub pool_capacity: usize,
}

impl TreeConfig {
    /// Validate all configuration parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.checkpoint_interval < 1 {
            return Err("checkpoint_interval must be >= 1".into());
        }
        if self.pool_capacity == 0 {
            return Err("pool_capacity must be > 0".into());
        }
        Ok(())
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: 1_000,
            pool_capacity: 100_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        assert!(TreeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_rejected() {
        let mut cfg = TreeConfig::default();
        cfg.checkpoint_interval = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TreeConfig::default();
        cfg.pool_capacity = 0;
        assert!(cfg.validate().is_err());
    }
}
