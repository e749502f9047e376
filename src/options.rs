use std::convert::TryFrom;

/// Per-server tunables. All fields are optional; unset fields fall back to
/// production defaults during validation.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Log entries above this count trigger a full append request instead of
    /// an incremental one.
    pub append_request_threshold: Option<u64>,
    /// Submitting entries is throttled once the in-memory log grows past
    /// this many entries.
    pub max_log_size: Option<u64>,
    /// A local snapshot is taken once this many entries were applied past
    /// the previous snapshot.
    pub snapshot_threshold: Option<u64>,
    /// How many log entries to keep behind a locally taken snapshot.
    pub snapshot_trailing: Option<u64>,
    pub enable_prevoting: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
#[error("invalid server options: {0}")]
pub struct ConfigError(pub &'static str);

#[derive(Debug)]
pub(crate) struct ValidatedOptions {
    pub append_request_threshold: u64,
    pub max_log_size: u64,
    pub snapshot_threshold: u64,
    pub snapshot_trailing: u64,
    pub enable_prevoting: bool,
}

impl ValidatedOptions {
    fn validate(&self) -> Result<(), &'static str> {
        if self.snapshot_threshold >= self.max_log_size {
            return Err("snapshot_threshold has to be smaller than max_log_size");
        }
        if self.max_log_size == 0 {
            return Err("max_log_size must be positive");
        }

        Ok(())
    }
}

impl TryFrom<ServerOptions> for ValidatedOptions {
    type Error = ConfigError;

    fn try_from(options: ServerOptions) -> Result<Self, Self::Error> {
        let values = ValidatedOptions {
            append_request_threshold: options.append_request_threshold.unwrap_or(1024),
            max_log_size: options.max_log_size.unwrap_or(4096),
            snapshot_threshold: options.snapshot_threshold.unwrap_or(1024),
            snapshot_trailing: options.snapshot_trailing.unwrap_or(200),
            enable_prevoting: options.enable_prevoting.unwrap_or(true),
        };

        values.validate().map_err(ConfigError)?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = ValidatedOptions::try_from(ServerOptions::default()).unwrap();

        assert_eq!(validated.max_log_size, 4096);
        assert!(validated.snapshot_threshold < validated.max_log_size);
        assert!(validated.enable_prevoting);
    }

    #[test]
    fn snapshot_threshold_must_be_below_max_log_size() {
        let options = ServerOptions {
            max_log_size: Some(100),
            snapshot_threshold: Some(100),
            ..Default::default()
        };

        ValidatedOptions::try_from(options).unwrap_err();
    }

    #[test]
    fn explicit_values_are_kept() {
        let options = ServerOptions {
            append_request_threshold: Some(10),
            max_log_size: Some(50),
            snapshot_threshold: Some(20),
            snapshot_trailing: Some(5),
            enable_prevoting: Some(false),
        };

        let validated = ValidatedOptions::try_from(options).unwrap();
        assert_eq!(validated.append_request_threshold, 10);
        assert_eq!(validated.max_log_size, 50);
        assert_eq!(validated.snapshot_threshold, 20);
        assert_eq!(validated.snapshot_trailing, 5);
        assert!(!validated.enable_prevoting);
    }
}
