//! Session cipher limits.

/// Bounds applied by the session cipher.
///
/// All limits cap memory a peer can force us to hold; none of them affect
/// the wire format, so both parties may use different values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Largest forward jump in one receiving chain a single message may cause.
    pub max_skip: u32,

    /// Cached skipped message keys kept per receiving chain; oldest evicted.
    pub max_cached_message_keys: usize,

    /// Receiving chains retained per session; oldest dropped.
    pub max_receiver_chains: usize,

    /// Superseded session states kept per address.
    pub max_archived_states: usize,
}

impl SessionConfig {
    pub const DEFAULT_MAX_SKIP: u32 = 2000;
    pub const DEFAULT_MAX_CACHED_MESSAGE_KEYS: usize = 2000;
    pub const DEFAULT_MAX_RECEIVER_CHAINS: usize = 5;
    pub const DEFAULT_MAX_ARCHIVED_STATES: usize = 40;

    #[must_use]
    pub fn with_max_skip(mut self, max_skip: u32) -> Self {
        self.max_skip = max_skip;
        self
    }

    #[must_use]
    pub fn with_max_cached_message_keys(mut self, max: usize) -> Self {
        self.max_cached_message_keys = max;
        self
    }

    #[must_use]
    pub fn with_max_receiver_chains(mut self, max: usize) -> Self {
        self.max_receiver_chains = max.max(1);
        self
    }

    #[must_use]
    pub fn with_max_archived_states(mut self, max: usize) -> Self {
        self.max_archived_states = max;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skip: Self::DEFAULT_MAX_SKIP,
            max_cached_message_keys: Self::DEFAULT_MAX_CACHED_MESSAGE_KEYS,
            max_receiver_chains: Self::DEFAULT_MAX_RECEIVER_CHAINS,
            max_archived_states: Self::DEFAULT_MAX_ARCHIVED_STATES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_setters() {
        let config = SessionConfig::default()
            .with_max_skip(10)
            .with_max_receiver_chains(0);

        assert_eq!(config.max_skip, 10);
        assert_eq!(config.max_receiver_chains, 1);
        assert_eq!(
            config.max_archived_states,
            SessionConfig::DEFAULT_MAX_ARCHIVED_STATES
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_partial_config_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{ "max_skip": 50 }"#).unwrap();

        assert_eq!(config.max_skip, 50);
        assert_eq!(
            config.max_cached_message_keys,
            SessionConfig::DEFAULT_MAX_CACHED_MESSAGE_KEYS
        );
    }
}
