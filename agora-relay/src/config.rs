use crate::dedup::DEFAULT_DEDUP_CAPACITY;

/// Content topic shared by every room.
pub const DEFAULT_TOPIC: &str = "/agora/1/rooms/proto";

/// Namespace prefix of dedup storage keys.
pub const DEFAULT_STORAGE_NAMESPACE: &str = "agora_dedup";

/// Session configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Content topic for the node's single encoder/decoder pair
    pub topic: String,
    /// Connect the node to default bootstrap peers (default: true)
    pub bootstrap: bool,
    /// Identities remembered per room (default: 1000)
    pub dedup_capacity: usize,
    /// Storage key prefix (default: "agora_dedup")
    pub storage_namespace: String,
    /// Buffer of the live observability stream (default: 1024)
    pub observability_capacity: usize,
    /// Records kept for `recent()` (default: 256)
    pub observability_history: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            topic: DEFAULT_TOPIC.to_string(),
            bootstrap: true,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            storage_namespace: DEFAULT_STORAGE_NAMESPACE.to_string(),
            observability_capacity: 1024,
            observability_history: 256,
        }
    }
}

impl RelayConfig {
    /// No bootstrap, small buffers.
    pub fn for_testing() -> Self {
        Self {
            topic: "/agora-test/1/rooms/proto".to_string(),
            bootstrap: false,
            dedup_capacity: 64,
            storage_namespace: "agora_dedup_test".to_string(),
            observability_capacity: 256,
            observability_history: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.topic, "/agora/1/rooms/proto");
        assert_eq!(config.dedup_capacity, 1000);
        assert_eq!(config.storage_namespace, "agora_dedup");
        assert!(config.bootstrap);
    }

    #[test]
    fn test_for_testing() {
        let config = RelayConfig::for_testing();
        assert!(!config.bootstrap);
        assert!(config.dedup_capacity < DEFAULT_DEDUP_CAPACITY);
    }
}
