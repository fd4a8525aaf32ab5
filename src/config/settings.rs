use serde::{Deserialize, Serialize};

/// Top-level configuration settings for a broker node.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    pub node: NodeSettings,
    pub cluster: ClusterSettings,
    pub destinations: DestinationSettings,
    pub persistence: PersistenceSettings,
    pub logging: LoggingSettings,
}

/// Identity of this node and the address its cluster listener binds to.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct NodeSettings {
    pub instance: String,
    pub host: String,
    pub port: u16,
}

/// Cluster protocol parameters.
///
/// `enforce_remote_destination_limit` controls whether destination limits
/// apply to messages arriving from peers. `consumer_flow_limit` caps the
/// prefetch a peer may grant a remote consumer. The pending check never runs
/// more often than `ack_wait_timeout_secs`.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ClusterSettings {
    pub peers: Vec<String>,
    pub transport: String,
    pub enforce_remote_destination_limit: bool,
    pub consumer_flow_limit: u32,
    pub pending_check_interval_secs: u64,
    pub ack_wait_timeout_secs: u64,
}

impl ClusterSettings {
    pub fn pending_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.pending_check_interval_secs
                .max(self.ack_wait_timeout_secs)
                .max(1),
        )
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DestinationSettings {
    pub auto_create_queues: bool,
    pub auto_create_topics: bool,
    pub max_messages: Option<usize>,
    pub max_bytes: Option<u64>,
    pub max_message_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PersistenceSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Missing values are filled from `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub node: Option<PartialNodeSettings>,
    pub cluster: Option<PartialClusterSettings>,
    pub destinations: Option<PartialDestinationSettings>,
    pub persistence: Option<PartialPersistenceSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialNodeSettings {
    pub instance: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialClusterSettings {
    pub peers: Option<Vec<String>>,
    pub transport: Option<String>,
    pub enforce_remote_destination_limit: Option<bool>,
    pub consumer_flow_limit: Option<u32>,
    pub pending_check_interval_secs: Option<u64>,
    pub ack_wait_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDestinationSettings {
    pub auto_create_queues: Option<bool>,
    pub auto_create_topics: Option<bool>,
    pub max_messages: Option<usize>,
    pub max_bytes: Option<u64>,
    pub max_message_bytes: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialPersistenceSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                instance: "broker-1".to_string(),
                host: "127.0.0.1".to_string(),
                port: 7676,
            },
            cluster: ClusterSettings {
                peers: Vec::new(),
                transport: "websocket".to_string(),
                enforce_remote_destination_limit: false,
                consumer_flow_limit: 1000,
                pending_check_interval_secs: 180,
                ack_wait_timeout_secs: 180,
            },
            destinations: DestinationSettings {
                auto_create_queues: true,
                auto_create_topics: true,
                max_messages: None,
                max_bytes: None,
                max_message_bytes: None,
            },
            persistence: PersistenceSettings {
                path: "clustermq_db".to_string(),
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl Settings {
    /// Overlay whatever `partial` specifies on top of `self`.
    pub fn merge(self, partial: PartialSettings) -> Self {
        let node = partial.node.unwrap_or_default();
        let cluster = partial.cluster.unwrap_or_default();
        let destinations = partial.destinations.unwrap_or_default();
        let persistence = partial.persistence.unwrap_or_default();
        let logging = partial.logging.unwrap_or_default();

        Self {
            node: NodeSettings {
                instance: node.instance.unwrap_or(self.node.instance),
                host: node.host.unwrap_or(self.node.host),
                port: node.port.unwrap_or(self.node.port),
            },
            cluster: ClusterSettings {
                peers: cluster.peers.unwrap_or(self.cluster.peers),
                transport: cluster.transport.unwrap_or(self.cluster.transport),
                enforce_remote_destination_limit: cluster
                    .enforce_remote_destination_limit
                    .unwrap_or(self.cluster.enforce_remote_destination_limit),
                consumer_flow_limit: cluster
                    .consumer_flow_limit
                    .unwrap_or(self.cluster.consumer_flow_limit),
                pending_check_interval_secs: cluster
                    .pending_check_interval_secs
                    .unwrap_or(self.cluster.pending_check_interval_secs),
                ack_wait_timeout_secs: cluster
                    .ack_wait_timeout_secs
                    .unwrap_or(self.cluster.ack_wait_timeout_secs),
            },
            destinations: DestinationSettings {
                auto_create_queues: destinations
                    .auto_create_queues
                    .unwrap_or(self.destinations.auto_create_queues),
                auto_create_topics: destinations
                    .auto_create_topics
                    .unwrap_or(self.destinations.auto_create_topics),
                max_messages: destinations.max_messages.or(self.destinations.max_messages),
                max_bytes: destinations.max_bytes.or(self.destinations.max_bytes),
                max_message_bytes: destinations
                    .max_message_bytes
                    .or(self.destinations.max_message_bytes),
            },
            persistence: PersistenceSettings {
                path: persistence.path.unwrap_or(self.persistence.path),
            },
            logging: LoggingSettings {
                level: logging.level.unwrap_or(self.logging.level),
            },
        }
    }
}
