use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Groups the broker connection parameters with the producer, consumer and
/// topology knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub publisher: PublisherSettings,
    pub consumer: ConsumerSettings,
    pub topology: TopologySettings,
}

/// Connection parameters for the AMQP broker.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl BrokerSettings {
    /// `host:port/vhost`, without credentials. Used in logs and errors.
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.vhost_path())
    }

    fn vhost_path(&self) -> String {
        if self.vhost.starts_with('/') {
            self.vhost.clone()
        } else {
            format!("/{}", self.vhost)
        }
    }
}

/// Settings for the producer side.
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherSettings {
    pub timeout_secs: u64,
    pub content_type: String,
    pub default_payload: String,
}

/// Settings for the consumer side.
///
/// `prefetch_count` of 0 leaves the broker's unlimited default in place.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    pub prefetch_count: u16,
    pub unit_millis: u64,
}

/// Names of the queue and exchanges both sides agree on.
#[derive(Debug, Deserialize, Clone)]
pub struct TopologySettings {
    pub queue: String,
    pub fanout_exchange: String,
    pub direct_exchange: String,
    pub default_routing_key: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// The flat `user`/`pass`/`host`/`port`/`vhost` keys come from the
/// `RABBITMQ_*` variables and take precedence over the `broker` section.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub user: Option<String>,
    pub pass: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub broker: Option<PartialBrokerSettings>,
    pub publisher: Option<PartialPublisherSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub topology: Option<PartialTopologySettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialPublisherSettings {
    pub timeout_secs: Option<u64>,
    pub content_type: Option<String>,
    pub default_payload: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConsumerSettings {
    pub prefetch_count: Option<u16>,
    pub unit_millis: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTopologySettings {
    pub queue: Option<String>,
    pub fanout_exchange: Option<String>,
    pub direct_exchange: Option<String>,
    pub default_routing_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings {
                user: "guest".to_string(),
                password: "guest".to_string(),
                host: "localhost".to_string(),
                port: 5672,
                vhost: "/".to_string(),
            },
            publisher: PublisherSettings {
                timeout_secs: 5,
                content_type: "text/plain".to_string(),
                default_payload: "hello from the taskrelay producer".to_string(),
            },
            consumer: ConsumerSettings {
                prefetch_count: 0,
                unit_millis: 1000,
            },
            topology: TopologySettings {
                queue: "tasks_queue".to_string(),
                fanout_exchange: "shared_tasks".to_string(),
                direct_exchange: "shared_tasks_direct".to_string(),
                default_routing_key: "default_routing_key".to_string(),
            },
        }
    }
}
