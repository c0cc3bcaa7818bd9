mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConsumerSettings, PublisherSettings, Settings, TopologySettings,
};

/// Loads the configuration from the default file and environment variables.
///
/// Sources, lowest priority first: `config/default`, `TASKRELAY__SECTION__KEY`
/// variables, then the flat `RABBITMQ_USER`/`_PASS`/`_HOST`/`_PORT`/`_VHOST`
/// variables. Anything left unset or set to an empty string falls back to
/// `Settings::default()`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix("TASKRELAY")
                .separator("__")
                .ignore_empty(true),
        )
        .add_source(Environment::with_prefix("RABBITMQ").ignore_empty(true));

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(merge(partial, Settings::default()))
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let broker = partial.broker.as_ref();
    let publisher = partial.publisher.as_ref();
    let consumer = partial.consumer.as_ref();
    let topology = partial.topology.as_ref();

    Settings {
        broker: BrokerSettings {
            user: partial
                .user
                .clone()
                .or_else(|| broker.and_then(|b| b.user.clone()))
                .unwrap_or(default.broker.user),
            password: partial
                .pass
                .clone()
                .or_else(|| broker.and_then(|b| b.password.clone()))
                .unwrap_or(default.broker.password),
            host: partial
                .host
                .clone()
                .or_else(|| broker.and_then(|b| b.host.clone()))
                .unwrap_or(default.broker.host),
            port: partial
                .port
                .or_else(|| broker.and_then(|b| b.port))
                .unwrap_or(default.broker.port),
            vhost: partial
                .vhost
                .clone()
                .or_else(|| broker.and_then(|b| b.vhost.clone()))
                .unwrap_or(default.broker.vhost),
        },
        publisher: PublisherSettings {
            timeout_secs: publisher
                .and_then(|p| p.timeout_secs)
                .unwrap_or(default.publisher.timeout_secs),
            content_type: publisher
                .and_then(|p| p.content_type.clone())
                .unwrap_or(default.publisher.content_type),
            default_payload: publisher
                .and_then(|p| p.default_payload.clone())
                .unwrap_or(default.publisher.default_payload),
        },
        consumer: ConsumerSettings {
            prefetch_count: consumer
                .and_then(|c| c.prefetch_count)
                .unwrap_or(default.consumer.prefetch_count),
            unit_millis: consumer
                .and_then(|c| c.unit_millis)
                .unwrap_or(default.consumer.unit_millis),
        },
        topology: TopologySettings {
            queue: topology
                .and_then(|t| t.queue.clone())
                .unwrap_or(default.topology.queue),
            fanout_exchange: topology
                .and_then(|t| t.fanout_exchange.clone())
                .unwrap_or(default.topology.fanout_exchange),
            direct_exchange: topology
                .and_then(|t| t.direct_exchange.clone())
                .unwrap_or(default.topology.direct_exchange),
            default_routing_key: topology
                .and_then(|t| t.default_routing_key.clone())
                .unwrap_or(default.topology.default_routing_key),
        },
    }
}
