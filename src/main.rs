//! CLI for taskrelay
//!
//! Subcommands:
//! - `produce`: publish one task and exit
//! - `work`: consume tasks until CTRL+C

use clap::{Parser, ValueEnum};
use taskrelay::broker::ConsumeOptions;
use taskrelay::config::{Settings, TopologySettings, load_config};
use taskrelay::consumer::{self, SimulatedWork, Worker};
use taskrelay::publisher::Publisher;
use taskrelay::session::Session;
use taskrelay::topology::{self, TopologyDescriptor, TopologyMode};
use taskrelay::utils::error::{Result, TaskError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Topology {
    /// One durable queue; workers compete for messages
    Shared,
    /// Every worker gets a copy of every message
    Fanout,
    /// Workers get the messages whose routing key matches theirs
    Direct,
}

impl Topology {
    fn mode(self, routing_key: String) -> TopologyMode {
        match self {
            Topology::Shared => TopologyMode::SharedQueue,
            Topology::Fanout => TopologyMode::Fanout,
            Topology::Direct => TopologyMode::Direct { routing_key },
        }
    }
}

#[derive(Parser)]
#[command(name = "taskrelay", version, about = "Distribute tasks over an AMQP broker")]
enum Command {
    /// Publish one task
    Produce {
        #[arg(long, value_enum, default_value_t = Topology::Shared)]
        topology: Topology,
        /// Routing key for the direct topology
        #[arg(long)]
        routing_key: Option<String>,
        /// Task payload; each '.' costs the worker one time unit
        payload: Vec<String>,
    },
    /// Consume tasks until CTRL+C
    Work {
        #[arg(long, value_enum, default_value_t = Topology::Shared)]
        topology: Topology,
        /// Routing key to bind with under the direct topology
        routing_key: Vec<String>,
    },
}

/// Joins free-text arguments with spaces, or falls back to `default` when
/// there are none or the first one is empty.
fn words_or(words: &[String], default: &str) -> String {
    match words.first() {
        Some(first) if !first.is_empty() => words.join(" "),
        _ => default.to_string(),
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    taskrelay::utils::logging::init("info");

    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = match cmd {
        Command::Produce {
            topology,
            routing_key,
            payload,
        } => {
            let key = routing_key.unwrap_or_else(|| settings.topology.default_routing_key.clone());
            let body = words_or(&payload, &settings.publisher.default_payload);
            run_produce(settings, topology.mode(key), body).await
        }
        Command::Work {
            topology,
            routing_key,
        } => {
            let key = words_or(&routing_key, &settings.topology.default_routing_key);
            run_work(settings, topology.mode(key)).await
        }
    };

    if let Err(e) = outcome {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run_produce(settings: Settings, mode: TopologyMode, body: String) -> Result<()> {
    let session = Session::connect(&settings.broker).await?;
    let Settings {
        publisher,
        topology: names,
        ..
    } = settings;

    session
        .scoped(|session| async move {
            let declared =
                topology::declare(&session, &TopologyDescriptor::producer(&mode, &names)).await?;
            Publisher::from_settings(session, &publisher)
                .publish(&declared.target, body.as_bytes(), true)
                .await?;
            info!(" [x] Sent {}", body);
            Ok(())
        })
        .await
}

async fn run_work(settings: Settings, mode: TopologyMode) -> Result<()> {
    let session = Session::connect(&settings.broker).await?;
    let Settings {
        consumer: consumer_settings,
        topology: names,
        ..
    } = settings;

    session
        .scoped(|session| async move {
            let queue = declare_work_queue(&session, &mode, &names).await?;
            let stream = consumer::consume(
                &session,
                &queue,
                ConsumeOptions {
                    consumer_tag: String::new(),
                    prefetch_count: consumer_settings.prefetch_count,
                },
            )
            .await?;

            let shutdown = CancellationToken::new();
            let mut worker = Worker::new(SimulatedWork::from_settings(&consumer_settings))
                .spawn(stream, shutdown.clone());

            info!(" [*] Waiting for messages. To exit press CTRL+C");
            let joined = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received. Exiting gracefully.");
                    shutdown.cancel();
                    (&mut worker).await
                }
                joined = &mut worker => joined,
            };
            let stats = joined??;
            info!(
                received = stats.received,
                acknowledged = stats.acknowledged,
                rejected = stats.rejected,
                abandoned = stats.abandoned,
                "Worker finished"
            );
            Ok(())
        })
        .await
}

async fn declare_work_queue(
    session: &Session,
    mode: &TopologyMode,
    names: &TopologySettings,
) -> Result<taskrelay::broker::QueueHandle> {
    let declared = topology::declare(session, &TopologyDescriptor::consumer(mode, names)).await?;
    declared.queue.ok_or_else(|| TaskError::NotFound {
        entity: "queue",
        name: declared.target.routing_key.clone(),
    })
}
