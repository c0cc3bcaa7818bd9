//! Consumer loop
//!
//! `consume` subscribes to a queue with manual acknowledgment. A `Worker`
//! drains the resulting stream one delivery at a time: it hands each delivery
//! to a `TaskHandler`, acknowledges it once the handler returns, and rejects it
//! when the handler fails. A failed first delivery goes back to its queue; a
//! delivery that fails again after redelivery is rejected for good.
//!
//! Cancelling the worker's token while a handler runs abandons that delivery
//! without settling it, so the broker redelivers it once the session closes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::message::Delivery;
use crate::broker::{ConsumeOptions, DeliveryStream, QueueHandle};
use crate::config::ConsumerSettings;
use crate::session::Session;
use crate::utils::error::{ProcessingError, Result};
use crate::work::WorkSimulator;

/// Starts consuming `queue` with manual acknowledgment.
pub async fn consume(
    session: &Session,
    queue: &QueueHandle,
    options: ConsumeOptions,
) -> Result<DeliveryStream> {
    let stream = session.channel().consume(queue, &options).await?;
    info!(queue = %queue.name, prefetch = options.prefetch_count, "Consuming");
    Ok(stream)
}

/// Does the work a delivery describes.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> std::result::Result<(), ProcessingError>;
}

/// Sleeps for as long as the payload asks for.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedWork {
    simulator: WorkSimulator,
}

impl SimulatedWork {
    pub fn new(simulator: WorkSimulator) -> Self {
        Self { simulator }
    }

    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self::new(WorkSimulator::with_unit(Duration::from_millis(
            settings.unit_millis,
        )))
    }
}

#[async_trait]
impl TaskHandler for SimulatedWork {
    async fn handle(&self, delivery: &Delivery) -> std::result::Result<(), ProcessingError> {
        let duration = self.simulator.duration_for(delivery.body());
        debug!(delivery_tag = delivery.delivery_tag(), ?duration, "Working");
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    /// Left unsettled because the worker was cancelled mid-processing.
    pub abandoned: u64,
}

pub struct Worker<H> {
    handler: H,
}

impl<H: TaskHandler + 'static> Worker<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    /// Processes deliveries in order until the stream ends or `shutdown` is
    /// cancelled.
    pub async fn run(&self, mut stream: DeliveryStream, shutdown: CancellationToken) -> Result<WorkerStats> {
        let mut stats = WorkerStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(delivery) = next else {
                info!("Delivery stream ended");
                break;
            };
            let mut delivery = delivery?;
            stats.received += 1;

            info!(
                delivery_tag = delivery.delivery_tag(),
                redelivered = delivery.redelivered(),
                "Received a message: {}",
                delivery.message().body_text()
            );
            delivery.start_processing()?;

            let outcome = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                outcome = self.handler.handle(&delivery) => Some(outcome),
            };

            match outcome {
                None => {
                    stats.abandoned += 1;
                    warn!(
                        delivery_tag = delivery.delivery_tag(),
                        "Shutting down mid-task, leaving the message unacknowledged"
                    );
                    break;
                }
                Some(Ok(())) => {
                    info!(delivery_tag = delivery.delivery_tag(), "Done");
                    delivery.ack().await?;
                    stats.acknowledged += 1;
                    info!(delivery_tag = delivery.delivery_tag(), "Acknowledged message");
                }
                Some(Err(err)) => {
                    let requeue = !delivery.redelivered();
                    warn!(
                        delivery_tag = delivery.delivery_tag(),
                        requeue,
                        error = %err,
                        "Processing failed, rejecting message"
                    );
                    delivery.reject(requeue).await?;
                    stats.rejected += 1;
                }
            }
        }

        info!(?stats, "Worker stopped");
        Ok(stats)
    }

    /// Runs the worker on its own task.
    pub fn spawn(self, stream: DeliveryStream, shutdown: CancellationToken) -> JoinHandle<Result<WorkerStats>> {
        tokio::spawn(async move { self.run(stream, shutdown).await })
    }
}
