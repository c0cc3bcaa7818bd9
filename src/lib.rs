//! # taskrelay
//!
//! `taskrelay` distributes work items between producer and worker processes
//! through an AMQP 0-9-1 broker such as RabbitMQ.
//!
//! Producers publish opaque payloads; workers receive them, simulate work in
//! proportion to the payload, and acknowledge only once the work is done, so
//! a worker that dies mid-task leaves its message to be redelivered.
//!
//! ## Core Modules
//!
//! - `broker`: The broker contract, its lapin-backed implementation and an in-process loopback broker.
//! - `config`: Loads connection, publishing, consuming and topology settings.
//! - `consumer`: Subscribes to a queue and drives deliveries through a handler.
//! - `publisher`: Publishes one message with a bounded wait for the broker.
//! - `session`: Owns the connection and channel every other module goes through.
//! - `topology`: Declares queues, exchanges and bindings for each delivery mode.
//! - `utils`: Shared error types and logging setup.
//! - `work`: Turns a payload into a simulated processing time.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod publisher;
pub mod session;
pub mod topology;
pub mod utils;
pub mod work;
