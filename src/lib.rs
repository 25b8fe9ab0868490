//! Dripline - AMQP slow-control and telemetry messaging
//!
//! A Rust implementation of the dripline wire protocol: four message kinds
//! (requests, replies, alerts, infos) exchanged over AMQP topic exchanges,
//! with a background service task per process and per-request reply
//! correlation over exclusive broker-named queues.

pub mod config;
pub mod message;
pub mod service;
pub mod utils;
