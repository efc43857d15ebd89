//! Industrial data-acquisition gateway
//!
//! Polls S7, OPC UA and Modbus endpoints for tagged variables, runs each
//! fresh reading through an ordered processing pipeline, and fans the result
//! out to MQTT brokers, a SQLite historian and trigger evaluation.
//!
//! The main building blocks:
//!
//! - [`registry::Registry`]: concurrently-readable configuration and live
//!   value state
//! - [`session::DeviceManager`]: per-device protocol sessions with bounded
//!   connect fan-out
//! - [`scheduler::PollScheduler`]: the interval-driven poll loop
//! - [`pipeline::UpdatePipeline`]: the ordered variable-update stage chain
//! - [`broker::MqttManager`]: per-broker MQTT sessions and template payloads
//! - [`trigger::TriggerEngine`]: condition evaluation with suppression
//! - [`history::HistoryWriter`]: batched historian writes
//! - [`runtime::Gateway`]: wiring and lifecycle

pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod model;
pub mod pipeline;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod trigger;

pub use config::AppConfig;
pub use error::{GatewaySrvError, Result};
pub use runtime::Gateway;
