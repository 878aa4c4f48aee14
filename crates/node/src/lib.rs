//! Runtime for one environmental-control node: a set of sensor and actuator
//! devices sharing a single MQTT link, a durable parameter store and a local
//! telemetry database.

pub mod broker;
pub mod config;
pub mod devices;
pub mod hardware;
pub mod mqtt;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod window;
