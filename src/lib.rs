//! # gridflux - Smart-Home Energy Telemetry Collector
//!
//! A resilient collector for heterogeneous smart-home energy devices and
//! utility data sources: irregular raw samples become fixed-interval energy
//! aggregates in a time-series sink, and applicable electricity prices are
//! computed for static and day-ahead-market tariff schemes.
//!
//! ## Features
//!
//! - **Resilient Collection**: per-device connection lifecycle with
//!   exponential backoff and automatic reconnection
//! - **Bounded Polling**: timeout-raced refreshes with at most one in-flight
//!   request per device
//! - **Time-Weighted Aggregation**: irregular power samples reduced to
//!   wall-clock-aligned energy totals
//! - **Tariff Pricing**: static, dynamic and raw-market tariffs with
//!   holiday-aware peak/off-peak rules
//! - **InfluxDB Sink**: append-only line-protocol writes plus the two queries
//!   needed to resume cleanly after a restart
//! - **Configuration**: YAML-based configuration with validation
//!
//! ## Architecture
//!
//! The application follows a modular architecture with clear separation of
//! concerns:
//!
//! - `config`: Configuration management and validation
//! - `logging`: Structured logging and tracing
//! - `scheduler`: Cancellable one-shot and repeating timers
//! - `transport`: Device capability interface and event model
//! - `modbus`: Modbus TCP transport family
//! - `connections`: Connection lifecycle and reconnect state machine
//! - `poller`: Per-device timeout-bounded polling
//! - `aggregator`: Raw sample buffering and window reduction
//! - `sink`: InfluxDB v2 writes and restart-resume queries
//! - `pricing`: Tariff price engine
//! - `market`: Day-ahead market price source
//! - `holidays`: Per-year public holiday cache

pub mod aggregator;
pub mod config;
pub mod connections;
pub mod error;
pub mod holidays;
pub mod logging;
pub mod market;
#[cfg(feature = "modbus")]
pub mod modbus;
pub mod poller;
pub mod pricing;
pub mod scheduler;
pub mod sink;
pub mod transport;

// Re-export commonly used types
pub use config::Config;
pub use connections::{ConnectionManager, ManagerMsg};
pub use error::{GridfluxError, Result};
