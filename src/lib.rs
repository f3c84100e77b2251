//! # Nakivo Exporter
//!
//! A Prometheus metrics exporter for Nakivo Backup & Replication.
//!
//! ## Overview
//!
//! On every scrape the exporter logs into each configured Nakivo instance
//! through its JSON-RPC router and exports:
//!
//! - API and authentication error gauges per host
//! - License status and usage counters
//! - Last-run state, duration and size of every backed up object
//!
//! Nothing is cached between scrapes.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nakivo_exporter::{collector::MetricsCollector, config::Settings, server::start_server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("nakivo_prometheus_exporter.yaml")?;
//!
//!     let metrics = MetricsCollector::new(settings.nakivo_hosts, settings.collector);
//!
//!     start_server(&settings.http_server, metrics).await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! The exporter is configured with a YAML file, optionally overridden by
//! environment variables with the `NAKIVO_EXPORTER` prefix. See
//! [`config::Settings`] for details.
//!
//! ## Modules
//!
//! - [`client`] - Nakivo JSON-RPC client
//! - [`collector`] - Per-host orchestration and multi-host aggregation
//! - [`config`] - Configuration management
//! - [`error`] - Error types and handling
//! - [`metrics`] - Metric definitions and reply transformations
//! - [`server`] - HTTP server for exposing metrics

pub mod client;
pub mod collector;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;

pub use error::{NakivoError, Result};
