//! loadgate Library
//!
//! This library provides the core of the loadgate harness: concurrent load
//! scenarios driven against a live target, a shared metric sink, fault
//! injection with recovery measurement, and a threshold gate that turns the
//! final metrics into a pass/fail verdict.

pub mod chaos;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod metrics;
pub mod run;
pub mod scenario;
pub mod scheduler;
pub mod telemetry;
pub mod telemetry_server;
pub mod threshold;
pub mod workloads;

pub use error::{ConfigError, HarnessError, MetricError};
pub use run::{Run, RunPlan, RunReport};
