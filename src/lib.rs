//! # Rust Station Core Library
//!
//! Core of a multi-slot hardware validation station. Each slot drives one
//! unit under test through an ordered sequence of test steps while sharing
//! a fault-tolerant instrument layer.
//!
//! ## Crate Structure
//!
//! - **`config`**: TOML + environment configuration (`StationConfig`).
//! - **`error`**: Error enums for instruments, binding, plugins and the station.
//! - **`policy`**: Retry engine, circuit breaker and the per-instrument policy.
//! - **`instruments`**: Capability traits, simulated devices, leasing,
//!   policy-wrapped proxies, the health watchdog and the per-slot manager.
//! - **`steps`**: The `TestStep` trait, run context, parameter binding,
//!   built-in steps, trusted plugin discovery and the step registry.
//! - **`sequence`**: Runs a slot's steps under a failure policy.
//! - **`station`**: Fans a run out over parallel slots.
//! - **`limits`**: Measurement limit tables and evaluation.
//! - **`manifest`**: Deterministic, hashed run manifests.
//! - **`report`**: Report sinks (JSON/CSV on disk, in-memory).
//! - **`logging`**: Correlated per-slot log entries.
//! - **`tracing_setup`**: Global `tracing` subscriber initialization.

pub mod config;
pub mod defaults;
pub mod error;
pub mod instruments;
pub mod limits;
pub mod logging;
pub mod manifest;
pub mod policy;
pub mod report;
pub mod results;
pub mod sequence;
pub mod station;
pub mod steps;
pub mod tracing_setup;

pub use config::StationConfig;
pub use error::{StationError, StationResult};
pub use station::{StationController, StationEvent};
