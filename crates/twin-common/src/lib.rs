//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the telemetry runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the building telemetry workspace.
//! This crate exposes configuration loading and tracing setup consumed by the
//! store adapters and the time-series engine.

pub mod config;
pub mod logging;

pub use config::{
    AppConfig, BoundsConfig, FallbackConfig, LoadedAppConfig, LoggingConfig, MetricsConfig,
    QueryConfig, StoreConfig, WriteConfig, ZoneConfig,
};
pub use logging::{init_tracing, LogFormat};
