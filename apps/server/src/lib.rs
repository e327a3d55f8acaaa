//! FHIR Assembly, Validation & Execution Pipeline
//!
//! Assembles pre-extracted clinical entities into a FHIR R4 transaction
//! `Bundle`, optimizes it for validation success, validates and executes it
//! against an external FHIR server with failover and retries, and returns a
//! structured `ProcessingResult` within a soft 2-second SLA.

#![allow(clippy::too_many_arguments, clippy::type_complexity, clippy::large_enum_variant)]

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod request_context;
pub mod state;

pub mod factories;
pub mod registry;

pub mod bundle;
pub mod perf;
pub mod failover;
pub mod fhir_client;
pub mod orchestrator;

pub mod api;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;
