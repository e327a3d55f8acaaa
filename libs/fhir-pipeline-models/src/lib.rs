//! Core data model shared by every stage of the assembly/validation/execution
//! pipeline: the wire-shape of a FHIR resource, transaction bundles, and the
//! bookkeeping structures the downstream services (optimizer, performance
//! manager, failover manager, orchestrator) pass between each other.
//!
//! Resources are kept as JSON maps rather than a tagged union of per-type
//! structs: factories, the validator, and the optimizer all need to walk and
//! patch arbitrary fields, and a closed enum of resource types would force a
//! match arm update for every new FHIR resource a factory learns to build.

pub mod resource;
pub mod bundle;
pub mod processing;

pub use resource::Resource;
pub use bundle::{Bundle, BundleEntry, BundleEntryRequest};
pub use processing::{
    EndpointDescriptor, EndpointHealth, EndpointRole, PerformanceMetricRecord, ProcessingMetadata,
    ProcessingResult, ProcessingStage, ValidationIssue, ValidationIssueSeverity, ValidationResult,
    ValidationSource,
};

/// Error returned by model-level helpers (reference formatting, id minting).
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("resource is missing resourceType")]
    MissingResourceType,
    #[error("invalid resource id: {0}")]
    InvalidId(String),
    #[error("invalid reference format: {0}")]
    InvalidReference(String),
}
