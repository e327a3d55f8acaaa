//! Specialized resource factories (C5), one per resource family, built on
//! the shared template-method workflow in [`base`].

pub mod base;
pub mod careplan;
pub mod clinical;
pub mod consent;
pub mod device;
pub mod encounter;
pub mod medication;
pub mod organizational;
pub mod patient;
pub mod util;

pub use base::{FactoryContext, FactoryMetrics, ResourceFactory};
