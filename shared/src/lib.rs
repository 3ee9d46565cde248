//! Shared types for Fetchgate: configuration, data model, error taxonomy,
//! and the chunked-transfer registry.
pub mod config;
pub mod errors;
pub mod models;
pub mod transfer_registry;
