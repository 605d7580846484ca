//! # Trellis Client
//!
//! Shared types for the Trellis container orchestrator: the JSON-LD
//! entity model persisted by the controller, the change event schema
//! pushed to subscribers, and structural validation over raw documents.

/// The JSON-LD document model.
pub mod entities;
/// Structural validation of raw JSON-LD documents.
pub mod validate;
