//! Agri Common - shared types for the agricultural advisory daemon.
//!
//! Sensor telemetry, knowledge documents, chat wire types and the error
//! taxonomy used across the retrieval pipeline and the ingestion path.

pub mod chat;
pub mod error;
pub mod knowledge;
pub mod sensor;

pub use chat::*;
pub use error::*;
pub use knowledge::*;
pub use sensor::*;
