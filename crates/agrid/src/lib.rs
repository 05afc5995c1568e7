//! Agri advisor daemon library - exposes modules for testing.

pub mod cache;
pub mod config;
pub mod context;
pub mod decision;
pub mod embeddings;
mod http;
pub mod ingest;
pub mod knowledge;
pub mod llm_client;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod vector_store;
