//! # enx-server
//!
//! Process wiring for the ENX key server: environment-assembled
//! configuration, the JWKS trigger endpoint, and startup of the HTTP and
//! federation gRPC listeners.

pub mod config;
pub mod jwks_handler;

pub use config::ServerConfig;
