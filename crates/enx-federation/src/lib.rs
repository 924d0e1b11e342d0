//! # enx-federation
//!
//! The federation-out gRPC service: authenticates peer servers by OIDC
//! bearer token and streams exposure keys scoped to the caller's region
//! authorization, with resumable cursors across the primary and revised key
//! classes.

mod auth;
mod config;
mod server;
mod transform;

/// Generated protocol types.
#[allow(clippy::all)]
pub mod proto {
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        include_bytes!(concat!(env!("OUT_DIR"), "/federation_descriptor.bin"));

    tonic::include_proto!("federation.v1");
}

pub use config::FederationConfig;
pub use server::FederationOutService;
