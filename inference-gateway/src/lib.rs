//! # Inference Gateway
//!
//! The thin HTTP demonstration binary for `inference-engine`: loads
//! configuration, wires up the control plane, and exposes a minimal
//! `axum` surface as an integration-test seam for the dispatcher. The
//! edge protocol, authentication, and SDK ergonomics are out of scope
//! here — see `inference-engine` for the actual control plane.

pub mod config;
pub mod gateway_error;
pub mod server;

pub use server::create_server;
