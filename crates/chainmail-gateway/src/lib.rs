//! # Chainmail Gateway
//!
//! HTTP entry point. Validates trigger requests and forwards them to the
//! chain-merge scheduler; everything else about a trigger's lifecycle lives
//! behind that call.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, serve};
