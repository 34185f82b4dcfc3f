//! API Module
//!
//! Provides the REST API over the request router, plus health and metrics
//! endpoints.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
