//! Domain layer - Core types and port definitions
//!
//! Defines the resources, bindings and router objects the broker moves
//! around, and the traits (ports) that policy drivers, binding stores and
//! router backends implement.

pub mod ports;

pub use ports::*;
