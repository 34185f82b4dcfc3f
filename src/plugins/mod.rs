//! Router Backend Plugins
//!
//! Provides the backend registry and the built-in backends:
//! - Memory: routers held in process memory

pub mod memory;
pub mod registry;

pub use memory::*;
pub use registry::*;
