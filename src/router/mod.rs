//! Request Routing
//!
//! Single router API fanned out over the registered backends.

pub mod request_router;

pub use request_router::*;
