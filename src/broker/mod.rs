//! Resource Brokering
//!
//! Scoped allocate/deallocate on top of the policy manager and binding store.

pub mod resource_broker;

pub use resource_broker::*;
