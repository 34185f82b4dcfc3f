//! Binding Persistence
//!
//! Durable record of which backend owns each logical object.

pub mod sqlite;

pub use sqlite::*;
