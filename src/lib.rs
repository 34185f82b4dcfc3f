//! Router Broker - Multi-Backend Resource Broker and Request Router
//!
//! Presents one router API over several router backends. Every new router is
//! placed on a scarce resource handed out by an allocation policy, and the
//! resulting binding decides which backend serves the router afterwards.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        REST API (axum) / library callers                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Request Router                                  │
//! │        create ─► allocate    get/update/interfaces ─► binding lookup        │
//! │        delete ─► deallocate  list/count ─► scatter-gather + dedup           │
//! ├──────────────────────────────────────┬──────────────────────────────────────┤
//! │           Resource Broker            │           Plugin Registry            │
//! │  ┌──────────────┐ ┌───────────────┐  │   descriptor ─► RouterBackend        │
//! │  │PolicyManager │ │ Binding Store │  │   default backend (passthrough)      │
//! │  │ local | remote│ │   (SQLite)    │  │                                      │
//! │  └──────────────┘ └───────────────┘  │                                      │
//! └──────────────────────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`policy`]: Allocation policy drivers and the policy manager
//! - [`store`]: Binding persistence
//! - [`broker`]: Scoped allocate/deallocate with rollback
//! - [`plugins`]: Backend registry and built-in backends
//! - [`router`]: Request routing across backends
//! - [`api`]: REST API server
//! - [`config`]: Configuration loading
//! - [`metrics`]: Prometheus counters
//! - [`domain`]: Core domain types and traits
//! - [`error`]: Error types and handling

pub mod api;
pub mod broker;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod plugins;
pub mod policy;
pub mod router;
pub mod store;

// Re-export commonly used types
pub use api::{ApiServer, RestRouter};

pub use broker::{PendingBinding, ResourceBroker};

pub use config::{ApiConfig, BrokerConfig};

pub use domain::ports::{
    Binding, BindingStatus, BindingStore, BindingUpdate, NewBinding, PolicyDriver,
    RequestContext, Resource, ResourceMetadata, Router, RouterBackend, RouterQuery,
    RouterRequest, SortKey,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::BrokerMetrics;

pub use plugins::{BackendFactory, InMemoryRouterBackend, PluginConfig, PluginFactory, PluginRegistry};

pub use policy::{
    LocalPoolConfig, LocalPoolPolicy, PolicyConfig, PolicyFactory, PolicyManager,
    RemoteAllocationConfig, RemoteAllocationPolicy,
};

pub use router::{RequestRouter, ROUTER_RESOURCE_TYPE};

pub use store::{SqliteBindingStore, StoreConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
