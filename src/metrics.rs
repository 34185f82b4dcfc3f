//! Broker Metrics
//!
//! Prometheus counters for allocation outcomes, kept in a dedicated registry
//! so several brokers can live in one process.

use crate::error::{Error, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Counters exported on `/metrics`
#[derive(Clone)]
pub struct BrokerMetrics {
    registry: Registry,
    allocations: IntCounterVec,
    deallocations: IntCounterVec,
    rollbacks: IntCounter,
}

impl BrokerMetrics {
    /// Create and register the broker counters
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let allocations = IntCounterVec::new(
            Opts::new(
                "router_broker_allocations_total",
                "Allocation attempts by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        let deallocations = IntCounterVec::new(
            Opts::new(
                "router_broker_deallocations_total",
                "Deallocation attempts by outcome",
            ),
            &["outcome"],
        )
        .map_err(metrics_error)?;

        let rollbacks = IntCounter::new(
            "router_broker_rollbacks_total",
            "Resources released after a failed allocation",
        )
        .map_err(metrics_error)?;

        registry
            .register(Box::new(allocations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(deallocations.clone()))
            .map_err(metrics_error)?;
        registry
            .register(Box::new(rollbacks.clone()))
            .map_err(metrics_error)?;

        Ok(Self {
            registry,
            allocations,
            deallocations,
            rollbacks,
        })
    }

    pub fn record_allocation(&self, outcome: Outcome) {
        self.allocations.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn record_deallocation(&self, outcome: Outcome) {
        self.deallocations
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    pub fn record_rollback(&self) {
        self.rollbacks.inc();
    }

    /// Current value of an allocation counter
    pub fn allocations(&self, outcome: Outcome) -> u64 {
        self.allocations.with_label_values(&[outcome.as_str()]).get()
    }

    /// Current value of a deallocation counter
    pub fn deallocations(&self, outcome: Outcome) -> u64 {
        self.deallocations
            .with_label_values(&[outcome.as_str()])
            .get()
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.get()
    }

    /// Render all counters in the Prometheus text format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(metrics_error)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

/// Result label for allocation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failure => "failure",
        }
    }
}

fn metrics_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics: {}", e))
}
