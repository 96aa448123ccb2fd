//! Prometheus metrics
//!
//! Process-wide collectors registered in the default registry and served
//! on `/metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, register_int_gauge_vec,
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, TextEncoder,
};

use crate::error::{Error, Result};

/// Bytes committed to the quota ledger
pub static STORAGE_USED_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_storage_used_bytes", "Bytes committed to the store")
        .expect("metric can be registered")
});

/// Ledger ceiling
pub static STORAGE_MAX_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("stratus_storage_max_bytes", "Quota ceiling of the store")
        .expect("metric can be registered")
});

/// Live connections per pool
pub static OPEN_CONNECTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!(
        "stratus_open_connections",
        "Connections currently registered",
        &["pool"]
    )
    .expect("metric can be registered")
});

/// Connections reclaimed by the disposal sweep
pub static EVICTED_CONNECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stratus_evicted_connections_total",
        "Connections removed by the disposal sweep",
        &["pool"]
    )
    .expect("metric can be registered")
});

/// Compensating actions run after failed transfers or commands
pub static COMPENSATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "stratus_compensations_total",
        "Compensating actions run after failures"
    )
    .expect("metric can be registered")
});

/// Lifecycle commands handled, by type and outcome
pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "stratus_commands_total",
        "Lifecycle commands handled",
        &["type", "status"]
    )
    .expect("metric can be registered")
});

/// Force registration so every series shows up before first use
pub fn init() {
    Lazy::force(&STORAGE_USED_BYTES);
    Lazy::force(&STORAGE_MAX_BYTES);
    Lazy::force(&OPEN_CONNECTIONS);
    Lazy::force(&EVICTED_CONNECTIONS);
    Lazy::force(&COMPENSATIONS);
    Lazy::force(&COMMANDS);
}

/// Encode the default registry in the text exposition format
pub fn encode() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}
