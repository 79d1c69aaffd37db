use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, IntCounterVec, TextEncoder, histogram_opts, opts, register_histogram,
    register_int_counter_vec,
};

/// Evaluated terms by name and outcome (`ok`, `user_error`, `interrupted`, `internal`).
pub static TERMS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!("schemad_terms_total", "Evaluated query terms"),
        &["term", "outcome"]
    )
    .expect("register schemad_terms_total")
});

pub static READINESS_WAIT_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(histogram_opts!(
        "schemad_readiness_wait_seconds",
        "Time table_create spent waiting for workers to become ready",
        vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ))
    .expect("register schemad_readiness_wait_seconds")
});

/// Render every registered metric in the Prometheus text format.
pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %err, "failed to encode metrics");
    }
    String::from_utf8(buf).unwrap_or_default()
}
