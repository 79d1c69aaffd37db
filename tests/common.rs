use std::sync::Arc;
use std::time::{Duration, Instant};

use schemad::{
    Cluster, ClusterOptions, MachineSpec, MemStore, QueryEnv, QueryError, Term, query,
};
use serde_json::Value;

/// Options with intervals short enough for tests.
#[allow(dead_code)]
pub fn fast_options() -> ClusterOptions {
    ClusterOptions {
        heartbeat_interval: Duration::from_millis(20),
        peer_timeout: Duration::from_secs(2),
        gossip_interval: Duration::from_millis(20),
        readiness_poll_interval: Duration::from_millis(10),
        worker_startup_delay: Duration::from_millis(10),
        ..ClusterOptions::default()
    }
}

#[allow(dead_code)]
pub fn machines(n: usize) -> Vec<MachineSpec> {
    (0..n).map(|i| MachineSpec::new(format!("machine_{i}"))).collect()
}

/// Start `n` machines with [`fast_options`] over a shared in-memory store.
#[allow(dead_code)]
pub async fn start(n: usize) -> (Cluster, Arc<MemStore>) {
    start_with(fast_options(), machines(n)).await
}

#[allow(dead_code)]
pub async fn start_with(
    options: ClusterOptions,
    specs: Vec<MachineSpec>,
) -> (Cluster, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let cluster = Cluster::start(options, specs, store.clone())
        .await
        .expect("cluster start");
    (cluster, store)
}

#[allow(dead_code)]
pub fn env(cluster: &Cluster, idx: usize) -> QueryEnv {
    QueryEnv::new(cluster.node(idx).expect("node index").clone())
}

/// Evaluate `term` and collect its output.
#[allow(dead_code)]
pub async fn run(env: &QueryEnv, term: Term) -> Result<Value, QueryError> {
    query::run(env, &term).await?.collect().await
}

/// Evaluate a term given as JSON text.
#[allow(dead_code)]
pub async fn run_json(env: &QueryEnv, text: &str) -> Result<Value, QueryError> {
    let term = Term::parse(text)?;
    run(env, term).await
}

#[allow(dead_code)]
pub fn names(value: &Value) -> Vec<String> {
    value
        .as_array()
        .expect("array result")
        .iter()
        .map(|v| v.as_str().expect("string name").to_string())
        .collect()
}

/// Poll `check` until it holds, failing the test after five seconds.
#[allow(dead_code)]
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
