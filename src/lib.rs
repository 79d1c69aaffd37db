//! Cluster-wide schema metadata: databases, tables, datacenters and machines
//! kept in version-vector merged snapshots, with DDL terms that commit through
//! a per-node metadata home and wait for table workers to come up.

pub mod blueprint;
pub mod cluster;
pub mod ddl;
pub mod directory;
pub mod metadata;
pub mod metrics;
pub mod propagation;
pub mod query;
pub mod readiness;
pub mod record;
pub mod searcher;
pub mod storage;
pub mod telemetry;
pub mod util;
pub mod vclock;
pub mod worker;

pub use cluster::{Cluster, ClusterOptions, MachineSpec, Node};
pub use ddl::QueryEnv;
pub use metadata::ClusterMetadata;
pub use query::{QueryError, QueryOutput, Term};
pub use storage::memory::MemStore;
