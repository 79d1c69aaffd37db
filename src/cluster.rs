//! Nodes and the in-process cluster that hosts them.
//!
//! Every node owns a [`MetadataHome`] and runs a heartbeat and a worker task.
//! All nodes share one live [`Directory`] and one row store. A background
//! anti-entropy task periodically merges every connected node's metadata
//! into every other connected node, standing in for the gossip layer.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::directory::Directory;
use crate::metadata::{
    ClusterMetadata, DatabaseMeta, DatacenterId, DatacenterMeta, MachineId, MachineMeta, Name,
    any_datacenter,
};
use crate::propagation::MetadataHome;
use crate::query::QueryError;
use crate::record::MetadataRecord;
use crate::storage::{RowStore, StorageError};
use crate::vclock::Merge;
use crate::worker;

/// Runtime configuration shared by every node of a cluster.
#[derive(Clone, Debug)]
pub struct ClusterOptions {
    pub heartbeat_interval: Duration,
    /// Machines whose last heartbeat is older than this are not live.
    pub peer_timeout: Duration,
    /// Interval between anti-entropy rounds.
    pub gossip_interval: Duration,
    /// Upper bound between readiness re-checks in `table_create`.
    pub readiness_poll_interval: Duration,
    /// Delay before a worker reports a newly assigned role.
    pub worker_startup_delay: Duration,
    /// Database used when a term omits one.
    pub default_db: String,
    pub create_default_db: bool,
    /// Directory for per-node metadata files; metadata stays in memory when unset.
    pub metadata_dir: Option<PathBuf>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(500),
            peer_timeout: Duration::from_secs(8),
            gossip_interval: Duration::from_millis(200),
            readiness_poll_interval: Duration::from_millis(100),
            worker_startup_delay: Duration::from_millis(50),
            default_db: "test".to_string(),
            create_default_db: true,
            metadata_dir: None,
        }
    }
}

/// A machine to start, optionally placed in a named datacenter.
#[derive(Clone, Debug)]
pub struct MachineSpec {
    pub name: String,
    pub datacenter: Option<String>,
}

impl MachineSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datacenter: None,
        }
    }

    pub fn in_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = Some(datacenter.into());
        self
    }
}

pub struct Node {
    machine_id: MachineId,
    name: String,
    home: MetadataHome,
    directory: Directory,
    store: Arc<dyn RowStore>,
    options: Arc<ClusterOptions>,
    shutdown: CancellationToken,
    connected: AtomicBool,
}

impl Node {
    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn home(&self) -> &MetadataHome {
        &self.home
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

fn invalid_name(kind: &str, raw: &str) -> QueryError {
    QueryError::Generic(format!(
        "{kind} name `{raw}` invalid ({}).",
        Name::VALID_CHAR_MSG
    ))
}

/// Metadata every node starts from: datacenters, machines and, optionally,
/// the default database.
fn bootstrap_metadata(
    specs: &[MachineSpec],
    ids: &[MachineId],
    options: &ClusterOptions,
) -> Result<ClusterMetadata, QueryError> {
    let writer = ids.first().copied().unwrap_or_else(Uuid::new_v4);
    let mut meta = ClusterMetadata::new();
    let mut datacenters: BTreeMap<String, DatacenterId> = BTreeMap::new();
    for (spec, id) in specs.iter().zip(ids) {
        let dc = match &spec.datacenter {
            Some(dc_name) => match datacenters.get(dc_name) {
                Some(dc) => *dc,
                None => {
                    let name = Name::new(dc_name).ok_or_else(|| invalid_name("Datacenter", dc_name))?;
                    let dc = Uuid::new_v4();
                    meta.datacenters
                        .insert(dc, MetadataRecord::live(DatacenterMeta::new(name, writer)));
                    datacenters.insert(dc_name.clone(), dc);
                    dc
                }
            },
            None => any_datacenter(),
        };
        let name = Name::new(&spec.name).ok_or_else(|| invalid_name("Machine", &spec.name))?;
        meta.machines
            .insert(*id, MetadataRecord::live(MachineMeta::new(name, dc, writer)));
    }
    if options.create_default_db {
        let name = Name::new(&options.default_db)
            .ok_or_else(|| invalid_name("Database", &options.default_db))?;
        meta.databases
            .insert(Uuid::new_v4(), MetadataRecord::live(DatabaseMeta::new(name, writer)));
    }
    Ok(meta)
}

fn machines_path(options: &ClusterOptions) -> Option<PathBuf> {
    options
        .metadata_dir
        .as_ref()
        .map(|dir| dir.join("machines.json"))
}

fn node_path(options: &ClusterOptions, spec: &MachineSpec) -> Option<PathBuf> {
    options
        .metadata_dir
        .as_ref()
        .map(|dir| dir.join(format!("{}.json", spec.name)))
}

/// Machine ids persisted by an earlier start, if there was one.
///
/// `machines.json` is only written once every node's metadata file exists,
/// so its presence marks a cluster that finished bootstrapping.
async fn persisted_machine_ids(
    specs: &[MachineSpec],
    options: &ClusterOptions,
) -> Result<Option<Vec<MachineId>>, QueryError> {
    let Some(path) = machines_path(options) else {
        return Ok(None);
    };
    if !tokio::fs::try_exists(&path).await.map_err(StorageError::Io)? {
        return Ok(None);
    }
    let raw = tokio::fs::read(&path).await.map_err(StorageError::Io)?;
    let known: BTreeMap<String, MachineId> =
        serde_json::from_slice(&raw).map_err(StorageError::Encode)?;
    let ids = specs
        .iter()
        .map(|spec| {
            known.get(&spec.name).copied().ok_or_else(|| {
                QueryError::Generic(format!(
                    "Machine `{}` is not part of the persisted cluster.",
                    spec.name
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(ids))
}

async fn persist_machine_ids(
    path: &Path,
    specs: &[MachineSpec],
    ids: &[MachineId],
) -> Result<(), StorageError> {
    let known: BTreeMap<&str, MachineId> = specs
        .iter()
        .map(|spec| spec.name.as_str())
        .zip(ids.iter().copied())
        .collect();
    let encoded = serde_json::to_vec_pretty(&known)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Remove node files left behind by a start that never finished
/// bootstrapping, so they are not merged into the fresh metadata.
async fn clear_unfinished_start(
    specs: &[MachineSpec],
    options: &ClusterOptions,
) -> Result<(), StorageError> {
    let Some(dir) = &options.metadata_dir else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir).await?;
    for spec in specs {
        if let Some(path) = node_path(options, spec) {
            if tokio::fs::try_exists(&path).await? {
                tracing::warn!(path = %path.display(), "discarding metadata of an unfinished start");
                tokio::fs::remove_file(&path).await?;
            }
        }
    }
    Ok(())
}

pub struct Cluster {
    nodes: Vec<Arc<Node>>,
    directory: Directory,
    shutdown: CancellationToken,
}

impl Cluster {
    /// Start one node per spec, all sharing `store`.
    pub async fn start(
        options: ClusterOptions,
        specs: Vec<MachineSpec>,
        store: Arc<dyn RowStore>,
    ) -> Result<Self, QueryError> {
        let options = Arc::new(options);
        let directory = Directory::new(options.peer_timeout);
        let shutdown = CancellationToken::new();
        // A restarted cluster recovers everything from its metadata files.
        let (ids, initial, fresh) = match persisted_machine_ids(&specs, &options).await? {
            Some(ids) => (ids, ClusterMetadata::new(), false),
            None => {
                let ids: Vec<MachineId> = specs.iter().map(|_| Uuid::new_v4()).collect();
                let initial = bootstrap_metadata(&specs, &ids, &options)?;
                clear_unfinished_start(&specs, &options).await?;
                (ids, initial, true)
            }
        };

        let mut nodes = Vec::with_capacity(specs.len());
        for (spec, id) in specs.iter().zip(ids.iter().copied()) {
            let path = node_path(&options, spec);
            let home = MetadataHome::open(id, initial.clone(), path).await?;
            let node_shutdown = shutdown.child_token();
            let datacenter = home
                .snapshot()
                .machine_datacenter(&id)
                .unwrap_or_else(any_datacenter);
            directory.join(id, datacenter);
            directory.spawn_heartbeat(id, options.heartbeat_interval, node_shutdown.clone());
            worker::spawn(
                id,
                home.clone(),
                directory.clone(),
                options.worker_startup_delay,
                node_shutdown.clone(),
            );
            tracing::info!(machine = %id, name = %spec.name, "node started");
            nodes.push(Arc::new(Node {
                machine_id: id,
                name: spec.name.clone(),
                home,
                directory: directory.clone(),
                store: store.clone(),
                options: options.clone(),
                shutdown: node_shutdown,
                connected: AtomicBool::new(true),
            }));
        }

        if fresh {
            if let Some(path) = machines_path(&options) {
                if let Err(err) = persist_machine_ids(&path, &specs, &ids).await {
                    shutdown.cancel();
                    return Err(err.into());
                }
            }
        }

        let cluster = Self {
            nodes,
            directory,
            shutdown,
        };
        cluster.spawn_anti_entropy(options.gossip_interval);
        Ok(cluster)
    }

    fn spawn_anti_entropy(&self, interval: Duration) {
        let nodes = self.nodes.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }
                if let Err(err) = exchange(&nodes).await {
                    tracing::warn!(error = %err, "anti-entropy round failed");
                }
            }
        });
    }

    /// Run one anti-entropy round immediately.
    pub async fn gossip_once(&self) -> Result<(), QueryError> {
        exchange(&self.nodes).await
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> Option<&Arc<Node>> {
        self.nodes.get(idx)
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Stop a node's heartbeat and worker and cut it off from anti-entropy.
    /// Its metadata home keeps running.
    pub fn disconnect(&self, idx: usize) {
        if let Some(node) = self.nodes.get(idx) {
            node.connected.store(false, Ordering::SeqCst);
            node.shutdown.cancel();
            self.directory.leave(&node.machine_id);
        }
    }

    /// Declare `machine` permanently gone by tombstoning its record, via the
    /// node at `via`. Planning no longer waits for it afterwards.
    pub async fn forget_machine(
        &self,
        via: usize,
        machine: MachineId,
        cancel: &CancellationToken,
    ) -> Result<(), QueryError> {
        let node = self
            .nodes
            .get(via)
            .ok_or_else(|| QueryError::Generic(format!("No node at index {via}.")))?;
        let (_writing, mut meta) = node.home.begin_write(cancel).await?;
        match meta.machines.get_mut(&machine) {
            Some(record) if !record.is_deleted() => record.mark_deleted(),
            _ => return Err(QueryError::Generic(format!("Machine {machine} does not exist."))),
        }
        node.home.commit_and_await(meta, cancel).await?;
        tracing::info!(%machine, "machine forgotten");
        Ok(())
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Merge the metadata of every connected node and push the union to the
/// nodes that have not seen all of it yet.
async fn exchange(nodes: &[Arc<Node>]) -> Result<(), QueryError> {
    let connected: Vec<&Arc<Node>> = nodes.iter().filter(|n| n.is_connected()).collect();
    let snapshots: Vec<Arc<ClusterMetadata>> =
        connected.iter().map(|n| n.home.snapshot()).collect();
    let Some((first, rest)) = snapshots.split_first() else {
        return Ok(());
    };
    let mut merged = (**first).clone();
    for snap in rest {
        merged.merge(snap);
    }
    let mut updated = BTreeSet::new();
    for (node, snap) in connected.iter().zip(&snapshots) {
        if **snap != merged {
            node.home.merge_remote(merged.clone()).await?;
            updated.insert(node.machine_id);
        }
    }
    if !updated.is_empty() {
        tracing::trace!(nodes = updated.len(), "anti-entropy pushed metadata");
    }
    Ok(())
}
