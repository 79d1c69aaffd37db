//! Cluster metadata snapshot: databases, tables (namespaces), datacenters and
//! machines, each keyed by id and wrapped in a [`MetadataRecord`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::MetadataRecord;
use crate::vclock::{Merge, Versioned, WriterId};

pub type DatabaseId = Uuid;
pub type NamespaceId = Uuid;
pub type DatacenterId = Uuid;
pub type MachineId = Uuid;
pub type ShardId = u32;

/// Datacenter key used by per-datacenter maps; the nil id means "anywhere".
pub fn any_datacenter() -> DatacenterId {
    Uuid::nil()
}

/// A validated entity name: non-empty, ASCII letters, digits and underscores.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Name(String);

impl Name {
    pub const VALID_CHAR_MSG: &'static str = "Use A-Za-z0-9_ only";

    pub fn new(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        valid.then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Name {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::new(&raw).ok_or_else(|| format!("invalid name `{raw}`"))
    }
}

impl From<Name> for String {
    fn from(name: Name) -> Self {
        name.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseMeta {
    pub name: Versioned<Name>,
}

impl DatabaseMeta {
    pub fn new(name: Name, writer: WriterId) -> Self {
        Self {
            name: Versioned::new(name, writer),
        }
    }
}

impl Merge for DatabaseMeta {
    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatacenterMeta {
    pub name: Versioned<Name>,
}

impl DatacenterMeta {
    pub fn new(name: Name, writer: WriterId) -> Self {
        Self {
            name: Versioned::new(name, writer),
        }
    }
}

impl Merge for DatacenterMeta {
    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMeta {
    pub name: Versioned<Name>,
    /// Nil when the machine belongs to no datacenter.
    pub datacenter: Versioned<DatacenterId>,
}

impl MachineMeta {
    pub fn new(name: Name, datacenter: DatacenterId, writer: WriterId) -> Self {
        Self {
            name: Versioned::new(name, writer),
            datacenter: Versioned::new(datacenter, writer),
        }
    }
}

impl Merge for MachineMeta {
    fn merge(&mut self, other: &Self) {
        self.name.merge(&other.name);
        self.datacenter.merge(&other.datacenter);
    }
}

/// Expected write acknowledgements for one datacenter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AckExpectation {
    pub expectation: u32,
    pub hard_durability: bool,
}

impl AckExpectation {
    pub fn new(expectation: u32, hard_durability: bool) -> Self {
        Self {
            expectation,
            hard_durability,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
}

/// Placement of every shard of one table.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Blueprint {
    pub role_assignment: BTreeMap<ShardId, BTreeMap<MachineId, Role>>,
}

impl Blueprint {
    /// Roles held by `machine`, by shard.
    pub fn roles_of(&self, machine: &MachineId) -> BTreeMap<ShardId, Role> {
        self.role_assignment
            .iter()
            .filter_map(|(shard, roles)| roles.get(machine).map(|role| (*shard, *role)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.role_assignment.is_empty()
    }
}

/// Key-range split points; `n` split points produce `n + 1` shards.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardScheme {
    pub split_points: Vec<String>,
}

impl ShardScheme {
    pub fn shard_ids(&self) -> std::ops::RangeInclusive<ShardId> {
        0..=(self.split_points.len() as ShardId)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceMeta {
    pub database: DatabaseId,
    pub name: Versioned<Name>,
    pub primary_key: Versioned<String>,
    /// Nil when the table has no datacenter affinity.
    pub primary_datacenter: Versioned<DatacenterId>,
    /// Number of secondaries wanted per datacenter.
    pub replica_affinities: Versioned<BTreeMap<DatacenterId, u32>>,
    pub ack_expectations: Versioned<BTreeMap<DatacenterId, AckExpectation>>,
    pub shards: Versioned<ShardScheme>,
    pub blueprint: Versioned<Blueprint>,
}

impl NamespaceMeta {
    /// A single-shard table with one hard-durability ack in `datacenter`.
    pub fn new(
        writer: WriterId,
        database: DatabaseId,
        datacenter: DatacenterId,
        name: Name,
        primary_key: impl Into<String>,
    ) -> Self {
        Self {
            database,
            name: Versioned::new(name, writer),
            primary_key: Versioned::new(primary_key.into(), writer),
            primary_datacenter: Versioned::new(datacenter, writer),
            replica_affinities: Versioned::new(BTreeMap::from([(datacenter, 0)]), writer),
            ack_expectations: Versioned::new(
                BTreeMap::from([(datacenter, AckExpectation::new(1, true))]),
                writer,
            ),
            shards: Versioned::new(ShardScheme::default(), writer),
            blueprint: Versioned::new(Blueprint::default(), writer),
        }
    }
}

impl Merge for NamespaceMeta {
    fn merge(&mut self, other: &Self) {
        // `database` is fixed at creation; both sides carry the same id.
        self.name.merge(&other.name);
        self.primary_key.merge(&other.primary_key);
        self.primary_datacenter.merge(&other.primary_datacenter);
        self.replica_affinities.merge(&other.replica_affinities);
        self.ack_expectations.merge(&other.ack_expectations);
        self.shards.merge(&other.shards);
        self.blueprint.merge(&other.blueprint);
    }
}

pub type RecordMap<E> = BTreeMap<Uuid, MetadataRecord<E>>;

fn merge_records<E: Merge + Clone>(mine: &mut RecordMap<E>, theirs: &RecordMap<E>) {
    for (id, record) in theirs {
        match mine.get_mut(id) {
            Some(existing) => existing.merge(record),
            None => {
                mine.insert(*id, record.clone());
            }
        }
    }
}

/// Everything DDL reads, mutates locally and submits for merge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    pub databases: RecordMap<DatabaseMeta>,
    pub namespaces: RecordMap<NamespaceMeta>,
    pub datacenters: RecordMap<DatacenterMeta>,
    pub machines: RecordMap<MachineMeta>,
}

impl ClusterMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self, id: &DatabaseId) -> Option<&DatabaseMeta> {
        self.databases.get(id).and_then(MetadataRecord::get)
    }

    pub fn namespace(&self, id: &NamespaceId) -> Option<&NamespaceMeta> {
        self.namespaces.get(id).and_then(MetadataRecord::get)
    }

    /// Datacenter a live machine belongs to; nil if none or in conflict.
    pub fn machine_datacenter(&self, id: &MachineId) -> Option<DatacenterId> {
        self.machines
            .get(id)
            .and_then(MetadataRecord::get)
            .map(|m| m.datacenter.get().copied().unwrap_or_else(any_datacenter))
    }

    /// Ids of alive tables.
    pub fn live_namespaces(&self) -> impl Iterator<Item = (&NamespaceId, &NamespaceMeta)> {
        self.namespaces
            .iter()
            .filter_map(|(id, record)| record.get().map(|ns| (id, ns)))
    }
}

impl Merge for ClusterMetadata {
    fn merge(&mut self, other: &Self) {
        merge_records(&mut self.databases, &other.databases);
        merge_records(&mut self.namespaces, &other.namespaces);
        merge_records(&mut self.datacenters, &other.datacenters);
        merge_records(&mut self.machines, &other.machines);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(raw: &str) -> Name {
        Name::new(raw).unwrap()
    }

    #[test]
    fn name_validation() {
        assert!(Name::new("users_2").is_some());
        assert!(Name::new("").is_none());
        assert!(Name::new("bad name!").is_none());
        assert!(Name::new("dash-ed").is_none());
        assert!(serde_json::from_str::<Name>("\"no spaces\"").is_err());
        assert_eq!(serde_json::to_string(&name("ok")).unwrap(), "\"ok\"");
    }

    #[test]
    fn new_namespace_defaults() {
        let writer = Uuid::new_v4();
        let db = Uuid::new_v4();
        let ns = NamespaceMeta::new(writer, db, any_datacenter(), name("t"), "id");
        assert_eq!(ns.primary_key.get().map(String::as_str), Some("id"));
        assert_eq!(
            ns.ack_expectations.get().unwrap().get(&any_datacenter()),
            Some(&AckExpectation::new(1, true))
        );
        assert_eq!(ns.shards.get().unwrap().shard_ids().collect::<Vec<_>>(), vec![0]);
        assert!(ns.blueprint.get().unwrap().is_empty());
    }

    #[test]
    fn snapshots_converge_regardless_of_merge_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let db_id = Uuid::new_v4();
        let mut base = ClusterMetadata::new();
        base.databases
            .insert(db_id, MetadataRecord::live(DatabaseMeta::new(name("shared"), a)));

        let mut left = base.clone();
        left.databases
            .insert(Uuid::new_v4(), MetadataRecord::live(DatabaseMeta::new(name("l"), a)));
        left.databases.get_mut(&db_id).unwrap().mark_deleted();

        let mut right = base.clone();
        right
            .databases
            .get_mut(&db_id)
            .and_then(MetadataRecord::get_mut)
            .unwrap()
            .name
            .set(name("renamed"), b);

        let mut lr = left.clone();
        lr.merge(&right);
        let mut rl = right.clone();
        rl.merge(&left);

        assert_eq!(lr, rl);
        assert!(lr.databases[&db_id].is_deleted());
        assert_eq!(lr.databases.len(), 2);
    }
}
