//! Database and table operations.
//!
//! Every write follows the same shape: take the metadata home's write lock
//! with a private copy of the committed metadata, check the request against
//! the copy and mutate it, re-plan blueprints and commit it through the home.
//! `table_create` then releases the lock and waits until the new table's
//! workers are serving.

use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blueprint::fill_in_blueprints;
use crate::cluster::Node;
use crate::metadata::{
    ClusterMetadata, DatabaseId, DatabaseMeta, DatacenterId, Name, NamespaceId, NamespaceMeta,
    any_datacenter,
};
use crate::propagation::WriteLock;
use crate::query::QueryError;
use crate::readiness::await_ready;
use crate::record::MetadataRecord;
use crate::searcher::{Lookup, MetadataSearcher, Predicate};
use crate::storage::RowStream;

/// Evaluation context of one query: the node it runs on and the token that
/// interrupts it.
#[derive(Clone)]
pub struct QueryEnv {
    node: Arc<Node>,
    interruptor: CancellationToken,
}

impl QueryEnv {
    pub fn new(node: Arc<Node>) -> Self {
        Self::with_interruptor(node, CancellationToken::new())
    }

    pub fn with_interruptor(node: Arc<Node>, interruptor: CancellationToken) -> Self {
        Self { node, interruptor }
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn interruptor(&self) -> &CancellationToken {
        &self.interruptor
    }

    pub fn default_db(&self) -> &str {
        &self.node.options().default_db
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DbHandle {
    pub id: DatabaseId,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TableHandle {
    pub id: NamespaceId,
    pub db: DbHandle,
    pub name: String,
    pub primary_key: String,
    pub use_outdated: bool,
}

impl TableHandle {
    /// `db.table`, as used in messages.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.db.name, self.name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Durability {
    #[default]
    Hard,
    Soft,
}

impl Durability {
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        match raw {
            "hard" => Ok(Durability::Hard),
            "soft" => Ok(Durability::Soft),
            other => Err(QueryError::Generic(format!(
                "Durability option `{other}` unrecognized (options are \"hard\" and \"soft\")."
            ))),
        }
    }

    pub fn is_hard(self) -> bool {
        self == Durability::Hard
    }
}

#[derive(Clone, Debug, Default)]
pub struct TableCreateOptions {
    pub datacenter: Option<String>,
    /// Defaults to `id`.
    pub primary_key: Option<String>,
    pub durability: Durability,
}

/// Rows returned by `get_all`.
pub enum Rows {
    Lazy(RowStream),
    Eager(Vec<Value>),
}

pub fn get_name(raw: &str, kind: &str) -> Result<Name, QueryError> {
    Name::new(raw).ok_or_else(|| {
        QueryError::Generic(format!(
            "{kind} name `{raw}` invalid ({}).",
            Name::VALID_CHAR_MSG
        ))
    })
}

async fn begin_write(env: &QueryEnv) -> Result<(WriteLock, ClusterMetadata), QueryError> {
    env.node.home().begin_write(&env.interruptor).await
}

/// Plan and commit a locally mutated snapshot.
async fn propagate(
    env: &QueryEnv,
    mut meta: ClusterMetadata,
    target: Option<NamespaceId>,
) -> Result<(), QueryError> {
    let live = env.node.directory().live_machines();
    fill_in_blueprints(&mut meta, &live, env.node.machine_id(), target)?;
    env.node
        .home()
        .commit_and_await(meta, &env.interruptor)
        .await
}

fn resolve_db(meta: &ClusterMetadata, name: &Name) -> Result<DbHandle, QueryError> {
    match MetadataSearcher::new(&meta.databases).find_unique(Predicate::Name(name)) {
        Lookup::Found((id, _)) => Ok(DbHandle {
            id,
            name: name.to_string(),
        }),
        Lookup::NotFound => Err(QueryError::Generic(format!(
            "Database `{name}` does not exist."
        ))),
        Lookup::Ambiguous => Err(QueryError::Internal(format!(
            "database name `{name}` is ambiguous"
        ))),
    }
}

/// Handles only come from live records, so a missing database means it was
/// dropped after the handle was resolved.
fn ensure_db_exists(meta: &ClusterMetadata, db: &DbHandle) -> Result<(), QueryError> {
    match meta.database(&db.id) {
        Some(_) => Ok(()),
        None => Err(QueryError::Internal(format!(
            "database `{}` ({}) was dropped while in use",
            db.name, db.id
        ))),
    }
}

fn resolve_datacenter(meta: &ClusterMetadata, raw: &str) -> Result<DatacenterId, QueryError> {
    let name = get_name(raw, "Datacenter")?;
    match MetadataSearcher::new(&meta.datacenters).find_unique(Predicate::Name(&name)) {
        Lookup::Found((id, _)) => Ok(id),
        Lookup::NotFound => Err(QueryError::Generic(format!(
            "Datacenter `{name}` does not exist."
        ))),
        Lookup::Ambiguous => Err(QueryError::Internal(format!(
            "datacenter name `{name}` is ambiguous"
        ))),
    }
}

/// Resolve a datacenter name against the node's committed metadata.
pub fn datacenter(env: &QueryEnv, raw: &str) -> Result<DatacenterId, QueryError> {
    resolve_datacenter(&env.node.home().snapshot(), raw)
}

/// Resolve a database name to a handle.
pub fn db(env: &QueryEnv, raw: &str) -> Result<DbHandle, QueryError> {
    let name = get_name(raw, "Database")?;
    resolve_db(&env.node.home().snapshot(), &name)
}

#[tracing::instrument(skip(env), fields(node = %env.node.name()))]
pub async fn db_create(env: &QueryEnv, raw: &str) -> Result<Value, QueryError> {
    let name = get_name(raw, "Database")?;
    let (_writing, mut meta) = begin_write(env).await?;
    let taken = !MetadataSearcher::new(&meta.databases)
        .find_unique(Predicate::Name(&name))
        .is_not_found();
    if taken {
        return Err(QueryError::Generic(format!(
            "Database `{name}` already exists."
        )));
    }

    let id = Uuid::new_v4();
    meta.databases.insert(
        id,
        MetadataRecord::live(DatabaseMeta::new(name.clone(), env.node.machine_id())),
    );
    propagate(env, meta, None).await?;
    tracing::info!(db = %name, %id, "database created");
    Ok(json!({"created": 1}))
}

#[tracing::instrument(skip(env), fields(node = %env.node.name()))]
pub async fn db_drop(env: &QueryEnv, raw: &str) -> Result<Value, QueryError> {
    let name = get_name(raw, "Database")?;
    let (_writing, mut meta) = begin_write(env).await?;
    let db = resolve_db(&meta, &name)?;

    let tables: Vec<NamespaceId> = MetadataSearcher::new(&meta.namespaces)
        .find_all(Predicate::Parent(db.id))
        .map(|(id, _)| id)
        .collect();
    for id in &tables {
        if let Some(record) = meta.namespaces.get_mut(id) {
            record.mark_deleted();
        }
    }
    if let Some(record) = meta.databases.get_mut(&db.id) {
        record.mark_deleted();
    }

    propagate(env, meta, None).await?;
    tracing::info!(db = %name, tables = tables.len(), "database dropped");
    Ok(json!({"dropped": 1}))
}

#[tracing::instrument(skip(env, db, options), fields(node = %env.node.name(), db = %db.name))]
pub async fn table_create(
    env: &QueryEnv,
    db: &DbHandle,
    raw: &str,
    options: TableCreateOptions,
) -> Result<Value, QueryError> {
    let name = get_name(raw, "Table")?;
    let (writing, mut meta) = begin_write(env).await?;
    let datacenter = match &options.datacenter {
        Some(dc) => resolve_datacenter(&meta, dc)?,
        None => any_datacenter(),
    };
    ensure_db_exists(&meta, db)?;
    let taken = !MetadataSearcher::new(&meta.namespaces)
        .find_unique(Predicate::NameAndParent(&name, db.id))
        .is_not_found();
    if taken {
        return Err(QueryError::Generic(format!(
            "Table `{}.{name}` already exists.",
            db.name
        )));
    }

    let writer = env.node.machine_id();
    let primary_key = options.primary_key.unwrap_or_else(|| "id".to_string());
    let mut table = NamespaceMeta::new(writer, db.id, datacenter, name.clone(), primary_key);
    if let Some(mut acks) = table.ack_expectations.get().cloned() {
        for ack in acks.values_mut() {
            ack.hard_durability = options.durability.is_hard();
        }
        table.ack_expectations.set(acks, writer);
    }

    let id = Uuid::new_v4();
    meta.namespaces.insert(id, MetadataRecord::live(table));
    propagate(env, meta, Some(id)).await?;
    drop(writing);
    tracing::info!(table = %name, %id, "table committed, waiting for readiness");

    // The table exists from here on even if the wait is interrupted.
    await_ready(
        env.node.home(),
        env.node.directory(),
        id,
        env.node.options().readiness_poll_interval,
        &env.interruptor,
    )
    .await?;
    Ok(json!({"created": 1}))
}

#[tracing::instrument(skip(env, db), fields(node = %env.node.name(), db = %db.name))]
pub async fn table_drop(env: &QueryEnv, db: &DbHandle, raw: &str) -> Result<Value, QueryError> {
    let name = get_name(raw, "Table")?;
    let (_writing, mut meta) = begin_write(env).await?;
    let found = MetadataSearcher::new(&meta.namespaces)
        .find_unique(Predicate::NameAndParent(&name, db.id))
        .map(|(id, _)| id);
    let id = match found {
        Lookup::Found(id) => id,
        Lookup::NotFound => {
            return Err(QueryError::Generic(format!(
                "Table `{}.{name}` does not exist.",
                db.name
            )));
        }
        Lookup::Ambiguous => {
            return Err(QueryError::Internal(format!(
                "table name `{}.{name}` is ambiguous",
                db.name
            )));
        }
    };
    if let Some(record) = meta.namespaces.get_mut(&id) {
        record.mark_deleted();
    }

    propagate(env, meta, None).await?;
    tracing::info!(table = %name, %id, "table dropped");
    Ok(json!({"dropped": 1}))
}

/// Names of all databases whose name is not in conflict.
pub fn db_list(env: &QueryEnv) -> Vec<String> {
    let meta = env.node.home().snapshot();
    MetadataSearcher::new(&meta.databases)
        .find_all(Predicate::Any)
        .filter_map(|(_, db)| db.name.get().map(Name::to_string))
        .collect()
}

pub fn table_list(env: &QueryEnv, db: &DbHandle) -> Vec<String> {
    let meta = env.node.home().snapshot();
    MetadataSearcher::new(&meta.namespaces)
        .find_all(Predicate::Parent(db.id))
        .filter_map(|(_, table)| table.name.get().map(Name::to_string))
        .collect()
}

/// Resolve `db.raw` to a table handle.
pub fn table(
    env: &QueryEnv,
    db: &DbHandle,
    raw: &str,
    use_outdated: bool,
) -> Result<TableHandle, QueryError> {
    let name = get_name(raw, "Table")?;
    let meta = env.node.home().snapshot();
    match MetadataSearcher::new(&meta.namespaces).find_unique(Predicate::NameAndParent(&name, db.id))
    {
        Lookup::Found((id, table)) => {
            let primary_key = table.primary_key.get().cloned().ok_or_else(|| {
                QueryError::Internal(format!(
                    "primary key of table `{}.{name}` is in conflict",
                    db.name
                ))
            })?;
            Ok(TableHandle {
                id,
                db: db.clone(),
                name: name.to_string(),
                primary_key,
                use_outdated,
            })
        }
        Lookup::NotFound => Err(QueryError::Generic(format!(
            "Table `{}.{name}` does not exist.",
            db.name
        ))),
        Lookup::Ambiguous => Err(QueryError::Internal(format!(
            "table name `{}.{name}` is ambiguous",
            db.name
        ))),
    }
}

/// The row whose primary key equals `key`, or null.
pub async fn get(env: &QueryEnv, table: &TableHandle, key: &Value) -> Result<Value, QueryError> {
    let row = env
        .node
        .store()
        .get_row(table.id, &table.primary_key, key)
        .await?;
    Ok(row.unwrap_or(Value::Null))
}

/// Rows matching any of `keys`.
///
/// A secondary `index` yields a lazy union of per-key index lookups. Primary
/// key lookups are done up front and misses are left out.
pub async fn get_all(
    env: &QueryEnv,
    table: &TableHandle,
    keys: Vec<Value>,
    index: Option<String>,
) -> Result<Rows, QueryError> {
    let store = env.node.store().clone();
    match index.filter(|index| *index != table.primary_key) {
        Some(index) => {
            let id = table.id;
            let rows = stream::iter(keys)
                .then(move |key| {
                    let store = store.clone();
                    let index = index.clone();
                    async move { store.index_lookup(id, &index, &key).await }
                })
                .try_flatten()
                .boxed();
            Ok(Rows::Lazy(rows))
        }
        None => {
            let mut rows = Vec::with_capacity(keys.len());
            for key in &keys {
                if let Some(row) = store.get_row(table.id, &table.primary_key, key).await? {
                    rows.push(row);
                }
            }
            Ok(Rows::Eager(rows))
        }
    }
}

#[tracing::instrument(skip(env, table), fields(table = %table.qualified_name()))]
pub async fn sync(env: &QueryEnv, table: &TableHandle) -> Result<Value, QueryError> {
    if !env.node.store().sync(table.id).await? {
        return Err(QueryError::Internal(format!(
            "sync of table `{}` failed",
            table.qualified_name()
        )));
    }
    Ok(json!({"synced": 1}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation_message() {
        let err = get_name("bad-name", "Table").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Table name `bad-name` invalid (Use A-Za-z0-9_ only)."
        );
        assert!(get_name("ok_name_1", "Table").is_ok());
        assert!(get_name("", "Database").is_err());
    }

    #[test]
    fn durability_options() {
        assert_eq!(Durability::parse("hard").unwrap(), Durability::Hard);
        assert_eq!(Durability::parse("soft").unwrap(), Durability::Soft);
        assert_eq!(
            Durability::parse("medium").unwrap_err().to_string(),
            "Durability option `medium` unrecognized (options are \"hard\" and \"soft\")."
        );
        assert!(Durability::default().is_hard());
    }
}
