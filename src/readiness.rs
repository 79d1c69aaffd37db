use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::directory::{Directory, DirectorySnapshot};
use crate::metadata::{Blueprint, NamespaceId};
use crate::metrics;
use crate::propagation::MetadataHome;
use crate::query::QueryError;

enum Readiness {
    Ready,
    Pending,
    Gone,
}

fn check(
    blueprint: Option<&Blueprint>,
    table: &NamespaceId,
    directory: &DirectorySnapshot,
    timeout: Duration,
) -> Readiness {
    let Some(blueprint) = blueprint else {
        return Readiness::Pending;
    };
    let ready = blueprint.role_assignment.iter().all(|(shard, roles)| {
        roles
            .iter()
            .all(|(machine, role)| directory.is_serving(machine, table, *shard, *role, timeout))
    });
    if ready { Readiness::Ready } else { Readiness::Pending }
}

/// Wait until every role in `table`'s committed blueprint is served by a live
/// machine.
///
/// Re-checks whenever the metadata or the directory changes and at least
/// every `poll`. Returns early if the table is dropped in the meantime.
#[tracing::instrument(skip(home, directory, cancel))]
pub async fn await_ready(
    home: &MetadataHome,
    directory: &Directory,
    table: NamespaceId,
    poll: Duration,
    cancel: &CancellationToken,
) -> Result<(), QueryError> {
    let started = Instant::now();
    let mut meta_rx = home.subscribe();
    let mut dir_rx = directory.subscribe();
    loop {
        let state = {
            let meta = meta_rx.borrow_and_update().metadata.clone();
            let dir = dir_rx.borrow_and_update();
            match meta.namespace(&table) {
                None => Readiness::Gone,
                Some(ns) => check(ns.blueprint.get(), &table, &dir, directory.peer_timeout()),
            }
        };
        match state {
            Readiness::Ready => {
                metrics::READINESS_WAIT_SECONDS.observe(started.elapsed().as_secs_f64());
                tracing::debug!(elapsed_ms = started.elapsed().as_millis() as u64, "table ready");
                return Ok(());
            }
            Readiness::Gone => {
                tracing::warn!("table dropped while waiting for readiness");
                return Ok(());
            }
            Readiness::Pending => {}
        }

        tokio::select! {
            changed = meta_rx.changed() => {
                changed.map_err(|_| QueryError::Internal("metadata home is not running".into()))?;
            }
            _ = dir_rx.changed() => {}
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.cancelled() => return Err(QueryError::Interrupted),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ClusterMetadata, Name, NamespaceMeta, Role, any_datacenter};
    use crate::record::MetadataRecord;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    async fn home_with_table(machine: Uuid) -> (MetadataHome, NamespaceId) {
        let table = Uuid::new_v4();
        let mut ns = NamespaceMeta::new(
            machine,
            Uuid::new_v4(),
            any_datacenter(),
            Name::new("t").unwrap(),
            "id",
        );
        ns.blueprint.set(
            Blueprint {
                role_assignment: BTreeMap::from([(0, BTreeMap::from([(machine, Role::Primary)]))]),
            },
            machine,
        );
        let mut meta = ClusterMetadata::new();
        meta.namespaces.insert(table, MetadataRecord::live(ns));
        (MetadataHome::open(machine, meta, None).await.unwrap(), table)
    }

    #[tokio::test]
    async fn returns_once_roles_are_served() {
        let m = Uuid::new_v4();
        let (home, table) = home_with_table(m).await;
        let directory = Directory::new(Duration::from_secs(8));
        directory.join(m, any_datacenter());

        let d = directory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            d.set_serving(&m, BTreeMap::from([(table, BTreeMap::from([(0, Role::Primary)]))]));
        });

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(5),
            await_ready(&home, &directory, table, Duration::from_millis(10), &cancel),
        )
        .await
        .expect("readiness timed out")
        .unwrap();
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let m = Uuid::new_v4();
        let (home, table) = home_with_table(m).await;
        let directory = Directory::new(Duration::from_secs(8));
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            c.cancel();
        });
        let err = await_ready(&home, &directory, table, Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Interrupted));
    }

    #[tokio::test]
    async fn unknown_table_is_not_waited_for() {
        let m = Uuid::new_v4();
        let (home, _) = home_with_table(m).await;
        let directory = Directory::new(Duration::from_secs(8));
        await_ready(
            &home,
            &directory,
            Uuid::new_v4(),
            Duration::from_millis(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    }
}
