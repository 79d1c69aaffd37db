//! Per-machine table workers.
//!
//! Watches the committed metadata of one node and reports in the directory
//! which blueprint roles its machine serves. Newly assigned roles only show
//! up after a startup delay, so readers of the directory observe the same
//! asynchronous bring-up a real reactor would exhibit.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::directory::{Directory, ServingMap};
use crate::metadata::{ClusterMetadata, MachineId};
use crate::propagation::MetadataHome;

/// Roles `machine` holds according to the blueprints in `meta`.
pub fn roles_for(machine: &MachineId, meta: &ClusterMetadata) -> ServingMap {
    meta.live_namespaces()
        .filter_map(|(id, ns)| {
            let roles = ns.blueprint.get()?.roles_of(machine);
            (!roles.is_empty()).then_some((*id, roles))
        })
        .collect()
}

fn gains_roles(current: &ServingMap, wanted: &ServingMap) -> bool {
    wanted.iter().any(|(table, shards)| {
        shards
            .iter()
            .any(|(shard, role)| current.get(table).and_then(|s| s.get(shard)) != Some(role))
    })
}

pub fn spawn(
    machine: MachineId,
    home: MetadataHome,
    directory: Directory,
    startup_delay: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut rx = home.subscribe();
        let mut serving = ServingMap::new();
        loop {
            let mut wanted = roles_for(&machine, &rx.borrow_and_update().metadata);
            if wanted != serving {
                if gains_roles(&serving, &wanted) {
                    tokio::select! {
                        _ = tokio::time::sleep(startup_delay) => {}
                        _ = cancel.cancelled() => break,
                    }
                    wanted = roles_for(&machine, &home.snapshot());
                }
                tracing::debug!(%machine, tables = wanted.len(), "worker roles changed");
                directory.set_serving(&machine, wanted.clone());
                serving = wanted;
            }

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
        tracing::debug!(%machine, "worker stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Blueprint, Name, NamespaceMeta, Role, any_datacenter};
    use crate::record::MetadataRecord;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn roles_skip_dropped_and_unassigned_tables() {
        let m = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut meta = ClusterMetadata::new();
        let mut add = |machine: Uuid, dropped: bool| {
            let id = Uuid::new_v4();
            let mut ns =
                NamespaceMeta::new(m, Uuid::new_v4(), any_datacenter(), Name::new("t").unwrap(), "id");
            ns.blueprint.set(
                Blueprint {
                    role_assignment: BTreeMap::from([(0, BTreeMap::from([(machine, Role::Primary)]))]),
                },
                m,
            );
            let mut record = MetadataRecord::live(ns);
            if dropped {
                record.mark_deleted();
            }
            meta.namespaces.insert(id, record);
            id
        };
        let mine = add(m, false);
        add(m, true);
        add(other, false);

        let roles = roles_for(&m, &meta);
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[&mine][&0], Role::Primary);
    }
}
