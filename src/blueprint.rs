//! Blueprint planning: which live machine serves which shard of each table,
//! and in which role.
//!
//! Planning is deterministic in the metadata snapshot and the set of live
//! machines. Existing assignments are kept while they remain valid so that
//! unrelated DDL does not reshuffle placement; new roles go to the least
//! loaded candidate, ties broken by a murmur3 hash of table, shard and
//! machine.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use murmur3::murmur3_32;

use crate::metadata::{
    Blueprint, ClusterMetadata, DatacenterId, MachineId, NamespaceId, NamespaceMeta, Role,
    ShardId, any_datacenter,
};
use crate::vclock::WriterId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Metadata names a machine that is absent from the live directory.
    #[error("Machine `{name}` ({id}) is missing.")]
    MissingMachine { id: MachineId, name: String },
    #[error(
        "Table {table} needs {needed} machine(s) in datacenter {datacenter} but only {available} are available."
    )]
    Unsatisfiable {
        table: NamespaceId,
        datacenter: DatacenterId,
        needed: usize,
        available: usize,
    },
}

struct Candidate {
    id: MachineId,
    datacenter: DatacenterId,
}

struct Planner<'a> {
    candidates: Vec<Candidate>,
    load: BTreeMap<MachineId, usize>,
    live: &'a BTreeSet<MachineId>,
}

fn placement_hash(table: &NamespaceId, shard: ShardId, machine: &MachineId) -> u32 {
    let key = format!("{table}:{shard}:{machine}");
    let mut cursor = Cursor::new(key.as_bytes());
    murmur3_32(&mut cursor, 0).unwrap_or(0)
}

fn in_datacenter(candidate_dc: DatacenterId, wanted: DatacenterId) -> bool {
    wanted == any_datacenter() || candidate_dc == wanted
}

impl Planner<'_> {
    fn datacenter_of(&self, machine: &MachineId) -> Option<DatacenterId> {
        self.candidates
            .iter()
            .find(|c| c.id == *machine)
            .map(|c| c.datacenter)
    }

    /// Pick `count` machines in `datacenter` not already in `taken`,
    /// preferring ones `previous` assigned.
    fn pick(
        &self,
        table: &NamespaceId,
        shard: ShardId,
        datacenter: DatacenterId,
        count: usize,
        previous: &[MachineId],
        taken: &BTreeMap<MachineId, Role>,
    ) -> Result<Vec<MachineId>, PlanError> {
        let eligible = |m: &MachineId| {
            !taken.contains_key(m)
                && self
                    .datacenter_of(m)
                    .is_some_and(|dc| in_datacenter(dc, datacenter))
        };
        let mut chosen: Vec<MachineId> = previous
            .iter()
            .filter(|m| self.live.contains(*m) && eligible(*m))
            .take(count)
            .copied()
            .collect();

        let mut rest: Vec<&Candidate> = self
            .candidates
            .iter()
            .filter(|c| eligible(&c.id) && !chosen.contains(&c.id))
            .collect();
        rest.sort_by_key(|c| {
            (
                self.load.get(&c.id).copied().unwrap_or(0),
                placement_hash(table, shard, &c.id),
            )
        });
        for c in rest {
            if chosen.len() >= count {
                break;
            }
            chosen.push(c.id);
        }

        if chosen.len() < count {
            let available = self
                .candidates
                .iter()
                .filter(|c| in_datacenter(c.datacenter, datacenter))
                .count();
            return Err(PlanError::Unsatisfiable {
                table: *table,
                datacenter,
                needed: count,
                available,
            });
        }
        Ok(chosen)
    }

    fn plan_table(&mut self, id: &NamespaceId, ns: &NamespaceMeta) -> Result<Option<Blueprint>, PlanError> {
        let (Some(shards), Some(primary_dc), Some(affinities), Some(acks)) = (
            ns.shards.get(),
            ns.primary_datacenter.get(),
            ns.replica_affinities.get(),
            ns.ack_expectations.get(),
        ) else {
            tracing::warn!(table = %id, "skipping blueprint for table with conflicted configuration");
            return Ok(None);
        };
        let current = ns.blueprint.get().cloned().unwrap_or_default();

        let mut blueprint = Blueprint::default();
        for shard in shards.shard_ids() {
            let before = current.role_assignment.get(&shard);
            let previous = |role: Role| -> Vec<MachineId> {
                before
                    .map(|roles| {
                        roles
                            .iter()
                            .filter(|(_, r)| **r == role)
                            .map(|(m, _)| *m)
                            .collect()
                    })
                    .unwrap_or_default()
            };

            let mut roles: BTreeMap<MachineId, Role> = BTreeMap::new();
            let primary = self.pick(id, shard, *primary_dc, 1, &previous(Role::Primary), &roles)?;
            for m in primary {
                roles.insert(m, Role::Primary);
            }
            for (dc, count) in affinities {
                let secondaries = self.pick(
                    id,
                    shard,
                    *dc,
                    *count as usize,
                    &previous(Role::Secondary),
                    &roles,
                )?;
                for m in secondaries {
                    roles.insert(m, Role::Secondary);
                }
            }

            for (dc, ack) in acks {
                let serving = roles
                    .keys()
                    .filter(|m| self.datacenter_of(m).is_some_and(|d| in_datacenter(d, *dc)))
                    .count();
                if serving < ack.expectation as usize {
                    return Err(PlanError::Unsatisfiable {
                        table: *id,
                        datacenter: *dc,
                        needed: ack.expectation as usize,
                        available: serving,
                    });
                }
            }

            for m in roles.keys() {
                *self.load.entry(*m).or_insert(0) += 1;
            }
            blueprint.role_assignment.insert(shard, roles);
        }

        Ok((ns.blueprint.get() != Some(&blueprint)).then_some(blueprint))
    }
}

/// Recompute blueprints for every alive table, or only `target`.
///
/// Fails without touching `meta` when an alive machine record has no live
/// directory entry or when a table's replica goals cannot be met.
pub fn fill_in_blueprints(
    meta: &mut ClusterMetadata,
    live: &BTreeSet<MachineId>,
    writer: WriterId,
    target: Option<NamespaceId>,
) -> Result<(), PlanError> {
    let mut candidates = Vec::new();
    for (id, record) in &meta.machines {
        let Some(machine) = record.get() else {
            continue;
        };
        if !live.contains(id) {
            let name = machine
                .name
                .get()
                .map(|n| n.to_string())
                .unwrap_or_else(|| "<conflicted>".to_string());
            return Err(PlanError::MissingMachine { id: *id, name });
        }
        candidates.push(Candidate {
            id: *id,
            datacenter: machine.datacenter.get().copied().unwrap_or_else(any_datacenter),
        });
    }

    let mut planner = Planner {
        candidates,
        load: BTreeMap::new(),
        live,
    };
    let mut updates = Vec::new();
    for (id, ns) in meta.live_namespaces() {
        if target.is_some_and(|t| t != *id) {
            continue;
        }
        if let Some(blueprint) = planner.plan_table(id, ns)? {
            updates.push((*id, blueprint));
        }
    }

    for (id, blueprint) in updates {
        if let Some(ns) = meta.namespaces.get_mut(&id).and_then(|r| r.get_mut()) {
            tracing::debug!(table = %id, shards = blueprint.role_assignment.len(), "blueprint updated");
            ns.blueprint.set(blueprint, writer);
        }
    }
    Ok(())
}
