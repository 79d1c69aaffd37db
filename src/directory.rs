//! Live cluster directory.
//!
//! Each connected machine publishes its datacenter, a heartbeat and the
//! table roles it is currently serving. A machine counts as live while its
//! last heartbeat is younger than the peer timeout; disconnected machines
//! leave the directory entirely.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::metadata::{DatacenterId, MachineId, NamespaceId, Role, ShardId};

/// Roles a machine serves, by table then shard.
pub type ServingMap = BTreeMap<NamespaceId, BTreeMap<ShardId, Role>>;

#[derive(Clone, Debug)]
pub struct PeerEntry {
    pub datacenter: DatacenterId,
    pub last_heartbeat: Instant,
    pub serving: ServingMap,
}

#[derive(Clone, Debug, Default)]
pub struct DirectorySnapshot {
    pub peers: BTreeMap<MachineId, PeerEntry>,
}

impl DirectorySnapshot {
    pub fn live_machines(&self, timeout: Duration) -> BTreeSet<MachineId> {
        self.peers
            .iter()
            .filter(|(_, peer)| peer.last_heartbeat.elapsed() < timeout)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Whether a live `machine` reports `role` for `table`/`shard`.
    pub fn is_serving(
        &self,
        machine: &MachineId,
        table: &NamespaceId,
        shard: ShardId,
        role: Role,
        timeout: Duration,
    ) -> bool {
        self.peers.get(machine).is_some_and(|peer| {
            peer.last_heartbeat.elapsed() < timeout
                && peer
                    .serving
                    .get(table)
                    .and_then(|shards| shards.get(&shard))
                    == Some(&role)
        })
    }
}

#[derive(Clone)]
pub struct Directory {
    tx: Arc<watch::Sender<DirectorySnapshot>>,
    peer_timeout: Duration,
}

impl Directory {
    pub fn new(peer_timeout: Duration) -> Self {
        let (tx, _rx) = watch::channel(DirectorySnapshot::default());
        Self {
            tx: Arc::new(tx),
            peer_timeout,
        }
    }

    pub fn peer_timeout(&self) -> Duration {
        self.peer_timeout
    }

    pub fn join(&self, machine: MachineId, datacenter: DatacenterId) {
        tracing::info!(%machine, "machine joined directory");
        self.tx.send_modify(|snap| {
            snap.peers.insert(
                machine,
                PeerEntry {
                    datacenter,
                    last_heartbeat: Instant::now(),
                    serving: ServingMap::new(),
                },
            );
        });
    }

    pub fn leave(&self, machine: &MachineId) {
        tracing::info!(%machine, "machine left directory");
        self.tx.send_modify(|snap| {
            snap.peers.remove(machine);
        });
    }

    /// Refresh `machine`'s liveness. Subscribers are not woken for this.
    pub fn heartbeat(&self, machine: &MachineId) {
        self.tx.send_if_modified(|snap| {
            if let Some(peer) = snap.peers.get_mut(machine) {
                peer.last_heartbeat = Instant::now();
            }
            false
        });
    }

    /// Replace the roles `machine` reports as serving.
    pub fn set_serving(&self, machine: &MachineId, serving: ServingMap) {
        self.tx.send_if_modified(|snap| match snap.peers.get_mut(machine) {
            Some(peer) if peer.serving != serving => {
                peer.serving = serving;
                true
            }
            _ => false,
        });
    }

    pub fn snapshot(&self) -> DirectorySnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DirectorySnapshot> {
        self.tx.subscribe()
    }

    pub fn live_machines(&self) -> BTreeSet<MachineId> {
        self.tx.borrow().live_machines(self.peer_timeout)
    }

    /// Keep `machine` alive until `cancel` fires, then drop it from the directory.
    pub fn spawn_heartbeat(&self, machine: MachineId, interval: Duration, cancel: CancellationToken) {
        let directory = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => directory.heartbeat(&machine),
                    _ = cancel.cancelled() => break,
                }
            }
            directory.leave(&machine);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn join_serve_and_leave() {
        let dir = Directory::new(Duration::from_secs(8));
        let m = Uuid::new_v4();
        let t = Uuid::new_v4();
        let mut rx = dir.subscribe();
        dir.join(m, Uuid::nil());
        assert!(dir.live_machines().contains(&m));

        rx.borrow_and_update();
        dir.set_serving(&m, ServingMap::from([(t, BTreeMap::from([(0, Role::Primary)]))]));
        assert!(rx.has_changed().unwrap());
        let snap = dir.snapshot();
        assert!(snap.is_serving(&m, &t, 0, Role::Primary, dir.peer_timeout()));
        assert!(!snap.is_serving(&m, &t, 0, Role::Secondary, dir.peer_timeout()));

        dir.leave(&m);
        assert!(dir.live_machines().is_empty());
    }

    #[tokio::test]
    async fn stale_heartbeat_is_not_live() {
        let dir = Directory::new(Duration::from_millis(20));
        let m = Uuid::new_v4();
        dir.join(m, Uuid::nil());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(dir.live_machines().is_empty());
        dir.heartbeat(&m);
        assert!(dir.live_machines().contains(&m));
    }
}
