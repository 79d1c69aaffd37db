//! The metadata home: a single task that owns a node's authoritative
//! [`ClusterMetadata`].
//!
//! Writers never touch the authoritative snapshot. A local writer takes the
//! home's write lock with [`MetadataHome::begin_write`], checks and mutates
//! the private copy it gets back and submits it with
//! [`MetadataHome::commit_and_await`]; the home merges submissions one at a
//! time and publishes each result through a watch channel tagged with a
//! commit sequence number. Peer snapshots are merged without the lock.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::metadata::{ClusterMetadata, MachineId};
use crate::query::QueryError;
use crate::storage::StorageError;
use crate::vclock::Merge;

/// A committed snapshot and the sequence number of the commit that produced it.
#[derive(Clone, Debug)]
pub struct Published {
    pub seq: u64,
    pub metadata: Arc<ClusterMetadata>,
}

enum HomeRequest {
    Commit {
        snapshot: Box<ClusterMetadata>,
        reply: oneshot::Sender<Result<u64, StorageError>>,
    },
    /// Answered once every request queued before it has been handled.
    Current {
        reply: oneshot::Sender<Arc<ClusterMetadata>>,
    },
}

/// Exclusive right to mutate a home's metadata locally. Dropping it lets the
/// next local writer in.
pub struct WriteLock {
    _guard: OwnedMutexGuard<()>,
}

#[derive(Clone)]
pub struct MetadataHome {
    machine: MachineId,
    tx: mpsc::Sender<HomeRequest>,
    published: watch::Receiver<Published>,
    writers: Arc<Mutex<()>>,
}

async fn persist(path: &Path, metadata: &ClusterMetadata) -> Result<(), StorageError> {
    let encoded = serde_json::to_vec_pretty(metadata)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, encoded).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

impl MetadataHome {
    /// Start the home task for `machine`.
    ///
    /// With a `path`, any snapshot already stored there is merged into
    /// `initial` and every commit is written back before it is published.
    pub async fn open(
        machine: MachineId,
        mut initial: ClusterMetadata,
        path: Option<PathBuf>,
    ) -> Result<Self, StorageError> {
        if let Some(path) = &path {
            if tokio::fs::try_exists(path).await? {
                let raw = tokio::fs::read(path).await?;
                let stored: ClusterMetadata = serde_json::from_slice(&raw)?;
                initial.merge(&stored);
                tracing::info!(path = %path.display(), "loaded persisted metadata");
            }
            persist(path, &initial).await?;
        }

        let (tx, mut rx) = mpsc::channel::<HomeRequest>(64);
        let (pub_tx, pub_rx) = watch::channel(Published {
            seq: 0,
            metadata: Arc::new(initial),
        });

        tokio::spawn(async move {
            let mut seq = 0u64;
            while let Some(req) = rx.recv().await {
                match req {
                    HomeRequest::Commit { snapshot, reply } => {
                        let mut merged = (*pub_tx.borrow().metadata).clone();
                        merged.merge(&snapshot);
                        if let Some(path) = &path {
                            if let Err(err) = persist(path, &merged).await {
                                tracing::error!(%machine, error = %err, "failed to persist metadata");
                                let _ = reply.send(Err(err));
                                continue;
                            }
                        }
                        seq += 1;
                        pub_tx.send_replace(Published {
                            seq,
                            metadata: Arc::new(merged),
                        });
                        let _ = reply.send(Ok(seq));
                    }
                    HomeRequest::Current { reply } => {
                        let _ = reply.send(pub_tx.borrow().metadata.clone());
                    }
                }
            }
            tracing::debug!(%machine, "metadata home stopped");
        });

        Ok(Self {
            machine,
            tx,
            published: pub_rx,
            writers: Arc::new(Mutex::new(())),
        })
    }

    pub fn machine(&self) -> MachineId {
        self.machine
    }

    /// The latest committed snapshot.
    pub fn snapshot(&self) -> Arc<ClusterMetadata> {
        self.published.borrow().metadata.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Published> {
        self.published.clone()
    }

    /// Wait for the write lock and return it with a private copy of the
    /// metadata.
    ///
    /// The copy includes every commit submitted before the lock was taken,
    /// including ones whose writers were interrupted while waiting. Checks
    /// made against it hold until the lock is dropped, provided the copy is
    /// committed through this home first.
    pub async fn begin_write(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(WriteLock, ClusterMetadata), QueryError> {
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Interrupted),
            guard = self.writers.clone().lock_owned() => guard,
        };
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HomeRequest::Current { reply })
            .await
            .map_err(|_| QueryError::Internal("metadata home is not running".into()))?;
        let current = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueryError::Interrupted),
            current = rx => current
                .map_err(|_| QueryError::Internal("metadata home dropped a request".into()))?,
        };
        Ok((WriteLock { _guard: guard }, (*current).clone()))
    }

    async fn submit(
        &self,
        snapshot: ClusterMetadata,
    ) -> Result<oneshot::Receiver<Result<u64, StorageError>>, QueryError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(HomeRequest::Commit {
                snapshot: Box::new(snapshot),
                reply,
            })
            .await
            .map_err(|_| QueryError::Internal("metadata home is not running".into()))?;
        Ok(rx)
    }

    /// Merge `snapshot` into the authoritative metadata and wait until the
    /// merged result is visible to reads on this home.
    ///
    /// Cancellation only abandons the wait; a submitted snapshot may still be
    /// merged.
    pub async fn commit_and_await(
        &self,
        snapshot: ClusterMetadata,
        cancel: &CancellationToken,
    ) -> Result<(), QueryError> {
        if cancel.is_cancelled() {
            return Err(QueryError::Interrupted);
        }
        let reply = self.submit(snapshot).await?;
        let seq = tokio::select! {
            res = reply => res
                .map_err(|_| QueryError::Internal("metadata home dropped a commit".into()))??,
            _ = cancel.cancelled() => return Err(QueryError::Interrupted),
        };

        let mut rx = self.published.clone();
        loop {
            if rx.borrow_and_update().seq >= seq {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    changed.map_err(|_| QueryError::Internal("metadata home is not running".into()))?;
                }
                _ = cancel.cancelled() => return Err(QueryError::Interrupted),
            }
        }
    }

    /// Merge a snapshot received from a peer without waiting for it.
    pub async fn merge_remote(&self, snapshot: ClusterMetadata) -> Result<(), QueryError> {
        let reply = self.submit(snapshot).await?;
        reply
            .await
            .map_err(|_| QueryError::Internal("metadata home dropped a commit".into()))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{DatabaseMeta, Name};
    use crate::record::MetadataRecord;
    use std::time::Duration;
    use uuid::Uuid;

    fn with_db(meta: &ClusterMetadata, name: &str, writer: Uuid) -> (Uuid, ClusterMetadata) {
        let mut copy = meta.clone();
        let id = Uuid::new_v4();
        copy.databases.insert(
            id,
            MetadataRecord::live(DatabaseMeta::new(Name::new(name).unwrap(), writer)),
        );
        (id, copy)
    }

    #[tokio::test]
    async fn commit_is_visible_after_await() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let (id, local) = with_db(&home.snapshot(), "a", m);
        home.commit_and_await(local, &CancellationToken::new())
            .await
            .unwrap();
        assert!(home.snapshot().database(&id).is_some());
        assert_eq!(home.subscribe().borrow().seq, 1);
    }

    #[tokio::test]
    async fn concurrent_commits_keep_both_sides() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let base = home.snapshot();
        let (a, left) = with_db(&base, "a", m);
        let (b, right) = with_db(&base, "b", m);
        let cancel = CancellationToken::new();
        let (r1, r2) = tokio::join!(
            home.commit_and_await(left, &cancel),
            home.commit_and_await(right, &cancel)
        );
        r1.unwrap();
        r2.unwrap();
        let snap = home.snapshot();
        assert!(snap.database(&a).is_some() && snap.database(&b).is_some());
    }

    #[tokio::test]
    async fn cancelled_commit_reports_interrupted() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = home
            .commit_and_await(ClusterMetadata::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Interrupted));
        assert_eq!(home.subscribe().borrow().seq, 0);
    }

    #[tokio::test]
    async fn local_writers_are_serialised() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let cancel = CancellationToken::new();
        let (lock, local) = home.begin_write(&cancel).await.unwrap();

        let waiting = tokio::time::timeout(Duration::from_millis(50), home.begin_write(&cancel)).await;
        assert!(waiting.is_err(), "second writer got in while the lock was held");

        let (id, local) = with_db(&local, "a", m);
        home.commit_and_await(local, &cancel).await.unwrap();
        drop(lock);

        // The next writer starts from the committed result.
        let (_lock, next) = home.begin_write(&cancel).await.unwrap();
        assert!(next.database(&id).is_some());
    }

    #[tokio::test]
    async fn waiting_writer_can_be_interrupted() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let (_lock, _) = home.begin_write(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stop.cancel();
        });
        let err = home.begin_write(&cancel).await.err().expect("interrupted");
        assert!(matches!(err, QueryError::Interrupted));
    }

    #[tokio::test]
    async fn next_writer_sees_commit_of_interrupted_writer() {
        let m = Uuid::new_v4();
        let home = MetadataHome::open(m, ClusterMetadata::new(), None).await.unwrap();
        let id = {
            let (_lock, local) = home.begin_write(&CancellationToken::new()).await.unwrap();
            let (id, local) = with_db(&local, "a", m);
            // Queue the commit without waiting for it, as an interrupted
            // writer would.
            let _pending = home.submit(local).await.unwrap();
            id
        };
        let (_lock, next) = home.begin_write(&CancellationToken::new()).await.unwrap();
        assert!(next.database(&id).is_some());
    }

    #[tokio::test]
    async fn persisted_metadata_is_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let m = Uuid::new_v4();
        let id = {
            let home = MetadataHome::open(m, ClusterMetadata::new(), Some(path.clone()))
                .await
                .unwrap();
            let (id, local) = with_db(&home.snapshot(), "kept", m);
            home.commit_and_await(local, &CancellationToken::new())
                .await
                .unwrap();
            id
        };
        let reopened = MetadataHome::open(m, ClusterMetadata::new(), Some(path))
            .await
            .unwrap();
        assert!(reopened.snapshot().database(&id).is_some());
    }
}
