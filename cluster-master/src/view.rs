use std::{collections::HashMap, sync::Arc, time::SystemTime};

use cluster_core::{MembershipEvent, MembershipKind, WorkerId};
use tokio::{sync::RwLock, task::JoinHandle};
use tracing::info;

use crate::membership::MembershipSubscription;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub worker_id: WorkerId,
    pub joined_at: SystemTime,
}

/// Live set of workers currently in the cluster, fed by membership events.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    workers: Arc<RwLock<HashMap<WorkerId, WorkerInfo>>>,
}

impl ClusterView {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn apply(&self, event: &MembershipEvent) {
        let mut workers = self.workers.write().await;
        match event.kind {
            MembershipKind::Joined => {
                workers.insert(
                    event.worker_id.clone(),
                    WorkerInfo {
                        worker_id: event.worker_id.clone(),
                        joined_at: event.observed_at,
                    },
                );
            }
            MembershipKind::Left => {
                workers.remove(&event.worker_id);
            }
        }
        info!(
            worker_id = %event.worker_id,
            kind = ?event.kind,
            workers = workers.len(),
            "Cluster view updated"
        );
    }

    /// Current workers ordered by id.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let mut workers: Vec<_> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub async fn contains(&self, worker_id: &WorkerId) -> bool {
        self.workers.read().await.contains_key(worker_id)
    }

    pub async fn len(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Applies every event from `events` until the watcher goes away.
    pub fn follow(&self, mut events: MembershipSubscription) -> JoinHandle<()> {
        let view = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                view.apply(&event).await;
            }
        })
    }
}
