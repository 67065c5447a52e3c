//! Membership watch against the coordination registry.
//!
//! The watcher turns registry child changes under the worker path into
//! `MembershipEvent`s. Events go out on a bounded broadcast channel so the
//! read loop never waits on a subscriber. The published member set is kept
//! next to the channel; a subscriber that falls behind catches up from it
//! instead of losing the events it missed.

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    sync::Arc,
    time::Duration,
};

use cluster_core::{
    ChildEvent, ChildStream, ChildWatch, ClusterEndpoint, CoordinationRegistry, MembershipEvent,
    MembershipKind, WorkerId,
};
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{config::WatcherConfig, error::WatchError};

pub struct MembershipWatcher<R> {
    registry: Arc<R>,
    config: WatcherConfig,
    publisher: Publisher,
}

/// A live subscription created by [`MembershipWatcher::start_watch`].
///
/// Dropping the handle cancels the read loop.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    lost: watch::Receiver<bool>,
}

impl WatchHandle {
    pub fn is_active(&self) -> bool {
        self.task.is_some() && !self.is_lost()
    }

    /// True once reconnect attempts were exhausted.
    pub fn is_lost(&self) -> bool {
        *self.lost.borrow()
    }

    /// Resolves when the watch is lost. Never resolves for a watch that is
    /// stopped normally.
    pub fn lost(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut lost = self.lost.clone();
        async move {
            let declared = lost.wait_for(|lost| *lost).await.is_ok();
            if !declared {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Ordered membership events for one subscriber.
///
/// Per worker, events alternate `Joined`/`Left`. After falling behind the
/// broadcast buffer the subscription emits the difference between what it
/// delivered and the current member set, then carries on with live events.
pub struct MembershipSubscription {
    events: broadcast::Receiver<MembershipEvent>,
    members: Arc<Mutex<HashSet<WorkerId>>>,
    delivered: HashSet<WorkerId>,
    backlog: VecDeque<MembershipEvent>,
}

impl MembershipSubscription {
    /// Next event, or `None` once the watcher is gone.
    pub async fn recv(&mut self) -> Option<MembershipEvent> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            match self.events.recv().await {
                Ok(event) => {
                    if self.record(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Membership subscriber lagged, catching up from member set");
                    self.catch_up();
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn record(&mut self, event: &MembershipEvent) -> bool {
        match event.kind {
            MembershipKind::Joined => self.delivered.insert(event.worker_id.clone()),
            MembershipKind::Left => self.delivered.remove(&event.worker_id),
        }
    }

    fn catch_up(&mut self) {
        let current = self.members.lock().clone();

        let mut departed: Vec<_> = self.delivered.difference(&current).cloned().collect();
        departed.sort();
        let mut arrived: Vec<_> = current.difference(&self.delivered).cloned().collect();
        arrived.sort();

        self.backlog.extend(departed.into_iter().map(MembershipEvent::left));
        self.backlog.extend(arrived.into_iter().map(MembershipEvent::joined));
        self.delivered = current;
    }
}

/// Member set and event channel, updated together under one lock so a
/// subscriber never sees an event that disagrees with the set.
#[derive(Clone)]
struct Publisher {
    members: Arc<Mutex<HashSet<WorkerId>>>,
    events: broadcast::Sender<MembershipEvent>,
}

impl Publisher {
    fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            members: Arc::new(Mutex::new(HashSet::new())),
            events,
        }
    }

    fn subscribe(&self) -> MembershipSubscription {
        let members = self.members.lock();
        MembershipSubscription {
            events: self.events.subscribe(),
            members: self.members.clone(),
            delivered: members.clone(),
            backlog: VecDeque::new(),
        }
    }

    fn snapshot(&self) -> HashSet<WorkerId> {
        self.members.lock().clone()
    }

    /// Publishes `event` unless it repeats what the member set already says.
    fn publish(&self, event: MembershipEvent) {
        let mut members = self.members.lock();
        let changed = match event.kind {
            MembershipKind::Joined => members.insert(event.worker_id.clone()),
            MembershipKind::Left => members.remove(&event.worker_id),
        };
        if changed {
            debug!(worker_id = %event.worker_id, kind = ?event.kind, "Membership event");
            // No subscribers is not an error.
            let _ = self.events.send(event);
        }
    }

    /// Brings the member set in line with `children`, departures first.
    fn reconcile(&self, children: Vec<String>) -> (usize, usize) {
        let current: HashSet<WorkerId> = children.into_iter().map(WorkerId::from).collect();
        let known = self.snapshot();

        let mut departed: Vec<_> = known.difference(&current).cloned().collect();
        departed.sort();
        let mut arrived: Vec<_> = current.difference(&known).cloned().collect();
        arrived.sort();
        let counts = (departed.len(), arrived.len());

        for worker_id in departed {
            self.publish(MembershipEvent::left(worker_id));
        }
        for worker_id in arrived {
            self.publish(MembershipEvent::joined(worker_id));
        }
        counts
    }
}

impl<R: CoordinationRegistry> MembershipWatcher<R> {
    pub fn new(registry: R, config: WatcherConfig) -> Self {
        Self::with_shared_registry(Arc::new(registry), config)
    }

    pub fn with_shared_registry(registry: Arc<R>, config: WatcherConfig) -> Self {
        let publisher = Publisher::new(config.event_buffer);
        Self {
            registry,
            config,
            publisher,
        }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Workers present as of the last published event, ordered by id.
    pub fn members(&self) -> Vec<WorkerId> {
        let mut members: Vec<_> = self.publisher.snapshot().into_iter().collect();
        members.sort();
        members
    }

    /// Receives every event emitted after this call.
    pub fn subscribe(&self) -> MembershipSubscription {
        self.publisher.subscribe()
    }

    /// Invokes `callback` for every event emitted after this call, in order.
    pub fn on_event<F>(&self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(MembershipEvent) + Send + 'static,
    {
        let mut events = self.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                callback(event);
            }
        })
    }

    /// Establishes the watch. Fails fast if the registry cannot be reached
    /// on this first attempt.
    pub async fn start_watch(&self, endpoint: &ClusterEndpoint) -> Result<WatchHandle, WatchError> {
        let address = endpoint.registry_address.clone();
        let ChildWatch { children, updates } = self
            .registry
            .watch_children(&address, &self.config.path)
            .await
            .map_err(|source| WatchError::RegistryUnavailable {
                address: address.clone(),
                source,
            })?;

        self.publisher.reconcile(children);

        info!(
            path = %self.config.path,
            %address,
            workers = self.publisher.snapshot().len(),
            "Membership watch established"
        );

        let cancel = CancellationToken::new();
        let (lost_sender, lost) = watch::channel(false);
        let read_loop = ReadLoop {
            registry: self.registry.clone(),
            address,
            config: self.config.clone(),
            publisher: self.publisher.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(read_loop.run(updates, lost_sender));

        Ok(WatchHandle {
            cancel,
            task: Some(task),
            lost,
        })
    }

    /// Releases the subscription. Safe to call more than once and after the
    /// registry connection is gone.
    pub async fn stop_watch(&self, handle: &mut WatchHandle) {
        handle.cancel.cancel();
        if let Some(task) = handle.task.take() {
            if let Err(error) = task.await {
                warn!(%error, "Membership read loop ended abnormally");
            }
            info!(path = %self.config.path, "Membership watch stopped");
        }
    }
}

enum Reconnect {
    Connected(ChildWatch),
    Cancelled,
    Exhausted,
}

struct ReadLoop<R> {
    registry: Arc<R>,
    address: String,
    config: WatcherConfig,
    publisher: Publisher,
    cancel: CancellationToken,
}

impl<R: CoordinationRegistry> ReadLoop<R> {
    async fn run(self, mut updates: ChildStream, lost: watch::Sender<bool>) {
        loop {
            let failure = loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    update = updates.next() => match update {
                        Some(Ok(ChildEvent::Created(child))) => {
                            self.publisher.publish(MembershipEvent::joined(WorkerId::from(child)));
                        }
                        Some(Ok(ChildEvent::Deleted(child))) => {
                            self.publisher.publish(MembershipEvent::left(WorkerId::from(child)));
                        }
                        Some(Err(error)) => break error.to_string(),
                        None => break "watch stream ended".to_string(),
                    }
                }
            };

            warn!(path = %self.config.path, %failure, "Membership watch interrupted, reconnecting");
            drop(updates);

            match self.reconnect().await {
                Reconnect::Connected(watch) => {
                    let (departed, arrived) = self.publisher.reconcile(watch.children);
                    debug!(departed, arrived, "Membership resync after reconnect");
                    updates = watch.updates;
                }
                Reconnect::Cancelled => return,
                Reconnect::Exhausted => {
                    error!(
                        path = %self.config.path,
                        attempts = self.config.max_reconnect_attempts,
                        "Membership watch lost, reconnect attempts exhausted"
                    );
                    let _ = lost.send(true);
                    return;
                }
            }
        }
    }

    async fn reconnect(&self) -> Reconnect {
        for attempt in 1..=self.config.max_reconnect_attempts {
            let backoff = self.backoff(attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => return Reconnect::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }

            let watched = tokio::select! {
                _ = self.cancel.cancelled() => return Reconnect::Cancelled,
                watched = self.registry.watch_children(&self.address, &self.config.path) => watched,
            };

            match watched {
                Ok(watch) => {
                    info!(attempt, "Membership watch re-established");
                    return Reconnect::Connected(watch);
                }
                Err(error) => warn!(attempt, ?backoff, %error, "Membership reconnect failed"),
            }
        }
        Reconnect::Exhausted
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.config
            .initial_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }
}
