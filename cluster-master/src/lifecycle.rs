//! Startup and shutdown orchestration for the master node.
//!
//! ```text
//! Created -> WatchStarting -> WatchActive -> ListenerStarting -> Serving
//!                 |                               |                |
//!                 v                               v                v
//!               Failed                          Failed          Draining -> Stopped
//! ```
//!
//! The membership watch is always active before the listener accepts its
//! first connection, and it is released after the listener has drained.

use std::{fmt::Display, sync::Arc, time::Duration};

use cluster_core::{ClusterEndpoint, CoordinationRegistry};
use tokio::sync::watch;
use tracing::{error, info};

use crate::{
    acceptor::{CloseReason, ConnectionAcceptor, DrainReport, ListenerHandle},
    config::{AcceptorConfig, PipelineConfig},
    error::LifecycleError,
    membership::{MembershipWatcher, WatchHandle},
    pipeline::RequestHandler,
    shutdown::{ShutdownManager, ShutdownReason},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    WatchStarting,
    WatchActive,
    ListenerStarting,
    Serving,
    Draining,
    Stopped,
    Failed,
}

impl Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LifecycleState::Created => "created",
            LifecycleState::WatchStarting => "starting the membership watch",
            LifecycleState::WatchActive => "watching membership",
            LifecycleState::ListenerStarting => "starting the listener",
            LifecycleState::Serving => "serving",
            LifecycleState::Draining => "draining",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        })
    }
}

pub struct MasterLifecycle<R, H> {
    endpoint: ClusterEndpoint,
    watcher: MembershipWatcher<R>,
    acceptor_config: AcceptorConfig,
    pipeline_config: PipelineConfig,
    handler: Arc<H>,
    state: watch::Sender<LifecycleState>,
    history: Vec<LifecycleState>,
    watch: Option<WatchHandle>,
    acceptor: Option<ConnectionAcceptor>,
    listener: Option<ListenerHandle>,
}

impl<R: CoordinationRegistry, H: RequestHandler> MasterLifecycle<R, H> {
    pub fn new(
        endpoint: ClusterEndpoint,
        watcher: MembershipWatcher<R>,
        acceptor_config: AcceptorConfig,
        pipeline_config: PipelineConfig,
        handler: H,
    ) -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self {
            endpoint,
            watcher,
            acceptor_config,
            pipeline_config,
            handler: Arc::new(handler),
            state,
            history: vec![LifecycleState::Created],
            watch: None,
            acceptor: None,
            listener: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }

    pub fn watcher(&self) -> &MembershipWatcher<R> {
        &self.watcher
    }

    pub fn listener(&self) -> Option<&ListenerHandle> {
        self.listener.as_ref()
    }

    pub fn active_connections(&self) -> usize {
        self.acceptor
            .as_ref()
            .map_or(0, ConnectionAcceptor::active_connections)
    }

    fn transition(&mut self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        self.history.push(next);
        info!(from = ?previous, to = ?next, "Lifecycle transition");
    }

    fn require(&self, expected: LifecycleState, operation: &'static str) -> Result<(), LifecycleError> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { state, operation })
        }
    }

    /// Establishes the membership watch.
    pub async fn pre_start(&mut self) -> Result<(), LifecycleError> {
        self.require(LifecycleState::Created, "pre-start")?;
        self.transition(LifecycleState::WatchStarting);

        match self.watcher.start_watch(&self.endpoint).await {
            Ok(handle) => {
                self.watch = Some(handle);
                self.transition(LifecycleState::WatchActive);
                Ok(())
            }
            Err(error) => {
                error!(%error, "Membership watch failed to start");
                self.transition(LifecycleState::Failed);
                Err(LifecycleError::Watch(error))
            }
        }
    }

    /// Binds the listener. On failure the membership watch is released
    /// before returning.
    pub async fn start(&mut self) -> Result<(), LifecycleError> {
        self.require(LifecycleState::WatchActive, "start")?;
        self.transition(LifecycleState::ListenerStarting);

        let started = ConnectionAcceptor::start(
            self.endpoint.listen_addr(),
            &self.acceptor_config,
            self.pipeline_config.clone(),
            self.handler.clone(),
        )
        .await;

        match started {
            Ok((acceptor, listener)) => {
                self.acceptor = Some(acceptor);
                self.listener = Some(listener);
                self.transition(LifecycleState::Serving);
                Ok(())
            }
            Err(error) => {
                error!(%error, "Listener failed to start");
                self.release_watch().await;
                self.transition(LifecycleState::Failed);
                Err(LifecycleError::Listener(error))
            }
        }
    }

    /// Waits for the first of: the external shutdown signal, an unexpected
    /// listener closure, or loss of the membership watch.
    pub async fn wait_for_shutdown(
        &mut self,
        shutdown: ShutdownManager<ShutdownReason>,
    ) -> Result<ShutdownReason, LifecycleError> {
        self.require(LifecycleState::Serving, "wait for shutdown")?;

        let mut bridges = Vec::new();
        if let Some(listener) = &self.listener {
            let closed = listener.closed();
            let trigger = shutdown.shutdown.clone();
            bridges.push(tokio::spawn(async move {
                if let CloseReason::Unexpected(cause) = closed.await {
                    trigger.trigger(ShutdownReason::ListenerClosed(cause)).await;
                }
            }));
        }
        if let Some(watch) = &self.watch {
            let lost = watch.lost();
            let trigger = shutdown.shutdown.clone();
            bridges.push(tokio::spawn(async move {
                lost.await;
                trigger.trigger(ShutdownReason::MembershipLost).await;
            }));
        }

        let reason = shutdown
            .await_shutdown()
            .await
            .unwrap_or(ShutdownReason::Requested);
        for bridge in bridges {
            bridge.abort();
        }

        info!(?reason, "Shutdown initiated");
        self.transition(LifecycleState::Draining);
        Ok(reason)
    }

    /// Drains the listener within `grace`, then releases the watch.
    pub async fn shutdown(&mut self, grace: Duration) -> Result<DrainReport, LifecycleError> {
        self.require(LifecycleState::Draining, "shut down")?;

        let report = match self.acceptor.take() {
            Some(acceptor) => acceptor.stop(grace).await,
            None => DrainReport::default(),
        };
        self.release_watch().await;

        self.transition(LifecycleState::Stopped);
        Ok(report)
    }

    /// Runs the whole lifecycle, returning why the master stopped.
    pub async fn run(
        &mut self,
        shutdown: ShutdownManager<ShutdownReason>,
        grace: Duration,
    ) -> Result<ShutdownReason, LifecycleError> {
        self.pre_start().await?;
        self.start().await?;
        let reason = self.wait_for_shutdown(shutdown).await?;
        let report = self.shutdown(grace).await?;
        info!(
            ?reason,
            completed = report.completed,
            forced = report.forced,
            "Master stopped"
        );
        Ok(reason)
    }

    async fn release_watch(&mut self) {
        if let Some(mut handle) = self.watch.take() {
            self.watcher.stop_watch(&mut handle).await;
        }
    }
}
