//! Listening socket plus the two pools that serve it.
//!
//! The accept pool only accepts. Every accepted stream is detached from the
//! accept pool's reactor and handed to the work pool, which builds a fresh
//! pipeline for it and runs it to completion.

use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    net::{TcpListener, TcpSocket, TcpStream},
    runtime::{Builder, Handle, Runtime},
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    config::{AcceptorConfig, PipelineConfig},
    error::AcceptorError,
    pipeline::{Pipeline, PipelineBuilder, RequestHandler},
};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_CONSECUTIVE_ACCEPT_FAILURES: u32 = 8;
/// Time given to terminated connections to unwind before the pools go away.
const SETTLE_PERIOD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Requested,
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerState {
    Open,
    Closed(CloseReason),
}

/// Observable side of a running listener.
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    state: watch::Receiver<ListenerState>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ListenerState {
        self.state.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), ListenerState::Closed(_))
    }

    /// Resolves with the reason once the listener stops accepting.
    pub fn closed(&self) -> impl Future<Output = CloseReason> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            loop {
                let current = state.borrow_and_update().clone();
                if let ListenerState::Closed(reason) = current {
                    return reason;
                }
                if state.changed().await.is_err() {
                    // The accept loop went away with its pool.
                    return CloseReason::Requested;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub forced: usize,
}

struct Pools {
    accept: Runtime,
    work: Runtime,
}

impl Pools {
    fn new(config: &AcceptorConfig) -> Result<Self, AcceptorError> {
        let accept = pool("master-accept", config.accept_threads).map_err(AcceptorError::Pool)?;
        Self::assemble(accept, pool("master-work", config.work_threads))
    }

    /// The accept pool is already running when the work pool is built, so a
    /// failed build shuts it down without blocking.
    fn assemble(accept: Runtime, work: io::Result<Runtime>) -> Result<Self, AcceptorError> {
        match work {
            Ok(work) => Ok(Self { accept, work }),
            Err(error) => {
                accept.shutdown_background();
                Err(AcceptorError::Pool(error))
            }
        }
    }

    /// Does not block, so it is safe from inside another runtime.
    fn release(self) {
        self.accept.shutdown_background();
        self.work.shutdown_background();
    }
}

fn pool(name: &'static str, threads: usize) -> io::Result<Runtime> {
    Builder::new_multi_thread()
        .worker_threads(threads.max(1))
        .thread_name(name)
        .enable_all()
        .build()
}

pub struct ConnectionAcceptor {
    pools: Option<Pools>,
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    terminate: CancellationToken,
    connections: TaskTracker,
    accept_loop: Option<JoinHandle<()>>,
    accept_errors: mpsc::UnboundedSender<io::Error>,
}

impl ConnectionAcceptor {
    pub async fn start<H: RequestHandler>(
        addr: SocketAddr,
        config: &AcceptorConfig,
        pipeline: PipelineConfig,
        handler: Arc<H>,
    ) -> Result<(Self, ListenerHandle), AcceptorError> {
        let started = Instant::now();
        let pools = Pools::new(config)?;

        let backlog = config.backlog;
        let bound = pools
            .accept
            .spawn(async move { bind(addr, backlog) })
            .await
            .map_err(|error| AcceptorError::Join(error.to_string()));
        let listener = match bound {
            Ok(Ok(listener)) => listener,
            Ok(Err(source)) => {
                pools.release();
                return Err(AcceptorError::Bind { addr, source });
            }
            Err(error) => {
                pools.release();
                return Err(error);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(local_addr) => local_addr,
            Err(source) => {
                pools.release();
                return Err(AcceptorError::Bind { addr, source });
            }
        };

        let (state_sender, state) = watch::channel(ListenerState::Open);
        let stop_accepting = CancellationToken::new();
        let terminate = CancellationToken::new();
        let connections = TaskTracker::new();
        let (accept_errors, injected) = mpsc::unbounded_channel();

        let accept_loop = AcceptLoop {
            listener,
            injected,
            work: pools.work.handle().clone(),
            pipeline,
            handler,
            stop_accepting: stop_accepting.clone(),
            terminate: terminate.clone(),
            connections: connections.clone(),
        };
        let accept_loop = pools.accept.spawn(accept_loop.run(state_sender));

        info!(
            %local_addr,
            accept_threads = config.accept_threads,
            work_threads = config.work_threads,
            startup_ms = started.elapsed().as_millis() as u64,
            "Listening for control requests"
        );

        let acceptor = Self {
            pools: Some(pools),
            local_addr,
            stop_accepting,
            terminate,
            connections,
            accept_loop: Some(accept_loop),
            accept_errors,
        };
        Ok((
            acceptor,
            ListenerHandle {
                local_addr,
                state,
            },
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Hands `error` to the accept loop as if `accept` had returned it.
    #[doc(hidden)]
    pub fn inject_accept_error(&self, error: io::Error) {
        let _ = self.accept_errors.send(error);
    }

    /// Stops accepting, lets in-flight connections run for up to `grace`,
    /// then terminates the rest and releases both pools. Connections idle
    /// between requests close as soon as the drain starts.
    pub async fn stop(mut self, grace: Duration) -> DrainReport {
        self.stop_accepting.cancel();
        if let Some(accept_loop) = self.accept_loop.take() {
            if let Err(error) = accept_loop.await {
                warn!(%error, "Accept loop ended abnormally");
            }
        }

        self.connections.close();
        let in_flight = self.connections.len();
        info!(in_flight, ?grace, "Draining connections");

        let forced = match tokio::time::timeout(grace, self.connections.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let forced = self.connections.len();
                warn!(forced, "Grace period elapsed, terminating connections");
                self.terminate.cancel();
                if tokio::time::timeout(SETTLE_PERIOD, self.connections.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        remaining = self.connections.len(),
                        "Connections still unwinding, releasing pools anyway"
                    );
                }
                forced
            }
        };

        if let Some(pools) = self.pools.take() {
            pools.release();
        }
        info!(completed = in_flight.saturating_sub(forced), forced, "Listener stopped");

        DrainReport {
            completed: in_flight.saturating_sub(forced),
            forced,
        }
    }
}

impl Drop for ConnectionAcceptor {
    fn drop(&mut self) {
        self.stop_accepting.cancel();
        self.terminate.cancel();
        if let Some(pools) = self.pools.take() {
            pools.release();
        }
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Failures that concern a single incoming connection, not the listener.
fn is_connection_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

struct AcceptLoop<H> {
    listener: TcpListener,
    injected: mpsc::UnboundedReceiver<io::Error>,
    work: Handle,
    pipeline: PipelineConfig,
    handler: Arc<H>,
    stop_accepting: CancellationToken,
    terminate: CancellationToken,
    connections: TaskTracker,
}

impl<H: RequestHandler> AcceptLoop<H> {
    async fn run(mut self, state: watch::Sender<ListenerState>) {
        let mut consecutive_failures = 0;

        let reason = 'accept: loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop_accepting.cancelled() => break 'accept CloseReason::Requested,
                Some(error) = self.injected.recv() => Err(error),
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    consecutive_failures = 0;
                    self.hand_off(stream, peer);
                }
                Err(error) if is_connection_error(&error) => {
                    debug!(%error, "Incoming connection failed before it was accepted");
                }
                Err(error) => {
                    consecutive_failures += 1;
                    error!(%error, consecutive_failures, "Accept failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_ACCEPT_FAILURES {
                        break 'accept CloseReason::Unexpected(error.to_string());
                    }
                    tokio::select! {
                        _ = self.stop_accepting.cancelled() => break 'accept CloseReason::Requested,
                        _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                    }
                }
            }
        };

        drop(self.listener);
        match &reason {
            CloseReason::Requested => info!("Listener closed"),
            CloseReason::Unexpected(cause) => error!(%cause, "Listener closed unexpectedly"),
        }
        let _ = state.send(ListenerState::Closed(reason));
    }

    fn hand_off(&self, stream: TcpStream, peer: SocketAddr) {
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%peer, %error, "Failed to detach accepted connection");
                return;
            }
        };
        let pipeline = PipelineBuilder::build(&self.pipeline);
        let connection = serve_connection(
            stream,
            peer,
            pipeline,
            self.handler.clone(),
            self.stop_accepting.clone(),
            self.terminate.clone(),
        );
        self.connections.spawn_on(connection, &self.work);
    }
}

async fn serve_connection<H: RequestHandler>(
    stream: std::net::TcpStream,
    peer: SocketAddr,
    pipeline: Pipeline,
    handler: Arc<H>,
    drain: CancellationToken,
    terminate: CancellationToken,
) {
    let stream = match TcpStream::from_std(stream) {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%peer, %error, "Failed to register connection with the work pool");
            return;
        }
    };
    if let Err(error) = stream.set_nodelay(true) {
        debug!(%peer, %error, "Failed to set TCP_NODELAY");
    }
    debug!(%peer, "Connection accepted");

    tokio::select! {
        _ = terminate.cancelled() => debug!(%peer, "Connection terminated by shutdown"),
        served = pipeline.serve_until_drained(stream, handler.as_ref(), drain) => match served {
            Ok(()) => debug!(%peer, "Connection closed"),
            Err(error) => debug!(%peer, %error, "Connection closed with error"),
        },
    }
}
