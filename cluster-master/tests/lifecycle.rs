use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::Bytes;
use cluster_core::{
    ClusterEndpoint, InMemoryRegistry, MembershipKind, WorkerId, WORKER_REGISTRATION_PATH,
};
use cluster_master::{
    handler_fn, AcceptorConfig, ClusterStatusHandler, ClusterView, HandlerError, LifecycleError,
    LifecycleState, MasterLifecycle, MembershipWatcher, PipelineConfig, RequestBody,
    RequestHandler, ShutdownManager, ShutdownReason, WatcherConfig,
};
use http::{Request, Response};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

fn endpoint(port: u16) -> ClusterEndpoint {
    ClusterEndpoint::new("registry.local:2181", port).with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn fast_watcher() -> WatcherConfig {
    WatcherConfig {
        max_reconnect_attempts: 3,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        ..WatcherConfig::default()
    }
}

fn small_pools() -> AcceptorConfig {
    AcceptorConfig {
        accept_threads: 1,
        work_threads: 2,
        backlog: 64,
    }
}

fn master<H: RequestHandler>(
    registry: &InMemoryRegistry,
    port: u16,
    handler: H,
) -> MasterLifecycle<InMemoryRegistry, H> {
    MasterLifecycle::new(
        endpoint(port),
        MembershipWatcher::new(registry.clone(), fast_watcher()),
        small_pools(),
        PipelineConfig::default(),
        handler,
    )
}

fn ok_handler() -> impl RequestHandler {
    handler_fn(|_request: Request<RequestBody>| async {
        Ok::<_, HandlerError>(Response::new(Bytes::from_static(b"ok")))
    })
}

async fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: master\r\nConnection: close\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await;
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn test_unreachable_registry_never_serves() {
    let registry = InMemoryRegistry::new();
    registry.set_reachable(false);
    let mut master = master(&registry, 0, ok_handler());

    let result = master.run(ShutdownManager::new(), Duration::from_secs(1)).await;

    let error = result.unwrap_err();
    assert!(matches!(error, LifecycleError::Watch(_)));
    assert!(error.to_string().starts_with("membership watch failed to start"));
    assert_eq!(master.state(), LifecycleState::Failed);
    assert!(!master.history().contains(&LifecycleState::Serving));
    assert!(!master.history().contains(&LifecycleState::ListenerStarting));
}

#[tokio::test]
async fn test_port_in_use_releases_watch_exactly_once() {
    let occupied = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = occupied.local_addr().unwrap().port();
    let registry = InMemoryRegistry::new();
    let mut master = master(&registry, port, ok_handler());

    let result = master.run(ShutdownManager::new(), Duration::from_secs(1)).await;

    let error = result.unwrap_err();
    assert!(matches!(error, LifecycleError::Listener(_)));
    assert!(error.to_string().starts_with("listener failed to start"));
    assert_eq!(master.state(), LifecycleState::Failed);
    assert!(!master.history().contains(&LifecycleState::Serving));
    assert_eq!(registry.watches_opened(), 1);
    assert_eq!(registry.watches_released(), 1);
    assert_eq!(registry.active_watches(), 0);
}

#[tokio::test]
async fn test_serves_cluster_status_then_stops() {
    let registry = InMemoryRegistry::new();
    registry.register(WORKER_REGISTRATION_PATH, "w2");
    registry.register(WORKER_REGISTRATION_PATH, "w1");

    let view = ClusterView::new();
    let mut master = master(&registry, 0, ClusterStatusHandler::new(view.clone()));
    let _updates = view.follow(master.watcher().subscribe());

    master.pre_start().await.unwrap();
    master.start().await.unwrap();
    assert_eq!(master.state(), LifecycleState::Serving);
    let addr = master.listener().unwrap().local_addr();

    tokio::time::timeout(Duration::from_secs(2), async {
        while view.len().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("view never saw the seeded workers");

    let health = get(addr, "/health").await;
    assert!(health.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(health.ends_with("ok"));

    let workers = get(addr, "/cluster/workers").await;
    let body = workers.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["workers"][0]["worker_id"], "w1");
    assert_eq!(json["workers"][1]["worker_id"], "w2");

    let shutdown = ShutdownManager::new();
    shutdown.shutdown.trigger(ShutdownReason::Requested).await;
    let reason = master.wait_for_shutdown(shutdown).await.unwrap();
    assert_eq!(reason, ShutdownReason::Requested);
    assert_eq!(master.state(), LifecycleState::Draining);

    master.shutdown(Duration::from_secs(1)).await.unwrap();
    assert_eq!(master.state(), LifecycleState::Stopped);
    assert!(master.listener().unwrap().is_closed());
    assert_eq!(registry.active_watches(), 0);
    assert_eq!(
        master.history(),
        &[
            LifecycleState::Created,
            LifecycleState::WatchStarting,
            LifecycleState::WatchActive,
            LifecycleState::ListenerStarting,
            LifecycleState::Serving,
            LifecycleState::Draining,
            LifecycleState::Stopped,
        ]
    );
}

#[tokio::test]
async fn test_lost_membership_forces_drain() {
    let registry = InMemoryRegistry::new();
    let mut master = master(&registry, 0, ok_handler());
    let mut states = master.subscribe_state();

    let break_registry = async {
        let _ = states
            .wait_for(|state| *state == LifecycleState::Serving)
            .await;
        registry.set_reachable(false);
        registry.disconnect();
    };
    let (result, ()) = tokio::join!(
        master.run(ShutdownManager::new(), Duration::from_secs(1)),
        break_registry
    );

    assert_eq!(result.unwrap(), ShutdownReason::MembershipLost);
    assert_eq!(master.state(), LifecycleState::Stopped);
    assert_eq!(registry.active_watches(), 0);
}

#[tokio::test]
async fn test_external_signal_stops_the_master() {
    let registry = InMemoryRegistry::new();
    let mut master = master(&registry, 0, ok_handler());
    let mut states = master.subscribe_state();
    let shutdown = ShutdownManager::new();
    let trigger = shutdown.shutdown.clone();

    let signal = async {
        let _ = states
            .wait_for(|state| *state == LifecycleState::Serving)
            .await;
        trigger.trigger(ShutdownReason::Signal).await;
    };
    let (result, ()) = tokio::join!(master.run(shutdown, Duration::from_secs(1)), signal);

    assert_eq!(result.unwrap(), ShutdownReason::Signal);
    assert_eq!(master.state(), LifecycleState::Stopped);
    assert_eq!(registry.watches_released(), 1);
}

#[tokio::test]
async fn test_shutdown_drains_within_grace() {
    let handler = handler_fn(|request: Request<RequestBody>| async move {
        let delay = if request.uri().path() == "/slow" {
            Duration::from_secs(10)
        } else {
            Duration::from_millis(300)
        };
        tokio::time::sleep(delay).await;
        Ok::<_, HandlerError>(Response::new(Bytes::from_static(b"done")))
    });
    let registry = InMemoryRegistry::new();
    let mut master = master(&registry, 0, handler);
    master.pre_start().await.unwrap();
    master.start().await.unwrap();
    let addr = master.listener().unwrap().local_addr();

    let fast: Vec<_> = (0..3).map(|_| tokio::spawn(get(addr, "/fast"))).collect();
    let slow: Vec<_> = (0..2).map(|_| tokio::spawn(get(addr, "/slow"))).collect();

    tokio::time::timeout(Duration::from_secs(2), async {
        while master.active_connections() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("connections were not accepted");

    let shutdown = ShutdownManager::new();
    shutdown.shutdown.trigger(ShutdownReason::Requested).await;
    master.wait_for_shutdown(shutdown).await.unwrap();

    let grace = Duration::from_secs(1);
    let started = Instant::now();
    let report = master.shutdown(grace).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(master.state(), LifecycleState::Stopped);
    assert_eq!(report.forced, 2);
    assert!(elapsed < grace + Duration::from_millis(500), "{elapsed:?}");

    for client in fast {
        assert!(client.await.unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
    }
    for client in slow {
        assert!(!client.await.unwrap().contains("200 OK"));
    }
}

#[tokio::test]
async fn test_membership_order_is_preserved_while_serving() {
    let registry = InMemoryRegistry::new();
    let mut master = master(&registry, 0, ok_handler());
    let mut events = master.watcher().subscribe();

    master.pre_start().await.unwrap();
    master.start().await.unwrap();

    let workers: Vec<String> = (1..=5).map(|n| format!("w{n}")).collect();
    for _ in 0..3 {
        for worker in &workers {
            registry.register(WORKER_REGISTRATION_PATH, worker);
        }
        for worker in workers.iter().rev() {
            registry.deregister(WORKER_REGISTRATION_PATH, worker);
        }
    }

    let mut seen: HashMap<WorkerId, Vec<MembershipKind>> = HashMap::new();
    for _ in 0..30 {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("missing membership event")
            .unwrap();
        seen.entry(event.worker_id).or_default().push(event.kind);
    }

    let expected = [MembershipKind::Joined, MembershipKind::Left].repeat(3);
    assert_eq!(seen.len(), 5);
    for worker in &workers {
        assert_eq!(seen[&WorkerId::from(worker.as_str())], expected, "{worker}");
    }

    let shutdown = ShutdownManager::new();
    shutdown.shutdown.trigger(ShutdownReason::Requested).await;
    master.wait_for_shutdown(shutdown).await.unwrap();
    master.shutdown(Duration::from_millis(200)).await.unwrap();
}
