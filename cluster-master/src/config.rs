use std::{net::IpAddr, time::Duration};

use clap::{ArgAction, Parser};
use cluster_core::{ClusterEndpoint, WORKER_REGISTRATION_PATH};
use serde::Deserialize;

pub const DEFAULT_LISTEN_PORT: u16 = 8888;
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct MasterConfig {
    // Registry to watch and the address the control listener binds to.
    pub endpoint: ClusterEndpoint,
    pub acceptor: AcceptorConfig,
    pub pipeline: PipelineConfig,
    pub watcher: WatcherConfig,
    // How long in-flight connections may run once shutdown begins.
    pub grace_period: Duration,
    // Workers registered in the embedded registry before the watch starts.
    pub seed_workers: Vec<String>,
}

/// Sizing of the two pools owned by the connection acceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptorConfig {
    pub accept_threads: usize,
    pub work_threads: usize,
    pub backlog: u32,
}

impl Default for AcceptorConfig {
    fn default() -> Self {
        Self {
            accept_threads: 1,
            work_threads: num_cpus::get() * 2,
            backlog: 1024,
        }
    }
}

/// Options that shape the per-connection pipeline.
///
/// Unknown keys are ignored when deserializing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub compression_enabled: bool,
    pub aggregation_enabled: bool,
    pub max_aggregated_content_length: usize,
    pub compression_min_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            compression_enabled: true,
            aggregation_enabled: true,
            max_aggregated_content_length: DEFAULT_MAX_CONTENT_LENGTH,
            compression_min_size: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub path: String,
    // Consecutive reconnect attempts before the watch is declared lost.
    pub max_reconnect_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    // Capacity of the event queue between the read loop and subscribers.
    pub event_buffer: usize,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            path: WORKER_REGISTRATION_PATH.to_string(),
            max_reconnect_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            event_buffer: 1024,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "cluster-master", about = "Cluster master node", version)]
pub struct Args {
    #[arg(long, env = "MASTER_LISTEN_PORT", default_value_t = DEFAULT_LISTEN_PORT)]
    pub listen_port: u16,

    #[arg(long, env = "MASTER_BIND_IP", default_value = "0.0.0.0")]
    pub bind_ip: IpAddr,

    #[arg(long, env = "MASTER_REGISTRY_ADDRESS", default_value = "127.0.0.1:2181")]
    pub registry_address: String,

    #[arg(long, env = "MASTER_ACCEPT_THREADS", default_value_t = 1)]
    pub accept_threads: usize,

    /// Defaults to twice the number of CPUs.
    #[arg(long, env = "MASTER_WORK_THREADS")]
    pub work_threads: Option<usize>,

    #[arg(long, env = "MASTER_COMPRESSION", default_value_t = true, action = ArgAction::Set)]
    pub compression: bool,

    #[arg(long, env = "MASTER_AGGREGATION", default_value_t = true, action = ArgAction::Set)]
    pub aggregation: bool,

    #[arg(long, env = "MASTER_MAX_CONTENT_LENGTH", default_value_t = DEFAULT_MAX_CONTENT_LENGTH)]
    pub max_content_length: usize,

    #[arg(long, env = "MASTER_GRACE_PERIOD_MS", default_value_t = 5000)]
    pub grace_period_ms: u64,

    #[arg(long, env = "MASTER_WATCH_PATH", default_value = WORKER_REGISTRATION_PATH)]
    pub watch_path: String,

    /// Workers to pre-register in the embedded registry.
    #[arg(long = "seed-worker", env = "MASTER_SEED_WORKERS", value_delimiter = ',')]
    pub seed_workers: Vec<String>,
}

impl Args {
    pub fn into_config(self) -> MasterConfig {
        let acceptor_defaults = AcceptorConfig::default();
        let pipeline_defaults = PipelineConfig::default();

        MasterConfig {
            endpoint: ClusterEndpoint::new(self.registry_address, self.listen_port)
                .with_bind_ip(self.bind_ip),
            acceptor: AcceptorConfig {
                accept_threads: self.accept_threads.max(1),
                work_threads: self
                    .work_threads
                    .unwrap_or(acceptor_defaults.work_threads)
                    .max(1),
                backlog: acceptor_defaults.backlog,
            },
            pipeline: PipelineConfig {
                compression_enabled: self.compression,
                aggregation_enabled: self.aggregation,
                max_aggregated_content_length: self.max_content_length,
                ..pipeline_defaults
            },
            watcher: WatcherConfig {
                path: self.watch_path,
                ..WatcherConfig::default()
            },
            grace_period: Duration::from_millis(self.grace_period_ms),
            seed_workers: self.seed_workers,
        }
    }
}
