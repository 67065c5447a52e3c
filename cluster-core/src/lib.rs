use std::{
  fmt::{Debug, Display},
  net::{IpAddr, Ipv4Addr, SocketAddr},
  sync::Arc,
  time::SystemTime,
};

pub mod registry;

pub use registry::{
  ChildEvent, ChildStream, ChildWatch, CoordinationRegistry, InMemoryRegistry, RegistryError,
};

/// Namespace path under which worker nodes register themselves.
pub const WORKER_REGISTRATION_PATH: &str = "/cluster/workers";

#[derive(Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
  pub fn new(id: impl AsRef<str>) -> Self {
    Self(Arc::from(id.as_ref()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl Debug for WorkerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "worker:{}", self.0)
  }
}

impl Display for WorkerId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for WorkerId {
  fn from(id: &str) -> Self {
    Self::new(id)
  }
}

impl From<String> for WorkerId {
  fn from(id: String) -> Self {
    Self(Arc::from(id))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipKind {
  Joined,
  Left,
}

/// A worker joining or leaving the cluster, as observed by the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipEvent {
  pub worker_id: WorkerId,
  pub kind: MembershipKind,
  pub observed_at: SystemTime,
}

impl MembershipEvent {
  pub fn joined(worker_id: WorkerId) -> Self {
    Self {
      worker_id,
      kind: MembershipKind::Joined,
      observed_at: SystemTime::now(),
    }
  }

  pub fn left(worker_id: WorkerId) -> Self {
    Self {
      worker_id,
      kind: MembershipKind::Left,
      observed_at: SystemTime::now(),
    }
  }
}

/// Identity of a master: which registry it watches and where it listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEndpoint {
  pub registry_address: String,
  pub bind_ip: IpAddr,
  pub listen_port: u16,
}

impl ClusterEndpoint {
  pub fn new(registry_address: impl Into<String>, listen_port: u16) -> Self {
    Self {
      registry_address: registry_address.into(),
      bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      listen_port,
    }
  }

  pub fn with_bind_ip(mut self, bind_ip: IpAddr) -> Self {
    self.bind_ip = bind_ip;
    self
  }

  pub fn listen_addr(&self) -> SocketAddr {
    SocketAddr::new(self.bind_ip, self.listen_port)
  }
}
