pub mod acceptor;
pub mod config;
pub mod error;
pub mod handler;
pub mod lifecycle;
pub mod membership;
pub mod pipeline;
pub mod shutdown;
pub mod view;

pub use acceptor::{CloseReason, ConnectionAcceptor, DrainReport, ListenerHandle, ListenerState};
pub use config::{AcceptorConfig, Args, MasterConfig, PipelineConfig, WatcherConfig};
pub use error::{
    AcceptorError, CodecError, HandlerError, LifecycleError, PipelineError, WatchError,
};
pub use handler::ClusterStatusHandler;
pub use lifecycle::{LifecycleState, MasterLifecycle};
pub use membership::{MembershipSubscription, MembershipWatcher, WatchHandle};
pub use pipeline::{
    handler_fn, Pipeline, PipelineBuilder, RequestBody, RequestHandler, Stage,
};
pub use shutdown::{Shutdown, ShutdownManager, ShutdownReason};
pub use view::{ClusterView, WorkerInfo};
