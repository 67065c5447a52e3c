pub mod shutdown_manager;
pub mod shutdown_reason;

pub use shutdown_manager::{Shutdown, ShutdownManager};
pub use shutdown_reason::ShutdownReason;
