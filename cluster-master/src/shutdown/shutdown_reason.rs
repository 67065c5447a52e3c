#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    // SIGINT / SIGTERM received by the process.
    Signal,
    Requested,
    // The listening socket closed without being asked to.
    ListenerClosed(String),
    // Registry reconnects were exhausted.
    MembershipLost,
}
