use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{info, warn};

pub struct ShutdownManager<A> {
    pub shutdown: Arc<Shutdown<A>>,
    receiver: oneshot::Receiver<A>,
}

impl<A> ShutdownManager<A> {
    pub fn new() -> Self {
        let (sender, receiver) = oneshot::channel();
        let shutdown = Arc::new(Shutdown {
            sender: Mutex::new(Some(sender)),
        });

        Self { shutdown, receiver }
    }

    pub async fn await_shutdown(self) -> Result<A, oneshot::error::RecvError> {
        self.receiver.await
    }
}

impl<A> Default for ShutdownManager<A> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Shutdown<A> {
    sender: Mutex<Option<oneshot::Sender<A>>>,
}

impl<A> Shutdown<A> {
    /// Delivers `value` to the manager.
    ///
    /// Only the first call has any effect; returns whether this call fired.
    pub async fn trigger(&self, value: A) -> bool {
        let Some(sender) = self.sender.lock().await.take() else {
            return false;
        };
        info!("Triggering shutdown signal");

        if sender.send(value).is_ok() {
            info!("Shutdown signal sent successfully");
        } else {
            warn!("Failed to send shutdown signal");
        }
        true
    }
}
