use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

/// Broadcasts a user interrupt (Ctrl-C) to every part of the run that is waiting on it.
///
/// The interrupt is latched, so a listener created after the interrupt was raised still sees it.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    sender: Sender<()>,
    raised: Arc<AtomicBool>,
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            sender: broadcast::channel(1).0,
            raised: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn interrupt(&self) {
        self.raised.store(true, Ordering::SeqCst);
        if let Err(e) = self.sender.send(()) {
            // Nobody is waiting right now, the latch still records the interrupt.
            log::trace!("No listeners for interrupt signal: {e:?}");
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> InterruptListener {
        InterruptListener {
            receiver: self.sender.subscribe(),
            raised: self.raised.clone(),
        }
    }
}

#[derive(Debug)]
pub struct InterruptListener {
    receiver: Receiver<()>,
    raised: Arc<AtomicBool>,
}

impl InterruptListener {
    /// Point in time check for an interrupt.
    pub fn is_interrupted(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }

    /// Wait until an interrupt is raised.
    ///
    /// Safe to race with other futures in a `select!`. If every [InterruptHandle] has been dropped
    /// no interrupt can arrive any more and this never completes.
    pub async fn wait(&mut self) {
        if self.is_interrupted() {
            return;
        }

        match self.receiver.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}

#[derive(derive_more::Error, derive_more::Display, Debug)]
pub struct InterruptedError {
    msg: String,
}

impl Default for InterruptedError {
    fn default() -> Self {
        Self {
            msg: "Execution interrupted by user".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn listener_wakes_on_interrupt() {
        let handle = InterruptHandle::new();
        let mut listener = handle.subscribe();

        let waiter = tokio::spawn(async move {
            listener.wait().await;
        });

        handle.interrupt();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("listener did not wake up")
            .expect("listener task failed");
    }

    #[tokio::test]
    async fn late_listener_sees_latched_interrupt() {
        let handle = InterruptHandle::new();
        handle.interrupt();

        let mut listener = handle.subscribe();
        assert!(listener.is_interrupted());
        tokio::time::timeout(Duration::from_secs(1), listener.wait())
            .await
            .expect("latched interrupt was not observed");
    }

    #[tokio::test]
    async fn no_interrupt_keeps_waiting() {
        let handle = InterruptHandle::new();
        let mut listener = handle.subscribe();

        let result = tokio::time::timeout(Duration::from_millis(50), listener.wait()).await;
        assert!(result.is_err());
        assert!(!handle.is_interrupted());
    }

    #[test]
    fn interrupted_error_message() {
        assert_eq!(
            InterruptedError::default().to_string(),
            "Execution interrupted by user"
        );
    }
}
