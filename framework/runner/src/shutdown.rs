use swarm_core::prelude::InterruptHandle;
use tokio::signal;

/// Listen for Ctrl-C on the current runtime and raise the returned handle when it arrives.
pub fn start_interrupt_listener() -> InterruptHandle {
    let handle = InterruptHandle::new();

    let listener_handle = handle.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                log::warn!("Received interrupt signal, shutting down...");
                listener_handle.interrupt();
            }
            Err(e) => log::error!("Failed to listen for the interrupt signal: {e}"),
        }
    });

    handle
}
