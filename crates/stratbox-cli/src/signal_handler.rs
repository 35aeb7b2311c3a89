use futures::stream::StreamExt;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use stratbox_core::SandboxOrchestrator;
use tokio::task::JoinHandle;

/// Exit status used when a second interrupt forces the process down
const FORCED_EXIT_CODE: i32 = 130;

/// Turns Ctrl+C into orchestrator cancellation
///
/// The first SIGINT or SIGTERM shuts the orchestrator down, which cancels
/// every in-flight run through the normal cleanup path. A second one exits
/// immediately.
pub struct SignalHandler {
    interrupted: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            interrupted: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Start listening on behalf of `orchestrator`
    pub fn start(&mut self, orchestrator: SandboxOrchestrator) -> std::io::Result<()> {
        if self.task_handle.is_some() {
            return Ok(());
        }

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let interrupted = Arc::clone(&self.interrupted);

        let handle = tokio::spawn(async move {
            while let Some(signal) = signals.next().await {
                if interrupted.swap(true, Ordering::SeqCst) {
                    eprintln!("\nForced exit, containers may be left behind");
                    std::process::exit(FORCED_EXIT_CODE);
                }
                tracing::info!(signal, "Interrupt received, cancelling runs");
                eprintln!("\n🛑 Cancelling running strategies... (Ctrl+C again to force)");
                orchestrator.shutdown();
            }
        });

        self.task_handle = Some(handle);
        Ok(())
    }

    /// Whether an interrupt has been received
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratbox_core::SandboxConfig;

    #[tokio::test]
    async fn test_signal_handler_start() {
        let orchestrator = SandboxOrchestrator::docker(SandboxConfig::default()).unwrap();
        let mut handler = SignalHandler::new();
        assert!(!handler.interrupted());

        assert!(handler.start(orchestrator.clone()).is_ok());
        assert!(handler.task_handle.is_some());
        // Starting twice is a no-op
        assert!(handler.start(orchestrator.clone()).is_ok());
        assert!(!orchestrator.is_shut_down());
    }
}
