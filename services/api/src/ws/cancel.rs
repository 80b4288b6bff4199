//! Ownership of the in-flight pipeline run.
//!
//! At most one pipeline run is live per session. Starting a new run first
//! cancels the previous one *and awaits its termination*, so two generation
//! loops can never interleave audio on the same socket.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub struct CancellationController {
    current: Option<ActiveRun>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of the active run, if any, and waits for its
    /// task to finish unwinding.
    pub async fn cancel_current(&mut self) {
        if let Some(run) = self.current.take() {
            run.token.cancel();
            if let Err(e) = run.handle.await
                && !e.is_cancelled()
            {
                warn!(error = ?e, "pipeline task panicked during cancellation");
            }
        }
    }

    /// Records a freshly spawned run as the active one. The caller must have
    /// called [`cancel_current`](Self::cancel_current) first so the old run
    /// is fully stopped before the new task was spawned.
    pub fn install(&mut self, token: CancellationToken, handle: JoinHandle<()>) {
        self.current = Some(ActiveRun { token, handle });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    /// Starting run B after run A guarantees A stops before B emits anything.
    #[tokio::test]
    async fn new_run_never_overlaps_the_old_one() {
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        let mut controller = CancellationController::new();
        let a_done = Arc::new(AtomicBool::new(false));

        let token_a = CancellationToken::new();
        let a_flag = a_done.clone();
        let a_tx = tx.clone();
        let handle_a = tokio::spawn({
            let token = token_a.clone();
            async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_millis(1)) => {
                            let _ = a_tx.send("a");
                        }
                    }
                }
                a_flag.store(true, Ordering::SeqCst);
            }
        });
        controller.install(token_a, handle_a);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Supersede A with B.
        controller.cancel_current().await;
        assert!(a_done.load(Ordering::SeqCst), "A must finish before B starts");

        let token_b = CancellationToken::new();
        let b_tx = tx.clone();
        let handle_b = tokio::spawn(async move {
            let _ = b_tx.send("b");
        });
        controller.install(token_b, handle_b);

        controller.cancel_current().await;
        drop(tx);

        // No "a" may appear after the first "b".
        let mut seen_b = false;
        while let Some(label) = rx.recv().await {
            match label {
                "b" => seen_b = true,
                "a" => assert!(!seen_b, "run A emitted after run B started"),
                _ => unreachable!(),
            }
        }
        assert!(seen_b);
    }

    #[tokio::test]
    async fn cancel_with_no_active_run_is_a_noop() {
        let mut controller = CancellationController::new();
        controller.cancel_current().await;
    }
}
