//! Coordinated shutdown: flush queued notifications, release approval waiters

use crate::relay::approval::ApprovalCoordinator;
use crate::relay::batcher::{FlushOutcome, MessageBatcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// What a shutdown run did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub flushed: FlushOutcome,
    pub cancelled_approvals: usize,
}

pub struct ShutdownController {
    batcher: MessageBatcher,
    approvals: Arc<ApprovalCoordinator>,
    started: AtomicBool,
}

impl ShutdownController {
    pub fn new(batcher: MessageBatcher, approvals: Arc<ApprovalCoordinator>) -> Self {
        Self {
            batcher,
            approvals,
            started: AtomicBool::new(false),
        }
    }

    /// Close and flush the batch queue, then cancel every live approval. Only the first call
    /// does anything; later calls return `None`.
    pub async fn shutdown(&self) -> Option<ShutdownReport> {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("Shutdown already in progress");
            return None;
        }
        tracing::info!("Shutting down relay");
        self.batcher.close().await;
        let flushed = self.batcher.flush().await;
        if let FlushOutcome::Failed { count, ref error } = flushed {
            tracing::warn!(count, error = %error, "Final flush failed");
        }
        let cancelled_approvals = self.approvals.cancel_all().await;
        tracing::info!(cancelled_approvals, "Relay shut down");
        Some(ShutdownReport {
            flushed,
            cancelled_approvals,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Resolves on Ctrl-C, or SIGTERM on unix.
    pub async fn wait_for_signal() {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Cannot listen for SIGTERM, using Ctrl-C only");
                }
            }
        }
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    }

    /// Wait for a termination signal, then shut down.
    pub async fn run_until_signal(&self) -> Option<ShutdownReport> {
        Self::wait_for_signal().await;
        tracing::info!("Termination signal received");
        self.shutdown().await
    }
}
