// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Process-wide cooperative shutdown.
//!
//! One flag, initialized false, with a single writer (the signal path) and
//! many readers: every instance loop observes it at each iteration boundary
//! and finishes the message in flight before tearing down. Waiters park on a
//! watch channel rather than polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::logging::{Facility, Logger};
use crate::log_notice;

/// Cloneable handle to the process shutdown state.
#[derive(Clone, Debug)]
pub struct ShutdownFlag {
    requested: Arc<AtomicBool>,
    tx: watch::Sender<bool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    /// True once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Request shutdown. Called from the signal path only.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }

    /// A receiver that resolves when shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if *rx.borrow() {
            return;
        }
        // Channel can only close after a final value; either way we are done.
        let _ = rx.wait_for(|v| *v).await;
    }
}

impl Default for ShutdownFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Install SIGINT/SIGTERM handlers that trigger the flag.
///
/// The spawned task is the flag's only writer.
pub fn install_signal_handlers(flag: ShutdownFlag, logger: Logger) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                log_notice!(logger, Facility::Orchestrator, "SIGINT received, shutting down");
            }
            _ = sigterm.recv() => {
                log_notice!(logger, Facility::Orchestrator, "SIGTERM received, shutting down");
            }
        }
        flag.trigger();
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flag_starts_clear() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_shutdown());
    }

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let flag = ShutdownFlag::new();
        let waiter = flag.clone();
        let handle = tokio::spawn(async move { waiter.wait().await });

        flag.trigger();
        assert!(flag.is_shutdown());
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        flag.wait().await;
    }
}
