//! Periodic cache compaction
//!
//! An extension that drives `cleanup` on its stack at a fixed frequency from
//! one background task. Shutdown is cooperative: dispose signals the task
//! and waits for it to exit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::extensions::CacheExtension;
use crate::stack::CacheStack;

/// Extension that periodically compacts expired entries out of every layer.
pub struct AutoCleanupExtension {
    frequency: Duration,
    shutdown_tx: watch::Sender<bool>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    registered: AtomicBool,
}

impl AutoCleanupExtension {
    /// Create an extension that runs a cleanup pass every `frequency`.
    ///
    /// The frequency must be strictly positive.
    pub fn new(frequency: Duration) -> Result<Self, CacheError> {
        if frequency.is_zero() {
            return Err(CacheError::InvalidArgument(
                "cleanup frequency must be positive".to_owned(),
            ));
        }
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            frequency,
            shutdown_tx,
            task: tokio::sync::Mutex::new(None),
            registered: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl CacheExtension for AutoCleanupExtension {
    async fn register(&self, stack: &Arc<CacheStack>) -> Result<(), CacheError> {
        if self.registered.swap(true, Ordering::SeqCst) {
            return Err(CacheError::AlreadyRegistered);
        }

        // Weak reference only: the stack owns this extension, and a strong
        // back-reference would keep both alive forever.
        let stack = Arc::downgrade(stack);
        let frequency = self.frequency;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            debug!(?frequency, "cleanup task started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(frequency) => {
                        let Some(stack) = stack.upgrade() else {
                            break;
                        };
                        if let Err(e) = stack.cleanup().await {
                            warn!("cleanup pass failed: {}", e);
                        }
                    }
                }
            }
            debug!("cleanup task exited");
        });
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), CacheError> {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.task.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("cleanup task failed: {}", e);
            }
        }
        Ok(())
    }
}
