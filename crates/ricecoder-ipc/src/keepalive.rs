//! Keep-alive registry
//!
//! Handles (child processes, channels with in-flight writes) register here
//! while they need the host to stay up. A host can await [`KeepAlive::idle`]
//! to learn when nothing referenced remains.

use once_cell::sync::Lazy;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

static GLOBAL: Lazy<KeepAlive> = Lazy::new(KeepAlive::new);

/// Counter of referenced handles
#[derive(Clone)]
pub struct KeepAlive {
    active: Arc<watch::Sender<usize>>,
}

impl KeepAlive {
    /// Create an isolated registry
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self {
            active: Arc::new(tx),
        }
    }

    /// The process-wide registry
    pub fn global() -> &'static KeepAlive {
        &GLOBAL
    }

    /// Register a new handle, initially referenced or not
    pub fn handle(&self, referenced: bool) -> KeepAliveHandle {
        let mut handle = KeepAliveHandle {
            registry: self.clone(),
            referenced: false,
        };
        handle.set_ref(referenced);
        handle
    }

    /// Number of handles currently referenced
    pub fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolves once no referenced handle remains
    pub async fn idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    fn adjust(&self, referenced: bool) {
        self.active.send_modify(|active| {
            if referenced {
                *active += 1;
            } else {
                *active = active.saturating_sub(1);
            }
        });
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlive")
            .field("active", &self.active())
            .finish()
    }
}

/// One registered handle; dropping it releases its reference
#[derive(Debug)]
pub struct KeepAliveHandle {
    registry: KeepAlive,
    referenced: bool,
}

impl KeepAliveHandle {
    /// Reference or unreference the handle; repeated calls are no-ops
    pub fn set_ref(&mut self, referenced: bool) {
        if self.referenced != referenced {
            self.referenced = referenced;
            self.registry.adjust(referenced);
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.referenced
    }
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.set_ref(false);
    }
}
