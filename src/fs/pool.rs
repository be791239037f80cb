//! Per-task pool of remote sessions.
//!
//! Each concurrent worker leases its own session, so no session ever has
//! commands issued by two workers at once. The first session is opened
//! eagerly and decides whether the task can run at all; the rest are opened
//! on demand, never more than the pool size.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, warn};

use super::{Connector, FileSystem};
use crate::core::TransferError;

pub struct SessionPool {
    connector: Arc<dyn Connector>,
    max_sessions: usize,
    /// Sessions opened or being opened.
    slots: AtomicUsize,
    idle: Mutex<Vec<Arc<dyn FileSystem>>>,
    opened: Mutex<Vec<Arc<dyn FileSystem>>>,
}

impl SessionPool {
    /// Open the first session. Its failure is the task-level session error.
    pub async fn open(
        connector: Arc<dyn Connector>,
        max_sessions: usize,
    ) -> Result<Arc<Self>, TransferError> {
        let first = connector.connect().await?;
        info!(server = connector.server(), max_sessions, "Session established");

        Ok(Arc::new(Self {
            connector,
            max_sessions: max_sessions.max(1),
            slots: AtomicUsize::new(1),
            idle: Mutex::new(vec![first.clone()]),
            opened: Mutex::new(vec![first]),
        }))
    }

    pub fn server(&self) -> &str {
        self.connector.server()
    }

    pub fn opened(&self) -> usize {
        lock(&self.opened).len()
    }

    /// Lease an idle session, opening a new one if the pool is not full.
    pub async fn acquire(self: &Arc<Self>) -> Result<SessionLease, TransferError> {
        if let Some(session) = lock(&self.idle).pop() {
            return Ok(self.lease(session));
        }

        let reserved = self
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_sessions).then_some(n + 1)
            })
            .is_ok();
        if !reserved {
            return Err(TransferError::session(
                self.server(),
                format!("all {} sessions are in use", self.max_sessions),
            ));
        }

        match self.connector.connect().await {
            Ok(session) => {
                lock(&self.opened).push(session.clone());
                debug!(server = self.server(), opened = self.opened(), "Opened additional session");
                Ok(self.lease(session))
            }
            Err(e) => {
                self.slots.fetch_sub(1, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn lease(self: &Arc<Self>, session: Arc<dyn FileSystem>) -> SessionLease {
        SessionLease {
            pool: Arc::clone(self),
            session,
        }
    }

    /// Close every session. Best effort: errors are ignored.
    ///
    /// Sessions still leased are left alone; call this once every worker has
    /// returned its lease.
    pub async fn close(&self) {
        let idle: Vec<_> = lock(&self.idle).drain(..).collect();
        let outstanding = self.opened().saturating_sub(idle.len());
        if outstanding > 0 {
            warn!(server = self.server(), outstanding, "Closing pool with sessions still leased");
        }

        for session in &idle {
            session.close().await;
        }
        lock(&self.opened).retain(|s| !idle.iter().any(|i| Arc::ptr_eq(i, s)));
        debug!(server = self.server(), closed = idle.len(), "Sessions closed");
    }
}

/// A session checked out of a [`SessionPool`]; returned to it on drop.
pub struct SessionLease {
    pool: Arc<SessionPool>,
    session: Arc<dyn FileSystem>,
}

impl Deref for SessionLease {
    type Target = dyn FileSystem;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        lock(&self.pool.idle).push(Arc::clone(&self.session));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
