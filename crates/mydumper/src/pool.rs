//! Fixed-size session pools.
//!
//! A [`ConnectionPool`] opens all of its sessions up front and never grows.
//! [`ConnectionPool::acquire`] waits on a semaphore until a session is idle,
//! and the returned [`PooledSession`] puts the session back when dropped, so
//! every exit path of a worker returns its session.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::core::{Connector, Session};
use crate::error::{DumpError, Result};

struct PoolInner<S> {
    name: String,
    size: usize,
    idle: Mutex<Vec<S>>,
    permits: Semaphore,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

impl<S> PoolInner<S> {
    fn idle(&self) -> MutexGuard<'_, Vec<S>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn put_back(&self, session: S) {
        self.idle().push(session);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.permits.add_permits(1);
    }
}

/// Fixed set of open sessions shared by concurrent workers.
pub struct ConnectionPool<S> {
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for ConnectionPool<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Session + 'static> ConnectionPool<S> {
    /// Open `size` sessions, optionally bound to a default database.
    ///
    /// If any session fails to open, the ones already opened are closed and
    /// the error is returned.
    pub async fn connect<C>(
        connector: &C,
        size: usize,
        database: Option<&str>,
        name: impl Into<String>,
    ) -> Result<Self>
    where
        C: Connector<Session = S>,
    {
        let name = name.into();
        if size == 0 {
            return Err(DumpError::pool(
                "pool size must be at least 1",
                format!("creating pool {}", name),
            ));
        }

        let mut sessions = Vec::with_capacity(size);
        for _ in 0..size {
            match connector.connect(database).await {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    for mut session in sessions {
                        if let Err(close_err) = session.close().await {
                            warn!("Failed to close session {}: {}", session.id(), close_err);
                        }
                    }
                    return Err(DumpError::pool(
                        e,
                        format!("opening sessions for pool {} on {}", name, connector.endpoint()),
                    ));
                }
            }
        }

        debug!("Pool {} opened {} sessions", name, size);
        Ok(Self::from_sessions(name, sessions))
    }

    fn from_sessions(name: String, sessions: Vec<S>) -> Self {
        let size = sessions.len();
        Self {
            inner: Arc::new(PoolInner {
                name,
                size,
                idle: Mutex::new(sessions),
                permits: Semaphore::new(size),
                in_use: AtomicUsize::new(0),
                peak_in_use: AtomicUsize::new(0),
            }),
        }
    }

    /// Lease an idle session, waiting until one is free.
    pub async fn acquire(&self) -> Result<PooledSession<S>> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| DumpError::pool("pool is closed", format!("acquiring from {}", self.inner.name)))?;
        // The permit is given back in `put_back`.
        permit.forget();

        let session = self.inner.idle().pop().ok_or_else(|| {
            self.inner.permits.add_permits(1);
            DumpError::pool(
                "no idle session despite a free permit",
                format!("acquiring from {}", self.inner.name),
            )
        })?;

        let now = self.inner.in_use.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner.peak_in_use.fetch_max(now, Ordering::Relaxed);

        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Wait for every lease to come back, then close all sessions.
    pub async fn close(&self) -> Result<()> {
        let permits = u32::try_from(self.inner.size).unwrap_or(u32::MAX);
        let all = self
            .inner
            .permits
            .acquire_many(permits)
            .await
            .map_err(|_| DumpError::pool("pool is closed", format!("closing {}", self.inner.name)))?;
        all.forget();
        self.inner.permits.close();

        let sessions: Vec<S> = std::mem::take(&mut *self.inner.idle());
        let mut first_err = None;
        for mut session in sessions {
            if let Err(e) = session.close().await {
                warn!("Failed to close session {} in {}: {}", session.id(), self.inner.name, e);
                first_err.get_or_insert(e);
            }
        }
        debug!("Pool {} closed", self.inner.name);
        first_err.map_or(Ok(()), Err)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of sessions the pool was created with.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Sessions currently leased.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::Relaxed)
    }

    /// Highest number of sessions leased at once.
    pub fn peak_in_use(&self) -> usize {
        self.inner.peak_in_use.load(Ordering::Relaxed)
    }
}

/// A leased session. Returned to its pool on drop.
pub struct PooledSession<S> {
    // Some until the guard is dropped.
    session: Option<S>,
    pool: Arc<PoolInner<S>>,
}

impl<S> PooledSession<S> {
    /// Return the session to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
            .as_ref()
            .expect("session already returned to pool")
    }
}

impl<S> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
            .as_mut()
            .expect("session already returned to pool")
    }
}

impl<S> Drop for PooledSession<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.put_back(session);
        }
    }
}
