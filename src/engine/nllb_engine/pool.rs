// nllb_engine/pool.rs — Fixed-capacity connection pool
//
// Capacity is set at construction and never grows. Connections are created
// lazily up to capacity; waiters queue FIFO on the semaphore. A lease is a
// guard object: dropping it returns a healthy connection to the idle list
// (or destroys an unhealthy one) on every exit path, including panics and
// cancellation.

use crate::atoms::error::{CoreError, CoreResult};
use crate::engine::nllb_engine::connection::Connection;
use log::{debug, warn};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    /// Current server port; the subprocess manager updates it on restart.
    port: Arc<AtomicU16>,
    capacity: usize,
    /// One permit per lease slot. FIFO fairness comes from the semaphore.
    semaphore: tokio::sync::Semaphore,
    idle: parking_lot::Mutex<Vec<Connection>>,
    shut_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(capacity: usize, port: Arc<AtomicU16>) -> Self {
        ConnectionPool {
            inner: Arc::new(PoolInner {
                port,
                capacity,
                semaphore: tokio::sync::Semaphore::new(capacity),
                idle: parking_lot::Mutex::new(Vec::with_capacity(capacity)),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Lease a connection: an idle one if available, a fresh one while under
    /// capacity, otherwise wait for a release. Cancelled waiters consume
    /// nothing.
    pub async fn acquire(&self, cancel: &CancellationToken) -> CoreResult<PooledConnection> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(CoreError::internal("pool is shut down"));
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            permit = self.inner.semaphore.acquire() => {
                permit.map_err(|_| CoreError::internal("pool is shut down"))?
            }
        };
        // The slot now belongs to the guard; it is handed back on drop.
        permit.forget();

        let existing = self.inner.idle.lock().pop();
        let connection = match existing {
            Some(conn) => conn,
            None => {
                let port = self.inner.port.load(Ordering::Acquire);
                let connected = tokio::select! {
                    _ = cancel.cancelled() => Err(CoreError::Cancelled),
                    result = Connection::connect(port) => result,
                };
                match connected {
                    Ok(conn) => conn,
                    Err(e) => {
                        self.inner.semaphore.add_permits(1);
                        return Err(e);
                    }
                }
            }
        };

        Ok(PooledConnection { connection: Some(connection), pool: Arc::clone(&self.inner) })
    }

    /// `acquire` bounded by a deadline.
    pub async fn acquire_within(
        &self,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> CoreResult<PooledConnection> {
        tokio::time::timeout(deadline, self.acquire(cancel))
            .await
            .map_err(|_| CoreError::timeout(deadline))?
    }

    /// Stop granting leases and drop idle connections. Active leases finish
    /// normally; their connections are destroyed on return.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.semaphore.close();
        let drained = {
            let mut idle = self.inner.idle.lock();
            std::mem::take(&mut *idle)
        };
        debug!("[nllb] pool shut down, {} idle connections dropped", drained.len());
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        self.inner.idle.lock().len()
    }
}

impl Clone for ConnectionPool {
    fn clone(&self) -> Self {
        ConnectionPool { inner: Arc::clone(&self.inner) }
    }
}

// ── Lease guard ────────────────────────────────────────────────────────────

/// An exclusively leased connection. Deref to use it; drop to return it.
pub struct PooledConnection {
    connection: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.connection.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.connection.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let shut_down = self.pool.shut_down.load(Ordering::Acquire);
            if connection.is_healthy() && !shut_down {
                self.pool.idle.lock().push(connection);
            } else {
                if !shut_down {
                    warn!("[nllb] destroying unhealthy connection");
                }
                drop(connection);
            }
        }
        self.pool.semaphore.add_permits(1);
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A listener that accepts and holds connections open.
    async fn accepting_server() -> Arc<AtomicU16> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        Arc::new(AtomicU16::new(port))
    }

    #[tokio::test]
    async fn test_release_returns_connection_to_idle() {
        let pool = ConnectionPool::new(2, accepting_server().await);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.idle_len(), 0);
        drop(lease);
        assert_eq!(pool.idle_len(), 1);
    }

    #[tokio::test]
    async fn test_waiter_blocks_until_release() {
        let pool = ConnectionPool::new(1, accepting_server().await);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();

        let contender = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await })
        };
        // The contender cannot get a lease while the first one is out.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(lease);
        let second = contender.await.unwrap();
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_pool_intact() {
        let pool = ConnectionPool::new(1, accepting_server().await);
        let cancel = CancellationToken::new();

        let lease = pool.acquire(&cancel).await.unwrap();

        let waiter_cancel = CancellationToken::new();
        let contender = {
            let pool = pool.clone();
            let waiter_cancel = waiter_cancel.clone();
            tokio::spawn(async move { pool.acquire(&waiter_cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_cancel.cancel();
        let result = contender.await.unwrap();
        assert!(matches!(result.unwrap_err(), CoreError::Cancelled));

        // The cancelled waiter did not leak the slot: release + reacquire works.
        drop(lease);
        let lease = pool.acquire(&cancel).await.unwrap();
        drop(lease);
    }

    #[tokio::test]
    async fn test_unhealthy_connection_destroyed_on_release() {
        let pool = ConnectionPool::new(1, accepting_server().await);
        let cancel = CancellationToken::new();

        let mut lease = pool.acquire(&cancel).await.unwrap();
        lease.poison();
        drop(lease);
        assert_eq!(pool.idle_len(), 0);

        // Capacity is restored: a fresh connection can be created.
        let lease = pool.acquire(&cancel).await.unwrap();
        assert!(lease.is_healthy());
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_fails() {
        let pool = ConnectionPool::new(1, accepting_server().await);
        let cancel = CancellationToken::new();
        pool.shutdown();
        assert!(pool.acquire(&cancel).await.is_err());
    }

    #[tokio::test]
    async fn test_acquire_within_deadline_expires() {
        let pool = ConnectionPool::new(1, accepting_server().await);
        let cancel = CancellationToken::new();
        let _lease = pool.acquire(&cancel).await.unwrap();

        let err = pool
            .acquire_within(Duration::from_millis(50), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_failed_connect_releases_slot() {
        // Nothing listens on port 1.
        let pool = ConnectionPool::new(1, Arc::new(AtomicU16::new(1)));
        let cancel = CancellationToken::new();

        assert!(pool.acquire(&cancel).await.is_err());
        // The slot was not leaked by the failed creation.
        assert!(pool.acquire(&cancel).await.is_err());
    }
}
