//! Bounded object pool for peer connections.
//!
//! Capacity is enforced with a semaphore: every borrowed connection holds one
//! permit, and a new connection is only made when no idle one is left, so
//! idle plus borrowed never exceeds capacity. Idle connections are reused LIFO
//! so the warmest socket goes out first, and idle ones older than the idle
//! timeout are destroyed when a borrow finds them.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;

/// Default number of live connections per peer.
pub const DEFAULT_POOL_CAPACITY: usize = 16;

/// Creates and maintains the objects a [`Pool`] hands out.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn make(&self) -> anyhow::Result<Self::Connection>;

    async fn destroy(&self, conn: Self::Connection) -> anyhow::Result<()>;

    /// Checked before an idle connection is handed out again.
    async fn validate(&self, _conn: &mut Self::Connection) -> bool {
        true
    }

    /// Called on every connection right before it is borrowed.
    async fn activate(&self, _conn: &mut Self::Connection) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on every connection right before it goes back to idle.
    async fn passivate(&self, _conn: &mut Self::Connection) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Limits and timeouts of one [`Pool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Max live connections, idle and borrowed.
    pub capacity: usize,
    /// Idle connections older than this are destroyed instead of reused.
    pub idle_timeout: Option<Duration>,
    /// How long `borrow` waits for capacity; `None` waits forever.
    pub borrow_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_POOL_CAPACITY,
            idle_timeout: Some(Duration::from_secs(60)),
            borrow_timeout: Some(Duration::from_secs(2)),
        }
    }
}

/// Counters since the pool was created, plus the current idle count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub borrows: u64,
    pub creates: u64,
    pub destroys: u64,
    pub idle: usize,
}

#[derive(Default)]
struct PoolCounters {
    borrows: AtomicU64,
    creates: AtomicU64,
    destroys: AtomicU64,
}

struct IdleConnection<C> {
    conn: C,
    since: Instant,
}

/// A borrowed connection. Holds its capacity slot until given back,
/// invalidated, or dropped; dropping it closes the underlying object.
pub struct PooledConnection<C> {
    conn: C,
    permit: OwnedSemaphorePermit,
}

impl<C> Deref for PooledConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for PooledConnection<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

/// Bounded pool of connections made by `F`. Idle connections are reused
/// most-recent first.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<Vec<IdleConnection<F::Connection>>>,
    permits: Arc<Semaphore>,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl<F: ConnectionFactory> Pool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            factory,
            config,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            permits: Arc::new(Semaphore::new(capacity)),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Take an idle connection or make a new one, waiting for capacity.
    pub async fn borrow(&self) -> anyhow::Result<PooledConnection<F::Connection>> {
        anyhow::ensure!(!self.closed.load(Ordering::Acquire), "pool closed");
        let permit = self.acquire_permit().await?;
        self.counters.borrows.fetch_add(1, Ordering::Relaxed);

        while let Some(idle) = self.pop_idle() {
            let mut conn = idle.conn;
            let expired = self
                .config
                .idle_timeout
                .is_some_and(|timeout| idle.since.elapsed() >= timeout);
            if expired || !self.factory.validate(&mut conn).await {
                self.destroy(conn).await;
                continue;
            }
            match self.factory.activate(&mut conn).await {
                Ok(()) => return Ok(PooledConnection { conn, permit }),
                Err(err) => {
                    tracing::debug!(error = ?err, "activate pooled connection failed");
                    self.destroy(conn).await;
                }
            }
        }

        let mut conn = self.factory.make().await?;
        self.counters.creates.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.factory.activate(&mut conn).await {
            self.destroy(conn).await;
            return Err(err.context("activate new connection"));
        }
        Ok(PooledConnection { conn, permit })
    }

    /// Return a healthy connection to the idle stack.
    pub async fn give_back(&self, pooled: PooledConnection<F::Connection>) -> anyhow::Result<()> {
        let PooledConnection { mut conn, permit } = pooled;
        if self.closed.load(Ordering::Acquire) {
            self.destroy(conn).await;
            return Ok(());
        }
        if let Err(err) = self.factory.passivate(&mut conn).await {
            self.destroy(conn).await;
            return Err(err.context("passivate connection"));
        }
        // Push before the permit is released so a waiting borrower finds it.
        lock(&self.idle).push(IdleConnection {
            conn,
            since: Instant::now(),
        });
        drop(permit);
        Ok(())
    }

    /// Destroy a borrowed connection instead of returning it.
    pub async fn invalidate(&self, pooled: PooledConnection<F::Connection>) {
        let PooledConnection { conn, permit } = pooled;
        self.destroy(conn).await;
        drop(permit);
    }

    /// Destroy idle connections and fail all later borrows.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        let idle = std::mem::take(&mut *lock(&self.idle));
        for entry in idle {
            self.destroy(entry.conn).await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            borrows: self.counters.borrows.load(Ordering::Relaxed),
            creates: self.counters.creates.load(Ordering::Relaxed),
            destroys: self.counters.destroys.load(Ordering::Relaxed),
            idle: lock(&self.idle).len(),
        }
    }

    fn pop_idle(&self) -> Option<IdleConnection<F::Connection>> {
        lock(&self.idle).pop()
    }

    async fn acquire_permit(&self) -> anyhow::Result<OwnedSemaphorePermit> {
        let acquire = self.permits.clone().acquire_owned();
        let permit = match self.config.borrow_timeout {
            Some(timeout) => time::timeout(timeout, acquire)
                .await
                .with_context(|| format!("pool exhausted after {timeout:?}"))?,
            None => acquire.await,
        };
        permit.map_err(|_| anyhow::anyhow!("pool closed"))
    }

    async fn destroy(&self, conn: F::Connection) {
        self.counters.destroys.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = self.factory.destroy(conn).await {
            tracing::debug!(error = ?err, "destroy pooled connection failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
