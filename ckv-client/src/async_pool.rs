//! # Cooperative Connection Pool
//!
//! Purpose: Pool connections to one server for tasks running on one
//! cooperative scheduler.
//!
//! ## Design Principles
//! 1. **Semaphore Gate**: A permit per possible connection bounds the pool;
//!    waiting for a permit is a suspension point, never a blocked thread.
//! 2. **Cancellation Friendly**: Dropping the acquire future releases nothing
//!    it did not take, and a dropped checkout returns its permit.
//! 3. **Scheduler Bound**: Instances are only handed out by the pool manager
//!    for the scheduler that created them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ckv_common::{CacheResult, SchedulerId, ServerAddress, TransportError};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::command::Cmd;
use crate::connection::{AsyncConnection, ConnectSettings};
use crate::resp::RespValue;

/// Pool configuration for one server on one scheduler.
#[derive(Debug, Clone)]
pub struct AsyncPoolConfig {
    pub index: usize,
    pub scheduler: SchedulerId,
    pub address: ServerAddress,
    pub max_idle: usize,
    pub max_total: usize,
    pub acquire_timeout: Duration,
    pub settings: ConnectSettings,
}

struct AsyncPoolInner {
    config: AsyncPoolConfig,
    idle: Mutex<Vec<AsyncConnection>>,
    permits: Arc<Semaphore>,
}

/// Cooperative connection pool handle.
#[derive(Clone)]
pub struct AsyncConnectionPool {
    inner: Arc<AsyncPoolInner>,
}

impl AsyncConnectionPool {
    pub fn new(config: AsyncPoolConfig) -> Self {
        debug!(
            index = config.index,
            scheduler = %config.scheduler,
            addr = %config.address.label(),
            "creating cooperative pool"
        );
        let permits = Arc::new(Semaphore::new(config.max_total));
        AsyncConnectionPool {
            inner: Arc::new(AsyncPoolInner {
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                config,
                permits,
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.config.index
    }

    pub fn scheduler(&self) -> SchedulerId {
        self.inner.config.scheduler
    }

    /// Whether two handles refer to the same pool instance.
    pub fn same_pool(&self, other: &AsyncConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Acquires a connection, suspending while the pool is exhausted.
    pub async fn acquire(&self) -> CacheResult<AsyncPooledConnection> {
        let permit = tokio::time::timeout(
            self.inner.config.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| TransportError::PoolTimeout {
            index: self.inner.config.index,
        })?
        // The semaphore is only closed by `close`.
        .map_err(|_| TransportError::Closed)?;

        let cached = { self.inner.idle.lock().pop() };
        let conn = match cached {
            Some(conn) => conn,
            None => {
                AsyncConnection::connect(&self.inner.config.address, &self.inner.config.settings)
                    .await?
            }
        };

        Ok(AsyncPooledConnection {
            pool: self.inner.clone(),
            conn: Some(conn),
            valid: true,
            _permit: permit,
        })
    }

    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Stops handing out connections and returns the idle ones.
    fn drain(&self) -> Vec<AsyncConnection> {
        self.inner.permits.close();
        std::mem::take(&mut *self.inner.idle.lock())
    }

    /// Closes the pool, sending QUIT to idle connections until `deadline`.
    pub async fn close(&self, deadline: Instant) {
        for conn in self.drain() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            conn.quit(deadline - now).await;
        }
    }

    /// Closes the pool without any network traffic.
    pub fn close_now(&self) {
        drop(self.drain());
    }
}

/// A connection checked out from a cooperative pool.
pub struct AsyncPooledConnection {
    pool: Arc<AsyncPoolInner>,
    conn: Option<AsyncConnection>,
    valid: bool,
    _permit: OwnedSemaphorePermit,
}

impl AsyncPooledConnection {
    pub fn index(&self) -> usize {
        self.pool.config.index
    }

    pub async fn exec(&mut self, cmd: &Cmd) -> CacheResult<RespValue> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        // Stays false if this future is dropped mid-exchange.
        self.valid = false;
        let response = conn.exec(cmd).await;
        self.valid = response.is_ok();
        response
    }

    pub async fn exec_batch(&mut self, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        // Stays false if this future is dropped mid-exchange.
        self.valid = false;
        let response = conn.exec_batch(cmds).await;
        self.valid = response.is_ok();
        response
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.valid && !self.pool.permits.is_closed() {
            let mut idle = self.pool.idle.lock();
            if idle.len() < self.pool.config.max_idle {
                idle.push(conn);
            }
        }
    }
}
