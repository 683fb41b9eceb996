//! # Connection Pool
//!
//! Purpose: Reuse connections to one server for blocking callers to reduce
//! handshake latency and allocation churn.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections;
//!    connecting happens outside the lock.
//! 3. **Bounded Waiting**: An exhausted pool parks the caller on a condvar up
//!    to the configured pool timeout, then fails with a transport error.
//! 4. **Scoped Acquisition**: [`PooledConnection`] returns itself on drop, on
//!    every exit path, and discards connections that saw an IO failure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ckv_common::{CacheResult, ServerAddress, TransportError};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::command::Cmd;
use crate::connection::{ConnectSettings, Connection};
use crate::resp::RespValue;

/// Pool configuration for one server.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Position of the server in the node table.
    pub index: usize,
    pub address: ServerAddress,
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// How long `acquire` waits when the pool is exhausted.
    pub acquire_timeout: Duration,
    pub settings: ConnectSettings,
}

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates an empty pool; connections are opened on demand.
    pub fn new(config: PoolConfig) -> Self {
        debug!(index = config.index, addr = %config.address.label(), "creating blocking pool");
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
            closed: false,
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        }
    }

    pub fn index(&self) -> usize {
        self.inner.config.index
    }

    /// Acquires a connection, waiting up to the acquire timeout when exhausted.
    pub fn acquire(&self) -> CacheResult<PooledConnection> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        {
            let mut state = self.inner.state.lock();
            loop {
                if state.closed {
                    return Err(TransportError::Closed.into());
                }
                if let Some(conn) = state.idle.pop_front() {
                    return Ok(PooledConnection::new(self.inner.clone(), conn));
                }
                if state.total < self.inner.config.max_total {
                    state.total += 1;
                    break;
                }
                if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                    return Err(TransportError::PoolTimeout {
                        index: self.inner.config.index,
                    }
                    .into());
                }
            }
        }

        match Connection::connect(&self.inner.config.address, &self.inner.config.settings) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Number of connections currently opened by this pool.
    pub fn total(&self) -> usize {
        self.inner.state.lock().total
    }

    /// Number of idle connections.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Drains idle connections, sending each a courtesy QUIT until `deadline`.
    ///
    /// Connections checked out at this point are discarded when returned.
    pub fn close(&self, deadline: Instant) {
        let drained: Vec<Connection> = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.total = state.total.saturating_sub(state.idle.len());
            state.idle.drain(..).collect()
        };
        self.inner.available.notify_all();
        for conn in drained {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            conn.quit(deadline - now);
        }
    }
}

impl PoolInner {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    fn return_connection(&self, conn: Connection) {
        let mut state = self.state.lock();
        if !state.closed && state.idle.len() < self.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
        drop(state);
        self.available.notify_one();
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Server index this connection belongs to.
    pub fn index(&self) -> usize {
        self.pool.config.index
    }

    /// Executes one command and returns the reply.
    pub fn exec(&mut self, cmd: &Cmd) -> CacheResult<RespValue> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        let response = conn.exec(cmd);
        if response.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }

    /// Executes several commands in one round trip.
    pub fn exec_batch(&mut self, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        let Some(conn) = self.conn.as_mut() else {
            return Err(TransportError::Closed.into());
        };
        let response = conn.exec_batch(cmds);
        if response.is_err() {
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if self.valid {
            self.pool.return_connection(conn);
        } else {
            self.pool.release_slot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    // The kernel completes TCP handshakes for the listener's backlog, so
    // connections succeed without anyone calling accept.
    fn pool_for(listener: &TcpListener, max_total: usize, max_idle: usize) -> ConnectionPool {
        let port = listener.local_addr().unwrap().port();
        ConnectionPool::new(PoolConfig {
            index: 0,
            address: ServerAddress::tcp("127.0.0.1", port),
            max_idle,
            max_total,
            acquire_timeout: Duration::from_millis(50),
            settings: ConnectSettings::default(),
        })
    }

    #[test]
    fn reuses_returned_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool_for(&listener, 2, 2);
        drop(pool.acquire().unwrap());
        assert_eq!(pool.idle(), 1);
        let _conn = pool.acquire().unwrap();
        assert_eq!(pool.total(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool_for(&listener, 1, 1);
        let _held = pool.acquire().unwrap();
        let start = Instant::now();
        let err = pool.acquire().err().expect("second acquire must fail");
        assert!(err.is_transport());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn waiter_wakes_when_connection_returns() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = ConnectionPool::new(PoolConfig {
            acquire_timeout: Duration::from_secs(2),
            ..pool_for(&listener, 1, 1).inner.config.clone()
        });
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn excess_connections_are_not_kept_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool_for(&listener, 3, 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn close_is_bounded_by_the_deadline_on_a_silent_server() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool_for(&listener, 2, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);

        // Nobody ever answers the QUITs and the sockets have no read timeout.
        let start = Instant::now();
        pool.close(Instant::now() + Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn closed_pool_rejects_acquire() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let pool = pool_for(&listener, 1, 1);
        pool.close(Instant::now());
        assert!(pool.acquire().is_err());
    }
}
