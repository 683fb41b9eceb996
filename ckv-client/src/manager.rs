//! # Pool Manager
//!
//! Purpose: Own every connection pool of a client, created lazily and keyed
//! by server index and execution context.
//!
//! ## Design Principles
//! 1. **One Pool Per (Index, Context)**: Blocking pools are keyed by server
//!    index; cooperative pools by scheduler identity and server index.
//! 2. **Lazy Creation**: Nothing connects until a command needs a server.
//! 3. **Explicit Registry**: Cooperative pools live in a [`CooperativeRegistry`]
//!    with a documented lifecycle instead of a hidden global.
//!
//! ## Registry Lifecycle
//! - Created empty together with the client.
//! - An entry is added the first time a scheduler asks for a pool.
//! - An entry is removed when the scheduler's last handle is dropped
//!   (observer callback), when [`PoolManager::close_scheduler`] runs, or by
//!   the sweep of dead entries performed on every insertion.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use ahash::RandomState;
use ckv_common::{CacheOptions, CacheResult, SchedulerId, ServerAddress};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::async_pool::{AsyncConnectionPool, AsyncPoolConfig};
use crate::connection::ConnectSettings;
use crate::pool::{ConnectionPool, PoolConfig, PooledConnection};
use crate::scheduler::{Scheduler, SchedulerObserver, WeakScheduler};

/// Settings shared by every pool of a client.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_total: usize,
    pub max_idle: usize,
    pub acquire_timeout: Duration,
    pub connect: ConnectSettings,
}

impl PoolSettings {
    pub fn from_options(options: &CacheOptions) -> Self {
        PoolSettings {
            max_total: options.max_connections,
            max_idle: options.max_idle,
            acquire_timeout: options.pool_timeout,
            connect: ConnectSettings::from_options(options),
        }
    }
}

struct SchedulerPools {
    owner: WeakScheduler,
    pools: HashMap<usize, AsyncConnectionPool, RandomState>,
}

/// Per-scheduler partition of cooperative pools.
pub struct CooperativeRegistry {
    entries: Mutex<HashMap<SchedulerId, SchedulerPools, RandomState>>,
}

impl CooperativeRegistry {
    fn new() -> Self {
        CooperativeRegistry {
            entries: Mutex::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    /// Number of schedulers that currently own pools.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take(&self, id: SchedulerId) -> Vec<AsyncConnectionPool> {
        self.entries
            .lock()
            .remove(&id)
            .map(|entry| entry.pools.into_values().collect())
            .unwrap_or_default()
    }
}

impl SchedulerObserver for CooperativeRegistry {
    fn scheduler_retired(&self, id: SchedulerId) {
        let pools = self.take(id);
        if !pools.is_empty() {
            debug!(scheduler = %id, pools = pools.len(), "reclaiming pools of retired scheduler");
        }
        for pool in pools {
            pool.close_now();
        }
    }
}

/// Owner of all pools of one client.
pub struct PoolManager {
    settings: PoolSettings,
    blocking: RwLock<HashMap<usize, ConnectionPool, RandomState>>,
    cooperative: Arc<CooperativeRegistry>,
}

impl PoolManager {
    pub fn new(settings: PoolSettings) -> Self {
        PoolManager {
            settings,
            blocking: RwLock::new(HashMap::with_hasher(RandomState::new())),
            cooperative: Arc::new(CooperativeRegistry::new()),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Blocking pool for `index`, created on first use.
    pub fn blocking_pool(&self, index: usize, address: &ServerAddress) -> ConnectionPool {
        if let Some(pool) = self.blocking.read().get(&index) {
            return pool.clone();
        }
        let mut pools = self.blocking.write();
        pools
            .entry(index)
            .or_insert_with(|| {
                ConnectionPool::new(PoolConfig {
                    index,
                    address: address.clone(),
                    max_idle: self.settings.max_idle,
                    max_total: self.settings.max_total,
                    acquire_timeout: self.settings.acquire_timeout,
                    settings: self.settings.connect,
                })
            })
            .clone()
    }

    /// Scoped blocking connection to `index`.
    pub fn get_connection(&self, index: usize, address: &ServerAddress) -> CacheResult<PooledConnection> {
        self.blocking_pool(index, address).acquire()
    }

    /// Cooperative pool for `index` on `scheduler`, created on first use.
    pub fn cooperative_pool(
        &self,
        scheduler: &Scheduler,
        index: usize,
        address: &ServerAddress,
    ) -> AsyncConnectionPool {
        let id = scheduler.id();
        let mut entries = self.cooperative.entries.lock();
        if !entries.contains_key(&id) {
            entries.retain(|_, entry| entry.owner.is_alive());
            let observer: Arc<dyn SchedulerObserver> = self.cooperative.clone();
            let observer: Weak<dyn SchedulerObserver> = Arc::downgrade(&observer);
            scheduler.observe(observer);
        }
        let entry = entries.entry(id).or_insert_with(|| SchedulerPools {
            owner: scheduler.downgrade(),
            pools: HashMap::with_hasher(RandomState::new()),
        });
        entry
            .pools
            .entry(index)
            .or_insert_with(|| {
                AsyncConnectionPool::new(AsyncPoolConfig {
                    index,
                    scheduler: id,
                    address: address.clone(),
                    max_idle: self.settings.max_idle,
                    max_total: self.settings.max_total,
                    acquire_timeout: self.settings.acquire_timeout,
                    settings: self.settings.connect,
                })
            })
            .clone()
    }

    pub fn cooperative(&self) -> &CooperativeRegistry {
        &self.cooperative
    }

    /// Drops blocking pools, sending courtesy QUITs until `deadline` passes.
    pub fn close_blocking(&self, deadline: Duration) {
        let until = Instant::now() + deadline;
        let pools: Vec<ConnectionPool> = self.blocking.write().drain().map(|(_, p)| p).collect();
        debug!(pools = pools.len(), "closing blocking pools");
        for pool in pools {
            pool.close(until);
        }
    }

    /// Removes the scheduler's pools immediately, then closes them with
    /// courtesy QUITs bounded by `deadline`.
    pub async fn close_scheduler(&self, scheduler: &Scheduler, deadline: Duration) {
        let until = Instant::now() + deadline;
        let pools = self.cooperative.take(scheduler.id());
        debug!(scheduler = %scheduler.id(), pools = pools.len(), "closing cooperative pools");
        for pool in pools {
            pool.close(until).await;
        }
    }

    /// Removes and closes the scheduler's pools without network traffic.
    pub fn close_scheduler_now(&self, id: SchedulerId) {
        for pool in self.cooperative.take(id) {
            pool.close_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> PoolManager {
        PoolManager::new(PoolSettings::from_options(&CacheOptions::default()))
    }

    #[test]
    fn blocking_pool_is_created_once_per_index() {
        let manager = manager();
        let addr = ServerAddress::tcp("127.0.0.1", 1);
        let a = manager.blocking_pool(0, &addr);
        let b = manager.blocking_pool(0, &addr);
        let c = manager.blocking_pool(1, &addr);
        assert_eq!(a.index(), b.index());
        assert_eq!(c.index(), 1);
        assert_eq!(manager.blocking.read().len(), 2);
    }

    #[test]
    fn schedulers_get_distinct_pools() {
        let manager = manager();
        let addr = ServerAddress::tcp("127.0.0.1", 1);
        let a = Scheduler::new();
        let b = Scheduler::new();
        let pa = manager.cooperative_pool(&a, 0, &addr);
        let pa2 = manager.cooperative_pool(&a, 0, &addr);
        let pb = manager.cooperative_pool(&b, 0, &addr);
        assert!(pa.same_pool(&pa2));
        assert!(!pa.same_pool(&pb));
        assert_eq!(manager.cooperative().len(), 2);
    }

    #[test]
    fn dropping_scheduler_reclaims_its_pools() {
        let manager = manager();
        let addr = ServerAddress::tcp("127.0.0.1", 1);
        let scheduler = Scheduler::new();
        manager.cooperative_pool(&scheduler, 0, &addr);
        manager.cooperative_pool(&scheduler, 1, &addr);
        assert_eq!(manager.cooperative().len(), 1);
        drop(scheduler);
        assert!(manager.cooperative().is_empty());
    }

    #[test]
    fn explicit_close_is_immediate() {
        let manager = manager();
        let addr = ServerAddress::tcp("127.0.0.1", 1);
        let scheduler = Scheduler::new();
        let pool = manager.cooperative_pool(&scheduler, 0, &addr);
        manager.close_scheduler_now(scheduler.id());
        assert!(manager.cooperative().is_empty());
        let fresh = manager.cooperative_pool(&scheduler, 0, &addr);
        assert!(!fresh.same_pool(&pool));
    }
}
