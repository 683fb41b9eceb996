//! # Distributed Lock
//!
//! A leased mutex stored under one key. The value is the owner token; the
//! lease is the key's expiration.
//!
//! ```text
//! UNLOCKED ──acquire──► LOCKED(token, lease) ──acquire (same token)──► LOCKED(renewed)
//!     ▲                        │
//!     └──release (token ok)────┘ or lease expiry at the server
//! ```
//!
//! Acquire, release and extend are scripts, so ownership checks and writes
//! happen atomically on the server. Handles sharing a token are the same
//! owner, which makes the lock reentrant across handles in one process.

use std::time::{Duration, Instant};

use ckv_common::{CacheError, CacheResult, LockError};
use serde_json::Value;
use tracing::trace;
use uuid::Uuid;

use crate::async_client::AsyncClient;
use crate::client::Client;
use crate::command::Cmd;
use crate::engine::{Core, Op};
use crate::ops;
use crate::script::{hooks, ScriptRegistry};

/// Sets the key when free, refreshes the lease when already owned.
/// `ARGV[2]` is the lease in milliseconds; `0` means no lease.
pub const ACQUIRE_SCRIPT: &str = r#"local current = redis.call('GET', KEYS[1])
local lease = tonumber(ARGV[2])
if current == ARGV[1] then
  if lease > 0 then redis.call('PEXPIRE', KEYS[1], lease) end
  return 1
end
if current then return 0 end
if lease > 0 then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', lease)
else
  redis.call('SET', KEYS[1], ARGV[1])
end
return 1"#;

/// Compare-and-delete.
pub const RELEASE_SCRIPT: &str = r#"if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0"#;

/// Adds `ARGV[2]` milliseconds to the remaining lease of an owned lock.
/// Returns 1 on success, 0 when owned by someone else, -1 without a lease,
/// -2 when the key is gone.
pub const EXTEND_SCRIPT: &str = r#"local current = redis.call('GET', KEYS[1])
if not current then return -2 end
if current ~= ARGV[1] then return 0 end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then return -1 end
redis.call('PEXPIRE', KEYS[1], ttl + tonumber(ARGV[2]))
return 1"#;

pub(crate) const ACQUIRE: &str = "ckv:lock:acquire";
pub(crate) const RELEASE: &str = "ckv:lock:release";
pub(crate) const EXTEND: &str = "ckv:lock:extend";

pub(crate) fn register_scripts(registry: &ScriptRegistry) -> CacheResult<()> {
    for (name, source) in [(ACQUIRE, ACQUIRE_SCRIPT), (RELEASE, RELEASE_SCRIPT), (EXTEND, EXTEND_SCRIPT)] {
        registry.register(name, source, Some(hooks::verbatim()), Some(hooks::noop()))?;
    }
    Ok(())
}

fn lease_millis(lease: Option<Duration>) -> u64 {
    lease.map_or(0, |d| d.as_millis().max(1) as u64)
}

/// State shared by [`Lock`] and [`AsyncLock`].
#[derive(Debug, Clone)]
struct LockSpec {
    key: String,
    token: String,
    lease: Option<Duration>,
    sleep: Duration,
}

impl LockSpec {
    fn new(core: &Core, key: &str) -> Self {
        LockSpec {
            key: key.to_string(),
            token: Uuid::new_v4().to_string(),
            lease: core.options.lock_lease,
            sleep: core.options.lock_sleep,
        }
    }

    fn acquire_op(&self, core: &Core) -> CacheResult<Op<bool>> {
        let args = vec![Value::from(self.token.clone()), Value::from(lease_millis(self.lease))];
        Ok(ops::eval(core, ACQUIRE, vec![self.key.clone()], args)?.map(|v| Ok(v.as_i64() == Some(1))))
    }

    fn release_op(&self, core: &Core) -> CacheResult<Op<()>> {
        let key = self.key.clone();
        let args = vec![Value::from(self.token.clone())];
        Ok(ops::eval(core, RELEASE, vec![self.key.clone()], args)?.map(move |v| match v.as_i64() {
            Some(1) => Ok(()),
            _ => Err(LockError::NotOwned { key }.into()),
        }))
    }

    fn extend_op(&self, core: &Core, additional: Duration) -> CacheResult<Op<()>> {
        let key = self.key.clone();
        let args = vec![
            Value::from(self.token.clone()),
            Value::from(additional.as_millis() as u64),
        ];
        Ok(ops::eval(core, EXTEND, vec![self.key.clone()], args)?.map(move |v| match v.as_i64() {
            Some(1) => Ok(()),
            Some(-1) => Err(CacheError::NotSupported(format!("lock {key:?} has no lease to extend"))),
            Some(-2) => Err(LockError::NotAcquired { key }.into()),
            _ => Err(LockError::NotOwned { key }.into()),
        }))
    }

    fn owned_op(&self) -> Op<bool> {
        let token = self.token.clone();
        Op::read(&self.key, Cmd::new("GET").key(&self.key), move |_, reply| {
            Ok(reply.as_bytes() == Some(token.as_bytes()))
        })
    }

    /// How long to sleep before the next attempt, or `None` when out of time.
    fn pause(&self, deadline: Option<Instant>) -> Option<Duration> {
        match deadline {
            None => Some(self.sleep),
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());
                (!left.is_zero()).then(|| left.min(self.sleep))
            }
        }
    }
}

/// Blocking lock handle.
#[derive(Clone)]
pub struct Lock {
    client: Client,
    spec: LockSpec,
}

impl Lock {
    pub(crate) fn new(client: Client, key: &str) -> Self {
        let spec = LockSpec::new(client.core(), key);
        Lock { client, spec }
    }

    /// Uses an explicit owner token; handles with equal tokens are one owner.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.spec.token = token.into();
        self
    }

    /// Lease for acquisitions; `None` means the lock never expires.
    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.spec.lease = lease;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.spec.sleep = sleep;
        self
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }

    pub fn token(&self) -> &str {
        &self.spec.token
    }

    /// Tries to take the lock. When `blocking`, retries every sleep interval
    /// until it succeeds or `timeout` elapses.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> CacheResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.client.run(self.spec.acquire_op(self.client.core())?)? {
                trace!(key = %self.spec.key, "lock acquired");
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            match self.spec.pause(deadline) {
                Some(pause) => std::thread::sleep(pause),
                None => return Ok(false),
            }
        }
    }

    /// Releases the lock; fails with [`LockError::NotOwned`] when this owner
    /// no longer holds it.
    pub fn release(&self) -> CacheResult<()> {
        self.client.run(self.spec.release_op(self.client.core())?)?;
        trace!(key = %self.spec.key, "lock released");
        Ok(())
    }

    pub fn extend(&self, additional: Duration) -> CacheResult<()> {
        self.client.run(self.spec.extend_op(self.client.core(), additional)?)
    }

    /// Whether anyone holds the lock.
    pub fn locked(&self) -> CacheResult<bool> {
        self.client.has_key(&self.spec.key)
    }

    /// Whether this owner holds the lock.
    pub fn owned(&self) -> CacheResult<bool> {
        self.client.run(self.spec.owned_op())
    }
}

/// Cooperative lock handle.
#[derive(Clone)]
pub struct AsyncLock {
    client: AsyncClient,
    spec: LockSpec,
}

impl AsyncLock {
    pub(crate) fn new(client: AsyncClient, key: &str) -> Self {
        let spec = LockSpec::new(client.core(), key);
        AsyncLock { client, spec }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.spec.token = token.into();
        self
    }

    pub fn with_lease(mut self, lease: Option<Duration>) -> Self {
        self.spec.lease = lease;
        self
    }

    pub fn with_sleep(mut self, sleep: Duration) -> Self {
        self.spec.sleep = sleep;
        self
    }

    pub fn key(&self) -> &str {
        &self.spec.key
    }

    pub fn token(&self) -> &str {
        &self.spec.token
    }

    pub async fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> CacheResult<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let op = self.spec.acquire_op(self.client.core())?;
            if self.client.run(op).await? {
                trace!(key = %self.spec.key, "lock acquired");
                return Ok(true);
            }
            if !blocking {
                return Ok(false);
            }
            match self.spec.pause(deadline) {
                Some(pause) => tokio::time::sleep(pause).await,
                None => return Ok(false),
            }
        }
    }

    pub async fn release(&self) -> CacheResult<()> {
        let op = self.spec.release_op(self.client.core())?;
        self.client.run(op).await?;
        trace!(key = %self.spec.key, "lock released");
        Ok(())
    }

    pub async fn extend(&self, additional: Duration) -> CacheResult<()> {
        let op = self.spec.extend_op(self.client.core(), additional)?;
        self.client.run(op).await
    }

    pub async fn locked(&self) -> CacheResult<bool> {
        self.client.has_key(&self.spec.key).await
    }

    pub async fn owned(&self) -> CacheResult<bool> {
        self.client.run(self.spec.owned_op()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckv_common::CacheOptions;

    #[test]
    fn lock_scripts_are_preregistered() {
        let core = Core::new(CacheOptions::default(), None).unwrap();
        for name in [ACQUIRE, RELEASE, EXTEND] {
            assert!(core.scripts.contains(name));
        }
        assert_eq!(core.scripts.get(RELEASE).unwrap().source(), RELEASE_SCRIPT);
    }

    #[test]
    fn acquire_passes_token_and_lease_verbatim() {
        let core = Core::new(CacheOptions::default(), None).unwrap();
        let mut spec = LockSpec::new(&core, "locks:{job}");
        spec.token = "owner-1".into();
        spec.lease = Some(Duration::from_secs(2));
        let op = spec.acquire_op(&core).unwrap();
        let args: Vec<&[u8]> = op.cmd.args().iter().map(Vec::as_slice).collect();
        assert_eq!(args[0], b"EVALSHA");
        assert_eq!(&args[2..], [&b"1"[..], b"locks:{job}", b"owner-1", b"2000"]);
    }

    #[test]
    fn pause_respects_deadline() {
        let core = Core::new(CacheOptions::default(), None).unwrap();
        let spec = LockSpec::new(&core, "k");
        assert_eq!(spec.pause(None), Some(core.options.lock_sleep));
        assert_eq!(spec.pause(Some(Instant::now())), None);
        let soon = spec.pause(Some(Instant::now() + Duration::from_millis(10))).unwrap();
        assert!(soon <= Duration::from_millis(10));
    }

    #[test]
    fn tokens_are_unique() {
        let core = Core::new(CacheOptions::default(), None).unwrap();
        assert_ne!(LockSpec::new(&core, "k").token, LockSpec::new(&core, "k").token);
    }
}
