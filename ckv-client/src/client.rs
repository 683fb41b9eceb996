//! # Blocking Client
//!
//! Purpose: Run cache operations on the calling OS thread, drawing
//! connections from the blocking pools.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: [`Client`] hides pooling, routing and the codec
//!    behind cache-shaped calls.
//! 2. **Thin Executor**: Operations come from the shared core as data; this
//!    module only moves their commands over blocking connections and follows
//!    cluster redirects.
//! 3. **Cheap Handles**: A `Client` is an `Arc` around the shared core; clone
//!    it freely across threads.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ckv_common::{
    Access, CacheOptions, CacheResult, Expiry, InfoSnapshot, KeyType, ScanPage,
    SlowlogEntry, TopologyError, Ttl,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::async_client::AsyncClient;
use crate::command::Cmd;
use crate::engine::{only, with_asking, without_asking, Batch, Core, FanOut, Op, Step};
use crate::lock::Lock;
use crate::ops::{self, SetCondition};
use crate::pipeline::{Pipeline, PipelineResults};
use crate::pool::PooledConnection;
use crate::resp::RespValue;
use crate::router::Route;
use crate::scheduler::Scheduler;
use crate::script::{KeyTransform, PostHook, PreHook};

/// Builder for [`Client`].
pub struct ClientBuilder {
    options: CacheOptions,
    key_transform: Option<KeyTransform>,
}

impl ClientBuilder {
    /// Key transform applied by script hooks such as `keys_only`, usually
    /// the host's prefixing and versioning.
    pub fn key_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.key_transform = Some(Arc::new(transform));
        self
    }

    pub fn build(self) -> CacheResult<Client> {
        let core = Core::new(self.options, self.key_transform)?;
        Ok(Client { core: Arc::new(core) })
    }
}

/// Blocking cache client.
#[derive(Clone)]
pub struct Client {
    core: Arc<Core>,
}

impl Client {
    pub fn new(options: CacheOptions) -> CacheResult<Self> {
        Self::builder(options).build()
    }

    pub fn builder(options: CacheOptions) -> ClientBuilder {
        ClientBuilder {
            options,
            key_transform: None,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.core.options
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Cooperative view of this client for tasks driven by `scheduler`.
    /// Both views share routing, codec, scripts and configuration.
    pub fn cooperative(&self, scheduler: &Scheduler) -> AsyncClient {
        AsyncClient::new(self.core.clone(), scheduler.clone())
    }

    /// Scoped connection to server `index`, or to the server a key-less
    /// command of the given kind would use.
    pub fn get_connection(&self, index: Option<usize>, for_write: bool) -> CacheResult<PooledConnection> {
        let node = match index {
            Some(index) => index,
            None => {
                let access = if for_write { Access::Write } else { Access::Read };
                self.resolve(Route::Any, access)?
            }
        };
        self.connection(node)
    }

    // ========== Dispatch ==========

    fn connection(&self, node: usize) -> CacheResult<PooledConnection> {
        let address = self.core.router.address(node)?;
        self.core.pools.get_connection(node, &address)
    }

    fn exec_node(&self, node: usize, cmds: &[Cmd], asking: bool) -> CacheResult<Vec<RespValue>> {
        trace!(node, commands = cmds.len(), asking, "dispatch");
        let mut conn = self.connection(node)?;
        if asking {
            return conn.exec_batch(&with_asking(cmds)).map(without_asking);
        }
        conn.exec_batch(cmds)
    }

    /// Rebuilds the slot map from the first seed that answers.
    fn refresh_slots(&self) -> CacheResult<()> {
        if !self.core.router.needs_slots() {
            return Ok(());
        }
        let mut last = None;
        for node in self.core.router.seeds() {
            match self
                .exec_node(node, &[Cmd::new("CLUSTER").arg("SLOTS")], false)
                .and_then(only)
            {
                Ok(reply) => return self.core.router.apply_slots(node, self.core.check(reply)?),
                Err(err) => {
                    warn!(node, error = %err, "CLUSTER SLOTS failed");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| TopologyError::ClusterDown("no seed node available".into()).into()))
    }

    fn resolve(&self, route: Route, access: Access) -> CacheResult<usize> {
        if !matches!(route, Route::Node(_)) {
            self.refresh_slots()?;
        }
        self.core.router.resolve(route, access)
    }

    fn dispatch(&self, route: Route, access: Access, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        let node = self.resolve(route, access)?;
        self.dispatch_to(node, false, cmds)
    }

    /// Sends `cmds` to `node`, following MOVED and ASK replies.
    fn dispatch_to(&self, mut node: usize, mut asking: bool, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        for _ in 0..=self.core.options.max_redirects {
            let replies = self.exec_node(node, cmds, asking)?;
            match replies.iter().find_map(|reply| self.core.redirect(reply)) {
                Some(redirect) => (node, asking) = self.core.follow(&redirect),
                None => return Ok(replies),
            }
        }
        Err(self.core.too_many_redirects())
    }

    pub(crate) fn run<T: 'static>(&self, op: Op<T>) -> CacheResult<T> {
        let mut op = op;
        loop {
            let Op {
                route,
                access,
                cmd,
                parse,
                fallback,
                raw_errors,
            } = op;
            let keys = cmd.key_names().to_vec();
            let reply = match self.dispatch(route, access, std::slice::from_ref(&cmd)).and_then(only) {
                Ok(reply) => reply,
                Err(err) => return self.core.absorb(err, fallback, &keys),
            };
            match self.core.complete(reply, raw_errors, parse, &keys)? {
                Step::Done(value) => return Ok(value),
                Step::Next(next) => op = next,
            }
        }
    }

    fn run_batch<T>(&self, batch: Batch<T>) -> CacheResult<T> {
        let Batch { parts, merge } = batch;
        let results = parts
            .into_iter()
            .map(|part| {
                self.dispatch(part.route, part.access, &part.cmds)
                    .map_err(|err| err.with_keys(part.keys))
            })
            .collect();
        merge(&self.core, results)
    }

    /// Nodes a key-space wide command runs on.
    fn targets(&self, access: Access) -> CacheResult<Vec<usize>> {
        if self.core.router.is_cluster() {
            self.refresh_slots()?;
            return self.core.router.primaries();
        }
        Ok(vec![self.core.router.resolve(Route::Any, access)?])
    }

    fn run_fanout<T>(&self, fanout: FanOut<T>) -> CacheResult<T> {
        let FanOut { access, cmd, merge } = fanout;
        let mut replies = Vec::new();
        for node in self.targets(access)? {
            let reply = self.exec_node(node, std::slice::from_ref(&cmd), false).and_then(only)?;
            replies.push((node, self.core.check(reply)?));
        }
        merge(&self.core, replies)
    }

    // ========== Strings ==========

    pub fn get<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::get(key))
    }

    /// Stores a value. A zero timeout deletes the key instead.
    pub fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, expiry: Expiry) -> CacheResult<bool> {
        self.set_with_flags(key, value, expiry, SetCondition::Always)
    }

    /// Stores a value only when the key is absent.
    pub fn add<V: Serialize + ?Sized>(&self, key: &str, value: &V, expiry: Expiry) -> CacheResult<bool> {
        self.set_with_flags(key, value, expiry, SetCondition::IfMissing)
    }

    pub fn set_with_flags<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        expiry: Expiry,
        condition: SetCondition,
    ) -> CacheResult<bool> {
        self.run(ops::set_with(&self.core, key, value, expiry, condition)?)
    }

    /// Resets the expiration of an existing key.
    pub fn touch(&self, key: &str, expiry: Expiry) -> CacheResult<bool> {
        self.run(ops::touch(&self.core, key, expiry))
    }

    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::delete(key))
    }

    pub fn has_key(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::has_key(key))
    }

    pub fn key_type(&self, key: &str) -> CacheResult<Option<KeyType>> {
        self.run(ops::key_type(key))
    }

    /// String length, or element count for collections; 0 for a missing key.
    pub fn size(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::size(key))
    }

    pub fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.run(ops::incr(key, delta))
    }

    pub fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.run(ops::decr(key, delta)?)
    }

    // ========== Bulk ==========

    /// Values aligned with `keys`; missing keys are `None`.
    pub fn get_many<K, T>(&self, keys: &[K]) -> CacheResult<Vec<Option<T>>>
    where
        K: AsRef<str>,
        T: DeserializeOwned + Send + 'static,
    {
        self.run_batch(ops::get_many(&self.core, keys))
    }

    /// Stores every pair. Returns the keys whose writes failed and were
    /// absorbed under `ignore_exceptions`.
    pub fn set_many<K, V>(&self, items: &[(K, V)], expiry: Expiry) -> CacheResult<Vec<String>>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        self.run_batch(ops::set_many(&self.core, items, expiry)?)
    }

    pub fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<u64> {
        self.run_batch(ops::delete_many(&self.core, keys))
    }

    /// Flushes the database on every data-owning node.
    pub fn clear(&self) -> CacheResult<()> {
        self.run_fanout(ops::clear())
    }

    // ========== Expiration ==========

    pub fn ttl(&self, key: &str) -> CacheResult<Ttl> {
        self.run(ops::ttl(key))
    }

    pub fn pttl(&self, key: &str) -> CacheResult<Ttl> {
        self.run(ops::pttl(key))
    }

    pub fn expire_time(&self, key: &str) -> CacheResult<Option<SystemTime>> {
        self.run(ops::expire_time(key))
    }

    pub fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run(ops::expire(key, ttl))
    }

    pub fn pexpire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run(ops::pexpire(key, ttl))
    }

    pub fn expire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        self.run(ops::expire_at(key, when))
    }

    pub fn persist(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::persist(key))
    }

    // ========== Keyspace ==========

    pub fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.run_fanout(ops::keys(pattern))
    }

    /// Lazily iterates keys matching `pattern`, one SCAN step at a time,
    /// node after node.
    pub fn iter_keys(&self, pattern: &str, count: Option<usize>) -> KeyIter {
        KeyIter {
            client: self.clone(),
            pattern: pattern.to_string(),
            count: count.unwrap_or(self.core.options.scan_count),
            nodes: None,
            cursor: 0,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// One cursor step. Not available in cluster mode.
    pub fn scan(&self, cursor: u64, pattern: &str, count: Option<usize>) -> CacheResult<ScanPage> {
        self.run(ops::scan(&self.core, cursor, pattern, count)?)
    }

    /// Deletes every key matching `pattern`; returns how many were removed.
    pub fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let keys = self.iter_keys(pattern, None).collect::<CacheResult<Vec<String>>>()?;
        let mut removed = 0;
        for chunk in keys.chunks(self.core.options.scan_count.max(1)) {
            removed += self.delete_many(chunk)?;
        }
        Ok(removed)
    }

    pub fn rename(&self, src: &str, dst: &str) -> CacheResult<()> {
        self.run(ops::rename(src, dst))
    }

    pub fn renamenx(&self, src: &str, dst: &str) -> CacheResult<bool> {
        self.run(ops::renamenx(src, dst))
    }

    // ========== Sets ==========

    pub fn sadd<V: Serialize>(&self, key: &str, members: &[V]) -> CacheResult<u64> {
        self.run(ops::sadd(&self.core, key, members)?)
    }

    pub fn srem<V: Serialize>(&self, key: &str, members: &[V]) -> CacheResult<u64> {
        self.run(ops::srem(&self.core, key, members)?)
    }

    pub fn smembers<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Vec<T>> {
        self.run(ops::smembers(key))
    }

    pub fn sismember<V: Serialize + ?Sized>(&self, key: &str, member: &V) -> CacheResult<bool> {
        self.run(ops::sismember(&self.core, key, member)?)
    }

    pub fn scard(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::scard(key))
    }

    pub fn sinter<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        self.run(ops::set_algebra("SINTER", keys)?)
    }

    pub fn sunion<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        self.run(ops::set_algebra("SUNION", keys)?)
    }

    pub fn sdiff<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        self.run(ops::set_algebra("SDIFF", keys)?)
    }

    // ========== Lists ==========

    pub fn lpush<V: Serialize>(&self, key: &str, values: &[V]) -> CacheResult<u64> {
        self.run(ops::push(&self.core, "LPUSH", key, values)?)
    }

    pub fn rpush<V: Serialize>(&self, key: &str, values: &[V]) -> CacheResult<u64> {
        self.run(ops::push(&self.core, "RPUSH", key, values)?)
    }

    pub fn lpop<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::pop("LPOP", key))
    }

    pub fn rpop<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::pop("RPOP", key))
    }

    pub fn lrange<T: DeserializeOwned + Send + 'static>(&self, key: &str, start: i64, stop: i64) -> CacheResult<Vec<T>> {
        self.run(ops::lrange(key, start, stop))
    }

    pub fn llen(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::llen(key))
    }

    // ========== Hashes ==========

    pub fn hset<V: Serialize + ?Sized>(&self, key: &str, field: &str, value: &V) -> CacheResult<bool> {
        self.run(ops::hset(&self.core, key, field, value)?)
    }

    pub fn hget<T: DeserializeOwned + Send + 'static>(&self, key: &str, field: &str) -> CacheResult<Option<T>> {
        self.run(ops::hget(key, field))
    }

    pub fn hdel<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> CacheResult<u64> {
        self.run(ops::hdel(key, fields))
    }

    pub fn hgetall<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<BTreeMap<String, T>> {
        self.run(ops::hgetall(key))
    }

    pub fn hlen(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::hlen(key))
    }

    // ========== Introspection ==========

    pub fn ping(&self) -> CacheResult<()> {
        self.run(ops::ping())
    }

    pub fn info(&self, section: Option<&str>) -> CacheResult<InfoSnapshot> {
        self.run_fanout(ops::info(section))
    }

    pub fn slowlog_get(&self, count: usize) -> CacheResult<Vec<SlowlogEntry>> {
        self.run_fanout(ops::slowlog_get(count))
    }

    pub fn slowlog_len(&self) -> CacheResult<u64> {
        self.run_fanout(ops::slowlog_len())
    }

    // ========== Pipelines ==========

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.core.clone(), false)
    }

    /// A pipeline whose commands run atomically per server.
    pub fn transaction(&self) -> Pipeline {
        Pipeline::new(self.core.clone(), true)
    }

    pub fn execute(&self, pipeline: &Pipeline) -> CacheResult<PipelineResults> {
        pipeline.check()?;
        self.refresh_slots()?;
        let plan = pipeline.plan()?;
        let mut replies: Vec<Option<RespValue>> = vec![None; pipeline.len()];
        for batch in &plan {
            let cmds = pipeline.commands(batch);
            let raw = if pipeline.is_transactional() {
                self.dispatch_to(batch.node, false, &cmds)?
            } else {
                self.exec_node(batch.node, &cmds, false)?
            };
            for (&position, reply) in batch.positions.iter().zip(pipeline.unpack(batch, raw)?) {
                let reply = match self.core.redirect(&reply) {
                    Some(redirect) => {
                        let (node, asking) = self.core.follow(&redirect);
                        let cmd = pipeline.command(position);
                        self.dispatch_to(node, asking, std::slice::from_ref(cmd)).and_then(only)?
                    }
                    None => reply,
                };
                replies[position] = Some(reply);
            }
        }
        pipeline.finish(replies)
    }

    // ========== Locks & Scripts ==========

    pub fn lock(&self, key: &str) -> Lock {
        Lock::new(self.clone(), key)
    }

    /// Registers a script under `name`. Hooks default to `keys_only` and
    /// `noop`.
    pub fn register_script(
        &self,
        name: &str,
        source: &str,
        pre: Option<PreHook>,
        post: Option<PostHook>,
    ) -> CacheResult<()> {
        self.core.scripts.register(name, source, pre, post).map(|_| ())
    }

    /// Runs a registered script by digest, resubmitting its source once
    /// when the server does not know it.
    pub fn eval_script<K: AsRef<str>>(&self, name: &str, keys: &[K], args: Vec<Value>) -> CacheResult<Value> {
        let keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        self.run(ops::eval(&self.core, name, keys, args)?)
    }

    /// Closes the blocking pools, sending QUIT within the close deadline.
    /// Pools are recreated on next use.
    pub fn close(&self) {
        self.core.pools.close_blocking(self.core.options.close_deadline);
    }

    fn scan_targets(&self) -> CacheResult<Vec<usize>> {
        self.targets(Access::Read)
    }

    fn scan_node(&self, node: usize, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        self.run(Op::new(
            Route::Node(node),
            Access::Read,
            ops::scan_cmd(cursor, pattern, count),
            |_, reply| ops::parse_scan(reply),
        ))
    }
}

/// Lazy key iterator returned by [`Client::iter_keys`]. Each step is an
/// independent request carrying the node's cursor; no connection is held
/// between steps.
pub struct KeyIter {
    client: Client,
    pattern: String,
    count: usize,
    nodes: Option<VecDeque<usize>>,
    cursor: u64,
    buffer: VecDeque<String>,
    done: bool,
}

impl KeyIter {
    fn step(&mut self) -> CacheResult<()> {
        if self.nodes.is_none() {
            self.nodes = Some(self.client.scan_targets()?.into());
        }
        let Some(nodes) = self.nodes.as_mut() else {
            return Ok(());
        };
        let Some(&node) = nodes.front() else {
            self.done = true;
            return Ok(());
        };
        let page = self.client.scan_node(node, self.cursor, &self.pattern, self.count)?;
        self.buffer.extend(page.keys.iter().cloned());
        if page.is_last() {
            nodes.pop_front();
            self.cursor = 0;
        } else {
            self.cursor = page.cursor;
        }
        Ok(())
    }
}

impl Iterator for KeyIter {
    type Item = CacheResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(key) = self.buffer.pop_front() {
                return Some(Ok(key));
            }
            if self.done {
                return None;
            }
            if let Err(err) = self.step() {
                self.done = true;
                return Some(Err(err));
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("servers", &self.core.options.servers)
            .field("cluster", &self.core.router.is_cluster())
            .finish()
    }
}
