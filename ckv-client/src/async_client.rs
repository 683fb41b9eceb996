//! # Cooperative Client
//!
//! Purpose: Run cache operations as futures on one async runtime, drawing
//! connections from that runtime's own pools.
//!
//! ## Design Principles
//! 1. **Same Core, Different Wire**: Routing, codec, reply parsing and
//!    absorption come from the shared core; only connection handling and
//!    waiting differ from [`crate::Client`].
//! 2. **Scheduler Bound**: Every `AsyncClient` carries the [`Scheduler`] it
//!    was created for and only ever touches that scheduler's pools.
//! 3. **Suspend, Never Block**: Pool exhaustion and network I/O are the only
//!    suspension points; groups of bulk requests run concurrently.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ckv_common::{
    Access, CacheOptions, CacheResult, Expiry, InfoSnapshot, KeyType, ScanPage, SlowlogEntry,
    TopologyError, Ttl,
};
use futures::future::join_all;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{trace, warn};

use crate::async_pool::AsyncPooledConnection;
use crate::command::Cmd;
use crate::engine::{only, with_asking, without_asking, Batch, Core, FanOut, Op, Step};
use crate::lock::AsyncLock;
use crate::ops::{self, SetCondition};
use crate::pipeline::{Pipeline, PipelineResults};
use crate::resp::RespValue;
use crate::router::Route;
use crate::scheduler::Scheduler;
use crate::script::{PostHook, PreHook};

/// Cooperative cache client bound to one scheduler.
#[derive(Clone)]
pub struct AsyncClient {
    core: Arc<Core>,
    scheduler: Scheduler,
}

impl AsyncClient {
    pub(crate) fn new(core: Arc<Core>, scheduler: Scheduler) -> Self {
        AsyncClient { core, scheduler }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.core.options
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn core(&self) -> &Core {
        &self.core
    }

    /// Scoped connection to server `index`, or to the server a key-less
    /// command of the given kind would use.
    pub async fn get_connection(&self, index: Option<usize>, for_write: bool) -> CacheResult<AsyncPooledConnection> {
        let node = match index {
            Some(index) => index,
            None => {
                let access = if for_write { Access::Write } else { Access::Read };
                self.resolve(Route::Any, access).await?
            }
        };
        self.connection(node).await
    }

    // ========== Dispatch ==========

    async fn connection(&self, node: usize) -> CacheResult<AsyncPooledConnection> {
        let address = self.core.router.address(node)?;
        self.core
            .pools
            .cooperative_pool(&self.scheduler, node, &address)
            .acquire()
            .await
    }

    async fn exec_node(&self, node: usize, cmds: &[Cmd], asking: bool) -> CacheResult<Vec<RespValue>> {
        trace!(node, commands = cmds.len(), asking, scheduler = %self.scheduler.id(), "dispatch");
        let mut conn = self.connection(node).await?;
        if asking {
            return conn.exec_batch(&with_asking(cmds)).await.map(without_asking);
        }
        conn.exec_batch(cmds).await
    }

    async fn refresh_slots(&self) -> CacheResult<()> {
        if !self.core.router.needs_slots() {
            return Ok(());
        }
        let mut last = None;
        for node in self.core.router.seeds() {
            let reply = self
                .exec_node(node, &[Cmd::new("CLUSTER").arg("SLOTS")], false)
                .await
                .and_then(only);
            match reply {
                Ok(reply) => return self.core.router.apply_slots(node, self.core.check(reply)?),
                Err(err) => {
                    warn!(node, error = %err, "CLUSTER SLOTS failed");
                    last = Some(err);
                }
            }
        }
        Err(last.unwrap_or_else(|| TopologyError::ClusterDown("no seed node available".into()).into()))
    }

    async fn resolve(&self, route: Route, access: Access) -> CacheResult<usize> {
        if !matches!(route, Route::Node(_)) {
            self.refresh_slots().await?;
        }
        self.core.router.resolve(route, access)
    }

    async fn dispatch(&self, route: Route, access: Access, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        let node = self.resolve(route, access).await?;
        self.dispatch_to(node, false, cmds).await
    }

    async fn dispatch_to(&self, mut node: usize, mut asking: bool, cmds: &[Cmd]) -> CacheResult<Vec<RespValue>> {
        for _ in 0..=self.core.options.max_redirects {
            let replies = self.exec_node(node, cmds, asking).await?;
            match replies.iter().find_map(|reply| self.core.redirect(reply)) {
                Some(redirect) => (node, asking) = self.core.follow(&redirect),
                None => return Ok(replies),
            }
        }
        Err(self.core.too_many_redirects())
    }

    pub(crate) async fn run<T: 'static>(&self, op: Op<T>) -> CacheResult<T> {
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
            let reply = match self
                .dispatch(route, access, std::slice::from_ref(&cmd))
                .await
                .and_then(only)
            {
                Ok(reply) => reply,
                Err(err) => return self.core.absorb(err, fallback, &keys),
            };
            match self.core.complete(reply, raw_errors, parse, &keys)? {
                Step::Done(value) => return Ok(value),
                Step::Next(next) => op = next,
            }
        }
    }

    async fn run_batch<T>(&self, batch: Batch<T>) -> CacheResult<T> {
        let Batch { parts, merge } = batch;
        let results = join_all(parts.into_iter().map(|part| async move {
            self.dispatch(part.route, part.access, &part.cmds)
                .await
                .map_err(|err| err.with_keys(part.keys))
        }))
        .await;
        merge(&self.core, results)
    }

    async fn targets(&self, access: Access) -> CacheResult<Vec<usize>> {
        if self.core.router.is_cluster() {
            self.refresh_slots().await?;
            return self.core.router.primaries();
        }
        Ok(vec![self.core.router.resolve(Route::Any, access)?])
    }

    async fn run_fanout<T>(&self, fanout: FanOut<T>) -> CacheResult<T> {
        let FanOut { access, cmd, merge } = fanout;
        let nodes = self.targets(access).await?;
        let replies = join_all(nodes.iter().map(|&node| self.fanout_node(node, &cmd)))
            .await
            .into_iter()
            .collect::<CacheResult<Vec<_>>>()?;
        merge(&self.core, replies)
    }

    async fn fanout_node(&self, node: usize, cmd: &Cmd) -> CacheResult<(usize, RespValue)> {
        let reply = self
            .exec_node(node, std::slice::from_ref(cmd), false)
            .await
            .and_then(only)?;
        Ok((node, self.core.check(reply)?))
    }

    // ========== Strings ==========

    pub async fn get<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::get(key)).await
    }

    pub async fn set<V: Serialize + ?Sized>(&self, key: &str, value: &V, expiry: Expiry) -> CacheResult<bool> {
        self.set_with_flags(key, value, expiry, SetCondition::Always).await
    }

    pub async fn add<V: Serialize + ?Sized>(&self, key: &str, value: &V, expiry: Expiry) -> CacheResult<bool> {
        self.set_with_flags(key, value, expiry, SetCondition::IfMissing).await
    }

    pub async fn set_with_flags<V: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &V,
        expiry: Expiry,
        condition: SetCondition,
    ) -> CacheResult<bool> {
        let op = ops::set_with(&self.core, key, value, expiry, condition)?;
        self.run(op).await
    }

    pub async fn touch(&self, key: &str, expiry: Expiry) -> CacheResult<bool> {
        self.run(ops::touch(&self.core, key, expiry)).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::delete(key)).await
    }

    pub async fn has_key(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::has_key(key)).await
    }

    pub async fn key_type(&self, key: &str) -> CacheResult<Option<KeyType>> {
        self.run(ops::key_type(key)).await
    }

    pub async fn size(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::size(key)).await
    }

    pub async fn incr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        self.run(ops::incr(key, delta)).await
    }

    pub async fn decr(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let op = ops::decr(key, delta)?;
        self.run(op).await
    }

    // ========== Bulk ==========

    pub async fn get_many<K, T>(&self, keys: &[K]) -> CacheResult<Vec<Option<T>>>
    where
        K: AsRef<str>,
        T: DeserializeOwned + Send + 'static,
    {
        self.run_batch(ops::get_many(&self.core, keys)).await
    }

    pub async fn set_many<K, V>(&self, items: &[(K, V)], expiry: Expiry) -> CacheResult<Vec<String>>
    where
        K: AsRef<str>,
        V: Serialize,
    {
        let batch = ops::set_many(&self.core, items, expiry)?;
        self.run_batch(batch).await
    }

    pub async fn delete_many<K: AsRef<str>>(&self, keys: &[K]) -> CacheResult<u64> {
        self.run_batch(ops::delete_many(&self.core, keys)).await
    }

    pub async fn clear(&self) -> CacheResult<()> {
        self.run_fanout(ops::clear()).await
    }

    // ========== Expiration ==========

    pub async fn ttl(&self, key: &str) -> CacheResult<Ttl> {
        self.run(ops::ttl(key)).await
    }

    pub async fn pttl(&self, key: &str) -> CacheResult<Ttl> {
        self.run(ops::pttl(key)).await
    }

    pub async fn expire_time(&self, key: &str) -> CacheResult<Option<SystemTime>> {
        self.run(ops::expire_time(key)).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run(ops::expire(key, ttl)).await
    }

    pub async fn pexpire(&self, key: &str, ttl: Duration) -> CacheResult<bool> {
        self.run(ops::pexpire(key, ttl)).await
    }

    pub async fn expire_at(&self, key: &str, when: SystemTime) -> CacheResult<bool> {
        self.run(ops::expire_at(key, when)).await
    }

    pub async fn persist(&self, key: &str) -> CacheResult<bool> {
        self.run(ops::persist(key)).await
    }

    // ========== Keyspace ==========

    pub async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.run_fanout(ops::keys(pattern)).await
    }

    /// Stream of keys matching `pattern`. Each SCAN step is its own request;
    /// nothing is fetched until the stream is polled.
    pub fn iter_keys(&self, pattern: &str, count: Option<usize>) -> BoxStream<'static, CacheResult<String>> {
        let cursor = ScanCursor {
            client: self.clone(),
            pattern: pattern.to_string(),
            count: count.unwrap_or(self.core.options.scan_count),
            nodes: None,
            cursor: 0,
            done: false,
        };
        stream::unfold(cursor, |mut cursor| async move {
            if cursor.done {
                return None;
            }
            let items: Vec<CacheResult<String>> = match cursor.step().await {
                Ok(keys) => keys.into_iter().map(Ok).collect(),
                Err(err) => {
                    cursor.done = true;
                    vec![Err(err)]
                }
            };
            Some((stream::iter(items), cursor))
        })
        .flatten()
        .boxed()
    }

    pub async fn scan(&self, cursor: u64, pattern: &str, count: Option<usize>) -> CacheResult<ScanPage> {
        let op = ops::scan(&self.core, cursor, pattern, count)?;
        self.run(op).await
    }

    pub async fn delete_pattern(&self, pattern: &str) -> CacheResult<u64> {
        let keys: Vec<String> = self
            .iter_keys(pattern, None)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<CacheResult<_>>()?;
        let mut removed = 0;
        for chunk in keys.chunks(self.core.options.scan_count.max(1)) {
            removed += self.delete_many(chunk).await?;
        }
        Ok(removed)
    }

    pub async fn rename(&self, src: &str, dst: &str) -> CacheResult<()> {
        self.run(ops::rename(src, dst)).await
    }

    pub async fn renamenx(&self, src: &str, dst: &str) -> CacheResult<bool> {
        self.run(ops::renamenx(src, dst)).await
    }

    // ========== Sets ==========

    pub async fn sadd<V: Serialize>(&self, key: &str, members: &[V]) -> CacheResult<u64> {
        let op = ops::sadd(&self.core, key, members)?;
        self.run(op).await
    }

    pub async fn srem<V: Serialize>(&self, key: &str, members: &[V]) -> CacheResult<u64> {
        let op = ops::srem(&self.core, key, members)?;
        self.run(op).await
    }

    pub async fn smembers<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Vec<T>> {
        self.run(ops::smembers(key)).await
    }

    pub async fn sismember<V: Serialize + ?Sized>(&self, key: &str, member: &V) -> CacheResult<bool> {
        let op = ops::sismember(&self.core, key, member)?;
        self.run(op).await
    }

    pub async fn scard(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::scard(key)).await
    }

    pub async fn sinter<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        let op = ops::set_algebra("SINTER", keys)?;
        self.run(op).await
    }

    pub async fn sunion<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        let op = ops::set_algebra("SUNION", keys)?;
        self.run(op).await
    }

    pub async fn sdiff<K: AsRef<str>, T: DeserializeOwned + Send + 'static>(&self, keys: &[K]) -> CacheResult<Vec<T>> {
        let op = ops::set_algebra("SDIFF", keys)?;
        self.run(op).await
    }

    // ========== Lists ==========

    pub async fn lpush<V: Serialize>(&self, key: &str, values: &[V]) -> CacheResult<u64> {
        let op = ops::push(&self.core, "LPUSH", key, values)?;
        self.run(op).await
    }

    pub async fn rpush<V: Serialize>(&self, key: &str, values: &[V]) -> CacheResult<u64> {
        let op = ops::push(&self.core, "RPUSH", key, values)?;
        self.run(op).await
    }

    pub async fn lpop<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::pop("LPOP", key)).await
    }

    pub async fn rpop<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<Option<T>> {
        self.run(ops::pop("RPOP", key)).await
    }

    pub async fn lrange<T: DeserializeOwned + Send + 'static>(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> CacheResult<Vec<T>> {
        self.run(ops::lrange(key, start, stop)).await
    }

    pub async fn llen(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::llen(key)).await
    }

    // ========== Hashes ==========

    pub async fn hset<V: Serialize + ?Sized>(&self, key: &str, field: &str, value: &V) -> CacheResult<bool> {
        let op = ops::hset(&self.core, key, field, value)?;
        self.run(op).await
    }

    pub async fn hget<T: DeserializeOwned + Send + 'static>(&self, key: &str, field: &str) -> CacheResult<Option<T>> {
        self.run(ops::hget(key, field)).await
    }

    pub async fn hdel<F: AsRef<str>>(&self, key: &str, fields: &[F]) -> CacheResult<u64> {
        self.run(ops::hdel(key, fields)).await
    }

    pub async fn hgetall<T: DeserializeOwned + Send + 'static>(&self, key: &str) -> CacheResult<BTreeMap<String, T>> {
        self.run(ops::hgetall(key)).await
    }

    pub async fn hlen(&self, key: &str) -> CacheResult<u64> {
        self.run(ops::hlen(key)).await
    }

    // ========== Introspection ==========

    pub async fn ping(&self) -> CacheResult<()> {
        self.run(ops::ping()).await
    }

    pub async fn info(&self, section: Option<&str>) -> CacheResult<InfoSnapshot> {
        self.run_fanout(ops::info(section)).await
    }

    pub async fn slowlog_get(&self, count: usize) -> CacheResult<Vec<SlowlogEntry>> {
        self.run_fanout(ops::slowlog_get(count)).await
    }

    pub async fn slowlog_len(&self) -> CacheResult<u64> {
        self.run_fanout(ops::slowlog_len()).await
    }

    // ========== Pipelines ==========

    pub fn pipeline(&self) -> Pipeline {
        Pipeline::new(self.core.clone(), false)
    }

    pub fn transaction(&self) -> Pipeline {
        Pipeline::new(self.core.clone(), true)
    }

    pub async fn execute(&self, pipeline: &Pipeline) -> CacheResult<PipelineResults> {
        pipeline.check()?;
        self.refresh_slots().await?;
        let plan = pipeline.plan()?;
        let mut replies: Vec<Option<RespValue>> = vec![None; pipeline.len()];
        for batch in &plan {
            let cmds = pipeline.commands(batch);
            let raw = if pipeline.is_transactional() {
                self.dispatch_to(batch.node, false, &cmds).await?
            } else {
                self.exec_node(batch.node, &cmds, false).await?
            };
            for (&position, reply) in batch.positions.iter().zip(pipeline.unpack(batch, raw)?) {
                let reply = match self.core.redirect(&reply) {
                    Some(redirect) => {
                        let (node, asking) = self.core.follow(&redirect);
                        let cmd = pipeline.command(position);
                        self.dispatch_to(node, asking, std::slice::from_ref(cmd))
                            .await
                            .and_then(only)?
                    }
                    None => reply,
                };
                replies[position] = Some(reply);
            }
        }
        pipeline.finish(replies)
    }

    // ========== Locks & Scripts ==========

    pub fn lock(&self, key: &str) -> AsyncLock {
        AsyncLock::new(self.clone(), key)
    }

    pub fn register_script(
        &self,
        name: &str,
        source: &str,
        pre: Option<PreHook>,
        post: Option<PostHook>,
    ) -> CacheResult<()> {
        self.core.scripts.register(name, source, pre, post).map(|_| ())
    }

    pub async fn eval_script<K: AsRef<str>>(&self, name: &str, keys: &[K], args: Vec<Value>) -> CacheResult<Value> {
        let keys = keys.iter().map(|k| k.as_ref().to_string()).collect();
        let op = ops::eval(&self.core, name, keys, args)?;
        self.run(op).await
    }

    /// Closes this scheduler's pools: they leave the registry at once and
    /// idle connections get a QUIT within the close deadline.
    pub async fn close(&self) {
        self.core
            .pools
            .close_scheduler(&self.scheduler, self.core.options.close_deadline)
            .await;
    }

    /// Closes this scheduler's pools without any network traffic.
    pub fn close_now(&self) {
        self.core.pools.close_scheduler_now(self.scheduler.id());
    }

    async fn scan_node(&self, node: usize, cursor: u64, pattern: &str, count: usize) -> CacheResult<ScanPage> {
        self.run(Op::new(
            Route::Node(node),
            Access::Read,
            ops::scan_cmd(cursor, pattern, count),
            |_, reply| ops::parse_scan(reply),
        ))
        .await
    }
}

/// Per-node SCAN position of an `iter_keys` stream.
struct ScanCursor {
    client: AsyncClient,
    pattern: String,
    count: usize,
    nodes: Option<VecDeque<usize>>,
    cursor: u64,
    done: bool,
}

impl ScanCursor {
    async fn step(&mut self) -> CacheResult<Vec<String>> {
        if self.nodes.is_none() {
            self.nodes = Some(self.client.targets(Access::Read).await?.into());
        }
        let Some(&node) = self.nodes.as_ref().and_then(|nodes| nodes.front()) else {
            self.done = true;
            return Ok(Vec::new());
        };
        let page = self
            .client
            .scan_node(node, self.cursor, &self.pattern, self.count)
            .await?;
        if page.is_last() {
            if let Some(nodes) = self.nodes.as_mut() {
                nodes.pop_front();
            }
            self.cursor = 0;
        } else {
            self.cursor = page.cursor;
        }
        Ok(page.keys)
    }
}

impl std::fmt::Debug for AsyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncClient")
            .field("servers", &self.core.options.servers)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
