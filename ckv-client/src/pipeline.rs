//! # Pipelines
//!
//! Purpose: Queue commands and send them in one round trip per server.
//!
//! ## Design Principles
//! 1. **Executor Independent**: A [`Pipeline`] is plain data; both executors
//!    run it through the same planning and unpacking code.
//! 2. **Queue Order Out**: Replies are merged back into queue order no matter
//!    how commands were grouped per server.
//! 3. **Atomic Means One Slot**: A transactional pipeline wraps each server's
//!    batch in `MULTI`/`EXEC`; on a cluster it may touch only one slot, which
//!    is checked before any I/O.

use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use ckv_common::{Access, CacheError, CacheResult, Expiry, TopologyError};
use hashbrown::{HashMap, HashSet};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Cmd;
use crate::engine::Core;
use crate::ops::{decode_opt, integer};
use crate::resp::RespValue;
use crate::router::Route;

struct Entry {
    route: Route,
    access: Access,
    cmd: Cmd,
}

/// Positions of queued commands that go to one node.
pub(crate) struct NodeBatch {
    pub node: usize,
    pub positions: Vec<usize>,
}

/// Queued commands.
pub struct Pipeline {
    core: Arc<Core>,
    transactional: bool,
    entries: Vec<Entry>,
}

impl Pipeline {
    pub(crate) fn new(core: Arc<Core>, transactional: bool) -> Self {
        Pipeline {
            core,
            transactional,
            entries: Vec::new(),
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, access: Access, cmd: Cmd) -> &mut Self {
        let route = cmd
            .key_names()
            .first()
            .map_or(Route::Any, |key| Route::for_key(key));
        self.entries.push(Entry { route, access, cmd });
        self
    }

    /// Queues a write. A zero timeout queues a delete instead.
    pub fn set<V: Serialize + ?Sized>(&mut self, key: &str, value: &V, expiry: Expiry) -> CacheResult<&mut Self> {
        let ttl = expiry.resolve(self.core.options.default_timeout);
        if ttl.is_some_and(|t| t.is_zero()) {
            return Ok(self.delete(key));
        }
        let bytes = self.core.codec.encode(value).map_err(|e| e.with_key(key))?;
        let mut cmd = Cmd::new("SET").key(key).bytes(bytes);
        if let Some(ttl) = ttl {
            cmd = cmd.arg("PX").millis(ttl);
        }
        Ok(self.push(Access::Write, cmd))
    }

    pub fn get(&mut self, key: &str) -> &mut Self {
        self.push(Access::Read, Cmd::new("GET").key(key))
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.push(Access::Write, Cmd::new("DEL").key(key))
    }

    pub fn incr(&mut self, key: &str, delta: i64) -> &mut Self {
        self.push(Access::Write, Cmd::new("INCRBY").key(key).arg(&delta))
    }

    pub fn expire(&mut self, key: &str, ttl: Duration) -> &mut Self {
        self.push(Access::Write, Cmd::new("PEXPIRE").key(key).millis(ttl))
    }

    /// Queues an arbitrary command, routed by its first key.
    pub fn raw(&mut self, cmd: Cmd) -> &mut Self {
        self.push(Access::Write, cmd)
    }

    /// Rejects transactions that cannot run atomically on a cluster.
    pub(crate) fn check(&self) -> CacheResult<()> {
        if !(self.transactional && self.core.router.is_cluster()) {
            return Ok(());
        }
        let slots: HashSet<u16, RandomState> = self
            .entries
            .iter()
            .filter_map(|entry| match entry.route {
                Route::Slot(slot) => Some(slot),
                _ => None,
            })
            .collect();
        if slots.len() > 1 {
            let keys: Vec<String> = self
                .entries
                .iter()
                .flat_map(|entry| entry.cmd.key_names().iter().cloned())
                .collect();
            return Err(CacheError::from(TopologyError::Pipeline(format!(
                "transaction spans {} slots",
                slots.len()
            )))
            .with_keys(keys));
        }
        Ok(())
    }

    /// Groups queued commands per node, in first-seen node order. A
    /// transaction is kept on one node.
    pub(crate) fn plan(&self) -> CacheResult<Vec<NodeBatch>> {
        let mut index: HashMap<usize, usize, RandomState> = HashMap::with_hasher(RandomState::new());
        let mut batches: Vec<NodeBatch> = Vec::new();
        // Reads inside a transaction go where the writes go.
        let force_write = self.transactional;
        for (position, entry) in self.entries.iter().enumerate() {
            let access = if force_write { Access::Write } else { entry.access };
            let node = self.core.router.resolve(entry.route, access)?;
            let batch = *index.entry(node).or_insert_with(|| {
                batches.push(NodeBatch {
                    node,
                    positions: Vec::new(),
                });
                batches.len() - 1
            });
            batches[batch].positions.push(position);
        }
        Ok(batches)
    }

    /// Commands to send for one node batch.
    pub(crate) fn commands(&self, batch: &NodeBatch) -> Vec<Cmd> {
        let mut cmds = Vec::with_capacity(batch.positions.len() + 2);
        if self.transactional {
            cmds.push(Cmd::new("MULTI"));
        }
        cmds.extend(batch.positions.iter().map(|&p| self.entries[p].cmd.clone()));
        if self.transactional {
            cmds.push(Cmd::new("EXEC"));
        }
        cmds
    }

    /// Extracts per-command replies from the replies to [`Self::commands`].
    pub(crate) fn unpack(&self, batch: &NodeBatch, replies: Vec<RespValue>) -> CacheResult<Vec<RespValue>> {
        if !self.transactional {
            if replies.len() != batch.positions.len() {
                return Err(CacheError::Protocol("pipeline reply count mismatch".into()));
            }
            return Ok(replies);
        }
        let keys: Vec<String> = batch
            .positions
            .iter()
            .flat_map(|&p| self.entries[p].cmd.key_names().iter().cloned())
            .collect();
        let exec = replies
            .into_iter()
            .last()
            .ok_or_else(|| CacheError::Protocol("missing EXEC reply".into()))?;
        match self.core.check(exec).map_err(|e| e.with_keys(keys.iter().cloned()))? {
            RespValue::Array(Some(items)) if items.len() == batch.positions.len() => Ok(items),
            RespValue::Array(None) => Err(CacheError::Server("transaction aborted".into()).with_keys(keys)),
            other => Err(CacheError::Protocol(format!("unexpected EXEC reply {other:?}"))),
        }
    }

    pub(crate) fn command(&self, position: usize) -> &Cmd {
        &self.entries[position].cmd
    }

    pub(crate) fn finish(&self, replies: Vec<Option<RespValue>>) -> CacheResult<PipelineResults> {
        let replies = replies
            .into_iter()
            .map(|reply| reply.ok_or_else(|| CacheError::Protocol("pipeline reply missing".into())))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok(PipelineResults {
            core: self.core.clone(),
            replies,
        })
    }
}

/// Replies of an executed pipeline, in queue order.
pub struct PipelineResults {
    core: Arc<Core>,
    replies: Vec<RespValue>,
}

impl std::fmt::Debug for PipelineResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineResults")
            .field("replies", &self.replies)
            .finish_non_exhaustive()
    }
}

impl PipelineResults {
    pub fn len(&self) -> usize {
        self.replies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replies.is_empty()
    }

    pub fn raw(&self, index: usize) -> Option<&RespValue> {
        self.replies.get(index)
    }

    fn reply(&self, index: usize) -> CacheResult<RespValue> {
        let reply = self
            .replies
            .get(index)
            .cloned()
            .ok_or_else(|| CacheError::NotFound(format!("pipeline result {index}")))?;
        self.core.check(reply)
    }

    /// Decoded value of a `get`.
    pub fn value<T: DeserializeOwned>(&self, index: usize) -> CacheResult<Option<T>> {
        decode_opt(&self.core, self.reply(index)?)
    }

    pub fn integer(&self, index: usize) -> CacheResult<i64> {
        integer(self.reply(index)?)
    }

    /// `+OK` and non-zero integers are true; nil and zero are false.
    pub fn boolean(&self, index: usize) -> CacheResult<bool> {
        match self.reply(index)? {
            ok if ok.is_ok() => Ok(true),
            nil if nil.is_nil() => Ok(false),
            other => integer(other).map(|n| n != 0),
        }
    }

    pub fn into_replies(self) -> Vec<RespValue> {
        self.replies
    }
}
