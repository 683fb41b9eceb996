//! # CacheKV Client Engine
//!
//! Purpose: Connect a key-value cache layer to Redis-compatible servers,
//! standalone or sharded, from blocking threads and async tasks alike.
//!
//! ## Design Principles
//! 1. **One Core, Two Executors**: [`Client`] and [`AsyncClient`] share
//!    routing, the codec chain, scripts and configuration; they differ only
//!    in how they wait for I/O.
//! 2. **Object Pool Pattern**: Connections are pooled per server index, and
//!    per scheduler for cooperative use.
//! 3. **Write One, Read Many**: Values are written with the first codec of
//!    the chain and read with any of them, so formats can migrate.
//! 4. **Protocol Clarity**: RESP2 is framed explicitly; nothing else of the
//!    wire protocol is reimplemented.
//!
//! ## Module Map
//! ```text
//! Client / AsyncClient ──► engine (Op, Batch, FanOut) ──► ops
//!        │                       │
//!        │                       ├─► router (slots, redirects)
//!        │                       ├─► codec (serializers, compressors)
//!        │                       └─► script (registry, hooks)
//!        └─► manager ──► pool / async_pool ──► connection ──► resp
//! ```

mod async_client;
mod async_pool;
mod client;
mod codec;
mod command;
mod connection;
mod engine;
mod lock;
mod manager;
mod ops;
mod pipeline;
mod pool;
mod resp;
mod router;
mod scheduler;
mod script;

pub use async_client::AsyncClient;
pub use async_pool::AsyncPooledConnection;
pub use client::{Client, ClientBuilder, KeyIter};
pub use codec::{CodecChain, Compressor, Serializer};
pub use command::{Cmd, ToArg};
pub use lock::{AsyncLock, Lock, ACQUIRE_SCRIPT, EXTEND_SCRIPT, RELEASE_SCRIPT};
pub use ops::SetCondition;
pub use pipeline::{Pipeline, PipelineResults};
pub use pool::PooledConnection;
pub use resp::RespValue;
pub use router::{group_by_slot, KeyGroup, Route};
pub use scheduler::{Scheduler, SchedulerObserver};
pub use script::{hooks, sha1_hex, reply_to_json, KeyTransform, PostHook, PreHook, ScriptHelpers};

pub use ckv_common::*;
