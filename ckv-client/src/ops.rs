//! # Operation Catalogue
//!
//! Every cache operation, described once as an [`Op`], [`Batch`] or
//! [`FanOut`] and run by either executor. Constructors encode values up front
//! so codec failures surface before any I/O; parsers decode replies.
//!
//! Defaults returned under `ignore_exceptions` are attached here with
//! [`Op::or`]: reads degrade to a miss, writes to `false`.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ckv_common::{
    Access, CacheError, CacheResult, Expiry, InfoSnapshot, KeyType, ScanPage, SlowlogEntry, Ttl,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::command::Cmd;
use crate::engine::{is_noscript, Batch, Core, FanOut, Op, Part, Step};
use crate::resp::RespValue;
use crate::router::Route;

/// Condition attached to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// `NX`: only store when the key does not exist.
    IfMissing,
    /// `XX`: only store when the key already exists.
    IfExists,
}

// ========== Reply helpers ==========

fn unexpected(expected: &str, got: &RespValue) -> CacheError {
    CacheError::Protocol(format!("expected {expected} reply, got {got:?}"))
}

pub(crate) fn integer(reply: RespValue) -> CacheResult<i64> {
    reply.as_integer().ok_or_else(|| unexpected("integer", &reply))
}

fn count(reply: RespValue) -> CacheResult<u64> {
    Ok(integer(reply)?.max(0) as u64)
}

fn flag(reply: RespValue) -> CacheResult<bool> {
    Ok(integer(reply)? != 0)
}

/// `+OK` is true, nil (condition not met) is false.
fn stored(reply: RespValue) -> CacheResult<bool> {
    match reply {
        ref ok if ok.is_ok() => Ok(true),
        RespValue::Bulk(None) | RespValue::Array(None) => Ok(false),
        other => Err(unexpected("OK or nil", &other)),
    }
}

fn text(reply: RespValue) -> CacheResult<String> {
    reply.as_text().ok_or_else(|| unexpected("string", &reply))
}

fn array(reply: RespValue) -> CacheResult<Vec<RespValue>> {
    match reply {
        RespValue::Array(Some(items)) => Ok(items),
        RespValue::Array(None) => Ok(Vec::new()),
        other => Err(unexpected("array", &other)),
    }
}

fn texts(reply: RespValue) -> CacheResult<Vec<String>> {
    array(reply)?.into_iter().map(text).collect()
}

pub(crate) fn decode_opt<T: DeserializeOwned>(core: &Core, reply: RespValue) -> CacheResult<Option<T>> {
    match reply {
        RespValue::Bulk(None) | RespValue::Array(None) => Ok(None),
        RespValue::Bulk(Some(bytes)) => core.codec.decode(&bytes).map(Some),
        other => Err(unexpected("bulk", &other)),
    }
}

fn decode_all<T: DeserializeOwned>(core: &Core, reply: RespValue) -> CacheResult<Vec<T>> {
    array(reply)?
        .into_iter()
        .map(|item| match item {
            RespValue::Bulk(Some(bytes)) => core.codec.decode(&bytes),
            other => Err(unexpected("bulk", &other)),
        })
        .collect()
}

/// The single reply of a one-command part, checked for server errors.
fn only_reply(core: &Core, replies: Vec<RespValue>) -> CacheResult<RespValue> {
    let reply = replies
        .into_iter()
        .next()
        .ok_or_else(|| CacheError::Protocol("missing reply".into()))?;
    core.check(reply)
}

fn encode<V: Serialize + ?Sized>(core: &Core, key: &str, value: &V) -> CacheResult<Vec<u8>> {
    core.codec.encode(value).map_err(|err| err.with_key(key))
}

fn encode_all<V: Serialize>(core: &Core, key: &str, values: &[V]) -> CacheResult<Vec<Vec<u8>>> {
    values.iter().map(|value| encode(core, key, value)).collect()
}

fn effective(core: &Core, expiry: Expiry) -> Option<Duration> {
    expiry.resolve(core.options.default_timeout)
}

fn owned_keys<K: AsRef<str>>(keys: &[K]) -> Vec<String> {
    keys.iter().map(|k| k.as_ref().to_string()).collect()
}

// ========== Strings ==========

pub(crate) fn get<T>(key: &str) -> Op<Option<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    Op::read(key, Cmd::new("GET").key(key), decode_opt).or(None)
}

pub(crate) fn set_with<V>(
    core: &Core,
    key: &str,
    value: &V,
    expiry: Expiry,
    condition: SetCondition,
) -> CacheResult<Op<bool>>
where
    V: Serialize + ?Sized,
{
    let bytes = encode(core, key, value)?;
    match effective(core, expiry) {
        // A zero timeout means "do not keep". An NX write reports whether
        // it would have stored; an XX write never stores and leaves the key.
        Some(ttl) if ttl.is_zero() => Ok(match condition {
            SetCondition::Always => delete(key),
            SetCondition::IfMissing => {
                Op::read(key, Cmd::new("EXISTS").key(key), |_, r| Ok(integer(r)? == 0)).or(false)
            }
            SetCondition::IfExists => Op::read(key, Cmd::new("EXISTS").key(key), |_, _| Ok(false)).or(false),
        }),
        ttl => {
            let mut cmd = Cmd::new("SET").key(key).bytes(bytes);
            if let Some(ttl) = ttl {
                cmd = cmd.arg("PX").millis(ttl);
            }
            match condition {
                SetCondition::Always => {}
                SetCondition::IfMissing => cmd.push_arg("NX"),
                SetCondition::IfExists => cmd.push_arg("XX"),
            }
            Ok(Op::write(key, cmd, |_, r| stored(r)).or(false))
        }
    }
}

pub(crate) fn touch(core: &Core, key: &str, expiry: Expiry) -> Op<bool> {
    match effective(core, expiry) {
        None => Op::write(key, Cmd::new("PERSIST").key(key), |_, r| flag(r)).or(false),
        Some(ttl) if ttl.is_zero() => delete(key),
        Some(ttl) => Op::write(key, Cmd::new("PEXPIRE").key(key).millis(ttl), |_, r| flag(r)).or(false),
    }
}

pub(crate) fn delete(key: &str) -> Op<bool> {
    Op::write(key, Cmd::new("DEL").key(key), |_, r| flag(r)).or(false)
}

pub(crate) fn has_key(key: &str) -> Op<bool> {
    Op::read(key, Cmd::new("EXISTS").key(key), |_, r| flag(r)).or(false)
}

pub(crate) fn key_type(key: &str) -> Op<Option<KeyType>> {
    Op::read(key, Cmd::new("TYPE").key(key), |_, r| {
        let name = text(r)?;
        if name == "none" {
            return Ok(None);
        }
        name.parse::<KeyType>()
            .map(Some)
            .map_err(|_| CacheError::Protocol(format!("unknown key type {name:?}")))
    })
}

/// Type-aware size: string length, or element count for collections.
pub(crate) fn size(key: &str) -> Op<u64> {
    let owned = key.to_string();
    Op::chained(Route::for_key(key), Access::Read, Cmd::new("TYPE").key(key), move |_, r| {
        let name = text(r)?;
        let command = match name.parse::<KeyType>() {
            Ok(KeyType::String) => "STRLEN",
            Ok(KeyType::List) => "LLEN",
            Ok(KeyType::Set) => "SCARD",
            Ok(KeyType::Hash) => "HLEN",
            Ok(KeyType::ZSet) => "ZCARD",
            Ok(KeyType::Stream) => "XLEN",
            Err(()) => return Ok(Step::Done(0)),
        };
        Ok(Step::Next(Op::read(&owned, Cmd::new(command).key(&owned), |_, r| count(r))))
    })
}

/// INCRBY on an existing key; a missing key is [`CacheError::NotFound`].
pub(crate) fn incr(key: &str, delta: i64) -> Op<i64> {
    let owned = key.to_string();
    Op::chained(Route::for_key(key), Access::Write, Cmd::new("EXISTS").key(key), move |_, r| {
        if integer(r)? == 0 {
            return Err(CacheError::NotFound(owned));
        }
        Ok(Step::Next(incr_by(owned, delta)))
    })
}

pub(crate) fn decr(key: &str, delta: i64) -> CacheResult<Op<i64>> {
    let delta = delta
        .checked_neg()
        .ok_or_else(|| CacheError::Config(format!("decrement {delta} cannot be negated")).with_key(key))?;
    Ok(incr(key, delta))
}

/// Whether INCRBY refused the stored value rather than the request.
fn needs_decode(message: &[u8]) -> bool {
    let message = String::from_utf8_lossy(message);
    message.contains("value is not an integer") || message.contains("would overflow")
}

fn incr_by(key: String, delta: i64) -> Op<i64> {
    let cmd = Cmd::new("INCRBY").key(&key).arg(&delta);
    Op::chained(Route::for_key(&key), Access::Write, cmd, move |core, r| match r {
        RespValue::Error(message) if needs_decode(&message) => {
            let message = String::from_utf8_lossy(&message).into_owned();
            debug!(key = %key, "INCRBY refused, incrementing the decoded value");
            Ok(Step::Next(incr_decoded(key, delta, message)))
        }
        other => core.check(other).and_then(integer).map(Step::Done),
    })
    .raw_errors()
}

/// Read, decode, add and write back, keeping the key's TTL. Values written
/// through a serializer are not server-side integers.
fn incr_decoded(key: String, delta: i64, refusal: String) -> Op<i64> {
    let route = Route::for_key(&key);
    Op::chained(route, Access::Write, Cmd::new("GET").key(&key), move |core, r| {
        let Some(current) = decode_opt::<i64>(core, r)? else {
            return Err(CacheError::NotFound(key));
        };
        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Server(refusal))?;
        let bytes = encode(core, &key, &next)?;
        let cmd = Cmd::new("SET").key(&key).bytes(bytes).arg("KEEPTTL");
        Ok(Step::Next(Op::write(&key, cmd, move |_, r| {
            stored(r)?;
            Ok(next)
        })))
    })
}

// ========== Expiration ==========

pub(crate) fn ttl(key: &str) -> Op<Ttl> {
    Op::read(key, Cmd::new("TTL").key(key), |_, r| Ok(Ttl::from_reply(integer(r)?, false)))
}

pub(crate) fn pttl(key: &str) -> Op<Ttl> {
    Op::read(key, Cmd::new("PTTL").key(key), |_, r| Ok(Ttl::from_reply(integer(r)?, true)))
}

/// Absolute expiration. `None` for a missing key and for a key without one.
pub(crate) fn expire_time(key: &str) -> Op<Option<SystemTime>> {
    Op::read(key, Cmd::new("PEXPIRETIME").key(key), |_, r| {
        let millis = integer(r)?;
        Ok((millis >= 0).then(|| UNIX_EPOCH + Duration::from_millis(millis as u64)))
    })
}

pub(crate) fn expire(key: &str, ttl: Duration) -> Op<bool> {
    // Whole seconds, rounded up so a sub-second timeout never expires at once.
    let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
    Op::write(key, Cmd::new("EXPIRE").key(key).arg(&secs), |_, r| flag(r))
}

pub(crate) fn pexpire(key: &str, ttl: Duration) -> Op<bool> {
    let millis = ttl.as_millis() as u64;
    Op::write(key, Cmd::new("PEXPIRE").key(key).arg(&millis), |_, r| flag(r))
}

pub(crate) fn expire_at(key: &str, when: SystemTime) -> Op<bool> {
    let millis = when
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Op::write(key, Cmd::new("PEXPIREAT").key(key).arg(&millis), |_, r| flag(r))
}

pub(crate) fn persist(key: &str) -> Op<bool> {
    Op::write(key, Cmd::new("PERSIST").key(key), |_, r| flag(r))
}

// ========== Bulk ==========

pub(crate) fn get_many<K, T>(core: &Core, keys: &[K]) -> Batch<Vec<Option<T>>>
where
    K: AsRef<str>,
    T: DeserializeOwned + Send + 'static,
{
    let keys = owned_keys(keys);
    let groups = core.router.group_keys(&keys);
    let parts = groups
        .iter()
        .map(|group| {
            let group_keys: Vec<String> = group.positions.iter().map(|&p| keys[p].clone()).collect();
            Part {
                route: group.route,
                access: Access::Read,
                cmds: vec![Cmd::new("MGET").keys(&group_keys)],
                keys: group_keys,
            }
        })
        .collect();
    let positions: Vec<Vec<usize>> = groups.into_iter().map(|g| g.positions).collect();

    Batch {
        parts,
        merge: Box::new(move |core, results| {
            let mut out: Vec<Option<T>> = std::iter::repeat_with(|| None).take(keys.len()).collect();
            for (positions, result) in positions.into_iter().zip(results) {
                let replies = match result {
                    Ok(replies) => replies,
                    Err(err) if core.absorbable(&err) => continue,
                    Err(err) => return Err(err),
                };
                let values = array(only_reply(core, replies)?)?;
                for (position, value) in positions.into_iter().zip(values) {
                    out[position] = decode_opt(core, value).map_err(|e| e.with_key(&keys[position]))?;
                }
            }
            Ok(out)
        }),
    }
}

/// MSET per slot group, each followed by PEXPIRE per key when a timeout
/// applies. Returns the keys whose group failed and was absorbed.
pub(crate) fn set_many<K, V>(core: &Core, items: &[(K, V)], expiry: Expiry) -> CacheResult<Batch<Vec<String>>>
where
    K: AsRef<str>,
    V: Serialize,
{
    let keys: Vec<String> = items.iter().map(|(k, _)| k.as_ref().to_string()).collect();
    let ttl = effective(core, expiry);
    if ttl.is_some_and(|t| t.is_zero()) {
        return Ok(delete_reporting_failed(core, &keys));
    }

    let mut encoded = Vec::with_capacity(items.len());
    for (key, value) in items {
        encoded.push(encode(core, key.as_ref(), value)?);
    }
    let groups = core.router.group_keys(&keys);
    let parts: Vec<Part> = groups
        .iter()
        .map(|group| {
            let mut mset = Cmd::new("MSET");
            for &p in &group.positions {
                mset.push_key(&keys[p]);
                mset.push_arg(&encoded[p]);
            }
            let mut cmds = vec![mset];
            if let Some(ttl) = ttl {
                cmds.extend(
                    group
                        .positions
                        .iter()
                        .map(|&p| Cmd::new("PEXPIRE").key(&keys[p]).millis(ttl)),
                );
            }
            Part {
                route: group.route,
                access: Access::Write,
                cmds,
                keys: group.positions.iter().map(|&p| keys[p].clone()).collect(),
            }
        })
        .collect();
    let group_keys: Vec<Vec<String>> = parts.iter().map(|p| p.keys.clone()).collect();

    Ok(Batch {
        parts,
        merge: Box::new(move |core, results| {
            let mut failed = Vec::new();
            for (keys, result) in group_keys.into_iter().zip(results) {
                match result {
                    Ok(replies) => {
                        for reply in replies {
                            core.check(reply).map_err(|e| e.with_keys(keys.iter().cloned()))?;
                        }
                    }
                    Err(err) if core.absorbable(&err) => failed.extend(keys),
                    Err(err) => return Err(err),
                }
            }
            Ok(failed)
        }),
    })
}

pub(crate) fn delete_many<K: AsRef<str>>(core: &Core, keys: &[K]) -> Batch<u64> {
    let keys = owned_keys(keys);
    let groups = core.router.group_keys(&keys);
    let parts = groups
        .iter()
        .map(|group| {
            let group_keys: Vec<String> = group.positions.iter().map(|&p| keys[p].clone()).collect();
            Part {
                route: group.route,
                access: Access::Write,
                cmds: vec![Cmd::new("DEL").keys(&group_keys)],
                keys: group_keys,
            }
        })
        .collect();
    Batch {
        parts,
        merge: Box::new(|core, results| {
            let mut removed = 0;
            for result in results {
                match result {
                    Ok(replies) => removed += count(only_reply(core, replies)?)?,
                    Err(err) if core.absorbable(&err) => {}
                    Err(err) => return Err(err),
                }
            }
            Ok(removed)
        }),
    }
}

/// DEL per group with a merge that reports the keys of absorbed groups.
fn delete_reporting_failed(core: &Core, keys: &[String]) -> Batch<Vec<String>> {
    let Batch { parts, .. } = delete_many(core, keys);
    let group_keys: Vec<Vec<String>> = parts.iter().map(|p| p.keys.clone()).collect();
    Batch {
        parts,
        merge: Box::new(move |core, results| {
            let mut failed = Vec::new();
            for (keys, result) in group_keys.into_iter().zip(results) {
                match result {
                    Ok(replies) => {
                        only_reply(core, replies)?;
                    }
                    Err(err) if core.absorbable(&err) => failed.extend(keys),
                    Err(err) => return Err(err),
                }
            }
            Ok(failed)
        }),
    }
}

// ========== Keyspace ==========

pub(crate) fn clear() -> FanOut<()> {
    FanOut {
        access: Access::Write,
        cmd: Cmd::new("FLUSHDB"),
        merge: Box::new(|_, _| Ok(())),
    }
}

pub(crate) fn keys(pattern: &str) -> FanOut<Vec<String>> {
    FanOut {
        access: Access::Read,
        cmd: Cmd::new("KEYS").arg(pattern),
        merge: Box::new(|_, replies| {
            let mut out = Vec::new();
            for (_, reply) in replies {
                out.extend(texts(reply)?);
            }
            Ok(out)
        }),
    }
}

pub(crate) fn scan_cmd(cursor: u64, pattern: &str, count: usize) -> Cmd {
    Cmd::new("SCAN")
        .arg(&cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(&count)
}

pub(crate) fn parse_scan(reply: RespValue) -> CacheResult<ScanPage> {
    let mut fields = array(reply)?.into_iter();
    let (Some(cursor), Some(keys)) = (fields.next(), fields.next()) else {
        return Err(CacheError::Protocol("SCAN: expected [cursor, keys]".into()));
    };
    let cursor = cursor
        .as_integer()
        .and_then(|c| u64::try_from(c).ok())
        .ok_or_else(|| unexpected("cursor", &cursor))?;
    Ok(ScanPage {
        cursor,
        keys: texts(keys)?,
    })
}

/// One cursor step. Cursors are per node, so clusters only support
/// iteration through `iter_keys`.
pub(crate) fn scan(core: &Core, cursor: u64, pattern: &str, count: Option<usize>) -> CacheResult<Op<ScanPage>> {
    if core.router.is_cluster() {
        return Err(CacheError::NotSupported(
            "cursor scan over a cluster; use iter_keys".into(),
        ));
    }
    let count = count.unwrap_or(core.options.scan_count);
    // Cursors belong to the node that issued them; replicas are picked at
    // random per request, so steps always go to the primary.
    Ok(Op::new(
        Route::Node(0),
        Access::Read,
        scan_cmd(cursor, pattern, count),
        |_, r| parse_scan(r),
    ))
}

pub(crate) fn rename(src: &str, dst: &str) -> Op<()> {
    let owned = src.to_string();
    Op::write(src, Cmd::new("RENAME").key(src).key(dst), move |core, r| {
        rename_reply(core, r, owned).map(|_| ())
    })
    .raw_errors()
}

pub(crate) fn renamenx(src: &str, dst: &str) -> Op<bool> {
    let owned = src.to_string();
    Op::write(src, Cmd::new("RENAMENX").key(src).key(dst), move |core, r| {
        flag(rename_reply(core, r, owned)?)
    })
    .raw_errors()
}

fn rename_reply(core: &Core, reply: RespValue, src: String) -> CacheResult<RespValue> {
    match &reply {
        RespValue::Error(message) if message.ends_with(b"no such key") => Err(CacheError::NotFound(src)),
        _ => core.check(reply),
    }
}

// ========== Sets ==========

pub(crate) fn sadd<V: Serialize>(core: &Core, key: &str, members: &[V]) -> CacheResult<Op<u64>> {
    let mut cmd = Cmd::new("SADD").key(key);
    for member in encode_all(core, key, members)? {
        cmd = cmd.bytes(member);
    }
    Ok(Op::write(key, cmd, |_, r| count(r)))
}

pub(crate) fn srem<V: Serialize>(core: &Core, key: &str, members: &[V]) -> CacheResult<Op<u64>> {
    let mut cmd = Cmd::new("SREM").key(key);
    for member in encode_all(core, key, members)? {
        cmd = cmd.bytes(member);
    }
    Ok(Op::write(key, cmd, |_, r| count(r)))
}

pub(crate) fn smembers<T: DeserializeOwned + Send + 'static>(key: &str) -> Op<Vec<T>> {
    Op::read(key, Cmd::new("SMEMBERS").key(key), decode_all)
}

pub(crate) fn sismember<V: Serialize + ?Sized>(core: &Core, key: &str, member: &V) -> CacheResult<Op<bool>> {
    let member = encode(core, key, member)?;
    Ok(Op::read(key, Cmd::new("SISMEMBER").key(key).bytes(member), |_, r| flag(r)))
}

pub(crate) fn scard(key: &str) -> Op<u64> {
    Op::read(key, Cmd::new("SCARD").key(key), |_, r| count(r))
}

/// Set algebra over several keys. Keys are not regrouped; a cluster rejects
/// keys in different slots with CROSSSLOT.
pub(crate) fn set_algebra<K, T>(command: &str, keys: &[K]) -> CacheResult<Op<Vec<T>>>
where
    K: AsRef<str>,
    T: DeserializeOwned + Send + 'static,
{
    let Some(first) = keys.first() else {
        return Err(CacheError::Config(format!("{command} needs at least one key")));
    };
    Ok(Op::read(first.as_ref(), Cmd::new(command).keys(keys), decode_all))
}

// ========== Lists ==========

pub(crate) fn push<V: Serialize>(core: &Core, command: &str, key: &str, values: &[V]) -> CacheResult<Op<u64>> {
    let mut cmd = Cmd::new(command).key(key);
    for value in encode_all(core, key, values)? {
        cmd = cmd.bytes(value);
    }
    Ok(Op::write(key, cmd, |_, r| count(r)))
}

pub(crate) fn pop<T: DeserializeOwned + Send + 'static>(command: &str, key: &str) -> Op<Option<T>> {
    Op::write(key, Cmd::new(command).key(key), decode_opt)
}

pub(crate) fn lrange<T: DeserializeOwned + Send + 'static>(key: &str, start: i64, stop: i64) -> Op<Vec<T>> {
    Op::read(
        key,
        Cmd::new("LRANGE").key(key).arg(&start).arg(&stop),
        decode_all,
    )
}

pub(crate) fn llen(key: &str) -> Op<u64> {
    Op::read(key, Cmd::new("LLEN").key(key), |_, r| count(r))
}

// ========== Hashes ==========

pub(crate) fn hset<V: Serialize + ?Sized>(core: &Core, key: &str, field: &str, value: &V) -> CacheResult<Op<bool>> {
    let value = encode(core, key, value)?;
    Ok(Op::write(
        key,
        Cmd::new("HSET").key(key).arg(field).bytes(value),
        |_, r| flag(r),
    ))
}

pub(crate) fn hget<T: DeserializeOwned + Send + 'static>(key: &str, field: &str) -> Op<Option<T>> {
    Op::read(key, Cmd::new("HGET").key(key).arg(field), decode_opt).or(None)
}

pub(crate) fn hdel<F: AsRef<str>>(key: &str, fields: &[F]) -> Op<u64> {
    let mut cmd = Cmd::new("HDEL").key(key);
    for field in fields {
        cmd.push_arg(field.as_ref());
    }
    Op::write(key, cmd, |_, r| count(r))
}

pub(crate) fn hgetall<T: DeserializeOwned + Send + 'static>(key: &str) -> Op<BTreeMap<String, T>> {
    Op::read(key, Cmd::new("HGETALL").key(key), |core, r| {
        let mut items = array(r)?.into_iter();
        let mut out = BTreeMap::new();
        while let (Some(field), Some(value)) = (items.next(), items.next()) {
            let Some(value) = decode_opt(core, value)? else {
                continue;
            };
            out.insert(text(field)?, value);
        }
        Ok(out)
    })
}

pub(crate) fn hlen(key: &str) -> Op<u64> {
    Op::read(key, Cmd::new("HLEN").key(key), |_, r| count(r))
}

// ========== Introspection ==========

pub(crate) fn ping() -> Op<()> {
    Op::new(Route::Any, Access::Write, Cmd::new("PING"), |_, r| match r.as_bytes() {
        Some(b"PONG") => Ok(()),
        _ => Err(unexpected("PONG", &r)),
    })
}

/// INFO from every data-owning node. A cluster snapshot prefixes section
/// names with the node address.
pub(crate) fn info(section: Option<&str>) -> FanOut<InfoSnapshot> {
    let mut cmd = Cmd::new("INFO");
    if let Some(section) = section {
        cmd.push_arg(section);
    }
    FanOut {
        access: Access::Read,
        cmd,
        merge: Box::new(|core, replies| {
            if !core.router.is_cluster() {
                let text = replies.into_iter().next().map(|(_, r)| text(r)).transpose()?;
                return Ok(InfoSnapshot::parse(&text.unwrap_or_default()));
            }
            let mut snapshot = InfoSnapshot::default();
            for (node, reply) in replies {
                let label = core.router.address(node)?.label();
                snapshot.merge_prefixed(&label, InfoSnapshot::parse(&text(reply)?));
            }
            Ok(snapshot)
        }),
    }
}

pub(crate) fn slowlog_get(count: usize) -> FanOut<Vec<SlowlogEntry>> {
    FanOut {
        access: Access::Read,
        cmd: Cmd::new("SLOWLOG").arg("GET").arg(&count),
        merge: Box::new(|_, replies| {
            let mut entries = Vec::new();
            for (_, reply) in replies {
                for entry in array(reply)? {
                    entries.push(slowlog_entry(entry)?);
                }
            }
            entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
            Ok(entries)
        }),
    }
}

pub(crate) fn slowlog_len() -> FanOut<u64> {
    FanOut {
        access: Access::Read,
        cmd: Cmd::new("SLOWLOG").arg("LEN"),
        merge: Box::new(|_, replies| {
            replies
                .into_iter()
                .map(|(_, reply)| count(reply))
                .sum::<CacheResult<u64>>()
        }),
    }
}

fn slowlog_entry(reply: RespValue) -> CacheResult<SlowlogEntry> {
    let mut fields = array(reply)?.into_iter();
    let mut next_int = |name: &str| {
        fields
            .next()
            .and_then(|f| f.as_integer())
            .ok_or_else(|| CacheError::Protocol(format!("SLOWLOG: missing {name}")))
    };
    let id = next_int("id")?;
    let timestamp = UNIX_EPOCH + Duration::from_secs(next_int("timestamp")?.max(0) as u64);
    let duration = Duration::from_micros(next_int("duration")?.max(0) as u64);
    let command = match fields.next() {
        Some(args) => texts(args)?,
        None => Vec::new(),
    };
    Ok(SlowlogEntry {
        id,
        timestamp,
        duration,
        command,
    })
}

// ========== Scripts ==========

fn script_cmd(command: &str, body: &str, keys: &[String], args: &[Vec<u8>]) -> Cmd {
    let mut cmd = Cmd::new(command).arg(body).arg(&keys.len()).keys(keys);
    for arg in args {
        cmd.push_arg(arg);
    }
    cmd
}

/// `EVALSHA`, falling back to `EVAL` once when the server lacks the script.
pub(crate) fn eval(core: &Core, name: &str, keys: Vec<String>, args: Vec<Value>) -> CacheResult<Op<Value>> {
    let script = core.scripts.get(name)?;
    let (keys, args) = script.prepare(&core.helpers(), keys, args)?;
    let route = keys.first().map_or(Route::Any, |k| Route::for_key(k));
    let by_digest = script_cmd("EVALSHA", script.digest(), &keys, &args);

    Ok(Op::chained(route, Access::Write, by_digest, move |core, reply| {
        if is_noscript(&reply) {
            debug!(script = script.name(), "NOSCRIPT, resubmitting source");
            let by_source = script_cmd("EVAL", script.source(), &keys, &args);
            return Ok(Step::Next(Op::new(route, Access::Write, by_source, move |core, reply| {
                script.finish(&core.helpers(), reply)
            })));
        }
        let reply = core.check(reply)?;
        script.finish(&core.helpers(), reply).map(Step::Done)
    })
    .raw_errors())
}
