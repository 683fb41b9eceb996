//! # Data Commands
//!
//! Purpose: Execute key-space commands against a [`Store`].
//!
//! ## Design Principles
//! 1. **Redis Semantics Where Observable**: Reply shapes and error texts
//!    follow what a real server sends, because the client parses them.
//! 2. **Connection State Elsewhere**: Transactions, scripts, cluster checks
//!    and administrative commands live in the server; this module only sees
//!    one command and the store.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::reply::Reply;
use crate::store::{glob_match, Data, Store, WrongType};

type Outcome = Result<Reply, Reply>;

impl From<WrongType> for Reply {
    fn from(_: WrongType) -> Self {
        Reply::wrong_type()
    }
}

/// Executes one data command. Returns `None` for commands this module does
/// not know, leaving them to the caller.
pub fn execute(store: &mut Store, args: &[Vec<u8>]) -> Option<Reply> {
    let name = String::from_utf8_lossy(args.first()?).to_ascii_uppercase();
    let rest = &args[1..];
    let outcome = match name.as_str() {
        "GET" => get(store, rest),
        "SET" => set(store, rest),
        "MGET" => mget(store, rest),
        "MSET" => mset(store, rest),
        "STRLEN" => strlen(store, rest),
        "INCR" => incr_by(store, rest, Some(1)),
        "DECR" => incr_by(store, rest, Some(-1)),
        "INCRBY" => incr_by(store, rest, None),
        "DECRBY" => decr_by(store, rest),
        "DEL" | "UNLINK" => del(store, rest),
        "EXISTS" => exists(store, rest),
        "TYPE" => key_type(store, rest),
        "RENAME" => rename(store, rest, false),
        "RENAMENX" => rename(store, rest, true),
        "EXPIRE" => expire(store, rest, 1000, false),
        "PEXPIRE" => expire(store, rest, 1, false),
        "EXPIREAT" => expire(store, rest, 1000, true),
        "PEXPIREAT" => expire(store, rest, 1, true),
        "PERSIST" => one_key(rest, "persist").map(|k| Reply::Integer(store.persist(k) as i64)),
        "TTL" => ttl(store, rest, false),
        "PTTL" => ttl(store, rest, true),
        "EXPIRETIME" => expire_time(store, rest, false),
        "PEXPIRETIME" => expire_time(store, rest, true),
        "KEYS" => keys(store, rest),
        "SCAN" => scan(store, rest),
        "DBSIZE" => Ok(Reply::Integer(store.len() as i64)),
        "FLUSHDB" | "FLUSHALL" => {
            store.clear();
            Ok(Reply::ok())
        }
        "SADD" => sadd(store, rest),
        "SREM" => srem(store, rest),
        "SMEMBERS" => smembers(store, rest),
        "SISMEMBER" => sismember(store, rest),
        "SCARD" => scard(store, rest),
        "SINTER" | "SUNION" | "SDIFF" => set_algebra(store, rest, &name),
        "LPUSH" => push(store, rest, true),
        "RPUSH" => push(store, rest, false),
        "LPOP" => pop(store, rest, true),
        "RPOP" => pop(store, rest, false),
        "LRANGE" => lrange(store, rest),
        "LLEN" => llen(store, rest),
        "HSET" => hset(store, rest),
        "HGET" => hget(store, rest),
        "HDEL" => hdel(store, rest),
        "HGETALL" => hgetall(store, rest),
        "HLEN" => hlen(store, rest),
        "ZCARD" => one_key(rest, "zcard").map(|k| match store.data(k) {
            None => Reply::Integer(0),
            Some(_) => Reply::wrong_type(),
        }),
        _ => return None,
    };
    Some(outcome.unwrap_or_else(|err| err))
}

// ========== Argument helpers ==========

fn one_key<'a>(args: &'a [Vec<u8>], command: &str) -> Result<&'a [u8], Reply> {
    match args {
        [key] => Ok(key),
        _ => Err(Reply::arity(command)),
    }
}

fn at_least(args: &[Vec<u8>], n: usize, command: &str) -> Result<(), Reply> {
    if args.len() < n {
        return Err(Reply::arity(command));
    }
    Ok(())
}

pub(crate) fn parse_int(arg: &[u8]) -> Result<i64, Reply> {
    std::str::from_utf8(arg)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(Reply::not_integer)
}

fn upper(arg: &[u8]) -> String {
    String::from_utf8_lossy(arg).to_ascii_uppercase()
}

fn millis_since_epoch(at: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(at.max(0) as u64)
}

// ========== Strings ==========

fn get(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "get")?;
    Ok(Reply::Bulk(store.get_str(key)?))
}

fn set(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 2, "set")?;
    let (key, value) = (&args[0], args[1].clone());
    let mut ttl: Option<Duration> = None;
    let (mut nx, mut xx, mut keep_ttl) = (false, false, false);
    let mut options = args[2..].iter();
    while let Some(option) = options.next() {
        match upper(option).as_str() {
            "NX" => nx = true,
            "XX" => xx = true,
            "KEEPTTL" => keep_ttl = true,
            unit @ ("EX" | "PX") => {
                let amount = parse_int(options.next().ok_or_else(Reply::syntax)?)?;
                if amount <= 0 {
                    return Err(Reply::err("ERR invalid expire time in 'set' command"));
                }
                let millis = if unit == "EX" { amount * 1000 } else { amount };
                ttl = Some(Duration::from_millis(millis as u64));
            }
            _ => return Err(Reply::syntax()),
        }
    }
    if nx && xx {
        return Err(Reply::syntax());
    }
    let present = store.exists(key);
    if (nx && present) || (xx && !present) {
        return Ok(Reply::nil());
    }
    if keep_ttl && ttl.is_none() {
        store.set_keep_ttl(key, value);
    } else {
        store.set_str(key, value, ttl);
    }
    Ok(Reply::ok())
}

fn mget(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 1, "mget")?;
    let values = args
        .iter()
        .map(|key| Reply::Bulk(store.get_str(key).unwrap_or(None)))
        .collect();
    Ok(Reply::array(values))
}

fn mset(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    if args.is_empty() || args.len() % 2 != 0 {
        return Err(Reply::arity("mset"));
    }
    for pair in args.chunks(2) {
        store.set_str(&pair[0], pair[1].clone(), None);
    }
    Ok(Reply::ok())
}

fn strlen(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "strlen")?;
    Ok(Reply::Integer(store.get_str(key)?.map_or(0, |v| v.len() as i64)))
}

fn incr_by(store: &mut Store, args: &[Vec<u8>], fixed: Option<i64>) -> Outcome {
    let (key, delta) = match (fixed, args) {
        (Some(delta), [key]) => (key, delta),
        (None, [key, delta]) => (key, parse_int(delta)?),
        _ => return Err(Reply::arity("incrby")),
    };
    apply_delta(store, key, delta)
}

fn decr_by(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    match args {
        [key, delta] => {
            let delta = parse_int(delta)?.checked_neg().ok_or_else(Reply::not_integer)?;
            apply_delta(store, key, delta)
        }
        _ => Err(Reply::arity("decrby")),
    }
}

fn apply_delta(store: &mut Store, key: &[u8], delta: i64) -> Outcome {
    let current = match store.get_str(key)? {
        Some(bytes) => parse_int(&bytes)?,
        None => 0,
    };
    let next = current.checked_add(delta).ok_or_else(|| {
        Reply::err("ERR increment or decrement would overflow")
    })?;
    store.set_keep_ttl(key, next.to_string().into_bytes());
    Ok(Reply::Integer(next))
}

// ========== Keys ==========

fn del(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 1, "del")?;
    Ok(Reply::Integer(args.iter().filter(|key| store.delete(key)).count() as i64))
}

fn exists(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 1, "exists")?;
    Ok(Reply::Integer(args.iter().filter(|key| store.exists(key)).count() as i64))
}

fn key_type(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "type")?;
    let name = store.data(key).map_or("none", Data::type_name);
    Ok(Reply::Simple(name.into()))
}

fn rename(store: &mut Store, args: &[Vec<u8>], only_new: bool) -> Outcome {
    let [src, dst] = args else {
        return Err(Reply::arity(if only_new { "renamenx" } else { "rename" }));
    };
    if !store.exists(src) {
        return Err(Reply::err("ERR no such key"));
    }
    if only_new && store.exists(dst) {
        return Ok(Reply::Integer(0));
    }
    if let Some(entry) = store.take(src) {
        store.insert(dst.clone(), entry);
    }
    Ok(if only_new { Reply::Integer(1) } else { Reply::ok() })
}

fn expire(store: &mut Store, args: &[Vec<u8>], unit_ms: i64, absolute: bool) -> Outcome {
    let [key, amount] = args else {
        return Err(Reply::arity("expire"));
    };
    let amount = parse_int(amount)?.saturating_mul(unit_ms);
    let at = if absolute {
        millis_since_epoch(amount)
    } else if amount <= 0 {
        UNIX_EPOCH
    } else {
        SystemTime::now() + Duration::from_millis(amount as u64)
    };
    Ok(Reply::Integer(store.expire_at(key, at) as i64))
}

fn ttl(store: &mut Store, args: &[Vec<u8>], millis: bool) -> Outcome {
    let key = one_key(args, "ttl")?;
    let remaining = store.pttl(key);
    Ok(Reply::Integer(if millis || remaining < 0 {
        remaining
    } else {
        // Rounded like the server does.
        (remaining + 500) / 1000
    }))
}

fn expire_time(store: &mut Store, args: &[Vec<u8>], millis: bool) -> Outcome {
    let key = one_key(args, "expiretime")?;
    let at = store.expire_time_ms(key);
    Ok(Reply::Integer(if millis || at < 0 { at } else { at / 1000 }))
}

fn keys(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let pattern = one_key(args, "keys")?;
    let matching: Vec<Vec<u8>> = store
        .keys()
        .into_iter()
        .filter(|key| glob_match(pattern, key))
        .collect();
    Ok(Reply::bulks(matching))
}

/// Cursor is an offset into the sorted key list; a page covers `COUNT`
/// keys before the `MATCH` filter, as on a real server.
fn scan(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 1, "scan")?;
    let cursor = usize::try_from(parse_int(&args[0])?).map_err(|_| Reply::err("ERR invalid cursor"))?;
    let mut pattern: Vec<u8> = b"*".to_vec();
    let mut count = 10usize;
    let mut options = args[1..].iter();
    while let Some(option) = options.next() {
        let value = options.next().ok_or_else(Reply::syntax)?;
        match upper(option).as_str() {
            "MATCH" => pattern = value.clone(),
            "COUNT" => count = usize::try_from(parse_int(value)?).map_err(|_| Reply::syntax())?.max(1),
            _ => return Err(Reply::syntax()),
        }
    }
    let all = store.keys();
    let end = cursor.saturating_add(count).min(all.len());
    let page: Vec<Vec<u8>> = all
        .get(cursor..end)
        .unwrap_or(&[])
        .iter()
        .filter(|key| glob_match(&pattern, key))
        .cloned()
        .collect();
    let next = if end >= all.len() { 0 } else { end };
    Ok(Reply::array(vec![
        Reply::bulk(next.to_string()),
        Reply::bulks(page),
    ]))
}

// ========== Sets ==========

fn sadd(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 2, "sadd")?;
    let set = store.set_mut(&args[0])?;
    let added = args[1..].iter().filter(|m| set.insert(m.to_vec())).count();
    Ok(Reply::Integer(added as i64))
}

fn srem(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 2, "srem")?;
    let key = &args[0];
    if store.data(key).is_none() {
        return Ok(Reply::Integer(0));
    }
    let set = store.set_mut(key)?;
    let removed = args[1..].iter().filter(|m| set.remove(m.as_slice())).count();
    store.drop_if_empty(key);
    Ok(Reply::Integer(removed as i64))
}

fn read_set(store: &mut Store, key: &[u8]) -> Result<Vec<Vec<u8>>, Reply> {
    match store.data(key) {
        None => Ok(Vec::new()),
        Some(Data::Set(set)) => Ok(set.iter().cloned().collect()),
        Some(_) => Err(Reply::wrong_type()),
    }
}

fn smembers(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "smembers")?;
    Ok(Reply::bulks(read_set(store, key)?))
}

fn sismember(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let [key, member] = args else {
        return Err(Reply::arity("sismember"));
    };
    Ok(Reply::Integer(read_set(store, key)?.contains(member) as i64))
}

fn scard(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "scard")?;
    Ok(Reply::Integer(read_set(store, key)?.len() as i64))
}

fn set_algebra(store: &mut Store, args: &[Vec<u8>], op: &str) -> Outcome {
    at_least(args, 1, op)?;
    let mut result = read_set(store, &args[0])?;
    for key in &args[1..] {
        let other = read_set(store, key)?;
        match op {
            "SINTER" => result.retain(|m| other.contains(m)),
            "SDIFF" => result.retain(|m| !other.contains(m)),
            _ => {
                for member in other {
                    if !result.contains(&member) {
                        result.push(member);
                    }
                }
            }
        }
    }
    result.sort();
    Ok(Reply::bulks(result))
}

// ========== Lists ==========

fn push(store: &mut Store, args: &[Vec<u8>], front: bool) -> Outcome {
    at_least(args, 2, if front { "lpush" } else { "rpush" })?;
    let list = store.list_mut(&args[0])?;
    for value in &args[1..] {
        if front {
            list.push_front(value.clone());
        } else {
            list.push_back(value.clone());
        }
    }
    Ok(Reply::Integer(list.len() as i64))
}

fn pop(store: &mut Store, args: &[Vec<u8>], front: bool) -> Outcome {
    let key = one_key(args, if front { "lpop" } else { "rpop" })?;
    if store.data(key).is_none() {
        return Ok(Reply::nil());
    }
    let list = store.list_mut(key)?;
    let value = if front { list.pop_front() } else { list.pop_back() };
    store.drop_if_empty(key);
    Ok(Reply::Bulk(value))
}

fn lrange(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let [key, start, stop] = args else {
        return Err(Reply::arity("lrange"));
    };
    let (start, stop) = (parse_int(start)?, parse_int(stop)?);
    let items: Vec<Vec<u8>> = match store.data(key) {
        None => Vec::new(),
        Some(Data::List(list)) => list.iter().cloned().collect(),
        Some(_) => return Err(Reply::wrong_type()),
    };
    let len = items.len() as i64;
    let normalize = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let (start, stop) = (normalize(start), normalize(stop).min(len - 1));
    if start > stop || start >= len {
        return Ok(Reply::array(Vec::new()));
    }
    Ok(Reply::bulks(items[start as usize..=stop as usize].to_vec()))
}

fn llen(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "llen")?;
    match store.data(key) {
        None => Ok(Reply::Integer(0)),
        Some(Data::List(list)) => Ok(Reply::Integer(list.len() as i64)),
        Some(_) => Err(Reply::wrong_type()),
    }
}

// ========== Hashes ==========

fn hset(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    if args.len() < 3 || args.len() % 2 == 0 {
        return Err(Reply::arity("hset"));
    }
    let hash = store.hash_mut(&args[0])?;
    let added = args[1..]
        .chunks(2)
        .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
        .count();
    Ok(Reply::Integer(added as i64))
}

fn read_hash(store: &mut Store, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Reply> {
    match store.data(key) {
        None => Ok(Vec::new()),
        Some(Data::Hash(hash)) => Ok(hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
        Some(_) => Err(Reply::wrong_type()),
    }
}

fn hget(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let [key, field] = args else {
        return Err(Reply::arity("hget"));
    };
    let value = read_hash(store, key)?
        .into_iter()
        .find(|(f, _)| f == field)
        .map(|(_, v)| v);
    Ok(Reply::Bulk(value))
}

fn hdel(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    at_least(args, 2, "hdel")?;
    let key = &args[0];
    if store.data(key).is_none() {
        return Ok(Reply::Integer(0));
    }
    let hash = store.hash_mut(key)?;
    let removed = args[1..].iter().filter(|f| hash.remove(f.as_slice()).is_some()).count();
    store.drop_if_empty(key);
    Ok(Reply::Integer(removed as i64))
}

fn hgetall(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "hgetall")?;
    let flat = read_hash(store, key)?
        .into_iter()
        .flat_map(|(f, v)| [f, v]);
    Ok(Reply::bulks(flat))
}

fn hlen(store: &mut Store, args: &[Vec<u8>]) -> Outcome {
    let key = one_key(args, "hlen")?;
    Ok(Reply::Integer(read_hash(store, key)?.len() as i64))
}
