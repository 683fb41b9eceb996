//! # In-Memory Store
//!
//! Purpose: Typed key space with per-key expiration, enough to back the
//! commands the test server understands.
//!
//! ## Design Principles
//! 1. **Lazy Expiry**: Expired keys are purged when touched or listed; there
//!    is no background sweeper.
//! 2. **Deterministic Order**: Sets, hashes and key listings are ordered, so
//!    tests can assert on exact replies.
//! 3. **Script Friendly**: The accessors are public so emulated scripts can
//!    operate on the store directly.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use hashbrown::HashMap;

/// Value of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    Str(Vec<u8>),
    List(VecDeque<Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
}

impl Data {
    pub fn type_name(&self) -> &'static str {
        match self {
            Data::Str(_) => "string",
            Data::List(_) => "list",
            Data::Set(_) => "set",
            Data::Hash(_) => "hash",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub data: Data,
    pub expires_at: Option<SystemTime>,
}

impl Entry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// The wrong kind of value is stored under a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrongType;

/// Key space of one server node.
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<Vec<u8>, Entry, RandomState>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry under `key`, purging it first when expired.
    pub fn entry(&mut self, key: &[u8]) -> Option<&mut Entry> {
        let now = SystemTime::now();
        if self.entries.get(key).is_some_and(|e| e.is_expired(now)) {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    pub fn exists(&mut self, key: &[u8]) -> bool {
        self.entry(key).is_some()
    }

    pub fn get_str(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, WrongType> {
        match self.entry(key) {
            None => Ok(None),
            Some(Entry { data: Data::Str(value), .. }) => Ok(Some(value.clone())),
            Some(_) => Err(WrongType),
        }
    }

    /// Stores a string, replacing any value and expiration.
    pub fn set_str(&mut self, key: &[u8], value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_vec(),
            Entry {
                data: Data::Str(value),
                expires_at: ttl.map(|ttl| SystemTime::now() + ttl),
            },
        );
    }

    /// Replaces the value but keeps the current expiration.
    pub fn set_keep_ttl(&mut self, key: &[u8], value: Vec<u8>) {
        let expires_at = self.entry(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_vec(),
            Entry {
                data: Data::Str(value),
                expires_at,
            },
        );
    }

    pub fn delete(&mut self, key: &[u8]) -> bool {
        self.entry(key).is_some() && self.entries.remove(key).is_some()
    }

    pub fn take(&mut self, key: &[u8]) -> Option<Entry> {
        self.entry(key)?;
        self.entries.remove(key)
    }

    pub fn insert(&mut self, key: Vec<u8>, entry: Entry) {
        self.entries.insert(key, entry);
    }

    /// Remaining time to live: `-2` when missing, `-1` without expiration.
    pub fn pttl(&mut self, key: &[u8]) -> i64 {
        match self.entry(key) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry {
                expires_at: Some(at), ..
            }) => at
                .duration_since(SystemTime::now())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
        }
    }

    /// Absolute expiration in unix milliseconds, `-2` when missing, `-1`
    /// without expiration.
    pub fn expire_time_ms(&mut self, key: &[u8]) -> i64 {
        match self.entry(key) {
            None => -2,
            Some(Entry { expires_at: None, .. }) => -1,
            Some(Entry {
                expires_at: Some(at), ..
            }) => at.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0),
        }
    }

    /// Sets an absolute expiration; a time in the past deletes the key.
    pub fn expire_at(&mut self, key: &[u8], at: SystemTime) -> bool {
        if at <= SystemTime::now() {
            return self.delete(key);
        }
        match self.entry(key) {
            Some(entry) => {
                entry.expires_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn pexpire(&mut self, key: &[u8], ttl: Duration) -> bool {
        self.expire_at(key, SystemTime::now() + ttl)
    }

    pub fn persist(&mut self, key: &[u8]) -> bool {
        match self.entry(key) {
            Some(entry) => entry.expires_at.take().is_some(),
            None => false,
        }
    }

    /// Live keys in byte order.
    pub fn keys(&mut self) -> Vec<Vec<u8>> {
        let now = SystemTime::now();
        self.entries.retain(|_, e| !e.is_expired(now));
        let mut keys: Vec<Vec<u8>> = self.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&mut self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Collection of the given shape under `key`, created empty when absent.
    fn collection<'a, T>(
        &'a mut self,
        key: &[u8],
        make: fn() -> Data,
        pick: fn(&'a mut Data) -> Option<&'a mut T>,
    ) -> Result<&'a mut T, WrongType> {
        if self.entry(key).is_none() {
            self.entries.insert(
                key.to_vec(),
                Entry {
                    data: make(),
                    expires_at: None,
                },
            );
        }
        let entry = self.entries.get_mut(key).ok_or(WrongType)?;
        pick(&mut entry.data).ok_or(WrongType)
    }

    pub fn list_mut(&mut self, key: &[u8]) -> Result<&mut VecDeque<Vec<u8>>, WrongType> {
        self.collection(key, || Data::List(VecDeque::new()), |d| match d {
            Data::List(list) => Some(list),
            _ => None,
        })
    }

    pub fn set_mut(&mut self, key: &[u8]) -> Result<&mut BTreeSet<Vec<u8>>, WrongType> {
        self.collection(key, || Data::Set(BTreeSet::new()), |d| match d {
            Data::Set(set) => Some(set),
            _ => None,
        })
    }

    pub fn hash_mut(&mut self, key: &[u8]) -> Result<&mut BTreeMap<Vec<u8>, Vec<u8>>, WrongType> {
        self.collection(key, || Data::Hash(BTreeMap::new()), |d| match d {
            Data::Hash(hash) => Some(hash),
            _ => None,
        })
    }

    /// Read-only view of the data under `key`.
    pub fn data(&mut self, key: &[u8]) -> Option<&Data> {
        self.entry(key).map(|e| &e.data)
    }

    /// Drops collections left empty by a removal.
    pub fn drop_if_empty(&mut self, key: &[u8]) {
        let empty = match self.data(key) {
            Some(Data::List(list)) => list.is_empty(),
            Some(Data::Set(set)) => set.is_empty(),
            Some(Data::Hash(hash)) => hash.is_empty(),
            _ => false,
        };
        if empty {
            self.entries.remove(key);
        }
    }
}

/// Glob matching with `*`, `?`, `[...]` classes and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = class_match(pattern, p, text[t]) {
                        if matched {
                            p = next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }
        match star {
            Some((sp, st)) => {
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `c` against the class starting at `pattern[start] == b'['`.
/// Returns whether it matched and the index after the class.
fn class_match(pattern: &[u8], start: usize, c: u8) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = pattern.get(i) == Some(&b'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    while i < pattern.len() && pattern[i] != b']' {
        if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
            if (pattern[i]..=pattern[i + 2]).contains(&c) {
                matched = true;
            }
            i += 3;
        } else {
            if pattern[i] == c {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= pattern.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_keys_disappear() {
        let mut store = Store::new();
        store.set_str(b"k", b"v".to_vec(), Some(Duration::from_millis(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.get_str(b"k"), Ok(None));
        assert_eq!(store.pttl(b"k"), -2);
    }

    #[test]
    fn collections_reject_wrong_type() {
        let mut store = Store::new();
        store.set_str(b"s", b"v".to_vec(), None);
        assert_eq!(store.list_mut(b"s").err(), Some(WrongType));
        store.list_mut(b"l").unwrap().push_back(b"a".to_vec());
        assert_eq!(store.data(b"l").map(Data::type_name), Some("list"));
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match(b"user:*", b"user:1"));
        assert!(glob_match(b"*", b""));
        assert!(glob_match(b"h?llo", b"hello"));
        assert!(glob_match(b"h[ae]llo", b"hallo"));
        assert!(!glob_match(b"h[^e]llo", b"hello"));
        assert!(glob_match(b"k[0-9]*", b"k42x"));
        assert!(glob_match(b"a\\*", b"a*"));
        assert!(!glob_match(b"a\\*", b"ab"));
        assert!(!glob_match(b"user:*", b"session:1"));
    }
}
