//! # Shared Value Types
//!
//! Small, copyable descriptions of servers, key metadata and expirations
//! shared between the engine and its callers.
//!
//! ## Design Principles
//!
//! 1. **Positional Identity**: A server is identified by its index in the
//!    node table, not by its address string, so an address can be re-resolved
//!    without invalidating pools keyed by that index.
//!
//! 2. **No Sentinels**: Missing keys, keys without expiry and expiring keys are
//!    distinct enum variants instead of magic integers like `-1` and `-2`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::address::ServerAddress;

/// Role of a server within the configured topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerRole {
    Primary,
    Replica,
}

/// One entry of the node table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDescriptor {
    pub address: ServerAddress,
    pub role: ServerRole,
    /// Position in the node table. Pools are keyed by this value.
    pub index: usize,
}

/// Execution context a connection is drawn for.
///
/// Cooperative contexts are further partitioned by scheduler identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionContext {
    Blocking,
    Cooperative(SchedulerId),
}

/// Opaque identity of a cooperative scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchedulerId(pub u64);

impl fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scheduler-{}", self.0)
    }
}

/// Whether a command reads or mutates data. Reads may be served by replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// TTL state of a key, mirroring server semantics without magic numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

impl Ttl {
    /// Interprets a TTL (seconds) or PTTL (`millis = true`) integer reply.
    pub fn from_reply(value: i64, millis: bool) -> Self {
        match value {
            -2 => Ttl::Missing,
            v if v < 0 => Ttl::NoExpiry,
            v if millis => Ttl::ExpiresIn(Duration::from_millis(v as u64)),
            v => Ttl::ExpiresIn(Duration::from_secs(v as u64)),
        }
    }

    /// Remaining time, when the key expires.
    pub fn remaining(&self) -> Option<Duration> {
        match self {
            Ttl::ExpiresIn(d) => Some(*d),
            _ => None,
        }
    }
}

/// Expiration requested on a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Use the client's configured default timeout.
    #[default]
    Default,
    /// Keep forever.
    Never,
    /// Expire after this duration. A zero duration means "do not keep".
    After(Duration),
}

impl Expiry {
    /// Resolves against a configured default.
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Expiry::Default => default,
            Expiry::Never => None,
            Expiry::After(d) => Some(d),
        }
    }
}

impl From<Duration> for Expiry {
    fn from(d: Duration) -> Self {
        Expiry::After(d)
    }
}

impl From<Option<Duration>> for Expiry {
    fn from(d: Option<Duration>) -> Self {
        match d {
            Some(d) => Expiry::After(d),
            None => Expiry::Never,
        }
    }
}

/// Data type stored at a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    String,
    List,
    Set,
    Hash,
    ZSet,
    Stream,
}

impl KeyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::String => "string",
            KeyType::List => "list",
            KeyType::Set => "set",
            KeyType::Hash => "hash",
            KeyType::ZSet => "zset",
            KeyType::Stream => "stream",
        }
    }
}

impl FromStr for KeyType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(KeyType::String),
            "list" => Ok(KeyType::List),
            "set" => Ok(KeyType::Set),
            "hash" => Ok(KeyType::Hash),
            "zset" => Ok(KeyType::ZSet),
            "stream" => Ok(KeyType::Stream),
            _ => Err(()),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page of a cursor scan.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScanPage {
    /// Cursor to pass to the next step; `0` means the scan is complete.
    pub cursor: u64,
    pub keys: Vec<String>,
}

impl ScanPage {
    #[inline]
    pub fn is_last(&self) -> bool {
        self.cursor == 0
    }
}

/// A slow-operation log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowlogEntry {
    pub id: i64,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub command: Vec<String>,
}

/// Parsed INFO output: section name -> field -> value.
///
/// Section names are lowercased; fields keep server spelling.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfoSnapshot {
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl InfoSnapshot {
    /// Parses the `# Section` / `field:value` text format.
    pub fn parse(text: &str) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::from("default");
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('#') {
                current = name.trim().to_ascii_lowercase();
                sections.entry(current.clone()).or_default();
                continue;
            }
            if let Some((field, value)) = line.split_once(':') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(field.to_string(), value.to_string());
            }
        }
        InfoSnapshot { sections }
    }

    /// Looks a field up in any section.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.sections
            .values()
            .find_map(|fields| fields.get(field))
            .map(String::as_str)
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(&name.to_ascii_lowercase())
    }

    /// Merges another snapshot, prefixing its section names (used per cluster node).
    pub fn merge_prefixed(&mut self, prefix: &str, other: InfoSnapshot) {
        for (name, fields) in other.sections {
            self.sections.insert(format!("{prefix}/{name}"), fields);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_from_reply() {
        assert_eq!(Ttl::from_reply(-2, false), Ttl::Missing);
        assert_eq!(Ttl::from_reply(-1, false), Ttl::NoExpiry);
        assert_eq!(
            Ttl::from_reply(5, false),
            Ttl::ExpiresIn(Duration::from_secs(5))
        );
        assert_eq!(
            Ttl::from_reply(1500, true).remaining(),
            Some(Duration::from_millis(1500))
        );
    }

    #[test]
    fn expiry_resolution() {
        let default = Some(Duration::from_secs(300));
        assert_eq!(Expiry::Default.resolve(default), default);
        assert_eq!(Expiry::Never.resolve(default), None);
        assert_eq!(
            Expiry::After(Duration::from_secs(1)).resolve(None),
            Some(Duration::from_secs(1))
        );
    }

    #[test]
    fn key_type_parse() {
        assert_eq!("zset".parse::<KeyType>(), Ok(KeyType::ZSet));
        assert!("none".parse::<KeyType>().is_err());
    }

    #[test]
    fn info_parsing() {
        let text = "# Server\r\nredis_version:7.2.0\r\nuptime_in_seconds:10\r\n\r\n# Keyspace\r\ndb0:keys=1,expires=0\r\n";
        let info = InfoSnapshot::parse(text);
        assert_eq!(info.get("redis_version"), Some("7.2.0"));
        assert_eq!(
            info.section("keyspace").and_then(|s| s.get("db0")).map(String::as_str),
            Some("keys=1,expires=0")
        );
    }
}
