//! # Configuration
//!
//! Purpose: Hold every recognized connector option in one serde-friendly
//! structure, validated once at client construction.
//!
//! ## Design Principles
//! 1. **Fixed At Startup**: Pool sizes, timeouts and codec chains never change
//!    after a client is built; every pool shares the same settings.
//! 2. **Fail Early**: [`CacheOptions::validate`] rejects configurations that
//!    could only fail later (empty serializer chain, bad addresses).
//! 3. **Plain Data**: Durations are (de)serialized as milliseconds so options
//!    can live in JSON/TOML files next to the host application's settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::ServerAddress;
use crate::error::{CacheError, CacheResult};

/// Serializer identifiers, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    Json,
    #[serde(alias = "msgpack")]
    MessagePack,
}

/// Compressor identifiers, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressorKind {
    Gzip,
    Zlib,
    Lz4,
    Identity,
}

/// Where read-only commands go when replicas are configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPolicy {
    /// Everything goes to the primary.
    Primary,
    /// Reads pick a random replica; writes go to the primary.
    #[default]
    PreferReplica,
}

/// Connector options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Server location strings. Each may hold several `,`/`;` separated
    /// addresses; the first address overall is the primary.
    pub servers: Vec<String>,
    /// Treat servers as seeds of a sharded cluster.
    pub cluster: bool,

    // ========== Pools ==========
    /// Maximum connections per pool (idle + in-use).
    pub max_connections: usize,
    /// Maximum idle connections kept per pool.
    pub max_idle: usize,
    #[serde(with = "millis_opt")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "millis_opt")]
    pub read_timeout: Option<Duration>,
    #[serde(with = "millis_opt")]
    pub write_timeout: Option<Duration>,
    /// How long a blocking acquisition waits for a free connection.
    #[serde(with = "millis")]
    pub pool_timeout: Duration,
    /// Deadline for the courtesy QUIT sent when closing pools.
    #[serde(with = "millis")]
    pub close_deadline: Duration,

    // ========== Errors ==========
    /// Absorb transport errors on cache operations and return defaults.
    pub ignore_exceptions: bool,
    /// Log absorbed errors at warn level.
    pub log_ignored_exceptions: bool,

    // ========== Codec ==========
    pub serializers: Vec<SerializerKind>,
    pub compressors: Vec<CompressorKind>,
    /// Payloads longer than this are compressed.
    pub min_compress_len: usize,
    /// Fail instead of passing bytes through when no compressor accepts them.
    pub strict_compression: bool,

    // ========== Routing ==========
    pub read_policy: ReadPolicy,
    /// Redirects followed before a command fails.
    pub max_redirects: usize,
    /// COUNT hint for cursor scans.
    pub scan_count: usize,
    /// Default expiration for writes that don't specify one.
    #[serde(with = "millis_opt")]
    pub default_timeout: Option<Duration>,

    // ========== Locks ==========
    /// Default lease; `None` means locks never expire on their own.
    #[serde(with = "millis_opt")]
    pub lock_lease: Option<Duration>,
    /// Retry interval for blocking acquisition.
    #[serde(with = "millis")]
    pub lock_sleep: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        CacheOptions {
            servers: vec!["redis://127.0.0.1:6379".to_string()],
            cluster: false,
            max_connections: 16,
            max_idle: 8,
            connect_timeout: Some(Duration::from_secs(5)),
            read_timeout: Some(Duration::from_secs(5)),
            write_timeout: Some(Duration::from_secs(5)),
            pool_timeout: Duration::from_secs(5),
            close_deadline: Duration::from_secs(1),
            ignore_exceptions: false,
            log_ignored_exceptions: false,
            serializers: vec![SerializerKind::Json],
            compressors: Vec::new(),
            min_compress_len: 256,
            strict_compression: false,
            read_policy: ReadPolicy::PreferReplica,
            max_redirects: 5,
            scan_count: 100,
            default_timeout: None,
            lock_lease: Some(Duration::from_secs(30)),
            lock_sleep: Duration::from_millis(100),
        }
    }
}

impl CacheOptions {
    /// Starts a builder from defaults.
    pub fn builder() -> CacheOptionsBuilder {
        CacheOptionsBuilder::default()
    }

    /// Parses every configured address, in order.
    pub fn addresses(&self) -> CacheResult<Vec<ServerAddress>> {
        let mut out = Vec::new();
        for entry in &self.servers {
            out.extend(ServerAddress::parse_list(entry)?);
        }
        Ok(out)
    }

    /// Checks the options for configurations that can never work.
    pub fn validate(&self) -> CacheResult<()> {
        if self.serializers.is_empty() {
            return Err(CacheError::Config(
                "serializer chain must contain at least one serializer".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(CacheError::Config("max_connections must be positive".into()));
        }
        if self.max_idle > self.max_connections {
            return Err(CacheError::Config(format!(
                "max_idle ({}) exceeds max_connections ({})",
                self.max_idle, self.max_connections
            )));
        }
        if self.scan_count == 0 {
            return Err(CacheError::Config("scan_count must be positive".into()));
        }

        let addresses = self.addresses()?;
        if addresses.is_empty() {
            return Err(CacheError::Config("no servers configured".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`CacheOptions`].
#[derive(Debug, Clone, Default)]
pub struct CacheOptionsBuilder {
    options: CacheOptions,
    servers_set: bool,
}

impl CacheOptionsBuilder {
    /// Adds a server location string. The first call replaces the default.
    pub fn server(mut self, location: impl Into<String>) -> Self {
        if !self.servers_set {
            self.options.servers.clear();
            self.servers_set = true;
        }
        self.options.servers.push(location.into());
        self
    }

    pub fn cluster(mut self, enabled: bool) -> Self {
        self.options.cluster = enabled;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.options.max_connections = max;
        self.options.max_idle = self.options.max_idle.min(max);
        self
    }

    pub fn max_idle(mut self, max: usize) -> Self {
        self.options.max_idle = max;
        self
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.connect_timeout = timeout;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.read_timeout = timeout;
        self
    }

    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.write_timeout = timeout;
        self
    }

    pub fn pool_timeout(mut self, timeout: Duration) -> Self {
        self.options.pool_timeout = timeout;
        self
    }

    pub fn close_deadline(mut self, deadline: Duration) -> Self {
        self.options.close_deadline = deadline;
        self
    }

    pub fn ignore_exceptions(mut self, ignore: bool) -> Self {
        self.options.ignore_exceptions = ignore;
        self
    }

    pub fn log_ignored_exceptions(mut self, log: bool) -> Self {
        self.options.log_ignored_exceptions = log;
        self
    }

    pub fn serializers(mut self, chain: Vec<SerializerKind>) -> Self {
        self.options.serializers = chain;
        self
    }

    pub fn compressors(mut self, chain: Vec<CompressorKind>) -> Self {
        self.options.compressors = chain;
        self
    }

    pub fn min_compress_len(mut self, len: usize) -> Self {
        self.options.min_compress_len = len;
        self
    }

    pub fn strict_compression(mut self, strict: bool) -> Self {
        self.options.strict_compression = strict;
        self
    }

    pub fn read_policy(mut self, policy: ReadPolicy) -> Self {
        self.options.read_policy = policy;
        self
    }

    pub fn max_redirects(mut self, max: usize) -> Self {
        self.options.max_redirects = max;
        self
    }

    pub fn scan_count(mut self, count: usize) -> Self {
        self.options.scan_count = count;
        self
    }

    pub fn default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    pub fn lock_lease(mut self, lease: Option<Duration>) -> Self {
        self.options.lock_lease = lease;
        self
    }

    pub fn lock_sleep(mut self, sleep: Duration) -> Self {
        self.options.lock_sleep = sleep;
        self
    }

    /// Validates and returns the options.
    pub fn build(self) -> CacheResult<CacheOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod millis_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let options = CacheOptions::default();
        options.validate().unwrap();
        assert_eq!(options.min_compress_len, 256);
        assert_eq!(options.lock_sleep, Duration::from_millis(100));
    }

    #[test]
    fn empty_serializer_chain_is_rejected() {
        let err = CacheOptions::builder()
            .serializers(Vec::new())
            .build()
            .unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
    }

    #[test]
    fn empty_compressor_chain_is_fine() {
        CacheOptions::builder().compressors(Vec::new()).build().unwrap();
    }

    #[test]
    fn builder_replaces_default_server() {
        let options = CacheOptions::builder()
            .server("redis://a:1")
            .server("redis://b:2,redis://c:3")
            .build()
            .unwrap();
        let labels: Vec<_> = options
            .addresses()
            .unwrap()
            .iter()
            .map(ServerAddress::label)
            .collect();
        assert_eq!(labels, ["a:1", "b:2", "c:3"]);
    }

    #[test]
    fn rejects_idle_above_total() {
        let err = CacheOptions::builder()
            .max_connections(4)
            .max_idle(8)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("max_idle"));
    }

    #[test]
    fn deserializes_from_json() {
        let json = r#"{
            "servers": ["redis://h:1"],
            "serializers": ["msgpack", "json"],
            "compressors": ["zlib"],
            "read_timeout": 250,
            "pool_timeout": 1000,
            "read_policy": "primary"
        }"#;
        let options: CacheOptions = serde_json::from_str(json).unwrap();
        assert_eq!(
            options.serializers,
            [SerializerKind::MessagePack, SerializerKind::Json]
        );
        assert_eq!(options.compressors, [CompressorKind::Zlib]);
        assert_eq!(options.read_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.pool_timeout, Duration::from_secs(1));
        assert_eq!(options.read_policy, ReadPolicy::Primary);
        assert_eq!(options.max_connections, 16);
    }
}
