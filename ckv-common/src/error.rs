//! # Error Taxonomy
//!
//! Purpose: Give every failure a stable kind so callers can decide between
//! retrying, degrading, or surfacing it.
//!
//! ## Design Principles
//! 1. **Typed Kinds**: Transport, topology, codec, lock and capability
//!    failures are separate types, never strings to be matched on.
//! 2. **Keys Travel With Errors**: Operations attach the key(s) involved so a
//!    failure is never an anonymous "nil".
//! 3. **Opt-In Absorption**: Only transport failures are candidates for the
//!    ignore-exceptions policy; [`CacheError::is_transport`] is the single test.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type used across the connector.
pub type CacheResult<T> = Result<T, CacheError>;

/// Coarse classification of a [`CacheError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Topology,
    Codec,
    Lock,
    NotSupported,
    Server,
    Protocol,
    Config,
    ScriptNotRegistered,
    NotFound,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Topology => "topology",
            ErrorKind::Codec => "codec",
            ErrorKind::Lock => "lock",
            ErrorKind::NotSupported => "not supported",
            ErrorKind::Server => "server",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Config => "config",
            ErrorKind::ScriptNotRegistered => "script not registered",
            ErrorKind::NotFound => "not found",
        };
        f.write_str(name)
    }
}

/// Top-level error returned by every connector operation.
#[derive(Debug, Error)]
pub enum CacheError {
    // ========== Infrastructure ==========
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    // ========== Data ==========
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("key not found: {0}")]
    NotFound(String),

    // ========== Server & Protocol ==========
    #[error("server error: {0}")]
    Server(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    // ========== Setup ==========
    #[error("configuration error: {0}")]
    Config(String),

    #[error("script not registered: {0}")]
    ScriptNotRegistered(String),

    /// Wraps another error with the keys the failed operation touched.
    #[error("{source} (keys: {})", keys.join(", "))]
    Keyed {
        keys: Vec<String>,
        #[source]
        source: Box<CacheError>,
    },
}

impl CacheError {
    /// Returns the taxonomy kind, looking through the keyed wrapper.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CacheError::Transport(_) => ErrorKind::Transport,
            CacheError::Topology(_) => ErrorKind::Topology,
            CacheError::Codec(_) => ErrorKind::Codec,
            CacheError::Lock(_) => ErrorKind::Lock,
            CacheError::NotSupported(_) => ErrorKind::NotSupported,
            CacheError::NotFound(_) => ErrorKind::NotFound,
            CacheError::Server(_) => ErrorKind::Server,
            CacheError::Protocol(_) => ErrorKind::Protocol,
            CacheError::Config(_) => ErrorKind::Config,
            CacheError::ScriptNotRegistered(_) => ErrorKind::ScriptNotRegistered,
            CacheError::Keyed { source, .. } => source.kind(),
        }
    }

    /// Keys attached to this error, empty when none were recorded.
    pub fn keys(&self) -> &[String] {
        match self {
            CacheError::Keyed { keys, .. } => keys,
            _ => &[],
        }
    }

    /// The innermost error, without the keyed wrapper.
    pub fn inner(&self) -> &CacheError {
        match self {
            CacheError::Keyed { source, .. } => source.inner(),
            other => other,
        }
    }

    /// Attaches keys to the error. An already keyed error keeps its keys and
    /// an empty key list leaves the error unchanged.
    pub fn with_keys<I, K>(self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if let CacheError::Keyed { .. } = self {
            return self;
        }
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        if keys.is_empty() {
            return self;
        }
        CacheError::Keyed {
            keys,
            source: Box::new(self),
        }
    }

    /// Convenience for attaching a single key.
    pub fn with_key(self, key: &str) -> Self {
        self.with_keys([key])
    }

    #[inline]
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Transport(TransportError::from(err))
    }
}

/// Connection level failures. The only kind the ignore-exceptions policy may absorb.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {addr} timed out")]
    ConnectTimeout { addr: String },

    #[error("read timed out")]
    ReadTimeout,

    #[error("connection refused by {addr}")]
    Refused { addr: String },

    #[error("timed out waiting for a pooled connection to server {index}")]
    PoolTimeout { index: usize },

    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            // Socket read deadlines surface as WouldBlock on unix and TimedOut on windows.
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => TransportError::ReadTimeout,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }
}

/// Routing failures in sharded deployments.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("slot {0} is not served by any known node")]
    UnresolvedSlot(u16),

    #[error("gave up after {0} redirects")]
    TooManyRedirects(usize),

    #[error("cluster unavailable: {0}")]
    ClusterDown(String),

    #[error("invalid pipeline: {0}")]
    Pipeline(String),
}

/// Value encoding failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialize failed: {0}")]
    Serialize(String),

    /// Every serializer in the chain rejected the payload.
    #[error("deserialize failed: {0}")]
    Deserialize(String),

    #[error("compress failed: {0}")]
    Compress(String),

    /// Only raised when strict compression is enabled.
    #[error("no configured compressor accepted the payload")]
    Decompress,
}

/// Distributed lock failures.
///
/// Failing to acquire within a timeout is not an error; acquisition returns
/// `Ok(false)` instead.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock {key:?} is not owned by this token")]
    NotOwned { key: String },

    #[error("lock {key:?} was never acquired")]
    NotAcquired { key: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_error_keeps_kind_and_keys() {
        let err = CacheError::from(TopologyError::CrossSlot).with_keys(["a", "b"]);
        assert_eq!(err.kind(), ErrorKind::Topology);
        assert_eq!(err.keys(), ["a".to_string(), "b".to_string()]);
        assert!(err.to_string().contains("a, b"));
    }

    #[test]
    fn with_keys_does_not_nest() {
        let err = CacheError::NotFound("k".into()).with_key("k").with_key("other");
        assert_eq!(err.keys(), ["k".to_string()]);
        assert!(matches!(err.inner(), CacheError::NotFound(_)));
    }

    #[test]
    fn io_timeouts_map_to_read_timeout() {
        let err = CacheError::from(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(err.is_transport());
        assert!(matches!(
            err,
            CacheError::Transport(TransportError::ReadTimeout)
        ));
    }

    #[test]
    fn only_transport_is_transport() {
        assert!(!CacheError::from(CodecError::Decompress).is_transport());
        assert!(!CacheError::Server("ERR".into()).is_transport());
    }
}
