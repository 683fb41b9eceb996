//! # Shared Core
//!
//! Purpose: Everything the blocking and cooperative executors have in
//! common. Operations are described once as data ([`Op`], [`Batch`],
//! [`FanOut`]); each executor only knows how to move commands over its own
//! kind of connection.
//!
//! ## Design Principles
//! 1. **Compose, Don't Duplicate**: Routing, encoding, reply parsing and
//!    error classification live here and are shared by both executors.
//! 2. **Operations as Values**: An operation is a command plus a parser; a
//!    parser may ask for a follow-up command (`Step::Next`).
//! 3. **Narrow Absorption**: Only transport errors are ever absorbed, and
//!    only when `ignore_exceptions` is set and the operation has a default.

use ckv_common::{CacheError, CacheOptions, CacheResult, ServerRole, TopologyError};
use tracing::{debug, warn};

use crate::codec::CodecChain;
use crate::command::Cmd;
use crate::manager::{PoolManager, PoolSettings};
use crate::resp::RespValue;
use crate::router::{parse_redirect, Redirect, Route, Router};
use crate::script::{KeyTransform, ScriptHelpers, ScriptRegistry};
use ckv_common::Access;

/// Result of parsing one reply.
pub(crate) enum Step<T> {
    Done(T),
    /// Another command must run before the operation completes.
    Next(Op<T>),
}

pub(crate) type Parse<T> = Box<dyn FnOnce(&Core, RespValue) -> CacheResult<Step<T>> + Send>;

/// A single-command operation.
pub(crate) struct Op<T> {
    pub route: Route,
    pub access: Access,
    pub cmd: Cmd,
    pub parse: Parse<T>,
    /// Returned instead of an absorbed transport error.
    pub fallback: Option<T>,
    /// Hand server error replies to the parser instead of failing first.
    pub raw_errors: bool,
}

impl<T: 'static> Op<T> {
    pub fn new<F>(route: Route, access: Access, cmd: Cmd, parse: F) -> Self
    where
        F: FnOnce(&Core, RespValue) -> CacheResult<T> + Send + 'static,
    {
        Op {
            route,
            access,
            cmd,
            parse: Box::new(move |core, reply| parse(core, reply).map(Step::Done)),
            fallback: None,
            raw_errors: false,
        }
    }

    pub fn chained<F>(route: Route, access: Access, cmd: Cmd, parse: F) -> Self
    where
        F: FnOnce(&Core, RespValue) -> CacheResult<Step<T>> + Send + 'static,
    {
        Op {
            route,
            access,
            cmd,
            parse: Box::new(parse),
            fallback: None,
            raw_errors: false,
        }
    }

    /// Keyed read.
    pub fn read<F>(key: &str, cmd: Cmd, parse: F) -> Self
    where
        F: FnOnce(&Core, RespValue) -> CacheResult<T> + Send + 'static,
    {
        Op::new(Route::for_key(key), Access::Read, cmd, parse)
    }

    /// Keyed write.
    pub fn write<F>(key: &str, cmd: Cmd, parse: F) -> Self
    where
        F: FnOnce(&Core, RespValue) -> CacheResult<T> + Send + 'static,
    {
        Op::new(Route::for_key(key), Access::Write, cmd, parse)
    }

    pub fn or(mut self, fallback: T) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn raw_errors(mut self) -> Self {
        self.raw_errors = true;
        self
    }

    /// Transforms the final value, following any chained steps.
    pub fn map<U, F>(self, f: F) -> Op<U>
    where
        U: 'static,
        F: FnOnce(T) -> CacheResult<U> + Send + 'static,
    {
        let Op {
            route,
            access,
            cmd,
            parse,
            raw_errors,
            ..
        } = self;
        Op {
            route,
            access,
            cmd,
            parse: Box::new(move |core, reply| match parse(core, reply)? {
                Step::Done(value) => f(value).map(Step::Done),
                Step::Next(next) => Ok(Step::Next(next.map(f))),
            }),
            fallback: None,
            raw_errors,
        }
    }
}

/// Commands sent together to the node owning one route.
pub(crate) struct Part {
    pub route: Route,
    pub access: Access,
    pub cmds: Vec<Cmd>,
    /// Keys of the part, attached to its errors.
    pub keys: Vec<String>,
}

pub(crate) type Merge<T> = Box<dyn FnOnce(&Core, Vec<CacheResult<Vec<RespValue>>>) -> CacheResult<T> + Send>;

/// A non-atomic multi-part operation. Parts run independently; the merge
/// sees every part's outcome in part order.
pub(crate) struct Batch<T> {
    pub parts: Vec<Part>,
    pub merge: Merge<T>,
}

/// One command run on every data-owning node.
pub(crate) struct FanOut<T> {
    pub access: Access,
    pub cmd: Cmd,
    #[allow(clippy::type_complexity)]
    pub merge: Box<dyn FnOnce(&Core, Vec<(usize, RespValue)>) -> CacheResult<T> + Send>,
}

/// Routing, codec, pools and scripts of one client.
pub(crate) struct Core {
    pub(crate) options: CacheOptions,
    pub(crate) codec: CodecChain,
    pub(crate) router: Router,
    pub(crate) pools: PoolManager,
    pub(crate) scripts: ScriptRegistry,
    pub(crate) key_transform: Option<KeyTransform>,
}

impl Core {
    pub(crate) fn new(options: CacheOptions, key_transform: Option<KeyTransform>) -> CacheResult<Self> {
        options.validate()?;
        let codec = CodecChain::from_options(&options)?;
        let router = Router::new(&options)?;
        #[cfg(not(feature = "tls"))]
        if router.nodes().iter().any(|node| node.address.tls) {
            return Err(CacheError::Config(
                "TLS addresses need the `tls` feature".into(),
            ));
        }
        let pools = PoolManager::new(PoolSettings::from_options(&options));
        let scripts = ScriptRegistry::new();
        crate::lock::register_scripts(&scripts)?;
        Ok(Core {
            options,
            codec,
            router,
            pools,
            scripts,
            key_transform,
        })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn codec(&self) -> &CodecChain {
        &self.codec
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    pub(crate) fn helpers(&self) -> ScriptHelpers<'_> {
        ScriptHelpers::new(&self.codec, self.key_transform.as_ref())
    }

    /// Turns server error replies into typed errors.
    pub(crate) fn check(&self, reply: RespValue) -> CacheResult<RespValue> {
        match reply {
            RespValue::Error(message) => Err(classify(String::from_utf8_lossy(&message).into_owned())),
            other => Ok(other),
        }
    }

    /// Redirect carried by a reply, if any.
    pub(crate) fn redirect(&self, reply: &RespValue) -> Option<Redirect> {
        if !self.router.is_cluster() {
            return None;
        }
        match reply {
            RespValue::Error(message) => parse_redirect(&String::from_utf8_lossy(message)),
            _ => None,
        }
    }

    /// Applies a redirect: returns the node to retry on and whether the
    /// retry needs `ASKING`.
    pub(crate) fn follow(&self, redirect: &Redirect) -> (usize, bool) {
        match redirect {
            Redirect::Moved { slot, host, port } => {
                debug!(slot, host = %host, port, "MOVED");
                self.router.invalidate();
                (self.router.node_for(host, *port, ServerRole::Primary), false)
            }
            Redirect::Ask { slot, host, port } => {
                debug!(slot, host = %host, port, "ASK");
                (self.router.node_for(host, *port, ServerRole::Primary), true)
            }
        }
    }

    pub(crate) fn too_many_redirects(&self) -> CacheError {
        TopologyError::TooManyRedirects(self.options.max_redirects).into()
    }

    /// Whether `err` may be absorbed under `ignore_exceptions`; logs it when
    /// it is and logging is enabled.
    pub(crate) fn absorbable(&self, err: &CacheError) -> bool {
        if !(self.options.ignore_exceptions && err.is_transport()) {
            return false;
        }
        if self.options.log_ignored_exceptions {
            warn!(error = %err, keys = ?err.keys(), "ignoring transport error");
        }
        true
    }

    /// Maps a failed dispatch to the operation's fallback when allowed.
    pub(crate) fn absorb<T>(&self, err: CacheError, fallback: Option<T>, keys: &[String]) -> CacheResult<T> {
        let err = err.with_keys(keys.iter().cloned());
        match fallback {
            Some(value) if self.absorbable(&err) => Ok(value),
            _ => Err(err),
        }
    }

    /// Runs the parser of an operation on its reply.
    pub(crate) fn complete<T>(
        &self,
        reply: RespValue,
        raw_errors: bool,
        parse: Parse<T>,
        keys: &[String],
    ) -> CacheResult<Step<T>> {
        let reply = if raw_errors { Ok(reply) } else { self.check(reply) };
        reply
            .and_then(|reply| parse(self, reply))
            .map_err(|err| err.with_keys(keys.iter().cloned()))
    }
}

/// Maps a server error message to the error taxonomy.
pub(crate) fn classify(message: String) -> CacheError {
    let code = message.split_whitespace().next().unwrap_or("");
    match code {
        "CROSSSLOT" => TopologyError::CrossSlot.into(),
        "CLUSTERDOWN" | "TRYAGAIN" => TopologyError::ClusterDown(message).into(),
        _ if message.starts_with("ERR unknown command") || message.starts_with("ERR unknown subcommand") => {
            CacheError::NotSupported(message)
        }
        _ => CacheError::Server(message),
    }
}

/// Prefixes every command with `ASKING`, as an ASK redirect requires.
pub(crate) fn with_asking(cmds: &[Cmd]) -> Vec<Cmd> {
    cmds.iter()
        .flat_map(|cmd| [Cmd::new("ASKING"), cmd.clone()])
        .collect()
}

/// Drops the `ASKING` acknowledgements from replies to [`with_asking`].
pub(crate) fn without_asking(replies: Vec<RespValue>) -> Vec<RespValue> {
    replies.into_iter().skip(1).step_by(2).collect()
}

/// Single reply of a one-command dispatch.
pub(crate) fn only(replies: Vec<RespValue>) -> CacheResult<RespValue> {
    replies
        .into_iter()
        .next()
        .ok_or_else(|| CacheError::Protocol("missing reply".into()))
}

/// Whether the reply is a `NOSCRIPT` error.
pub(crate) fn is_noscript(reply: &RespValue) -> bool {
    matches!(reply, RespValue::Error(message) if message.starts_with(b"NOSCRIPT"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ckv_common::{ErrorKind, TransportError};

    #[test]
    fn server_errors_are_classified() {
        assert!(matches!(
            classify("CROSSSLOT Keys in request don't hash to the same slot".into()),
            CacheError::Topology(TopologyError::CrossSlot)
        ));
        assert_eq!(classify("CLUSTERDOWN The cluster is down".into()).kind(), ErrorKind::Topology);
        assert_eq!(classify("ERR unknown command 'SLOWLOG'".into()).kind(), ErrorKind::NotSupported);
        assert_eq!(
            classify("WRONGTYPE Operation against a key holding the wrong kind of value".into()).kind(),
            ErrorKind::Server
        );
    }

    #[test]
    fn only_transport_errors_are_absorbed() {
        let options = CacheOptions::builder().ignore_exceptions(true).build().unwrap();
        let core = Core::new(options, None).unwrap();
        let keys = vec!["k".to_string()];

        let value = core
            .absorb(TransportError::ReadTimeout.into(), Some(false), &keys)
            .unwrap();
        assert!(!value);

        let err = core
            .absorb(CacheError::Server("ERR".into()), Some(false), &keys)
            .unwrap_err();
        assert_eq!(err.keys(), keys.as_slice());

        let err = core
            .absorb::<bool>(TransportError::ReadTimeout.into(), None, &keys)
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn transport_errors_propagate_by_default() {
        let core = Core::new(CacheOptions::default(), None).unwrap();
        let err = core
            .absorb(TransportError::Closed.into(), Some(None::<u8>), &[])
            .unwrap_err();
        assert!(err.is_transport());
        assert!(err.keys().is_empty());
    }

    #[test]
    fn asking_prefix_is_stripped_from_replies() {
        let cmds = vec![Cmd::new("GET").key("a"), Cmd::new("GET").key("b")];
        let names: Vec<String> = with_asking(&cmds).iter().map(Cmd::name).collect();
        assert_eq!(names, vec!["ASKING", "GET", "ASKING", "GET"]);
        let replies = vec![
            RespValue::Simple(b"OK".to_vec()),
            RespValue::Integer(1),
            RespValue::Simple(b"OK".to_vec()),
            RespValue::Integer(2),
        ];
        assert_eq!(
            without_asking(replies),
            vec![RespValue::Integer(1), RespValue::Integer(2)]
        );
    }

    #[test]
    fn redirects_only_apply_in_cluster_mode() {
        let moved = RespValue::Error("MOVED 1 127.0.0.1:7001".into());
        let standalone = Core::new(CacheOptions::default(), None).unwrap();
        assert!(standalone.redirect(&moved).is_none());

        let options = CacheOptions::builder()
            .server("redis://127.0.0.1:7000")
            .cluster(true)
            .build()
            .unwrap();
        let cluster = Core::new(options, None).unwrap();
        let redirect = cluster.redirect(&moved).unwrap();
        let (node, asking) = cluster.follow(&redirect);
        assert_eq!(node, 1);
        assert!(!asking);
        assert_eq!(cluster.router().nodes().len(), 2);
    }
}
