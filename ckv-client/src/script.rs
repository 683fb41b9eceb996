//! # Script Registry
//!
//! Purpose: Keep server-side scripts by name together with the hooks that
//! adapt caller keys and values to them, so script bodies never deal with
//! key transforms or the codec.
//!
//! ## Design Principles
//! 1. **Digest First**: The SHA-1 digest is computed once at registration and
//!    every call starts with `EVALSHA`. A `NOSCRIPT` reply falls back to one
//!    `EVAL`, which also loads the script on that server.
//! 2. **Immutable Entries**: A name is registered once; re-registration is a
//!    configuration error.
//! 3. **Hooks as Values**: Pre and post hooks are plain shared closures; the
//!    built-in ones cover the common cases.

use std::fmt;
use std::sync::Arc;

use ahash::RandomState;
use ckv_common::{CacheError, CacheResult};
use hashbrown::HashMap;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::codec::CodecChain;
use crate::resp::RespValue;

/// Host key transform (prefixing, versioning), applied by script hooks.
pub type KeyTransform = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Maps caller keys and arguments to submitted keys and argument bytes.
pub type PreHook = Arc<
    dyn Fn(&ScriptHelpers<'_>, Vec<String>, Vec<Value>) -> CacheResult<(Vec<String>, Vec<Vec<u8>>)>
        + Send
        + Sync,
>;

/// Maps the raw script reply to the value returned to the caller.
pub type PostHook = Arc<dyn Fn(&ScriptHelpers<'_>, RespValue) -> CacheResult<Value> + Send + Sync>;

/// Access to the client's key transform and codec from inside hooks.
pub struct ScriptHelpers<'a> {
    codec: &'a CodecChain,
    key_transform: Option<&'a KeyTransform>,
}

impl<'a> ScriptHelpers<'a> {
    pub(crate) fn new(codec: &'a CodecChain, key_transform: Option<&'a KeyTransform>) -> Self {
        ScriptHelpers { codec, key_transform }
    }

    pub fn make_key(&self, key: &str) -> String {
        match self.key_transform {
            Some(transform) => transform(key),
            None => key.to_string(),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<Vec<u8>> {
        self.codec.encode(value)
    }

    pub fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> CacheResult<T> {
        self.codec.decode(data)
    }
}

/// A registered script.
pub struct Script {
    name: String,
    source: String,
    digest: String,
    pre: PreHook,
    post: PostHook,
}

impl Script {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Lowercase hex SHA-1 of the source, as `EVALSHA` expects.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub(crate) fn prepare(
        &self,
        helpers: &ScriptHelpers<'_>,
        keys: Vec<String>,
        args: Vec<Value>,
    ) -> CacheResult<(Vec<String>, Vec<Vec<u8>>)> {
        (self.pre)(helpers, keys, args)
    }

    pub(crate) fn finish(&self, helpers: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        (self.post)(helpers, reply)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}

pub fn sha1_hex(source: &str) -> String {
    let digest = Sha1::digest(source.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Named scripts of one client.
#[derive(Default)]
pub struct ScriptRegistry {
    scripts: RwLock<HashMap<String, Arc<Script>, RandomState>>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a script. Missing hooks default to [`hooks::keys_only`] and
    /// [`hooks::noop`].
    pub fn register(
        &self,
        name: &str,
        source: &str,
        pre: Option<PreHook>,
        post: Option<PostHook>,
    ) -> CacheResult<Arc<Script>> {
        let mut scripts = self.scripts.write();
        if scripts.contains_key(name) {
            return Err(CacheError::Config(format!("script {name:?} is already registered")));
        }
        let script = Arc::new(Script {
            name: name.to_string(),
            source: source.to_string(),
            digest: sha1_hex(source),
            pre: pre.unwrap_or_else(hooks::keys_only),
            post: post.unwrap_or_else(hooks::noop),
        });
        scripts.insert(name.to_string(), script.clone());
        Ok(script)
    }

    pub fn get(&self, name: &str) -> CacheResult<Arc<Script>> {
        self.scripts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::ScriptNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scripts.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Converts a script reply to JSON without touching the codec.
pub fn reply_to_json(reply: RespValue) -> CacheResult<Value> {
    Ok(match reply {
        RespValue::Simple(text) => Value::String(String::from_utf8_lossy(&text).into_owned()),
        RespValue::Error(message) => return Err(crate::engine::classify(lossy(&message))),
        RespValue::Integer(n) => Value::from(n),
        RespValue::Bulk(None) | RespValue::Array(None) => Value::Null,
        RespValue::Bulk(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(err) => Value::from(err.into_bytes()),
        },
        RespValue::Array(Some(items)) => Value::Array(
            items
                .into_iter()
                .map(reply_to_json)
                .collect::<CacheResult<Vec<_>>>()?,
        ),
    })
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn arg_text(value: &Value) -> Vec<u8> {
    match value {
        Value::String(text) => text.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

/// Built-in hooks.
pub mod hooks {
    use super::*;

    type Prepared = CacheResult<(Vec<String>, Vec<Vec<u8>>)>;

    /// Keys through the key transform, arguments as text.
    pub fn keys_only() -> PreHook {
        Arc::new(prefix_keys_text_args)
    }

    /// Keys through the key transform, arguments through the codec.
    pub fn full_encode() -> PreHook {
        Arc::new(prefix_keys_encode_args)
    }

    /// Keys verbatim, arguments as text.
    pub fn verbatim() -> PreHook {
        Arc::new(raw_keys_text_args)
    }

    /// Reply converted structurally, no decoding.
    pub fn noop() -> PostHook {
        Arc::new(structural)
    }

    /// A single encoded value, or null.
    pub fn decode_single() -> PostHook {
        Arc::new(decode_one)
    }

    /// A list of encoded values; a nil reply is an empty list.
    pub fn decode_list() -> PostHook {
        Arc::new(list_or_empty)
    }

    /// Like [`decode_list`], but a nil reply stays null.
    pub fn decode_list_or_none() -> PostHook {
        Arc::new(list_or_null)
    }

    fn prefix_keys_text_args(helpers: &ScriptHelpers<'_>, keys: Vec<String>, args: Vec<Value>) -> Prepared {
        let keys = keys.iter().map(|k| helpers.make_key(k)).collect();
        Ok((keys, args.iter().map(arg_text).collect()))
    }

    fn prefix_keys_encode_args(helpers: &ScriptHelpers<'_>, keys: Vec<String>, args: Vec<Value>) -> Prepared {
        let keys = keys.iter().map(|k| helpers.make_key(k)).collect();
        let args = args
            .iter()
            .map(|arg| helpers.encode(arg))
            .collect::<CacheResult<Vec<_>>>()?;
        Ok((keys, args))
    }

    fn raw_keys_text_args(_: &ScriptHelpers<'_>, keys: Vec<String>, args: Vec<Value>) -> Prepared {
        Ok((keys, args.iter().map(arg_text).collect()))
    }

    fn structural(_: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        reply_to_json(reply)
    }

    fn list_or_empty(helpers: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        match reply {
            RespValue::Array(None) | RespValue::Bulk(None) => Ok(Value::Array(Vec::new())),
            other => decode_many(helpers, other),
        }
    }

    fn list_or_null(helpers: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        match reply {
            RespValue::Array(None) | RespValue::Bulk(None) => Ok(Value::Null),
            other => decode_many(helpers, other),
        }
    }

    fn decode_one(helpers: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        match reply {
            RespValue::Bulk(Some(bytes)) => helpers.decode(&bytes),
            RespValue::Bulk(None) => Ok(Value::Null),
            other => reply_to_json(other),
        }
    }

    fn decode_many(helpers: &ScriptHelpers<'_>, reply: RespValue) -> CacheResult<Value> {
        match reply {
            RespValue::Array(Some(items)) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| decode_one(helpers, item))
                    .collect::<CacheResult<Vec<_>>>()?,
            )),
            RespValue::Error(message) => Err(crate::engine::classify(lossy(&message))),
            other => Err(CacheError::Protocol(format!("expected array reply, got {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_sha1_hex() {
        assert_eq!(sha1_hex("return 1"), "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
    }

    #[test]
    fn registration_is_once_per_name() {
        let registry = ScriptRegistry::new();
        let script = registry.register("one", "return 1", None, None).unwrap();
        assert_eq!(script.digest().len(), 40);
        let err = registry.register("one", "return 2", None, None).unwrap_err();
        assert!(matches!(err, CacheError::Config(_)));
        assert!(matches!(
            registry.get("missing").unwrap_err(),
            CacheError::ScriptNotRegistered(name) if name == "missing"
        ));
        assert_eq!(registry.names(), vec!["one".to_string()]);
    }

    #[test]
    fn builtin_hooks_transform_keys_and_values() {
        let codec = CodecChain::json();
        let transform: KeyTransform = Arc::new(|k: &str| format!(":1:{k}"));
        let helpers = ScriptHelpers::new(&codec, Some(&transform));

        let (keys, args) = (hooks::keys_only())(&helpers, vec!["a".into()], vec![json!("x"), json!(5)]).unwrap();
        assert_eq!(keys, vec![":1:a"]);
        assert_eq!(args, vec![b"x".to_vec(), b"5".to_vec()]);

        let (_, args) = (hooks::full_encode())(&helpers, vec![], vec![json!("x"), json!({"n": 1})]).unwrap();
        assert_eq!(args, vec![br#""x""#.to_vec(), br#"{"n":1}"#.to_vec()]);

        let (keys, _) = (hooks::verbatim())(&helpers, vec!["raw".into()], vec![]).unwrap();
        assert_eq!(keys, vec!["raw"]);

        let reply = RespValue::Array(Some(vec![
            RespValue::Bulk(Some(br#"{"n":1}"#.to_vec())),
            RespValue::Bulk(None),
        ]));
        let value = (hooks::decode_list())(&helpers, reply).unwrap();
        assert_eq!(value, json!([{"n": 1}, null]));

        assert_eq!((hooks::decode_list_or_none())(&helpers, RespValue::Array(None)).unwrap(), Value::Null);
        assert_eq!((hooks::decode_list())(&helpers, RespValue::Array(None)).unwrap(), json!([]));
        assert_eq!((hooks::noop())(&helpers, RespValue::Integer(7)).unwrap(), json!(7));
    }
}
