//! # Test Server
//!
//! Purpose: Serve the RESP2 protocol on a loopback port so client code can
//! be exercised end to end, standalone or as a small sharded cluster.
//!
//! ## Design Principles
//! 1. **One Runtime Per Node**: Each node owns a background thread with its
//!    own Tokio runtime; dropping the handle stops the node and closes every
//!    connection, which is how tests simulate an outage.
//! 2. **Connection Loop**: Read into a buffer, parse every complete command,
//!    write the replies, repeat.
//! 3. **Observable**: Every received command is logged so tests can assert
//!    on what actually went over the wire.
//! 4. **Cluster Semantics at the Door**: MOVED, ASK and CROSSSLOT are decided
//!    before a command runs, the way a cluster node does it.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use bytes::BytesMut;
use ckv_common::{key_slot, SLOT_COUNT};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::commands::{self, parse_int};
use crate::parser::CommandParser;
use crate::reply::Reply;
use crate::store::Store;

/// Emulation of a server-side script: `(store, KEYS, ARGV) -> reply`.
pub type ScriptHandler = Arc<dyn Fn(&mut Store, &[Vec<u8>], &[Vec<u8>]) -> Reply + Send + Sync>;

const VERSION: &str = "7.2.4";

/// Lowercase hex SHA-1, the digest `EVALSHA` uses.
pub fn script_digest(source: &[u8]) -> String {
    Sha1::digest(source).iter().map(|b| format!("{b:02x}")).collect()
}

struct ScriptEntry {
    handler: ScriptHandler,
    loaded: bool,
}

struct SlowEntry {
    id: i64,
    at: SystemTime,
    duration: Duration,
    args: Vec<Vec<u8>>,
}

/// Per-connection state.
#[derive(Default)]
struct Session {
    asking: bool,
    queue: Option<Vec<Vec<Vec<u8>>>>,
    dirty: bool,
}

/// Slot ownership shared by the nodes of a [`TestCluster`].
struct Layout {
    owners: RwLock<Vec<usize>>,
    migrating: RwLock<HashMap<u16, usize, RandomState>>,
    addrs: Vec<SocketAddr>,
}

impl Layout {
    fn owner(&self, slot: u16) -> usize {
        self.owners.read()[slot as usize]
    }

    fn migrating(&self, slot: u16) -> Option<usize> {
        self.migrating.read().get(&slot).copied()
    }

    fn label(&self, node: usize) -> String {
        self.addrs.get(node).map(|a| a.to_string()).unwrap_or_default()
    }
}

struct Node {
    index: usize,
    addr: SocketAddr,
    store: Mutex<Store>,
    scripts: Mutex<HashMap<String, ScriptEntry, RandomState>>,
    log: Mutex<Vec<Vec<Vec<u8>>>>,
    slowlog: Mutex<VecDeque<SlowEntry>>,
    next_slow_id: AtomicI64,
    latency_ms: AtomicU64,
    processed: AtomicU64,
    layout: Option<Arc<Layout>>,
}

impl Node {
    fn new(index: usize, addr: SocketAddr, layout: Option<Arc<Layout>>) -> Self {
        Node {
            index,
            addr,
            store: Mutex::new(Store::new()),
            scripts: Mutex::new(HashMap::with_hasher(RandomState::new())),
            log: Mutex::new(Vec::new()),
            slowlog: Mutex::new(VecDeque::new()),
            next_slow_id: AtomicI64::new(0),
            latency_ms: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            layout,
        }
    }

    /// Handles one command. The flag asks the caller to close the connection.
    fn dispatch(&self, session: &mut Session, args: Vec<Vec<u8>>) -> (Reply, bool) {
        let Some(first) = args.first() else {
            return (Reply::err("ERR empty command"), false);
        };
        self.log.lock().push(args.clone());
        self.processed.fetch_add(1, Ordering::Relaxed);
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        let asking = std::mem::take(&mut session.asking);

        match name.as_str() {
            "QUIT" => return (Reply::ok(), true),
            "ASKING" => {
                session.asking = true;
                return (Reply::ok(), false);
            }
            "MULTI" => {
                if session.queue.is_some() {
                    return (Reply::err("ERR MULTI calls can not be nested"), false);
                }
                session.queue = Some(Vec::new());
                session.dirty = false;
                return (Reply::ok(), false);
            }
            "DISCARD" => {
                return match session.queue.take() {
                    Some(_) => (Reply::ok(), false),
                    None => (Reply::err("ERR DISCARD without MULTI"), false),
                };
            }
            "EXEC" => {
                let Some(queue) = session.queue.take() else {
                    return (Reply::err("ERR EXEC without MULTI"), false);
                };
                if std::mem::take(&mut session.dirty) {
                    return (
                        Reply::err("EXECABORT Transaction discarded because of previous errors."),
                        false,
                    );
                }
                let replies = queue.iter().map(|cmd| self.run(cmd)).collect();
                return (Reply::array(replies), false);
            }
            _ => {}
        }

        if let Some(refusal) = self.refuse(&name, &args[1..], asking) {
            if session.queue.is_some() {
                session.dirty = true;
            }
            return (refusal, false);
        }
        if let Some(queue) = session.queue.as_mut() {
            queue.push(args);
            return (Reply::Simple("QUEUED".into()), false);
        }
        (self.run(&args), false)
    }

    /// Cluster admission: CROSSSLOT, MOVED or ASK when the command may not
    /// run on this node.
    fn refuse(&self, name: &str, rest: &[Vec<u8>], asking: bool) -> Option<Reply> {
        let layout = self.layout.as_ref()?;
        let keys = command_keys(name, rest);
        let slot = key_slot(keys.first()?);
        if keys.iter().any(|key| key_slot(key) != slot) {
            return Some(Reply::err("CROSSSLOT Keys in request don't hash to the same slot"));
        }
        let owner = layout.owner(slot);
        if owner == self.index {
            let target = layout.migrating(slot)?;
            let mut store = self.store.lock();
            if keys.iter().any(|key| !store.exists(key)) {
                return Some(Reply::err(format!("ASK {slot} {}", layout.label(target))));
            }
            return None;
        }
        if asking && layout.migrating(slot) == Some(self.index) {
            return None;
        }
        Some(Reply::err(format!("MOVED {slot} {}", layout.label(owner))))
    }

    fn run(&self, args: &[Vec<u8>]) -> Reply {
        let Some(first) = args.first() else {
            return Reply::err("ERR empty command");
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        let rest = &args[1..];
        match name.as_str() {
            "PING" => match rest.first() {
                Some(message) => Reply::bulk(message.clone()),
                None => Reply::Simple("PONG".into()),
            },
            "ECHO" => match rest {
                [message] => Reply::bulk(message.clone()),
                _ => Reply::arity("echo"),
            },
            "AUTH" => Reply::ok(),
            "SELECT" => match rest {
                [db] => parse_int(db).map(|_| Reply::ok()).unwrap_or_else(|err| err),
                _ => Reply::arity("select"),
            },
            "CLUSTER" => self.cluster_command(rest),
            "EVAL" | "EVALSHA" => self.eval(&name, rest),
            "SCRIPT" => self.script_command(rest),
            "SLOWLOG" => self.slowlog_command(rest),
            "INFO" => self.info(rest),
            _ => {
                let mut store = self.store.lock();
                commands::execute(&mut store, args).unwrap_or_else(|| {
                    Reply::err(format!(
                        "ERR unknown command '{}', with args beginning with: ",
                        String::from_utf8_lossy(first)
                    ))
                })
            }
        }
    }

    fn cluster_command(&self, rest: &[Vec<u8>]) -> Reply {
        let Some(layout) = self.layout.as_ref() else {
            return Reply::err("ERR This instance has cluster support disabled");
        };
        let sub = rest.first().map(|s| String::from_utf8_lossy(s).to_ascii_uppercase());
        match sub.as_deref() {
            Some("SLOTS") => {
                let owners = layout.owners.read();
                let mut ranges = Vec::new();
                let mut start = 0usize;
                for slot in 1..=owners.len() {
                    if slot == owners.len() || owners[slot] != owners[start] {
                        let node = owners[start];
                        let addr = layout.addrs.get(node).copied().unwrap_or(self.addr);
                        ranges.push(Reply::array(vec![
                            Reply::Integer(start as i64),
                            Reply::Integer(slot as i64 - 1),
                            Reply::array(vec![
                                Reply::bulk(addr.ip().to_string()),
                                Reply::Integer(addr.port() as i64),
                                Reply::bulk(node_id(node)),
                            ]),
                        ]));
                        start = slot;
                    }
                }
                Reply::array(ranges)
            }
            Some("KEYSLOT") => match rest.get(1) {
                Some(key) => Reply::Integer(key_slot(key) as i64),
                None => Reply::arity("cluster|keyslot"),
            },
            Some("MYID") => Reply::bulk(node_id(self.index)),
            Some("INFO") => Reply::bulk(format!(
                "cluster_state:ok\r\ncluster_slots_assigned:{SLOT_COUNT}\r\ncluster_known_nodes:{}\r\n",
                layout.addrs.len()
            )),
            _ => Reply::err("ERR unknown subcommand"),
        }
    }

    fn eval(&self, name: &str, rest: &[Vec<u8>]) -> Reply {
        let [body, numkeys, tail @ ..] = rest else {
            return Reply::arity(name);
        };
        let numkeys = match parse_int(numkeys) {
            Ok(n) if n >= 0 => n as usize,
            Ok(_) => return Reply::err("ERR Number of keys can't be negative"),
            Err(err) => return err,
        };
        if numkeys > tail.len() {
            return Reply::err("ERR Number of keys can't be greater than number of args");
        }
        let by_source = name == "EVAL";
        let digest = if by_source {
            script_digest(body)
        } else {
            String::from_utf8_lossy(body).to_ascii_lowercase()
        };
        let handler = {
            let mut scripts = self.scripts.lock();
            match scripts.get_mut(&digest) {
                Some(entry) if by_source || entry.loaded => {
                    entry.loaded = true;
                    entry.handler.clone()
                }
                _ if !by_source => return Reply::err("NOSCRIPT No matching script. Please use EVAL."),
                _ => return Reply::err("ERR Error compiling script (unknown source)"),
            }
        };
        let (keys, argv) = tail.split_at(numkeys);
        let mut store = self.store.lock();
        handler(&mut store, keys, argv)
    }

    fn script_command(&self, rest: &[Vec<u8>]) -> Reply {
        let sub = rest.first().map(|s| String::from_utf8_lossy(s).to_ascii_uppercase());
        let mut scripts = self.scripts.lock();
        match sub.as_deref() {
            Some("LOAD") => {
                let Some(source) = rest.get(1) else {
                    return Reply::arity("script|load");
                };
                let digest = script_digest(source);
                match scripts.get_mut(&digest) {
                    Some(entry) => {
                        entry.loaded = true;
                        Reply::bulk(digest)
                    }
                    None => Reply::err("ERR Error compiling script (unknown source)"),
                }
            }
            Some("EXISTS") => Reply::array(
                rest[1..]
                    .iter()
                    .map(|sha| {
                        let sha = String::from_utf8_lossy(sha).to_ascii_lowercase();
                        Reply::Integer(scripts.get(&sha).is_some_and(|e| e.loaded) as i64)
                    })
                    .collect(),
            ),
            Some("FLUSH") => {
                for entry in scripts.values_mut() {
                    entry.loaded = false;
                }
                Reply::ok()
            }
            _ => Reply::err("ERR unknown subcommand"),
        }
    }

    fn slowlog_command(&self, rest: &[Vec<u8>]) -> Reply {
        let sub = rest.first().map(|s| String::from_utf8_lossy(s).to_ascii_uppercase());
        let mut slowlog = self.slowlog.lock();
        match sub.as_deref() {
            Some("GET") => {
                let count = match rest.get(1).map(|c| parse_int(c)) {
                    None => 10,
                    Some(Ok(n)) if n < 0 => slowlog.len(),
                    Some(Ok(n)) => n as usize,
                    Some(Err(err)) => return err,
                };
                Reply::array(slowlog.iter().take(count).map(encode_slow_entry).collect())
            }
            Some("LEN") => Reply::Integer(slowlog.len() as i64),
            Some("RESET") => {
                slowlog.clear();
                Reply::ok()
            }
            _ => Reply::err("ERR unknown subcommand"),
        }
    }

    fn info(&self, rest: &[Vec<u8>]) -> Reply {
        let wanted = rest
            .first()
            .map(|s| String::from_utf8_lossy(s).to_ascii_lowercase())
            .filter(|s| s != "all" && s != "everything" && s != "default");
        let keys = self.store.lock().len();
        let sections = [
            (
                "server",
                format!(
                    "redis_version:{VERSION}\r\nredis_mode:{}\r\ntcp_port:{}\r\nrun_id:{}\r\n",
                    if self.layout.is_some() { "cluster" } else { "standalone" },
                    self.addr.port(),
                    node_id(self.index)
                ),
            ),
            (
                "stats",
                format!(
                    "total_commands_processed:{}\r\n",
                    self.processed.load(Ordering::Relaxed)
                ),
            ),
            (
                "keyspace",
                if keys == 0 {
                    String::new()
                } else {
                    format!("db0:keys={keys},expires=0,avg_ttl=0\r\n")
                },
            ),
        ];
        let mut text = String::new();
        for (name, body) in sections {
            if wanted.as_deref().is_some_and(|w| w != name) {
                continue;
            }
            let mut title = name.to_string();
            title[..1].make_ascii_uppercase();
            text.push_str(&format!("# {title}\r\n{body}\r\n"));
        }
        Reply::bulk(text)
    }
}

fn node_id(index: usize) -> String {
    format!("{:040x}", index + 1)
}

fn encode_slow_entry(entry: &SlowEntry) -> Reply {
    let timestamp = entry.at.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    Reply::array(vec![
        Reply::Integer(entry.id),
        Reply::Integer(timestamp as i64),
        Reply::Integer(entry.duration.as_micros() as i64),
        Reply::bulks(entry.args.clone()),
        Reply::bulk(""),
        Reply::bulk(""),
    ])
}

/// Keys a command touches, for cluster admission.
fn command_keys<'a>(name: &str, rest: &'a [Vec<u8>]) -> Vec<&'a [u8]> {
    match name {
        "PING" | "ECHO" | "AUTH" | "SELECT" | "CLUSTER" | "SCRIPT" | "SLOWLOG" | "INFO" | "KEYS"
        | "SCAN" | "DBSIZE" | "FLUSHDB" | "FLUSHALL" => Vec::new(),
        "MGET" | "DEL" | "UNLINK" | "EXISTS" | "SINTER" | "SUNION" | "SDIFF" => {
            rest.iter().map(Vec::as_slice).collect()
        }
        "MSET" => rest.iter().step_by(2).map(Vec::as_slice).collect(),
        "RENAME" | "RENAMENX" => rest.iter().take(2).map(Vec::as_slice).collect(),
        "EVAL" | "EVALSHA" => {
            let numkeys = rest
                .get(1)
                .and_then(|n| parse_int(n).ok())
                .map_or(0, |n| n.max(0) as usize);
            rest.iter().skip(2).take(numkeys).map(Vec::as_slice).collect()
        }
        _ => rest.first().map(Vec::as_slice).into_iter().collect(),
    }
}

async fn accept_loop(listener: std::net::TcpListener, node: Arc<Node>, mut shutdown: oneshot::Receiver<()>) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            warn!(error = %err, "failed to register listener");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, node = node.index, "connection accepted");
                    let node = Arc::clone(&node);
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, node).await {
                            debug!(%peer, error = %err, "connection closed with error");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
        }
    }
    info!(addr = %node.addr, "test server stopped");
}

async fn handle_connection(mut stream: TcpStream, node: Arc<Node>) -> io::Result<()> {
    let _ = stream.set_nodelay(true);
    let mut buf = BytesMut::with_capacity(4096);
    let mut parser = CommandParser::new();
    let mut session = Session::default();
    let mut out = Vec::new();

    loop {
        let mut close = false;
        loop {
            match parser.parse(&mut buf) {
                Ok(Some(args)) => {
                    let (reply, quit) = node.dispatch(&mut session, args);
                    reply.encode(&mut out);
                    if quit {
                        close = true;
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    Reply::err("ERR Protocol error").encode(&mut out);
                    close = true;
                    break;
                }
            }
        }

        if !out.is_empty() {
            let latency = node.latency_ms.load(Ordering::Relaxed);
            if latency > 0 {
                tokio::time::sleep(Duration::from_millis(latency)).await;
            }
            stream.write_all(&out).await?;
            out.clear();
        }
        if close {
            return Ok(());
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Ok(());
        }
    }
}

/// A RESP2 server on a loopback port, running until dropped.
pub struct TestServer {
    node: Arc<Node>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Starts a standalone server on an ephemeral port.
    pub fn start() -> io::Result<Self> {
        let listener = bind()?;
        let addr = listener.local_addr()?;
        Self::spawn(listener, Node::new(0, addr, None))
    }

    fn spawn(listener: std::net::TcpListener, node: Node) -> io::Result<Self> {
        let node = Arc::new(node);
        let (tx, rx) = oneshot::channel();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ckv-testkit")
            .enable_all()
            .build()?;
        let served = Arc::clone(&node);
        let thread = thread::Builder::new()
            .name(format!("ckv-testkit-{}", node.addr.port()))
            .spawn(move || runtime.block_on(accept_loop(listener, served, rx)))?;
        info!(addr = %node.addr, "test server listening");
        Ok(TestServer {
            node,
            shutdown: Some(tx),
            thread: Some(thread),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.node.addr
    }

    /// `redis://` URL of this server.
    pub fn url(&self) -> String {
        format!("redis://{}", self.node.addr)
    }

    /// Makes a script runnable: `EVAL` of `source`, or `EVALSHA` of its
    /// digest once loaded, invokes `handler`.
    pub fn register_script<F>(&self, source: &str, handler: F)
    where
        F: Fn(&mut Store, &[Vec<u8>], &[Vec<u8>]) -> Reply + Send + Sync + 'static,
    {
        self.register_handler(source, Arc::new(handler));
    }

    fn register_handler(&self, source: &str, handler: ScriptHandler) {
        self.node.scripts.lock().insert(
            script_digest(source.as_bytes()),
            ScriptEntry {
                handler,
                loaded: false,
            },
        );
    }

    /// Forgets which scripts were loaded, like `SCRIPT FLUSH` or a restart.
    pub fn flush_scripts(&self) {
        for entry in self.node.scripts.lock().values_mut() {
            entry.loaded = false;
        }
    }

    /// Every command received so far, lossily decoded.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.node
            .log
            .lock()
            .iter()
            .map(|args| args.iter().map(|a| String::from_utf8_lossy(a).into_owned()).collect())
            .collect()
    }

    /// Received commands named `name` (case-insensitive).
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|args| args.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .collect()
    }

    pub fn clear_log(&self) {
        self.node.log.lock().clear();
    }

    /// Records a slow-log entry, newest first.
    pub fn add_slowlog_entry(&self, duration: Duration, args: &[&str]) {
        let id = self.node.next_slow_id.fetch_add(1, Ordering::Relaxed);
        self.node.slowlog.lock().push_front(SlowEntry {
            id,
            at: SystemTime::now(),
            duration,
            args: args.iter().map(|a| a.as_bytes().to_vec()).collect(),
        });
    }

    /// Delays every reply batch by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.node
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Direct access to the key space.
    pub fn with_store<R>(&self, f: impl FnOnce(&mut Store) -> R) -> R {
        f(&mut self.node.store.lock())
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind() -> io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Several [`TestServer`] nodes sharing one slot layout.
pub struct TestCluster {
    nodes: Vec<TestServer>,
    layout: Arc<Layout>,
}

impl TestCluster {
    /// Starts `size` primaries with the slot range split evenly among them.
    pub fn start(size: usize) -> io::Result<Self> {
        let size = size.max(1);
        let listeners = (0..size).map(|_| bind()).collect::<io::Result<Vec<_>>>()?;
        let addrs = listeners
            .iter()
            .map(|l| l.local_addr())
            .collect::<io::Result<Vec<_>>>()?;
        let slots = SLOT_COUNT as usize;
        let owners = (0..slots).map(|slot| slot * size / slots).collect();
        let layout = Arc::new(Layout {
            owners: RwLock::new(owners),
            migrating: RwLock::new(HashMap::with_hasher(RandomState::new())),
            addrs: addrs.clone(),
        });
        let nodes = listeners
            .into_iter()
            .zip(addrs)
            .enumerate()
            .map(|(index, (listener, addr))| {
                TestServer::spawn(listener, Node::new(index, addr, Some(Arc::clone(&layout))))
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(TestCluster { nodes, layout })
    }

    pub fn nodes(&self) -> &[TestServer] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &TestServer {
        &self.nodes[index]
    }

    pub fn urls(&self) -> Vec<String> {
        self.nodes.iter().map(TestServer::url).collect()
    }

    /// Node index currently owning `slot`.
    pub fn owner(&self, slot: u16) -> usize {
        self.layout.owner(slot)
    }

    pub fn owner_of(&self, key: &str) -> usize {
        self.owner(key_slot(key.as_bytes()))
    }

    /// Registers a script on every node.
    pub fn register_script<F>(&self, source: &str, handler: F)
    where
        F: Fn(&mut Store, &[Vec<u8>], &[Vec<u8>]) -> Reply + Send + Sync + 'static,
    {
        let handler: ScriptHandler = Arc::new(handler);
        for node in &self.nodes {
            node.register_handler(source, Arc::clone(&handler));
        }
    }

    /// Reassigns `slot` to node `to` at once, moving its keys. Clients that
    /// still route to the old owner receive MOVED.
    pub fn move_slot(&self, slot: u16, to: usize) {
        let from = self.layout.owner(slot);
        self.transfer(slot, from, to);
        self.layout.migrating.write().remove(&slot);
        self.layout.owners.write()[slot as usize] = to;
    }

    /// Starts migrating `slot` to node `to` and moves the keys already
    /// there. The old owner answers ASK for keys it no longer has.
    pub fn migrate_slot(&self, slot: u16, to: usize) {
        let from = self.layout.owner(slot);
        self.layout.migrating.write().insert(slot, to);
        self.transfer(slot, from, to);
    }

    /// Completes a migration started with [`TestCluster::migrate_slot`].
    pub fn finish_migration(&self, slot: u16) {
        if let Some(to) = self.layout.migrating(slot) {
            self.move_slot(slot, to);
        }
    }

    fn transfer(&self, slot: u16, from: usize, to: usize) {
        if from == to {
            return;
        }
        let (Some(source), Some(target)) = (self.nodes.get(from), self.nodes.get(to)) else {
            return;
        };
        let mut source = source.node.store.lock();
        let mut target = target.node.store.lock();
        for key in source.keys() {
            if key_slot(&key) != slot {
                continue;
            }
            if let Some(entry) = source.take(&key) {
                target.insert(key, entry);
            }
        }
        debug!(slot, from, to, "slot keys transferred");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_queue_until_exec() {
        let node = Node::new(0, "127.0.0.1:6379".parse().unwrap(), None);
        let mut session = Session::default();
        let cmd = |line: &str| line.split(' ').map(|s| s.as_bytes().to_vec()).collect::<Vec<_>>();
        assert_eq!(node.dispatch(&mut session, cmd("MULTI")).0, Reply::ok());
        assert_eq!(
            node.dispatch(&mut session, cmd("SET k 1")).0,
            Reply::Simple("QUEUED".into())
        );
        assert_eq!(
            node.dispatch(&mut session, cmd("INCR k")).0,
            Reply::Simple("QUEUED".into())
        );
        assert_eq!(
            node.dispatch(&mut session, cmd("EXEC")).0,
            Reply::array(vec![Reply::ok(), Reply::Integer(2)])
        );
    }

    #[test]
    fn cluster_nodes_redirect_and_reject_cross_slot() {
        let addrs: Vec<SocketAddr> = vec!["127.0.0.1:7000".parse().unwrap(), "127.0.0.1:7001".parse().unwrap()];
        let layout = Arc::new(Layout {
            owners: RwLock::new((0..SLOT_COUNT as usize).map(|s| s * 2 / SLOT_COUNT as usize).collect()),
            migrating: RwLock::new(HashMap::with_hasher(RandomState::new())),
            addrs: addrs.clone(),
        });
        let node = Node::new(0, addrs[0], Some(layout));
        let mut session = Session::default();
        // "foo" hashes to slot 12182, owned by the second node.
        let reply = node.dispatch(&mut session, vec![b"GET".to_vec(), b"foo".to_vec()]).0;
        assert_eq!(reply, Reply::err("MOVED 12182 127.0.0.1:7001"));
        let reply = node
            .dispatch(&mut session, vec![b"MGET".to_vec(), b"a".to_vec(), b"foo".to_vec()])
            .0;
        assert_eq!(reply, Reply::err("CROSSSLOT Keys in request don't hash to the same slot"));
    }

    #[test]
    fn evalsha_requires_a_loaded_script() {
        let node = Node::new(0, "127.0.0.1:6379".parse().unwrap(), None);
        node.scripts.lock().insert(
            script_digest(b"return 1"),
            ScriptEntry {
                handler: Arc::new(|_: &mut Store, _: &[Vec<u8>], _: &[Vec<u8>]| Reply::Integer(1)),
                loaded: false,
            },
        );
        let mut session = Session::default();
        let sha = script_digest(b"return 1").into_bytes();
        let evalsha = vec![b"EVALSHA".to_vec(), sha, b"0".to_vec()];
        assert!(node.dispatch(&mut session, evalsha.clone()).0.is_error());
        let eval = vec![b"EVAL".to_vec(), b"return 1".to_vec(), b"0".to_vec()];
        assert_eq!(node.dispatch(&mut session, eval).0, Reply::Integer(1));
        assert_eq!(node.dispatch(&mut session, evalsha).0, Reply::Integer(1));
    }
}
