// ckv-testkit - In-process RESP2 servers for exercising the CacheKV client
//
// A standalone node or a small sharded cluster, each backed by an in-memory
// store, with hooks for scripts, slot migration, injected latency and a log
// of every received command.

pub mod commands;
pub mod parser;
pub mod reply;
pub mod server;
pub mod store;

// Re-export for convenience
pub use parser::{CommandParser, ProtocolError};
pub use reply::Reply;
pub use server::{script_digest, ScriptHandler, TestCluster, TestServer};
pub use store::{glob_match, Data, Entry, Store, WrongType};
