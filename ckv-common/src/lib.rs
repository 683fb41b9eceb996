// ckv-common - Shared types for the CacheKV connector
//
// Error taxonomy, configuration, server addressing and hash-slot math used by
// the client engine and its test tooling. Nothing in this crate performs I/O.

pub mod address;
pub mod config;
pub mod error;
pub mod slots;
pub mod types;

// Re-export for convenience
pub use address::*;
pub use config::*;
pub use error::*;
pub use slots::*;
pub use types::*;
