//! Pulse server
//!
//! HTTP server that executes request handlers written in embedded
//! JavaScript, with a pooled execution runtime and a transactional
//! key-value store behind it.

pub mod http_router;
pub mod http_server;
pub mod kv;
pub mod runtime;

pub use http_router::Dispatcher;
pub use http_server::HttpServer;
pub use kv::{KvStore, Medium};
pub use runtime::ScriptContext;
