//! # Pulse entry point
//!
//! Loads a JavaScript application, warms a pool of execution contexts, and
//! serves its routes over HTTP.
//!
//! ## Usage
//!
//! ```bash
//! # Serve app.js on the configured port (PULSE_PORT, default 3333)
//! pulse app.js
//!
//! # Bind an explicit address instead
//! pulse app.js -b 127.0.0.1:8080
//! ```
//!
//! Everything else is configured through `PULSE_*` environment variables;
//! see [`pulse_common::config::Config`].

use anyhow::{Context as _, Result};
use argh::FromArgs;
use parking_lot::Mutex;
use pulse_common::config::Config;
use pulse_server::http_router::Dispatcher;
use pulse_server::http_server::HttpServer;
use pulse_server::kv::KvStore;
use pulse_server::runtime::bindings::Host;
use pulse_server::runtime::{
    AssociationTable, ContextId, ContextPool, PoolConfig, ScriptContext, StoreBinding,
};
use std::net::SocketAddr;
use std::sync::Arc;

/// serve a JavaScript application over HTTP
#[derive(FromArgs)]
struct Cli {
    /// path to the JavaScript application to load
    #[argh(positional)]
    script: String,

    /// address to bind to; overrides the PULSE_PORT environment variable
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let config = Config::from_env()?;

    let addr: SocketAddr = match &cli.bind {
        Some(bind) => bind
            .parse()
            .with_context(|| format!("invalid bind address: {}", bind))?,
        None => SocketAddr::from(([0, 0, 0, 0], config.port)),
    };

    let script_source = std::fs::read_to_string(&cli.script)
        .with_context(|| format!("failed to read script: {}", cli.script))?;
    tracing::info!(script = %cli.script, "loaded application script");

    let memory = Arc::new(KvStore::memory()?);
    let disk = Arc::new(KvStore::disk(&config.db_path, config.db_sync_writes)?);
    tracing::info!(path = %config.db_path, sync = config.db_sync_writes, "opened durable store");

    let associations = Arc::new(AssociationTable::new());
    let generator = Arc::new(Mutex::new(ulid::Generator::new()));

    let factory_associations = associations.clone();
    let pool = ContextPool::new(
        PoolConfig {
            initial_size: config.initial_pool_size,
            retire_after: config.retire_after,
        },
        associations.clone(),
        move || {
            let id = ContextId::next();
            factory_associations.update(id, |state| {
                state.memory = Some(StoreBinding::new(memory.clone()));
                state.disk = Some(StoreBinding::new(disk.clone()));
            });
            let host = Host::new(id, factory_associations.clone(), generator.clone());
            ScriptContext::initialize(host, &script_source)
        },
    )?;
    tracing::info!(size = config.initial_pool_size, "execution context pool ready");

    let dispatcher = Arc::new(Dispatcher::new(
        pool.clone(),
        associations,
        config.verbose_errors,
    )?);
    if dispatcher.routes().is_empty() {
        tracing::warn!("script registered no routes; every request will be a 404");
    }

    let server = HttpServer::new(dispatcher);

    tokio::select! {
        result = server.run(addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
            pool.cleanup();
        }
    }

    Ok(())
}
