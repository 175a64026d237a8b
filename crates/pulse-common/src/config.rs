use crate::error::{PulseError, Result};

/// Runtime configuration for the Pulse server.
///
/// Everything outside the script path and bind address comes from the
/// environment so deployments can tune the pool and store without flags.
#[derive(Clone, Debug)]
pub struct Config {
    /// Port the HTTP server listens on (`PULSE_PORT`, default 3333).
    pub port: u16,
    /// Number of execution contexts built at startup
    /// (`PULSE_INITIAL_POOL_SIZE`, default 32).
    pub initial_pool_size: usize,
    /// Checkout count after which a context is retired and replaced
    /// (`PULSE_RETIRE_AFTER`, default 10_000).
    pub retire_after: u64,
    /// Directory for the durable medium (`PULSE_DB_PATH`, default
    /// `pulse-data`).
    pub db_path: String,
    /// Whether durable writes sync to stable storage before commit
    /// acknowledgment (`PULSE_DB_SYNC_WRITES`, default true).
    pub db_sync_writes: bool,
    /// Whether script error detail is included in 500 responses
    /// (`PULSE_VERBOSE_ERRORS`, default false).
    pub verbose_errors: bool,
}

impl Config {
    /// Build a config from the environment, falling back to defaults for
    /// unset variables. Malformed values are an error rather than a panic.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_parse("PULSE_PORT", 3333)?,
            initial_pool_size: env_parse("PULSE_INITIAL_POOL_SIZE", 32)?,
            retire_after: env_parse("PULSE_RETIRE_AFTER", 10_000)?,
            db_path: std::env::var("PULSE_DB_PATH").unwrap_or_else(|_| "pulse-data".into()),
            db_sync_writes: env_bool("PULSE_DB_SYNC_WRITES", true)?,
            verbose_errors: env_bool("PULSE_VERBOSE_ERRORS", false)?,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3333,
            initial_pool_size: 32,
            retire_after: 10_000,
            db_path: "pulse-data".into(),
            db_sync_writes: true,
            verbose_errors: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw.parse().map_err(|_| {
            PulseError::Config(format!("{} must be a valid integer, got '{}'", name, raw))
        }),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Ok(raw) => match raw.as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(PulseError::Config(format!(
                "{} must be true or false, got '{}'",
                name, raw
            ))),
        },
        Err(_) => Ok(default),
    }
}
