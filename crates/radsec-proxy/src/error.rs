//! Startup error types
//!
//! Everything here is configuration-fatal: logged once by `main` and turned
//! into exit code 1. Steady-state failures (malformed packets, unknown
//! peers, dead connections) never surface as errors, they are logged and
//! the offending buffer is dropped.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not read config file {0} nor its base name")]
    ConfigFileNotFound(String),

    #[error("syntax error in line starting with: {0}")]
    Syntax(String),

    #[error("configuration error in block {block}: {message}")]
    Block { block: String, message: String },

    #[error("configuration error: {0}")]
    Invalid(String),

    #[error("failed to resolve host {host} port {port}")]
    Unresolvable { host: String, port: u16 },

    #[error("no tls context defined for block {0}")]
    NoTlsContext(String),

    #[error("invalid realm pattern {pattern}: {source}")]
    RealmPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("TLS setup error in context {name}: {message}")]
    Tls { name: String, message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
