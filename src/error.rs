//! Error types for the runner.
//!
//! Each layer has its own enum. Everything a [`RuntimeError`] describes is an
//! infrastructure fault: a program that exits non-zero is still a successful
//! run and never shows up here.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::language::Language;

/// Failures of an environment provider.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Only passwordless impersonation is supported.
    #[error("password authentication is not supported (user '{0}')")]
    UnsupportedAuth(String),

    /// The configured account does not exist on this host.
    #[error("user '{0}' does not exist")]
    IdentityNotFound(String),

    /// The account database could not be queried.
    #[error("looking up user '{user}': {source}")]
    Lookup {
        user: String,
        #[source]
        source: nix::Error,
    },

    /// The session process could not be started.
    #[error("starting session: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Failures of the sandbox runtime itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The workspace could not be reset, written or handed over.
    #[error("preparing workspace {}: {source}", path.display())]
    WorkspacePrep {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The language's initialization step failed.
    #[error("initializing workspace: {0}")]
    WorkspaceInit(String),

    /// The language runtime binary is not on `PATH`.
    #[error("resolving `{binary}`: {source}")]
    BinaryNotFound {
        binary: &'static str,
        #[source]
        source: which::Error,
    },

    /// No session could be opened for the configured identity.
    #[error("opening session: {0}")]
    Session(#[from] EnvError),

    /// The process could not be driven or reaped.
    #[error("executing user code: {0}")]
    SystemExec(#[source] std::io::Error),
}

/// Errors returned to callers of the RPC client.
///
/// Deliberately coarse: infrastructure detail is logged, not handed out.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("execution service unavailable")]
    Unavailable,

    #[error("language {0} is not supported")]
    Unsupported(Language),
}

/// Startup configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error(
        "running as the worker's own user is only allowed in debug mode; set RUNTIME_USERNAME"
    )]
    SameUserOutsideDebug,

    #[error("runtime identity: {0}")]
    Identity(#[from] EnvError),
}
