//! Environment providers: which OS identity runs submitted code.
//!
//! A provider hands the runtime an unspawned shell [`Command`] for its
//! identity. The runtime feeds that shell the launch line on stdin and owns
//! everything after spawn.

mod diff_user;
mod same_user;

pub use diff_user::DiffUserEnv;
pub use same_user::SameUserEnv;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, EnvError};

/// Capability to run code as one particular OS identity.
#[async_trait]
pub trait EnvProvider: Send + Sync {
    /// Identity-specific setup of an already populated workspace.
    async fn prepare(&self, root: &Path) -> std::io::Result<()>;

    /// Build a shell session for this identity.
    ///
    /// The returned command reads its script from stdin; stdio wiring is left
    /// to the caller.
    fn login(&self, workspace: &Path) -> Result<Command, EnvError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Select the provider described by the runtime configuration.
///
/// Expects a configuration that passed [`Config::validate`]; a configured
/// password is not passed on.
///
/// [`Config::validate`]: crate::config::Config::validate
pub fn from_config(config: &RuntimeConfig) -> Result<Arc<dyn EnvProvider>, ConfigError> {
    let Some(user) = config.run_as.as_deref() else {
        info!("Creating same user environment");
        return Ok(Arc::new(SameUserEnv::new()));
    };

    info!(run_as = %user, "Creating environment for a different user");
    Ok(Arc::new(DiffUserEnv::new(user, None)?))
}
