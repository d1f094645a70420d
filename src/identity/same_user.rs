//! Runs code as the worker's own user.
//!
//! Fine for debugging; production deployments should impersonate a
//! dedicated account instead.

use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::EnvProvider;
use crate::error::EnvError;

/// Provider for the identity the process already runs as.
#[derive(Debug, Default, Clone)]
pub struct SameUserEnv {}

impl SameUserEnv {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }
}

#[async_trait]
impl EnvProvider for SameUserEnv {
    async fn prepare(&self, root: &Path) -> std::io::Result<()> {
        debug!(path = %root.display(), "Prepared runtime env for current user");
        Ok(())
    }

    fn login(&self, workspace: &Path) -> Result<Command, EnvError> {
        // bash takes its script from stdin
        let mut cmd = Command::new("bash");
        cmd.current_dir(workspace);
        Ok(cmd)
    }

    fn describe(&self) -> String {
        "same user".into()
    }
}
