//! Runs code as a different, passwordless system account.
//!
//! Impersonation goes through `su`, so the worker must itself be allowed to
//! switch to the target account without a password (normally: run as root).

use std::path::Path;

use async_trait::async_trait;
use nix::unistd::{chown, User};
use tokio::process::Command;
use tracing::debug;

use super::EnvProvider;
use crate::error::EnvError;

/// Provider that impersonates a named account.
#[derive(Debug, Clone)]
pub struct DiffUserEnv {
    user: User,
}

impl DiffUserEnv {
    /// Look up `name` in the account database.
    ///
    /// Fails with [`EnvError::UnsupportedAuth`] if a password is supplied and
    /// with [`EnvError::IdentityNotFound`] if the account does not exist.
    pub fn new(name: &str, password: Option<&str>) -> Result<Self, EnvError> {
        if password.is_some() {
            return Err(EnvError::UnsupportedAuth(name.to_string()));
        }

        let user = User::from_name(name)
            .map_err(|source| EnvError::Lookup {
                user: name.to_string(),
                source,
            })?
            .ok_or_else(|| EnvError::IdentityNotFound(name.to_string()))?;

        Ok(Self { user })
    }
}

#[async_trait]
impl EnvProvider for DiffUserEnv {
    /// Hand the workspace and its entries over to the account.
    async fn prepare(&self, root: &Path) -> std::io::Result<()> {
        let (uid, gid) = (self.user.uid, self.user.gid);

        chown(root, Some(uid), Some(gid))?;
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            chown(&entry.path(), Some(uid), Some(gid))?;
        }

        debug!(path = %root.display(), user = %self.user.name, "Prepared runtime env for user");
        Ok(())
    }

    fn login(&self, workspace: &Path) -> Result<Command, EnvError> {
        let mut cmd = Command::new("su");
        cmd.arg("--login")
            .arg(&self.user.name)
            .args(["--shell", "/bin/bash"])
            .current_dir(workspace);
        Ok(cmd)
    }

    fn describe(&self) -> String {
        format!("user {}", self.user.name)
    }
}
