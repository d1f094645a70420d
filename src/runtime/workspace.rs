//! Workspace directory handling.
//!
//! A workspace belongs to exactly one runtime. It is wiped at the start of
//! every execution; nothing cleans up after a run.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::process::Command;
use tracing::debug;

use crate::error::RuntimeError;

/// Recursively delete `dir` and recreate it world-writable.
pub async fn reset(dir: &Path) -> Result<(), RuntimeError> {
    let prep = |source| RuntimeError::WorkspacePrep {
        path: dir.to_path_buf(),
        source,
    };

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(prep(e)),
    }
    tokio::fs::create_dir_all(dir).await.map_err(prep)?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))
        .await
        .map_err(prep)?;

    debug!(path = %dir.display(), "Workspace reset");
    Ok(())
}

/// Write the submitted source verbatim to `file` inside `dir`.
pub async fn write_source(dir: &Path, file: &str, code: &str) -> Result<(), RuntimeError> {
    let path = dir.join(file);
    tokio::fs::write(&path, code)
        .await
        .map_err(|source| RuntimeError::WorkspacePrep { path, source })
}

/// Run the language's initialization command inside `dir`.
///
/// An "already exists" complaint counts as success.
pub async fn init(dir: &Path, binary: &Path, args: &[&str]) -> Result<(), RuntimeError> {
    let output = Command::new(binary)
        .args(args)
        .current_dir(dir)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RuntimeError::WorkspaceInit(format!("spawning {}: {e}", binary.display())))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    if stderr.contains("already exists") {
        debug!(path = %dir.display(), "Workspace already initialized");
        return Ok(());
    }

    Err(RuntimeError::WorkspaceInit(format!(
        "{} {} exited with {}: {}",
        binary.display(),
        args.join(" "),
        output.status,
        stderr.trim()
    )))
}
