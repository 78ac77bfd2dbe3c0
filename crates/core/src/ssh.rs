//! Admin SSH key pair for the test VMs.

use std::path::{Path, PathBuf};

use crate::cleanup::TempDirRegistry;
use crate::command::{run_mandatory, CommandError, CommandRunner, CommandSpec};
use crate::names::TMP_SSH_KEYS_PREFIX;

/// Base name of the generated key pair.
pub const ADMIN_KEY_NAME: &str = "admin";

#[derive(Debug, thiserror::Error)]
pub enum SshKeyError {
    #[error("Failed to create the ssh key directory: {0}")]
    TempDir(#[from] std::io::Error),

    #[error("Failed to generate ssh keys: {0}")]
    Keygen(#[from] CommandError),
}

/// `ssh-keygen` producing an unencrypted ed25519 pair at `<dir>/admin`.
pub fn keygen_command(dir: &Path) -> CommandSpec {
    CommandSpec::new("ssh-keygen").args([
        "-t".to_string(),
        "ed25519".to_string(),
        "-N".to_string(),
        String::new(),
        "-f".to_string(),
        dir.join(ADMIN_KEY_NAME).display().to_string(),
    ])
}

/// Return `configured` when set, otherwise generate a key pair in a fresh
/// registered temp directory.
pub async fn ensure_ssh_keys(
    configured: Option<&Path>,
    runner: &dyn CommandRunner,
    registry: &mut TempDirRegistry,
) -> Result<PathBuf, SshKeyError> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }
    tracing::info!("SSH_KEY_DIR variable is not set, generating keys");
    let dir = registry.create(TMP_SSH_KEYS_PREFIX)?;
    let spec = keygen_command(&dir);
    tracing::debug!(command = %spec, "Generating ssh keys");
    run_mandatory(runner, &spec).await?;
    tracing::info!(dir = %dir.display(), "SSH keys generated");
    Ok(dir)
}
