use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, warn};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use zeroize::Zeroizing;

use crate::error_handling::types::TransportError;

const SOCKET_WAIT: Duration = Duration::from_secs(5);
const ADD_TIMEOUT: Duration = Duration::from_secs(10);

/// A private `ssh-agent` holding one decrypted key in memory.
///
/// The agent listens on a socket inside a directory only the service user can
/// enter. Dropping the value kills the agent, which discards the key.
pub struct EphemeralAgent {
    dir: TempDir,
    socket: PathBuf,
    child: Child,
}

fn tool(name: &str) -> Result<PathBuf, TransportError> {
    which::which(name).map_err(|_| TransportError::Agent(format!("{} not found on PATH", name)))
}

impl EphemeralAgent {
    /// Starts an agent and loads `private_key` into it through stdin.
    ///
    /// A key the agent refuses (wrong format, passphrase protected) is
    /// reported as `AuthenticationFailed`.
    pub async fn start(private_key: &Zeroizing<String>) -> Result<Self, TransportError> {
        let agent_bin = tool("ssh-agent")?;
        let add_bin = tool("ssh-add")?;

        let dir = tempfile::Builder::new().prefix("shellward-agent-").tempdir()?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        let socket = dir.path().join("agent.sock");

        let child = Command::new(agent_bin)
            .arg("-D")
            .arg("-a")
            .arg(&socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        let mut agent = Self { dir, socket, child };
        agent.wait_for_socket().await?;

        let mut add = Command::new(add_bin)
            .arg("-q")
            .arg("-")
            .env("SSH_AUTH_SOCK", &agent.socket)
            .env("SSH_ASKPASS_REQUIRE", "never")
            .env_remove("DISPLAY")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = add.stdin.take() {
            let mut material = Zeroizing::new(private_key.as_bytes().to_vec());
            if !material.ends_with(b"\n") {
                material.push(b'\n');
            }
            stdin.write_all(&material).await?;
            stdin.shutdown().await?;
        }

        match tokio::time::timeout(ADD_TIMEOUT, add.wait()).await {
            Ok(Ok(status)) if status.success() => {
                debug!("Ephemeral agent ready at {}", agent.socket.display());
                Ok(agent)
            }
            Ok(Ok(_)) => {
                warn!("Key rejected by ssh-add");
                agent.kill().await;
                Err(TransportError::AuthenticationFailed)
            }
            Ok(Err(e)) => {
                agent.kill().await;
                Err(TransportError::IoError(e))
            }
            Err(_) => {
                agent.kill().await;
                Err(TransportError::Agent("ssh-add timed out".to_string()))
            }
        }
    }

    async fn wait_for_socket(&mut self) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + SOCKET_WAIT;
        while tokio::time::Instant::now() < deadline {
            if self.socket.exists() {
                return Ok(());
            }
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(TransportError::Agent(format!("ssh-agent exited with {}", status)));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.kill().await;
        Err(TransportError::Agent("ssh-agent socket did not appear".to_string()))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    async fn kill(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }

    /// Kills the agent and removes its directory.
    pub async fn shutdown(mut self) {
        self.kill().await;
        debug!("Ephemeral agent at {} stopped", self.dir.path().display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_tools_available() -> bool {
        which::which("ssh-agent").is_ok() && which::which("ssh-add").is_ok()
    }

    #[tokio::test]
    async fn test_garbage_key_is_rejected_and_cleaned_up() {
        if !agent_tools_available() {
            return;
        }
        let result = EphemeralAgent::start(&Zeroizing::new("not a key".to_string())).await;
        assert!(matches!(result, Err(TransportError::AuthenticationFailed)));
    }

    #[tokio::test]
    async fn test_generated_key_loads_and_is_wiped() {
        if !agent_tools_available() || which::which("ssh-keygen").is_err() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("id");
        let status = std::process::Command::new("ssh-keygen")
            .args(["-q", "-t", "ed25519", "-N", "", "-f"])
            .arg(&key_path)
            .status()
            .unwrap();
        assert!(status.success());
        let key = Zeroizing::new(std::fs::read_to_string(&key_path).unwrap());

        let agent = EphemeralAgent::start(&key).await.unwrap();
        let socket = agent.socket_path().to_path_buf();
        let listed = Command::new("ssh-add")
            .arg("-l")
            .env("SSH_AUTH_SOCK", &socket)
            .output()
            .await
            .unwrap();
        assert!(listed.status.success());

        agent.shutdown().await;
        assert!(!socket.exists());
    }
}
