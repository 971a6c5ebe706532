//! One-shot password delivery to `ssh` and `sudo`.
//!
//! The service binary doubles as an askpass helper: when started with
//! `SHELLWARD_ASKPASS_SOCKET` set, it connects to that Unix socket, copies the
//! single line it receives to stdout and exits. The serving side lives in a
//! private temporary directory and answers exactly one connection, so the
//! password never appears in argv, the environment or on disk.

use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::debug;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

pub const SOCKET_ENV: &str = "SHELLWARD_ASKPASS_SOCKET";

pub struct AskpassServer {
    _dir: TempDir,
    path: PathBuf,
    helper: PathBuf,
    task: JoinHandle<()>,
}

impl AskpassServer {
    pub fn start(secret: Zeroizing<String>) -> io::Result<Self> {
        let helper = std::env::current_exe()?;
        Self::start_with_helper(secret, helper)
    }

    pub fn start_with_helper(secret: Zeroizing<String>, helper: PathBuf) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("shellward-askpass-").tempdir()?;
        std::fs::set_permissions(dir.path(), std::fs::Permissions::from_mode(0o700))?;
        let path = dir.path().join("socket");
        let listener = UnixListener::bind(&path)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;

        let task = tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let _ = stream.write_all(secret.as_bytes()).await;
                let _ = stream.write_all(b"\n").await;
                let _ = stream.shutdown().await;
                debug!("Askpass secret served");
            }
        });

        Ok(Self {
            _dir: dir,
            path,
            helper,
            task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Environment that makes OpenSSH use the helper without a terminal.
    pub fn ssh_env(&self) -> Vec<(OsString, OsString)> {
        vec![
            (SOCKET_ENV.into(), self.path.clone().into_os_string()),
            ("SSH_ASKPASS".into(), self.helper.clone().into_os_string()),
            ("SSH_ASKPASS_REQUIRE".into(), "force".into()),
            ("DISPLAY".into(), ":0".into()),
        ]
    }

    /// Environment for `sudo -A`.
    pub fn sudo_env(&self) -> Vec<(OsString, OsString)> {
        vec![
            (SOCKET_ENV.into(), self.path.clone().into_os_string()),
            ("SUDO_ASKPASS".into(), self.helper.clone().into_os_string()),
        ]
    }
}

impl Drop for AskpassServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Helper side, run from `main` before anything else is initialised.
pub fn run_helper(socket: &Path) -> io::Result<()> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket)?;
    let mut secret = Zeroizing::new(Vec::new());
    stream.read_to_end(&mut secret)?;
    if secret.is_empty() {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no secret served"));
    }
    let mut stdout = io::stdout().lock();
    stdout.write_all(&secret)?;
    stdout.flush()
}
