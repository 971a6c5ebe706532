use std::ffi::OsString;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::process::Command;
use zeroize::Zeroizing;

use super::process::{run_captured, CapturedOutput, ExecLimits, ProcessSpec};
use super::stream::OutputSink;
use crate::askpass::AskpassServer;
use crate::error_handling::types::ExecutionError;
use crate::recording::{AuditLog, AuditOperation, AuditOutcome};

/// Printed by the elevated wrapper once `sudo` accepted the credentials.
pub const ELEVATION_MARKER: &str = "__SHELLWARD_ELEVATED__";

pub enum LocalBody {
    /// Passed to `<command_shell> -c`
    Command(String),
    /// Fed on stdin to `<script_shell> -s`
    Script(Zeroizing<Vec<u8>>),
}

/// Runs payloads on the service host, elevating through `sudo` when another
/// identity is requested.
pub struct LocalRunner {
    command_shell: String,
    script_shell: String,
    identity: String,
    /// Program and leading arguments of the elevation command
    sudo: Vec<OsString>,
    audit: Arc<AuditLog>,
}

/// Name of the user the service runs as.
pub async fn current_identity() -> String {
    match Command::new("id").arg("-un").output().await {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).trim().to_string(),
        _ => {
            warn!("`id -un` failed, falling back to $USER");
            std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
        }
    }
}

impl LocalRunner {
    pub fn new(
        command_shell: impl Into<String>,
        script_shell: impl Into<String>,
        identity: impl Into<String>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            command_shell: command_shell.into(),
            script_shell: script_shell.into(),
            identity: identity.into(),
            sudo: vec!["sudo".into()],
            audit,
        }
    }

    /// Replaces the elevation command. It must accept sudo's `-A`, `-n`,
    /// `-k` and `-u <user> --` arguments.
    pub fn with_sudo<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let command: Vec<OsString> = command.into_iter().map(Into::into).collect();
        if !command.is_empty() {
            self.sudo = command;
        }
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn needs_elevation(&self, run_as: Option<&str>) -> bool {
        run_as.is_some_and(|user| user != self.identity)
    }

    fn inner_command(&self, body: &LocalBody) -> Vec<OsString> {
        match body {
            LocalBody::Command(command) => vec![
                self.command_shell.clone().into(),
                "-c".into(),
                command.clone().into(),
            ],
            LocalBody::Script(_) => vec![self.script_shell.clone().into(), "-s".into()],
        }
    }

    pub async fn run(
        &self,
        tag: &str,
        body: LocalBody,
        run_as: Option<&str>,
        sudo_password: Option<&Zeroizing<String>>,
        limits: ExecLimits,
        sink: Option<&OutputSink>,
    ) -> Result<CapturedOutput, ExecutionError> {
        let mut argv = self.inner_command(&body);
        let stdin = match body {
            LocalBody::Script(script) => Some(script),
            LocalBody::Command(_) => None,
        };

        let elevate_to = run_as.filter(|_| self.needs_elevation(run_as));
        let mut askpass = None;
        let mut spec = match elevate_to {
            None => {
                let program = argv.remove(0);
                ProcessSpec::new(tag, program).args(argv)
            }
            Some(user) => {
                info!("[{}] Elevating to {}", tag, user);
                let (program, prefix) = self
                    .sudo
                    .split_first()
                    .ok_or_else(|| ExecutionError::SpawnFailed("no elevation command".to_string()))?;
                let mut spec = ProcessSpec::new(tag, program.clone()).args(prefix.iter().cloned());
                match sudo_password {
                    Some(password) => {
                        let server = AskpassServer::start(password.clone())
                            .map_err(|e| ExecutionError::SpawnFailed(e.to_string()))?;
                        for (k, v) in server.sudo_env() {
                            spec = spec.env(k, v);
                        }
                        spec = spec.arg("-A");
                        askpass = Some(server);
                    }
                    None => spec = spec.arg("-n"),
                }
                let wrapper = format!("printf '%s\\n' {}; exec \"$@\"", ELEVATION_MARKER);
                spec.args(["-k", "-u", user, "--", "/bin/sh", "-c"])
                    .arg(wrapper)
                    .arg("shellward")
                    .args(argv)
                    .start_marker(ELEVATION_MARKER)
            }
        };
        spec = spec.limits(limits);
        if let Some(script) = stdin {
            spec = spec.stdin(script);
        }

        let captured = run_captured(spec, sink)
            .await
            .map_err(|e| ExecutionError::SpawnFailed(e.to_string()));
        drop(askpass);
        let captured = captured?;

        if let Some(user) = elevate_to {
            if !captured.marker_seen && !captured.timed_out {
                self.audit
                    .record(AuditOperation::Elevation, user, AuditOutcome::Failure);
                warn!("[{}] Elevation to {} failed", tag, user);
                return Err(ExecutionError::ElevationFailed);
            }
            if captured.marker_seen {
                self.audit
                    .record(AuditOperation::Elevation, user, AuditOutcome::Success);
            }
        }
        debug!("[{}] Local run finished with {:?}", tag, captured.exit_code);
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> ExecLimits {
        ExecLimits {
            timeout: std::time::Duration::from_secs(10),
            max_output: 4096,
        }
    }

    fn runner(identity: &str) -> LocalRunner {
        LocalRunner::new("/bin/sh", "sh", identity, Arc::new(AuditLog::disabled()))
    }

    #[test]
    fn test_needs_elevation_only_for_other_identity() {
        let r = runner("deploy");
        assert!(!r.needs_elevation(None));
        assert!(!r.needs_elevation(Some("deploy")));
        assert!(r.needs_elevation(Some("root")));
    }

    #[tokio::test]
    async fn test_current_identity_is_not_empty() {
        assert!(!current_identity().await.is_empty());
    }

    #[tokio::test]
    async fn test_runs_command_as_self() {
        let r = runner(&current_identity().await);
        let me = r.identity().to_string();
        let out = r
            .run(
                "t",
                LocalBody::Command("echo ok".to_string()),
                Some(&me),
                None,
                limits(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.text(), "ok\n");
    }

    #[tokio::test]
    async fn test_runs_script_from_stdin() {
        let r = runner("whoever");
        let script = Zeroizing::new(b"export GREETING='hi there'\necho \"$GREETING\"\n".to_vec());
        let out = r
            .run(
                "t",
                LocalBody::Script(script),
                None,
                None,
                limits(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.text(), "hi there\n");
    }
}
