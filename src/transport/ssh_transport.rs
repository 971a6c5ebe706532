use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::process::Command;

use super::agent::EphemeralAgent;
use super::types::{AuthMethod, Endpoint, HostKey, RemoteInvocation, VerifiedHost};
use super::Transport;
use crate::askpass::AskpassServer;
use crate::error_handling::types::TransportError;
use crate::execution::process::{run_captured, CapturedOutput, ExecLimits, ProcessSpec};
use crate::execution::stream::OutputSink;

/// Printed by the remote shell once the session is authenticated.
pub const SESSION_MARKER: &str = "__SHELLWARD_SESSION__";

/// Alias the pinned key is filed under in the per-connection known_hosts.
const PINNED_ALIAS: &str = "shellward-pinned";

/// Preference when a host offers several key types and none is pinned yet.
const KEY_PREFERENCE: [&str; 5] = [
    "ssh-ed25519",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-rsa",
];

/// Transport backed by the system OpenSSH client.
pub struct SshTransport {
    ssh: PathBuf,
    keyscan: PathBuf,
    connect_timeout: Duration,
}

fn resolve(env_override: &str, name: &str) -> Result<PathBuf, TransportError> {
    if let Ok(p) = std::env::var(env_override) {
        let p = p.trim();
        if !p.is_empty() {
            return Ok(PathBuf::from(p));
        }
    }
    which::which(name).map_err(|_| {
        TransportError::ConnectionFailed(format!(
            "{} not found. Install the OpenSSH client or set {}",
            name, env_override
        ))
    })
}

impl SshTransport {
    pub fn discover(connect_timeout: Duration) -> Result<Self, TransportError> {
        let ssh = resolve("SHELLWARD_SSH", "ssh")?;
        let keyscan = resolve("SHELLWARD_SSH_KEYSCAN", "ssh-keyscan")?;
        info!("Using {} and {}", ssh.display(), keyscan.display());
        Ok(Self {
            ssh,
            keyscan,
            connect_timeout,
        })
    }

    fn base_args(&self, host: &VerifiedHost, known_hosts: &std::path::Path) -> Vec<OsString> {
        let endpoint = host.endpoint();
        let mut known_hosts_opt = OsString::from("UserKnownHostsFile=");
        known_hosts_opt.push(known_hosts);
        let mut args: Vec<OsString> = vec![
            "-F".into(),
            "/dev/null".into(),
            "-T".into(),
            "-p".into(),
            endpoint.port.to_string().into(),
            "-l".into(),
            endpoint.username.clone().into(),
            "-o".into(),
            "StrictHostKeyChecking=yes".into(),
            "-o".into(),
            known_hosts_opt,
            "-o".into(),
            "GlobalKnownHostsFile=/dev/null".into(),
            "-o".into(),
            format!("HostKeyAlias={}", PINNED_ALIAS).into(),
            "-o".into(),
            format!("HostKeyAlgorithms={}", host_key_algorithms(host.key().key_type())).into(),
            "-o".into(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)).into(),
            "-o".into(),
            "ServerAliveInterval=15".into(),
            "-o".into(),
            "LogLevel=ERROR".into(),
        ];
        args.extend(["-o".into(), "ControlMaster=no".into()]);
        args
    }
}

/// Signature algorithms that can present a key of `key_type`.
fn host_key_algorithms(key_type: &str) -> String {
    match key_type {
        "ssh-rsa" => "rsa-sha2-512,rsa-sha2-256,ssh-rsa".to_string(),
        other => other.to_string(),
    }
}

/// Parses `ssh-keyscan` output into the keys it lists.
fn parse_keyscan(output: &str) -> Vec<HostKey> {
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _host = fields.next()?;
            let key_type = fields.next()?;
            let blob = fields.next()?;
            HostKey::new(key_type, blob).ok()
        })
        .collect()
}

/// The pinned type when offered, else the preferred type, else the first key.
///
/// A host that no longer offers its pinned type yields a key of another type,
/// which the trust store then rejects.
fn select_host_key(mut keys: Vec<HostKey>, pinned_type: Option<&str>) -> Option<HostKey> {
    if let Some(pinned) = pinned_type {
        if let Some(pos) = keys.iter().position(|k| k.key_type() == pinned) {
            return Some(keys.swap_remove(pos));
        }
    }
    for preferred in KEY_PREFERENCE {
        if let Some(pos) = keys.iter().position(|k| k.key_type() == preferred) {
            return Some(keys.swap_remove(pos));
        }
    }
    keys.into_iter().next()
}

/// Maps a session that never reached the remote shell to an error.
fn classify_failure(host: &VerifiedHost, captured: &CapturedOutput) -> TransportError {
    let text = captured.preamble_text();
    if captured.timed_out {
        return TransportError::ConnectionFailed("timed out before the session started".to_string());
    }
    if text.contains("Permission denied") || text.contains("Too many authentication failures") {
        return TransportError::AuthenticationFailed;
    }
    if text.contains("Host key verification failed")
        || text.contains("REMOTE HOST IDENTIFICATION HAS CHANGED")
    {
        return TransportError::HostKeyMismatch {
            host: host.endpoint().identity(),
            expected: host.key().fingerprint(),
            presented: "unknown".to_string(),
        };
    }
    let reason = text
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("ssh exited before the session started")
        .trim()
        .to_string();
    TransportError::ConnectionFailed(reason)
}

#[async_trait]
impl Transport for SshTransport {
    async fn probe_host_key(
        &self,
        endpoint: &Endpoint,
        preferred_type: Option<&str>,
    ) -> Result<HostKey, TransportError> {
        let timeout = self.connect_timeout.as_secs().max(1);
        let output = tokio::time::timeout(
            self.connect_timeout + Duration::from_secs(5),
            Command::new(&self.keyscan)
                .arg("-T")
                .arg(timeout.to_string())
                .arg("-p")
                .arg(endpoint.port.to_string())
                .arg(&endpoint.host)
                .stdin(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| TransportError::ProbeFailed(format!("{} did not answer", endpoint.identity())))??;

        let keys = parse_keyscan(&String::from_utf8_lossy(&output.stdout));
        debug!("{} offered {} host keys", endpoint.identity(), keys.len());
        select_host_key(keys, preferred_type).ok_or_else(|| {
            TransportError::ProbeFailed(format!("no host key received from {}", endpoint.identity()))
        })
    }

    async fn execute(
        &self,
        host: &VerifiedHost,
        auth: &AuthMethod,
        invocation: &RemoteInvocation,
        limits: ExecLimits,
        sink: Option<&OutputSink>,
    ) -> Result<CapturedOutput, TransportError> {
        let endpoint = host.endpoint();
        let tag = endpoint.to_string();

        let mut known_hosts = tempfile::NamedTempFile::new()?;
        writeln!(
            known_hosts,
            "{} {} {}",
            PINNED_ALIAS,
            host.key().key_type(),
            host.key().key_base64()
        )?;
        known_hosts.flush()?;

        let mut spec = ProcessSpec::new(tag.clone(), self.ssh.clone())
            .args(self.base_args(host, known_hosts.path()));

        let mut agent = None;
        let mut askpass = None;
        match auth {
            AuthMethod::PrivateKey(key) => {
                let started = EphemeralAgent::start(key).await?;
                let mut identity_agent = OsString::from("IdentityAgent=");
                identity_agent.push(started.socket_path());
                spec = spec.args([
                    OsString::from("-o"),
                    identity_agent,
                    "-o".into(),
                    "BatchMode=yes".into(),
                    "-o".into(),
                    "PreferredAuthentications=publickey".into(),
                    "-o".into(),
                    "PasswordAuthentication=no".into(),
                    "-o".into(),
                    "KbdInteractiveAuthentication=no".into(),
                ]);
                agent = Some(started);
            }
            AuthMethod::Password(password) => {
                let server = AskpassServer::start(password.clone())?;
                for (k, v) in server.ssh_env() {
                    spec = spec.env(k, v);
                }
                spec = spec.args([
                    "-o",
                    "BatchMode=no",
                    "-o",
                    "PubkeyAuthentication=no",
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "NumberOfPasswordPrompts=1",
                    "-o",
                    "IdentityAgent=none",
                ]);
                askpass = Some(server);
            }
        }

        let remote = format!(
            "printf '%s\\n' {}; exec {}",
            SESSION_MARKER, invocation.remote_command
        );
        spec = spec
            .arg(&endpoint.host)
            .arg(remote)
            .stdin(invocation.stdin.clone())
            .start_marker(SESSION_MARKER)
            .limits(limits);

        debug!("[{}] Connecting with {}", tag, auth.kind());
        let captured = run_captured(spec, sink).await;

        drop(askpass);
        if let Some(agent) = agent {
            agent.shutdown().await;
        }
        let captured = captured?;

        if captured.marker_seen {
            return Ok(captured);
        }
        let err = classify_failure(host, &captured);
        warn!("[{}] Session did not start: {}", tag, err);
        Err(err)
    }
}
