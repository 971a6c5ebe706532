use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use tokio::time::Instant;

use super::trust_store::{TrustDecision, TrustStore};
use super::types::{AuthMethod, Endpoint, RemoteInvocation, VerifiedHost};
use super::Transport;
use crate::error_handling::types::TransportError;
use crate::execution::process::{CapturedOutput, ExecLimits};
use crate::execution::stream::OutputSink;
use crate::recording::{AuditLog, AuditOperation, AuditOutcome};

/// Runs invocations on remote hosts, verifying the host key first.
pub struct RemoteExecutor {
    transport: Arc<dyn Transport>,
    trust: Arc<TrustStore>,
    audit: Arc<AuditLog>,
}

impl RemoteExecutor {
    pub fn new(transport: Arc<dyn Transport>, trust: Arc<TrustStore>, audit: Arc<AuditLog>) -> Self {
        Self {
            transport,
            trust,
            audit,
        }
    }

    /// Probes the host and checks the presented key against the trust store.
    pub async fn verify(&self, endpoint: &Endpoint) -> Result<VerifiedHost, TransportError> {
        let identity = endpoint.identity();
        let pinned = self.trust.pinned(&identity).await;
        let presented = self
            .transport
            .probe_host_key(endpoint, pinned.as_ref().map(|k| k.key_type.as_str()))
            .await?;

        let decision = self.trust.verify_or_record(&identity, &presented).await;
        self.audit
            .record(AuditOperation::HostKeyTrust, &identity, AuditOutcome::of(&decision));
        match decision? {
            TrustDecision::Recorded => info!(
                "First contact with {}, pinned {}",
                identity,
                presented.fingerprint()
            ),
            TrustDecision::Verified => {}
        }
        Ok(VerifiedHost::new(endpoint.clone(), presented))
    }

    /// Verifies the host, then tries each auth method in order until one is
    /// accepted. Only an authentication failure, or a key agent that could
    /// not be set up, moves on to the next method.
    ///
    /// `limits.timeout` bounds the whole run: every attempt gets what is left
    /// of it, and a run whose time is used up before any attempt succeeded
    /// comes back timed out.
    pub async fn run(
        &self,
        tag: &str,
        endpoint: &Endpoint,
        auth: &[AuthMethod],
        invocation: &RemoteInvocation,
        limits: ExecLimits,
        sink: Option<&OutputSink>,
    ) -> Result<CapturedOutput, TransportError> {
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = start + limits.timeout;

        if let Some(sink) = sink {
            sink.status(format!("Verifying host key of {}", endpoint.identity()))
                .await;
        }
        let host = self.verify(endpoint).await?;
        let subject = endpoint.to_string();
        let mut rejected = false;
        let mut setup_failure = None;

        for method in auth {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("[{}] Timed out before {} could be tried", tag, method.kind());
                return Ok(timed_out_before_session(started_at, start.elapsed()));
            }
            if let Some(sink) = sink {
                sink.status(format!("Authenticating as {} ({})", endpoint.username, method.kind()))
                    .await;
            }
            let attempt = self
                .transport
                .execute(&host, method, invocation, limits.with_timeout(remaining), sink)
                .await;
            match attempt {
                Ok(captured) => {
                    self.audit
                        .record(AuditOperation::Authentication, &subject, AuditOutcome::Success);
                    return Ok(captured);
                }
                Err(TransportError::AuthenticationFailed) => {
                    self.audit
                        .record(AuditOperation::Authentication, &subject, AuditOutcome::Failure);
                    warn!("[{}] {} rejected by {}", tag, method.kind(), subject);
                    rejected = true;
                }
                Err(TransportError::Agent(e)) if matches!(method, AuthMethod::PrivateKey(_)) => {
                    warn!("[{}] Key agent unavailable ({}), trying next method", tag, e);
                    setup_failure = Some(TransportError::Agent(e));
                }
                Err(e) => return Err(e),
            }
        }

        if auth.is_empty() {
            warn!("[{}] No credentials available for {}", tag, subject);
            self.audit
                .record(AuditOperation::Authentication, &subject, AuditOutcome::Failure);
        }
        match setup_failure {
            Some(e) if !rejected => Err(e),
            _ => Err(TransportError::AuthenticationFailed),
        }
    }
}

fn timed_out_before_session(started_at: DateTime<Utc>, duration: Duration) -> CapturedOutput {
    CapturedOutput {
        output: Vec::new(),
        exit_code: None,
        timed_out: true,
        truncated: true,
        marker_seen: false,
        preamble: Vec::new(),
        started_at,
        duration,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::transport::HostKey;

    /// Transport that accepts one password and records what reached it.
    pub struct FakeTransport {
        pub key: Mutex<HostKey>,
        pub password: String,
        pub accepts_keys: bool,
        pub probes: Mutex<usize>,
        /// (auth kind, stdin) for every execute call
        pub sent: Mutex<Vec<(String, Vec<u8>)>>,
        pub delay: Duration,
        /// Time a key attempt takes before being rejected, capped by the
        /// attempt's timeout
        pub key_delay: Duration,
        /// Fails key attempts as if no agent could be started
        pub agent_broken: bool,
        /// Timeout handed to each execute call
        pub timeouts: Mutex<Vec<Duration>>,
    }

    impl FakeTransport {
        pub fn new(key: HostKey, password: &str) -> Self {
            Self {
                key: Mutex::new(key),
                password: password.to_string(),
                accepts_keys: false,
                probes: Mutex::new(0),
                sent: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                key_delay: Duration::ZERO,
                agent_broken: false,
                timeouts: Mutex::new(Vec::new()),
            }
        }

        pub fn execute_calls(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn probe_host_key(
            &self,
            _endpoint: &Endpoint,
            _preferred_type: Option<&str>,
        ) -> Result<HostKey, TransportError> {
            *self.probes.lock().unwrap() += 1;
            Ok(self.key.lock().unwrap().clone())
        }

        async fn execute(
            &self,
            host: &VerifiedHost,
            auth: &AuthMethod,
            invocation: &RemoteInvocation,
            limits: ExecLimits,
            sink: Option<&OutputSink>,
        ) -> Result<CapturedOutput, TransportError> {
            self.sent
                .lock()
                .unwrap()
                .push((auth.kind().to_string(), invocation.stdin.to_vec()));
            self.timeouts.lock().unwrap().push(limits.timeout);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let AuthMethod::PrivateKey(_) = auth {
                if self.agent_broken {
                    return Err(TransportError::Agent("ssh-agent not found".to_string()));
                }
                tokio::time::sleep(self.key_delay.min(limits.timeout)).await;
            }
            let accepted = match auth {
                AuthMethod::Password(p) => p.as_str() == self.password,
                AuthMethod::PrivateKey(_) => self.accepts_keys,
            };
            if !accepted {
                return Err(TransportError::AuthenticationFailed);
            }
            let output = format!("ran on {}\n", host.endpoint().host).into_bytes();
            if let Some(sink) = sink {
                sink.output(&output).await;
            }
            Ok(CapturedOutput {
                output,
                exit_code: Some(0),
                timed_out: false,
                truncated: false,
                marker_seen: true,
                preamble: Vec::new(),
                started_at: Utc::now(),
                duration: Duration::from_millis(1),
            })
        }
    }
}
