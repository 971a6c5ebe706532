//! Remote execution over SSH.
//!
//! Host-key verification always happens before anything is sent: the
//! [`RemoteExecutor`] probes the presented key, checks it against the
//! [`TrustStore`] and only then hands a [`VerifiedHost`] to the
//! [`Transport`]. The transport itself pins that exact key for the real
//! connection.

pub mod agent;
pub mod remote;
pub mod ssh_transport;
pub mod trust_store;
pub mod types;

use async_trait::async_trait;

use crate::error_handling::types::TransportError;
use crate::execution::process::{CapturedOutput, ExecLimits};
use crate::execution::stream::OutputSink;

pub use agent::EphemeralAgent;
pub use remote::RemoteExecutor;
pub use ssh_transport::SshTransport;
pub use trust_store::{KnownHost, TrustDecision, TrustStore};
pub use types::{AuthMethod, Endpoint, HostKey, RemoteInvocation, VerifiedHost};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetches the key the host presents. `preferred_type` is the type pinned
    /// for this host, if any.
    async fn probe_host_key(
        &self,
        endpoint: &Endpoint,
        preferred_type: Option<&str>,
    ) -> Result<HostKey, TransportError>;

    /// Authenticates with `auth` and runs `invocation` on a host whose key was
    /// already verified.
    async fn execute(
        &self,
        host: &VerifiedHost,
        auth: &AuthMethod,
        invocation: &RemoteInvocation,
        limits: ExecLimits,
        sink: Option<&OutputSink>,
    ) -> Result<CapturedOutput, TransportError>;
}
