use std::sync::{Arc, LazyLock};

use chrono::Utc;
use log::{debug, error, info, warn};
use regex::Regex;
use uuid::Uuid;
use zeroize::Zeroizing;

use super::local_runner::{LocalBody, LocalRunner};
use super::process::{CapturedOutput, ExecLimits};
use super::stream::{channel, ExecutionEvent, ExecutionStream, OutputSink};
use super::types::{ExecutionPayload, ExecutionRequest, ExecutionResult, ExecutionTarget};
use crate::error_handling::types::{ExecutionError, SecretError, StorageError};
use crate::recording::{HistoryRecorder, RunSummary};
use crate::secrets::provider::validate_id;
use crate::secrets::{SecretAggregator, SecretKind, VAULT_PREFIX};
use crate::storage::Inventory;
use crate::transport::{AuthMethod, Endpoint, RemoteExecutor, RemoteInvocation};

const STREAM_CAPACITY: usize = 64;

static USER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]{0,31}$").expect("valid regex"));

static ENV_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,127}$").expect("valid regex"));

/// Resolves execution requests and runs them locally or on a target.
///
/// Every run that passed validation ends up as exactly one history entry,
/// whatever its outcome.
pub struct ExecutionDispatcher {
    inventory: Arc<dyn Inventory>,
    secrets: Arc<SecretAggregator>,
    local: LocalRunner,
    remote: RemoteExecutor,
    history: HistoryRecorder,
    limits: ExecLimits,
    script_shell: String,
}

/// A payload with everything it needs already decrypted.
enum ResolvedBody {
    Command(String),
    Script(Zeroizing<Vec<u8>>),
}

impl ExecutionDispatcher {
    /// `limits.timeout` is the ceiling for any request timeout.
    pub fn new(
        inventory: Arc<dyn Inventory>,
        secrets: Arc<SecretAggregator>,
        local: LocalRunner,
        remote: RemoteExecutor,
        history: HistoryRecorder,
        limits: ExecLimits,
        script_shell: impl Into<String>,
    ) -> Self {
        Self {
            inventory,
            secrets,
            local,
            remote,
            history,
            limits,
            script_shell: script_shell.into(),
        }
    }

    pub fn history(&self) -> &HistoryRecorder {
        &self.history
    }

    /// Runs `request` to completion.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        self.dispatch(request, None).await
    }

    /// Runs `request` in the background and returns its event stream.
    ///
    /// The stream yields `status` and `output` events and ends with exactly one
    /// `result` or `error` event.
    pub fn execute_stream(self: &Arc<Self>, request: ExecutionRequest) -> ExecutionStream {
        let (sink, stream) = channel(STREAM_CAPACITY);
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = dispatcher.dispatch(request, Some(&sink)).await;
            let event = match outcome {
                Ok(result) => ExecutionEvent::Result { result },
                Err(e) => ExecutionEvent::Error {
                    kind: e.kind().to_string(),
                    message: e.to_string(),
                    security: e.is_security_event(),
                },
            };
            sink.send(event).await;
        });
        stream
    }

    async fn dispatch(
        &self,
        request: ExecutionRequest,
        sink: Option<&OutputSink>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let id = Uuid::new_v4();
        let tag = id.to_string();
        if let Err(e) = validate(&request) {
            warn!("[{}] Rejected request: {}", tag, e);
            return Err(e);
        }
        let limits = self.limits_for(&request)?;

        let mut summary = RunSummary {
            id,
            command_text: command_text(&request.payload),
            target_label: match &request.target {
                ExecutionTarget::Local => "local".to_string(),
                ExecutionTarget::Remote { target_id, .. } => target_id.clone(),
            },
            identity: request
                .run_as
                .clone()
                .unwrap_or_else(|| self.local.identity().to_string()),
            started_at: Utc::now(),
        };
        info!(
            "[{}] Executing {} on {} as {}",
            tag,
            match &request.payload {
                ExecutionPayload::Command(c) => format!("command ({} bytes)", c.len()),
                ExecutionPayload::Script { script_id, .. } => format!("script {}", script_id),
            },
            summary.target_label,
            summary.identity
        );

        let outcome = self
            .run(&tag, request, limits, &mut summary, sink)
            .await
            .map(into_result);

        match &outcome {
            Ok(result) => info!(
                "[{}] Finished with exit code {:?} in {} ms{}",
                tag,
                result.exit_code,
                result.duration_ms,
                if result.timed_out { " (timed out)" } else { "" }
            ),
            Err(e) => warn!("[{}] Failed: {}", tag, e),
        }
        if let Err(e) = self.history.record(&summary, &outcome).await {
            error!("[{}] Could not record history: {}", tag, e);
        }
        outcome
    }

    fn limits_for(&self, request: &ExecutionRequest) -> Result<ExecLimits, ExecutionError> {
        let timeout = match request.timeout {
            Some(t) if t.is_zero() => {
                return Err(ExecutionError::InvalidRequest("timeout must be positive".to_string()))
            }
            Some(t) => t.min(self.limits.timeout),
            None => self.limits.timeout,
        };
        Ok(ExecLimits {
            timeout,
            max_output: self.limits.max_output,
        })
    }

    async fn run(
        &self,
        tag: &str,
        mut request: ExecutionRequest,
        limits: ExecLimits,
        summary: &mut RunSummary,
        sink: Option<&OutputSink>,
    ) -> Result<CapturedOutput, ExecutionError> {
        let body = self.resolve_body(&request.payload, sink).await?;

        match &request.target {
            ExecutionTarget::Local => {
                let body = match body {
                    ResolvedBody::Command(c) => LocalBody::Command(c),
                    ResolvedBody::Script(s) => LocalBody::Script(s),
                };
                let sudo = request.sudo_password.take().or(request.password.take());
                if let Some(sink) = sink {
                    sink.status("Running locally").await;
                }
                self.local
                    .run(tag, body, request.run_as.as_deref(), sudo.as_ref(), limits, sink)
                    .await
            }
            ExecutionTarget::Remote {
                target_id,
                credential_id,
            } => {
                let target = self
                    .inventory
                    .get_target(target_id)
                    .await
                    .map_err(|e| inventory_error("target", e))?;
                summary.target_label = target.label();
                let endpoint = Endpoint {
                    host: target.hostname.clone(),
                    port: target.port,
                    username: request.run_as.clone().unwrap_or(target.username.clone()),
                };
                summary.identity = endpoint.username.clone();

                let mut auth = Vec::with_capacity(2);
                if let Some(credential_id) = credential_id {
                    let credential = self
                        .inventory
                        .get_credential(credential_id)
                        .await
                        .map_err(|e| inventory_error("credential", e))?;
                    let key = self
                        .secrets
                        .get_text(SecretKind::Credential, &credential.id)
                        .await?;
                    auth.push(AuthMethod::PrivateKey(key));
                }
                if let Some(password) = request.password.take() {
                    auth.push(AuthMethod::Password(password));
                }
                debug!("[{}] {} auth methods for {}", tag, auth.len(), endpoint);

                let invocation = match body {
                    ResolvedBody::Command(command) => RemoteInvocation {
                        remote_command: "sh -s".to_string(),
                        stdin: Zeroizing::new(format!("{}\n", command).into_bytes()),
                    },
                    ResolvedBody::Script(script) => RemoteInvocation {
                        remote_command: format!("{} -s", self.script_shell),
                        stdin: script,
                    },
                };
                Ok(self
                    .remote
                    .run(tag, &endpoint, &auth, &invocation, limits, sink)
                    .await?)
            }
        }
    }

    async fn resolve_body(
        &self,
        payload: &ExecutionPayload,
        sink: Option<&OutputSink>,
    ) -> Result<ResolvedBody, ExecutionError> {
        let (script_id, variable_ids) = match payload {
            ExecutionPayload::Command(command) => return Ok(ResolvedBody::Command(command.clone())),
            ExecutionPayload::Script {
                script_id,
                variable_ids,
            } => (script_id, variable_ids),
        };
        if let Some(sink) = sink {
            sink.status("Loading script").await;
        }
        let script = self.secrets.get(SecretKind::Script, script_id).await?;
        if script.expose().iter().all(u8::is_ascii_whitespace) {
            return Err(ExecutionError::InvalidRequest("script is empty".to_string()));
        }

        let mut body = Zeroizing::new(Vec::with_capacity(script.expose().len() + 64));
        for variable_id in variable_ids {
            let value = self.secrets.get(SecretKind::Variable, variable_id).await?;
            let value = value.expose_str().map_err(ExecutionError::Secret)?;
            let name = variable_id.strip_prefix(VAULT_PREFIX).unwrap_or(variable_id);
            body.extend_from_slice(export_line(name, value).as_bytes());
        }
        body.extend_from_slice(script.expose());
        if body.last() != Some(&b'\n') {
            body.push(b'\n');
        }
        Ok(ResolvedBody::Script(body))
    }
}

fn validate(request: &ExecutionRequest) -> Result<(), ExecutionError> {
    let invalid = |msg: String| Err(ExecutionError::InvalidRequest(msg));
    match &request.payload {
        ExecutionPayload::Command(command) => {
            if command.trim().is_empty() {
                return invalid("command is empty".to_string());
            }
            if command.contains('\0') {
                return invalid("command contains a NUL byte".to_string());
            }
        }
        ExecutionPayload::Script {
            script_id,
            variable_ids,
        } => {
            validate_reference("script", script_id)?;
            for variable_id in variable_ids {
                let name = variable_id.strip_prefix(VAULT_PREFIX).unwrap_or(variable_id);
                if !ENV_NAME.is_match(name) {
                    return invalid(format!("variable {:?} is not a valid environment name", variable_id));
                }
            }
        }
    }
    if let Some(user) = &request.run_as {
        if !USER_NAME.is_match(user) {
            return invalid(format!("malformed identity {:?}", user));
        }
    }
    if let ExecutionTarget::Remote {
        target_id,
        credential_id,
    } = &request.target
    {
        validate_reference("target", target_id)?;
        if let Some(credential_id) = credential_id {
            validate_reference("credential", credential_id)?;
        }
    }
    Ok(())
}

fn validate_reference(what: &str, id: &str) -> Result<(), ExecutionError> {
    let bare = id.strip_prefix(VAULT_PREFIX).unwrap_or(id);
    validate_id(bare).map_err(|_| ExecutionError::InvalidRequest(format!("malformed {} reference", what)))
}

fn inventory_error(what: &str, err: StorageError) -> ExecutionError {
    match err {
        StorageError::NotFound => ExecutionError::NotFound(what.to_string()),
        other => ExecutionError::Secret(SecretError::Storage(other)),
    }
}

/// What the history row shows as the command. Script bodies are referenced,
/// not copied.
fn command_text(payload: &ExecutionPayload) -> String {
    match payload {
        ExecutionPayload::Command(command) => command.clone(),
        ExecutionPayload::Script { script_id, .. } => format!("script:{}", script_id),
    }
}

fn export_line(name: &str, value: &str) -> String {
    format!("export {}='{}'\n", name, value.replace('\'', r"'\''"))
}

fn into_result(captured: CapturedOutput) -> ExecutionResult {
    ExecutionResult {
        output: captured.text(),
        exit_code: captured.exit_code,
        duration_ms: u64::try_from(captured.duration.as_millis()).unwrap_or(u64::MAX),
        started_at: captured.started_at,
        timed_out: captured.timed_out,
        truncated: captured.truncated,
    }
}
