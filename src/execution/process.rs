//! Child process execution with bounded time and bounded output.
//!
//! The child runs in its own process group so a timeout can kill everything
//! it started. stdout and stderr are merged in arrival order. Secret input is
//! only ever passed through stdin, never through argv or the environment.

use std::ffi::OsString;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use super::stream::{OutputSink, Utf8Decoder};

/// Time allowed for pipes to drain once the child exited or was killed.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// Bytes of preamble kept while waiting for a start marker.
const MAX_PREAMBLE: usize = 64 * 1024;

/// Bounds applied to one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub timeout: Duration,
    pub max_output: usize,
}

impl ExecLimits {
    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self { timeout, ..self }
    }
}

pub struct ProcessSpec {
    /// Prefix of log lines, usually the run id
    pub tag: String,
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    pub stdin: Option<Zeroizing<Vec<u8>>>,
    pub timeout: Duration,
    pub max_output: usize,
    /// Output before this line is discarded and not streamed
    pub start_marker: Option<String>,
}

impl ProcessSpec {
    pub fn new(tag: impl Into<String>, program: impl Into<OsString>) -> Self {
        Self {
            tag: tag.into(),
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout: Duration::from_secs(300),
            max_output: 1024 * 1024,
            start_marker: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: Zeroizing<Vec<u8>>) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn start_marker(mut self, marker: impl Into<String>) -> Self {
        self.start_marker = Some(marker.into());
        self
    }

    pub fn limits(mut self, limits: ExecLimits) -> Self {
        self.timeout = limits.timeout;
        self.max_output = limits.max_output;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedOutput {
    pub output: Vec<u8>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub truncated: bool,
    /// False when a start marker was requested and never printed
    pub marker_seen: bool,
    /// Tail of the output discarded while waiting for the marker
    pub preamble: Vec<u8>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl CapturedOutput {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn preamble_text(&self) -> String {
        String::from_utf8_lossy(&self.preamble).into_owned()
    }
}

struct Capture {
    buffer: Vec<u8>,
    max: usize,
    truncated: bool,
    marker: Option<Vec<u8>>,
    preamble: Vec<u8>,
    decoder: Utf8Decoder,
}

impl Capture {
    fn new(max: usize, marker: Option<&str>) -> Self {
        Self {
            buffer: Vec::new(),
            max,
            truncated: false,
            marker: marker.map(|m| format!("{}\n", m).into_bytes()),
            preamble: Vec::new(),
            decoder: Utf8Decoder::default(),
        }
    }

    async fn push(&mut self, chunk: &[u8], sink: Option<&OutputSink>) {
        let Some(marker) = &self.marker else {
            self.accept(chunk, sink).await;
            return;
        };
        self.preamble.extend_from_slice(chunk);
        match find(&self.preamble, marker) {
            Some(pos) => {
                let rest = self.preamble.split_off(pos + marker.len());
                self.preamble.clear();
                self.marker = None;
                self.accept(&rest, sink).await;
            }
            None => {
                if self.preamble.len() > MAX_PREAMBLE {
                    let cut = self.preamble.len() - MAX_PREAMBLE / 2;
                    self.preamble.drain(..cut);
                }
            }
        }
    }

    /// Keeps what fits under the cap and streams exactly that.
    async fn accept(&mut self, chunk: &[u8], sink: Option<&OutputSink>) {
        if chunk.is_empty() || self.truncated {
            return;
        }
        let room = self.max.saturating_sub(self.buffer.len());
        let kept = if chunk.len() > room {
            self.truncated = true;
            &chunk[..room]
        } else {
            chunk
        };
        self.buffer.extend_from_slice(kept);
        if let Some(sink) = sink {
            sink.text(self.decoder.decode(kept)).await;
        }
    }

    async fn flush(&mut self, sink: Option<&OutputSink>) {
        if let Some(sink) = sink {
            sink.text(self.decoder.finish()).await;
        }
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<Vec<u8>>, sink: Option<&OutputSink>) {
        let _ = tokio::time::timeout(DRAIN_GRACE, async {
            while let Some(chunk) = rx.recv().await {
                self.push(&chunk, sink).await;
            }
        })
        .await;
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn spawn_reader<R>(mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Returns whether the group was signalled; failures are only logged since
/// the direct child is killed afterwards anyway.
async fn kill_process_group(tag: &str, pid: u32) -> bool {
    let status = Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{}", pid))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    match status {
        Ok(status) if status.success() => true,
        Ok(status) => {
            warn!("[{}] kill for process group {} exited with {}", tag, pid, status);
            false
        }
        Err(e) => {
            warn!("[{}] Could not signal process group {}: {}", tag, pid, e);
            false
        }
    }
}

/// Runs the process described by `spec` to completion or timeout.
///
/// On timeout the whole process group is killed, `exit_code` is `None` and
/// the output gathered so far is returned with `timed_out` and `truncated`
/// set. Output chunks are forwarded to `sink` as they arrive.
pub async fn run_captured(
    spec: ProcessSpec,
    sink: Option<&OutputSink>,
) -> std::io::Result<CapturedOutput> {
    let ProcessSpec {
        tag,
        program,
        args,
        env,
        stdin,
        timeout,
        max_output,
        start_marker,
    } = spec;

    let mut command = Command::new(&program);
    command
        .args(&args)
        .envs(env)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let started_at = Utc::now();
    let start = Instant::now();
    let mut child = command.spawn()?;
    let pid = child.id();
    debug!("[{}] Spawned {:?} (pid {:?})", tag, program, pid);

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        tokio::spawn(async move {
            let _ = pipe.write_all(&input).await;
            let _ = pipe.shutdown().await;
        });
    }

    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(stdout) = child.stdout.take() {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_reader(stderr, tx);
    }

    let mut capture = Capture::new(max_output, start_marker.as_deref());

    let waited = tokio::time::timeout(timeout, async {
        loop {
            tokio::select! {
                Some(chunk) = rx.recv() => capture.push(&chunk, sink).await,
                status = child.wait() => break status,
            }
        }
    })
    .await;

    let (exit_code, timed_out) = match waited {
        Ok(status) => (status?.code(), false),
        Err(_) => {
            warn!("[{}] Timed out after {:?}, killing process group", tag, timeout);
            if let Some(pid) = pid {
                if !kill_process_group(&tag, pid).await {
                    debug!("[{}] Falling back to killing the direct child", tag);
                }
            }
            let _ = child.start_kill();
            let _ = child.wait().await;
            (None, true)
        }
    };
    capture.drain(&mut rx, sink).await;
    capture.flush(sink).await;

    let duration = start.elapsed();
    debug!(
        "[{}] Finished in {:?} with exit code {:?}, {} bytes captured",
        tag,
        duration,
        exit_code,
        capture.buffer.len()
    );

    Ok(CapturedOutput {
        output: capture.buffer,
        exit_code,
        timed_out,
        truncated: capture.truncated || timed_out,
        marker_seen: capture.marker.is_none(),
        preamble: capture.preamble,
        started_at,
        duration,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::stream::{channel, ExecutionEvent, ExecutionStream};
    use futures::StreamExt;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::new("test", "/bin/sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn test_captures_merged_output_and_exit_code() {
        let out = run_captured(sh("echo out; echo err 1>&2; exit 3"), None)
            .await
            .unwrap();
        let text = out.text();
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(out.exit_code, Some(3));
        assert!(!out.timed_out);
        assert!(!out.truncated);
    }

    #[tokio::test]
    async fn test_stdin_is_delivered() {
        let spec = ProcessSpec::new("test", "/bin/sh")
            .arg("-s")
            .stdin(Zeroizing::new(b"read line; echo got:$line\n".to_vec()));
        let out = run_captured(spec, None).await.unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.text().trim(), "got:");
    }

    #[tokio::test]
    async fn test_timeout_kills_group_and_keeps_partial_output() {
        let spec = sh("echo before; sleep 30 & sleep 30; echo after")
            .limits(ExecLimits {
                timeout: Duration::from_millis(300),
                max_output: 4096,
            });
        let start = Instant::now();
        let out = run_captured(spec, None).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(out.timed_out);
        assert!(out.truncated);
        assert_eq!(out.exit_code, None);
        assert!(out.text().contains("before"));
        assert!(!out.text().contains("after"));
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let spec = sh("head -c 100000 /dev/zero").limits(ExecLimits {
            timeout: Duration::from_secs(10),
            max_output: 1000,
        });
        let out = run_captured(spec, None).await.unwrap();
        assert_eq!(out.output.len(), 1000);
        assert!(out.truncated);
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, Some(0));
    }

    async fn streamed_text(stream: ExecutionStream) -> String {
        stream
            .filter_map(|e| async move {
                match e {
                    ExecutionEvent::Output { data } => Some(data),
                    _ => None,
                }
            })
            .collect::<Vec<_>>()
            .await
            .concat()
    }

    #[tokio::test]
    async fn test_chunks_reach_sink() {
        let (sink, stream) = channel(64);
        let out = run_captured(sh("echo one; echo two"), Some(&sink)).await.unwrap();
        drop(sink);
        assert_eq!(streamed_text(stream).await, out.text());
    }

    #[tokio::test]
    async fn test_failed_group_kill_is_reported() {
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();
        assert!(!kill_process_group("test", pid).await);
    }

    #[tokio::test]
    async fn test_character_split_across_reads_streams_intact() {
        let (sink, stream) = channel(64);
        let out = run_captured(sh(r"printf '\303'; sleep 0.2; printf '\251t\n'"), Some(&sink))
            .await
            .unwrap();
        drop(sink);
        assert_eq!(out.text(), "ét\n");
        assert_eq!(streamed_text(stream).await, "ét\n");
    }

    #[tokio::test]
    async fn test_stream_stops_at_output_cap() {
        let (sink, stream) = channel(1024);
        let spec = sh("head -c 100000 /dev/zero").limits(ExecLimits {
            timeout: Duration::from_secs(10),
            max_output: 1000,
        });
        let out = run_captured(spec, Some(&sink)).await.unwrap();
        drop(sink);
        assert!(out.truncated);
        assert_eq!(streamed_text(stream).await.len(), 1000);
    }

    #[tokio::test]
    async fn test_start_marker_hides_preamble() {
        let spec = sh("echo noise; echo MARK; echo payload").start_marker("MARK");
        let out = run_captured(spec, None).await.unwrap();
        assert!(out.marker_seen);
        assert_eq!(out.text(), "payload\n");

        let spec = sh("echo denied; exit 1").start_marker("MARK");
        let out = run_captured(spec, None).await.unwrap();
        assert!(!out.marker_seen);
        assert!(out.output.is_empty());
        assert_eq!(out.preamble_text(), "denied\n");
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let spec = ProcessSpec::new("test", "/nonexistent/shellward-binary");
        assert!(run_captured(spec, None).await.is_err());
    }
}
