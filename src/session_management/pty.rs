use std::ffi::OsString;
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use std::thread;

use log::debug;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use tokio::sync::mpsc;

use crate::error_handling::types::TerminalError;

const READ_CHUNK: usize = 8192;
const OUTPUT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
    /// Inherited variables the child must not see
    pub env_remove: Vec<OsString>,
    pub cols: u16,
    pub rows: u16,
}

/// Control half of a running pseudo-terminal. None of these block.
pub trait PtyControl: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError>;

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError>;

    fn kill(&mut self);
}

/// A spawned shell. `output` ends when the process is gone.
pub struct PtyProcess {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub control: Box<dyn PtyControl>,
}

pub trait PtyBackend: Send + Sync {
    fn spawn(&self, spec: PtySpec) -> Result<PtyProcess, TerminalError>;
}

/// Native pseudo-terminals through `portable-pty`.
///
/// Blocking reads, writes and the child wait each run on a dedicated thread.
#[derive(Default)]
pub struct PortablePtyBackend;

struct PortablePtyControl {
    input: std_mpsc::Sender<Vec<u8>>,
    master: Box<dyn MasterPty + Send>,
    killer: Box<dyn ChildKiller + Send + Sync>,
}

fn backend_error(e: impl std::fmt::Display) -> TerminalError {
    TerminalError::Spawn(e.to_string())
}

impl PtyBackend for PortablePtyBackend {
    fn spawn(&self, spec: PtySpec) -> Result<PtyProcess, TerminalError> {
        let PtyPair { master, slave } = native_pty_system()
            .openpty(PtySize {
                rows: spec.rows,
                cols: spec.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(backend_error)?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        for key in &spec.env_remove {
            cmd.env_remove(key);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if let Some(home) = std::env::var_os("HOME") {
            cmd.cwd(home);
        }

        let mut child = slave.spawn_command(cmd).map_err(backend_error)?;
        // EOF on the master only arrives once every slave handle is closed.
        drop(slave);
        let killer = child.clone_killer();
        let mut reader = master.try_clone_reader().map_err(backend_error)?;
        let mut writer = master.take_writer().map_err(backend_error)?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CAPACITY);
        thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
        });

        let (input_tx, input_rx) = std_mpsc::channel::<Vec<u8>>();
        thread::spawn(move || {
            for chunk in input_rx {
                if writer.write_all(&chunk).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        let pid = child.process_id();
        thread::spawn(move || {
            let status = child.wait();
            debug!("pty child {:?} exited: {:?}", pid, status.map(|s| s.exit_code()));
        });

        Ok(PtyProcess {
            output: output_rx,
            control: Box::new(PortablePtyControl {
                input: input_tx,
                master,
                killer,
            }),
        })
    }
}

impl PtyControl for PortablePtyControl {
    fn write(&mut self, data: &[u8]) -> Result<(), TerminalError> {
        self.input.send(data.to_vec()).map_err(|_| TerminalError::Closed)
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<(), TerminalError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(backend_error)
    }

    fn kill(&mut self) {
        let _ = self.killer.kill();
    }
}
