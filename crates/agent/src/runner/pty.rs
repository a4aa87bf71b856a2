//! Pseudo-terminal plumbing for job processes

use std::fs::File;
use std::io::Read;
use std::os::fd::OwnedFd;
use std::process::Stdio;

use tokio::task::JoinHandle;
use tracing::trace;

use super::OutputSink;
use crate::error::RunnerError;

/// A freshly opened pseudo-terminal
pub(crate) struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

/// The child's ends of the terminal
pub(crate) struct PtyStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl Pty {
    pub fn open() -> Result<Self, RunnerError> {
        let result = nix::pty::openpty(None, None).map_err(|e| RunnerError::Pty(e.to_string()))?;
        Ok(Self {
            master: result.master,
            slave: result.slave,
        })
    }

    /// Hand the slave side to the child, keeping the master
    ///
    /// The returned `Stdio` values must be dropped (with the command that
    /// owns them) once the child is spawned, otherwise the master never
    /// sees end-of-file.
    pub fn split(self) -> Result<(OwnedFd, PtyStdio), RunnerError> {
        let stdin = self
            .slave
            .try_clone()
            .map_err(|e| RunnerError::Pty(e.to_string()))?;
        let stdout = self
            .slave
            .try_clone()
            .map_err(|e| RunnerError::Pty(e.to_string()))?;

        Ok((
            self.master,
            PtyStdio {
                stdin: Stdio::from(stdin),
                stdout: Stdio::from(stdout),
                stderr: Stdio::from(self.slave),
            },
        ))
    }
}

/// Copy everything written to the terminal into `output`
///
/// Reading the master is blocking, so it runs on the blocking pool. It ends
/// with EIO once every slave descriptor is closed.
pub(crate) fn spawn_master_reader(master: OwnedFd, output: OutputSink) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut master = File::from(master);
        let mut buf = [0u8; 8192];

        loop {
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    trace!("pty master closed: {}", e);
                    break;
                }
            }
        }
    })
}
