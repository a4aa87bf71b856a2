//! Platform-specific delivery of signals to a job's process tree

use raibid_common::ProcessSignal;
use tokio::process::Child;

use crate::error::RunnerError;

/// Send `signal` to the process group led by `child`
///
/// A group that has already exited is not an error.
#[cfg(unix)]
pub(crate) fn signal_process_tree(child: &mut Child, signal: ProcessSignal) -> Result<(), RunnerError> {
    match child.id() {
        Some(pid) => signal_process_group(pid, signal),
        None => Ok(()),
    }
}

/// Send `signal` to the process group `pgid`, which may outlive its leader
#[cfg(unix)]
pub(crate) fn signal_process_group(pgid: u32, signal: ProcessSignal) -> Result<(), RunnerError> {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    match killpg(Pid::from_raw(pgid as i32), to_nix(signal)) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(RunnerError::Signal(format!(
            "failed to send {} to process group {}: {}",
            signal, pgid, e
        ))),
    }
}

/// Without process groups the best available option is killing the child
#[cfg(not(unix))]
pub(crate) fn signal_process_tree(child: &mut Child, _signal: ProcessSignal) -> Result<(), RunnerError> {
    match child.start_kill() {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(RunnerError::Signal(e.to_string())),
    }
}

/// Only the child itself was ever started
#[cfg(not(unix))]
pub(crate) fn signal_process_group(_pgid: u32, _signal: ProcessSignal) -> Result<(), RunnerError> {
    Ok(())
}

#[cfg(unix)]
fn to_nix(signal: ProcessSignal) -> nix::sys::signal::Signal {
    use nix::sys::signal::Signal;

    match signal {
        ProcessSignal::Hup => Signal::SIGHUP,
        ProcessSignal::Int => Signal::SIGINT,
        ProcessSignal::Quit => Signal::SIGQUIT,
        ProcessSignal::Kill => Signal::SIGKILL,
        ProcessSignal::Usr1 => Signal::SIGUSR1,
        ProcessSignal::Usr2 => Signal::SIGUSR2,
        ProcessSignal::Term => Signal::SIGTERM,
    }
}

/// Name of a signal number as reported to the coordinator
#[cfg(unix)]
pub(crate) fn signal_name(number: i32) -> String {
    match nix::sys::signal::Signal::try_from(number) {
        Ok(signal) => signal.as_str().to_string(),
        Err(_) => format!("SIG{}", number),
    }
}
