//! Process signals to pool stop requests
//!
//! The first interrupt or terminate asks for a graceful stop, the next one
//! for a forceful stop. Quit is always forceful. Hangup and anything else
//! is logged and ignored.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::pool::Stopper;

/// A signal as seen by the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivedSignal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
}

/// What a signal asks of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    Graceful,
    Forceful,
}

impl StopRequest {
    pub fn is_graceful(self) -> bool {
        self == Self::Graceful
    }
}

/// Counts interrupts so the second one escalates
#[derive(Debug, Default)]
pub struct SignalTranslator {
    interrupts: Mutex<u32>,
}

impl SignalTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&self, signal: ReceivedSignal) -> Option<StopRequest> {
        match signal {
            ReceivedSignal::Interrupt | ReceivedSignal::Terminate => {
                let mut interrupts = self.interrupts.lock();
                *interrupts += 1;
                if *interrupts == 1 {
                    Some(StopRequest::Graceful)
                } else {
                    Some(StopRequest::Forceful)
                }
            }
            ReceivedSignal::Quit => Some(StopRequest::Forceful),
            ReceivedSignal::Hangup => None,
        }
    }

    /// Translate `signal` and forward the result to `stopper`
    pub fn deliver(&self, signal: ReceivedSignal, stopper: &dyn Stopper) {
        match self.translate(signal) {
            Some(request) => {
                info!(signal = ?signal, request = ?request, "Received signal, stopping agents");
                stopper.stop(request.is_graceful());
            }
            None => warn!(signal = ?signal, "Ignoring signal"),
        }
    }
}

/// Listening task returned by [`start`]
///
/// Signals stop being translated once the handle is closed or dropped.
pub struct SignalHandle {
    task: JoinHandle<()>,
}

impl SignalHandle {
    pub fn close(self) {
        self.task.abort();
    }
}

impl Drop for SignalHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Listen for process signals and stop `stopper` accordingly
///
/// Handlers are installed before this returns.
#[cfg(unix)]
pub fn start(stopper: Arc<dyn Stopper>) -> std::io::Result<SignalHandle> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;

    let task = tokio::spawn(async move {
        let translator = SignalTranslator::new();
        loop {
            let received = tokio::select! {
                Some(()) = interrupt.recv() => ReceivedSignal::Interrupt,
                Some(()) = terminate.recv() => ReceivedSignal::Terminate,
                Some(()) = quit.recv() => ReceivedSignal::Quit,
                Some(()) = hangup.recv() => ReceivedSignal::Hangup,
                else => break,
            };
            translator.deliver(received, stopper.as_ref());
        }
    });

    Ok(SignalHandle { task })
}

/// Listen for Ctrl-C and stop `stopper` accordingly
#[cfg(not(unix))]
pub fn start(stopper: Arc<dyn Stopper>) -> std::io::Result<SignalHandle> {
    let task = tokio::spawn(async move {
        let translator = SignalTranslator::new();
        while tokio::signal::ctrl_c().await.is_ok() {
            translator.deliver(ReceivedSignal::Interrupt, stopper.as_ref());
        }
    });

    Ok(SignalHandle { task })
}
