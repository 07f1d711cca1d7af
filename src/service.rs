//! Start/stop contract between a long running program and the process hosting it.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{0}' was already started")]
    AlreadyStarted(String),
    #[error("service '{0}' is not running")]
    NotRunning(String),
    #[error("cannot start the service thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("service '{name}' did not stop within {timeout:?}")]
    StopTimeout { name: String, timeout: Duration },
    #[error("service '{0}' panicked")]
    Panicked(String),
    #[error("service '{name}' failed: {source}")]
    Program {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Cooperative stop flag shared between the host and the program.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        StopSignal(Arc::new(AtomicBool::new(false)))
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Work run by a [`ServiceLifecycle`] on its own thread.
///
/// Implementations must check the stop signal regularly and return once it is raised.
pub trait Program: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn run_until_stopped(self, stop: StopSignal) -> Result<(), Self::Error>;
}

enum Lifecycle<P: Program> {
    Idle(P),
    Running {
        handle: JoinHandle<()>,
        finished: Receiver<Result<(), P::Error>>,
    },
    Stopped,
}

/// Runs a [`Program`] in the background with a non-blocking `start` and a bounded `stop`.
pub struct ServiceLifecycle<P: Program> {
    name: String,
    stop_timeout: Duration,
    stop: StopSignal,
    lifecycle: Lifecycle<P>,
}

impl<P: Program> ServiceLifecycle<P> {
    pub fn new(name: &str, stop_timeout: Duration, program: P) -> Self {
        ServiceLifecycle {
            name: name.to_string(),
            stop_timeout,
            stop: StopSignal::new(),
            lifecycle: Lifecycle::Idle(program),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Running { .. })
    }

    /// Starts the program on a new thread and returns right away.
    pub fn start(&mut self) -> Result<(), ServiceError> {
        let program = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Idle(program) => program,
            other => {
                self.lifecycle = other;
                return Err(ServiceError::AlreadyStarted(self.name.clone()));
            }
        };

        let (finished_tx, finished_rx) = channel::bounded(1);
        let stop = self.stop.clone();
        let handle = thread::Builder::new().name(self.name.clone()).spawn(move || {
            let result = program.run_until_stopped(stop);
            let _ = finished_tx.send(result);
        })?;
        log::info!(target: "tempfilterd::service", "Service '{}' started", self.name);

        self.lifecycle = Lifecycle::Running {
            handle,
            finished: finished_rx,
        };
        Ok(())
    }

    /// Raises the stop signal and waits up to the stop timeout for the program to finish.
    ///
    /// The program's own failure is returned as [`ServiceError::Program`].
    pub fn stop(&mut self) -> Result<(), ServiceError> {
        let (handle, finished) = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { handle, finished } => (handle, finished),
            other => {
                self.lifecycle = other;
                return Err(ServiceError::NotRunning(self.name.clone()));
            }
        };

        log::info!(target: "tempfilterd::service", "Stopping service '{}'", self.name);
        self.stop.stop();
        match finished.recv_timeout(self.stop_timeout) {
            Ok(result) => self.finish(handle, result),
            Err(RecvTimeoutError::Timeout) => Err(ServiceError::StopTimeout {
                name: self.name.clone(),
                timeout: self.stop_timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(ServiceError::Panicked(self.name.clone()))
            }
        }
    }

    /// Blocks until `shutdown` delivers (or disconnects) and then stops the service, or
    /// until the program ends by itself.
    pub fn run_until(&mut self, shutdown: &Receiver<()>) -> Result<(), ServiceError> {
        let finished = match &self.lifecycle {
            Lifecycle::Running { finished, .. } => finished.clone(),
            _ => return Err(ServiceError::NotRunning(self.name.clone())),
        };

        crossbeam::select! {
            recv(shutdown) -> _ => self.stop(),
            recv(finished) -> result => {
                let handle = match std::mem::replace(&mut self.lifecycle, Lifecycle::Stopped) {
                    Lifecycle::Running { handle, .. } => handle,
                    _ => return Err(ServiceError::NotRunning(self.name.clone())),
                };
                match result {
                    Ok(result) => self.finish(handle, result),
                    Err(_) => {
                        let _ = handle.join();
                        Err(ServiceError::Panicked(self.name.clone()))
                    }
                }
            }
        }
    }

    fn finish(&self, handle: JoinHandle<()>, result: Result<(), P::Error>) -> Result<(), ServiceError> {
        if handle.join().is_err() {
            return Err(ServiceError::Panicked(self.name.clone()));
        }
        match result {
            Ok(()) => {
                log::info!(target: "tempfilterd::service", "Service '{}' stopped", self.name);
                Ok(())
            }
            Err(err) => Err(ServiceError::Program {
                name: self.name.clone(),
                source: Box::new(err),
            }),
        }
    }
}
