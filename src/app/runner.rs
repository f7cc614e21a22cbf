//! Loop runner: the single control thread.
//!
//! The runner owns the [`LoopService`], the [`LoopScheduler`] and the
//! command channel.  It blocks on `recv_timeout` until either a command
//! arrives or the next cycle is due, so there is exactly one timer and
//! exactly one thread that ever runs a cycle.  Commands queued while a
//! cycle runs are drained afterwards; any number of `TriggerCycle`s among
//! them collapse into one follow-up cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;

use log::{info, warn};

use crate::config::LoopConfig;
use crate::profile::ProfileSpec;
use crate::scheduler::LoopScheduler;

use super::commands::LoopCommand;
use super::events::LoopResult;
use super::ports::EventSink;
use super::service::LoopService;

/// Cancels a cycle that has not yet reached pump I/O.  Once a command has
/// been sent the cycle runs to its end regardless.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Cloneable handle for talking to a running loop.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    tx: Sender<LoopCommand>,
    cancel: CancelToken,
}

impl LoopHandle {
    /// Returns `false` once the runner has stopped.
    pub fn send(&self, cmd: LoopCommand) -> bool {
        self.tx.send(cmd).is_ok()
    }

    pub fn trigger(&self) -> bool {
        self.send(LoopCommand::TriggerCycle)
    }

    pub fn update_config(&self, config: LoopConfig) -> bool {
        self.send(LoopCommand::UpdateConfig(Box::new(config)))
    }

    pub fn set_profile(&self, spec: ProfileSpec) -> bool {
        self.send(LoopCommand::SetProfile(Box::new(spec)))
    }

    pub fn set_enabled(&self, enabled: bool) -> bool {
        self.send(LoopCommand::SetLoopEnabled(enabled))
    }

    pub fn shutdown(&self) -> bool {
        self.send(LoopCommand::Shutdown)
    }

    /// Cancel the current cycle, or the next one if none is running,
    /// provided it has not started pump I/O.
    pub fn cancel_cycle(&self) {
        self.cancel.cancel();
    }
}

pub struct LoopRunner<S: EventSink> {
    service: LoopService,
    scheduler: LoopScheduler,
    sink: S,
    rx: Receiver<LoopCommand>,
    cancel: CancelToken,
    stopping: bool,
}

impl<S: EventSink> LoopRunner<S> {
    pub fn new(mut service: LoopService, mut sink: S) -> (Self, LoopHandle) {
        let (tx, rx) = mpsc::channel();
        let cancel = CancelToken::new();
        let scheduler = LoopScheduler::from_config(&service.config().snapshot());
        service.start(&mut sink);
        let runner = Self { service, scheduler, sink, rx, cancel: cancel.clone(), stopping: false };
        (runner, LoopHandle { tx, cancel })
    }

    pub fn service(&self) -> &LoopService {
        &self.service
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn scheduler(&self) -> &LoopScheduler {
        &self.scheduler
    }

    /// Drain queued commands, then run a cycle if one is due at the
    /// service clock's `now`.  Never blocks; suited to simulation with a
    /// manual clock.
    pub fn step(&mut self) -> Option<LoopResult> {
        while let Ok(cmd) = self.rx.try_recv() {
            self.apply(cmd);
        }
        let now = self.service.clock().now();
        self.scheduler.fire(now)?;
        Some(self.cycle())
    }

    /// Block and run until `Shutdown` or until every handle is dropped.
    /// Returns the service so the caller can inspect it.
    pub fn run(mut self) -> LoopService {
        info!("runner: started");
        while !self.stopping {
            let now = self.service.clock().now();
            if self.scheduler.fire(now).is_some() {
                self.cycle();
                while let Ok(cmd) = self.rx.try_recv() {
                    self.apply(cmd);
                }
                continue;
            }
            match self.rx.recv_timeout(self.scheduler.until_next(now)) {
                Ok(cmd) => self.apply(cmd),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    warn!("runner: all handles dropped, stopping");
                    break;
                }
            }
        }
        info!("runner: stopped");
        self.service
    }

    /// Run the loop on its own thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<LoopService>>
    where
        S: Send + 'static,
    {
        std::thread::Builder::new().name("aidloop".into()).spawn(move || self.run())
    }

    fn cycle(&mut self) -> LoopResult {
        let result = self.service.run_cycle(&self.cancel, &mut self.sink);
        let finished = self.service.clock().now();
        self.scheduler.record(finished, result.outcome.is_failed());
        result
    }

    fn apply(&mut self, cmd: LoopCommand) {
        match cmd {
            LoopCommand::TriggerCycle => self.scheduler.request(),
            LoopCommand::Shutdown => self.stopping = true,
            LoopCommand::UpdateConfig(config) => {
                self.service.handle_command(LoopCommand::UpdateConfig(config), &mut self.sink);
                self.scheduler.update_periods(&self.service.config().snapshot());
            }
            other => self.service.handle_command(other, &mut self.sink),
        }
    }
}
