//! Card server running the device in the current process.
//!
//! Attaching a profile starts two threads: the worker, which owns the
//! device and runs every request and watchdog cycle, and an idle ticker
//! that only wakes the worker periodically.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use cardserver_protocol::{CardServerFault, FaultKind, Request, ResponseData};

use crate::config::Config;
use crate::device::{DeviceEnvironment, StreamSelectionOptimizer};

use super::extensions::ExtensionRegistry;
use super::implementation::{Completion, ServerBackend, ServerImplementation};
use super::session::{open_device, AttachOptions, Execution, WorkerSession};

type Command = (Request, Completion);

/// Channels and threads of an attached profile.
struct Worker {
    commands: SyncSender<Command>,
    trigger: Sender<()>,
    running: Arc<AtomicBool>,
    ticker_stop: Sender<()>,
    ticker: Option<JoinHandle<()>>,
    thread: Option<JoinHandle<ExtensionRegistry>>,
}

impl Worker {
    /// Stop both threads and recover the extension registry.
    fn stop(mut self) -> ExtensionRegistry {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.ticker_stop.send(());
        let _ = self.trigger.send(());

        if let Some(ticker) = self.ticker.take() {
            if ticker.join().is_err() {
                error!("[CardServer] Idle ticker panicked");
            }
        }

        match self.thread.take().map(JoinHandle::join) {
            Some(Ok(registry)) => registry,
            Some(Err(_)) => {
                error!("[CardServer] Worker thread panicked");
                ExtensionRegistry::new()
            }
            None => ExtensionRegistry::new(),
        }
    }
}

/// In-process backend of a [`ServerImplementation`].
pub struct InMemoryCardServer {
    environment: DeviceEnvironment,
    config: Config,
    registry: Option<ExtensionRegistry>,
    optimizer: Option<Arc<dyn StreamSelectionOptimizer>>,
    worker: Option<Worker>,
}

impl InMemoryCardServer {
    pub fn new(environment: DeviceEnvironment, config: Config) -> Self {
        Self {
            environment,
            config,
            registry: Some(ExtensionRegistry::new()),
            optimizer: None,
            worker: None,
        }
    }

    /// Use a registry with additional actions or factories.
    pub fn with_registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replace the consumer-limit optimizer of the device.
    pub fn with_optimizer(mut self, optimizer: Arc<dyn StreamSelectionOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn into_server(self) -> ServerImplementation {
        ServerImplementation::new(Box::new(self))
    }

    /// Shortcut for a server with default extensions.
    pub fn create(environment: DeviceEnvironment, config: Config) -> ServerImplementation {
        Self::new(environment, config).into_server()
    }

    fn attach(&mut self, attach: AttachOptions, completion: Completion) {
        // only a worker whose attach failed can still be around here
        let registry = match self.worker.take() {
            Some(worker) => worker.stop(),
            None => self.registry.take().unwrap_or_default(),
        };

        let (commands_tx, commands_rx) = mpsc::sync_channel::<Command>(1);
        let (trigger_tx, trigger_rx) = mpsc::channel();
        let (ticker_stop_tx, ticker_stop_rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));

        let context = WorkerContext {
            attach,
            environment: self.environment.clone(),
            config: self.config.clone(),
            registry,
            optimizer: self.optimizer.clone(),
            commands: commands_rx,
            trigger: trigger_rx,
            running: running.clone(),
        };

        let thread = thread::Builder::new()
            .name("cardserver-worker".into())
            .spawn(move || context.run(completion));
        let thread = match thread {
            Ok(thread) => thread,
            Err(e) => {
                // the completion went down with the closure and reported Abandoned
                error!("[CardServer] Failed to start worker thread: {}", e);
                self.registry = Some(ExtensionRegistry::new());
                return;
            }
        };

        let idle_interval = self.config.worker.idle_interval;
        let ticker_trigger = trigger_tx.clone();
        let ticker = thread::Builder::new()
            .name("cardserver-idle".into())
            .spawn(move || idle_ticker(idle_interval, ticker_trigger, ticker_stop_rx));
        let ticker = match ticker {
            Ok(ticker) => Some(ticker),
            Err(e) => {
                warn!("[CardServer] Failed to start idle ticker, watchdog runs on requests only: {}", e);
                None
            }
        };

        self.worker = Some(Worker {
            commands: commands_tx,
            trigger: trigger_tx,
            running,
            ticker_stop: ticker_stop_tx,
            ticker,
            thread: Some(thread),
        });
    }

    fn forward(&mut self, request: Request, completion: Completion) {
        let Some(worker) = self.worker.as_ref() else {
            completion.complete(Err(CardServerFault::new(
                FaultKind::ProfileNotAttached,
                "no profile attached",
            )));
            return;
        };

        match worker.commands.try_send((request, completion)) {
            Ok(()) => {
                let _ = worker.trigger.send(());
            }
            Err(TrySendError::Full((_, completion))) => completion.complete(Err(CardServerFault::busy())),
            Err(TrySendError::Disconnected((_, completion))) => {
                completion.complete(Err(CardServerFault::device("the worker has stopped")))
            }
        }
    }
}

impl ServerBackend for InMemoryCardServer {
    fn submit(&mut self, request: Request, completion: Completion) {
        match request {
            Request::AttachProfile {
                profile,
                reset,
                disable_pcr_from_h264,
                disable_pcr_from_mpeg2,
            } => self.attach(
                AttachOptions {
                    profile,
                    reset,
                    disable_pcr_from_h264,
                    disable_pcr_from_mpeg2,
                },
                completion,
            ),
            other => self.forward(other, completion),
        }
    }

    fn shutdown(&mut self) {
        if let Some(worker) = self.worker.take() {
            info!("[CardServer] Shutting down");
            self.registry = Some(worker.stop());
        }
    }
}

impl Drop for InMemoryCardServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Wakes the worker every `interval` until stopped.
fn idle_ticker(interval: Duration, trigger: Sender<()>, stop: Receiver<()>) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                if trigger.send(()).is_err() {
                    break;
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("[CardServer] Idle ticker stopped");
}

/// Everything the worker thread takes with it.
struct WorkerContext {
    attach: AttachOptions,
    environment: DeviceEnvironment,
    config: Config,
    registry: ExtensionRegistry,
    optimizer: Option<Arc<dyn StreamSelectionOptimizer>>,
    commands: Receiver<Command>,
    trigger: Receiver<()>,
    running: Arc<AtomicBool>,
}

fn panic_fault(what: &str) -> CardServerFault {
    CardServerFault::device(format!("{} panicked on the worker", what))
}

impl WorkerContext {
    fn run(self, attached: Completion) -> ExtensionRegistry {
        let Self {
            attach,
            environment,
            config,
            registry,
            optimizer,
            commands,
            trigger,
            running,
        } = self;

        let throttle = config.worker.watchdog_throttle;
        let (device, profile) = match open_device(&attach, &environment) {
            Ok(opened) => opened,
            Err(fault) => {
                error!("[CardServer] Failed to attach {}: {}", attach.profile, fault);
                running.store(false, Ordering::SeqCst);
                attached.complete(Err(fault));
                return registry;
            }
        };

        let mut session = WorkerSession::new(device, profile, environment, config, registry, optimizer);
        attached.complete(Ok(ResponseData::None));

        let mut delayed: Option<Completion> = None;
        let mut last_idle = Instant::now();

        while running.load(Ordering::SeqCst) {
            if trigger.recv().is_err() {
                break;
            }
            while trigger.try_recv().is_ok() {}
            if !running.load(Ordering::SeqCst) {
                break;
            }

            if let Ok((request, completion)) = commands.try_recv() {
                let name = request.name();
                match catch_unwind(AssertUnwindSafe(|| session.execute(request))) {
                    Ok(Ok(Execution::Complete(data))) => completion.complete(Ok(data)),
                    Ok(Ok(Execution::Delayed)) => delayed = Some(completion),
                    Ok(Err(fault)) => {
                        debug!("[CardServer] {} failed: {}", name, fault);
                        completion.complete(Err(fault));
                    }
                    Err(_) => {
                        error!("[CardServer] {} panicked", name);
                        completion.complete(Err(panic_fault(name)));
                    }
                }
            }

            if last_idle.elapsed() >= throttle {
                last_idle = Instant::now();
                if catch_unwind(AssertUnwindSafe(|| session.on_idle())).is_err() {
                    error!("[CardServer] Watchdog cycle panicked");
                }
            }

            if delayed.is_some() {
                if let Some(outcome) = session.take_finished_scan() {
                    if let Some(completion) = delayed.take() {
                        completion.complete(outcome);
                    }
                }
            }
        }

        session.close();
        if let Some(completion) = delayed.take() {
            completion.complete(Err(CardServerFault::new(
                FaultKind::Abandoned,
                "server shut down before the request finished",
            )));
        }
        session.into_registry()
    }
}
