//! Extensible action pipelines for device operations.
//!
//! A pipeline is an ordered list of handlers. The optional terminal handler
//! performs the operation itself; pre-processing handlers run before it and
//! post-processing handlers after it. Any handler may stop the walk.

use log::{error, info};

use cardserver_protocol::{GroupKey, SignalInformation, SourceIdentifier};

use crate::device::{DeviceError, Hardware};

/// What to do after a handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineResult {
    Continue,
    Stop,
}

/// One step of an [`ActionPipeline`].
pub trait PipelineHandler<T>: Send {
    fn name(&self) -> &str;

    fn handle(&mut self, token: &mut T, hardware: &mut dyn Hardware) -> Result<PipelineResult, DeviceError>;

    /// Called once when the pipeline shuts down.
    fn terminate(&mut self) {}
}

/// Errors when building a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Pre-processing needs a terminal action to insert before.
    #[error("Pipeline {0} has no terminal action")]
    NoTerminalAction(String),
}

pub struct ActionPipeline<T> {
    name: String,
    handlers: Vec<Box<dyn PipelineHandler<T>>>,
    /// Index of the terminal handler, if any.
    terminal: Option<usize>,
}

impl<T> ActionPipeline<T> {
    pub fn new(name: impl Into<String>, terminal: Option<Box<dyn PipelineHandler<T>>>) -> Self {
        let (handlers, terminal) = match terminal {
            Some(handler) => (vec![handler], Some(0)),
            None => (Vec::new(), None),
        };

        Self {
            name: name.into(),
            handlers,
            terminal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a handler directly before the terminal action.
    pub fn add_pre_processing(&mut self, handler: Box<dyn PipelineHandler<T>>) -> Result<(), PipelineError> {
        let terminal = self
            .terminal
            .as_mut()
            .ok_or_else(|| PipelineError::NoTerminalAction(self.name.clone()))?;

        self.handlers.insert(*terminal, handler);
        *terminal += 1;
        Ok(())
    }

    /// Append a handler.
    pub fn add_post_processing(&mut self, handler: Box<dyn PipelineHandler<T>>) {
        self.handlers.push(handler);
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    fn step_name(&self, index: usize) -> String {
        match self.terminal {
            Some(terminal) if index < terminal => format!("prepare {}", index + 1),
            Some(terminal) if index == terminal => "main".to_string(),
            Some(terminal) => format!("finish {}", index - terminal),
            None => format!("finish {}", index + 1),
        }
    }

    /// Run all handlers in order.
    pub fn execute(&mut self, token: &mut T, hardware: &mut dyn Hardware) -> Result<(), DeviceError> {
        for index in 0..self.handlers.len() {
            match self.handlers[index].handle(token, hardware) {
                Ok(PipelineResult::Continue) => {}
                Ok(PipelineResult::Stop) => return Ok(()),
                Err(e) => {
                    let step = self.step_name(index);
                    error!(
                        "[Pipeline] {} failed at {} ({}): {}",
                        self.name,
                        step,
                        self.handlers[index].name(),
                        e
                    );
                    return Err(DeviceError::Pipeline {
                        pipeline: self.name.clone(),
                        step,
                        message: e.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Notify all handlers and drop the extensions.
    pub fn terminate(&mut self) {
        for handler in self.handlers.iter_mut() {
            handler.terminate();
        }

        match self.terminal {
            Some(terminal) => {
                let main = self.handlers.remove(terminal);
                self.handlers.clear();
                self.handlers.push(main);
                self.terminal = Some(0);
            }
            None => self.handlers.clear(),
        }
    }
}

/// Tune to a transponder or detach.
#[derive(Debug, Clone, PartialEq)]
pub struct TuneToken {
    pub group: Option<GroupKey>,
}

impl TuneToken {
    pub fn new(group: Option<GroupKey>) -> Self {
        Self { group }
    }
}

/// Decrypt a set of sources.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptToken {
    pub sources: Vec<SourceIdentifier>,
}

impl DecryptToken {
    pub fn new(sources: Vec<SourceIdentifier>) -> Self {
        Self { sources }
    }
}

/// Collect signal information.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalToken {
    pub information: SignalInformation,
}

impl SignalToken {
    pub fn new(information: SignalInformation) -> Self {
        Self { information }
    }
}

struct TuneAction;

impl PipelineHandler<TuneToken> for TuneAction {
    fn name(&self) -> &str {
        "tune"
    }

    fn handle(&mut self, token: &mut TuneToken, hardware: &mut dyn Hardware) -> Result<PipelineResult, DeviceError> {
        hardware.tune(token.group.as_ref())?;
        Ok(PipelineResult::Continue)
    }
}

/// The pipelines of one device.
pub struct DevicePipelines {
    pub tune: ActionPipeline<TuneToken>,
    pub decrypt: ActionPipeline<DecryptToken>,
    pub signal: ActionPipeline<SignalToken>,
}

impl DevicePipelines {
    pub fn new() -> Self {
        Self {
            tune: ActionPipeline::new("Tune", Some(Box::new(TuneAction))),
            decrypt: ActionPipeline::new("Decrypt", None),
            signal: ActionPipeline::new("Signal", None),
        }
    }

    pub fn terminate(&mut self) {
        self.tune.terminate();
        self.decrypt.terminate();
        self.signal.terminate();
    }
}

impl Default for DevicePipelines {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs handlers into the pipelines of a device.
pub trait PipelineExtension: Send + Sync {
    fn name(&self) -> &str;

    fn install(&self, pipelines: &mut DevicePipelines) -> Result<(), PipelineError>;
}

/// Decrypts through the hardware's own descrambler.
pub struct HardwareDecryption;

impl HardwareDecryption {
    pub const NAME: &'static str = "hardware-decryption";
}

struct HardwareDecryptAction;

impl PipelineHandler<DecryptToken> for HardwareDecryptAction {
    fn name(&self) -> &str {
        HardwareDecryption::NAME
    }

    fn handle(&mut self, token: &mut DecryptToken, hardware: &mut dyn Hardware) -> Result<PipelineResult, DeviceError> {
        hardware.decrypt_sources(&token.sources)?;
        Ok(PipelineResult::Continue)
    }
}

impl PipelineExtension for HardwareDecryption {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn install(&self, pipelines: &mut DevicePipelines) -> Result<(), PipelineError> {
        info!("[Pipeline] Installing {}", Self::NAME);
        pipelines.decrypt.add_post_processing(Box::new(HardwareDecryptAction));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimulatedHardware;
    use std::sync::{Arc, Mutex};

    struct Recorder {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        result: PipelineResult,
        fail: bool,
    }

    impl Recorder {
        fn boxed(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Box<Self> {
            Box::new(Self {
                name: name.to_string(),
                log: log.clone(),
                result: PipelineResult::Continue,
                fail: false,
            })
        }
    }

    impl PipelineHandler<TuneToken> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn handle(&mut self, _token: &mut TuneToken, _hardware: &mut dyn Hardware) -> Result<PipelineResult, DeviceError> {
            self.log.lock().unwrap().push(self.name.clone());
            if self.fail {
                return Err(DeviceError::Stream("boom".into()));
            }
            Ok(self.result)
        }

        fn terminate(&mut self) {
            self.log.lock().unwrap().push(format!("terminate {}", self.name));
        }
    }

    #[test]
    fn test_handler_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ActionPipeline::new("Tune", Some(Recorder::boxed("main", &log) as Box<dyn PipelineHandler<TuneToken>>));
        pipeline.add_pre_processing(Recorder::boxed("pre1", &log)).unwrap();
        pipeline.add_pre_processing(Recorder::boxed("pre2", &log)).unwrap();
        pipeline.add_post_processing(Recorder::boxed("post1", &log));

        let mut hardware = SimulatedHardware::standalone();
        pipeline.execute(&mut TuneToken::new(None), &mut hardware).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["pre1", "pre2", "main", "post1"]);
    }

    #[test]
    fn test_stop_ends_walk() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ActionPipeline::new("Tune", Some(Recorder::boxed("main", &log) as Box<dyn PipelineHandler<TuneToken>>));
        let mut stopper = Recorder::boxed("pre", &log);
        stopper.result = PipelineResult::Stop;
        pipeline.add_pre_processing(stopper).unwrap();

        let mut hardware = SimulatedHardware::standalone();
        pipeline.execute(&mut TuneToken::new(None), &mut hardware).unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["pre"]);
    }

    #[test]
    fn test_failure_names_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ActionPipeline::new("Tune", Some(Recorder::boxed("main", &log) as Box<dyn PipelineHandler<TuneToken>>));
        let mut failing = Recorder::boxed("post", &log);
        failing.fail = true;
        pipeline.add_post_processing(failing);

        let mut hardware = SimulatedHardware::standalone();
        let err = pipeline.execute(&mut TuneToken::new(None), &mut hardware).unwrap_err();
        match err {
            DeviceError::Pipeline { pipeline, step, .. } => {
                assert_eq!(pipeline, "Tune");
                assert_eq!(step, "finish 1");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_pre_processing_needs_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline: ActionPipeline<TuneToken> = ActionPipeline::new("Decrypt", None);
        assert!(pipeline.is_empty());
        assert!(matches!(
            pipeline.add_pre_processing(Recorder::boxed("pre", &log)),
            Err(PipelineError::NoTerminalAction(_))
        ));
        pipeline.add_post_processing(Recorder::boxed("post", &log));
        assert!(!pipeline.is_empty());
    }

    #[test]
    fn test_terminate_keeps_terminal_action() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = ActionPipeline::new("Tune", Some(Recorder::boxed("main", &log) as Box<dyn PipelineHandler<TuneToken>>));
        pipeline.add_pre_processing(Recorder::boxed("pre", &log)).unwrap();
        pipeline.terminate();

        assert_eq!(*log.lock().unwrap(), vec!["terminate pre", "terminate main"]);
        assert_eq!(pipeline.len(), 1);
        pipeline.add_pre_processing(Recorder::boxed("again", &log)).unwrap();
    }
}
