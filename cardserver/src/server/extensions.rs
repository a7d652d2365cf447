//! Custom actions and loadable extensions.
//!
//! Extensions reach the worker as [`ExtensionPayload`]s and are turned into
//! actions, pipeline extensions and idle hooks by a factory registered under
//! the payload's `factory` key. The registry lives on the worker thread and
//! is only mutated there.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;

use cardserver_protocol::{CardServerFault, ExtensionPayload, FaultKind, StreamInformation};

use crate::device::{Device, Profile};
use crate::pipeline::{DevicePipelines, HardwareDecryption, PipelineExtension};

/// What a custom action or idle hook may touch.
pub struct ActionContext<'a> {
    pub device: &'a mut Device,
    pub profile: &'a Profile,
    pub streams: Vec<StreamInformation>,
}

/// A named operation executed on the worker thread.
pub trait CustomAction: Send + Sync {
    fn execute(&self, ctx: &mut ActionContext<'_>, input: Value) -> Result<Value, CardServerFault>;
}

/// Runs at the end of every watchdog cycle.
pub trait IdleHook: Send {
    fn name(&self) -> &str;

    fn on_idle(&mut self, ctx: &mut ActionContext<'_>);
}

/// Everything contributed by one extension payload.
#[derive(Default)]
pub struct LoadedExtension {
    pub actions: Vec<(String, Arc<dyn CustomAction>)>,
    pub pipeline_extensions: Vec<Arc<dyn PipelineExtension>>,
    pub idle_hooks: Vec<Box<dyn IdleHook>>,
}

/// Turns payloads into extensions.
pub trait ExtensionFactory: Send + Sync {
    fn load(&self, payload: &ExtensionPayload, registry: &ExtensionRegistry) -> Result<LoadedExtension, CardServerFault>;
}

/// Built-in action reporting the result of the signal pipeline.
pub struct SignalInformationAction;

impl SignalInformationAction {
    pub const NAME: &'static str = "signal-information";
}

impl CustomAction for SignalInformationAction {
    fn execute(&self, ctx: &mut ActionContext<'_>, _input: Value) -> Result<Value, CardServerFault> {
        let signal = ctx.device.signal()?;
        serde_json::to_value(signal).map_err(|e| CardServerFault::protocol(e.to_string()))
    }
}

/// Built-in factory registering alternative names for known actions.
///
/// The payload is a JSON object mapping each new name to an existing action.
pub struct AliasFactory;

impl AliasFactory {
    pub const NAME: &'static str = "aliases";
}

impl ExtensionFactory for AliasFactory {
    fn load(&self, payload: &ExtensionPayload, registry: &ExtensionRegistry) -> Result<LoadedExtension, CardServerFault> {
        let aliases: HashMap<String, String> = serde_json::from_slice(&payload.data)
            .map_err(|e| CardServerFault::validation(format!("invalid alias table in {}: {}", payload.identity, e)))?;

        let mut loaded = LoadedExtension::default();
        for (alias, target) in aliases {
            let action = registry.action(&target)?;
            loaded.actions.push((alias, action));
        }
        Ok(loaded)
    }
}

pub struct ExtensionRegistry {
    actions: HashMap<String, Arc<dyn CustomAction>>,
    factories: HashMap<String, Arc<dyn ExtensionFactory>>,
    pipeline_extensions: HashMap<String, Arc<dyn PipelineExtension>>,
    idle_hooks: Vec<Box<dyn IdleHook>>,
    /// Lower-cased identities of loaded payloads.
    loaded: HashSet<String>,
}

impl ExtensionRegistry {
    /// Registry with the built-in action, factory and pipeline extension.
    pub fn new() -> Self {
        let mut registry = Self {
            actions: HashMap::new(),
            factories: HashMap::new(),
            pipeline_extensions: HashMap::new(),
            idle_hooks: Vec::new(),
            loaded: HashSet::new(),
        };
        registry.register_action(SignalInformationAction::NAME, Arc::new(SignalInformationAction));
        registry.register_factory(AliasFactory::NAME, Arc::new(AliasFactory));
        registry.register_pipeline_extension(Arc::new(HardwareDecryption));
        registry
    }

    pub fn register_action(&mut self, name: impl Into<String>, action: Arc<dyn CustomAction>) {
        self.actions.insert(name.into(), action);
    }

    pub fn register_factory(&mut self, name: impl Into<String>, factory: Arc<dyn ExtensionFactory>) {
        self.factories.insert(name.into(), factory);
    }

    pub fn register_pipeline_extension(&mut self, extension: Arc<dyn PipelineExtension>) {
        self.pipeline_extensions.insert(extension.name().to_string(), extension);
    }

    pub fn register_idle_hook(&mut self, hook: Box<dyn IdleHook>) {
        self.idle_hooks.push(hook);
    }

    pub fn action(&self, name: &str) -> Result<Arc<dyn CustomAction>, CardServerFault> {
        self.actions
            .get(name)
            .cloned()
            .ok_or_else(|| CardServerFault::new(FaultKind::NoSuchAction, format!("no custom action {}", name)))
    }

    pub fn is_loaded(&self, identity: &str) -> bool {
        self.loaded.contains(&identity.to_lowercase())
    }

    /// Load a payload; a payload already loaded under the same identity is ignored.
    pub fn load(&mut self, payload: &ExtensionPayload) -> Result<(), CardServerFault> {
        payload.validate()?;
        if self.is_loaded(&payload.identity) {
            return Ok(());
        }

        let factory = self.factories.get(&payload.factory).cloned().ok_or_else(|| {
            CardServerFault::new(
                FaultKind::NoSuchExtension,
                format!("no extension factory {} for {}", payload.factory, payload.identity),
            )
        })?;

        let loaded = factory.load(payload, self)?;
        info!(
            "[Extensions] Loaded {} via {}: {} actions, {} pipeline extensions, {} idle hooks",
            payload.identity,
            payload.factory,
            loaded.actions.len(),
            loaded.pipeline_extensions.len(),
            loaded.idle_hooks.len()
        );

        for (name, action) in loaded.actions {
            self.register_action(name, action);
        }
        for extension in loaded.pipeline_extensions {
            self.register_pipeline_extension(extension);
        }
        self.idle_hooks.extend(loaded.idle_hooks);
        self.loaded.insert(payload.identity.to_lowercase());
        Ok(())
    }

    /// Install the named pipeline extensions; returns the names actually installed.
    pub fn install_pipeline_extensions<'a>(
        &self,
        names: impl IntoIterator<Item = &'a str>,
        pipelines: &mut DevicePipelines,
    ) -> Vec<String> {
        let mut installed = Vec::new();
        for name in names {
            match self.pipeline_extensions.get(name) {
                Some(extension) => match extension.install(pipelines) {
                    Ok(()) => installed.push(name.to_string()),
                    Err(e) => warn!("[Extensions] Failed to install pipeline extension {}: {}", name, e),
                },
                None => warn!("[Extensions] Unknown pipeline extension {}", name),
            }
        }
        installed
    }

    pub fn run_idle_hooks(&mut self, ctx: &mut ActionContext<'_>) {
        for hook in self.idle_hooks.iter_mut() {
            hook.on_idle(ctx);
        }
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
