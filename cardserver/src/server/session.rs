//! State owned by the worker thread of an in-memory card server.
//!
//! Only the worker ever touches a [`WorkerSession`]; every request and every
//! watchdog cycle runs here sequentially.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;
use uuid::Uuid;

use cardserver_protocol::{
    CardServerFault, EpgExtensions, ExtensionPayload, FaultKind, GroupKey, ProgramGuideItem, ReceiveInformation,
    Request, ResponseData, ServerInformation, SourceIdentifier, SourceSelection, StreamInformation, StreamSelection,
};

use crate::config::{Config, GroupRestartReset, WorkerConfig};
use crate::device::{
    CappedOptimizer, Device, DeviceEnvironment, Profile, SelectionRequest, ServiceParser, StreamSelectionOptimizer,
};

use super::active_stream::{ActiveStream, StreamKey};
use super::extensions::{ActionContext, ExtensionRegistry};
use super::guide::{guide_active, guide_not_active, GuideCollector};
use super::scan::{scan_active, scan_not_active, ScanState, SCAN_COMPLETE};
use super::Outcome;

/// Profile parameter overriding the group watchdog interval.
pub const STREAM_WATCHDOG_PARAMETER: &str = "CardServer.StreamWatchDogSeconds";
/// Profile parameter overriding the decryption watchdog interval.
pub const DECRYPTION_WATCHDOG_PARAMETER: &str = "CardServer.DecryptionWatchDogSeconds";
/// Profile parameter overriding the source retest interval.
pub const SOURCE_WATCHDOG_PARAMETER: &str = "CardServer.SourceWatchDogSeconds";

/// How a request finished on the worker.
#[derive(Debug)]
pub enum Execution {
    Complete(ResponseData),
    /// The result is reported later from the watchdog cycle.
    Delayed,
}

/// Parameters of a profile attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOptions {
    pub profile: String,
    pub reset: bool,
    pub disable_pcr_from_h264: bool,
    pub disable_pcr_from_mpeg2: bool,
}

fn read_seconds(profile: &Profile, name: &str) -> Option<u64> {
    let value = profile.parameter(name)?;
    match value.trim().parse::<u32>() {
        Ok(seconds) => Some(seconds as u64),
        Err(_) => {
            warn!("[Session] Ignoring invalid {} {:?} in profile {}", name, value, profile.name);
            None
        }
    }
}

/// Apply the watchdog overrides of a profile.
///
/// Zero disables the group and decryption watchdogs; for the source retest
/// interval zero keeps the configured value.
pub fn apply_watchdog_overrides(config: &mut WorkerConfig, profile: &Profile) {
    if let Some(seconds) = read_seconds(profile, STREAM_WATCHDOG_PARAMETER) {
        config.group_watchdog = (seconds > 0).then(|| Duration::from_secs(seconds));
    }
    if let Some(seconds) = read_seconds(profile, DECRYPTION_WATCHDOG_PARAMETER) {
        config.decryption_watchdog = (seconds > 0).then(|| Duration::from_secs(seconds));
    }
    if let Some(seconds) = read_seconds(profile, SOURCE_WATCHDOG_PARAMETER) {
        if seconds > 0 {
            config.retest_watchdog = Duration::from_secs(seconds);
        }
    }
}

/// Resolve the profile and open its hardware.
pub fn open_device(
    attach: &AttachOptions,
    environment: &DeviceEnvironment,
) -> Result<(Device, Profile), CardServerFault> {
    let profile = environment.profiles.find_profile(&attach.profile).ok_or_else(|| {
        CardServerFault::new(FaultKind::ProfileNotFound, format!("profile {} not found", attach.profile))
    })?;

    let mut hardware = environment.profiles.open_hardware(&profile)?;
    hardware.disable_pcr_generation(attach.disable_pcr_from_h264, attach.disable_pcr_from_mpeg2);
    if attach.reset {
        info!("[Session] Resetting wakeup device for {}", profile.name);
        if let Err(e) = hardware.reset_wakeup_device() {
            warn!("[Session] Failed to reset wakeup device: {}", e);
        }
    }

    Ok((Device::new(hardware), profile))
}

pub struct WorkerSession {
    device: Device,
    profile: Profile,
    environment: DeviceEnvironment,
    config: Config,
    registry: ExtensionRegistry,
    optimizer: Arc<dyn StreamSelectionOptimizer>,
    installed_extensions: HashSet<String>,
    streams: BTreeMap<StreamKey, ActiveStream>,
    service_parser: Option<Box<dyn ServiceParser>>,
    group_restarts: u32,
    last_group_information: Instant,
    guide: Option<GuideCollector>,
    scan: Option<ScanState>,
}

impl WorkerSession {
    /// Wrap an opened device.
    ///
    /// Without an explicit optimizer the device's consumer limit is honoured.
    pub fn new(
        device: Device,
        profile: Profile,
        environment: DeviceEnvironment,
        mut config: Config,
        registry: ExtensionRegistry,
        optimizer: Option<Arc<dyn StreamSelectionOptimizer>>,
    ) -> Self {
        apply_watchdog_overrides(&mut config.worker, &profile);
        let optimizer = optimizer
            .unwrap_or_else(|| Arc::new(CappedOptimizer::new(device.hardware().consumer_limit())));

        let mut session = Self {
            device,
            profile,
            environment,
            config,
            registry,
            optimizer,
            installed_extensions: HashSet::new(),
            streams: BTreeMap::new(),
            service_parser: None,
            group_restarts: 0,
            last_group_information: Instant::now(),
            guide: None,
            scan: None,
        };
        session.install_pipeline_extensions();
        info!(
            "[Session] Attached to {} (group watchdog {:?}, decryption watchdog {:?}, retest {:?})",
            session.profile.name,
            session.config.worker.group_watchdog,
            session.config.worker.decryption_watchdog,
            session.config.worker.retest_watchdog
        );
        session
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn worker_config(&self) -> &WorkerConfig {
        &self.config.worker
    }

    pub fn group_restarts(&self) -> u32 {
        self.group_restarts
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    fn install_pipeline_extensions(&mut self) {
        let names: Vec<&str> = self
            .profile
            .pipeline_extensions
            .iter()
            .map(String::as_str)
            .filter(|name| !self.installed_extensions.contains(*name))
            .collect();
        if names.is_empty() {
            return;
        }

        let installed = self
            .registry
            .install_pipeline_extensions(names, self.device.pipelines_mut());
        self.installed_extensions.extend(installed);
    }

    /// Run one request.
    pub fn execute(&mut self, request: Request) -> Result<Execution, CardServerFault> {
        debug!("[Session] Executing {}", request.name());

        let execution = match request {
            Request::AttachProfile { profile, .. } => {
                return Err(CardServerFault::new(
                    FaultKind::ProfileAlreadyAttached,
                    format!("profile {} is already attached, requested {}", self.profile.name, profile),
                ))
            }
            Request::Select { selection_key } => {
                self.select(&selection_key)?;
                Execution::Complete(ResponseData::None)
            }
            Request::AddSources { sources } => Execution::Complete(ResponseData::Streams(self.add_sources(sources)?)),
            Request::RemoveSource {
                source,
                unique_identifier,
            } => {
                self.remove_source(source, unique_identifier)?;
                Execution::Complete(ResponseData::None)
            }
            Request::RemoveAllSources => {
                self.check_conflicts()?;
                self.remove_all();
                Execution::Complete(ResponseData::None)
            }
            Request::SetStreamTarget {
                source,
                unique_identifier,
                target,
            } => {
                self.set_stream_target(source, unique_identifier, target.as_deref())?;
                Execution::Complete(ResponseData::None)
            }
            Request::SetZappingSource { selection_key, target } => {
                Execution::Complete(ResponseData::State(self.set_zapping_source(&selection_key, &target)?))
            }
            Request::GetState => {
                if let Some(scan) = self.scan.as_mut() {
                    scan.update();
                }
                Execution::Complete(ResponseData::State(self.create_state()))
            }
            Request::StartScan => {
                self.start_scan()?;
                Execution::Complete(ResponseData::None)
            }
            Request::EndScan { update_profile } => {
                self.end_scan(update_profile)?;
                Execution::Delayed
            }
            Request::StartEpgCollection { sources, extensions } => {
                self.start_guide_collection(&sources, extensions)?;
                Execution::Complete(ResponseData::None)
            }
            Request::EndEpgCollection => {
                Execution::Complete(ResponseData::Guide(self.end_guide_collection()?))
            }
            Request::CustomAction { action, input } => {
                Execution::Complete(ResponseData::Custom(self.custom_action(&action, input)?))
            }
            Request::LoadExtensions { payload } => {
                self.load_extensions(&payload)?;
                Execution::Complete(ResponseData::None)
            }
        };

        self.update_service_parser();
        self.update_decryption();
        Ok(execution)
    }

    fn check_conflicts(&self) -> Result<(), CardServerFault> {
        if self.guide.is_some() {
            return Err(guide_active());
        }
        if self.scan.is_some() {
            return Err(scan_active());
        }
        Ok(())
    }

    fn select(&mut self, selection_key: &str) -> Result<(), CardServerFault> {
        let selection = SourceSelection::parse(selection_key)?;
        self.check_conflicts()?;
        self.select_group(Some(&selection.group_key()))
    }

    /// Drop all streams and tune.
    fn select_group(&mut self, group: Option<&GroupKey>) -> Result<(), CardServerFault> {
        self.remove_all();
        self.device.select_group(group)?;
        self.last_group_information = Instant::now();
        self.group_restarts = 0;
        Ok(())
    }

    fn remove_all(&mut self) {
        for (_, mut stream) in std::mem::take(&mut self.streams) {
            stream.dispose();
        }
        self.disable_service_parser();
    }

    fn remove_source(&mut self, source: SourceIdentifier, unique_identifier: Uuid) -> Result<(), CardServerFault> {
        let key = StreamKey::new(unique_identifier, source);
        let mut stream = self.streams.remove(&key).ok_or_else(|| no_such_source(source))?;
        stream.dispose();
        info!("[Session] Removed {} ({})", source, unique_identifier);
        Ok(())
    }

    fn set_stream_target(
        &mut self,
        source: SourceIdentifier,
        unique_identifier: Uuid,
        target: Option<&str>,
    ) -> Result<(), CardServerFault> {
        let manager = self
            .streams
            .get_mut(&StreamKey::new(unique_identifier, source))
            .and_then(ActiveStream::manager_mut)
            .ok_or_else(|| no_such_source(source))?;
        manager.set_streaming_target(target)?;
        Ok(())
    }

    fn add_sources(&mut self, sources: Vec<ReceiveInformation>) -> Result<Vec<StreamInformation>, CardServerFault> {
        self.check_conflicts()?;
        self.device.hardware_mut().reset_information_readers();

        let mut requests = Vec::with_capacity(sources.len());
        let mut keys = BTreeSet::new();
        for information in &sources {
            let selection = SourceSelection::parse(&information.selection_key)?;
            let source = selection.source.ok_or_else(|| {
                CardServerFault::validation(format!("{} does not address a source", information.selection_key))
            })?;

            let key = StreamKey::new(information.unique_identifier, source);
            if self.streams.contains_key(&key) || !keys.insert(key) {
                return Err(CardServerFault::new(
                    FaultKind::SourceInUse,
                    format!("{} is already received for {}", source, information.unique_identifier),
                ));
            }

            requests.push(SelectionRequest {
                selection,
                streams: information.streams.clone(),
            });
        }

        let allowed = self.optimizer.optimize(&requests);
        if allowed.len() < requests.len() {
            warn!(
                "[Session] Only {} of {} sources can be received",
                allowed.len(),
                requests.len()
            );
        }

        let restricted = self.device.hardware().has_consumer_restriction();
        let mut added = Vec::with_capacity(allowed.len());
        for ((request, information), streams) in requests.iter().zip(&sources).zip(allowed) {
            // a failure drops and thereby disposes everything added so far
            let manager = self.device.hardware_mut().open_source(&request.selection, &streams)?;
            let mut stream = ActiveStream::new(
                information.unique_identifier,
                manager,
                &information.streams,
                information.recording_path.clone(),
            );
            if restricted {
                stream.enable_optimizer(request.selection.clone(), self.optimizer.clone());
            }
            stream.refresh(self.config.worker.retest_watchdog, self.config.worker.source_info_timeout)?;
            added.push(stream);
        }

        let result = added.iter().filter_map(ActiveStream::create_information).collect();
        for stream in added {
            info!("[Session] Receiving {} ({})", stream.key().source, stream.key().unique_identifier);
            self.streams.insert(stream.key(), stream);
        }
        Ok(result)
    }

    fn set_zapping_source(&mut self, selection_key: &str, target: &str) -> Result<ServerInformation, CardServerFault> {
        let selection = SourceSelection::parse(selection_key)?;
        if selection.source.is_none() {
            return Err(CardServerFault::validation(format!("{} does not address a source", selection_key)));
        }
        self.check_conflicts()?;

        let next_identifier = self
            .streams
            .values()
            .find_map(ActiveStream::manager)
            .map(|manager| manager.next_stream_identifier());

        self.select_group(Some(&selection.group_key()))?;

        let request = SelectionRequest {
            selection: selection.clone(),
            streams: StreamSelection::everything(),
        };
        let streams = self
            .optimizer
            .optimize(std::slice::from_ref(&request))
            .pop()
            .ok_or_else(|| CardServerFault::device(format!("{} can not be received", selection_key)))?;

        let mut manager = self.device.hardware_mut().open_source(&selection, &streams)?;
        manager.set_streaming_target(Some(target))?;
        if let Some(identifier) = next_identifier {
            manager.set_next_stream_identifier(identifier);
        }

        let mut stream = ActiveStream::new(Uuid::new_v4(), manager, &request.streams, None);
        if self.device.hardware().has_consumer_restriction() {
            stream.enable_optimizer(selection, self.optimizer.clone());
        }
        stream.refresh(self.config.worker.retest_watchdog, self.config.worker.source_info_timeout)?;
        info!("[Session] Zapping to {} via {}", stream.key().source, target);
        self.streams.insert(stream.key(), stream);

        Ok(self.create_state())
    }

    fn stream_information(&self) -> Vec<StreamInformation> {
        self.streams.values().filter_map(ActiveStream::create_information).collect()
    }

    /// Snapshot of the whole server.
    pub fn create_state(&mut self) -> ServerInformation {
        let current = self.device.current_group();
        let selection = current.as_ref().map(|group| {
            SourceSelection {
                source: None,
                group: group.group.clone(),
                location: group.location.clone(),
                profile_name: Some(self.profile.name.clone()),
                display_name: None,
            }
            .selection_key()
        });
        let has_group_information = current.is_some()
            && self
                .device
                .hardware_mut()
                .group_information(self.config.worker.group_info_timeout)
                .is_some();

        let (program_guide_progress, current_program_guide_items) = match self.guide.as_mut() {
            Some(guide) => (Some(guide.progress()), guide.item_count() as u32),
            None => (None, 0),
        };
        let (update_progress, update_source_count) = match self.scan.as_ref() {
            Some(scan) => (
                Some(scan.progress() as f64 / SCAN_COMPLETE as f64),
                scan.source_count(),
            ),
            None => (None, 0),
        };

        let signal = match self.device.signal() {
            Ok(signal) => Some(signal),
            Err(e) => {
                debug!("[Session] No signal information: {}", e);
                None
            }
        };

        ServerInformation {
            selection,
            has_group_information,
            program_guide_progress,
            current_program_guide_items,
            update_progress,
            update_source_count,
            streams: self.stream_information(),
            services: self
                .service_parser
                .as_ref()
                .and_then(|parser| parser.service_map())
                .unwrap_or_default(),
            signal,
        }
    }

    fn start_scan(&mut self) -> Result<(), CardServerFault> {
        self.check_conflicts()?;
        let scan = ScanState::start(&self.environment, &self.profile)?;
        self.remove_all();
        self.scan = Some(scan);
        Ok(())
    }

    fn end_scan(&mut self, update_profile: Option<bool>) -> Result<(), CardServerFault> {
        let scan = self.scan.as_mut().ok_or_else(scan_not_active)?;
        scan.request_end(update_profile)?;
        info!("[Scan] End requested (update profile: {:?})", update_profile);
        Ok(())
    }

    /// Result of a delayed scan end, once the scanner stopped.
    pub fn take_finished_scan(&mut self) -> Option<Outcome> {
        if !self.scan.as_ref().is_some_and(ScanState::is_finished) {
            return None;
        }
        let scan = self.scan.take()?;

        let mut profile = self.profile.clone();
        let outcome = match scan.finish(&mut profile, &self.environment) {
            Ok(()) => {
                self.profile = profile;
                Ok(ResponseData::None)
            }
            Err(e) => Err(e.into()),
        };
        Some(outcome)
    }

    fn start_guide_collection(
        &mut self,
        sources: &[SourceIdentifier],
        extensions: EpgExtensions,
    ) -> Result<(), CardServerFault> {
        self.check_conflicts()?;
        let collector = GuideCollector::new(self.config.guide.clone(), &self.profile, sources, extensions);
        self.remove_all();

        let guide = self.guide.insert(collector);
        guide.collect(&mut self.device);
        Ok(())
    }

    fn end_guide_collection(&mut self) -> Result<Vec<ProgramGuideItem>, CardServerFault> {
        let guide = self.guide.take().ok_or_else(guide_not_active)?;
        Ok(guide.finish(&mut self.device)?)
    }

    fn custom_action(&mut self, name: &str, input: Value) -> Result<Value, CardServerFault> {
        let action = self.registry.action(name)?;
        let mut ctx = ActionContext {
            streams: self.stream_information(),
            device: &mut self.device,
            profile: &self.profile,
        };
        action.execute(&mut ctx, input)
    }

    fn load_extensions(&mut self, payload: &ExtensionPayload) -> Result<(), CardServerFault> {
        self.registry.load(payload)?;
        self.install_pipeline_extensions();
        Ok(())
    }

    fn update_service_parser(&mut self) {
        let with_guide = self
            .streams
            .values()
            .find(|stream| stream.is_program_guide_active().unwrap_or(false))
            .map(|stream| stream.key().source);

        match with_guide {
            Some(source) if self.service_parser.is_none() => {
                match self.environment.service_parsers.start(&self.profile, source) {
                    Ok(parser) => {
                        debug!("[Session] Service parser started on {}", source);
                        self.service_parser = Some(parser);
                    }
                    Err(e) => debug!("[Session] Service parser not available: {}", e),
                }
            }
            None => self.disable_service_parser(),
            Some(_) => {}
        }
    }

    fn disable_service_parser(&mut self) {
        if let Some(mut parser) = self.service_parser.take() {
            debug!("[Session] Service parser stopped");
            parser.disable();
        }
    }

    fn update_decryption(&mut self) {
        let sources: Vec<SourceIdentifier> = self
            .streams
            .values()
            .filter(|stream| stream.needs_decryption())
            .map(|stream| stream.key().source)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if let Err(e) = self.device.decrypt(&sources) {
            warn!("[Session] Failed to decrypt {} sources: {}", sources.len(), e);
        }
    }

    /// Restart the transponder if it stopped delivering tables.
    fn check_group_restart(&mut self) {
        let Some(group) = self.device.current_group() else {
            return;
        };

        let worker = &self.config.worker;
        if self
            .device
            .hardware_mut()
            .group_information(worker.group_info_timeout)
            .is_none()
        {
            if self.group_restarts >= worker.group_restart_limit {
                return;
            }
            let Some(interval) = worker.group_watchdog else {
                return;
            };
            if self.last_group_information.elapsed() <= interval {
                return;
            }

            self.group_restarts += 1;
            warn!(
                "[Session] No data on {} for {:?}, restarting ({}/{})",
                group,
                self.last_group_information.elapsed(),
                self.group_restarts,
                worker.group_restart_limit
            );

            for stream in self.streams.values_mut() {
                stream.close();
            }
            self.last_group_information = Instant::now();

            if let Err(e) = self
                .device
                .select_group(None)
                .and_then(|_| self.device.select_group(Some(&group)))
            {
                warn!("[Session] Failed to restart {}: {}", group, e);
            }
            return;
        }

        self.last_group_information = Instant::now();
        if worker.group_restart_reset == GroupRestartReset::OnRecovery {
            self.group_restarts = 0;
        }

        let interval = worker.decryption_watchdog;
        let budget = worker.decryption_restart_limit;
        for stream in self.streams.values_mut() {
            if let Err(e) = stream.test_decryption(&mut self.device, interval, budget) {
                warn!("[Session] Decryption restart for {} failed: {}", stream.key().source, e);
            }
        }
    }

    /// Watchdog cycle.
    pub fn on_idle(&mut self) {
        if !self.streams.is_empty() {
            self.device.hardware_mut().reset_information_readers();
            self.check_group_restart();

            let retest = self.config.worker.retest_watchdog;
            let timeout = self.config.worker.source_info_timeout;
            for stream in self.streams.values_mut() {
                if let Err(e) = stream.refresh(retest, timeout) {
                    warn!("[Session] Refresh of {} failed: {}", stream.key().source, e);
                }
            }
            self.update_decryption();
        }

        if let Some(guide) = self.guide.as_mut() {
            guide.collect(&mut self.device);
        }
        if let Some(scan) = self.scan.as_mut() {
            scan.update();
        }

        let mut ctx = ActionContext {
            streams: self.stream_information(),
            device: &mut self.device,
            profile: &self.profile,
        };
        self.registry.run_idle_hooks(&mut ctx);
    }

    /// Release everything, best-effort.
    pub fn close(&mut self) {
        if let Some(guide) = self.guide.take() {
            if let Err(e) = guide.finish(&mut self.device) {
                warn!("[Session] Failed to stop guide collection: {}", e);
            }
        }
        if let Some(scan) = self.scan.take() {
            scan.abandon();
        }
        self.remove_all();
        self.device.close();
        info!("[Session] Closed {}", self.profile.name);
    }

    /// Give back the registry after [`Self::close`].
    pub fn into_registry(self) -> ExtensionRegistry {
        self.registry
    }
}

fn no_such_source(source: SourceIdentifier) -> CardServerFault {
    CardServerFault::new(FaultKind::NoSuchSource, format!("{} is not being received", source))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SharedSimulation, SimulatedEnvironment};
    use crate::pipeline::HardwareDecryption;

    const KEY_A: &str = "(1, 1101, 28106)@11836000@19.2E@DeviceA";
    const KEY_B: &str = "(1, 1101, 28107)@11836000@19.2E@DeviceA";
    const GROUP: &str = "@11836000@19.2E@DeviceA";

    fn source_a() -> SourceIdentifier {
        SourceIdentifier::new(1, 1101, 28106)
    }

    fn profile() -> Profile {
        Profile {
            name: "DeviceA".into(),
            sources: vec![SourceSelection::parse(KEY_A).unwrap(), SourceSelection::parse(KEY_B).unwrap()],
            pipeline_extensions: vec![HardwareDecryption::NAME.to_string()],
            ..Default::default()
        }
    }

    fn session_with(profile: Profile, consumer_limit: Option<usize>, config: Config) -> (SharedSimulation, WorkerSession) {
        let sim = SimulatedEnvironment::new().with_profile(profile, consumer_limit);
        let environment = sim.environment();
        let attach = AttachOptions {
            profile: "devicea".into(),
            reset: true,
            disable_pcr_from_h264: true,
            disable_pcr_from_mpeg2: false,
        };
        let (device, profile) = open_device(&attach, &environment).unwrap();
        let session = WorkerSession::new(device, profile, environment, config, ExtensionRegistry::new(), None);
        (sim.state(), session)
    }

    fn session() -> (SharedSimulation, WorkerSession) {
        session_with(profile(), None, Config::default())
    }

    fn run(session: &mut WorkerSession, request: Request) -> Result<ResponseData, CardServerFault> {
        match session.execute(request)? {
            Execution::Complete(data) => Ok(data),
            Execution::Delayed => Ok(ResponseData::None),
        }
    }

    fn add(session: &mut WorkerSession, key: &str, streams: StreamSelection) -> Vec<StreamInformation> {
        let request = Request::AddSources {
            sources: vec![ReceiveInformation::new(key, streams).with_identifier(Uuid::nil())],
        };
        match run(session, request).unwrap() {
            ResponseData::Streams(streams) => streams,
            other => panic!("unexpected response {:?}", other),
        }
    }

    fn server_state(session: &mut WorkerSession) -> ServerInformation {
        match run(session, Request::GetState).unwrap() {
            ResponseData::State(state) => state,
            other => panic!("unexpected response {:?}", other),
        }
    }

    fn select(session: &mut WorkerSession) {
        run(session, Request::Select { selection_key: GROUP.into() }).unwrap();
    }

    #[test]
    fn test_attach_applies_options() {
        let (state, session) = session();
        let state = state.lock();
        assert_eq!(state.wakeup_resets, 1);
        assert_eq!(state.pcr_disabled, (true, false));
        drop(state);
        assert_eq!(session.profile().name, "DeviceA");
    }

    #[test]
    fn test_unknown_profile() {
        let sim = SimulatedEnvironment::new();
        let attach = AttachOptions {
            profile: "missing".into(),
            reset: false,
            disable_pcr_from_h264: false,
            disable_pcr_from_mpeg2: false,
        };
        let err = open_device(&attach, &sim.environment()).err().unwrap();
        assert_eq!(err.kind, FaultKind::ProfileNotFound);
    }

    #[test]
    fn test_watchdog_overrides() {
        let mut profile = profile();
        profile.parameters.insert(STREAM_WATCHDOG_PARAMETER.into(), "0".into());
        profile.parameters.insert(DECRYPTION_WATCHDOG_PARAMETER.into(), "30".into());
        profile.parameters.insert(SOURCE_WATCHDOG_PARAMETER.into(), "0".into());
        let (_, session) = session_with(profile, None, Config::default());

        let worker = session.worker_config();
        assert_eq!(worker.group_watchdog, None);
        assert_eq!(worker.decryption_watchdog, Some(Duration::from_secs(30)));
        assert_eq!(worker.retest_watchdog, WorkerConfig::default().retest_watchdog);
    }

    #[test]
    fn test_add_and_remove_source() {
        let (state, mut session) = session();
        select(&mut session);
        let streams = add(&mut session, KEY_A, StreamSelection::default());
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].source, source_a());
        assert!(streams[0].current_audio_video_bytes > 0);

        let err = run(
            &mut session,
            Request::AddSources {
                sources: vec![ReceiveInformation::new(KEY_A, StreamSelection::default()).with_identifier(Uuid::nil())],
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, FaultKind::SourceInUse);

        run(
            &mut session,
            Request::RemoveSource {
                source: source_a(),
                unique_identifier: Uuid::nil(),
            },
        )
        .unwrap();
        assert!(server_state(&mut session).find_stream(&source_a(), Uuid::nil()).is_none());
        assert_eq!(state.lock().managers_disposed, vec![source_a()]);

        let err = run(
            &mut session,
            Request::RemoveSource {
                source: source_a(),
                unique_identifier: Uuid::nil(),
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, FaultKind::NoSuchSource);
    }

    #[test]
    fn test_set_stream_target() {
        let (_, mut session) = session();
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());

        run(
            &mut session,
            Request::SetStreamTarget {
                source: source_a(),
                unique_identifier: Uuid::nil(),
                target: Some("udp://239.0.0.1:5000".into()),
            },
        )
        .unwrap();
        let state = server_state(&mut session);
        let stream = state.find_stream(&source_a(), Uuid::nil()).unwrap();
        assert_eq!(stream.stream_target.as_deref(), Some("udp://239.0.0.1:5000"));

        let err = run(
            &mut session,
            Request::SetStreamTarget {
                source: source_a(),
                unique_identifier: Uuid::new_v4(),
                target: None,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, FaultKind::NoSuchSource);
    }

    #[test]
    fn test_watchdog_runs_idle_hooks() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        use crate::server::extensions::tests::{CountingHook, HookFactory};

        let (_, mut session) = session();
        let registered = Arc::new(AtomicUsize::new(0));
        session.registry.register_idle_hook(Box::new(CountingHook(registered.clone())));

        let loaded = Arc::new(AtomicUsize::new(0));
        session
            .registry
            .register_factory(HookFactory::NAME, Arc::new(HookFactory(loaded.clone())));
        run(
            &mut session,
            Request::LoadExtensions {
                payload: ExtensionPayload::new("Watch", HookFactory::NAME, vec![1]),
            },
        )
        .unwrap();

        // without streams the cycle still reaches the hooks
        session.on_idle();
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());
        session.on_idle();

        assert_eq!(registered.load(Ordering::SeqCst), 2);
        assert_eq!(loaded.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_consumer_limit_truncates_sources() {
        let (_, mut session) = session_with(profile(), Some(1), Config::default());
        select(&mut session);
        let request = Request::AddSources {
            sources: vec![
                ReceiveInformation::new(KEY_A, StreamSelection::default()),
                ReceiveInformation::new(KEY_B, StreamSelection::default()),
            ],
        };
        match run(&mut session, request).unwrap() {
            ResponseData::Streams(streams) => assert_eq!(streams.len(), 1),
            other => panic!("unexpected response {:?}", other),
        }
        assert_eq!(session.stream_count(), 1);
    }

    #[test]
    fn test_service_parser_follows_guide_streams() {
        let (state, mut session) = session();
        select(&mut session);
        let guide = StreamSelection {
            program_guide: true,
            ..Default::default()
        };
        let request = Request::AddSources {
            sources: vec![
                ReceiveInformation::new(KEY_A, guide.clone()),
                ReceiveInformation::new(KEY_B, guide),
            ],
        };
        let streams = match run(&mut session, request).unwrap() {
            ResponseData::Streams(streams) => streams,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(state.lock().service_parser_starts, 1);

        run(
            &mut session,
            Request::RemoveSource {
                source: streams[0].source,
                unique_identifier: streams[0].unique_identifier,
            },
        )
        .unwrap();
        assert_eq!(state.lock().service_parser_stops, 0);

        run(
            &mut session,
            Request::RemoveSource {
                source: streams[1].source,
                unique_identifier: streams[1].unique_identifier,
            },
        )
        .unwrap();
        assert_eq!(state.lock().service_parser_starts, 1);
        assert_eq!(state.lock().service_parser_stops, 1);
    }

    #[test]
    fn test_group_restart_is_capped() {
        let mut config = Config::default();
        config.worker.group_watchdog = Some(Duration::from_millis(1));
        config.worker.group_restart_limit = 2;
        let (state, mut session) = session_with(profile(), None, config);
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());

        state.lock().group_information_available = false;
        let tunes_before = state.lock().tune_log.len();

        let mut restarts = Vec::new();
        for _ in 0..5 {
            std::thread::sleep(Duration::from_millis(5));
            session.on_idle();
            restarts.push(session.group_restarts());
        }

        assert_eq!(restarts, vec![1, 2, 2, 2, 2]);
        // each restart detaches and reselects once
        assert_eq!(state.lock().tune_log.len() - tunes_before, 4);

        state.lock().group_information_available = true;
        session.on_idle();
        assert_eq!(session.group_restarts(), 2);
        select(&mut session);
        assert_eq!(session.group_restarts(), 0);
    }

    #[test]
    fn test_group_restart_reset_on_recovery() {
        let mut config = Config::default();
        config.worker.group_watchdog = Some(Duration::from_millis(1));
        config.worker.group_restart_reset = GroupRestartReset::OnRecovery;
        let (state, mut session) = session_with(profile(), None, config);
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());

        state.lock().group_information_available = false;
        std::thread::sleep(Duration::from_millis(5));
        session.on_idle();
        assert_eq!(session.group_restarts(), 1);

        state.lock().group_information_available = true;
        session.on_idle();
        assert_eq!(session.group_restarts(), 0);
    }

    #[test]
    fn test_encrypted_source_is_decrypted() {
        let (state, mut session) = session();
        state.lock().source_mut(&source_a()).unwrap().encrypted = true;
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());

        assert!(state.lock().decrypted.contains(&source_a()));
        let snapshot = server_state(&mut session);
        assert!(snapshot.streams[0].is_decrypting);
        assert!(snapshot.streams[0].current_audio_video_bytes > 0);
    }

    #[test]
    fn test_state_reports_selection() {
        let (_, mut session) = session();
        let snapshot = server_state(&mut session);
        assert_eq!(snapshot.selection, None);
        assert!(!snapshot.has_group_information);

        select(&mut session);
        let snapshot = server_state(&mut session);
        assert_eq!(snapshot.selection.as_deref(), Some(GROUP));
        assert!(snapshot.has_group_information);
        assert!(snapshot.signal.unwrap().locked);
    }

    #[test]
    fn test_zapping_keeps_stream_identifier() {
        let (_, mut session) = session();
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());
        session
            .streams
            .values_mut()
            .next()
            .and_then(ActiveStream::manager_mut)
            .unwrap()
            .set_next_stream_identifier(42);

        let snapshot = match run(
            &mut session,
            Request::SetZappingSource {
                selection_key: KEY_B.into(),
                target: "udp://239.0.0.1:5000".into(),
            },
        )
        .unwrap()
        {
            ResponseData::State(state) => state,
            other => panic!("unexpected response {:?}", other),
        };

        assert_eq!(snapshot.streams.len(), 1);
        assert_eq!(snapshot.streams[0].source, SourceIdentifier::new(1, 1101, 28107));
        assert_eq!(snapshot.streams[0].stream_target.as_deref(), Some("udp://239.0.0.1:5000"));
        let manager = session.streams.values().next().and_then(ActiveStream::manager).unwrap();
        assert_eq!(manager.next_stream_identifier(), 42);
    }

    #[test]
    fn test_guide_and_scan_exclude_each_other() {
        let (_, mut session) = session();
        run(
            &mut session,
            Request::StartEpgCollection {
                sources: vec![source_a()],
                extensions: EpgExtensions::NONE,
            },
        )
        .unwrap();
        assert_eq!(run(&mut session, Request::StartScan).unwrap_err().kind, FaultKind::EpgActive);
        assert_eq!(
            run(&mut session, Request::Select { selection_key: GROUP.into() }).unwrap_err().kind,
            FaultKind::EpgActive
        );
        assert!(server_state(&mut session).program_guide_progress.is_some());

        run(&mut session, Request::EndEpgCollection).unwrap();
        assert_eq!(
            run(&mut session, Request::EndEpgCollection).unwrap_err().kind,
            FaultKind::EpgNotActive
        );
    }

    #[test]
    fn test_scan_end_is_delayed() {
        let (state, mut session) = session();
        state.lock().scan.locations = vec![3];
        state.lock().scan.sources_per_group = 2;

        assert_eq!(
            run(&mut session, Request::EndScan { update_profile: None }).unwrap_err().kind,
            FaultKind::ScanNotActive
        );

        run(&mut session, Request::StartScan).unwrap();
        session.on_idle();
        let snapshot = server_state(&mut session);
        assert!(snapshot.update_progress.unwrap() > 0.0);
        assert_eq!(snapshot.update_source_count, 4);

        assert!(matches!(
            session.execute(Request::EndScan { update_profile: Some(true) }).unwrap(),
            Execution::Delayed
        ));
        assert_eq!(
            run(&mut session, Request::EndScan { update_profile: None }).unwrap_err().kind,
            FaultKind::ScanNotActive
        );

        assert!(matches!(session.take_finished_scan(), Some(Ok(ResponseData::None))));
        assert!(session.take_finished_scan().is_none());
        assert_eq!(state.lock().saved_profiles.len(), 1);
        assert_eq!(session.profile().locations, vec!["Location1".to_string()]);
    }

    #[test]
    fn test_custom_action() {
        let (_, mut session) = session();
        let value = match run(
            &mut session,
            Request::CustomAction {
                action: "signal-information".into(),
                input: Value::Null,
            },
        )
        .unwrap()
        {
            ResponseData::Custom(value) => value,
            other => panic!("unexpected response {:?}", other),
        };
        assert_eq!(value["locked"], Value::Bool(true));

        let err = run(
            &mut session,
            Request::CustomAction {
                action: "missing".into(),
                input: Value::Null,
            },
        )
        .unwrap_err();
        assert_eq!(err.kind, FaultKind::NoSuchAction);
    }

    #[test]
    fn test_close_releases_everything() {
        let (state, mut session) = session();
        select(&mut session);
        add(&mut session, KEY_A, StreamSelection::default());
        session.close();

        let state = state.lock();
        assert_eq!(state.managers_disposed, vec![source_a()]);
        assert_eq!(state.current_group, None);
    }
}
