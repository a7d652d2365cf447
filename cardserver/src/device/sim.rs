//! Simulated device.
//!
//! All collaborator traits backed by one shared [`SimulationState`]. Tests
//! flip its flags to produce faults (missing transponder tables, encrypted
//! sources without payload, consumer counts) and read its counters back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use parking_lot::Mutex;

use cardserver_protocol::{
    FileInformation, GroupKey, ServiceInformation, SignalInformation, SourceIdentifier, SourceSelection,
    StreamSelection,
};

use super::{
    CappedOptimizer, DeviceEnvironment, DeviceError, GroupInformation, GuideEvent, GuideTable, Hardware, Profile,
    ProfileStore, RecreateHandler, ScannerFactory, ServiceParser, ServiceParserFactory, SourceInformation,
    SourceStreamManager, TransponderScanner,
};

/// Payload bytes reported per flowing stream.
const SIMULATED_PAYLOAD: u64 = 188 * 1024;

/// Behaviour of one simulated source.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    pub selection: SourceSelection,
    pub name: String,
    pub encrypted: bool,
    /// Audio/video data arrives once the stream runs (and is decrypted if needed).
    pub payload: bool,
    /// Source information is present in the transport stream.
    pub available: bool,
    /// Overrides the consumer count of a running stream.
    pub consumer_count: Option<u32>,
}

impl SimulatedSource {
    pub fn new(selection: SourceSelection) -> Self {
        let name = selection
            .display_name
            .clone()
            .unwrap_or_else(|| selection.source.map(|s| s.to_string()).unwrap_or_default());
        Self {
            selection,
            name,
            encrypted: false,
            payload: true,
            available: true,
            consumer_count: None,
        }
    }
}

/// Scripted transponder scan.
#[derive(Debug, Clone, Default)]
pub struct ScanScript {
    /// Groups per location; each group contributes `sources_per_group` sources.
    pub locations: Vec<usize>,
    pub sources_per_group: u32,
}

/// Shared state of the simulation.
#[derive(Default)]
pub struct SimulationState {
    pub profiles: BTreeMap<String, Profile>,
    pub consumer_limits: BTreeMap<String, usize>,
    pub consumer_limit: Option<usize>,
    pub sources: BTreeMap<SourceIdentifier, SimulatedSource>,
    pub current_group: Option<GroupKey>,
    /// Transponder tables are delivered.
    pub group_information_available: bool,
    /// Every call to `tune`, in order.
    pub tune_log: Vec<Option<GroupKey>>,
    pub fail_tune: bool,
    pub decrypt_log: Vec<Vec<SourceIdentifier>>,
    pub decrypted: BTreeSet<SourceIdentifier>,
    pub reset_information_calls: usize,
    pub wakeup_resets: usize,
    /// Last PCR setting as (H.264, MPEG-2).
    pub pcr_disabled: (bool, bool),
    pub streams_created: BTreeMap<SourceIdentifier, usize>,
    pub streams_closed: BTreeMap<SourceIdentifier, usize>,
    pub managers_disposed: Vec<SourceIdentifier>,
    /// Backdates the activation time of new streams.
    pub activation_age: Duration,
    pub signal: SignalInformation,
    pub services: Vec<ServiceInformation>,
    pub service_parser_starts: usize,
    pub service_parser_stops: usize,
    pub guide_events: Vec<(GroupKey, GuideEvent)>,
    pub guide_consumers: Vec<(GuideTable, mpsc::Sender<GuideEvent>)>,
    pub scan: ScanScript,
    pub saved_profiles: Vec<Profile>,
}

impl SimulationState {
    pub fn add_source(&mut self, source: SimulatedSource) {
        if let Some(id) = source.selection.source {
            self.sources.insert(id, source);
        }
    }

    pub fn source_mut(&mut self, source: &SourceIdentifier) -> Option<&mut SimulatedSource> {
        self.sources.get_mut(source)
    }

    fn on_current_group(&self, source: &SourceIdentifier) -> Option<&SimulatedSource> {
        let simulated = self.sources.get(source)?;
        (self.current_group.as_ref() == Some(&simulated.selection.group_key())).then_some(simulated)
    }

    fn information(&self, source: &SourceIdentifier) -> Option<SourceInformation> {
        let simulated = self.on_current_group(source)?;
        if !simulated.available || !self.group_information_available {
            return None;
        }
        Some(SourceInformation {
            source: *source,
            name: simulated.name.clone(),
            is_encrypted: simulated.encrypted,
            audio_tracks: 2,
        })
    }

    fn deliver_guide(&mut self, table: GuideTable, consumer: &mpsc::Sender<GuideEvent>) {
        let Some(current) = self.current_group.clone() else {
            return;
        };
        for (_, event) in self
            .guide_events
            .iter()
            .filter(|(group, event)| *group == current && event.table == table)
        {
            let _ = consumer.send(event.clone());
        }
    }
}

pub type SharedSimulation = Arc<Mutex<SimulationState>>;

/// Builder for a simulated environment.
pub struct SimulatedEnvironment {
    state: SharedSimulation,
}

impl SimulatedEnvironment {
    pub fn new() -> Self {
        let state = SimulationState {
            group_information_available: true,
            signal: SignalInformation {
                locked: true,
                strength: Some(0.8),
                quality: Some(0.9),
            },
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Register a profile and all of its sources.
    pub fn with_profile(self, profile: Profile, consumer_limit: Option<usize>) -> Self {
        {
            let mut state = self.state.lock();
            for selection in &profile.sources {
                state.add_source(SimulatedSource::new(selection.clone()));
            }
            if let Some(limit) = consumer_limit {
                state.consumer_limits.insert(profile.name.to_lowercase(), limit);
            }
            state.profiles.insert(profile.name.to_lowercase(), profile);
        }
        self
    }

    pub fn state(&self) -> SharedSimulation {
        self.state.clone()
    }

    pub fn environment(&self) -> DeviceEnvironment {
        DeviceEnvironment {
            profiles: Arc::new(SimulatedProfiles {
                state: self.state.clone(),
            }),
            service_parsers: Arc::new(SimulatedServiceParsers {
                state: self.state.clone(),
            }),
            scanners: Arc::new(SimulatedScanners {
                state: self.state.clone(),
            }),
        }
    }
}

impl Default for SimulatedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SimulatedHardware {
    state: SharedSimulation,
}

impl SimulatedHardware {
    pub fn new(state: SharedSimulation) -> Self {
        Self { state }
    }

    /// Hardware with a private, empty simulation.
    pub fn standalone() -> Self {
        Self::new(SimulatedEnvironment::new().state())
    }
}

impl Hardware for SimulatedHardware {
    fn tune(&mut self, group: Option<&GroupKey>) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.tune_log.push(group.cloned());
        if state.fail_tune && group.is_some() {
            return Err(DeviceError::TuneFailed {
                group: group.map(|g| g.to_string()).unwrap_or_default(),
                message: "simulated tuning failure".into(),
            });
        }
        state.current_group = group.cloned();
        state.guide_consumers.clear();
        debug!("[Sim] Tuned to {:?}", group);
        Ok(())
    }

    fn current_group(&self) -> Option<GroupKey> {
        self.state.lock().current_group.clone()
    }

    fn group_information(&mut self, _timeout: Duration) -> Option<GroupInformation> {
        let state = self.state.lock();
        let current = state.current_group.as_ref()?;
        if !state.group_information_available {
            return None;
        }
        Some(GroupInformation {
            sources: state
                .sources
                .iter()
                .filter(|(_, s)| s.selection.group_key() == *current)
                .map(|(id, _)| *id)
                .collect(),
        })
    }

    fn reset_information_readers(&mut self) {
        self.state.lock().reset_information_calls += 1;
    }

    fn decrypt_sources(&mut self, sources: &[SourceIdentifier]) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.decrypt_log.push(sources.to_vec());
        state.decrypted = sources.iter().copied().collect();
        Ok(())
    }

    fn has_consumer_restriction(&self) -> bool {
        self.state.lock().consumer_limit.is_some()
    }

    fn consumer_limit(&self) -> Option<usize> {
        self.state.lock().consumer_limit
    }

    fn signal_status(&mut self) -> SignalInformation {
        self.state.lock().signal
    }

    fn reset_wakeup_device(&mut self) -> Result<(), DeviceError> {
        self.state.lock().wakeup_resets += 1;
        Ok(())
    }

    fn disable_pcr_generation(&mut self, h264: bool, mpeg2: bool) {
        self.state.lock().pcr_disabled = (h264, mpeg2);
    }

    fn open_source(
        &mut self,
        selection: &SourceSelection,
        streams: &StreamSelection,
    ) -> Result<Box<dyn SourceStreamManager>, DeviceError> {
        let source = selection
            .source
            .ok_or_else(|| DeviceError::Stream(format!("{} addresses no source", selection)))?;

        if self.state.lock().on_current_group(&source).is_none() {
            return Err(DeviceError::SourceUnavailable(source));
        }

        Ok(Box::new(SimulatedStreamManager {
            state: self.state.clone(),
            source,
            requested: streams.clone(),
            active_selection: None,
            active_information: None,
            activated_at: None,
            streaming_target: None,
            next_stream_identifier: 0,
            files: Vec::new(),
            recreate: None,
            disposed: false,
        }))
    }

    fn add_program_guide_consumer(&mut self, table: GuideTable, consumer: mpsc::Sender<GuideEvent>) {
        let mut state = self.state.lock();
        state.deliver_guide(table, &consumer);
        state.guide_consumers.push((table, consumer));
    }

    fn remove_program_guide_consumers(&mut self) {
        self.state.lock().guide_consumers.clear();
    }
}

pub struct SimulatedStreamManager {
    state: SharedSimulation,
    source: SourceIdentifier,
    requested: StreamSelection,
    active_selection: Option<StreamSelection>,
    active_information: Option<SourceInformation>,
    activated_at: Option<Instant>,
    streaming_target: Option<String>,
    next_stream_identifier: u16,
    files: Vec<FileInformation>,
    recreate: Option<RecreateHandler>,
    disposed: bool,
}

impl SimulatedStreamManager {
    fn activate(&mut self, selection: StreamSelection, information: &SourceInformation) {
        let mut state = self.state.lock();
        *state.streams_created.entry(self.source).or_default() += 1;
        self.activated_at = Some(Instant::now().checked_sub(state.activation_age).unwrap_or_else(Instant::now));
        self.active_selection = Some(selection);
        self.active_information = Some(information.clone());
    }

    fn payload_flowing(&self) -> bool {
        if self.active_selection.is_none() {
            return false;
        }
        let state = self.state.lock();
        match state.sources.get(&self.source) {
            Some(source) => source.payload && (!source.encrypted || state.decrypted.contains(&self.source)),
            None => false,
        }
    }
}

impl SourceStreamManager for SimulatedStreamManager {
    fn source(&self) -> SourceIdentifier {
        self.source
    }

    fn create_stream(&mut self, target_path: Option<&str>, information: &SourceInformation) -> Result<bool, DeviceError> {
        if self.disposed {
            return Err(DeviceError::Stream("manager disposed".into()));
        }
        if let Some(path) = target_path {
            self.files.push(FileInformation {
                path: path.to_string(),
                video_type: Some("SDTV".into()),
            });
        }
        self.activate(self.requested.clone(), information);
        Ok(true)
    }

    fn retest_source_information(&mut self, information: Option<&SourceInformation>) -> Result<(), DeviceError> {
        let Some(information) = information else {
            return Ok(());
        };
        if self.active_selection.is_some() {
            self.active_information = Some(information.clone());
            return Ok(());
        }

        let selection = match self.recreate.as_mut() {
            Some(recreate) => recreate(information),
            None => Some(self.requested.clone()),
        };
        if let Some(selection) = selection {
            self.activate(selection, information);
        }
        Ok(())
    }

    fn close_stream(&mut self) {
        *self.state.lock().streams_closed.entry(self.source).or_default() += 1;
        self.active_selection = None;
    }

    fn current_information(&mut self, _timeout: Duration) -> Option<SourceInformation> {
        self.state.lock().information(&self.source)
    }

    fn active_information(&self) -> Option<SourceInformation> {
        self.active_information.clone()
    }

    fn active_selection(&self) -> Option<StreamSelection> {
        self.active_selection.clone()
    }

    fn last_activation_time(&self) -> Option<Instant> {
        self.activated_at
    }

    fn is_decrypting(&self) -> Option<bool> {
        let information = self.active_information.as_ref()?;
        Some(information.is_encrypted && self.state.lock().decrypted.contains(&self.source))
    }

    fn audio_video_bytes(&self) -> u64 {
        if self.payload_flowing() {
            SIMULATED_PAYLOAD
        } else {
            0
        }
    }

    fn bytes_received(&self) -> u64 {
        if self.active_selection.is_some() {
            SIMULATED_PAYLOAD * 2
        } else {
            0
        }
    }

    fn consumer_count(&self) -> u32 {
        let Some(selection) = &self.active_selection else {
            return 0;
        };
        let state = self.state.lock();
        state
            .sources
            .get(&self.source)
            .and_then(|s| s.consumer_count)
            .unwrap_or(CappedOptimizer::cost(selection) as u32)
    }

    fn streaming_target(&self) -> Option<String> {
        self.streaming_target.clone()
    }

    fn set_streaming_target(&mut self, target: Option<&str>) -> Result<(), DeviceError> {
        self.streaming_target = target.map(str::to_string);
        Ok(())
    }

    fn next_stream_identifier(&self) -> u16 {
        self.next_stream_identifier
    }

    fn set_next_stream_identifier(&mut self, identifier: u16) {
        self.next_stream_identifier = identifier;
    }

    fn all_files(&self) -> Vec<FileInformation> {
        self.files.clone()
    }

    fn set_recreate_handler(&mut self, handler: Option<RecreateHandler>) {
        self.recreate = handler;
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.active_selection = None;
        self.recreate = None;
        self.state.lock().managers_disposed.push(self.source);
    }
}

struct SimulatedProfiles {
    state: SharedSimulation,
}

impl ProfileStore for SimulatedProfiles {
    fn find_profile(&self, name: &str) -> Option<Profile> {
        self.state.lock().profiles.get(&name.to_lowercase()).cloned()
    }

    fn open_hardware(&self, profile: &Profile) -> Result<Box<dyn Hardware>, DeviceError> {
        {
            let mut state = self.state.lock();
            state.consumer_limit = state.consumer_limits.get(&profile.name.to_lowercase()).copied();
        }
        info!("[Sim] Opened simulated hardware for {}", profile.name);
        Ok(Box::new(SimulatedHardware::new(self.state.clone())))
    }

    fn save_profile(&self, profile: &Profile) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.saved_profiles.push(profile.clone());
        state.profiles.insert(profile.name.to_lowercase(), profile.clone());
        Ok(())
    }
}

struct SimulatedServiceParsers {
    state: SharedSimulation,
}

impl ServiceParserFactory for SimulatedServiceParsers {
    fn start(&self, profile: &Profile, source: SourceIdentifier) -> Result<Box<dyn ServiceParser>, DeviceError> {
        self.state.lock().service_parser_starts += 1;
        debug!("[Sim] Service parser started for {} on {}", source, profile.name);
        Ok(Box::new(SimulatedServiceParser {
            state: self.state.clone(),
            disabled: false,
        }))
    }
}

struct SimulatedServiceParser {
    state: SharedSimulation,
    disabled: bool,
}

impl ServiceParser for SimulatedServiceParser {
    fn service_map(&self) -> Option<Vec<ServiceInformation>> {
        if self.disabled {
            return None;
        }
        Some(self.state.lock().services.clone())
    }

    fn disable(&mut self) {
        if !self.disabled {
            self.disabled = true;
            self.state.lock().service_parser_stops += 1;
        }
    }
}

struct SimulatedScanners {
    state: SharedSimulation,
}

impl ScannerFactory for SimulatedScanners {
    fn create(&self, _profile: &Profile) -> Result<Box<dyn TransponderScanner>, DeviceError> {
        let script = self.state.lock().scan.clone();
        Ok(Box::new(SimulatedScanner {
            script,
            location: 0,
            group: 0,
            found: Vec::new(),
            started: false,
            aborted: false,
        }))
    }
}

/// Advances by one group each time its progress is sampled.
struct SimulatedScanner {
    script: ScanScript,
    location: usize,
    group: usize,
    found: Vec<u32>,
    started: bool,
    aborted: bool,
}

impl SimulatedScanner {
    fn finished(&self) -> bool {
        self.location >= self.script.locations.len()
    }

    fn step(&mut self) {
        if !self.started || self.aborted || self.finished() {
            return;
        }
        if self.found.len() <= self.location {
            self.found.push(0);
        }
        self.found[self.location] += self.script.sources_per_group;
        self.group += 1;
        if self.group >= self.script.locations[self.location] {
            self.location += 1;
            self.group = 0;
        }
    }
}

impl TransponderScanner for SimulatedScanner {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.started = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted = true;
    }

    fn is_done(&self) -> bool {
        self.aborted || self.finished()
    }

    fn total_locations(&self) -> usize {
        self.script.locations.len()
    }

    fn current_location(&self) -> usize {
        (self.location + 1).min(self.script.locations.len())
    }

    fn current_location_group(&self) -> usize {
        self.group
    }

    fn current_location_groups_pending(&self) -> usize {
        self.script
            .locations
            .get(self.location)
            .map(|groups| groups - self.group)
            .unwrap_or(0)
    }

    fn sources_found(&mut self) -> Vec<u32> {
        self.step();
        self.found.clone()
    }

    fn update_profile(&mut self, profile: &mut Profile) -> Result<(), DeviceError> {
        for (location, sources) in self.found.iter().enumerate() {
            let name = format!("Location{}", location + 1);
            if !profile.locations.contains(&name) {
                profile.locations.push(name.clone());
            }
            for service in 0..*sources {
                profile.sources.push(SourceSelection {
                    source: Some(SourceIdentifier::new(1, location as u16 + 1, service as u16 + 1)),
                    group: format!("Group{}", location + 1),
                    location: name.clone(),
                    profile_name: Some(profile.name.clone()),
                    display_name: None,
                });
            }
        }
        Ok(())
    }
}
