//! Collaborators of the card server.
//!
//! The orchestrator never talks to drivers, transport stream parsers or
//! scanning engines directly. Everything it needs is reached through the
//! traits in this module; [`sim`] implements all of them for tests and for
//! the `host` binary.

pub mod sim;

use std::collections::BTreeMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use thiserror::Error;

use cardserver_protocol::{
    CardServerFault, FaultKind, FileInformation, GroupKey, LanguageMode, LanguageSelection,
    ServiceInformation, SignalInformation, SourceIdentifier, SourceSelection, StreamSelection,
};

use crate::pipeline::{DecryptToken, DevicePipelines, SignalToken, TuneToken};

/// Errors reported by device collaborators.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The profile is unknown to the profile store.
    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    /// Hardware could not be opened.
    #[error("Failed to open hardware: {0}")]
    OpenFailed(String),

    /// Tuning to a transponder failed.
    #[error("Failed to tune to {group}: {message}")]
    TuneFailed { group: String, message: String },

    /// A source could not be opened.
    #[error("Source {0} is not available")]
    SourceUnavailable(SourceIdentifier),

    /// Decryption was requested but nothing on the device can decrypt.
    #[error("Decryption is not supported by this device")]
    DecryptionUnsupported,

    /// A pipeline step failed.
    #[error("Pipeline {pipeline} failed at {step}: {message}")]
    Pipeline {
        pipeline: String,
        step: String,
        message: String,
    },

    /// A stream manager failed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// The transponder scanner failed.
    #[error("Scanner error: {0}")]
    Scanner(String),

    /// The profile could not be stored.
    #[error("Failed to save profile: {0}")]
    SaveFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DeviceError> for CardServerFault {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::ProfileNotFound(name) => {
                CardServerFault::new(FaultKind::ProfileNotFound, format!("profile {} not found", name))
            }
            other => CardServerFault::device(other.to_string()),
        }
    }
}

/// A device profile as managed by a [`ProfileStore`].
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Profile {
    pub name: String,
    /// Free-form parameters, e.g. watchdog overrides.
    pub parameters: BTreeMap<String, String>,
    /// Name of the profile whose source list this one borrows.
    pub use_sources_from: Option<String>,
    /// Locations with their known sources.
    pub locations: Vec<String>,
    pub sources: Vec<SourceSelection>,
    /// Pipeline extensions to install when the hardware is opened.
    pub pipeline_extensions: Vec<String>,
}

impl Profile {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// All selections of a source known to this profile.
    pub fn find_source(&self, source: &SourceIdentifier) -> Vec<SourceSelection> {
        self.sources
            .iter()
            .filter(|s| s.source.as_ref() == Some(source))
            .cloned()
            .collect()
    }
}

/// Information carried by the tables of the current transponder.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupInformation {
    pub sources: Vec<SourceIdentifier>,
}

/// Current description of a single source as seen in the transport stream.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInformation {
    pub source: SourceIdentifier,
    pub name: String,
    pub is_encrypted: bool,
    pub audio_tracks: usize,
}

/// Guide table a consumer is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GuideTable {
    Standard,
    PremiereDirect,
    PremiereSport,
    FreeSat,
}

/// A descriptor attached to a guide event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDescriptor {
    ShortEvent {
        language: String,
        name: String,
        text: String,
    },
    ExtendedEvent {
        language: String,
        name: Option<String>,
        text: Option<String>,
    },
    ParentalRating(Vec<String>),
    Content(Vec<String>),
}

/// One event delivered by a guide table.
#[derive(Debug, Clone, PartialEq)]
pub struct GuideEvent {
    pub table: GuideTable,
    pub source: SourceIdentifier,
    pub identifier: u32,
    pub start: DateTime<Utc>,
    pub duration: u32,
    pub descriptors: Vec<EventDescriptor>,
}

/// Callback a stream manager asks before recreating its stream.
///
/// Returns the selection to use or `None` if the stream cannot be activated.
pub type RecreateHandler = Box<dyn FnMut(&SourceInformation) -> Option<StreamSelection> + Send>;

/// A tuning device.
pub trait Hardware: Send {
    /// Tune to a transponder, or detach with `None`.
    fn tune(&mut self, group: Option<&GroupKey>) -> Result<(), DeviceError>;

    fn current_group(&self) -> Option<GroupKey>;

    /// Wait for the tables of the current transponder.
    fn group_information(&mut self, timeout: Duration) -> Option<GroupInformation>;

    /// Force a reload of the transponder tables.
    fn reset_information_readers(&mut self);

    /// Ask the hardware to decrypt exactly these sources.
    fn decrypt_sources(&mut self, sources: &[SourceIdentifier]) -> Result<(), DeviceError>;

    /// True if the device can only serve a limited number of consumers.
    fn has_consumer_restriction(&self) -> bool;

    /// Maximum number of consumers, if restricted.
    fn consumer_limit(&self) -> Option<usize>;

    fn signal_status(&mut self) -> SignalInformation;

    fn reset_wakeup_device(&mut self) -> Result<(), DeviceError>;

    /// Stop deriving the program clock from H.264 or MPEG-2 video.
    fn disable_pcr_generation(&mut self, h264: bool, mpeg2: bool);

    /// Open a stream manager for a source on the current transponder.
    fn open_source(
        &mut self,
        selection: &SourceSelection,
        streams: &StreamSelection,
    ) -> Result<Box<dyn SourceStreamManager>, DeviceError>;

    fn add_program_guide_consumer(&mut self, table: GuideTable, consumer: mpsc::Sender<GuideEvent>);

    fn remove_program_guide_consumers(&mut self);
}

/// Manages the streams of one source.
pub trait SourceStreamManager: Send {
    fn source(&self) -> SourceIdentifier;

    /// Start receiving; returns true if the stream is running.
    fn create_stream(&mut self, target_path: Option<&str>, information: &SourceInformation) -> Result<bool, DeviceError>;

    /// Update the stream to the current source information.
    fn retest_source_information(&mut self, information: Option<&SourceInformation>) -> Result<(), DeviceError>;

    /// Stop the stream; a later retest will recreate it.
    fn close_stream(&mut self);

    fn current_information(&mut self, timeout: Duration) -> Option<SourceInformation>;

    fn active_information(&self) -> Option<SourceInformation>;

    fn active_selection(&self) -> Option<StreamSelection>;

    fn last_activation_time(&self) -> Option<Instant>;

    fn is_decrypting(&self) -> Option<bool>;

    fn audio_video_bytes(&self) -> u64;

    fn bytes_received(&self) -> u64;

    fn consumer_count(&self) -> u32;

    fn streaming_target(&self) -> Option<String>;

    fn set_streaming_target(&mut self, target: Option<&str>) -> Result<(), DeviceError>;

    fn next_stream_identifier(&self) -> u16;

    fn set_next_stream_identifier(&mut self, identifier: u16);

    fn all_files(&self) -> Vec<FileInformation>;

    fn set_recreate_handler(&mut self, handler: Option<RecreateHandler>);

    /// Release all resources.
    fn dispose(&mut self);
}

/// A source together with the streams requested for it.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionRequest {
    pub selection: SourceSelection,
    pub streams: StreamSelection,
}

/// Decides which of a set of requests the device can serve.
pub trait StreamSelectionOptimizer: Send + Sync {
    /// Returns one selection per satisfiable request, in request order.
    fn optimize(&self, requests: &[SelectionRequest]) -> Vec<StreamSelection>;
}

/// Optimizer honouring a consumer cap.
///
/// A request costs one consumer plus one for each of guide, videotext and
/// non-primary subtitles. Requests that do not fit are reduced to the
/// primary audio track only; the first request that does not fit even then
/// ends the list.
#[derive(Debug, Clone, Copy)]
pub struct CappedOptimizer {
    limit: Option<usize>,
}

impl CappedOptimizer {
    pub fn new(limit: Option<usize>) -> Self {
        Self { limit }
    }

    pub fn cost(streams: &StreamSelection) -> usize {
        1 + streams.program_guide as usize
            + streams.videotext as usize
            + (streams.subtitles.mode != LanguageMode::Primary) as usize
    }

    /// Primary audio only, keeping the first preferred language.
    fn reduced(streams: &StreamSelection) -> StreamSelection {
        let primary = |tracks: &LanguageSelection| LanguageSelection {
            mode: LanguageMode::Primary,
            languages: tracks.languages.iter().take(1).cloned().collect(),
        };

        StreamSelection {
            mp2_tracks: primary(&streams.mp2_tracks),
            ac3_tracks: primary(&streams.ac3_tracks),
            ..Default::default()
        }
    }
}

impl StreamSelectionOptimizer for CappedOptimizer {
    fn optimize(&self, requests: &[SelectionRequest]) -> Vec<StreamSelection> {
        let Some(limit) = self.limit else {
            return requests.iter().map(|r| r.streams.clone()).collect();
        };

        let mut used = 0;
        let mut result = Vec::with_capacity(requests.len());
        for request in requests {
            let cost = Self::cost(&request.streams);
            if used + cost <= limit {
                used += cost;
                result.push(request.streams.clone());
            } else if used < limit {
                used += 1;
                result.push(Self::reduced(&request.streams));
            } else {
                debug!(
                    "[Optimizer] Consumer limit {} reached, {} of {} requests satisfiable",
                    limit,
                    result.len(),
                    requests.len()
                );
                break;
            }
        }
        result
    }
}

/// Parser for the NVOD service list of a source.
pub trait ServiceParser: Send {
    fn service_map(&self) -> Option<Vec<ServiceInformation>>;

    fn disable(&mut self);
}

pub trait ServiceParserFactory: Send + Sync {
    fn start(&self, profile: &Profile, source: SourceIdentifier) -> Result<Box<dyn ServiceParser>, DeviceError>;
}

/// Profile storage and hardware instantiation.
pub trait ProfileStore: Send + Sync {
    fn find_profile(&self, name: &str) -> Option<Profile>;

    fn open_hardware(&self, profile: &Profile) -> Result<Box<dyn Hardware>, DeviceError>;

    fn save_profile(&self, profile: &Profile) -> Result<(), DeviceError>;
}

/// A running transponder scan.
pub trait TransponderScanner: Send {
    fn start(&mut self) -> Result<(), DeviceError>;

    fn abort(&mut self);

    fn is_done(&self) -> bool;

    fn total_locations(&self) -> usize;

    /// 1-based index of the location being scanned.
    fn current_location(&self) -> usize;

    fn current_location_group(&self) -> usize;

    fn current_location_groups_pending(&self) -> usize;

    /// Sources found per location.
    fn sources_found(&mut self) -> Vec<u32>;

    /// Write the scan result into the profile.
    fn update_profile(&mut self, profile: &mut Profile) -> Result<(), DeviceError>;
}

pub trait ScannerFactory: Send + Sync {
    fn create(&self, profile: &Profile) -> Result<Box<dyn TransponderScanner>, DeviceError>;
}

/// Everything the card server needs besides the hardware itself.
#[derive(Clone)]
pub struct DeviceEnvironment {
    pub profiles: Arc<dyn ProfileStore>,
    pub service_parsers: Arc<dyn ServiceParserFactory>,
    pub scanners: Arc<dyn ScannerFactory>,
}

/// Opened hardware together with its action pipelines.
pub struct Device {
    hardware: Box<dyn Hardware>,
    pipelines: DevicePipelines,
    current_decryption: Option<Vec<SourceIdentifier>>,
}

impl Device {
    pub fn new(hardware: Box<dyn Hardware>) -> Self {
        Self {
            hardware,
            pipelines: DevicePipelines::new(),
            current_decryption: None,
        }
    }

    pub fn hardware(&self) -> &dyn Hardware {
        self.hardware.as_ref()
    }

    pub fn hardware_mut(&mut self) -> &mut dyn Hardware {
        self.hardware.as_mut()
    }

    pub fn pipelines_mut(&mut self) -> &mut DevicePipelines {
        &mut self.pipelines
    }

    pub fn current_group(&self) -> Option<GroupKey> {
        self.hardware.current_group()
    }

    /// Tune through the tune pipeline.
    pub fn select_group(&mut self, group: Option<&GroupKey>) -> Result<(), DeviceError> {
        let mut token = TuneToken::new(group.cloned());
        self.pipelines.tune.execute(&mut token, self.hardware.as_mut())?;
        if group.is_none() {
            self.current_decryption = None;
        }
        Ok(())
    }

    /// Decrypt exactly the given sources; an unchanged list is skipped.
    pub fn decrypt(&mut self, sources: &[SourceIdentifier]) -> Result<(), DeviceError> {
        if self.current_decryption.as_deref() == Some(sources) {
            return Ok(());
        }
        self.apply_decryption(sources.to_vec())
    }

    /// Re-send the current decryption list, e.g. after a CAM hiccup.
    pub fn reset_decryption(&mut self) -> Result<(), DeviceError> {
        let sources = self.current_decryption.take().unwrap_or_default();
        self.apply_decryption(sources)
    }

    fn apply_decryption(&mut self, sources: Vec<SourceIdentifier>) -> Result<(), DeviceError> {
        if self.pipelines.decrypt.is_empty() {
            if !sources.is_empty() {
                return Err(DeviceError::DecryptionUnsupported);
            }
        } else {
            let mut token = DecryptToken::new(sources.clone());
            self.pipelines.decrypt.execute(&mut token, self.hardware.as_mut())?;
        }
        self.current_decryption = Some(sources);
        Ok(())
    }

    /// Run the signal pipeline.
    pub fn signal(&mut self) -> Result<SignalInformation, DeviceError> {
        let mut token = SignalToken::new(self.hardware.signal_status());
        self.pipelines.signal.execute(&mut token, self.hardware.as_mut())?;
        Ok(token.information)
    }

    /// Terminate all pipelines and detach.
    pub fn close(&mut self) {
        self.pipelines.terminate();
        if let Err(e) = self.hardware.tune(None) {
            warn!("[Device] Failed to detach on close: {}", e);
        }
        self.current_decryption = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, streams: StreamSelection) -> SelectionRequest {
        SelectionRequest {
            selection: SourceSelection::parse(key).unwrap(),
            streams,
        }
    }

    #[test]
    fn test_unlimited_optimizer_passes_everything() {
        let optimizer = CappedOptimizer::new(None);
        let requests = vec![
            request("(1, 1, 1)@G@L@P", StreamSelection::everything()),
            request("(1, 1, 2)@G@L@P", StreamSelection::default()),
        ];
        let result = optimizer.optimize(&requests);
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], StreamSelection::everything());
    }

    #[test]
    fn test_capped_optimizer_reduces_then_stops() {
        let optimizer = CappedOptimizer::new(Some(5));
        let requests = vec![
            request("(1, 1, 1)@G@L@P", StreamSelection::everything()),
            request("(1, 1, 2)@G@L@P", StreamSelection::everything()),
            request("(1, 1, 3)@G@L@P", StreamSelection::default()),
        ];
        let result = optimizer.optimize(&requests);
        assert_eq!(result.len(), 2);
        assert_eq!(CappedOptimizer::cost(&result[0]), 4);
        assert!(!result[1].program_guide);
        assert_eq!(result[1].subtitles, LanguageSelection::default());
    }

    #[test]
    fn test_device_error_to_fault() {
        let fault: CardServerFault = DeviceError::ProfileNotFound("X".into()).into();
        assert_eq!(fault.kind, FaultKind::ProfileNotFound);
        let fault: CardServerFault = DeviceError::DecryptionUnsupported.into();
        assert_eq!(fault.kind, FaultKind::Device);
    }
}
