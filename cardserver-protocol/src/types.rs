//! Data model shared by the card server, its clients and the remote host.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CardServerFault, FaultKind};

/// Identifies a single broadcast service (a "source").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct SourceIdentifier {
    /// Original network id.
    pub network: u16,
    /// Transport stream id.
    pub transport_stream: u16,
    /// Service id.
    pub service: u16,
}

impl SourceIdentifier {
    pub const fn new(network: u16, transport_stream: u16, service: u16) -> Self {
        Self {
            network,
            transport_stream,
            service,
        }
    }

    /// True if all three parts are zero.
    pub fn is_empty(&self) -> bool {
        self.network == 0 && self.transport_stream == 0 && self.service == 0
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.network, self.transport_stream, self.service)
    }
}

impl FromStr for SourceIdentifier {
    type Err = CardServerFault;

    /// Parse the `(N, T, S)` form.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || CardServerFault::validation(format!("invalid source identifier: {:?}", text));

        let inner = text
            .strip_prefix('(')
            .and_then(|t| t.strip_suffix(')'))
            .ok_or_else(invalid)?;

        let mut parts = inner.split(',').map(|p| p.trim().parse::<u16>());
        let (Some(Ok(network)), Some(Ok(transport_stream)), Some(Ok(service)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        Ok(Self::new(network, transport_stream, service))
    }
}

/// A transponder on a given location (dish, cable head end, antenna).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub location: String,
    pub group: String,
}

impl GroupKey {
    pub fn new(location: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.group, self.location)
    }
}

/// A source (or a whole transponder) as seen through one device profile.
///
/// The textual selection key has the form `source@group@location@profile`.
/// The source part may be empty to address a transponder only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceSelection {
    pub source: Option<SourceIdentifier>,
    pub group: String,
    pub location: String,
    pub profile_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

impl SourceSelection {
    /// Parse a selection key.
    pub fn parse(key: &str) -> Result<Self, CardServerFault> {
        if key.is_empty() {
            return Err(CardServerFault::validation("selection key must not be empty"));
        }

        let parts: Vec<&str> = key.split('@').collect();
        if parts.len() != 4 {
            return Err(CardServerFault::validation(format!(
                "selection key must have 4 parts, got {}: {:?}",
                parts.len(),
                key
            )));
        }

        let source = if parts[0].is_empty() {
            None
        } else {
            Some(parts[0].parse::<SourceIdentifier>()?)
        };

        Ok(Self {
            source,
            group: parts[1].to_string(),
            location: parts[2].to_string(),
            profile_name: (!parts[3].is_empty()).then(|| parts[3].to_string()),
            display_name: None,
        })
    }

    /// Build the selection key.
    pub fn selection_key(&self) -> String {
        format!(
            "{}@{}@{}@{}",
            self.source.map(|s| s.to_string()).unwrap_or_default(),
            self.group,
            self.location,
            self.profile_name.as_deref().unwrap_or("")
        )
    }

    /// The transponder this selection lives on.
    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(&self.location, &self.group)
    }

    /// Check whether this selection belongs to the given profile (case insensitive).
    pub fn matches_profile(&self, profile: Option<&str>) -> bool {
        match (profile, self.profile_name.as_deref()) {
            (Some(attached), Some(requested)) if !attached.is_empty() => {
                attached.eq_ignore_ascii_case(requested)
            }
            _ => false,
        }
    }
}

impl fmt::Display for SourceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.selection_key())
    }
}

/// How to pick audio or subtitle tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LanguageMode {
    /// Only the primary track.
    #[default]
    Primary,
    /// Every available track.
    All,
    /// Only the listed languages.
    Selection,
}

/// Language selection for one kind of track.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct LanguageSelection {
    pub mode: LanguageMode,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl LanguageSelection {
    pub fn all() -> Self {
        Self {
            mode: LanguageMode::All,
            languages: Vec::new(),
        }
    }

    /// Number of tracks requested when `available` tracks exist.
    pub fn requested_tracks(&self, available: usize) -> usize {
        match self.mode {
            LanguageMode::Primary => available.min(1),
            LanguageMode::All => available,
            LanguageMode::Selection => self.languages.len().min(available),
        }
    }
}

/// The elementary streams requested for a source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct StreamSelection {
    pub mp2_tracks: LanguageSelection,
    pub ac3_tracks: LanguageSelection,
    pub subtitles: LanguageSelection,
    pub program_guide: bool,
    pub videotext: bool,
}

impl StreamSelection {
    /// Everything the source has to offer.
    pub fn everything() -> Self {
        Self {
            mp2_tracks: LanguageSelection::all(),
            ac3_tracks: LanguageSelection::all(),
            subtitles: LanguageSelection::all(),
            program_guide: true,
            videotext: true,
        }
    }
}

/// A request to receive one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiveInformation {
    pub selection_key: String,
    /// Correlation id, nil for the default receiver.
    #[serde(default)]
    pub unique_identifier: Uuid,
    pub streams: StreamSelection,
    #[serde(default)]
    pub recording_path: Option<String>,
}

impl ReceiveInformation {
    pub fn new(selection_key: impl Into<String>, streams: StreamSelection) -> Self {
        Self {
            selection_key: selection_key.into(),
            unique_identifier: Uuid::nil(),
            streams,
            recording_path: None,
        }
    }

    pub fn with_identifier(mut self, unique_identifier: Uuid) -> Self {
        self.unique_identifier = unique_identifier;
        self
    }

    pub fn with_recording_path(mut self, path: impl Into<String>) -> Self {
        self.recording_path = Some(path.into());
        self
    }
}

/// One file written by a stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInformation {
    pub path: String,
    pub video_type: Option<String>,
}

/// Snapshot of an active stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamInformation {
    pub source: SourceIdentifier,
    pub unique_identifier: Uuid,
    pub streams: Option<StreamSelection>,
    pub is_decrypting: bool,
    pub current_audio_video_bytes: u64,
    pub bytes_received: u64,
    pub consumer_count: u32,
    pub stream_target: Option<String>,
    pub all_files: Vec<FileInformation>,
    pub target_path: Option<String>,
}

/// An NVOD service detected on the current transponder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInformation {
    pub service: SourceIdentifier,
    pub unique_name: String,
}

/// Signal status of the tuner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SignalInformation {
    pub locked: bool,
    pub strength: Option<f64>,
    pub quality: Option<f64>,
}

/// Snapshot of the whole session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServerInformation {
    /// Selection key of the current transponder (no source part).
    pub selection: Option<String>,
    pub has_group_information: bool,
    /// Guide collection progress in `0.0..=1.0` while active.
    pub program_guide_progress: Option<f64>,
    pub current_program_guide_items: u32,
    /// Scan progress in `0.0..=1.0` while active.
    pub update_progress: Option<f64>,
    pub update_source_count: u32,
    pub streams: Vec<StreamInformation>,
    pub services: Vec<ServiceInformation>,
    pub signal: Option<SignalInformation>,
}

impl ServerInformation {
    /// Find the stream snapshot for a source and correlation id.
    pub fn find_stream(&self, source: &SourceIdentifier, unique_identifier: Uuid) -> Option<&StreamInformation> {
        self.streams
            .iter()
            .find(|s| s.source == *source && s.unique_identifier == unique_identifier)
    }
}

/// A single guide entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramGuideItem {
    pub source: SourceIdentifier,
    pub identifier: u32,
    pub start: DateTime<Utc>,
    /// Duration in seconds.
    pub duration: u32,
    pub name: String,
    pub description: String,
    pub short_description: String,
    pub language: String,
    pub ratings: Vec<String>,
    pub content: Vec<String>,
}

impl ProgramGuideItem {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration as i64)
    }
}

/// Additional guide tables to collect besides the standard EIT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct EpgExtensions(u32);

impl EpgExtensions {
    pub const NONE: Self = Self(0);
    pub const PREMIERE_DIRECT: Self = Self(0x0001);
    pub const PREMIERE_SPORT: Self = Self(0x0002);
    pub const FREESAT_UK: Self = Self(0x0004);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for EpgExtensions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Transferable extension code, addressed by a factory registered on the worker side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionPayload {
    /// Unique identity; payloads are transferred once per identity.
    pub identity: String,
    /// Key of the extension factory that understands `data`.
    pub factory: String,
    pub data: Vec<u8>,
}

impl ExtensionPayload {
    pub fn new(identity: impl Into<String>, factory: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            identity: identity.into(),
            factory: factory.into(),
            data,
        }
    }

    pub fn validate(&self) -> Result<(), CardServerFault> {
        if self.identity.is_empty() {
            return Err(CardServerFault::new(FaultKind::Validation, "extension identity must not be empty"));
        }
        if self.data.is_empty() {
            return Err(CardServerFault::new(FaultKind::Validation, "extension payload must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_identifier_text() {
        let source: SourceIdentifier = "(1, 1101,28106)".parse().unwrap();
        assert_eq!(source, SourceIdentifier::new(1, 1101, 28106));
        assert_eq!(source.to_string(), "(1, 1101, 28106)");

        assert!("1,2,3".parse::<SourceIdentifier>().is_err());
        assert!("(1, 2)".parse::<SourceIdentifier>().is_err());
        assert!("(1, 2, 3, 4)".parse::<SourceIdentifier>().is_err());
        assert!("(1, 2, 70000)".parse::<SourceIdentifier>().is_err());
    }

    #[test]
    fn test_selection_key() {
        let key = "(1, 1101, 28106)@11836000@19.2E@DeviceA";
        let selection = SourceSelection::parse(key).unwrap();
        assert_eq!(selection.source, Some(SourceIdentifier::new(1, 1101, 28106)));
        assert_eq!(selection.group_key(), GroupKey::new("19.2E", "11836000"));
        assert_eq!(selection.selection_key(), key);
        assert!(selection.matches_profile(Some("devicea")));
        assert!(!selection.matches_profile(Some("DeviceB")));
        assert!(!selection.matches_profile(None));
    }

    #[test]
    fn test_transponder_only_selection() {
        let selection = SourceSelection::parse("@TransponderX@110.0E@DeviceA").unwrap();
        assert_eq!(selection.source, None);
        assert_eq!(selection.group, "TransponderX");

        let no_profile = SourceSelection::parse("@TransponderX@110.0E@").unwrap();
        assert_eq!(no_profile.profile_name, None);
    }

    #[test]
    fn test_invalid_selection_key() {
        let err = SourceSelection::parse("DeviceA/110.0E/TransponderX").unwrap_err();
        assert_eq!(err.kind, FaultKind::Validation);
        assert!(SourceSelection::parse("").is_err());
    }

    #[test]
    fn test_epg_extensions() {
        let mut ext = EpgExtensions::PREMIERE_DIRECT | EpgExtensions::FREESAT_UK;
        assert!(ext.contains(EpgExtensions::FREESAT_UK));
        assert!(!ext.contains(EpgExtensions::PREMIERE_SPORT));
        ext.remove(EpgExtensions::FREESAT_UK);
        assert!(!ext.contains(EpgExtensions::FREESAT_UK));
        assert!(!ext.contains(EpgExtensions::NONE));
    }

    #[test]
    fn test_language_selection() {
        assert_eq!(LanguageSelection::default().requested_tracks(3), 1);
        assert_eq!(LanguageSelection::all().requested_tracks(3), 3);
        let sel = LanguageSelection {
            mode: LanguageMode::Selection,
            languages: vec!["deu".into(), "eng".into()],
        };
        assert_eq!(sel.requested_tracks(1), 1);
    }
}
