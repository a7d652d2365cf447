//! Transponder scan bookkeeping.

use log::{info, warn};

use cardserver_protocol::{CardServerFault, FaultKind};

use crate::device::{DeviceEnvironment, DeviceError, Profile, TransponderScanner};

/// Progress is reported in per-mille.
pub const SCAN_COMPLETE: u32 = 1000;

/// Per-mille progress over all locations, interpolated by the groups of the
/// current location.
pub fn scan_progress(
    total_locations: usize,
    current_location: usize,
    current_group: usize,
    groups_pending: usize,
) -> u32 {
    if total_locations == 0 {
        return SCAN_COMPLETE;
    }

    let step = SCAN_COMPLETE as f64 / total_locations as f64;
    let mut progress = current_location.saturating_sub(1) as f64 * step;
    let groups = current_group + groups_pending;
    if groups > 0 {
        progress += step * current_group as f64 / groups as f64;
    }
    progress as u32
}

/// A scan in progress.
pub struct ScanState {
    scanner: Box<dyn TransponderScanner>,
    progress: u32,
    source_count: u32,
    /// Set once the caller asked to end the scan; carries the profile update mode.
    end_requested: Option<Option<bool>>,
}

impl ScanState {
    /// Create and start a scanner for the profile.
    pub fn start(environment: &DeviceEnvironment, profile: &Profile) -> Result<Self, CardServerFault> {
        if let Some(borrowed) = profile.use_sources_from.as_deref().filter(|p| !p.is_empty()) {
            return Err(CardServerFault::new(
                FaultKind::NoSourceList,
                format!("profile {} uses the sources of {}", profile.name, borrowed),
            ));
        }

        let mut scanner = environment.scanners.create(profile)?;
        scanner.start()?;
        info!("[Scan] Started for {}", profile.name);

        Ok(Self {
            scanner,
            progress: 0,
            source_count: 0,
            end_requested: None,
        })
    }

    pub fn progress(&self) -> u32 {
        self.progress
    }

    pub fn source_count(&self) -> u32 {
        self.source_count
    }

    pub fn is_ending(&self) -> bool {
        self.end_requested.is_some()
    }

    /// Sample the scanner.
    pub fn update(&mut self) {
        self.source_count = self.scanner.sources_found().iter().sum();
        self.progress = scan_progress(
            self.scanner.total_locations(),
            self.scanner.current_location(),
            self.scanner.current_location_group(),
            self.scanner.current_location_groups_pending(),
        );
    }

    /// Ask the scanner to stop; the scan ends once it reports done.
    pub fn request_end(&mut self, update_profile: Option<bool>) -> Result<(), CardServerFault> {
        if self.end_requested.is_some() {
            return Err(scan_not_active());
        }
        self.scanner.abort();
        self.end_requested = Some(update_profile);
        Ok(())
    }

    /// True once an end was requested and the scanner has stopped.
    pub fn is_finished(&self) -> bool {
        self.end_requested.is_some() && self.scanner.is_done()
    }

    /// Apply the scan result to the profile.
    ///
    /// `Some(false)` replaces the known locations, `Some(true)` merges into
    /// them and `None` discards the result.
    pub fn finish(mut self, profile: &mut Profile, environment: &DeviceEnvironment) -> Result<(), DeviceError> {
        let Some(update_profile) = self.end_requested.flatten() else {
            info!("[Scan] Finished for {} without profile update", profile.name);
            return Ok(());
        };

        if !update_profile {
            // sources belong to their locations
            profile.locations.clear();
            profile.sources.clear();
        }

        self.scanner.update_profile(profile)?;
        environment.profiles.save_profile(profile)?;
        info!(
            "[Scan] Finished for {}: {} locations, {} sources",
            profile.name,
            profile.locations.len(),
            profile.sources.len()
        );
        Ok(())
    }

    /// Stop without touching the profile.
    pub fn abandon(mut self) {
        warn!("[Scan] Abandoning running scan");
        self.scanner.abort();
    }
}

pub(crate) fn scan_active() -> CardServerFault {
    CardServerFault::new(FaultKind::ScanActive, "a source scan is active")
}

pub(crate) fn scan_not_active() -> CardServerFault {
    CardServerFault::new(FaultKind::ScanNotActive, "no source scan is active")
}
