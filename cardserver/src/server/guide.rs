//! Program guide collection.
//!
//! The collector walks all transponders carrying the requested sources, one
//! at a time, and keeps each tuned until no new items arrived for a while.
//! Items are keyed by source and start time so repeated table sections
//! overwrite each other.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};

use cardserver_protocol::{CardServerFault, EpgExtensions, FaultKind, GroupKey, ProgramGuideItem, SourceIdentifier};

use crate::config::GuideConfig;
use crate::device::{Device, DeviceError, EventDescriptor, GuideEvent, GuideTable, Profile};

/// Turn the descriptors of one event into a guide item.
///
/// Returns `None` for events without a name.
pub fn create_guide_item(event: &GuideEvent) -> Option<ProgramGuideItem> {
    let mut short_event: Option<(&str, &str, &str)> = None;
    let mut ratings: Option<&Vec<String>> = None;
    let mut extended = Vec::new();
    let mut content = BTreeSet::new();

    for descriptor in &event.descriptors {
        match descriptor {
            EventDescriptor::ShortEvent { language, name, text } => {
                short_event.get_or_insert((language.as_str(), name.as_str(), text.as_str()));
            }
            EventDescriptor::ParentalRating(values) => {
                ratings.get_or_insert(values);
            }
            EventDescriptor::ExtendedEvent { language, name, text } => extended.push((language, name, text)),
            EventDescriptor::Content(categories) => content.extend(categories.iter().cloned()),
        }
    }

    let mut name: Option<String> = None;
    let mut description: Option<String> = None;
    let mut language: Option<String> = None;
    let mut short_description = String::new();

    if !extended.is_empty() {
        let mut text = String::new();
        for (ext_language, ext_name, ext_text) in extended {
            if name.is_none() {
                name = ext_name.clone();
            }
            if language.is_none() {
                language = Some(ext_language.clone());
            }
            if let Some(ext_text) = ext_text {
                text.push_str(ext_text);
            }
        }
        description = Some(text);
    }

    if let Some((short_language, short_name, short_text)) = short_event {
        short_description = match (short_name.is_empty(), short_text.is_empty()) {
            (true, _) => short_text.to_string(),
            (false, true) => short_name.to_string(),
            (false, false) => format!("{} ({})", short_name, short_text),
        };
        name.get_or_insert_with(|| short_name.to_string());
        description.get_or_insert_with(|| short_text.to_string());
        language.get_or_insert_with(|| short_language.to_string());
    }

    let name = name.filter(|n| !n.is_empty())?;
    let description = description.filter(|d| !d.is_empty()).unwrap_or_else(|| "-".to_string());

    Some(ProgramGuideItem {
        source: event.source,
        identifier: event.identifier,
        start: event.start,
        duration: event.duration,
        name,
        description,
        short_description,
        language: language.unwrap_or_default(),
        ratings: ratings.cloned().unwrap_or_default(),
        content: content.into_iter().collect(),
    })
}

/// Sort the items of every source by start time and cut overlaps.
///
/// An item starting before the end of its predecessor is shortened to start
/// there, or dropped if it ends before.
pub fn merge_guide_items(items: BTreeMap<SourceIdentifier, BTreeMap<DateTime<Utc>, ProgramGuideItem>>) -> Vec<ProgramGuideItem> {
    let mut schedules = Vec::new();

    for list in items.into_values() {
        let mut allowed: Option<DateTime<Utc>> = None;
        for (start, mut item) in list {
            if let Some(allowed) = allowed {
                if start < allowed {
                    let end = item.end();
                    if end <= allowed {
                        continue;
                    }
                    item.duration = (end - allowed).num_seconds().max(0) as u32;
                    item.start = allowed;
                }
            }
            allowed = Some(item.end());
            schedules.push(item);
        }
    }

    schedules
}

/// Trigger source of an extension table.
fn parse_trigger(value: Option<&str>, name: &str) -> Option<SourceIdentifier> {
    let value = value?;
    match value.parse() {
        Ok(source) => Some(source),
        Err(e) => {
            warn!("[Guide] Ignoring invalid {} trigger {:?}: {}", name, value, e);
            None
        }
    }
}

/// A running program guide collection.
pub struct GuideCollector {
    config: GuideConfig,
    /// Sources whose standard events are kept.
    sources: BTreeSet<SourceIdentifier>,
    groups: BTreeSet<GroupKey>,
    pending: VecDeque<GroupKey>,
    extensions: EpgExtensions,
    /// Transponders carrying the extension tables.
    triggers: Vec<(GuideTable, BTreeSet<GroupKey>)>,
    last_item_check: Option<Instant>,
    last_tune: Option<Instant>,
    last_item_count: Option<usize>,
    items: BTreeMap<SourceIdentifier, BTreeMap<DateTime<Utc>, ProgramGuideItem>>,
    item_count: usize,
    sender: mpsc::Sender<GuideEvent>,
    receiver: mpsc::Receiver<GuideEvent>,
    progress: f64,
}

impl GuideCollector {
    /// Resolve sources and extensions into the transponders to visit.
    pub fn new(
        config: GuideConfig,
        profile: &Profile,
        sources: &[SourceIdentifier],
        mut extensions: EpgExtensions,
    ) -> Self {
        let mut groups = BTreeSet::new();
        let mut filter = BTreeSet::new();

        for source in sources {
            let selections = profile.find_source(source);
            if !selections.is_empty() {
                filter.insert(*source);
            }
            groups.extend(selections.iter().map(|s| s.group_key()));
        }

        let candidates = [
            (EpgExtensions::PREMIERE_DIRECT, GuideTable::PremiereDirect, config.premiere_direct_trigger.as_deref(), "PREMIERE Direct"),
            (EpgExtensions::PREMIERE_SPORT, GuideTable::PremiereSport, config.premiere_sport_trigger.as_deref(), "PREMIERE Sport"),
            (EpgExtensions::FREESAT_UK, GuideTable::FreeSat, Some(config.freesat_trigger.as_str()), "FreeSat"),
        ];

        let mut triggers = Vec::new();
        for (flag, table, trigger, name) in candidates {
            if !extensions.contains(flag) {
                continue;
            }
            let trigger_groups: BTreeSet<GroupKey> = parse_trigger(trigger, name)
                .map(|source| profile.find_source(&source).iter().map(|s| s.group_key()).collect())
                .unwrap_or_default();
            if trigger_groups.is_empty() {
                debug!("[Guide] No transponder for {} in profile {}, extension dropped", name, profile.name);
                extensions.remove(flag);
                continue;
            }
            groups.extend(trigger_groups.iter().cloned());
            triggers.push((table, trigger_groups));
        }

        let (sender, receiver) = mpsc::channel();
        info!(
            "[Guide] Collecting {} sources on {} transponders (extensions 0x{:x})",
            filter.len(),
            groups.len(),
            extensions.bits()
        );

        Self {
            config,
            sources: filter,
            pending: groups.iter().cloned().collect(),
            groups,
            extensions,
            triggers,
            last_item_check: None,
            last_tune: None,
            last_item_count: None,
            items: BTreeMap::new(),
            item_count: 0,
            sender,
            receiver,
            progress: 0.0,
        }
    }

    pub fn extensions(&self) -> EpgExtensions {
        self.extensions
    }

    pub fn progress(&self) -> f64 {
        self.progress
    }

    pub fn item_count(&mut self) -> usize {
        self.drain();
        self.item_count
    }

    fn drain(&mut self) {
        while let Ok(event) = self.receiver.try_recv() {
            self.add_event(event);
        }
    }

    fn add_event(&mut self, event: GuideEvent) {
        match event.table {
            GuideTable::Standard | GuideTable::FreeSat if !self.sources.contains(&event.source) => return,
            _ => {}
        }

        let Some(item) = create_guide_item(&event) else {
            return;
        };

        let list = self.items.entry(event.source).or_default();
        if list.insert(item.start, item).is_none() {
            self.item_count += 1;
        }
    }

    /// Advance the collection; called on every watchdog cycle.
    pub fn collect(&mut self, device: &mut Device) {
        if let Err(e) = self.try_collect(device) {
            warn!("[Guide] Collection step failed: {}", e);
        }
    }

    fn try_collect(&mut self, device: &mut Device) -> Result<(), DeviceError> {
        self.drain();

        if let Some(checked) = self.last_item_check {
            if checked.elapsed() >= self.config.item_check_interval() {
                if self.last_item_count == Some(self.item_count) {
                    self.last_tune = None;
                } else {
                    self.last_item_check = Some(Instant::now());
                    self.last_item_count = Some(self.item_count);
                }
            }
        }

        if let Some(tuned) = self.last_tune {
            if tuned.elapsed() < self.config.retune_interval() {
                return Ok(());
            }
        }

        device.hardware_mut().remove_program_guide_consumers();
        device.select_group(None)?;

        let total = self.groups.len();
        let left = self.pending.len();
        self.progress = if total < 1 {
            1.0
        } else {
            (total - left) as f64 / total as f64
        };

        let Some(next) = self.pending.pop_front() else {
            return Ok(());
        };

        device.select_group(Some(&next))?;
        if device
            .hardware_mut()
            .group_information(Duration::from_millis(self.config.tune_check_timeout_ms))
            .is_none()
        {
            debug!("[Guide] No data on {}, retrying later", next);
            self.pending.push_back(next);
            return Ok(());
        }

        info!("[Guide] Collecting on {} ({} transponders left)", next, self.pending.len());
        let hardware = device.hardware_mut();
        hardware.add_program_guide_consumer(GuideTable::Standard, self.sender.clone());
        for (table, groups) in &self.triggers {
            if groups.contains(&next) {
                hardware.add_program_guide_consumer(*table, self.sender.clone());
            }
        }

        self.last_tune = Some(Instant::now());
        self.last_item_check = Some(Instant::now());
        self.last_item_count = Some(self.item_count);
        Ok(())
    }

    /// Stop collecting and hand out the merged items.
    pub fn finish(mut self, device: &mut Device) -> Result<Vec<ProgramGuideItem>, DeviceError> {
        device.hardware_mut().remove_program_guide_consumers();
        device.select_group(None)?;
        self.drain();

        let items = merge_guide_items(std::mem::take(&mut self.items));
        info!("[Guide] Collection finished with {} items", items.len());
        Ok(items)
    }
}

pub(crate) fn guide_active() -> CardServerFault {
    CardServerFault::new(FaultKind::EpgActive, "program guide collection is active")
}

pub(crate) fn guide_not_active() -> CardServerFault {
    CardServerFault::new(FaultKind::EpgNotActive, "program guide collection is not active")
}
