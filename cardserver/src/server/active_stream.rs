//! Supervision of a single received source.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use uuid::Uuid;

use cardserver_protocol::{SourceIdentifier, SourceSelection, StreamInformation, StreamSelection};

use crate::device::{Device, DeviceError, SelectionRequest, SourceStreamManager, StreamSelectionOptimizer};

/// Identifies an active stream: a source plus the caller's correlation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    pub unique_identifier: Uuid,
    pub source: SourceIdentifier,
}

impl StreamKey {
    pub fn new(unique_identifier: Uuid, source: SourceIdentifier) -> Self {
        Self {
            unique_identifier,
            source,
        }
    }
}

pub struct ActiveStream {
    key: StreamKey,
    manager: Option<Box<dyn SourceStreamManager>>,
    requested: StreamSelection,
    target_path: Option<String>,
    first_activation_done: bool,
    decryption_restarts: u32,
    last_retest: Option<Instant>,
}

impl ActiveStream {
    pub fn new(
        unique_identifier: Uuid,
        manager: Box<dyn SourceStreamManager>,
        requested: &StreamSelection,
        target_path: Option<String>,
    ) -> Self {
        Self {
            key: StreamKey::new(unique_identifier, manager.source()),
            manager: Some(manager),
            requested: requested.clone(),
            target_path,
            first_activation_done: false,
            decryption_restarts: 0,
            last_retest: None,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn requested(&self) -> &StreamSelection {
        &self.requested
    }

    pub fn first_activation_done(&self) -> bool {
        self.first_activation_done
    }

    pub fn decryption_restarts(&self) -> u32 {
        self.decryption_restarts
    }

    pub fn manager(&self) -> Option<&dyn SourceStreamManager> {
        self.manager.as_deref()
    }

    pub fn manager_mut(&mut self) -> Option<&mut (dyn SourceStreamManager + 'static)> {
        self.manager.as_deref_mut()
    }

    /// Stop the stream; the next refresh restarts it.
    pub fn close(&mut self) {
        if let Some(manager) = self.manager.as_mut() {
            manager.close_stream();
        }
    }

    /// Restart decryption if an encrypted stream delivers no data.
    ///
    /// `interval` of `None` disables the check. Returns true if a restart
    /// was issued.
    pub fn test_decryption(
        &mut self,
        device: &mut Device,
        interval: Option<Duration>,
        budget: u32,
    ) -> Result<bool, DeviceError> {
        let Some(manager) = self.manager.as_mut() else {
            return Ok(false);
        };

        if manager.consumer_count() < 1 {
            return Ok(false);
        }

        match manager.active_information() {
            Some(information) if information.is_encrypted => {}
            _ => return Ok(false),
        }

        if self.decryption_restarts >= budget {
            return Ok(false);
        }

        if manager.audio_video_bytes() > 0 {
            return Ok(false);
        }

        let (Some(interval), Some(started)) = (interval, manager.last_activation_time()) else {
            return Ok(false);
        };
        if started.elapsed() <= interval {
            return Ok(false);
        }

        self.decryption_restarts += 1;
        warn!(
            "[ActiveStream] No data from encrypted source {}, restarting decryption ({}/{})",
            self.key.source, self.decryption_restarts, budget
        );

        device.reset_decryption()?;
        manager.close_stream();
        Ok(true)
    }

    /// Re-run the optimizer for this single source whenever the stream is recreated.
    pub fn enable_optimizer(&mut self, selection: SourceSelection, optimizer: Arc<dyn StreamSelectionOptimizer>) {
        let Some(manager) = self.manager.as_mut() else {
            return;
        };

        let request = SelectionRequest {
            selection,
            streams: self.requested.clone(),
        };
        manager.set_recreate_handler(Some(Box::new(move |_information| {
            let mut streams = optimizer.optimize(std::slice::from_ref(&request));
            if streams.len() == 1 {
                streams.pop()
            } else {
                debug!("[ActiveStream] {} can not be recreated, consumer limit reached", request.selection);
                None
            }
        })));
    }

    /// Snapshot, or `None` once disposed.
    pub fn create_information(&self) -> Option<StreamInformation> {
        let manager = self.manager.as_ref()?;
        Some(StreamInformation {
            source: manager.source(),
            unique_identifier: self.key.unique_identifier,
            streams: manager.active_selection(),
            is_decrypting: manager.is_decrypting().unwrap_or(false),
            current_audio_video_bytes: manager.audio_video_bytes(),
            bytes_received: manager.bytes_received(),
            consumer_count: manager.consumer_count(),
            stream_target: manager.streaming_target(),
            all_files: manager.all_files(),
            target_path: self.target_path.clone(),
        })
    }

    pub fn is_program_guide_active(&self) -> Option<bool> {
        self.manager
            .as_ref()
            .and_then(|m| m.active_selection())
            .map(|selection| selection.program_guide)
    }

    /// True if the active source information says the source is scrambled.
    pub fn needs_decryption(&self) -> bool {
        self.manager
            .as_ref()
            .and_then(|m| m.active_information())
            .map(|information| information.is_encrypted)
            .unwrap_or(false)
    }

    /// Activate the stream or bring it in line with the current source information.
    pub fn refresh(&mut self, retest_interval: Duration, timeout: Duration) -> Result<(), DeviceError> {
        let Some(manager) = self.manager.as_mut() else {
            return Ok(());
        };

        let information = manager.current_information(timeout);

        if !self.first_activation_done {
            let Some(information) = information else {
                return Ok(());
            };
            self.first_activation_done = manager.create_stream(self.target_path.as_deref(), &information)?;
            if self.first_activation_done {
                info!("[ActiveStream] Started {} ({})", self.key.source, information.name);
            }
            return Ok(());
        }

        if information.is_none() {
            if let Some(last) = self.last_retest {
                if last.elapsed() < retest_interval {
                    return Ok(());
                }
            }
        }

        manager.retest_source_information(information.as_ref())?;
        self.last_retest = Some(Instant::now());
        Ok(())
    }

    /// Release the stream manager.
    pub fn dispose(&mut self) {
        if let Some(mut manager) = self.manager.take() {
            debug!("[ActiveStream] Disposing {}", self.key.source);
            manager.dispose();
        }
    }
}

impl Drop for ActiveStream {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::{SharedSimulation, SimulatedEnvironment, SimulatedHardware};
    use crate::device::{CappedOptimizer, Hardware, Profile};
    use proptest::prelude::*;

    const KEY: &str = "(1, 1101, 28106)@11836000@19.2E@DeviceA";

    fn setup() -> (SharedSimulation, Device, ActiveStream) {
        let selection = SourceSelection::parse(KEY).unwrap();
        let profile = Profile {
            name: "DeviceA".into(),
            sources: vec![selection.clone()],
            ..Default::default()
        };
        let sim = SimulatedEnvironment::new().with_profile(profile, None);
        let mut hardware = SimulatedHardware::new(sim.state());
        hardware.tune(Some(&selection.group_key())).unwrap();
        let manager = hardware.open_source(&selection, &StreamSelection::default()).unwrap();
        let stream = ActiveStream::new(Uuid::nil(), manager, &StreamSelection::default(), None);
        (sim.state(), Device::new(Box::new(hardware)), stream)
    }

    fn source() -> SourceIdentifier {
        SourceIdentifier::new(1, 1101, 28106)
    }

    #[test]
    fn test_refresh_waits_for_source_information() {
        let (state, _device, mut stream) = setup();
        state.lock().source_mut(&source()).unwrap().available = false;

        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        assert!(!stream.first_activation_done());

        state.lock().source_mut(&source()).unwrap().available = true;
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        assert!(stream.first_activation_done());
        assert_eq!(state.lock().streams_created[&source()], 1);
    }

    #[test]
    fn test_refresh_recreates_closed_stream() {
        let (state, _device, mut stream) = setup();
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        stream.close();
        assert_eq!(stream.is_program_guide_active(), None);

        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(state.lock().streams_created[&source()], 2);
        assert_eq!(stream.is_program_guide_active(), Some(false));
    }

    #[test]
    fn test_zero_consumers_never_restart_decryption() {
        let (state, mut device, mut stream) = setup();
        {
            let mut state = state.lock();
            let simulated = state.source_mut(&source()).unwrap();
            simulated.encrypted = true;
            simulated.payload = false;
            simulated.consumer_count = Some(0);
            state.activation_age = Duration::from_secs(2);
        }
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();

        for _ in 0..10 {
            assert!(!stream.test_decryption(&mut device, Some(Duration::ZERO), 3).unwrap());
        }
        assert_eq!(stream.decryption_restarts(), 0);
    }

    #[test]
    fn test_disabled_decryption_watchdog() {
        let (state, mut device, mut stream) = setup();
        {
            let mut state = state.lock();
            let simulated = state.source_mut(&source()).unwrap();
            simulated.encrypted = true;
            simulated.payload = false;
            state.activation_age = Duration::from_secs(2);
        }
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        assert!(!stream.test_decryption(&mut device, None, 3).unwrap());
    }

    #[test]
    fn test_dispose_releases_manager_once() {
        let (state, _device, mut stream) = setup();
        stream.dispose();
        assert!(stream.create_information().is_none());
        drop(stream);
        assert_eq!(state.lock().managers_disposed, vec![source()]);
    }

    #[test]
    fn test_optimizer_blocks_recreation() {
        let (state, _device, mut stream) = setup();
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        stream.enable_optimizer(SourceSelection::parse(KEY).unwrap(), Arc::new(CappedOptimizer::new(Some(0))));
        stream.close();
        stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
        assert_eq!(state.lock().streams_created[&source()], 1);
        assert_eq!(stream.create_information().unwrap().streams, None);
    }

    proptest! {
        #[test]
        fn test_decryption_restarts_stay_within_budget(cycles in 1usize..40, budget in 0u32..6) {
            let (state, mut device, mut stream) = setup();
            {
                let mut state = state.lock();
                let simulated = state.source_mut(&source()).unwrap();
                simulated.encrypted = true;
                simulated.payload = false;
                state.activation_age = Duration::from_secs(2);
            }
            stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();

            let mut fired = 0;
            for _ in 0..cycles {
                if stream.test_decryption(&mut device, Some(Duration::from_millis(10)), budget).unwrap() {
                    fired += 1;
                }
                stream.refresh(Duration::ZERO, Duration::ZERO).unwrap();
            }

            prop_assert!(fired <= budget as usize);
            prop_assert_eq!(fired, (budget as usize).min(cycles));
            prop_assert_eq!(stream.decryption_restarts() as usize, fired);
        }
    }
}
