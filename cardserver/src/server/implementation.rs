//! Front of a card server: validation, the busy flag and one-shot results.
//!
//! Every `begin_*` call validates its arguments on the caller's thread,
//! rejects the request with `ServerBusy` while a previous one is still
//! outstanding and otherwise hands it to the backend together with a
//! [`Completion`]. The caller gets an [`AsyncHandle`] right away.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use parking_lot::{Condvar, Mutex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use cardserver_protocol::{
    CardServerFault, EpgExtensions, ExtensionPayload, FaultKind, ProgramGuideItem, ReceiveInformation, Request,
    ResponseData, ServerInformation, SourceIdentifier, SourceSelection, StreamInformation,
};

/// Result of one request.
pub type Outcome = Result<ResponseData, CardServerFault>;

type Finalizer = Box<dyn FnOnce(&ResponseData) + Send>;

/// Executes requests on behalf of a [`ServerImplementation`].
pub trait ServerBackend: Send {
    /// Start a request. The backend must eventually complete or drop the completion.
    fn submit(&mut self, request: Request, completion: Completion);

    /// True if an extension with this identity has already been transferred.
    fn is_extension_cached(&self, _identity: &str) -> bool {
        false
    }

    fn cache_extension(&mut self, _identity: &str) {}

    /// Stop all activity; must be idempotent.
    fn shutdown(&mut self);
}

/// Where a [`Completion`] leaves its outcome for the [`AsyncHandle`].
struct ResultSlot {
    outcome: Mutex<Option<Outcome>>,
    ready: Condvar,
    notify: Notify,
}

impl ResultSlot {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            ready: Condvar::new(),
            notify: Notify::new(),
        })
    }

    fn fill(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.ready.notify_all();
        self.notify.notify_one();
    }

    fn take(&self) -> Option<Outcome> {
        self.outcome.lock().take()
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(outcome) = outcome.take() {
                return outcome;
            }
            self.ready.wait(&mut outcome);
        }
    }

    fn wait_for(&self, timeout: Duration) -> Option<Outcome> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.ready.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.take()
    }

    async fn wait_async(&self) -> Outcome {
        loop {
            // register before looking so a fill in between is not missed
            let notified = self.notify.notified();
            if let Some(outcome) = self.take() {
                return outcome;
            }
            notified.await;
        }
    }
}

/// Completes exactly one request.
///
/// Dropping an unfinished completion reports an `Abandoned` fault.
pub struct Completion {
    slot: Option<Arc<ResultSlot>>,
    busy: Arc<AtomicBool>,
    finalizer: Option<Finalizer>,
}

impl Completion {
    fn new(slot: Arc<ResultSlot>, busy: Arc<AtomicBool>, finalizer: Option<Finalizer>) -> Self {
        Self {
            slot: Some(slot),
            busy,
            finalizer,
        }
    }

    pub fn complete(mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: Outcome) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        if let (Ok(data), Some(finalizer)) = (&outcome, self.finalizer.take()) {
            finalizer(data);
        }

        self.busy.store(false, Ordering::SeqCst);
        slot.fill(outcome);
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if self.slot.is_some() {
            self.finish(Err(CardServerFault::new(
                FaultKind::Abandoned,
                "request was dropped without a result",
            )));
        }
    }
}

/// Conversion of response data into the typed result of a request.
pub trait FromResponse: Sized {
    fn from_response(data: ResponseData) -> Result<Self, CardServerFault>;
}

fn unexpected(data: &ResponseData, expected: &str) -> CardServerFault {
    CardServerFault::protocol(format!("expected {} in response, got {:?}", expected, data))
}

impl FromResponse for () {
    fn from_response(data: ResponseData) -> Result<Self, CardServerFault> {
        match data {
            ResponseData::None => Ok(()),
            other => Err(unexpected(&other, "no data")),
        }
    }
}

impl FromResponse for Vec<StreamInformation> {
    fn from_response(data: ResponseData) -> Result<Self, CardServerFault> {
        match data {
            ResponseData::Streams(streams) => Ok(streams),
            other => Err(unexpected(&other, "streams")),
        }
    }
}

impl FromResponse for ServerInformation {
    fn from_response(data: ResponseData) -> Result<Self, CardServerFault> {
        match data {
            ResponseData::State(state) => Ok(state),
            other => Err(unexpected(&other, "server state")),
        }
    }
}

impl FromResponse for Vec<ProgramGuideItem> {
    fn from_response(data: ResponseData) -> Result<Self, CardServerFault> {
        match data {
            ResponseData::Guide(items) => Ok(items),
            other => Err(unexpected(&other, "program guide")),
        }
    }
}

fn custom_output<O: DeserializeOwned>(data: ResponseData) -> Result<O, CardServerFault> {
    match data {
        ResponseData::Custom(value) => serde_json::from_value(value)
            .map_err(|e| CardServerFault::protocol(format!("invalid custom action output: {}", e))),
        other => Err(unexpected(&other, "custom action output")),
    }
}

enum HandleState {
    Pending(Arc<ResultSlot>),
    Completed(Outcome),
    Consumed,
}

/// Handle to the result of one request.
pub struct AsyncHandle<T> {
    state: HandleState,
    convert: fn(ResponseData) -> Result<T, CardServerFault>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> AsyncHandle<T> {
    fn new(slot: Arc<ResultSlot>, convert: fn(ResponseData) -> Result<T, CardServerFault>) -> Self {
        Self {
            state: HandleState::Pending(slot),
            convert,
            _marker: PhantomData,
        }
    }

    /// Non-blocking completion check.
    pub fn is_completed(&mut self) -> bool {
        let outcome = match &self.state {
            HandleState::Pending(slot) => slot.take(),
            HandleState::Completed(_) | HandleState::Consumed => return true,
        };
        self.store(outcome)
    }

    /// Wait up to `timeout`; returns true if the request completed.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        let outcome = match &self.state {
            HandleState::Pending(slot) => slot.wait_for(timeout),
            HandleState::Completed(_) | HandleState::Consumed => return true,
        };
        self.store(outcome)
    }

    fn store(&mut self, outcome: Option<Outcome>) -> bool {
        match outcome {
            Some(outcome) => {
                self.state = HandleState::Completed(outcome);
                true
            }
            None => false,
        }
    }

    /// Block until the request completes and take its result.
    ///
    /// Blocks the calling thread; use [`Self::result_async`] from async code.
    pub fn result(&mut self) -> Result<T, CardServerFault> {
        if let HandleState::Pending(slot) = &self.state {
            let outcome = slot.wait();
            self.state = HandleState::Completed(outcome);
        }
        self.take()
    }

    pub async fn result_async(&mut self) -> Result<T, CardServerFault> {
        if let HandleState::Pending(slot) = &self.state {
            let slot = slot.clone();
            let outcome = slot.wait_async().await;
            self.state = HandleState::Completed(outcome);
        }
        self.take()
    }

    fn take(&mut self) -> Result<T, CardServerFault> {
        match std::mem::replace(&mut self.state, HandleState::Consumed) {
            HandleState::Completed(outcome) => outcome.and_then(self.convert),
            HandleState::Consumed => Err(CardServerFault::new(
                FaultKind::ResultConsumed,
                "the result of this request has already been retrieved",
            )),
            HandleState::Pending(slot) => {
                self.state = HandleState::Pending(slot);
                Err(CardServerFault::busy())
            }
        }
    }
}

/// A card server as seen by its callers.
pub struct ServerImplementation {
    busy: Arc<AtomicBool>,
    profile: Arc<Mutex<Option<String>>>,
    backend: Mutex<Box<dyn ServerBackend>>,
}

impl ServerImplementation {
    pub fn new(backend: Box<dyn ServerBackend>) -> Self {
        Self {
            busy: Arc::new(AtomicBool::new(false)),
            profile: Arc::new(Mutex::new(None)),
            backend: Mutex::new(backend),
        }
    }

    /// Name of the attached profile.
    pub fn profile(&self) -> Option<String> {
        self.profile.lock().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn require_profile(&self) -> Result<String, CardServerFault> {
        self.profile()
            .ok_or_else(|| CardServerFault::new(FaultKind::ProfileNotAttached, "no profile attached"))
    }

    fn check_selection(&self, key: &str) -> Result<SourceSelection, CardServerFault> {
        let profile = self.require_profile()?;
        let selection = SourceSelection::parse(key)?;
        if !selection.matches_profile(Some(&profile)) {
            return Err(CardServerFault::new(
                FaultKind::ProfileMismatch,
                format!(
                    "selection {} does not belong to profile {}",
                    key,
                    profile
                ),
            ));
        }
        Ok(selection)
    }

    fn start<T>(
        &self,
        request: Request,
        convert: fn(ResponseData) -> Result<T, CardServerFault>,
        finalizer: Option<Finalizer>,
    ) -> Result<AsyncHandle<T>, CardServerFault> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CardServerFault::busy());
        }

        debug!("[Server] Starting {}", request.name());
        let slot = ResultSlot::new();
        let completion = Completion::new(slot.clone(), self.busy.clone(), finalizer);
        self.backend.lock().submit(request, completion);

        Ok(AsyncHandle::new(slot, convert))
    }

    pub fn begin_attach_profile(
        &self,
        profile: &str,
        reset: bool,
        disable_pcr_from_h264: bool,
        disable_pcr_from_mpeg2: bool,
    ) -> Result<AsyncHandle<()>, CardServerFault> {
        if profile.is_empty() {
            return Err(CardServerFault::validation("profile name must not be empty"));
        }
        if let Some(attached) = self.profile() {
            return Err(CardServerFault::new(
                FaultKind::ProfileAlreadyAttached,
                format!("profile {} is already attached", attached),
            ));
        }

        let name = profile.to_string();
        let slot = self.profile.clone();
        let finalizer: Finalizer = Box::new(move |_| *slot.lock() = Some(name));

        self.start(
            Request::AttachProfile {
                profile: profile.to_string(),
                reset,
                disable_pcr_from_h264,
                disable_pcr_from_mpeg2,
            },
            <()>::from_response,
            Some(finalizer),
        )
    }

    pub fn begin_select(&self, selection_key: &str) -> Result<AsyncHandle<()>, CardServerFault> {
        self.check_selection(selection_key)?;
        self.start(
            Request::Select {
                selection_key: selection_key.to_string(),
            },
            <()>::from_response,
            None,
        )
    }

    pub fn begin_add_sources(
        &self,
        sources: Vec<ReceiveInformation>,
    ) -> Result<AsyncHandle<Vec<StreamInformation>>, CardServerFault> {
        if sources.is_empty() {
            return Err(CardServerFault::validation("at least one source is required"));
        }
        for (index, source) in sources.iter().enumerate() {
            let selection = self.check_selection(&source.selection_key)?;
            if selection.source.is_none() {
                return Err(CardServerFault::validation(format!(
                    "sources[{}] does not address a source: {}",
                    index, source.selection_key
                )));
            }
        }

        self.start(
            Request::AddSources { sources },
            Vec::<StreamInformation>::from_response,
            None,
        )
    }

    pub fn begin_remove_source(
        &self,
        source: SourceIdentifier,
        unique_identifier: Uuid,
    ) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(
            Request::RemoveSource {
                source,
                unique_identifier,
            },
            <()>::from_response,
            None,
        )
    }

    pub fn begin_remove_all_sources(&self) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(Request::RemoveAllSources, <()>::from_response, None)
    }

    pub fn begin_set_stream_target(
        &self,
        source: SourceIdentifier,
        unique_identifier: Uuid,
        target: Option<&str>,
    ) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(
            Request::SetStreamTarget {
                source,
                unique_identifier,
                target: target.map(str::to_string),
            },
            <()>::from_response,
            None,
        )
    }

    pub fn begin_set_zapping_source(
        &self,
        selection_key: &str,
        target: &str,
    ) -> Result<AsyncHandle<ServerInformation>, CardServerFault> {
        if selection_key.is_empty() {
            return Err(CardServerFault::validation("selection key must not be empty"));
        }
        if target.is_empty() {
            return Err(CardServerFault::validation("zapping target must not be empty"));
        }
        self.check_selection(selection_key)?;

        self.start(
            Request::SetZappingSource {
                selection_key: selection_key.to_string(),
                target: target.to_string(),
            },
            ServerInformation::from_response,
            None,
        )
    }

    pub fn begin_get_state(&self) -> Result<AsyncHandle<ServerInformation>, CardServerFault> {
        self.require_profile()?;
        self.start(Request::GetState, ServerInformation::from_response, None)
    }

    pub fn begin_start_scan(&self) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(Request::StartScan, <()>::from_response, None)
    }

    /// End the scan; `update_profile` as in [`Request::EndScan`].
    pub fn begin_end_scan(&self, update_profile: Option<bool>) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(Request::EndScan { update_profile }, <()>::from_response, None)
    }

    pub fn begin_start_epg_collection(
        &self,
        sources: Vec<SourceIdentifier>,
        extensions: EpgExtensions,
    ) -> Result<AsyncHandle<()>, CardServerFault> {
        self.require_profile()?;
        self.start(
            Request::StartEpgCollection { sources, extensions },
            <()>::from_response,
            None,
        )
    }

    pub fn begin_end_epg_collection(&self) -> Result<AsyncHandle<Vec<ProgramGuideItem>>, CardServerFault> {
        self.require_profile()?;
        self.start(
            Request::EndEpgCollection,
            Vec::<ProgramGuideItem>::from_response,
            None,
        )
    }

    pub fn begin_custom_action<I, O>(&self, action: &str, input: &I) -> Result<AsyncHandle<O>, CardServerFault>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        if action.is_empty() {
            return Err(CardServerFault::validation("action name must not be empty"));
        }
        self.require_profile()?;
        let input = serde_json::to_value(input)
            .map_err(|e| CardServerFault::validation(format!("invalid custom action input: {}", e)))?;

        self.start(
            Request::CustomAction {
                action: action.to_string(),
                input,
            },
            custom_output::<O>,
            None,
        )
    }

    pub fn begin_load_extensions(&self, payload: ExtensionPayload) -> Result<AsyncHandle<()>, CardServerFault> {
        payload.validate()?;
        self.require_profile()?;
        self.start(Request::LoadExtensions { payload }, <()>::from_response, None)
    }

    /// Transfer an extension unless the backend already has it, and wait for it.
    pub fn load_extension(&self, payload: &ExtensionPayload) -> Result<(), CardServerFault> {
        if self.backend.lock().is_extension_cached(&payload.identity) {
            return Ok(());
        }

        self.begin_load_extensions(payload.clone())?.result()?;
        self.backend.lock().cache_extension(&payload.identity);
        Ok(())
    }

    /// Stop the backend. Safe to call more than once.
    pub fn shutdown(&self) {
        self.backend.lock().shutdown();
    }
}

impl Drop for ServerImplementation {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Backend that hands every request to the test.
    struct ManualBackend {
        requests: mpsc::Sender<(Request, Completion)>,
        shutdowns: Arc<Mutex<usize>>,
    }

    impl ServerBackend for ManualBackend {
        fn submit(&mut self, request: Request, completion: Completion) {
            let _ = self.requests.send((request, completion));
        }

        fn shutdown(&mut self) {
            *self.shutdowns.lock() += 1;
        }
    }

    fn manual() -> (ServerImplementation, mpsc::Receiver<(Request, Completion)>, Arc<Mutex<usize>>) {
        let (tx, rx) = mpsc::channel();
        let shutdowns = Arc::new(Mutex::new(0));
        let server = ServerImplementation::new(Box::new(ManualBackend {
            requests: tx,
            shutdowns: shutdowns.clone(),
        }));
        (server, rx, shutdowns)
    }

    fn attached() -> (ServerImplementation, mpsc::Receiver<(Request, Completion)>) {
        let (server, rx, _) = manual();
        let mut handle = server.begin_attach_profile("DeviceA", false, false, false).unwrap();
        let (_, completion) = rx.recv().unwrap();
        completion.complete(Ok(ResponseData::None));
        handle.result().unwrap();
        (server, rx)
    }

    #[test]
    fn test_attach_records_profile_only_on_success() {
        let (server, rx, _) = manual();
        let mut handle = server.begin_attach_profile("DeviceA", false, false, false).unwrap();
        let (request, completion) = rx.recv().unwrap();
        assert!(matches!(request, Request::AttachProfile { .. }));
        completion.complete(Err(CardServerFault::new(FaultKind::ProfileNotFound, "missing")));
        assert_eq!(handle.result().unwrap_err().kind, FaultKind::ProfileNotFound);
        assert_eq!(server.profile(), None);

        let mut handle = server.begin_attach_profile("DeviceA", false, false, false).unwrap();
        rx.recv().unwrap().1.complete(Ok(ResponseData::None));
        handle.result().unwrap();
        assert_eq!(server.profile().as_deref(), Some("DeviceA"));

        let err = server.begin_attach_profile("DeviceB", false, false, false).err().unwrap();
        assert_eq!(err.kind, FaultKind::ProfileAlreadyAttached);
    }

    #[test]
    fn test_busy_rejects_second_request() {
        let (server, rx) = attached();
        let mut first = server.begin_get_state().unwrap();
        let second = server.begin_select("@G@L@DeviceA");
        assert_eq!(second.err().unwrap().kind, FaultKind::ServerBusy);
        assert!(!first.is_completed());

        let (_, completion) = rx.recv().unwrap();
        completion.complete(Ok(ResponseData::State(ServerInformation::default())));
        assert!(first.wait(Duration::from_secs(1)));
        assert_eq!(first.result().unwrap(), ServerInformation::default());
        assert!(!server.is_busy());
    }

    #[test]
    fn test_result_can_only_be_taken_once() {
        let (server, rx) = attached();
        let mut handle = server.begin_remove_all_sources().unwrap();
        rx.recv().unwrap().1.complete(Ok(ResponseData::None));
        handle.result().unwrap();
        assert_eq!(handle.result().unwrap_err().kind, FaultKind::ResultConsumed);
    }

    #[test]
    fn test_dropped_completion_is_abandoned() {
        let (server, rx) = attached();
        let mut handle = server.begin_start_scan().unwrap();
        drop(rx.recv().unwrap().1);
        assert_eq!(handle.result().unwrap_err().kind, FaultKind::Abandoned);
        assert!(!server.is_busy());
    }

    #[test]
    fn test_wait_times_out() {
        let (server, rx) = attached();
        let mut handle = server.begin_get_state().unwrap();
        assert!(!handle.wait(Duration::from_millis(20)));
        drop(rx);
        assert!(handle.wait(Duration::from_millis(20)));
    }

    #[test]
    fn test_wait_wakes_on_completion() {
        let (server, rx) = attached();
        let mut handle = server.begin_remove_all_sources().unwrap();
        let backend = std::thread::spawn(move || {
            let (_, completion) = rx.recv().unwrap();
            std::thread::sleep(Duration::from_millis(20));
            completion.complete(Ok(ResponseData::None));
        });

        let started = Instant::now();
        assert!(handle.wait(Duration::from_secs(10)));
        assert!(started.elapsed() < Duration::from_secs(10));
        handle.result().unwrap();
        backend.join().unwrap();
    }

    #[test]
    fn test_validation_happens_before_busy() {
        let (server, _rx, _) = manual();
        assert_eq!(server.begin_get_state().err().unwrap().kind, FaultKind::ProfileNotAttached);
        assert_eq!(
            server.begin_attach_profile("", false, false, false).err().unwrap().kind,
            FaultKind::Validation
        );
        assert!(!server.is_busy());
    }

    #[test]
    fn test_selection_must_match_profile() {
        let (server, _rx) = attached();
        let err = server.begin_select("@G@L@DeviceB").err().unwrap();
        assert_eq!(err.kind, FaultKind::ProfileMismatch);
        let err = server.begin_select("G/L").err().unwrap();
        assert_eq!(err.kind, FaultKind::Validation);
        let err = server.begin_add_sources(Vec::new()).err().unwrap();
        assert_eq!(err.kind, FaultKind::Validation);
        let err = server.begin_set_zapping_source("@G@L@DeviceA", "").err().unwrap();
        assert_eq!(err.kind, FaultKind::Validation);
        assert!(!server.is_busy());
    }

    #[test]
    fn test_wrong_response_shape() {
        let (server, rx) = attached();
        let mut handle = server.begin_get_state().unwrap();
        rx.recv().unwrap().1.complete(Ok(ResponseData::None));
        assert_eq!(handle.result().unwrap_err().kind, FaultKind::Protocol);
    }

    #[test]
    fn test_custom_action_output() {
        let (server, rx) = attached();
        let mut handle = server.begin_custom_action::<_, Vec<u32>>("sum", &(1, 2)).unwrap();
        let (request, completion) = rx.recv().unwrap();
        match request {
            Request::CustomAction { action, input } => {
                assert_eq!(action, "sum");
                assert_eq!(input, serde_json::json!([1, 2]));
            }
            other => panic!("unexpected request {:?}", other),
        }
        completion.complete(Ok(ResponseData::Custom(serde_json::json!([3]))));
        assert_eq!(handle.result().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_result_async() {
        let (server, rx) = tokio::task::spawn_blocking(attached).await.unwrap();
        let mut handle = server.begin_remove_all_sources().unwrap();
        let (_, completion) = rx.recv().unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            completion.complete(Ok(ResponseData::None));
        });
        handle.result_async().await.unwrap();
        assert_eq!(handle.result_async().await.unwrap_err().kind, FaultKind::ResultConsumed);
    }

    #[test]
    fn test_shutdown_on_drop() {
        let (server, _rx, shutdowns) = manual();
        server.shutdown();
        drop(server);
        assert_eq!(*shutdowns.lock(), 2);
    }
}
