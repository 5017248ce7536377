//! Session lifecycle across many stream pipelines

use super::health::HealthSummary;
use super::state::PipelineState;
use super::stream::StreamPipeline;
use super::types::StreamId;
use crate::config::{Config, PipelineSettings};
use crate::delivery::{DeliveryEvent, DeliveryHub, Dispatcher};
use crate::error::ErrorRecord;
use crate::media::{DefaultBackend, LocatorError, MediaBackend, SourceLocator};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SessionError {
    #[error("stream count {requested} is outside 1..={max}")]
    InvalidStreamCount { requested: usize, max: usize },
    #[error("invalid source for slot {slot}: {source}")]
    InvalidSource { slot: usize, source: LocatorError },
}

/// Grid position of one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub index: usize,
    pub stream: StreamId,
    pub source: String,
}

/// Per-stream snapshot for status output
#[derive(Debug, Clone)]
pub struct StreamReport {
    pub slot: Slot,
    pub state: PipelineState,
    pub health: HealthSummary,
}

/// Pipelines of the current session, in slot order
#[derive(Default)]
pub struct Registry {
    pipelines: Vec<StreamPipeline>,
    by_stream: HashMap<StreamId, usize>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    pub fn contains(&self, stream: StreamId) -> bool {
        self.by_stream.contains_key(&stream)
    }

    pub fn get(&self, stream: StreamId) -> Option<&StreamPipeline> {
        self.by_stream.get(&stream).map(|&i| &self.pipelines[i])
    }

    pub fn slot(&self, stream: StreamId) -> Option<Slot> {
        self.get(stream).map(slot_of)
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.pipelines.iter().map(slot_of).collect()
    }

    pub fn ids(&self) -> Vec<StreamId> {
        self.pipelines.iter().map(StreamPipeline::id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamPipeline> {
        self.pipelines.iter()
    }

    fn insert(&mut self, pipeline: StreamPipeline) {
        self.by_stream.insert(pipeline.id(), self.pipelines.len());
        self.pipelines.push(pipeline);
    }

    fn drain(&mut self) -> Vec<StreamPipeline> {
        self.by_stream.clear();
        std::mem::take(&mut self.pipelines)
    }
}

fn slot_of(pipeline: &StreamPipeline) -> Slot {
    Slot {
        index: pipeline.index(),
        stream: pipeline.id(),
        source: pipeline
            .source()
            .map(ToString::to_string)
            .unwrap_or_default(),
    }
}

/// Starts, tracks and stops every pipeline of a session
///
/// Only one session is active at a time; starting a new one stops the
/// previous. Stopped pipelines are kept in a retired list until their
/// workers have exited, so stopping never blocks on a stuck source.
pub struct Supervisor {
    backend: Arc<dyn MediaBackend>,
    settings: Arc<PipelineSettings>,
    hub: DeliveryHub,
    max_streams: usize,
    join_timeout: Duration,
    registry: Registry,
    retired: Vec<StreamPipeline>,
    session: u64,
    active: bool,
}

impl Supervisor {
    pub fn new(config: &Config, backend: Arc<dyn MediaBackend>) -> Self {
        Self {
            backend,
            settings: Arc::new(config.pipeline_settings()),
            hub: DeliveryHub::new(config.delivery.frame_depth),
            max_streams: config.limits.max_streams,
            join_timeout: config.stop_join_timeout(),
            registry: Registry::default(),
            retired: Vec::new(),
            session: 0,
            active: false,
        }
    }

    pub fn with_default_backend(config: &Config) -> Self {
        Self::new(config, Arc::new(DefaultBackend))
    }

    /// Consumer end of the delivery channel, valid across sessions
    pub fn dispatcher(&self) -> Dispatcher {
        self.hub.dispatcher()
    }

    /// Open `stream_count` pipelines on the same address
    pub fn start_session(&mut self, address: &str, stream_count: usize) -> Result<u64, SessionError> {
        self.check_count(stream_count)?;
        let sources = vec![address; stream_count];
        self.start_sources(&sources)
    }

    /// Open one pipeline per source, slot order follows `sources`
    ///
    /// Every locator is validated before anything is stopped or started.
    pub fn start_sources(&mut self, sources: &[&str]) -> Result<u64, SessionError> {
        self.check_count(sources.len())?;
        for (slot, source) in sources.iter().enumerate() {
            SourceLocator::parse(source).map_err(|source| SessionError::InvalidSource { slot, source })?;
        }

        self.stop_session();
        self.session += 1;
        self.active = true;

        for (index, source) in sources.iter().enumerate() {
            let mut pipeline = StreamPipeline::new(index, self.backend.clone(), self.settings.clone(), &self.hub)
                .with_join_timeout(self.join_timeout);

            if let Err(err) = pipeline.start(source) {
                error!("Stream #{} could not start: {}", index, err);
                pipeline.mailbox().post_error(ErrorRecord::new(pipeline.id(), &err));
            }
            self.registry.insert(pipeline);
        }

        self.hub.announce(DeliveryEvent::SessionStarted {
            session: self.session,
            streams: self.registry.ids(),
        });
        self.reap();

        info!("Session {} started with {} streams", self.session, self.registry.len());
        Ok(self.session)
    }

    /// Stop every pipeline of the current session, returns false if none was active
    ///
    /// Mailboxes are detached immediately, so nothing of this session reaches
    /// the consumer after the stop event.
    pub fn stop_session(&mut self) -> bool {
        if !self.active {
            return false;
        }

        for mut pipeline in self.registry.drain() {
            pipeline.stop();
            self.hub.unregister(pipeline.id());
            self.retired.push(pipeline);
        }
        self.active = false;
        self.hub.announce(DeliveryEvent::SessionStopped {
            session: self.session,
        });
        self.reap();

        info!(
            "Session {} stopped, {} workers still exiting",
            self.session,
            self.retired.len()
        );
        true
    }

    /// Wait up to `timeout` for retired workers, returns true once all exited
    pub fn wait_retired(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        self.retired.retain_mut(|pipeline| {
            let remaining = deadline.saturating_duration_since(Instant::now());
            !pipeline.join_timeout(remaining)
        });
        self.retired.is_empty()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Id of the active session
    pub fn session_id(&self) -> Option<u64> {
        self.active.then_some(self.session)
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Workers of earlier sessions that have not exited yet
    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    /// State and health of every stream, in slot order
    pub fn health_summary(&self) -> Vec<StreamReport> {
        self.registry
            .iter()
            .map(|pipeline| StreamReport {
                slot: slot_of(pipeline),
                state: pipeline.state(),
                health: pipeline.health().summary(),
            })
            .collect()
    }

    fn check_count(&self, requested: usize) -> Result<(), SessionError> {
        if requested == 0 || requested > self.max_streams {
            return Err(SessionError::InvalidStreamCount {
                requested,
                max: self.max_streams,
            });
        }
        Ok(())
    }

    fn reap(&mut self) {
        self.retired
            .retain_mut(|pipeline| !pipeline.join_timeout(Duration::ZERO));
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_session();
        if !self.wait_retired(self.join_timeout) {
            warn!("{} stream workers did not exit in time", self.retired.len());
            self.retired.iter_mut().for_each(StreamPipeline::detach);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{FrameConsumer, SlotBoard};
    use crate::error::Stage;
    use crate::media::testing::{Script, ScriptedBackend, y4m_stream};
    use std::collections::HashSet;
    use std::thread;

    fn config() -> Config {
        let mut config = Config::default();
        config.network.open_backoff_ms = 5;
        config.network.max_backoff_ms = 10;
        config.network.open_retries = 0;
        config.delivery.frame_depth = 2;
        config
    }

    fn endless() -> Script {
        Script::Endless {
            width: 2,
            height: 2,
            interval: Duration::from_millis(2),
        }
    }

    fn wait_until(mut what: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !what() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_stream_count_bounds() {
        let mut supervisor = Supervisor::new(&config(), Arc::new(ScriptedBackend::new()));

        assert_eq!(
            supervisor.start_session("cam", 0),
            Err(SessionError::InvalidStreamCount { requested: 0, max: 49 })
        );
        assert!(matches!(
            supervisor.start_session("cam", 50),
            Err(SessionError::InvalidStreamCount { requested: 50, .. })
        ));
        assert!(matches!(
            supervisor.start_session("", 2),
            Err(SessionError::InvalidSource { slot: 0, .. })
        ));
        assert!(!supervisor.is_active());
        assert!(supervisor.dispatcher().try_next().is_none());
    }

    #[test]
    fn test_session_announces_unique_streams_once() {
        let backend = ScriptedBackend::new().with("cam", endless());
        let mut supervisor = Supervisor::new(&config(), Arc::new(backend));

        let session = supervisor.start_session("cam", 4).unwrap();
        assert_eq!(supervisor.session_id(), Some(session));

        let ids = supervisor.registry().ids();
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 4);
        let indices: Vec<usize> = supervisor.registry().slots().iter().map(|slot| slot.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);

        let dispatcher = supervisor.dispatcher();
        let mut started = 0;
        let deadline = Instant::now() + Duration::from_millis(200);
        while Instant::now() < deadline {
            if let Some(DeliveryEvent::SessionStarted { session: s, streams }) =
                dispatcher.next_timeout(Duration::from_millis(10))
            {
                assert_eq!(s, session);
                assert_eq!(streams, ids);
                started += 1;
            }
        }
        assert_eq!(started, 1);
    }

    #[test]
    fn test_failing_stream_does_not_affect_siblings() {
        let backend = ScriptedBackend::new()
            .with("good", endless())
            .with("broken", Script::Y4m(y4m_stream(2, 2, &[10], Some(1))));
        let mut supervisor = Supervisor::new(&config(), Arc::new(backend));
        supervisor.start_sources(&["good", "broken", "good"]).unwrap();

        let ids = supervisor.registry().ids();
        let mut board = SlotBoard::new();
        let dispatcher = supervisor.dispatcher();
        wait_until(|| {
            dispatcher.dispatch_timeout(&mut board, Duration::from_millis(5));
            board.slot_for(ids[0]).is_some_and(|slot| slot.frames >= 3)
                && board.slot_for(ids[2]).is_some_and(|slot| slot.frames >= 3)
                && board.failed_slots() == 1
        });

        let broken = board.slot_for(ids[1]).unwrap();
        assert_eq!(broken.error.as_ref().map(|e| e.stage), Some(Stage::Decode));
        assert_eq!(broken.frames, 1);

        let registry = supervisor.registry();
        assert!(registry.get(ids[0]).unwrap().state().is_streaming());
        assert!(registry.get(ids[2]).unwrap().state().is_streaming());
        assert_eq!(
            registry.get(ids[1]).unwrap().state(),
            PipelineState::Failed { stage: Stage::Decode }
        );
    }

    #[test]
    fn test_stop_is_idempotent_and_silences_streams() {
        let backend = ScriptedBackend::new().with("cam", endless());
        let mut supervisor = Supervisor::new(&config(), Arc::new(backend));
        let session = supervisor.start_session("cam", 3).unwrap();

        let ids = supervisor.registry().ids();
        wait_until(|| {
            supervisor
                .registry()
                .iter()
                .all(|pipeline| pipeline.health().frames_published() > 0)
        });

        assert!(supervisor.stop_session());
        assert!(!supervisor.stop_session());
        assert!(supervisor.registry().is_empty());
        assert_eq!(supervisor.session_id(), None);
        assert!(supervisor.wait_retired(Duration::from_secs(5)));
        assert_eq!(supervisor.retired_count(), 0);

        let mut events = Vec::new();
        let dispatcher = supervisor.dispatcher();
        while let Some(event) = dispatcher.try_next() {
            events.push(event);
        }
        let stopped = events
            .iter()
            .position(|event| matches!(event, DeliveryEvent::SessionStopped { session: s } if *s == session));
        assert!(stopped.is_some());
        // frames of a detached stream are dropped, not delivered late
        assert!(
            events
                .iter()
                .filter_map(DeliveryEvent::stream)
                .all(|stream| !ids.contains(&stream))
        );
    }

    #[test]
    fn test_restart_replaces_session_without_leaks() {
        let backend = Arc::new(ScriptedBackend::new().with("cam", endless()));
        let mut supervisor = Supervisor::new(&config(), backend.clone());

        let first = supervisor.start_session("cam", 2).unwrap();
        let first_ids = supervisor.registry().ids();
        let first_health: Vec<_> = supervisor.registry().iter().map(|p| p.health().clone()).collect();
        wait_until(|| first_health.iter().all(|h| h.frames_published() > 0));

        let second = supervisor.start_session("cam", 3).unwrap();
        assert!(second > first);
        assert_eq!(supervisor.registry().len(), 3);
        assert!(first_ids.iter().all(|id| !supervisor.registry().contains(*id)));

        assert!(supervisor.wait_retired(Duration::from_secs(5)));
        assert!(first_health.iter().all(|h| h.releases() == 1));

        let mut board = SlotBoard::new();
        supervisor.dispatcher().dispatch_pending(&mut board);
        assert_eq!(board.session(), Some(second));
        assert_eq!(board.slots().len(), 3);

        drop(supervisor);
        assert_eq!(backend.opens(), 5);
    }

    #[test]
    fn test_reports_follow_slot_order() {
        let backend = ScriptedBackend::new().with("a", endless()).with("b", Script::FailOpen);
        let mut supervisor = Supervisor::new(&config(), Arc::new(backend));
        supervisor.start_sources(&["a", "b"]).unwrap();

        wait_until(|| {
            let reports = supervisor.health_summary();
            reports[0].state.is_streaming() && reports[1].state.is_finished()
        });

        let reports = supervisor.health_summary();
        assert_eq!(reports[0].slot.source, "a");
        assert_eq!(reports[1].slot.source, "b");
        assert_eq!(reports[1].state, PipelineState::Failed { stage: Stage::Open });
    }

    struct Counter(usize);

    impl FrameConsumer for Counter {
        fn on_frame(&mut self, _: StreamId, _: crate::pipeline::types::ConvertedFrame) {
            self.0 += 1;
        }

        fn on_error(&mut self, _: StreamId, _: ErrorRecord) {}
    }

    #[test]
    fn test_drop_stops_all_workers() {
        let backend = ScriptedBackend::new().with("cam", endless());
        let mut supervisor = Supervisor::new(&config(), Arc::new(backend));
        supervisor.start_session("cam", 2).unwrap();
        let health: Vec<_> = supervisor.registry().iter().map(|p| p.health().clone()).collect();
        let dispatcher = supervisor.dispatcher();

        let mut counter = Counter(0);
        wait_until(|| {
            dispatcher.dispatch_timeout(&mut counter, Duration::from_millis(5));
            counter.0 >= 2
        });

        drop(supervisor);
        assert!(health.iter().all(|h| h.releases() == 1));
    }
}
