//! Owner-side handle of one stream pipeline

use super::health::StreamHealth;
use super::state::{PipelineState, SharedState};
use super::types::StreamId;
use super::worker::{self, WorkerContext};
use crate::assets::{STOP_JOIN_TIMEOUT_MS, STREAM_THREAD_PREFIX};
use crate::config::PipelineSettings;
use crate::delivery::{DeliveryHub, Mailbox};
use crate::error::PipelineError;
use crate::media::{MediaBackend, SourceLocator};
use crate::utils::sos::SignalOfStop;
use log::{debug, info, warn};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// One source decoded on its own worker thread
///
/// The handle owns the keep-alive flag and the join handle. The worker owns
/// every decode resource and reports through the shared state and the
/// stream's mailbox.
pub struct StreamPipeline {
    id: StreamId,
    index: usize,
    backend: Arc<dyn MediaBackend>,
    settings: Arc<PipelineSettings>,
    hub: DeliveryHub,
    mailbox: Arc<Mailbox>,
    health: Arc<StreamHealth>,
    state: SharedState,
    source: Option<SourceLocator>,
    keep_alive: Option<SignalOfStop>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
}

impl StreamPipeline {
    /// Create an idle pipeline for grid slot `index` and register its mailbox
    pub fn new(
        index: usize,
        backend: Arc<dyn MediaBackend>,
        settings: Arc<PipelineSettings>,
        hub: &DeliveryHub,
    ) -> Self {
        let id = StreamId::new();
        let health = Arc::new(StreamHealth::new());
        let mailbox = hub.register(id, health.clone());

        Self {
            id,
            index,
            backend,
            settings,
            hub: hub.clone(),
            mailbox,
            health,
            state: SharedState::new(),
            source: None,
            keep_alive: None,
            worker: None,
            join_timeout: Duration::from_millis(STOP_JOIN_TIMEOUT_MS),
        }
    }

    /// How long drop and restart wait for a stopping worker
    pub fn with_join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Launch a worker for `source`, replacing any previous run
    ///
    /// Fails without starting anything when the locator is empty or
    /// malformed, or when the thread cannot be spawned.
    pub fn start(&mut self, source: &str) -> Result<(), PipelineError> {
        let locator = SourceLocator::parse(source).map_err(PipelineError::open)?;

        if self.worker.is_some() {
            debug!("Restarting stream #{}", self.index);
            self.stop();
            if !self.join_timeout(self.join_timeout) {
                warn!(
                    "Stream #{} previous worker still running after {:?}, detaching",
                    self.index, self.join_timeout
                );
                self.detach();
            }
        }

        // a detached worker keeps writing to the old cell and mailbox, and a
        // new run numbers its frames from zero again
        if self.source.is_some() {
            self.mailbox = self.hub.renew(self.id, self.health.clone());
        }
        self.state = SharedState::new();
        let keep_alive = SignalOfStop::new();

        let ctx = WorkerContext {
            id: self.id,
            index: self.index,
            locator: locator.clone(),
            backend: self.backend.clone(),
            settings: self.settings.clone(),
            keep_alive: keep_alive.clone(),
            state: self.state.clone(),
            health: self.health.clone(),
            mailbox: self.mailbox.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("{}-{}", STREAM_THREAD_PREFIX, self.index))
            .spawn(move || worker::run(ctx))
            .map_err(|e| PipelineError::resource(format!("cannot spawn stream worker: {}", e)))?;

        info!("Stream #{} [{}] started on {}", self.index, self.id.short(), locator);
        self.source = Some(locator);
        self.keep_alive = Some(keep_alive);
        self.worker = Some(handle);
        Ok(())
    }

    /// Ask the worker to wind down, returns false if it was not running
    /// or a stop was already requested
    pub fn stop(&mut self) -> bool {
        match &self.keep_alive {
            Some(keep_alive) if !keep_alive.cancelled() => {
                keep_alive.cancel();
                self.state.transition_if(
                    |state| matches!(state, PipelineState::Opening | PipelineState::Streaming { .. }),
                    PipelineState::Stopping,
                );
                debug!("Stop requested for stream #{}", self.index);
                true
            }
            _ => false,
        }
    }

    /// Wait for the worker thread, returns false if it panicked outside the
    /// decode loop
    pub fn join(&mut self) -> bool {
        match self.worker.take() {
            Some(handle) => handle.join().is_ok(),
            None => true,
        }
    }

    /// Wait up to `timeout` for the worker, returns false if it is still running
    pub fn join_timeout(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match &self.worker {
                None => return true,
                Some(handle) if handle.is_finished() => {
                    self.join();
                    return true;
                }
                Some(_) if Instant::now() >= deadline => return false,
                Some(_) => thread::sleep(Duration::from_millis(2)),
            }
        }
    }

    /// Forget a worker that does not exit, it finishes on its own
    pub fn detach(&mut self) {
        if self.worker.take().is_some() {
            warn!("Detached worker of stream #{}", self.index);
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn state(&self) -> PipelineState {
        self.state.get()
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn source(&self) -> Option<&SourceLocator> {
        self.source.as_ref()
    }

    pub fn health(&self) -> &Arc<StreamHealth> {
        &self.health
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }
}

impl Drop for StreamPipeline {
    fn drop(&mut self) {
        self.stop();
        if !self.join_timeout(self.join_timeout) {
            self.detach();
        }
    }
}
