use super::DeliveryEvent;
use super::dispatcher::Dispatcher;
use super::mailbox::{Mailbox, MailItem};
use crate::pipeline::health::StreamHealth;
use crate::pipeline::types::StreamId;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;

pub(crate) struct HubState {
    mailboxes: HashMap<StreamId, Arc<Mailbox>>,
    /// Session lifecycle events, delivered before anything else
    control: VecDeque<DeliveryEvent>,
    /// Streams with unread mail, each listed at most once
    ready: VecDeque<StreamId>,
    /// Events drained from a mailbox but not handed out yet
    staged: VecDeque<DeliveryEvent>,
}

impl HubState {
    pub(crate) fn pop(&mut self) -> Option<DeliveryEvent> {
        if let Some(event) = self.control.pop_front() {
            return Some(event);
        }

        loop {
            if let Some(event) = self.staged.pop_front() {
                return Some(event);
            }

            let stream = self.ready.pop_front()?;
            // Unregistered since it was queued
            let Some(mailbox) = self.mailboxes.get(&stream).cloned() else {
                continue;
            };

            self.staged.extend(mailbox.drain().into_iter().map(|item| match item {
                MailItem::Frame(frame) => DeliveryEvent::Frame { stream, frame },
                MailItem::Error(record) => DeliveryEvent::Error(record),
            }));
        }
    }
}

pub(crate) struct HubShared {
    state: Mutex<HubState>,
    pub(crate) ready: Condvar,
    pub(crate) notify: Notify,
}

impl HubShared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn enqueue(&self, stream: StreamId) {
        self.lock().ready.push_back(stream);
        self.wake();
    }

    fn wake(&self) {
        self.ready.notify_all();
        self.notify.notify_one();
    }
}

/// Fan-in point between every stream worker and the single consumer
///
/// Workers publish into their own [`Mailbox`], the consumer reads through a
/// [`Dispatcher`]. The hub lock is never held while a worker holds its mailbox
/// lock, so publishing never waits on the consumer.
#[derive(Clone)]
pub struct DeliveryHub {
    shared: Arc<HubShared>,
    frame_depth: usize,
}

impl DeliveryHub {
    pub fn new(frame_depth: usize) -> Self {
        Self {
            shared: Arc::new(HubShared {
                state: Mutex::new(HubState {
                    mailboxes: HashMap::new(),
                    control: VecDeque::new(),
                    ready: VecDeque::new(),
                    staged: VecDeque::new(),
                }),
                ready: Condvar::new(),
                notify: Notify::new(),
            }),
            frame_depth: frame_depth.max(1),
        }
    }

    /// Create the mailbox of a new stream
    pub fn register(&self, stream: StreamId, health: Arc<StreamHealth>) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(
            stream,
            self.frame_depth,
            Arc::downgrade(&self.shared),
            health,
        ));
        self.shared.lock().mailboxes.insert(stream, mailbox.clone());
        debug!("Registered mailbox for stream {}", stream.short());
        mailbox
    }

    /// Detach a stream, anything it still publishes is discarded
    pub fn unregister(&self, stream: StreamId) -> bool {
        let removed = Self::remove(&mut self.shared.lock(), stream);
        if removed {
            debug!("Unregistered mailbox for stream {}", stream.short());
        }
        removed
    }

    /// Swap in an empty mailbox for a stream that starts a new run
    ///
    /// The previous mailbox is detached with its queued mail, so a worker
    /// still holding it can no longer reach the consumer.
    pub fn renew(&self, stream: StreamId, health: Arc<StreamHealth>) -> Arc<Mailbox> {
        let mailbox = Arc::new(Mailbox::new(
            stream,
            self.frame_depth,
            Arc::downgrade(&self.shared),
            health,
        ));
        let mut state = self.shared.lock();
        Self::remove(&mut state, stream);
        state.mailboxes.insert(stream, mailbox.clone());
        debug!("Renewed mailbox for stream {}", stream.short());
        mailbox
    }

    fn remove(state: &mut HubState, stream: StreamId) -> bool {
        let Some(mailbox) = state.mailboxes.remove(&stream) else {
            return false;
        };
        mailbox.detach();
        state.ready.retain(|id| *id != stream);
        state.staged.retain(|event| event.stream() != Some(stream));
        true
    }

    /// Queue a session lifecycle event ahead of frames and errors
    pub fn announce(&self, event: DeliveryEvent) {
        self.shared.lock().control.push_back(event);
        self.shared.wake();
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(self.shared.clone())
    }
}
