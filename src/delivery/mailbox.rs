use super::hub::HubShared;
use crate::error::ErrorRecord;
use crate::pipeline::health::StreamHealth;
use crate::pipeline::types::{ConvertedFrame, StreamId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub(crate) enum MailItem {
    Frame(ConvertedFrame),
    Error(ErrorRecord),
}

struct MailboxInner {
    items: VecDeque<MailItem>,
    frames: usize,
    /// Stream id already sits in the hub's ready queue
    queued: bool,
}

/// Bounded per-stream queue between a worker and the consumer
///
/// Holds at most `depth` frames, publishing into a full mailbox discards the
/// oldest frame. Errors are never discarded. Once detached every post is a
/// silent no-op.
pub struct Mailbox {
    stream: StreamId,
    depth: usize,
    attached: AtomicBool,
    inner: Mutex<MailboxInner>,
    hub: Weak<HubShared>,
    health: Arc<StreamHealth>,
}

impl Mailbox {
    pub(crate) fn new(stream: StreamId, depth: usize, hub: Weak<HubShared>, health: Arc<StreamHealth>) -> Self {
        Self {
            stream,
            depth: depth.max(1),
            attached: AtomicBool::new(true),
            inner: Mutex::new(MailboxInner {
                items: VecDeque::new(),
                frames: 0,
                queued: false,
            }),
            hub,
            health,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Publish a converted frame, returns `false` once the mailbox is detached
    pub fn post_frame(&self, frame: ConvertedFrame) -> bool {
        if !self.is_attached() {
            return false;
        }

        let size = frame.byte_len();
        let notify = {
            let mut inner = lock(&self.inner);
            if inner.frames >= self.depth {
                if let Some(pos) = inner.items.iter().position(|item| matches!(item, MailItem::Frame(_))) {
                    inner.items.remove(pos);
                    inner.frames -= 1;
                    self.health.record_frame_drop();
                }
            }
            inner.items.push_back(MailItem::Frame(frame));
            inner.frames += 1;
            !std::mem::replace(&mut inner.queued, true)
        };

        self.health.record_published(size);
        if notify {
            self.wake();
        }
        true
    }

    /// Publish the terminal error of a pipeline run
    pub fn post_error(&self, record: ErrorRecord) -> bool {
        if !self.is_attached() {
            return false;
        }

        let notify = {
            let mut inner = lock(&self.inner);
            inner.items.push_back(MailItem::Error(record));
            !std::mem::replace(&mut inner.queued, true)
        };

        if notify {
            self.wake();
        }
        true
    }

    /// Number of items waiting for the consumer
    pub fn pending(&self) -> usize {
        lock(&self.inner).items.len()
    }

    /// Take everything queued, in publish order
    pub(crate) fn drain(&self) -> Vec<MailItem> {
        let mut inner = lock(&self.inner);
        inner.queued = false;
        inner.frames = 0;
        inner.items.drain(..).collect()
    }

    /// Stop accepting posts and drop what is queued
    pub(crate) fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        let mut inner = lock(&self.inner);
        inner.items.clear();
        inner.frames = 0;
    }

    fn wake(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.enqueue(self.stream);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
