use super::hub::HubShared;
use super::{DeliveryEvent, FrameConsumer};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Consumer side of a [`super::DeliveryHub`]
///
/// Blocking, polling and async reads are all available; they share one queue,
/// so use a single consumer context.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<HubShared>,
}

impl Dispatcher {
    pub(crate) fn new(shared: Arc<HubShared>) -> Self {
        Self { shared }
    }

    pub fn try_next(&self) -> Option<DeliveryEvent> {
        self.shared.lock().pop()
    }

    /// Wait up to `timeout` for the next event
    pub fn next_timeout(&self, timeout: Duration) -> Option<DeliveryEvent> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();

        loop {
            if let Some(event) = state.pop() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .shared
                .ready
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }

    pub async fn next(&self) -> DeliveryEvent {
        loop {
            let notified = self.shared.notify.notified();
            if let Some(event) = self.try_next() {
                return event;
            }
            notified.await;
        }
    }

    /// Hand every queued event to `consumer`, returns how many
    pub fn dispatch_pending<C: FrameConsumer + ?Sized>(&self, consumer: &mut C) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.try_next() {
            event.deliver_to(consumer);
            delivered += 1;
        }
        delivered
    }

    /// Wait up to `timeout` for activity, then drain everything queued
    pub fn dispatch_timeout<C: FrameConsumer + ?Sized>(&self, consumer: &mut C, timeout: Duration) -> usize {
        match self.next_timeout(timeout) {
            Some(event) => {
                event.deliver_to(consumer);
                1 + self.dispatch_pending(consumer)
            }
            None => 0,
        }
    }
}
