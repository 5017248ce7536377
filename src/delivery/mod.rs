//! Frame delivery from stream workers to the consumer
//!
//! Every stream owns a bounded latest-wins [`Mailbox`]. Frames and errors are
//! always tagged with the stream identity, reach the consumer in publish order
//! per stream, and are never interleaved with a half-delivered neighbour.
//! Session start/stop events travel on a separate queue that is served first.

pub mod board;
pub mod dispatcher;
pub mod hub;
pub mod mailbox;

pub use board::{SlotBoard, SlotView};
pub use dispatcher::Dispatcher;
pub use hub::DeliveryHub;
pub use mailbox::Mailbox;

use crate::error::ErrorRecord;
use crate::pipeline::types::{ConvertedFrame, StreamId};

/// Everything the consumer can receive
#[derive(Debug, Clone)]
pub enum DeliveryEvent {
    SessionStarted { session: u64, streams: Vec<StreamId> },
    SessionStopped { session: u64 },
    Frame { stream: StreamId, frame: ConvertedFrame },
    Error(ErrorRecord),
}

impl DeliveryEvent {
    /// Stream the event belongs to, `None` for session events
    pub fn stream(&self) -> Option<StreamId> {
        match self {
            DeliveryEvent::Frame { stream, .. } => Some(*stream),
            DeliveryEvent::Error(record) => Some(record.stream),
            _ => None,
        }
    }

    pub fn deliver_to<C: FrameConsumer + ?Sized>(self, consumer: &mut C) {
        match self {
            DeliveryEvent::SessionStarted { session, streams } => {
                consumer.on_session_started(session, &streams)
            }
            DeliveryEvent::SessionStopped { session } => consumer.on_session_stopped(session),
            DeliveryEvent::Frame { stream, frame } => consumer.on_frame(stream, frame),
            DeliveryEvent::Error(record) => consumer.on_error(record.stream, record),
        }
    }
}

/// Receiver of delivered events, called from the consumer's own context
pub trait FrameConsumer {
    fn on_frame(&mut self, stream: StreamId, frame: ConvertedFrame);

    fn on_error(&mut self, stream: StreamId, error: ErrorRecord);

    fn on_session_started(&mut self, _session: u64, _streams: &[StreamId]) {}

    fn on_session_stopped(&mut self, _session: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::media::PixelFormat;
    use crate::pipeline::health::StreamHealth;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(sequence: u64) -> ConvertedFrame {
        ConvertedFrame {
            width: 1,
            height: 1,
            stride: 4,
            format: PixelFormat::Bgra,
            sequence,
            pts: Some(sequence as i64),
            data: Bytes::from(vec![0u8; 4]),
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
    }

    impl FrameConsumer for Recorder {
        fn on_frame(&mut self, stream: StreamId, frame: ConvertedFrame) {
            self.events.push(format!("frame {} {}", stream.short(), frame.sequence));
        }

        fn on_error(&mut self, stream: StreamId, error: ErrorRecord) {
            self.events.push(format!("error {} {}", stream.short(), error.stage));
        }

        fn on_session_started(&mut self, session: u64, streams: &[StreamId]) {
            self.events.push(format!("started {} {}", session, streams.len()));
        }

        fn on_session_stopped(&mut self, session: u64) {
            self.events.push(format!("stopped {}", session));
        }
    }

    #[test]
    fn test_full_mailbox_drops_oldest_frame() {
        let hub = DeliveryHub::new(1);
        let health = Arc::new(StreamHealth::new());
        let id = StreamId::new();
        let mailbox = hub.register(id, health.clone());

        for seq in 0..5 {
            assert!(mailbox.post_frame(frame(seq)));
        }
        assert_eq!(mailbox.pending(), 1);
        assert_eq!(health.frame_drops(), 4);
        assert_eq!(health.frames_published(), 5);

        let mut recorder = Recorder::default();
        assert_eq!(hub.dispatcher().dispatch_pending(&mut recorder), 1);
        assert_eq!(recorder.events, vec![format!("frame {} 4", id.short())]);
    }

    #[test]
    fn test_deeper_mailbox_keeps_newest_in_order() {
        let hub = DeliveryHub::new(3);
        let mailbox = hub.register(StreamId::new(), Arc::new(StreamHealth::new()));
        for seq in 0..5 {
            mailbox.post_frame(frame(seq));
        }

        let dispatcher = hub.dispatcher();
        let sequences: Vec<u64> = std::iter::from_fn(|| dispatcher.try_next())
            .filter_map(|event| match event {
                DeliveryEvent::Frame { frame, .. } => Some(frame.sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn test_error_is_never_dropped_and_follows_frames() {
        let hub = DeliveryHub::new(1);
        let id = StreamId::new();
        let mailbox = hub.register(id, Arc::new(StreamHealth::new()));

        mailbox.post_frame(frame(0));
        mailbox.post_frame(frame(1));
        mailbox.post_error(ErrorRecord::new(id, &PipelineError::decode("bad packet")));
        // a late frame still cannot push the error out
        mailbox.post_frame(frame(2));

        let mut recorder = Recorder::default();
        hub.dispatcher().dispatch_pending(&mut recorder);
        assert_eq!(
            recorder.events,
            vec![
                format!("error {} decode", id.short()),
                format!("frame {} 2", id.short())
            ]
        );
    }

    #[test]
    fn test_detached_mailbox_discards_posts() {
        let hub = DeliveryHub::new(1);
        let id = StreamId::new();
        let mailbox = hub.register(id, Arc::new(StreamHealth::new()));

        mailbox.post_frame(frame(0));
        assert!(hub.unregister(id));
        assert!(!hub.unregister(id));
        assert!(!mailbox.post_frame(frame(1)));
        assert!(!mailbox.post_error(ErrorRecord::new(id, &PipelineError::open("late"))));

        assert!(hub.dispatcher().try_next().is_none());
    }

    #[test]
    fn test_session_events_come_first() {
        let hub = DeliveryHub::new(1);
        let id = StreamId::new();
        let mailbox = hub.register(id, Arc::new(StreamHealth::new()));
        mailbox.post_frame(frame(0));
        hub.announce(DeliveryEvent::SessionStarted {
            session: 1,
            streams: vec![id],
        });

        let mut recorder = Recorder::default();
        hub.dispatcher().dispatch_pending(&mut recorder);
        assert_eq!(recorder.events[0], "started 1 1");
        assert_eq!(recorder.events.len(), 2);
    }

    #[test]
    fn test_events_are_tagged_per_stream() {
        let hub = DeliveryHub::new(2);
        let a = StreamId::new();
        let b = StreamId::new();
        let mailbox_a = hub.register(a, Arc::new(StreamHealth::new()));
        let mailbox_b = hub.register(b, Arc::new(StreamHealth::new()));

        mailbox_a.post_frame(frame(0));
        mailbox_b.post_frame(frame(0));
        mailbox_a.post_frame(frame(1));

        let dispatcher = hub.dispatcher();
        let mut per_stream: std::collections::HashMap<StreamId, Vec<u64>> = Default::default();
        while let Some(event) = dispatcher.try_next() {
            if let DeliveryEvent::Frame { stream, frame } = event {
                per_stream.entry(stream).or_default().push(frame.sequence);
            }
        }
        assert_eq!(per_stream[&a], vec![0, 1]);
        assert_eq!(per_stream[&b], vec![0]);
    }

    #[test]
    fn test_next_timeout_wakes_on_publish() {
        let hub = DeliveryHub::new(1);
        let mailbox = hub.register(StreamId::new(), Arc::new(StreamHealth::new()));
        let dispatcher = hub.dispatcher();

        assert!(dispatcher.next_timeout(Duration::from_millis(10)).is_none());

        let publisher = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            mailbox.post_frame(frame(7));
        });
        let event = dispatcher.next_timeout(Duration::from_secs(5));
        publisher.join().unwrap();
        assert!(matches!(event, Some(DeliveryEvent::Frame { frame, .. }) if frame.sequence == 7));
    }

    #[tokio::test]
    async fn test_async_next() {
        let hub = DeliveryHub::new(1);
        let id = StreamId::new();
        let mailbox = hub.register(id, Arc::new(StreamHealth::new()));
        let dispatcher = hub.dispatcher();

        let waiter = tokio::spawn(async move { dispatcher.next().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.post_frame(frame(3));

        let event = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.stream(), Some(id));
    }
}
