use super::FrameConsumer;
use crate::error::ErrorRecord;
use crate::pipeline::types::{ConvertedFrame, StreamId};
use std::collections::HashMap;
use std::time::Instant;

/// What one grid slot currently shows
#[derive(Debug, Clone)]
pub struct SlotView {
    pub index: usize,
    pub stream: StreamId,
    pub latest: Option<ConvertedFrame>,
    pub frames: u64,
    pub error: Option<ErrorRecord>,
    pub last_update: Option<Instant>,
}

/// Consumer-side grid state: the latest frame and error of every slot
///
/// Slots are laid out from the stream list of the session start event.
/// Events of streams outside the current session are counted and ignored.
#[derive(Debug, Default)]
pub struct SlotBoard {
    session: Option<u64>,
    slots: Vec<SlotView>,
    by_stream: HashMap<StreamId, usize>,
    ignored: u64,
}

impl SlotBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    pub fn slots(&self) -> &[SlotView] {
        &self.slots
    }

    pub fn slot_for(&self, stream: StreamId) -> Option<&SlotView> {
        self.by_stream.get(&stream).map(|&index| &self.slots[index])
    }

    /// Events that matched no slot
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn total_frames(&self) -> u64 {
        self.slots.iter().map(|slot| slot.frames).sum()
    }

    pub fn failed_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.error.is_some()).count()
    }

    fn slot_mut(&mut self, stream: StreamId) -> Option<&mut SlotView> {
        match self.by_stream.get(&stream) {
            Some(&index) => self.slots.get_mut(index),
            None => {
                self.ignored += 1;
                None
            }
        }
    }
}

impl FrameConsumer for SlotBoard {
    fn on_frame(&mut self, stream: StreamId, frame: ConvertedFrame) {
        if let Some(slot) = self.slot_mut(stream) {
            slot.latest = Some(frame);
            slot.frames += 1;
            slot.last_update = Some(Instant::now());
        }
    }

    fn on_error(&mut self, stream: StreamId, error: ErrorRecord) {
        if let Some(slot) = self.slot_mut(stream) {
            slot.error = Some(error);
            slot.last_update = Some(Instant::now());
        }
    }

    fn on_session_started(&mut self, session: u64, streams: &[StreamId]) {
        self.session = Some(session);
        self.slots = streams
            .iter()
            .enumerate()
            .map(|(index, &stream)| SlotView {
                index,
                stream,
                latest: None,
                frames: 0,
                error: None,
                last_update: None,
            })
            .collect();
        self.by_stream = streams
            .iter()
            .enumerate()
            .map(|(index, &stream)| (stream, index))
            .collect();
    }

    fn on_session_stopped(&mut self, session: u64) {
        if self.session == Some(session) {
            self.session = None;
            self.slots.clear();
            self.by_stream.clear();
        }
    }
}
