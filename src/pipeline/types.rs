//! Core types for the pipeline system

use crate::media::PixelFormat;
use bytes::Bytes;
use uuid::Uuid;

/// Opaque identity of one stream pipeline
///
/// Assigned at pipeline creation and never reused, so a late event can always
/// be matched (or discarded) against the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(Uuid);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First eight hex digits, enough to tell streams apart in logs
    pub fn short(&self) -> String {
        self.0.simple().to_string()[..8].to_string()
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded picture converted to the consumer's pixel format
///
/// Owns its pixels: the worker copies out of its reusable buffer before
/// publishing, so the consumer may keep a frame as long as it likes.
#[derive(Clone)]
pub struct ConvertedFrame {
    pub width: usize,
    pub height: usize,
    /// Bytes per row
    pub stride: usize,
    pub format: PixelFormat,
    /// Position of this frame among the frames converted by its pipeline run
    pub sequence: u64,
    /// Presentation timestamp reported by the source, if any
    pub pts: Option<i64>,
    pub data: Bytes,
}

impl ConvertedFrame {
    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Pixels of row `y`, without stride padding
    pub fn row(&self, y: usize) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let row_bytes = self.width * self.format.bytes_per_pixel()?;
        let start = y * self.stride;
        self.data.get(start..start + row_bytes)
    }
}

impl std::fmt::Debug for ConvertedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConvertedFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("format", &self.format)
            .field("sequence", &self.sequence)
            .field("pts", &self.pts)
            .field("data_len", &self.data.len())
            .finish()
    }
}
