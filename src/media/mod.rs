//! Media backend seam: sources that yield compressed packets and decoders that
//! turn them into raw frames.
//!
//! The pipeline only talks to [`MediaBackend`], [`MediaSource`] and
//! [`VideoDecoder`]. The pure-Rust [`y4m`] backend is always available, the
//! FFmpeg container one is compiled in with the `ffmpeg` feature and URL
//! sources opened by libavformat with the `network` feature.

pub mod backend;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod locator;
#[cfg(feature = "network")]
pub mod network;
#[cfg(test)]
pub(crate) mod testing;
pub mod y4m;

pub use backend::DefaultBackend;
pub use locator::{LocatorError, SourceLocator};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Raw pixel layouts understood by the software converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Yuv422p,
    Yuv444p,
    Nv12,
    Gray,
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 9] = [
        PixelFormat::Yuv420p,
        PixelFormat::Yuv422p,
        PixelFormat::Yuv444p,
        PixelFormat::Nv12,
        PixelFormat::Gray,
        PixelFormat::Rgb24,
        PixelFormat::Bgr24,
        PixelFormat::Rgba,
        PixelFormat::Bgra,
    ];

    /// FFmpeg name of the format
    pub fn name(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Nv12 => "nv12",
            PixelFormat::Gray => "gray",
            PixelFormat::Rgb24 => "rgb24",
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Bgra => "bgra",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|format| format.name() == name)
    }

    /// Bytes per pixel of single-plane formats
    pub fn bytes_per_pixel(&self) -> Option<usize> {
        match self {
            PixelFormat::Gray => Some(1),
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(3),
            PixelFormat::Rgba | PixelFormat::Bgra => Some(4),
            _ => None,
        }
    }

    /// Whether the format can be a conversion destination
    pub fn is_packed_rgb(&self) -> bool {
        matches!(
            self,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba | PixelFormat::Bgra
        )
    }

    /// Tightly packed planes as `(bytes per row, rows)`
    pub fn plane_layout(&self, width: usize, height: usize) -> Vec<(usize, usize)> {
        let half_w = width.div_ceil(2);
        let half_h = height.div_ceil(2);
        match self {
            PixelFormat::Yuv420p => vec![(width, height), (half_w, half_h), (half_w, half_h)],
            PixelFormat::Yuv422p => vec![(width, height), (half_w, height), (half_w, height)],
            PixelFormat::Yuv444p => vec![(width, height), (width, height), (width, height)],
            PixelFormat::Nv12 => vec![(width, height), (half_w * 2, half_h)],
            packed => {
                let bpp = packed.bytes_per_pixel().unwrap_or(1);
                vec![(width.saturating_mul(bpp), height)]
            }
        }
    }

    /// Size of a tightly packed frame, `None` when it does not fit in `usize`
    pub fn checked_frame_size(&self, width: usize, height: usize) -> Option<usize> {
        self.plane_layout(width, height)
            .into_iter()
            .try_fold(0usize, |total, (row, rows)| total.checked_add(row.checked_mul(rows)?))
    }

    /// Size of a tightly packed frame
    pub fn frame_size(&self, width: usize, height: usize) -> usize {
        self.checked_frame_size(width, height).unwrap_or(usize::MAX)
    }
}

impl std::fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for PixelFormat {
    type Err = MediaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| MediaError::Unsupported(format!("pixel format {}", s)))
    }
}

/// Errors raised by sources and decoders
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Decoder needs more input before it can continue
    #[error("resource temporarily unavailable")]
    Again,
    /// End of the current access unit or of the decoder's output
    #[error("end of stream")]
    EndOfStream,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Backend(String),
}

impl MediaError {
    /// Transient conditions skip to the next packet instead of failing the stream
    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::Again | MediaError::EndOfStream)
    }

    /// Map an I/O error raised with a read timeout configured
    pub fn from_read(err: std::io::Error, timeout: Duration) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                MediaError::Timeout(timeout)
            }
            _ => MediaError::Io(err),
        }
    }
}

/// Video stream selected by a source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Container stream index, packets of other streams are skipped
    pub index: usize,
    pub codec: String,
    pub width: usize,
    pub height: usize,
}

/// Compressed (or raw) bytes of one access unit
pub struct Packet {
    pub stream_index: usize,
    pub pts: Option<i64>,
    pub payload: PacketPayload,
}

pub enum PacketPayload {
    Bytes(Bytes),
    #[cfg(feature = "ffmpeg")]
    Native(ac_ffmpeg::packet::Packet),
    #[cfg(feature = "network")]
    Stream(ffmpeg_next::Packet),
}

impl Packet {
    pub fn new(stream_index: usize, pts: Option<i64>, data: Bytes) -> Self {
        Self {
            stream_index,
            pts,
            payload: PacketPayload::Bytes(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        match &self.payload {
            PacketPayload::Bytes(data) => data,
            #[cfg(feature = "ffmpeg")]
            PacketPayload::Native(packet) => packet.data(),
            #[cfg(feature = "network")]
            PacketPayload::Stream(packet) => packet.data().unwrap_or(&[]),
        }
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }
}

/// One plane of a raw frame
#[derive(Debug, Clone)]
pub struct FramePlane {
    pub data: Bytes,
    /// Bytes per row, including padding
    pub stride: usize,
}

/// Borrowed view of a plane handed to scalers
#[derive(Debug, Clone, Copy)]
pub struct PlaneRef<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

/// Pixel layout of a decoded frame, as the converter keys its contexts
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Raw(PixelFormat),
    #[cfg(feature = "ffmpeg")]
    Native(ac_ffmpeg::codec::video::PixelFormat),
}

impl std::fmt::Debug for FrameFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFormat::Raw(format) => write!(f, "{}", format),
            #[cfg(feature = "ffmpeg")]
            FrameFormat::Native(_) => write!(f, "native"),
        }
    }
}

/// Picture data owned by a decoded frame
pub enum FrameData {
    Planes {
        format: PixelFormat,
        planes: Vec<FramePlane>,
    },
    #[cfg(feature = "ffmpeg")]
    Native(ac_ffmpeg::codec::video::VideoFrame),
}

/// Raw picture emitted by a decoder
pub struct DecodedFrame {
    pub width: usize,
    pub height: usize,
    pub pts: Option<i64>,
    pub data: FrameData,
}

impl DecodedFrame {
    pub fn from_planes(
        format: PixelFormat,
        width: usize,
        height: usize,
        pts: Option<i64>,
        planes: Vec<FramePlane>,
    ) -> Self {
        Self {
            width,
            height,
            pts,
            data: FrameData::Planes { format, planes },
        }
    }

    pub fn format(&self) -> FrameFormat {
        match &self.data {
            FrameData::Planes { format, .. } => FrameFormat::Raw(*format),
            #[cfg(feature = "ffmpeg")]
            FrameData::Native(frame) => ffmpeg::frame_format(frame),
        }
    }

    /// Run `f` over borrowed planes of the frame
    pub fn with_planes<R>(&self, f: impl FnOnce(&[PlaneRef<'_>]) -> R) -> R {
        match &self.data {
            FrameData::Planes { planes, .. } => {
                let refs: Vec<PlaneRef<'_>> = planes
                    .iter()
                    .map(|plane| PlaneRef {
                        data: &plane.data,
                        stride: plane.stride,
                    })
                    .collect();
                f(&refs)
            }
            #[cfg(feature = "ffmpeg")]
            FrameData::Native(frame) => {
                let planes = frame.planes();
                let refs: Vec<PlaneRef<'_>> = (0..planes.len())
                    .map(|i| PlaneRef {
                        data: planes[i].data(),
                        stride: planes[i].line_size(),
                    })
                    .filter(|plane| !plane.data.is_empty())
                    .collect();
                f(&refs)
            }
        }
    }
}

/// Connection knobs passed to [`MediaBackend::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenOptions {
    pub open_timeout: Duration,
    pub read_timeout: Duration,
    /// Largest raw source frame a demuxer may allocate
    pub max_frame_bytes: usize,
}

/// Packet reader for one opened source
pub trait MediaSource: Send {
    fn stream_info(&self) -> &StreamInfo;

    /// Start delivery on live sources that need an explicit play request
    fn begin_playback(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    /// `Ok(None)` at end of source
    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError>;
}

/// Decoder opened for the selected video stream
pub trait VideoDecoder: Send {
    fn send_packet(&mut self, packet: Packet) -> Result<(), MediaError>;

    /// `Ok(None)` when the decoder needs more input
    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError>;

    /// Signal end of input so buffered frames can be drained
    fn flush(&mut self) -> Result<(), MediaError>;
}

pub struct OpenedMedia {
    pub source: Box<dyn MediaSource>,
    pub decoder: Box<dyn VideoDecoder>,
}

impl std::fmt::Debug for OpenedMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedMedia")
            .field("stream", self.source.stream_info())
            .finish()
    }
}

/// Opens sources and their decoders, shared by every pipeline of a session
pub trait MediaBackend: Send + Sync {
    fn open(&self, locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError>;
}
