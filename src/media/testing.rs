//! In-memory backend for pipeline tests

use super::y4m::{RawVideoDecoder, Y4mSource};
use super::{
    DecodedFrame, MediaBackend, MediaError, MediaSource, OpenOptions, OpenedMedia, Packet,
    PixelFormat, SourceLocator, StreamInfo, VideoDecoder,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// YUV4MPEG2 bytes with one 4:2:0 frame per luma value and optionally a
/// trailing frame cut short after `truncated` bytes
pub(crate) fn y4m_stream(width: usize, height: usize, lumas: &[u8], truncated: Option<usize>) -> Vec<u8> {
    let mut out = format!("YUV4MPEG2 W{} H{} F25:1 Ip A1:1 C420jpeg\n", width, height).into_bytes();
    for &luma in lumas {
        out.extend_from_slice(b"FRAME\n");
        out.extend_from_slice(&yuv420_frame(width, height, luma));
    }
    if let Some(len) = truncated {
        out.extend_from_slice(b"FRAME\n");
        out.extend(std::iter::repeat_n(0u8, len));
    }
    out
}

/// Flat 4:2:0 frame with neutral chroma
pub(crate) fn yuv420_frame(width: usize, height: usize, luma: u8) -> Vec<u8> {
    let luma_size = width * height;
    let total = PixelFormat::Yuv420p.frame_size(width, height);
    let mut frame = vec![128u8; total];
    frame[..luma_size].fill(luma);
    frame
}

pub(crate) enum Script {
    /// Serve these YUV4MPEG2 bytes
    Y4m(Vec<u8>),
    /// Generate frames forever, one every `interval`
    Endless {
        width: usize,
        height: usize,
        interval: Duration,
    },
    /// Decoder emits frames the converter cannot read
    Unconvertible { width: usize, height: usize },
    /// Every open attempt fails
    FailOpen,
    /// Source panics on the first read
    PanicOnRead,
}

/// Backend keyed by the raw locator string
pub(crate) struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    opens: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self {
            scripts: HashMap::new(),
            opens: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with(mut self, locator: &str, script: Script) -> Self {
        self.scripts.insert(locator.to_string(), script);
        self
    }

    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl MediaBackend for ScriptedBackend {
    fn open(&self, locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        match self.scripts.get(locator.as_str()) {
            Some(Script::Y4m(bytes)) => {
                let source = Y4mSource::open(Cursor::new(bytes.clone()), options)?;
                let decoder = source.decoder();
                Ok(OpenedMedia {
                    source: Box::new(source),
                    decoder: Box::new(decoder),
                })
            }
            Some(Script::Endless {
                width,
                height,
                interval,
            }) => Ok(OpenedMedia {
                source: Box::new(EndlessSource::new(*width, *height, *interval)),
                decoder: Box::new(RawVideoDecoder::new(PixelFormat::Yuv420p, *width, *height)),
            }),
            Some(Script::Unconvertible { width, height }) => Ok(OpenedMedia {
                source: Box::new(EndlessSource::new(*width, *height, Duration::from_millis(1))),
                decoder: Box::new(PlanelessDecoder {
                    width: *width,
                    height: *height,
                    pending: None,
                }),
            }),
            Some(Script::FailOpen) => Err(MediaError::Backend("connection refused".into())),
            Some(Script::PanicOnRead) => Ok(OpenedMedia {
                source: Box::new(PanickingSource {
                    info: EndlessSource::new(2, 2, Duration::ZERO).info,
                }),
                decoder: Box::new(RawVideoDecoder::new(PixelFormat::Yuv420p, 2, 2)),
            }),
            None => Err(MediaError::Unsupported(format!("no script for {}", locator))),
        }
    }
}

struct EndlessSource {
    info: StreamInfo,
    interval: Duration,
    count: i64,
}

impl EndlessSource {
    fn new(width: usize, height: usize, interval: Duration) -> Self {
        Self {
            info: StreamInfo {
                index: 0,
                codec: "rawvideo".into(),
                width,
                height,
            },
            interval,
            count: 0,
        }
    }
}

impl MediaSource for EndlessSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        std::thread::sleep(self.interval);
        let luma = (self.count % 256) as u8;
        let frame = yuv420_frame(self.info.width, self.info.height, luma);
        let packet = Packet::new(0, Some(self.count), Bytes::from(frame));
        self.count += 1;
        Ok(Some(packet))
    }
}

struct PanickingSource {
    info: StreamInfo,
}

impl MediaSource for PanickingSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        panic!("demuxer state corrupted");
    }
}

struct PlanelessDecoder {
    width: usize,
    height: usize,
    pending: Option<i64>,
}

impl VideoDecoder for PlanelessDecoder {
    fn send_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
        self.pending = Some(packet.pts.unwrap_or_default());
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError> {
        Ok(self.pending.take().map(|pts| {
            DecodedFrame::from_planes(PixelFormat::Yuv420p, self.width, self.height, Some(pts), Vec::new())
        }))
    }

    fn flush(&mut self) -> Result<(), MediaError> {
        Ok(())
    }
}
