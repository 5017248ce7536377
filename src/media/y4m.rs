//! YUV4MPEG2 sources and the raw video decoder behind them
//!
//! A stream is one header line `YUV4MPEG2 W<w> H<h> F<n>:<d> C<colorspace> ...`
//! followed by frames, each a `FRAME` line and the tightly packed planes.
//! Works over files and plain TCP feeds (`ffmpeg -f yuv4mpegpipe tcp://...`).

use super::{
    DecodedFrame, FramePlane, MediaError, MediaSource, OpenOptions, Packet, PacketPayload,
    PixelFormat, StreamInfo, VideoDecoder,
};
use bytes::Bytes;
use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

pub const SIGNATURE: &[u8] = b"YUV4MPEG2";
const MAX_LINE_LEN: usize = 1024;

/// Parsed stream header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: usize,
    pub height: usize,
    pub format: PixelFormat,
    pub frame_rate: Option<(u32, u32)>,
}

impl Y4mHeader {
    pub fn parse(line: &str) -> Result<Self, MediaError> {
        let mut tokens = line.split_ascii_whitespace();
        if tokens.next() != Some("YUV4MPEG2") {
            return Err(MediaError::InvalidData("missing YUV4MPEG2 signature".into()));
        }

        let mut width = None;
        let mut height = None;
        let mut format = PixelFormat::Yuv420p;
        let mut frame_rate = None;

        for token in tokens {
            let mut chars = token.chars();
            let tag = chars.next();
            let value = chars.as_str();
            match tag {
                Some('W') => width = value.parse::<usize>().ok(),
                Some('H') => height = value.parse::<usize>().ok(),
                Some('F') => {
                    frame_rate = value
                        .split_once(':')
                        .and_then(|(n, d)| Some((n.parse().ok()?, d.parse().ok()?)))
                }
                Some('C') => format = colorspace(value)?,
                // interlacing, aspect and extensions do not change the layout
                _ => {}
            }
        }

        match (width, height) {
            (Some(width), Some(height)) if width > 0 && height > 0 => Ok(Self {
                width,
                height,
                format,
                frame_rate,
            }),
            _ => Err(MediaError::InvalidData("missing or zero frame size".into())),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.width, self.height)
    }

    /// Frame size if it stays within `limit` bytes
    pub fn bounded_frame_size(&self, limit: usize) -> Result<usize, MediaError> {
        self.format
            .checked_frame_size(self.width, self.height)
            .filter(|size| *size <= limit)
            .ok_or_else(|| {
                MediaError::InvalidData(format!(
                    "{}x{} {} frames exceed the {} byte limit",
                    self.width, self.height, self.format, limit
                ))
            })
    }
}

fn colorspace(value: &str) -> Result<PixelFormat, MediaError> {
    match value {
        "420" | "420jpeg" | "420paldv" | "420mpeg2" => Ok(PixelFormat::Yuv420p),
        "422" => Ok(PixelFormat::Yuv422p),
        "444" => Ok(PixelFormat::Yuv444p),
        "mono" => Ok(PixelFormat::Gray),
        other => Err(MediaError::Unsupported(format!("y4m colorspace {}", other))),
    }
}

/// Read one `\n` terminated line, bounded so a garbage stream cannot grow it
fn read_line<R: BufRead>(reader: &mut R, timeout: Duration) -> Result<Option<String>, MediaError> {
    let mut line = Vec::new();
    let read = reader
        .take(MAX_LINE_LEN as u64)
        .read_until(b'\n', &mut line)
        .map_err(|e| MediaError::from_read(e, timeout))?;

    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if line.len() >= MAX_LINE_LEN {
            return Err(MediaError::InvalidData("header line too long".into()));
        }
        // stream ended in the middle of a line
        return Ok(None);
    }
    line.pop();
    String::from_utf8(line)
        .map(Some)
        .map_err(|_| MediaError::InvalidData("header line is not ascii".into()))
}

/// Packet reader over any byte stream carrying YUV4MPEG2
pub struct Y4mSource<R> {
    reader: BufReader<R>,
    header: Y4mHeader,
    info: StreamInfo,
    frame_size: usize,
    frames_read: i64,
    read_timeout: Duration,
}

impl<R: Read + Send> Y4mSource<R> {
    /// Read and validate the stream header
    pub fn open(reader: R, options: &OpenOptions) -> Result<Self, MediaError> {
        let read_timeout = options.read_timeout;
        let mut reader = BufReader::new(reader);
        let line = read_line(&mut reader, read_timeout)?
            .ok_or_else(|| MediaError::InvalidData("empty stream".into()))?;
        let header = Y4mHeader::parse(&line)?;
        let frame_size = header.bounded_frame_size(options.max_frame_bytes)?;

        log::debug!(
            "Y4M stream {}x{} {} at {:?} fps",
            header.width,
            header.height,
            header.format,
            header.frame_rate
        );

        let info = StreamInfo {
            index: 0,
            codec: "rawvideo".into(),
            width: header.width,
            height: header.height,
        };

        Ok(Self {
            reader,
            header,
            info,
            frame_size,
            frames_read: 0,
            read_timeout,
        })
    }

    pub fn header(&self) -> &Y4mHeader {
        &self.header
    }

    pub fn decoder(&self) -> RawVideoDecoder {
        RawVideoDecoder::new(self.header.format, self.header.width, self.header.height)
    }
}

impl<R: Read + Send> MediaSource for Y4mSource<R> {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        let Some(line) = read_line(&mut self.reader, self.read_timeout)? else {
            return Ok(None);
        };
        if !line.starts_with("FRAME") {
            return Err(MediaError::InvalidData(format!(
                "expected FRAME marker after {} frames",
                self.frames_read
            )));
        }

        let frame_size = self.frame_size;
        let mut data = Vec::new();
        data.try_reserve_exact(frame_size).map_err(|e| {
            MediaError::Backend(format!("cannot allocate a {} byte frame: {}", frame_size, e))
        })?;
        data.resize(frame_size, 0);

        let mut filled = 0;
        while filled < frame_size {
            match self.reader.read(&mut data[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(MediaError::from_read(e, self.read_timeout)),
            }
        }
        data.truncate(filled);

        let pts = self.frames_read;
        self.frames_read += 1;

        // A truncated frame is handed on as a short packet, the decoder rejects it
        Ok(Some(Packet::new(0, Some(pts), Bytes::from(data))))
    }
}

/// Decoder for uncompressed planar frames
///
/// Each packet holds exactly one frame, planes are sliced out without copying.
pub struct RawVideoDecoder {
    format: PixelFormat,
    width: usize,
    height: usize,
    expected: usize,
    pending: Option<DecodedFrame>,
}

impl RawVideoDecoder {
    pub fn new(format: PixelFormat, width: usize, height: usize) -> Self {
        Self {
            format,
            width,
            height,
            expected: format.frame_size(width, height),
            pending: None,
        }
    }
}

impl VideoDecoder for RawVideoDecoder {
    fn send_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
        if self.pending.is_some() {
            return Err(MediaError::Again);
        }

        let data = match packet.payload {
            PacketPayload::Bytes(data) => data,
            #[cfg(feature = "ffmpeg")]
            PacketPayload::Native(native) => Bytes::copy_from_slice(native.data()),
            #[cfg(feature = "network")]
            PacketPayload::Stream(native) => Bytes::copy_from_slice(native.data().unwrap_or(&[])),
        };

        if data.len() != self.expected {
            return Err(MediaError::InvalidData(format!(
                "malformed packet: {} bytes, expected {} for {}x{} {}",
                data.len(),
                self.expected,
                self.width,
                self.height,
                self.format
            )));
        }

        let mut offset = 0;
        let planes = self
            .format
            .plane_layout(self.width, self.height)
            .into_iter()
            .map(|(row, rows)| {
                let plane = FramePlane {
                    data: data.slice(offset..offset + row * rows),
                    stride: row,
                };
                offset += row * rows;
                plane
            })
            .collect();

        self.pending = Some(DecodedFrame::from_planes(
            self.format,
            self.width,
            self.height,
            packet.pts,
            planes,
        ));
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError> {
        Ok(self.pending.take())
    }

    fn flush(&mut self) -> Result<(), MediaError> {
        Ok(())
    }
}
