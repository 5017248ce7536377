//! Network sources opened by libavformat: RTSP cameras, RTMP, HTTP, UDP/RTP
//! and SRT feeds
//!
//! Decoded pictures are copied out into [`FrameData::Planes`]. Formats the
//! software converter cannot read are first rescaled to 4:2:0 by swscale.

use super::{
    DecodedFrame, FramePlane, MediaError, MediaSource, OpenOptions, OpenedMedia, Packet,
    PacketPayload, PixelFormat, SourceLocator, StreamInfo, VideoDecoder,
};
use bytes::Bytes;
use ffmpeg_next as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{Context as ScalingContext, Flags as ScalingFlags};
use ffmpeg::util::error::EAGAIN;
use log::{debug, info};
use std::time::Duration;

impl From<ffmpeg::Error> for MediaError {
    fn from(err: ffmpeg::Error) -> Self {
        match err {
            ffmpeg::Error::Eof => MediaError::EndOfStream,
            ffmpeg::Error::Other { errno } if errno == EAGAIN => MediaError::Again,
            other => MediaError::Backend(other.to_string()),
        }
    }
}

fn known_format(format: Pixel) -> Option<PixelFormat> {
    match format {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        Pixel::YUV422P | Pixel::YUVJ422P => Some(PixelFormat::Yuv422p),
        Pixel::YUV444P | Pixel::YUVJ444P => Some(PixelFormat::Yuv444p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::GRAY8 => Some(PixelFormat::Gray),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        Pixel::BGR24 => Some(PixelFormat::Bgr24),
        Pixel::RGBA => Some(PixelFormat::Rgba),
        Pixel::BGRA => Some(PixelFormat::Bgra),
        _ => None,
    }
}

fn micros(duration: Duration) -> String {
    duration.as_micros().to_string()
}

/// Protocol options bounding connect and every blocking read
pub fn open_dictionary(scheme: &str, options: &OpenOptions) -> ffmpeg::Dictionary<'static> {
    let mut dict = ffmpeg::Dictionary::new();
    dict.set("rw_timeout", &micros(options.read_timeout));
    match scheme {
        "rtsp" | "rtsps" => {
            // socket timeout, named stimeout before FFmpeg 5
            dict.set("timeout", &micros(options.open_timeout));
            dict.set("stimeout", &micros(options.open_timeout));
        }
        "http" | "https" | "tcp" | "rtmp" | "rtmps" => {
            dict.set("timeout", &micros(options.open_timeout));
        }
        "srt" => {
            dict.set("connect_timeout", &options.open_timeout.as_millis().to_string());
        }
        _ => {}
    }
    dict
}

/// Open `locator` through libavformat and build a decoder for its best video stream
pub fn open_url(locator: &SourceLocator, options: &OpenOptions) -> Result<OpenedMedia, MediaError> {
    ffmpeg::init()?;

    let scheme = locator.scheme().unwrap_or_default();
    let url = locator.as_str().to_string();
    let input = ffmpeg::format::input_with_dictionary(&url, open_dictionary(scheme, options))?;

    let (info, decoder) = {
        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| MediaError::InvalidData(format!("{} has no video stream", locator)))?;
        let parameters = stream.parameters();
        let codec = parameters.id().name().to_string();
        let decoder = ffmpeg::codec::context::Context::from_parameters(parameters)?
            .decoder()
            .video()?;

        let info = StreamInfo {
            index: stream.index(),
            codec,
            width: decoder.width() as usize,
            height: decoder.height() as usize,
        };
        (info, decoder)
    };

    info!(
        "Opened {} stream {} ({} {}x{})",
        locator, info.index, info.codec, info.width, info.height
    );

    Ok(OpenedMedia {
        source: Box::new(NetworkSource {
            input,
            info,
            needs_play: matches!(scheme, "rtsp" | "rtsps"),
        }),
        decoder: Box::new(NetworkDecoder {
            decoder,
            max_frame_bytes: options.max_frame_bytes,
            scaler: None,
        }),
    })
}

/// Demuxer over a libavformat input context
pub struct NetworkSource {
    input: ffmpeg::format::context::Input,
    info: StreamInfo,
    needs_play: bool,
}

// FFmpeg contexts are only touched by the worker thread that owns them
unsafe impl Send for NetworkSource {}

impl MediaSource for NetworkSource {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    /// RTSP servers hold the stream until PLAY, other protocols start on open
    fn begin_playback(&mut self) -> Result<(), MediaError> {
        if self.needs_play {
            self.input.play()?;
            debug!("Sent PLAY for stream {}", self.info.index);
        }
        Ok(())
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(&mut self.input) {
            Ok(()) => Ok(Some(Packet {
                stream_index: packet.stream(),
                pts: packet.pts(),
                payload: PacketPayload::Stream(packet),
            })),
            Err(ffmpeg::Error::Eof) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

struct CachedScaler {
    format: Pixel,
    width: u32,
    height: u32,
    context: ScalingContext,
}

/// Decoder for the selected stream, yielding owned planes
pub struct NetworkDecoder {
    decoder: ffmpeg::decoder::Video,
    max_frame_bytes: usize,
    scaler: Option<CachedScaler>,
}

unsafe impl Send for NetworkDecoder {}

impl NetworkDecoder {
    /// Rescale an unreadable format to 4:2:0, reusing the context while the
    /// source geometry holds
    fn to_yuv420(&mut self, frame: &ffmpeg::frame::Video) -> Result<ffmpeg::frame::Video, MediaError> {
        let (format, width, height) = (frame.format(), frame.width(), frame.height());
        let stale = self
            .scaler
            .as_ref()
            .is_none_or(|s| (s.format, s.width, s.height) != (format, width, height));
        if stale {
            debug!("Building 4:2:0 rescaler for {:?} {}x{}", format, width, height);
            let context = ScalingContext::get(
                format,
                width,
                height,
                Pixel::YUV420P,
                width,
                height,
                ScalingFlags::BILINEAR,
            )?;
            self.scaler = Some(CachedScaler {
                format,
                width,
                height,
                context,
            });
        }

        let mut out = ffmpeg::frame::Video::empty();
        if let Some(scaler) = self.scaler.as_mut() {
            scaler.context.run(frame, &mut out)?;
        }
        out.set_pts(frame.pts());
        Ok(out)
    }

    fn copy_out(&mut self, frame: ffmpeg::frame::Video) -> Result<DecodedFrame, MediaError> {
        let (format, frame) = match known_format(frame.format()) {
            Some(format) => (format, frame),
            None => (PixelFormat::Yuv420p, self.to_yuv420(&frame)?),
        };

        let width = frame.width() as usize;
        let height = frame.height() as usize;
        if format
            .checked_frame_size(width, height)
            .is_none_or(|size| size > self.max_frame_bytes)
        {
            return Err(MediaError::InvalidData(format!(
                "{}x{} {} frames exceed the {} byte limit",
                width, height, format, self.max_frame_bytes
            )));
        }

        let planes = (0..format.plane_layout(width, height).len())
            .map(|i| FramePlane {
                data: Bytes::copy_from_slice(frame.data(i)),
                stride: frame.stride(i),
            })
            .collect();

        Ok(DecodedFrame::from_planes(format, width, height, frame.pts(), planes))
    }
}

impl VideoDecoder for NetworkDecoder {
    fn send_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
        match &packet.payload {
            PacketPayload::Stream(native) => self.decoder.send_packet(native)?,
            _ => {
                let mut copy = ffmpeg::Packet::copy(packet.data());
                copy.set_pts(packet.pts);
                self.decoder.send_packet(&copy)?
            }
        }
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError> {
        let mut frame = ffmpeg::frame::Video::empty();
        match self.decoder.receive_frame(&mut frame) {
            Ok(()) => self.copy_out(frame).map(Some),
            Err(e) => match MediaError::from(e) {
                MediaError::Again | MediaError::EndOfStream => Ok(None),
                other => Err(other),
            },
        }
    }

    fn flush(&mut self) -> Result<(), MediaError> {
        match self.decoder.send_eof() {
            Ok(()) | Err(ffmpeg::Error::Eof) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> OpenOptions {
        OpenOptions {
            open_timeout: Duration::from_secs(3),
            read_timeout: Duration::from_millis(1500),
            max_frame_bytes: 64 << 20,
        }
    }

    #[test]
    fn test_rtsp_options_bound_connect_and_reads() {
        let dict = open_dictionary("rtsp", &options());
        assert_eq!(dict.get("rw_timeout"), Some("1500000"));
        assert_eq!(dict.get("timeout"), Some("3000000"));
    }

    #[test]
    fn test_srt_connect_timeout_is_in_millis() {
        let dict = open_dictionary("srt", &options());
        assert_eq!(dict.get("connect_timeout"), Some("3000"));
        assert_eq!(dict.get("timeout"), None);
    }

    #[test]
    fn test_transient_decoder_errors() {
        assert!(MediaError::from(ffmpeg::Error::Eof).is_transient());
        assert!(MediaError::from(ffmpeg::Error::Other { errno: EAGAIN }).is_transient());
        assert!(!MediaError::from(ffmpeg::Error::InvalidData).is_transient());
    }

    #[test]
    fn test_pixel_format_mapping() {
        assert_eq!(known_format(Pixel::YUVJ420P), Some(PixelFormat::Yuv420p));
        assert_eq!(known_format(Pixel::BGRA), Some(PixelFormat::Bgra));
        assert_eq!(known_format(Pixel::YUV420P10LE), None);
    }

    #[test]
    fn test_unreachable_camera_fails_to_open() {
        // nothing listens on the discard port of the loopback address
        let locator = SourceLocator::parse("rtsp://127.0.0.1:9/live").unwrap();
        let err = open_url(&locator, &options()).err().unwrap();
        assert!(!err.is_transient());
    }
}
