//! Compressed containers through the system FFmpeg libraries

use super::{
    DecodedFrame, FrameData, FrameFormat, MediaError, MediaSource, OpenedMedia, Packet,
    PacketPayload, PixelFormat, StreamInfo, VideoDecoder,
};
use ac_ffmpeg::codec::{CodecError, Decoder};
use ac_ffmpeg::codec::video::{self, VideoFrame};
use ac_ffmpeg::format::demuxer::{Demuxer, DemuxerWithStreamInfo};
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::packet::PacketMut;
use std::io::{Read, Seek};

impl From<ac_ffmpeg::Error> for MediaError {
    fn from(err: ac_ffmpeg::Error) -> Self {
        MediaError::Backend(err.to_string())
    }
}

/// A full decoder input queue is transient: the pending frames are drained
/// and the next packet is pushed
fn codec_error(err: CodecError) -> MediaError {
    if err.is_again() {
        MediaError::Again
    } else {
        MediaError::Backend(err.to_string())
    }
}

/// Map an FFmpeg pixel format to one the software converter reads directly
pub fn known_format(format: video::PixelFormat) -> Option<PixelFormat> {
    PixelFormat::ALL
        .into_iter()
        .find(|known| video::frame::get_pixel_format(known.name()) == format)
        .or_else(|| {
            // full range 4:2:0 shares the planar layout
            (video::frame::get_pixel_format("yuvj420p") == format).then_some(PixelFormat::Yuv420p)
        })
}

pub(crate) fn frame_format(frame: &VideoFrame) -> FrameFormat {
    let format = frame.pixel_format();
    match known_format(format) {
        Some(known) => FrameFormat::Raw(known),
        None => FrameFormat::Native(format),
    }
}

/// Demuxer over a Rust byte stream with the best video stream selected
pub struct FfmpegSource<T> {
    demuxer: DemuxerWithStreamInfo<T>,
    info: StreamInfo,
}

// FFmpeg contexts are only touched by the worker thread that owns them
unsafe impl<T: Send> Send for FfmpegSource<T> {}

impl<T: Send> MediaSource for FfmpegSource<T> {
    fn stream_info(&self) -> &StreamInfo {
        &self.info
    }

    fn read_packet(&mut self) -> Result<Option<Packet>, MediaError> {
        let Some(packet) = self.demuxer.take()? else {
            return Ok(None);
        };

        let pts = packet.pts();
        Ok(Some(Packet {
            stream_index: packet.stream_index(),
            pts: (!pts.is_null()).then(|| pts.timestamp()),
            payload: PacketPayload::Native(packet),
        }))
    }
}

/// Decoder built from the selected stream's codec parameters
pub struct FfmpegDecoder {
    decoder: video::VideoDecoder,
}

unsafe impl Send for FfmpegDecoder {}

impl VideoDecoder for FfmpegDecoder {
    fn send_packet(&mut self, packet: Packet) -> Result<(), MediaError> {
        let packet = match packet.payload {
            PacketPayload::Native(native) => native,
            PacketPayload::Bytes(data) => PacketMut::from(&data[..]).freeze(),
            #[cfg(feature = "network")]
            PacketPayload::Stream(native) => PacketMut::from(native.data().unwrap_or(&[])).freeze(),
        };
        self.decoder.try_push(packet).map_err(codec_error)
    }

    fn receive_frame(&mut self) -> Result<Option<DecodedFrame>, MediaError> {
        let Some(frame) = self.decoder.take()? else {
            return Ok(None);
        };

        let pts = frame.pts();
        Ok(Some(DecodedFrame {
            width: frame.width(),
            height: frame.height(),
            pts: (!pts.is_null()).then(|| pts.timestamp()),
            data: FrameData::Native(frame),
        }))
    }

    fn flush(&mut self) -> Result<(), MediaError> {
        self.decoder.try_flush().map_err(codec_error)
    }
}

/// Open a seekable input such as a local file
pub fn open_seekable<T: Read + Seek + Send + 'static>(input: T) -> Result<OpenedMedia, MediaError> {
    open_io(IO::from_seekable_read_stream(input))
}

/// Open a forward-only input such as a socket
pub fn open_stream<T: Read + Send + 'static>(input: T) -> Result<OpenedMedia, MediaError> {
    open_io(IO::from_read_stream(input))
}

fn open_io<T: Send + 'static>(io: IO<T>) -> Result<OpenedMedia, MediaError> {
    let demuxer = Demuxer::builder()
        .build(io)?
        .find_stream_info(None)
        .map_err(|(_, e)| MediaError::from(e))?;

    // Largest picture wins when a container carries several video streams
    let (index, stream) = demuxer
        .streams()
        .iter()
        .enumerate()
        .filter(|(_, s)| s.codec_parameters().is_video_codec())
        .max_by_key(|(_, s)| {
            s.codec_parameters()
                .as_video_codec_parameters()
                .map(|p| p.width() * p.height())
                .unwrap_or(0)
        })
        .ok_or_else(|| MediaError::InvalidData("no video stream".into()))?;

    let params = stream
        .codec_parameters()
        .into_video_codec_parameters()
        .ok_or_else(|| MediaError::InvalidData("no video codec parameters".into()))?;

    let info = StreamInfo {
        index,
        codec: params.decoder_name().unwrap_or("unknown").to_string(),
        width: params.width(),
        height: params.height(),
    };

    let decoder = video::VideoDecoder::from_stream(stream)?.build()?;

    log::info!(
        "FFmpeg opened stream {} ({} {}x{})",
        info.index,
        info.codec,
        info.width,
        info.height
    );

    Ok(OpenedMedia {
        source: Box::new(FfmpegSource { demuxer, info }),
        decoder: Box::new(FfmpegDecoder { decoder }),
    })
}
