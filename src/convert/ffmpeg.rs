use super::{ConvertError, ScaleContext, copy_plane};
use crate::media::{DecodedFrame, FrameData, PixelFormat};
use ac_ffmpeg::codec::video::{self, VideoFrameScaler};

/// swscale context for decoder outputs the software path cannot read
/// (high bit depth, exotic chroma layouts)
pub struct FfmpegScaler {
    scaler: VideoFrameScaler,
    dst_format: PixelFormat,
    dst_width: usize,
    dst_height: usize,
}

// Only the owning worker thread touches the context
unsafe impl Send for FfmpegScaler {}

impl FfmpegScaler {
    pub fn new(
        src_format: video::PixelFormat,
        src_width: usize,
        src_height: usize,
        dst_format: PixelFormat,
        dst_width: usize,
        dst_height: usize,
    ) -> Result<Self, ConvertError> {
        let scaler = VideoFrameScaler::builder()
            .source_pixel_format(src_format)
            .source_width(src_width)
            .source_height(src_height)
            .target_pixel_format(video::frame::get_pixel_format(dst_format.name()))
            .target_width(dst_width)
            .target_height(dst_height)
            .build()
            .map_err(|e| ConvertError::Backend(e.to_string()))?;

        Ok(Self {
            scaler,
            dst_format,
            dst_width,
            dst_height,
        })
    }
}

impl ScaleContext for FfmpegScaler {
    fn scale(&mut self, frame: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), ConvertError> {
        let FrameData::Native(native) = &frame.data else {
            return Err(ConvertError::InvalidFrame("swscale needs an FFmpeg frame".into()));
        };

        let scaled = self
            .scaler
            .scale(native)
            .map_err(|e| ConvertError::Backend(e.to_string()))?;

        let planes = scaled.planes();
        let plane = &planes[0];
        let row_bytes = self.dst_width * self.dst_format.bytes_per_pixel().unwrap_or(4);
        copy_plane(dst, dst_stride, plane.data(), plane.line_size(), row_bytes, self.dst_height);
        Ok(())
    }
}
