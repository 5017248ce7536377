use super::{ConvertError, DownscalePolicy, FrameBuffer, ScaleContext, SoftwareScaler};
use crate::error::PipelineError;
use crate::media::{DecodedFrame, FrameFormat, PixelFormat};
use log::{debug, info};

/// Geometry and format of a converted frame sitting in a [`FrameBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub width: usize,
    pub height: usize,
    /// Bytes per row
    pub stride: usize,
    pub format: PixelFormat,
    pub byte_len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ContextKey {
    src_format: FrameFormat,
    src_width: usize,
    src_height: usize,
    dst_format: PixelFormat,
    dst_width: usize,
    dst_height: usize,
}

struct ActiveContext {
    key: ContextKey,
    scaler: Box<dyn ScaleContext>,
}

/// Per-stream converter holding at most one scale context
///
/// The context is rebuilt only when the source geometry or format changes.
pub struct Converter {
    dest_format: PixelFormat,
    policy: DownscalePolicy,
    context: Option<ActiveContext>,
    contexts_built: u64,
}

impl Converter {
    pub fn new(dest_format: PixelFormat, policy: DownscalePolicy) -> Self {
        Self {
            dest_format,
            policy,
            context: None,
            contexts_built: 0,
        }
    }

    /// Prepare a context, a no-op when the current one already matches
    pub fn configure(
        &mut self,
        src_format: FrameFormat,
        src_width: usize,
        src_height: usize,
        dst_format: PixelFormat,
        dst_width: usize,
        dst_height: usize,
    ) -> Result<(), ConvertError> {
        let key = ContextKey {
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
        };
        if self.context.as_ref().is_some_and(|active| active.key == key) {
            return Ok(());
        }

        // Never keep a context for a geometry we cannot serve
        let rebuilt = self.context.take().is_some();
        let scaler: Box<dyn ScaleContext> = match src_format {
            FrameFormat::Raw(format) => Box::new(SoftwareScaler::new(
                format, src_width, src_height, dst_format, dst_width, dst_height,
            )?),
            #[cfg(feature = "ffmpeg")]
            FrameFormat::Native(format) => Box::new(super::ffmpeg::FfmpegScaler::new(
                format, src_width, src_height, dst_format, dst_width, dst_height,
            )?),
        };

        if rebuilt {
            info!(
                "Source geometry changed, scale context rebuilt for {:?} {}x{} -> {} {}x{}",
                src_format, src_width, src_height, dst_format, dst_width, dst_height
            );
        } else {
            debug!(
                "Scale context {:?} {}x{} -> {} {}x{}",
                src_format, src_width, src_height, dst_format, dst_width, dst_height
            );
        }
        self.context = Some(ActiveContext { key, scaler });
        self.contexts_built += 1;
        Ok(())
    }

    /// Convert `frame` into `buffer` following the downscale policy
    pub fn convert(&mut self, frame: &DecodedFrame, buffer: &mut FrameBuffer) -> Result<FrameDescriptor, PipelineError> {
        let (width, height) = self.policy.target(frame.width, frame.height);
        self.configure(frame.format(), frame.width, frame.height, self.dest_format, width, height)
            .map_err(PipelineError::convert)?;

        let stride = width * self.dest_format.bytes_per_pixel().unwrap_or(4);
        let byte_len = stride * height;
        let dst = buffer.ensure_capacity(byte_len).map_err(PipelineError::resource)?;

        let Some(active) = self.context.as_mut() else {
            return Err(PipelineError::convert("no scale context"));
        };
        active
            .scaler
            .scale(frame, dst, stride)
            .map_err(PipelineError::convert)?;

        Ok(FrameDescriptor {
            width,
            height,
            stride,
            format: self.dest_format,
            byte_len,
        })
    }

    pub fn dest_format(&self) -> PixelFormat {
        self.dest_format
    }

    /// Number of scale contexts created so far
    pub fn contexts_built(&self) -> u64 {
        self.contexts_built
    }

    /// Drop the scale context, returns whether one existed
    pub fn release(&mut self) -> bool {
        self.context.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use crate::media::FramePlane;
    use bytes::Bytes;

    fn gray(width: usize, height: usize, luma: u8) -> DecodedFrame {
        DecodedFrame::from_planes(
            PixelFormat::Gray,
            width,
            height,
            None,
            vec![FramePlane {
                data: Bytes::from(vec![luma; width * height]),
                stride: width,
            }],
        )
    }

    #[test]
    fn test_steady_stream_reuses_context_and_buffer() {
        let mut converter = Converter::new(PixelFormat::Bgra, DownscalePolicy::default());
        let mut buffer = FrameBuffer::new(64 << 20);

        for luma in [10, 20, 30] {
            let desc = converter.convert(&gray(320, 240, luma), &mut buffer).unwrap();
            assert_eq!((desc.width, desc.height, desc.stride), (320, 240, 1280));
            assert_eq!(buffer.as_slice()[0], luma);
        }
        assert_eq!(converter.contexts_built(), 1);
        assert_eq!(buffer.allocations(), 1);
    }

    #[test]
    fn test_geometry_change_rebuilds() {
        let mut converter = Converter::new(PixelFormat::Rgb24, DownscalePolicy::Disabled);
        let mut buffer = FrameBuffer::new(64 << 20);

        converter.convert(&gray(64, 48, 1), &mut buffer).unwrap();
        converter.convert(&gray(128, 96, 1), &mut buffer).unwrap();
        converter.convert(&gray(128, 96, 1), &mut buffer).unwrap();

        assert_eq!(converter.contexts_built(), 2);
        assert_eq!(buffer.allocations(), 2);
        assert_eq!(buffer.len(), 128 * 96 * 3);
    }

    #[test]
    fn test_hd_source_is_downscaled() {
        let mut converter = Converter::new(PixelFormat::Bgra, DownscalePolicy::default());
        let mut buffer = FrameBuffer::new(64 << 20);

        let desc = converter.convert(&gray(1280, 720, 200), &mut buffer).unwrap();
        assert_eq!((desc.width, desc.height), (640, 480));
        assert_eq!(desc.byte_len, 640 * 480 * 4);
        assert_eq!(&buffer.as_slice()[..4], &[200, 200, 200, 255]);
    }

    #[test]
    fn test_failures_are_tagged_by_stage() {
        let mut converter = Converter::new(PixelFormat::Bgra, DownscalePolicy::Disabled);

        let mut tiny = FrameBuffer::new(16);
        let err = converter.convert(&gray(8, 8, 0), &mut tiny).unwrap_err();
        assert_eq!(err.stage, Stage::Resource);

        let mut buffer = FrameBuffer::new(1 << 20);
        let broken = DecodedFrame::from_planes(PixelFormat::Yuv420p, 8, 8, None, Vec::new());
        let err = converter.convert(&broken, &mut buffer).unwrap_err();
        assert_eq!(err.stage, Stage::Convert);
    }

    #[test]
    fn test_release() {
        let mut converter = Converter::new(PixelFormat::Bgra, DownscalePolicy::Disabled);
        assert!(!converter.release());

        converter.configure(FrameFormat::Raw(PixelFormat::Gray), 4, 4, PixelFormat::Bgra, 4, 4).unwrap();
        assert!(converter.release());
        assert!(!converter.release());
    }
}
