//! Color/scale conversion of decoded frames into the consumer's pixel format

pub mod converter;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame_buffer;
pub mod policy;
pub mod software;

pub use converter::{Converter, FrameDescriptor};
pub use frame_buffer::{BufferError, FrameBuffer};
pub use policy::DownscalePolicy;
pub use software::SoftwareScaler;

use crate::media::{DecodedFrame, PixelFormat};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConvertError {
    #[error("unsupported conversion {from} -> {to}")]
    Unsupported { from: String, to: PixelFormat },
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("scaler failed: {0}")]
    Backend(String),
}

/// A configured conversion for one source geometry and format
pub trait ScaleContext: Send {
    /// Convert `frame` into `dst`, destination rows `dst_stride` bytes apart
    fn scale(&mut self, frame: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), ConvertError>;
}

/// Copy `rows` rows of `row_bytes` between buffers with different strides
///
/// # Performance
/// - Fast path: No padding on either side -> single memcpy
/// - Fallback: Row-by-row copy
#[inline]
pub(crate) fn copy_plane(
    dst: &mut [u8],
    dst_stride: usize,
    src: &[u8],
    src_stride: usize,
    row_bytes: usize,
    rows: usize,
) {
    let total = row_bytes * rows;

    // Fast path: No stride padding
    if src_stride == row_bytes && dst_stride == row_bytes && src.len() >= total && dst.len() >= total {
        dst[..total].copy_from_slice(&src[..total]);
        return;
    }

    // Fallback: Row-by-row copy
    for r in 0..rows {
        let src_start = r * src_stride;
        let dst_start = r * dst_stride;
        if src_start + row_bytes > src.len() || dst_start + row_bytes > dst.len() {
            break;
        }
        dst[dst_start..dst_start + row_bytes].copy_from_slice(&src[src_start..src_start + row_bytes]);
    }
}
