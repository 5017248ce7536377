use super::{ConvertError, ScaleContext, copy_plane};
use crate::media::{DecodedFrame, PixelFormat, PlaneRef};

/// Color conversion and nearest-neighbour scaling in plain Rust
///
/// Source and destination index maps are computed once per geometry, so a
/// frame costs one table lookup per pixel and axis.
pub struct SoftwareScaler {
    src_format: PixelFormat,
    src_width: usize,
    src_height: usize,
    dst_format: PixelFormat,
    dst_width: usize,
    dst_height: usize,
    x_map: Vec<usize>,
    y_map: Vec<usize>,
}

impl SoftwareScaler {
    pub fn new(
        src_format: PixelFormat,
        src_width: usize,
        src_height: usize,
        dst_format: PixelFormat,
        dst_width: usize,
        dst_height: usize,
    ) -> Result<Self, ConvertError> {
        if !dst_format.is_packed_rgb() {
            return Err(ConvertError::Unsupported {
                from: src_format.to_string(),
                to: dst_format,
            });
        }
        if src_width == 0 || src_height == 0 || dst_width == 0 || dst_height == 0 {
            return Err(ConvertError::InvalidFrame(format!(
                "zero sized conversion {}x{} -> {}x{}",
                src_width, src_height, dst_width, dst_height
            )));
        }

        Ok(Self {
            src_format,
            src_width,
            src_height,
            dst_format,
            dst_width,
            dst_height,
            x_map: nearest_map(src_width, dst_width),
            y_map: nearest_map(src_height, dst_height),
        })
    }

    fn is_passthrough(&self) -> bool {
        self.src_format == self.dst_format
            && self.src_width == self.dst_width
            && self.src_height == self.dst_height
    }

    fn check_planes(&self, planes: &[PlaneRef<'_>]) -> Result<(), ConvertError> {
        let layout = self.src_format.plane_layout(self.src_width, self.src_height);
        if planes.len() < layout.len() {
            return Err(ConvertError::InvalidFrame(format!(
                "{} needs {} planes, frame has {}",
                self.src_format,
                layout.len(),
                planes.len()
            )));
        }

        for (i, (plane, (row, rows))) in planes.iter().zip(layout).enumerate() {
            let needed = (rows - 1) * plane.stride + row;
            if plane.stride < row || plane.data.len() < needed {
                return Err(ConvertError::InvalidFrame(format!(
                    "plane {} holds {} bytes with stride {}, needs {}",
                    i,
                    plane.data.len(),
                    plane.stride,
                    needed
                )));
            }
        }
        Ok(())
    }

    fn convert_planes(&self, planes: &[PlaneRef<'_>], dst: &mut [u8], stride: usize) -> Result<(), ConvertError> {
        self.check_planes(planes)?;

        if self.is_passthrough() {
            let row_bytes = self.dst_width * self.dst_format.bytes_per_pixel().unwrap_or(4);
            copy_plane(dst, stride, planes[0].data, planes[0].stride, row_bytes, self.dst_height);
            return Ok(());
        }

        match self.src_format {
            PixelFormat::Yuv420p => {
                let (y, u, v) = (planes[0], planes[1], planes[2]);
                self.fill(dst, stride, |sx, sy| {
                    yuv_to_rgb(at(&y, sx, sy), at(&u, sx / 2, sy / 2), at(&v, sx / 2, sy / 2))
                });
            }
            PixelFormat::Yuv422p => {
                let (y, u, v) = (planes[0], planes[1], planes[2]);
                self.fill(dst, stride, |sx, sy| {
                    yuv_to_rgb(at(&y, sx, sy), at(&u, sx / 2, sy), at(&v, sx / 2, sy))
                });
            }
            PixelFormat::Yuv444p => {
                let (y, u, v) = (planes[0], planes[1], planes[2]);
                self.fill(dst, stride, |sx, sy| {
                    yuv_to_rgb(at(&y, sx, sy), at(&u, sx, sy), at(&v, sx, sy))
                });
            }
            PixelFormat::Nv12 => {
                let (y, uv) = (planes[0], planes[1]);
                self.fill(dst, stride, |sx, sy| {
                    let cx = (sx / 2) * 2;
                    yuv_to_rgb(at(&y, sx, sy), at(&uv, cx, sy / 2), at(&uv, cx + 1, sy / 2))
                });
            }
            PixelFormat::Gray => {
                let g = planes[0];
                self.fill(dst, stride, |sx, sy| {
                    let l = at(&g, sx, sy);
                    [l, l, l]
                });
            }
            PixelFormat::Rgb24 | PixelFormat::Rgba => {
                let p = planes[0];
                let bpp = self.src_format.bytes_per_pixel().unwrap_or(3);
                self.fill(dst, stride, |sx, sy| {
                    let i = sy * p.stride + sx * bpp;
                    [p.data[i], p.data[i + 1], p.data[i + 2]]
                });
            }
            PixelFormat::Bgr24 | PixelFormat::Bgra => {
                let p = planes[0];
                let bpp = self.src_format.bytes_per_pixel().unwrap_or(3);
                self.fill(dst, stride, |sx, sy| {
                    let i = sy * p.stride + sx * bpp;
                    [p.data[i + 2], p.data[i + 1], p.data[i]]
                });
            }
        }
        Ok(())
    }

    /// Write every destination pixel from `sample(src_x, src_y) -> [r, g, b]`
    fn fill(&self, dst: &mut [u8], stride: usize, sample: impl Fn(usize, usize) -> [u8; 3]) {
        let bpp = self.dst_format.bytes_per_pixel().unwrap_or(4);
        let row_bytes = self.dst_width * bpp;

        for (dy, &sy) in self.y_map.iter().enumerate() {
            let row = &mut dst[dy * stride..dy * stride + row_bytes];
            for (px, &sx) in row.chunks_exact_mut(bpp).zip(&self.x_map) {
                let [r, g, b] = sample(sx, sy);
                match self.dst_format {
                    PixelFormat::Bgra => px.copy_from_slice(&[b, g, r, 255]),
                    PixelFormat::Rgba => px.copy_from_slice(&[r, g, b, 255]),
                    PixelFormat::Rgb24 => px.copy_from_slice(&[r, g, b]),
                    PixelFormat::Bgr24 => px.copy_from_slice(&[b, g, r]),
                    _ => {}
                }
            }
        }
    }
}

impl ScaleContext for SoftwareScaler {
    fn scale(&mut self, frame: &DecodedFrame, dst: &mut [u8], dst_stride: usize) -> Result<(), ConvertError> {
        if frame.width != self.src_width || frame.height != self.src_height {
            return Err(ConvertError::InvalidFrame(format!(
                "frame is {}x{}, context expects {}x{}",
                frame.width, frame.height, self.src_width, self.src_height
            )));
        }

        let row_bytes = self.dst_width * self.dst_format.bytes_per_pixel().unwrap_or(4);
        let needed = (self.dst_height - 1) * dst_stride + row_bytes;
        if dst_stride < row_bytes || dst.len() < needed {
            return Err(ConvertError::InvalidFrame(format!(
                "destination of {} bytes cannot hold {}x{} {}",
                dst.len(),
                self.dst_width,
                self.dst_height,
                self.dst_format
            )));
        }

        frame.with_planes(|planes| self.convert_planes(planes, dst, dst_stride))
    }
}

#[inline]
fn at(plane: &PlaneRef<'_>, x: usize, y: usize) -> u8 {
    plane.data[y * plane.stride + x]
}

/// Full range BT.601 in 7-bit fixed point
#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let y = y as i32;
    let u = u as i32 - 128;
    let v = v as i32 - 128;

    let r = y + ((v * 179) >> 7);
    let g = y - ((u * 44) >> 7) - ((v * 91) >> 7);
    let b = y + ((u * 227) >> 7);
    [r.clamp(0, 255) as u8, g.clamp(0, 255) as u8, b.clamp(0, 255) as u8]
}

/// Source index sampled by each destination index, pixel centers aligned
fn nearest_map(src: usize, dst: usize) -> Vec<usize> {
    (0..dst)
        .map(|i| (((2 * i + 1) * src) / (2 * dst)).min(src - 1))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FramePlane;
    use bytes::Bytes;

    fn planar(format: PixelFormat, width: usize, height: usize, planes: Vec<Vec<u8>>) -> DecodedFrame {
        let layout = format.plane_layout(width, height);
        let planes = planes
            .into_iter()
            .zip(layout)
            .map(|(data, (row, _))| FramePlane {
                data: Bytes::from(data),
                stride: row,
            })
            .collect();
        DecodedFrame::from_planes(format, width, height, None, planes)
    }

    #[test]
    fn test_yuv_white_and_black() {
        assert_eq!(yuv_to_rgb(255, 128, 128), [255, 255, 255]);
        assert_eq!(yuv_to_rgb(0, 128, 128), [0, 0, 0]);
        // saturated red-ish chroma stays in range
        let [r, _, b] = yuv_to_rgb(76, 85, 255);
        assert!(r > 200 && b < 60);
    }

    #[test]
    fn test_yuv420_to_bgra() {
        let frame = planar(
            PixelFormat::Yuv420p,
            2,
            2,
            vec![vec![0, 255, 255, 0], vec![128], vec![128]],
        );
        let mut scaler = SoftwareScaler::new(PixelFormat::Yuv420p, 2, 2, PixelFormat::Bgra, 2, 2).unwrap();
        let mut dst = vec![0u8; 16];
        scaler.scale(&frame, &mut dst, 8).unwrap();

        assert_eq!(&dst[0..4], &[0, 0, 0, 255]);
        assert_eq!(&dst[4..8], &[255, 255, 255, 255]);
        assert_eq!(&dst[8..12], &[255, 255, 255, 255]);
        assert_eq!(&dst[12..16], &[0, 0, 0, 255]);
    }

    #[test]
    fn test_downscale_picks_nearest_pixels() {
        // 4x1 gray ramp halved to 2x1 samples the centers of each pair
        let frame = planar(PixelFormat::Gray, 4, 1, vec![vec![10, 20, 30, 40]]);
        let mut scaler = SoftwareScaler::new(PixelFormat::Gray, 4, 1, PixelFormat::Rgb24, 2, 1).unwrap();
        let mut dst = vec![0u8; 6];
        scaler.scale(&frame, &mut dst, 6).unwrap();

        assert_eq!(dst, vec![20, 20, 20, 40, 40, 40]);
    }

    #[test]
    fn test_rgb_to_bgra_swaps_channels() {
        let frame = planar(PixelFormat::Rgb24, 1, 1, vec![vec![1, 2, 3]]);
        let mut scaler = SoftwareScaler::new(PixelFormat::Rgb24, 1, 1, PixelFormat::Bgra, 1, 1).unwrap();
        let mut dst = vec![0u8; 4];
        scaler.scale(&frame, &mut dst, 4).unwrap();

        assert_eq!(dst, vec![3, 2, 1, 255]);
    }

    #[test]
    fn test_same_format_and_size_copies_rows() {
        let frame = planar(PixelFormat::Bgra, 1, 2, vec![vec![1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut scaler = SoftwareScaler::new(PixelFormat::Bgra, 1, 2, PixelFormat::Bgra, 1, 2).unwrap();
        let mut dst = vec![0u8; 16];
        scaler.scale(&frame, &mut dst, 8).unwrap();

        assert_eq!(&dst[0..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[8..12], &[5, 6, 7, 8]);
    }

    #[test]
    fn test_short_plane_is_rejected() {
        let frame = planar(PixelFormat::Yuv420p, 4, 4, vec![vec![0; 16], vec![128; 2], vec![128; 4]]);
        let mut scaler = SoftwareScaler::new(PixelFormat::Yuv420p, 4, 4, PixelFormat::Bgra, 4, 4).unwrap();
        let mut dst = vec![0u8; 64];

        let err = scaler.scale(&frame, &mut dst, 16).unwrap_err();
        assert!(matches!(err, ConvertError::InvalidFrame(msg) if msg.contains("plane 1")));
    }

    #[test]
    fn test_planar_destination_is_unsupported() {
        assert!(matches!(
            SoftwareScaler::new(PixelFormat::Bgra, 4, 4, PixelFormat::Yuv420p, 4, 4),
            Err(ConvertError::Unsupported { .. })
        ));
    }
}
