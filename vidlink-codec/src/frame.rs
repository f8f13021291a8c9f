use std::fmt::{Display, Formatter};

use bytes::Bytes;
use ffmpeg_next::format::Pixel;

use crate::{error::CodecError, scaler::Scaler};

/// Packed single-plane pixel layouts accepted from sources and handed to sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Rgba,
    Bgra,
    Gray8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba | PixelFormat::Bgra => 4,
            PixelFormat::Gray8 => 1,
        }
    }

    pub fn as_pixel(&self) -> Pixel {
        match self {
            PixelFormat::Rgb24 => Pixel::RGB24,
            PixelFormat::Bgr24 => Pixel::BGR24,
            PixelFormat::Rgba => Pixel::RGBA,
            PixelFormat::Bgra => Pixel::BGRA,
            PixelFormat::Gray8 => Pixel::GRAY8,
        }
    }
}

/// A decoded image buffer plus its position in the stream.
///
/// Owned by exactly one pipeline stage at a time; every queue hand-off moves it.
#[derive(Debug, Clone)]
pub struct RawFrame {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    data: Bytes,
    sequence: u64,
}

impl RawFrame {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        data: impl Into<Bytes>,
        sequence: u64,
    ) -> Result<Self, CodecError> {
        let data = data.into();
        if width == 0 || height == 0 {
            return Err(CodecError::InvalidFrame(format!(
                "invalid video size {}x{}",
                width, height
            )));
        }
        let row_len = width as usize * format.bytes_per_pixel();
        if stride < row_len {
            return Err(CodecError::InvalidFrame(format!(
                "stride {} shorter than row {}",
                stride, row_len
            )));
        }
        // the last row only needs to cover its pixels, not the full stride
        let needed = stride * (height as usize - 1) + row_len;
        if data.len() < needed {
            return Err(CodecError::InvalidFrame(format!(
                "buffer holds {} bytes, {}x{} {:?} needs {}",
                data.len(),
                width,
                height,
                format,
                needed
            )));
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            data,
            sequence,
        })
    }

    /// Tightly packed frame, `stride == width * bytes_per_pixel`.
    pub fn packed(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
        sequence: u64,
    ) -> Result<Self, CodecError> {
        let stride = width as usize * format.bytes_per_pixel();
        Self::new(width, height, format, stride, data, sequence)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn same_size(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }

    /// Pixel bytes of row `y`, without stride padding.
    pub fn row(&self, y: usize) -> &[u8] {
        let start = y * self.stride;
        &self.data[start..start + self.row_len()]
    }

    fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Copies the pixels into an FFmpeg frame of the same format.
    pub(crate) fn to_video(&self) -> ffmpeg_next::frame::Video {
        let mut video =
            ffmpeg_next::frame::Video::new(self.format.as_pixel(), self.width, self.height);
        let row_len = self.row_len();
        let dst_stride = video.stride(0);
        let dst = video.data_mut(0);
        for y in 0..self.height as usize {
            let offset = y * dst_stride;
            dst[offset..offset + row_len].copy_from_slice(self.row(y));
        }
        video
    }

    /// Packs plane 0 of an FFmpeg frame already converted to `format`.
    pub(crate) fn from_video(
        video: &ffmpeg_next::frame::Video,
        format: PixelFormat,
        sequence: u64,
    ) -> Result<Self, CodecError> {
        if video.format() != format.as_pixel() {
            return Err(CodecError::Conversion(format!(
                "frame is {:?}, expected {:?}",
                video.format(),
                format
            )));
        }
        let width = video.width();
        let height = video.height();
        let row_len = width as usize * format.bytes_per_pixel();
        let src_stride = video.stride(0);
        let src = video.data(0);
        let mut data = Vec::with_capacity(row_len * height as usize);
        for y in 0..height as usize {
            let offset = y * src_stride;
            data.extend_from_slice(&src[offset..offset + row_len]);
        }
        Self::packed(width, height, format, data, sequence)
    }
}

impl Display for RawFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "RawFrame seq: {}, {}x{} {:?}, stride: {}, data_len: {}",
            self.sequence,
            self.width,
            self.height,
            self.format,
            self.stride,
            self.data.len()
        )
    }
}

/// Rescales `frame` to `width`x`height`, keeping format and sequence.
///
/// Frames already at the requested size are returned as a cheap clone.
pub fn resize(frame: &RawFrame, width: u32, height: u32) -> Result<RawFrame, CodecError> {
    if frame.same_size(width, height) {
        return Ok(frame.clone());
    }
    if width == 0 || height == 0 {
        return Err(CodecError::InvalidFrame(format!(
            "invalid target size {}x{}",
            width, height
        )));
    }
    let pixel = frame.format().as_pixel();
    let mut scaler = Scaler::convert(
        (pixel, frame.width(), frame.height()),
        (pixel, width, height),
    )?;
    let mut resized = ffmpeg_next::frame::Video::empty();
    scaler.run(&frame.to_video(), &mut resized)?;
    RawFrame::from_video(&resized, frame.format(), frame.sequence())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_frame_rows() {
        let data: Vec<u8> = (0..24).collect();
        let frame = RawFrame::packed(4, 2, PixelFormat::Rgb24, data, 7).unwrap();
        assert_eq!(frame.stride(), 12);
        assert_eq!(frame.row(1)[0], 12);
        assert_eq!(frame.sequence(), 7);
    }

    #[test]
    fn padded_stride_skips_padding() {
        // 2x2 gray with 4-byte stride: last row only needs its 2 pixels
        let data = vec![1u8, 2, 0, 0, 3, 4];
        let frame = RawFrame::new(2, 2, PixelFormat::Gray8, 4, data, 0).unwrap();
        assert_eq!(frame.row(0), &[1, 2]);
        assert_eq!(frame.row(1), &[3, 4]);
    }

    #[test]
    fn rejects_short_buffer_and_zero_size() {
        assert!(RawFrame::packed(4, 4, PixelFormat::Rgba, vec![0u8; 10], 0).is_err());
        assert!(RawFrame::packed(0, 4, PixelFormat::Rgba, Vec::<u8>::new(), 0).is_err());
        assert!(RawFrame::new(4, 1, PixelFormat::Rgb24, 8, vec![0u8; 12], 0).is_err());
    }

    #[test]
    fn resize_changes_dimensions() {
        let frame = RawFrame::packed(64, 48, PixelFormat::Rgb24, vec![128u8; 64 * 48 * 3], 3)
            .unwrap();
        let resized = resize(&frame, 32, 24).unwrap();
        assert_eq!((resized.width(), resized.height()), (32, 24));
        assert_eq!(resized.format(), PixelFormat::Rgb24);
        assert_eq!(resized.sequence(), 3);
        assert_eq!(resized.data().len(), 32 * 24 * 3);

        let same = resize(&frame, 64, 48).unwrap();
        assert_eq!(same.data(), frame.data());
    }
}
