//! Motion-JPEG decoder: a stream of back-to-back JPEG images.

use std::path::Path;

use image::{ImageFormat, RgbImage};

use crate::error::{PipelineError, Result};

pub struct MjpegDecoder {
    data: Vec<u8>,
    cursor: usize,
    frame_count: u64,
}

impl MjpegDecoder {
    pub fn open(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .map_err(|e| PipelineError::unreadable(format!("{}: {}", path.display(), e)))?;
        Ok(Self::from_bytes(data))
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            cursor: 0,
            frame_count: 0,
        }
    }

    /// Concatenate encoded JPEG images into one motion-JPEG stream.
    pub fn encode_stream<'a>(jpegs: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
        jpegs.into_iter().flatten().copied().collect()
    }

    fn next_jpeg(&mut self) -> Option<&[u8]> {
        let remaining = self.data.get(self.cursor..)?;
        let (start, end) = find_jpeg_bounds(remaining)?;
        let begin = self.cursor + start;
        let finish = self.cursor + end;
        self.cursor = finish;
        self.data.get(begin..finish)
    }
}

impl Iterator for MjpegDecoder {
    type Item = RgbImage;

    fn next(&mut self) -> Option<RgbImage> {
        let index = self.frame_count;
        let jpeg = self.next_jpeg()?;
        match image::load_from_memory_with_format(jpeg, ImageFormat::Jpeg) {
            Ok(decoded) => {
                self.frame_count += 1;
                Some(decoded.into_rgb8())
            }
            Err(e) => {
                log::debug!("mjpeg: frame {} undecodable, ending stream: {}", index, e);
                self.cursor = self.data.len();
                None
            }
        }
    }
}

/// Byte range of the first complete JPEG (SOI through EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == 0xD8)?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w[0] == 0xFF && w[1] == 0xD9)?;
    Some((start, start + 2 + end + 2))
}
