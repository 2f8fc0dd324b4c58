use std::fs::File;
use std::io::Read;
use std::path::Path;

use image::RgbImage;

use super::mjpeg::MjpegDecoder;
use crate::error::{PipelineError, Result};

/// Decoded frames in decode order. A frame that fails to decode ends the
/// sequence.
pub type DecodedFrames = Box<dyn Iterator<Item = RgbImage>>;

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Open a decoder for the video at `path`, picking the backend from the
/// file's leading bytes.
///
/// Returns `SourceUnreadable` when no backend accepts the file.
pub fn open_decoder(path: &Path) -> Result<DecodedFrames> {
    let mut magic = [0u8; 3];
    let read = File::open(path)
        .and_then(|mut file| file.read(&mut magic))
        .map_err(|e| PipelineError::unreadable(format!("{}: {}", path.display(), e)))?;
    if read == 0 {
        return Err(PipelineError::unreadable(format!(
            "{}: empty video file",
            path.display()
        )));
    }

    if read == magic.len() && magic == JPEG_SOI {
        let decoder = MjpegDecoder::open(path)?;
        return Ok(Box::new(decoder));
    }

    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        let decoder = super::ffmpeg::FfmpegDecoder::open(path)?;
        Ok(Box::new(decoder))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(PipelineError::unreadable(format!(
            "{}: container decoding requires the ingest-file-ffmpeg feature",
            path.display()
        )))
    }
}
