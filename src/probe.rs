//! Format probe: sniff the magic bytes and dispatch to a decoder.

use crate::error::{ImageError, Result};
use crate::image::Image;
use crate::ntfsclone::NtfsClone;
use crate::partclone::PartClone;
use crate::partimage::PartImage;
use crate::source::ByteSource;

pub const PARTCLONE_MAGIC: &[u8] = b"partclone-image";
pub const NTFSCLONE_MAGIC: &[u8] = b"\0ntfsclone-image";
/// The partimage magic proper is followed by 16 zero bytes.
pub const PARTIMAGE_MAGIC: &[u8] = b"PaRtImAgE-VoLuMe";

pub const PROBE_SIZE: usize = 32;

/// Image format selected by a probe or requested by a front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    PartClone,
    PartImage,
    NtfsClone,
}

impl Format {
    pub fn tool(self) -> &'static str {
        match self {
            Format::PartClone => "partclone",
            Format::PartImage => "partimage",
            Format::NtfsClone => "ntfsclone",
        }
    }
}

fn matches_partimage(magic: &[u8]) -> bool {
    magic.len() >= PROBE_SIZE
        && magic.starts_with(PARTIMAGE_MAGIC)
        && magic[PARTIMAGE_MAGIC.len()..PROBE_SIZE].iter().all(|&b| b == 0)
}

/// Peek the first bytes of `source` and hand it to whichever decoder's
/// magic matches, first match winning.
///
/// `expected` is the format of the invoking front-end; when no magic
/// matches, its decoder is still run so the error message names the tool
/// the user asked for.
pub fn open_image(
    mut source: ByteSource,
    expected: Format,
    index_stride: u32,
) -> Result<Image> {
    let magic = source.peek(PROBE_SIZE)?.to_vec();

    if magic.starts_with(PARTCLONE_MAGIC) {
        return Ok(Image::PartClone(PartClone::open(source, index_stride)?));
    }
    if magic.starts_with(NTFSCLONE_MAGIC) {
        return Ok(Image::NtfsClone(NtfsClone::open(source)?));
    }
    if matches_partimage(&magic) {
        return Ok(Image::PartImage(PartImage::open(source, index_stride)?));
    }

    // No magic matched: let the expected decoder produce its own
    // WrongImageFile diagnostic.
    match expected {
        Format::PartClone => Ok(Image::PartClone(PartClone::open(source, index_stride)?)),
        Format::PartImage => Ok(Image::PartImage(PartImage::open(source, index_stride)?)),
        Format::NtfsClone => Ok(Image::NtfsClone(NtfsClone::open(source)?)),
    }
}

pub(crate) fn wrong_image(msg: String, magic: &[u8]) -> ImageError {
    ImageError::WrongImageFile { msg, magic: magic.to_vec() }
}
