//! Crate-wide error taxonomy.
//!
//! Decoders and readers never recover from an error; they surface one of
//! these variants to the caller. The only sanctioned recovery is the
//! format probe redispatching on [`ImageError::WrongImageFile`], and only
//! while the underlying source is still seekable back to position 0.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::source::Codec;

#[derive(Error, Debug)]
pub enum ImageError {
    /// The magic bytes did not match the decoder being tried. Carries the
    /// peeked bytes so the probe can try the next decoder.
    #[error("{msg}")]
    WrongImageFile { msg: String, magic: Vec<u8> },

    /// Recognised format, but a major version or checksum mode this build
    /// does not handle.
    #[error("{0}")]
    UnsupportedVersion(String),

    /// A header failed its CRC, additive checksum, or magic validation.
    #[error("{0}")]
    HeaderCorrupt(String),

    /// Bitmap CRC mismatch, or the bitmap popcount disagrees with the
    /// header's in-use count.
    #[error("{0}")]
    BitmapCorrupt(String),

    /// Inline CRC mismatch, unexpected command byte, trailing data, or a
    /// global checksum mismatch in the data section.
    #[error("{0}")]
    DataCorrupt(String),

    /// Unexpected end of file mid-header, mid-block, or mid-check.
    #[error("Unexpected end of file at {at}.")]
    Truncated { at: u64 },

    /// Block number at or beyond the total block count.
    #[error("Block {block} is out of range.")]
    OutOfRange { block: u64 },

    /// Random access was requested on a source that cannot seek (a
    /// decompressed stream). Carries the codec so the caller can print a
    /// concrete decompress-and-retry suggestion.
    #[error("{hint}")]
    NotSeekable { codec: Codec, hint: String },

    /// Mounting requires a regular file; the image is something else.
    #[error("Image file '{path}' is {kind}. In order to mount an image as a \
             virtual partition, it must be a regular file.",
            path = .path.display())]
    NotARegularFile { path: PathBuf, kind: &'static str },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;

impl ImageError {
    /// Map an `UnexpectedEof` from the byte source to [`Truncated`] at the
    /// given position; pass every other I/O error through.
    pub(crate) fn from_read(e: io::Error, at: u64) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ImageError::Truncated { at }
        } else {
            ImageError::Io(e)
        }
    }
}
