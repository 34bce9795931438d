//! Compression codec detection and streaming decoders.
//!
//! Images are often stored compressed. Six codec families are recognised
//! by their first two bytes:
//!
//! ```text
//! gzip   1f 8b        xz     fd 37
//! bzip2  42 5a        lzma   5d 00
//! zstd   28 b5        lz4    04 22
//! ```
//!
//! A decoded stream supports forward reads only. Whether that is enough
//! depends on the caller: sequential verification works fine, mounting
//! does not. The caller decides up front via the `sequential` flag on
//! [`super::ByteSource::open`]; when seeking would be required, opening
//! fails with [`ImageError::NotSeekable`] carrying a ready-made
//! decompress-and-retry suggestion.

use std::fmt;
use std::io::{self, Read};
use std::path::Path;

/// Compression codec, detected from the first two bytes of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Bzip2,
    Zstd,
    Xz,
    Lzma,
    Lz4,
}

impl Codec {
    /// Match the two-byte magic against the known codecs.
    pub fn detect(magic: &[u8]) -> Option<Codec> {
        if magic.len() < 2 {
            return None;
        }
        match [magic[0], magic[1]] {
            [0x1f, 0x8b] => Some(Codec::Gzip),
            [0x42, 0x5a] => Some(Codec::Bzip2),
            [0x28, 0xb5] => Some(Codec::Zstd),
            [0xfd, 0x37] => Some(Codec::Xz),
            [0x5d, 0x00] => Some(Codec::Lzma),
            [0x04, 0x22] => Some(Codec::Lz4),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::Gzip  => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Zstd  => "zstd",
            Codec::Xz    => "xz",
            Codec::Lzma  => "lzma",
            Codec::Lz4   => "lz4",
        }
    }

    /// File-name extension this codec conventionally carries.
    fn extension(self) -> &'static str {
        match self {
            Codec::Gzip  => "gz",
            Codec::Bzip2 => "bz2",
            Codec::Zstd  => "zstd",
            Codec::Xz    => "xz",
            Codec::Lzma  => "lzma",
            Codec::Lz4   => "lz4",
        }
    }

    /// Wrap `inner` in a streaming decoder for this codec.
    pub fn decoder(
        self,
        inner: Box<dyn Read + Send>,
    ) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            Codec::Gzip  => Box::new(flate2::read::GzDecoder::new(inner)),
            Codec::Bzip2 => Box::new(bzip2::read::BzDecoder::new(inner)),
            Codec::Zstd  => Box::new(zstd::stream::read::Decoder::new(inner)?),
            Codec::Xz    => Box::new(xz2::read::XzDecoder::new(inner)),
            Codec::Lzma => {
                let stream = xz2::stream::Stream::new_lzma_decoder(u64::MAX)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
                Box::new(xz2::read::XzDecoder::new_stream(inner, stream))
            }
            Codec::Lz4   => Box::new(lz4_flex::frame::FrameDecoder::new(inner)),
        })
    }

    /// Error message suggesting the shell command that uncompresses the
    /// image so it can be retried as a regular file.
    pub fn retry_hint(self, path: &Path) -> String {
        let filename = path.display().to_string();
        let out_name = suggest_output_name(path, self.extension());
        match self {
            Codec::Gzip => format!(
                "File '{filename}' is gzip-compressed; run 'gunzip < \
                 {filename} > {out_name}' and try again with '{out_name}'."
            ),
            Codec::Bzip2 => format!(
                "File '{filename}' is bzip2-compressed; run 'bunzip2 < \
                 {filename} > {out_name}' and try again with '{out_name}'."
            ),
            _ => {
                // zstd decodes all of its sibling formats.
                let fmt = match self {
                    Codec::Xz | Codec::Lzma => "lzma",
                    other => other.extension(),
                };
                format!(
                    "File '{filename}' is {fmt}-compressed; run 'zstd -d \
                     --format={fmt} -o {out_name} {filename}' and try again \
                     with '{out_name}'."
                )
            }
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Pick an output file name for the uncompressed image that does not
/// collide with an existing file: strip the codec extension, make sure the
/// name ends in `.img`, and append `_1`, `_2`, ... while taken.
fn suggest_output_name(path: &Path, extension: &str) -> String {
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut out_name = filename.replace(&format!(".{extension}"), "");
    if out_name == filename
        || !out_name.ends_with(".img")
        || Path::new(&out_name).exists()
    {
        if Path::new(&format!("{out_name}.img")).exists() {
            let mut i = 1;
            while Path::new(&format!("{out_name}_{i}.img")).exists() {
                i += 1;
            }
            out_name = format!("{out_name}_{i}.img");
        } else {
            out_name.push_str(".img");
        }
    }
    out_name
}
