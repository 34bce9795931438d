//! Seekable, peekable byte input for image decoders.
//!
//! A [`ByteSource`] is one of three tagged variants:
//!
//! - **File**: a plain regular file; reads and seeks pass straight through.
//! - **Split**: many `<stem>aa`, `<stem>ab`, ... part files presented as
//!   one contiguous stream (see [`split`]).
//! - **Stream**: a compressed file decoded on the fly (see [`codec`]).
//!   Forward reads only; any seek fails with
//!   [`ImageError::NotSeekable`] naming the codec.
//!
//! Decompression wraps concatenation: a split set of compressed parts is
//! first reassembled into the compressed byte stream, which the codec then
//! decodes.

mod codec;
mod split;

pub use codec::Codec;
pub use split::{SplitSource, MAX_OPEN_PARTS};

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{ImageError, Result};

enum SourceKind {
    File(File),
    Split(SplitSource),
    Stream {
        codec:  Codec,
        reader: Box<dyn Read + Send>,
    },
}

pub struct ByteSource {
    kind:   SourceKind,
    /// Bytes read ahead of the logical position by `peek`.
    peeked: Vec<u8>,
    pos:    u64,
    path:   PathBuf,
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .finish()
    }
}

impl ByteSource {
    /// Open `path`, transparently assembling split parts and unwrapping
    /// compression.
    ///
    /// `sequential` declares how the source will be used. A compressed
    /// image can only be streamed; when `sequential` is false (random
    /// access ahead, e.g. mounting) a compressed file is rejected up
    /// front with a decompress-and-retry suggestion instead of failing on
    /// the first seek.
    pub fn open(path: &Path, sequential: bool) -> Result<ByteSource> {
        let kind = if SplitSource::is_split(path) {
            SourceKind::Split(SplitSource::open(path)?)
        } else {
            SourceKind::File(File::open(path)?)
        };
        let mut source = ByteSource {
            kind,
            peeked: Vec::new(),
            pos: 0,
            path: path.to_path_buf(),
        };

        let Some(codec) = Codec::detect(source.peek(2)?) else {
            return Ok(source);
        };
        if !sequential {
            return Err(ImageError::NotSeekable {
                codec,
                hint: codec.retry_hint(path),
            });
        }
        log::debug!("decoding '{}' as a {codec} stream", path.display());
        let reader = codec.decoder(Box::new(source))?;
        Ok(ByteSource {
            kind: SourceKind::Stream { codec, reader },
            peeked: Vec::new(),
            pos: 0,
            path: path.to_path_buf(),
        })
    }

    /// Wrap an already-open regular file (used when a multi-volume image
    /// continues in its next volume).
    pub fn from_file(file: File, path: PathBuf) -> ByteSource {
        ByteSource { kind: SourceKind::File(file), peeked: Vec::new(), pos: 0, path }
    }

    fn kind_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.kind {
            SourceKind::File(f) => f.read(buf),
            SourceKind::Split(s) => s.read(buf),
            SourceKind::Stream { reader, .. } => reader.read(buf),
        }
    }

    /// Return up to `n` bytes without consuming them. Fewer than `n`
    /// bytes are returned only at end of input.
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.peeked.len() < n {
            let mut chunk = vec![0u8; n - self.peeked.len()];
            let got = self.kind_read(&mut chunk)?;
            if got == 0 {
                break;
            }
            self.peeked.extend_from_slice(&chunk[..got]);
        }
        Ok(&self.peeked[..n.min(self.peeked.len())])
    }

    /// Read exactly `buf.len()` bytes; end of input is a
    /// [`ImageError::Truncated`] at the current position.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let got = self
                .read(&mut buf[filled..])
                .map_err(|e| ImageError::from_read(e, self.pos))?;
            if got == 0 {
                return Err(ImageError::Truncated { at: self.pos });
            }
            filled += got;
        }
        Ok(())
    }

    /// Read up to `n` bytes; shorter only at end of input.
    pub fn read_up_to(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.read(&mut out[filled..])?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        out.truncate(filled);
        Ok(out)
    }

    /// Read a single byte; `None` at end of input.
    pub fn read_byte(&mut self) -> Result<Option<u8>> {
        let mut b = [0u8; 1];
        match self.read(&mut b)? {
            0 => Ok(None),
            _ => Ok(Some(b[0])),
        }
    }

    /// Read and discard `n` bytes (works on non-seekable streams).
    pub fn skip(&mut self, n: u64) -> Result<()> {
        let mut remaining = n;
        let mut scratch = [0u8; 4096];
        while remaining > 0 {
            let want = scratch.len().min(remaining as usize);
            self.read_exact(&mut scratch[..want])?;
            remaining -= want as u64;
        }
        Ok(())
    }

    /// Reposition to an absolute offset. Fails with
    /// [`ImageError::NotSeekable`] on a decompressed stream.
    pub fn seek(&mut self, pos: u64) -> Result<()> {
        match &mut self.kind {
            SourceKind::File(f) => {
                f.seek(SeekFrom::Start(pos))?;
            }
            SourceKind::Split(s) => s.seek(pos),
            SourceKind::Stream { codec, .. } => {
                return Err(ImageError::NotSeekable {
                    codec: *codec,
                    hint:  codec.retry_hint(&self.path),
                });
            }
        }
        self.peeked.clear();
        self.pos = pos;
        Ok(())
    }

    /// Current logical position (bytes consumed for streams).
    pub fn tell(&self) -> u64 {
        self.pos
    }

    pub fn is_seekable(&self) -> bool {
        !matches!(self.kind, SourceKind::Stream { .. })
    }

    /// Codec of a decompressed stream, `None` for plain input.
    pub fn codec(&self) -> Option<Codec> {
        match &self.kind {
            SourceKind::Stream { codec, .. } => Some(*codec),
            _ => None,
        }
    }

    /// Total input size, when knowable without consuming the stream.
    pub fn total_size(&self) -> Option<u64> {
        match &self.kind {
            SourceKind::File(f) => f.metadata().ok().map(|m| m.len()),
            SourceKind::Split(s) => Some(s.total_size()),
            SourceKind::Stream { .. } => None,
        }
    }

    /// Metadata of the backing file; for a split source, of the part
    /// under the current position.
    pub fn metadata(&self) -> io::Result<fs::Metadata> {
        match &self.kind {
            SourceKind::Split(s) => fs::metadata(s.active_part()),
            _ => fs::metadata(&self.path),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Read for ByteSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.peeked.is_empty() {
            let n = buf.len().min(self.peeked.len());
            buf[..n].copy_from_slice(&self.peeked[..n]);
            self.peeked.drain(..n);
            self.pos += n as u64;
            return Ok(n);
        }
        let got = self.kind_read(buf)?;
        self.pos += got as u64;
        Ok(got)
    }
}
