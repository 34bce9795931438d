//! # virtpart — partition-image backups as virtual block devices
//!
//! Sparse partition images written by partclone, partimage, and
//! ntfsclone store only the in-use file-system blocks plus a map of which
//! logical blocks are present. This crate decodes all three formats
//! bit-exactly and serves the full partition back out:
//!
//! - Stored blocks are returned from their true offsets, located in
//!   O(log n) or better without a per-block offset table; everything
//!   else reads as zeros.
//! - Every header CRC, bitmap CRC, inline data checksum, and global
//!   additive checksum is validated; corruption is a typed error, never
//!   a recovery attempt.
//! - Input may be a plain file, a split set (`<stem>aa`, `<stem>ab`, ...)
//!   presented as one stream, or a gzip/bzip2/zstd/xz/lzma/lz4 stream
//!   decoded on the fly (sequential use only).
//! - The bundled `vpartclone`, `vpartimage`, and `vntfsclone` binaries
//!   expose a backup as a single read-only file under a FUSE mountpoint,
//!   ready for `mount -o loop,ro` or fsck.
//!
//! The core is single-threaded: a descriptor owns its source's seek
//! cursor, and parallel readers each open their own descriptor.

pub mod blockio;
pub mod cli;
pub mod crc;
pub mod error;
pub mod fuse;
pub mod image;
pub mod index;
pub mod ntfsclone;
pub mod partclone;
pub mod partimage;
pub mod probe;
pub mod source;

// Flat re-exports for the most common types.
pub use blockio::BlockIO;
pub use error::{ImageError, Result};
pub use image::Image;
pub use index::DEFAULT_INDEX_STRIDE;
pub use ntfsclone::NtfsClone;
pub use partclone::PartClone;
pub use partimage::PartImage;
pub use probe::{open_image, Format};
pub use source::{ByteSource, Codec};
