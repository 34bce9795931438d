//! The one polymorphic boundary of the crate: a decoded image is a tagged
//! variant over the three supported formats. The CLI and the FUSE layer
//! hold an [`Image`] and never look inside a variant.

use std::fmt;
use std::io;

use crate::error::Result;
use crate::ntfsclone::NtfsClone;
use crate::partclone::PartClone;
use crate::partimage::PartImage;
use crate::source::ByteSource;

#[derive(Debug)]
pub enum Image {
    PartClone(PartClone),
    PartImage(PartImage),
    NtfsClone(NtfsClone),
}

impl Image {
    /// The tool that produced the image.
    pub fn tool(&self) -> &'static str {
        match self {
            Image::PartClone(_) => "partclone",
            Image::PartImage(_) => "partimage",
            Image::NtfsClone(_) => "ntfsclone",
        }
    }

    /// Upper-case file-system type, e.g. `NTFS` or `BTRFS`.
    pub fn fs_type(&self) -> String {
        match self {
            Image::PartClone(img) => img.fs_type.clone(),
            Image::PartImage(img) => img.main_header.filesystem.to_uppercase(),
            Image::NtfsClone(_) => "NTFS".to_string(),
        }
    }

    pub fn block_size(&self) -> u64 {
        match self {
            Image::PartClone(img) => img.fs_block_size as u64,
            Image::PartImage(img) => img.local_header.block_size,
            Image::NtfsClone(img) => img.cluster_size as u64,
        }
    }

    /// Total partition size in bytes.
    pub fn total_size(&self) -> u64 {
        match self {
            Image::PartClone(img) => img.fs_total_size,
            Image::PartImage(img) => img.main_header.part_size,
            Image::NtfsClone(img) => img.device_size,
        }
    }

    pub fn total_blocks(&self) -> u64 {
        match self {
            Image::PartClone(img) => img.fs_total_blocks,
            Image::PartImage(img) => img.local_header.block_count,
            Image::NtfsClone(img) => img.nr_clusters,
        }
    }

    pub fn used_blocks(&self) -> u64 {
        match self {
            Image::PartClone(img) => img.used_blocks(),
            Image::PartImage(img) => img.local_header.used_blocks,
            Image::NtfsClone(img) => img.inuse,
        }
    }

    /// The presence bitmap, for the formats that store one.
    pub fn bitmap(&self) -> Option<&[u8]> {
        match self {
            Image::PartClone(img) => Some(img.bitmap()),
            Image::PartImage(img) => Some(img.bitmap()),
            Image::NtfsClone(_) => None,
        }
    }

    /// Offset of the first stored block in the image file.
    pub fn blocks_section_offset(&self) -> u64 {
        match self {
            Image::PartClone(img) => img.blocks_section_offset(),
            Image::PartImage(img) => img.blocks_section_offset(),
            Image::NtfsClone(img) => img.offset_to_image_data as u64,
        }
    }

    /// Build whatever index random access needs; a no-op when already
    /// built. For ntfsclone this scans the whole image once.
    pub fn build_block_index(&mut self) -> Result<()> {
        match self {
            Image::PartClone(img) => {
                img.build_block_index();
                Ok(())
            }
            Image::PartImage(img) => {
                img.build_block_index();
                Ok(())
            }
            Image::NtfsClone(img) => img.build_block_index(),
        }
    }

    /// File offset of block `block_no`, `None` if the block is unused.
    pub fn block_offset(&mut self, block_no: u64) -> Result<Option<u64>> {
        match self {
            Image::PartClone(img) => img.block_offset(block_no),
            Image::PartImage(img) => img.block_offset(block_no),
            Image::NtfsClone(img) => img.block_offset(block_no),
        }
    }

    pub fn block_in_use(&mut self, block_no: u64) -> Result<bool> {
        match self {
            Image::PartClone(img) => {
                crate::index::block_in_use(img.bitmap(), block_no)
            }
            Image::PartImage(img) => {
                crate::index::block_in_use(img.bitmap(), block_no)
            }
            Image::NtfsClone(img) => Ok(img.block_offset(block_no)?.is_some()),
        }
    }

    /// Stream every in-use block in ascending logical order, validating
    /// inline checksums where the format has them. `callback` receives
    /// the partition byte offset and the block contents.
    pub fn read_blocks(
        &mut self,
        verify_crc: bool,
        callback: Option<&mut dyn FnMut(u64, &[u8])>,
    ) -> Result<()> {
        match self {
            Image::PartClone(img) => img.read_blocks(verify_crc, callback),
            Image::PartImage(img) => img.read_blocks(verify_crc, callback),
            Image::NtfsClone(img) => img.read_blocks(verify_crc, callback),
        }
    }

    pub fn source(&mut self) -> &mut ByteSource {
        match self {
            Image::PartClone(img) => img.source(),
            Image::PartImage(img) => img.source(),
            Image::NtfsClone(img) => img.source(),
        }
    }

    pub fn source_ref(&self) -> &ByteSource {
        match self {
            Image::PartClone(img) => img.source_ref(),
            Image::PartImage(img) => img.source_ref(),
            Image::NtfsClone(img) => img.source_ref(),
        }
    }

    pub fn metadata(&self) -> io::Result<std::fs::Metadata> {
        self.source_ref().metadata()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Image::PartClone(img) => fmt::Display::fmt(img, f),
            Image::PartImage(img) => fmt::Display::fmt(img, f),
            Image::NtfsClone(img) => fmt::Display::fmt(img, f),
        }
    }
}

/// Decode a NUL-terminated byte field into a string.
pub(crate) fn nul_terminated(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Human-readable size with a binary-unit suffix.
pub(crate) fn report_size(size: u64) -> String {
    const UNITS: [&str; 8] = ["B", "KB", "MB", "GB", "TB", "PB", "EB", "ZB"];
    for k in (1..UNITS.len()).rev() {
        let unit = 1u64 << (k * 10);
        if size >= unit {
            return format!("{:.1} {}", size as f64 / unit as f64, UNITS[k]);
        }
    }
    format!("{size} B")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_terminated_stops_at_first_nul() {
        assert_eq!(nul_terminated(b"ext4\0garbage"), "ext4");
        assert_eq!(nul_terminated(b"no-nul"), "no-nul");
        assert_eq!(nul_terminated(b"\0"), "");
    }

    #[test]
    fn report_size_picks_a_unit() {
        assert_eq!(report_size(512), "512 B");
        assert_eq!(report_size(2048), "2.0 KB");
        assert_eq!(report_size(3 * 1024 * 1024), "3.0 MB");
    }
}
