//! Partclone image decoder.
//!
//! # On-disk layout (image format 0002)
//!
//! ```text
//! Offset  Size  Field
//!    0      16  magic "partclone-image" (15 significant bytes)
//!   16      14  partclone tool version, NUL-terminated
//!   30       4  image format version, ASCII "0002"
//!   34       2  endian marker: 0xC0DE little, 0xDEC0 big
//!   36      16  file-system type, NUL-terminated
//!   52       8  fs total size          ┐
//!   60       8  fs total blocks        │
//!   68       8  fs used blocks (super) │
//!   76       8  fs used blocks (bitmap)│ in the endianness announced
//!   84       4  block size             │ by the marker at offset 34
//!   88       4  feature selection      │
//!   92     2×4  image ver, cpu bits, checksum mode, checksum size
//!  100       4  checksum blocks        │
//!  104     1+1  checksum reseed, bitmap mode
//!  106       4  header CRC32 over bytes 0..106
//! ```
//!
//! The bitmap (`ceil(total_blocks / 8)` bytes) follows, trailed by its own
//! 4-byte CRC32; the data section starts right after. Stored blocks are
//! packed in bitmap order with a running CRC32 interleaved after every
//! `checksum_blocks` blocks (checksum mode 32).
//!
//! Both CRCs are the raw register variant, see [`crate::crc`].

use std::fmt;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::crc::{crc32, CRC32_SEED};
use crate::error::{ImageError, Result};
use crate::image::{nul_terminated, report_size};
use crate::index::{popcount, BitmapIndex, IndexLayout};
use crate::probe::{wrong_image, PARTCLONE_MAGIC};
use crate::source::ByteSource;

const HEADER_SIZE: usize = 110;
/// The trailing 4 bytes of the header are its own CRC.
const HEADER_CRC_SPAN: usize = HEADER_SIZE - 4;

/// Integer byte order announced by the header's endian marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn read_u16(self, buf: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(buf),
            Endian::Big => BigEndian::read_u16(buf),
        }
    }

    fn read_u32(self, buf: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(buf),
            Endian::Big => BigEndian::read_u32(buf),
        }
    }

    fn read_u64(self, buf: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(buf),
            Endian::Big => BigEndian::read_u64(buf),
        }
    }
}

#[derive(Debug)]
pub struct PartClone {
    source: ByteSource,
    endian: Endian,

    pub partclone_version: String,
    pub img_version:       String,
    pub fs_type:           String,
    pub fs_total_size:     u64,
    pub fs_total_blocks:   u64,
    pub fs_used_blocks:    u64,
    pub fs_used_bitmap:    u64,
    pub fs_block_size:     u32,
    pub feature_selection: u32,
    pub image_version:     u16,
    pub cpu_bits:          u16,
    pub checksum_mode:     u16,
    pub checksum_size:     u16,
    pub checksum_blocks:   u32,
    pub checksum_reseed:   bool,
    pub bitmap_mode:       u8,
    pub header_crc32:      u32,

    bitmap:         Vec<u8>,
    bitmap_crc32:   u32,
    blocks_section: u64,
    index:          BitmapIndex,
}

impl PartClone {
    /// Read and validate the header and the bitmap. `source` is left
    /// positioned at the start of the data section.
    pub fn open(mut source: ByteSource, index_stride: u32) -> Result<PartClone> {
        let mut buffer = [0u8; HEADER_SIZE];
        source.read_exact(&mut buffer)?;

        if &buffer[..PARTCLONE_MAGIC.len()] != PARTCLONE_MAGIC {
            let name = source.path().display().to_string();
            return Err(wrong_image(
                format!(
                    "'{name}' is not a partclone image. Command 'file {name}' \
                     can help figure out what kind of file this is."
                ),
                &buffer,
            ));
        }
        let partclone_version = nul_terminated(&buffer[16..30]);
        let img_version = nul_terminated(&buffer[30..34]);
        if img_version != "0002" {
            return Err(ImageError::UnsupportedVersion(format!(
                "Version {img_version} not supported; only version 2 is \
                 supported."
            )));
        }
        let endian = match LittleEndian::read_u16(&buffer[34..36]) {
            0xc0de => Endian::Little,
            0xdec0 => Endian::Big,
            other => {
                return Err(ImageError::HeaderCorrupt(format!(
                    "Unexpected endianness {other:04x}."
                )))
            }
        };
        let fs_type = nul_terminated(&buffer[36..52]);

        let e = endian;
        let fs_total_size     = e.read_u64(&buffer[52..60]);
        let fs_total_blocks   = e.read_u64(&buffer[60..68]);
        let fs_used_blocks    = e.read_u64(&buffer[68..76]);
        let fs_used_bitmap    = e.read_u64(&buffer[76..84]);
        let fs_block_size     = e.read_u32(&buffer[84..88]);
        let feature_selection = e.read_u32(&buffer[88..92]);
        let image_version     = e.read_u16(&buffer[92..94]);
        let cpu_bits          = e.read_u16(&buffer[94..96]);
        let checksum_mode     = e.read_u16(&buffer[96..98]);
        let checksum_size     = e.read_u16(&buffer[98..100]);
        let checksum_blocks   = e.read_u32(&buffer[100..104]);
        let checksum_reseed   = buffer[104] != 0;
        let bitmap_mode       = buffer[105];
        let header_crc32      = e.read_u32(&buffer[106..110]);

        if checksum_mode != 0 && checksum_mode != 32 {
            return Err(ImageError::UnsupportedVersion(format!(
                "Unsupported checksum mode {checksum_mode}; modes 0 and 32 \
                 are supported."
            )));
        }
        if checksum_mode == 32 && checksum_size != 4 {
            return Err(ImageError::UnsupportedVersion(format!(
                "Unsupported checksum size {checksum_size}; CRC32 checksums \
                 are 4 bytes."
            )));
        }
        let crc = crc32(&buffer[..HEADER_CRC_SPAN], CRC32_SEED);
        if header_crc32 != crc {
            return Err(ImageError::HeaderCorrupt(format!(
                "Header CRC mismatch: 0x{header_crc32:08x} != 0x{crc:08x}."
            )));
        }

        // Bitmap plus its own CRC.
        let bitmap_len = (fs_total_blocks as usize + 7) / 8;
        let mut bitmap = vec![0u8; bitmap_len];
        source.read_exact(&mut bitmap)?;
        let mut crc_buf = [0u8; 4];
        source.read_exact(&mut crc_buf)?;
        let bitmap_crc32 = e.read_u32(&crc_buf);
        let crc = crc32(&bitmap, CRC32_SEED);
        if bitmap_crc32 != crc {
            return Err(ImageError::BitmapCorrupt(format!(
                "Bitmap CRC mismatch: 0x{bitmap_crc32:08x} != 0x{crc:08x}."
            )));
        }
        let blocks_section = HEADER_SIZE as u64 + bitmap_len as u64 + 4;

        // Bits past the last block are not part of the partition; clear
        // any stray ones in the final byte.
        if fs_total_blocks % 8 != 0 {
            let mask = (1u8 << (fs_total_blocks % 8)) - 1;
            if let Some(last) = bitmap.last_mut() {
                *last &= mask;
            }
        }

        let mut image = PartClone {
            source,
            endian,
            partclone_version,
            img_version,
            fs_type,
            fs_total_size,
            fs_total_blocks,
            fs_used_blocks,
            fs_used_bitmap,
            fs_block_size,
            feature_selection,
            image_version,
            cpu_bits,
            checksum_mode,
            checksum_size,
            checksum_blocks,
            checksum_reseed,
            bitmap_mode,
            header_crc32,
            bitmap,
            bitmap_crc32,
            blocks_section,
            index: BitmapIndex::new(index_stride),
        };

        let in_bitmap = popcount(&image.bitmap);
        if in_bitmap != image.used_blocks() {
            return Err(ImageError::BitmapCorrupt(format!(
                "{} blocks in use according to header but {in_bitmap} found \
                 in bitmap.",
                image.used_blocks()
            )));
        }
        if image.fs_used_blocks != image.fs_used_bitmap {
            log::warn!(
                "used-block counts disagree: {} from the super-block, {} \
                 from the bitmap; using the larger",
                image.fs_used_blocks,
                image.fs_used_bitmap
            );
        }
        Ok(image)
    }

    /// Used block count; the super-block and the bitmap may disagree
    /// slightly, the larger of the two wins.
    pub fn used_blocks(&self) -> u64 {
        self.fs_used_blocks.max(self.fs_used_bitmap)
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn blocks_section_offset(&self) -> u64 {
        self.blocks_section
    }

    pub fn source(&mut self) -> &mut ByteSource {
        &mut self.source
    }

    pub fn source_ref(&self) -> &ByteSource {
        &self.source
    }

    fn index_layout(&self) -> IndexLayout {
        // With checksum mode 0, any residual size/period values in the
        // header do not describe bytes on disk.
        let (checksum_size, checksum_blocks) = if self.checksum_mode != 0 {
            (self.checksum_size as u64, self.checksum_blocks as u64)
        } else {
            (0, 0)
        };
        IndexLayout {
            data_offset: self.blocks_section,
            block_size: self.fs_block_size as u64,
            checksum_size,
            checksum_blocks,
        }
    }

    pub fn build_block_index(&mut self) {
        let layout = self.index_layout();
        self.index.build(&self.bitmap, &layout);
    }

    /// File offset of `block_no`, or `None` for an unused block.
    pub fn block_offset(&mut self, block_no: u64) -> Result<Option<u64>> {
        if !crate::index::block_in_use(&self.bitmap, block_no)? {
            return Ok(None);
        }
        self.build_block_index();
        let layout = self.index_layout();
        Ok(Some(self.index.lookup(&self.bitmap, block_no, &layout)))
    }

    /// Stream every in-use block in bitmap order from the data section,
    /// consuming interleaved checksums as they appear.
    ///
    /// With `verify_crc` the running CRC is compared against each stored
    /// checksum (and the final partial one); without it the checksums are
    /// only skipped. `callback` receives the partition byte offset and
    /// the block contents.
    pub fn read_blocks(
        &mut self,
        verify_crc: bool,
        mut callback: Option<&mut dyn FnMut(u64, &[u8])>,
    ) -> Result<()> {
        let block_size = self.fs_block_size as usize;
        let checksum_on = self.checksum_mode == 32;
        let checksum_blocks = self.checksum_blocks as u64;
        let checksum_size = self.checksum_size as usize;

        let mut seed = CRC32_SEED;
        let mut blocks_read = 0u64;
        let mut block = vec![0u8; block_size];
        let mut stored = vec![0u8; checksum_size.max(4)];

        for (byte_idx, &byte) in self.bitmap.iter().enumerate() {
            if byte == 0 {
                continue;
            }
            for bit in 0..8 {
                if byte & (1 << bit) == 0 {
                    continue;
                }
                let block_no = byte_idx as u64 * 8 + bit as u64;
                self.source.read_exact(&mut block)?;
                blocks_read += 1;
                if checksum_on {
                    if verify_crc {
                        seed = crc32(&block, seed);
                    }
                    if checksum_blocks > 0 && blocks_read % checksum_blocks == 0 {
                        self.source.read_exact(&mut stored[..checksum_size])?;
                        self.verify_stored_crc(&stored[..checksum_size], seed, verify_crc)?;
                        if self.checksum_reseed {
                            seed = CRC32_SEED;
                        }
                    }
                }
                if let Some(cb) = callback.as_deref_mut() {
                    cb(block_no * block_size as u64, &block);
                }
            }
        }

        // A partial checksum group still ends with a checksum.
        if checksum_on && checksum_blocks > 0 && blocks_read % checksum_blocks != 0 {
            self.source.read_exact(&mut stored[..checksum_size])?;
            self.verify_stored_crc(&stored[..checksum_size], seed, verify_crc)?;
        }

        // End-of-file expected now.
        let trailing = self.source.read_up_to(block_size)?;
        if !trailing.is_empty() {
            let info = if trailing.len() == 1 {
                "1 byte".to_string()
            } else if trailing.len() == block_size {
                "at least 1 block".to_string()
            } else {
                format!("{} bytes", trailing.len())
            };
            return Err(ImageError::DataCorrupt(format!(
                "Error '{}': {info} of unexpected data after end of backup.",
                self.source.path().display()
            )));
        }
        Ok(())
    }

    fn verify_stored_crc(&self, stored: &[u8], seed: u32, verify: bool) -> Result<()> {
        if !verify {
            return Ok(());
        }
        let crc = self.endian.read_u32(&stored[..4]);
        if crc != seed {
            return Err(ImageError::DataCorrupt(format!(
                "Blocks CRC mismatch at file offset {}: 0x{crc:08x} != \
                 0x{seed:08x}.",
                self.source.tell() - stored.len() as u64
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PartClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let checksum_mode = match self.checksum_mode {
            0 => "NONE",
            32 => "CRC32",
            _ => "?",
        };
        let bitmap_mode = match self.bitmap_mode {
            0 => "NONE",
            1 => "BIT",
            8 => "BYTE",
            _ => "?",
        };
        writeln!(f, "Partclone Header")?;
        writeln!(f, "================")?;
        writeln!(f, "partclone version {}", self.partclone_version)?;
        writeln!(f, "fs type           {}", self.fs_type)?;
        writeln!(
            f,
            "fs total size     {} ({})",
            self.fs_total_size,
            report_size(self.fs_total_size)
        )?;
        writeln!(f, "fs total blocks   {}", self.fs_total_blocks)?;
        writeln!(
            f,
            "fs used blocks    {} ({})\tused block count based on super-block",
            self.fs_used_blocks,
            report_size(self.fs_used_blocks * self.fs_block_size as u64)
        )?;
        writeln!(
            f,
            "fs_used_bitmap    {} ({})\tused block count based on bitmap",
            self.fs_used_bitmap,
            report_size(self.fs_used_bitmap * self.fs_block_size as u64)
        )?;
        writeln!(f, "fs block size     {}", self.fs_block_size)?;
        writeln!(f, "image version     {}", self.image_version)?;
        writeln!(f, "cpu bits          {}", self.cpu_bits)?;
        writeln!(f, "checksum mode     {checksum_mode}")?;
        writeln!(f, "checksum size     {}", self.checksum_size)?;
        writeln!(f, "checksum blocks   {}", self.checksum_blocks)?;
        writeln!(f, "checksum reseed   {}", self.checksum_reseed)?;
        writeln!(f, "bitmap mode       {bitmap_mode}")?;
        writeln!(f, "header_crc32      0x{:08x}", self.header_crc32)?;
        writeln!(
            f,
            "bitmap            {} bytes ({})",
            self.bitmap.len(),
            report_size(self.bitmap.len() as u64)
        )?;
        writeln!(f, "bitmap_crc32      0x{:08x}", self.bitmap_crc32)?;
        writeln!(f, "blocks_section    at {} in img file", self.blocks_section)?;
        write!(f, "block_offset_size {}", self.index.stride())
    }
}
