//! Sparse sampled index over a presence bitmap.
//!
//! Bitmap-based images (partclone, partimage) pack the in-use blocks back
//! to back, so the file offset of block *k* is a function of how many
//! bits are set before *k* — plus the interleaved checksum records, one
//! per `checksum_blocks` stored blocks. Rather than materialise an offset
//! per block, one [`BlockOffset`] restart point is kept per
//! `stride` bitmap bits (1024 by default, configurable via
//! `-i/--index_size`). A lookup starts from the restart point and
//! popcounts at most `stride / 8` bitmap bytes, so the result is exactly
//! what a linear scan from the start of the data section would compute,
//! at O(1) amortised cost. Changing the stride never changes a result.

use crate::error::{ImageError, Result};

/// Default index stride in bitmap bits.
pub const DEFAULT_INDEX_STRIDE: u32 = 1024;

/// One restart point of the index.
#[derive(Debug, Clone, Copy)]
pub struct BlockOffset {
    /// Offset in the image file of the first potential block covered by
    /// this entry.
    pub file_offset:  u64,
    /// In-use blocks seen so far, modulo the checksum period.
    pub cksum_offset: u64,
}

/// Geometry the index needs from the decoder.
#[derive(Debug, Clone, Copy)]
pub struct IndexLayout {
    /// Offset of the data section (first stored block) in the image file.
    pub data_offset:     u64,
    pub block_size:      u64,
    /// Bytes of checksum interleaved after every `checksum_blocks` stored
    /// blocks; 0 disables checksum accounting.
    pub checksum_size:   u64,
    pub checksum_blocks: u64,
}

#[derive(Debug)]
pub struct BitmapIndex {
    /// Index stride in bits; a positive multiple of 8.
    stride:  u32,
    entries: Vec<BlockOffset>,
}

pub(crate) fn popcount(bytes: &[u8]) -> u64 {
    bytes.iter().map(|b| b.count_ones() as u64).sum()
}

impl BitmapIndex {
    pub fn new(stride: u32) -> BitmapIndex {
        debug_assert!(stride >= 8 && stride % 8 == 0);
        BitmapIndex { stride, entries: Vec::new() }
    }

    pub fn is_built(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    /// Single deterministic pass over the bitmap: one entry per stride,
    /// re-emitting the previous entry while no block intervened (this
    /// coalesces long unused runs into one restart point).
    pub fn build(&mut self, bitmap: &[u8], layout: &IndexLayout) {
        if self.is_built() {
            return;
        }
        let stride_bytes = (self.stride / 8) as usize;
        let mut file_offset = layout.data_offset;
        let mut blocks_cksum = 0u64;
        let mut entry = BlockOffset { file_offset, cksum_offset: 0 };

        for idx in (0..bitmap.len()).step_by(stride_bytes) {
            if file_offset != entry.file_offset {
                entry = BlockOffset { file_offset, cksum_offset: blocks_cksum };
            }
            self.entries.push(entry);

            let end = (idx + stride_bytes).min(bitmap.len());
            let inuse = popcount(&bitmap[idx..end]);
            blocks_cksum += inuse;
            file_offset += layout.block_size * inuse;
            if layout.checksum_blocks > 0 && blocks_cksum >= layout.checksum_blocks {
                file_offset +=
                    layout.checksum_size * (blocks_cksum / layout.checksum_blocks);
                blocks_cksum %= layout.checksum_blocks;
            }
        }
    }

    /// File offset of in-use block `block_no`; the caller has already
    /// established that its bitmap bit is set.
    pub fn lookup(&self, bitmap: &[u8], block_no: u64, layout: &IndexLayout) -> u64 {
        let stride = self.stride as u64;
        let entry = self.entries[(block_no / stride) as usize];

        let bm_start = (block_no / stride) as usize * (self.stride / 8) as usize;
        let bm_end = (block_no / 8) as usize;
        let partial = bitmap[bm_end] & ((1u8 << (block_no % 8)) - 1);
        let inuse = popcount(&bitmap[bm_start..bm_end]) + partial.count_ones() as u64;

        let blocks_cksum = entry.cksum_offset + inuse;
        let mut file_offset = entry.file_offset + layout.block_size * inuse;
        if layout.checksum_blocks > 0 && blocks_cksum >= layout.checksum_blocks {
            file_offset +=
                layout.checksum_size * (blocks_cksum / layout.checksum_blocks);
        }
        file_offset
    }
}

/// Bounds-check `block_no` against the bitmap and test its bit.
pub fn block_in_use(bitmap: &[u8], block_no: u64) -> Result<bool> {
    let byte = (block_no / 8) as usize;
    if byte >= bitmap.len() {
        return Err(ImageError::OutOfRange { block: block_no });
    }
    Ok(bitmap[byte] & (1 << (block_no % 8)) != 0)
}
