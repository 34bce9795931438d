//! Block I/O service: byte-granular reads over the logical partition.
//!
//! Translates `(offset, size)` requests into whole-block reads from the
//! image file, or synthesised zero blocks where the bitmap says nothing
//! was stored. Sub-block reads are never issued to the source; the first
//! and last blocks of a request are sliced in memory.
//!
//! A `BlockIO` owns its image's seek cursor and is therefore not usable
//! concurrently; callers wanting parallel reads open one descriptor per
//! worker.

use crate::error::{ImageError, Result};
use crate::image::Image;

pub struct BlockIO {
    image:        Image,
    block_size:   u64,
    total_blocks: u64,
    total_size:   u64,
    empty_block:  Vec<u8>,
}

impl BlockIO {
    /// Take ownership of `image` and make it randomly addressable,
    /// building the block index up front.
    pub fn new(mut image: Image) -> Result<BlockIO> {
        image.build_block_index()?;
        let block_size = image.block_size();
        let total_blocks = (image.total_size() + block_size - 1) / block_size;
        Ok(BlockIO {
            image,
            block_size,
            total_blocks,
            total_size: block_size * total_blocks,
            empty_block: vec![0u8; block_size as usize],
        })
    }

    /// Partition size in bytes, rounded up to a whole block.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Read `size` bytes at `offset` in the partition. The request is
    /// clamped to the partition end; an offset at or past the end reads
    /// empty.
    pub fn read_data(&mut self, offset: u64, size: usize) -> Result<Vec<u8>> {
        let size = if offset >= self.total_size {
            0
        } else {
            size.min((self.total_size - offset) as usize)
        };
        let mut output = Vec::with_capacity(size);
        if size == 0 {
            return Ok(output);
        }

        let min_block = offset / self.block_size;
        let max_block = (offset + size as u64 - 1) / self.block_size;
        let mut block = vec![0u8; self.block_size as usize];

        for block_no in min_block..=max_block {
            let idx1 = if block_no == min_block {
                (offset % self.block_size) as usize
            } else {
                0
            };
            let idx2 = if block_no == max_block {
                ((offset + size as u64 - 1) % self.block_size) as usize + 1
            } else {
                self.block_size as usize
            };

            match self.image.block_offset(block_no)? {
                None => output.extend_from_slice(&self.empty_block[idx1..idx2]),
                Some(file_offset) => {
                    let source = self.image.source();
                    source.seek(file_offset)?;
                    source.read_exact(&mut block).map_err(|_| {
                        ImageError::Truncated { at: file_offset }
                    })?;
                    output.extend_from_slice(&block[idx1..idx2]);
                }
            }
        }
        Ok(output)
    }
}
