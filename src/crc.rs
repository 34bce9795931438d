//! CRC32 variants used by the image formats.
//!
//! Both are the IEEE polynomial (0xEDB88320, reflected) as implemented by
//! `crc32fast`, differing only in finalisation:
//!
//! - **partclone** stores the raw register value: seed `0xffffffff`, no
//!   final XOR. Running checksums chain the raw value from block to block.
//! - **partimage** check records store the conventional finalised value,
//!   chained with `crc32(buf, crc ^ 0xffffffff) ^ 0xffffffff` per update,
//!   starting from 0.

/// Seed for partclone-style raw CRCs.
pub const CRC32_SEED: u32 = 0xffff_ffff;

/// Raw (un-finalised) CRC32 of `buf`, continuing from `seed`.
///
/// `crc32fast` exposes only the finalised convention, where the register
/// is complemented on the way in and out; complementing the seed and the
/// result here cancels both steps and leaves the bare register update.
pub fn crc32(buf: &[u8], seed: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(!seed);
    hasher.update(buf);
    !hasher.finalize()
}

/// Finalised chained CRC32 as used by partimage's inline check records.
pub fn crc32_update(buf: &[u8], crc: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(buf);
    hasher.finalize()
}
