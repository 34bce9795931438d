//! Builders for synthetic partclone / partimage / ntfsclone images with
//! correct checksums, plus small helpers shared by the integration tests.

#![allow(dead_code)]

use std::io::Write;

use virtpart::crc::{crc32, crc32_update, CRC32_SEED};

/// Deterministic contents for stored block `block_no`.
pub fn block_bytes(block_no: u64, size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (block_no as usize).wrapping_mul(31).wrapping_add(i) as u8)
        .collect()
}

/// Bitmap with bit `k` set iff `used[k]`.
pub fn bitmap_from(used: &[bool]) -> Vec<u8> {
    let mut bitmap = vec![0u8; (used.len() + 7) / 8];
    for (k, &in_use) in used.iter().enumerate() {
        if in_use {
            bitmap[k / 8] |= 1 << (k % 8);
        }
    }
    bitmap
}

/// Expected full partition contents: stored blocks at their offsets,
/// zeros everywhere else.
pub fn expected_partition(used: &[bool], block_size: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(used.len() * block_size);
    for (k, &in_use) in used.iter().enumerate() {
        if in_use {
            out.extend_from_slice(&block_bytes(k as u64, block_size));
        } else {
            out.extend_from_slice(&vec![0u8; block_size]);
        }
    }
    out
}

pub fn write_temp(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

// ── partclone ───────────────────────────────────────────────────────────

pub struct PartcloneSpec {
    pub block_size:      u32,
    pub used:            Vec<bool>,
    pub checksum_mode:   u16,
    pub checksum_blocks: u32,
    pub checksum_size:   u16,
    pub reseed:          bool,
    pub big_endian:      bool,
}

impl PartcloneSpec {
    pub fn plain(block_size: u32, used: Vec<bool>) -> PartcloneSpec {
        PartcloneSpec {
            block_size,
            used,
            checksum_mode: 0,
            checksum_blocks: 0,
            checksum_size: 4,
            reseed: false,
            big_endian: false,
        }
    }

    pub fn crc32(block_size: u32, used: Vec<bool>, checksum_blocks: u32, reseed: bool) -> PartcloneSpec {
        PartcloneSpec {
            block_size,
            used,
            checksum_mode: 32,
            checksum_blocks,
            checksum_size: 4,
            reseed,
            big_endian: false,
        }
    }

    pub fn data_section_offset(&self) -> u64 {
        110 + ((self.used.len() as u64 + 7) / 8) + 4
    }
}

pub fn build_partclone(spec: &PartcloneSpec) -> Vec<u8> {
    let be = spec.big_endian;
    let u16b = |v: u16| if be { v.to_be_bytes() } else { v.to_le_bytes() };
    let u32b = |v: u32| if be { v.to_be_bytes() } else { v.to_le_bytes() };
    let u64b = |v: u64| if be { v.to_be_bytes() } else { v.to_le_bytes() };

    let total_blocks = spec.used.len() as u64;
    let used_count = spec.used.iter().filter(|&&u| u).count() as u64;

    let mut header = Vec::with_capacity(110);
    header.extend_from_slice(b"partclone-image\0");
    header.extend_from_slice(&b"0.3.20\0\0\0\0\0\0\0\0"[..14]);
    header.extend_from_slice(b"0002");
    header.extend_from_slice(&if be { 0xdec0u16 } else { 0xc0deu16 }.to_le_bytes());
    header.extend_from_slice(b"NTFS\0\0\0\0\0\0\0\0\0\0\0\0");
    header.extend_from_slice(&u64b(total_blocks * spec.block_size as u64));
    header.extend_from_slice(&u64b(total_blocks));
    header.extend_from_slice(&u64b(used_count));
    header.extend_from_slice(&u64b(used_count));
    header.extend_from_slice(&u32b(spec.block_size));
    header.extend_from_slice(&u32b(0)); // feature selection
    header.extend_from_slice(&u16b(2)); // image version
    header.extend_from_slice(&u16b(64)); // cpu bits
    header.extend_from_slice(&u16b(spec.checksum_mode));
    header.extend_from_slice(&u16b(spec.checksum_size));
    header.extend_from_slice(&u32b(spec.checksum_blocks));
    header.push(spec.reseed as u8);
    header.push(1); // bitmap mode BIT
    assert_eq!(header.len(), 106);
    header.extend_from_slice(&u32b(crc32(&header, CRC32_SEED)));

    let bitmap = bitmap_from(&spec.used);
    let mut out = header;
    out.extend_from_slice(&bitmap);
    out.extend_from_slice(&u32b(crc32(&bitmap, CRC32_SEED)));

    // Data section: blocks in bitmap order with a running CRC after
    // every checksum_blocks blocks, plus a final partial-group CRC.
    let mut seed = CRC32_SEED;
    let mut blocks_written = 0u64;
    for k in 0..total_blocks {
        if !spec.used[k as usize] {
            continue;
        }
        let block = block_bytes(k, spec.block_size as usize);
        out.extend_from_slice(&block);
        blocks_written += 1;
        if spec.checksum_mode == 32 {
            seed = crc32(&block, seed);
            if spec.checksum_blocks > 0
                && blocks_written % spec.checksum_blocks as u64 == 0
            {
                out.extend_from_slice(&u32b(seed));
                if spec.reseed {
                    seed = CRC32_SEED;
                }
            }
        }
    }
    if spec.checksum_mode == 32
        && spec.checksum_blocks > 0
        && blocks_written % spec.checksum_blocks as u64 != 0
    {
        out.extend_from_slice(&u32b(seed));
    }
    out
}

// ── ntfsclone ───────────────────────────────────────────────────────────

/// A run-length command: `Unused(n)` or `Used(n)` clusters.
pub enum NtfsRun {
    Unused(u64),
    Used(u64),
}

pub const NTFS_IMAGE_DATA_OFFSET: u32 = 56;

pub fn build_ntfsclone(cluster_size: u32, runs: &[NtfsRun]) -> Vec<u8> {
    let nr_clusters: u64 = runs
        .iter()
        .map(|r| match r {
            NtfsRun::Unused(n) | NtfsRun::Used(n) => *n,
        })
        .sum();
    build_ntfsclone_sized(cluster_size, runs, nr_clusters * cluster_size as u64)
}

/// Like [`build_ntfsclone`], with an explicit `device_size`. Real NTFS
/// volumes reserve a trailing sector past the last cluster for the
/// backup boot record, so `device_size` may exceed
/// `nr_clusters * cluster_size`.
pub fn build_ntfsclone_sized(
    cluster_size: u32,
    runs: &[NtfsRun],
    device_size: u64,
) -> Vec<u8> {
    let nr_clusters: u64 = runs
        .iter()
        .map(|r| match r {
            NtfsRun::Unused(n) | NtfsRun::Used(n) => *n,
        })
        .sum();
    let inuse: u64 = runs
        .iter()
        .map(|r| match r {
            NtfsRun::Used(n) => *n,
            NtfsRun::Unused(_) => 0,
        })
        .sum();

    let mut out = Vec::new();
    out.extend_from_slice(b"\0ntfsclone-image");
    out.push(10); // major
    out.push(1); // minor
    out.extend_from_slice(&cluster_size.to_le_bytes());
    out.extend_from_slice(&device_size.to_le_bytes());
    out.extend_from_slice(&nr_clusters.to_le_bytes());
    out.extend_from_slice(&inuse.to_le_bytes());
    out.extend_from_slice(&NTFS_IMAGE_DATA_OFFSET.to_le_bytes());
    assert_eq!(out.len(), 50);
    out.resize(NTFS_IMAGE_DATA_OFFSET as usize, 0);

    let mut cluster = 0u64;
    for run in runs {
        match run {
            NtfsRun::Unused(n) => {
                out.push(0);
                out.extend_from_slice(&n.to_le_bytes());
                cluster += n;
            }
            NtfsRun::Used(n) => {
                for _ in 0..*n {
                    out.push(1);
                    out.extend_from_slice(&block_bytes(cluster, cluster_size as usize));
                    cluster += 1;
                }
            }
        }
    }
    out
}

// ── partimage ───────────────────────────────────────────────────────────

pub struct PartimageSpec {
    pub block_size:  u64,
    pub used:        Vec<bool>,
    pub filesystem:  &'static str,
    pub identifier:  u64,
}

const PI_HEADER_SIZE: usize = 16388;
const PI_CHECK_FREQUENCY: u64 = 65536;

fn pi_header(fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let mut buf = vec![0u8; PI_HEADER_SIZE];
    fill(&mut buf[..PI_HEADER_SIZE - 4]);
    let sum: i64 = buf[..PI_HEADER_SIZE - 4].iter().map(|&b| b as i8 as i64).sum();
    buf[PI_HEADER_SIZE - 4..].copy_from_slice(&(sum as i32).to_le_bytes());
    buf
}

fn pi_volume_header(volume: u32, identifier: u64) -> Vec<u8> {
    let mut buf = vec![0u8; 512];
    buf[..16].copy_from_slice(b"PaRtImAgE-VoLuMe");
    buf[32..38].copy_from_slice(b"0.6.9\0");
    buf[96..100].copy_from_slice(&volume.to_le_bytes());
    buf[100..108].copy_from_slice(&identifier.to_le_bytes());
    buf
}

impl PartimageSpec {
    pub fn new(block_size: u64, used: Vec<bool>) -> PartimageSpec {
        PartimageSpec {
            block_size,
            used,
            filesystem: "ntfs",
            identifier: 0x1122_3344_5566_7788,
        }
    }

    pub fn data_section_offset(&self) -> u64 {
        let bitmap_len = (self.used.len() as u64 + 7) / 8;
        512
            + PI_HEADER_SIZE as u64                   // main header
            + b"MAGIC-BEGIN-LOCALHEADER".len() as u64
            + PI_HEADER_SIZE as u64
            + b"MAGIC-BEGIN-INFO".len() as u64
            + PI_HEADER_SIZE as u64
            + b"MAGIC-BEGIN-BITMAP".len() as u64
            + bitmap_len
            + b"MAGIC-BEGIN-DATABLOCKS".len() as u64
    }
}

pub fn build_partimage(spec: &PartimageSpec) -> Vec<u8> {
    let block_count = spec.used.len() as u64;
    let used_count = spec.used.iter().filter(|&&u| u).count() as u64;
    let bitmap = bitmap_from(&spec.used);

    let mut out = pi_volume_header(0, spec.identifier);

    // Everything after the volume header feeds the additive checksum,
    // up to and including the tail sentinel.
    let mut body: Vec<u8> = Vec::new();

    body.extend_from_slice(&pi_header(|buf| {
        buf[..spec.filesystem.len()].copy_from_slice(spec.filesystem.as_bytes());
        buf[4608..4617].copy_from_slice(b"/dev/sda1");
        // struct tm: sec, min, hour, mday, mon, year-1900
        for (i, v) in [0u32, 30, 10, 15, 5, 123].into_iter().enumerate() {
            buf[9548 + 4 * i..9552 + 4 * i].copy_from_slice(&v.to_le_bytes());
        }
        buf[9592..9600]
            .copy_from_slice(&(block_count * spec.block_size).to_le_bytes());
        buf[9600..9604].copy_from_slice(b"host");
        buf[9728..9733].copy_from_slice(b"0.6.9");
    }));

    body.extend_from_slice(b"MAGIC-BEGIN-LOCALHEADER");
    body.extend_from_slice(&pi_header(|buf| {
        buf[0..8].copy_from_slice(&spec.block_size.to_le_bytes());
        buf[8..16].copy_from_slice(&used_count.to_le_bytes());
        buf[16..24].copy_from_slice(&block_count.to_le_bytes());
        buf[24..32].copy_from_slice(&(bitmap.len() as u64).to_le_bytes());
        buf[40..45].copy_from_slice(b"data\0");
    }));

    body.extend_from_slice(b"MAGIC-BEGIN-INFO");
    body.extend_from_slice(&pi_header(|_| {}));

    body.extend_from_slice(b"MAGIC-BEGIN-BITMAP");
    body.extend_from_slice(&bitmap);

    body.extend_from_slice(b"MAGIC-BEGIN-DATABLOCKS");

    // Data blocks in bitmap order. A check record follows every 65536
    // payload bytes, carrying the start of the current used run; run
    // length is capped at 262144 / block_size, so a capped chunk counts
    // as its own run.
    let max_block_range = (1u64 << 18) / spec.block_size;
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut k = 0u64;
    while k < block_count {
        if spec.used[k as usize] {
            let start = k;
            while k < block_count && spec.used[k as usize] {
                k += 1;
            }
            let mut chunk_start = start;
            while chunk_start < k {
                let len = (k - chunk_start).min(max_block_range);
                runs.push((chunk_start, len));
                chunk_start += len;
            }
        } else {
            k += 1;
        }
    }

    let mut crc: u32 = 0;
    let mut check_count: u64 = 0;
    for &(run_start, run_len) in &runs {
        for block_no in run_start..run_start + run_len {
            let block = block_bytes(block_no, spec.block_size as usize);
            crc = crc32_update(&block, crc);
            body.extend_from_slice(&block);
            check_count += spec.block_size;
            if check_count >= PI_CHECK_FREQUENCY {
                body.extend_from_slice(b"CHK\0");
                body.extend_from_slice(&crc.to_le_bytes());
                body.extend_from_slice(&run_start.to_le_bytes());
                crc = 0;
                check_count = 0;
            }
        }
    }

    body.extend_from_slice(b"MAGIC-BEGIN-TAIL");
    let sum: u64 = body
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_add(b as u64));

    out.extend_from_slice(&body);
    out.extend_from_slice(&sum.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // tail volume number
    out
}
