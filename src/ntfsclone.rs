//! Ntfsclone image decoder.
//!
//! # On-disk layout (major version 10)
//!
//! ```text
//! Offset  Size  Field
//!    0      16  magic 0x00 "ntfsclone-image"
//!   16     1+1  major version (must be 10), minor version (warn if not 1)
//!   18       4  cluster size                ┐
//!   22       8  device size                 │
//!   30       8  cluster count               │ little-endian
//!   38       8  clusters in use             │
//!   46       4  offset of image data        ┘
//! ```
//!
//! After the header the file is one long command stream: byte `0x00`
//! followed by a u64 count of unused clusters, or byte `0x01` followed by
//! one cluster of raw data. There is no bitmap and no checksum. Random
//! access therefore needs a one-time scan of the whole stream, collapsing
//! it into used/unused [`ClusterRange`]s that are binary-searched per
//! lookup. Within a used range, cluster `c` sits at
//! `offset + (c - start) * (cluster_size + 1)`; the `+ 1` is the command
//! byte in front of every stored cluster.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{ImageError, Result};
use crate::image::report_size;
use crate::probe::{wrong_image, NTFSCLONE_MAGIC};
use crate::source::ByteSource;

const HEADER_SIZE: usize = 50;
const VER_MAJOR: u8 = 10;
const VER_MINOR: u8 = 1;

/// One maximal run of all-used or all-unused clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterRange {
    pub used:  bool,
    pub start: u64,
    pub size:  u64,
    /// Image-file offset of cluster `start`'s payload; `None` for unused
    /// ranges.
    pub offset: Option<u64>,
}

impl ClusterRange {
    /// First cluster after this range.
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Ordered, contiguous cluster ranges with binary-search lookup.
#[derive(Debug)]
pub struct ClusterIndex {
    cluster_size: u64,
    ranges:       Vec<ClusterRange>,
}

impl ClusterIndex {
    fn new(cluster_size: u64) -> ClusterIndex {
        ClusterIndex { cluster_size, ranges: Vec::new() }
    }

    fn push(&mut self, range: ClusterRange) {
        if let Some(last) = self.ranges.last() {
            debug_assert_eq!(range.start, last.end());
        }
        self.ranges.push(range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[ClusterRange] {
        &self.ranges
    }

    /// Image-file offset of `cluster`, `None` when it is unused or lies
    /// past the last range (a trailing unused stretch some images omit).
    pub fn offset(&self, cluster: u64) -> Option<u64> {
        let idx = self.ranges.partition_point(|r| r.start <= cluster);
        let range = &self.ranges[idx.checked_sub(1)?];
        if cluster >= range.end() || !range.used {
            return None;
        }
        range
            .offset
            .map(|off| off + (cluster - range.start) * (self.cluster_size + 1))
    }
}

#[derive(Debug)]
pub struct NtfsClone {
    source: ByteSource,

    pub major_ver:            u8,
    pub minor_ver:            u8,
    pub cluster_size:         u32,
    pub device_size:          u64,
    pub nr_clusters:          u64,
    pub inuse:                u64,
    pub offset_to_image_data: u32,

    index: ClusterIndex,
}

impl NtfsClone {
    /// Read and validate the header; `source` is left at the start of the
    /// command stream.
    pub fn open(mut source: ByteSource) -> Result<NtfsClone> {
        let mut buffer = [0u8; HEADER_SIZE];
        source.read_exact(&mut buffer)?;

        if &buffer[..NTFSCLONE_MAGIC.len()] != NTFSCLONE_MAGIC {
            return Err(wrong_image("Not an ntfsclone image.".into(), &buffer));
        }
        let major_ver = buffer[16];
        let minor_ver = buffer[17];
        let cluster_size = LittleEndian::read_u32(&buffer[18..22]);
        let device_size = LittleEndian::read_u64(&buffer[22..30]);
        let nr_clusters = LittleEndian::read_u64(&buffer[30..38]);
        let inuse = LittleEndian::read_u64(&buffer[38..46]);
        let offset_to_image_data = LittleEndian::read_u32(&buffer[46..50]);

        if major_ver != VER_MAJOR {
            return Err(ImageError::UnsupportedVersion(format!(
                "Major version {major_ver} not supported; {VER_MAJOR} \
                 supported."
            )));
        }
        if minor_ver != VER_MINOR {
            log::warn!(
                "minor version {minor_ver} not supported; parsing as \
                 {VER_MAJOR}.{VER_MINOR} image file"
            );
        }

        // Skip the gap (usually 6 bytes) up to the image data. Reading,
        // not seeking, keeps pipes working.
        source.skip((offset_to_image_data as u64).saturating_sub(HEADER_SIZE as u64))?;

        Ok(NtfsClone {
            source,
            major_ver,
            minor_ver,
            cluster_size,
            device_size,
            nr_clusters,
            inuse,
            offset_to_image_data,
            index: ClusterIndex::new(cluster_size as u64),
        })
    }

    pub fn source(&mut self) -> &mut ByteSource {
        &mut self.source
    }

    pub fn source_ref(&self) -> &ByteSource {
        &self.source
    }

    pub fn cluster_ranges(&self) -> &[ClusterRange] {
        self.index.ranges()
    }

    /// Scan the whole command stream once and collapse it into the
    /// cluster-range index. Requires a seekable source.
    pub fn build_block_index(&mut self) -> Result<()> {
        if !self.index.is_empty() {
            return Ok(());
        }
        self.source.seek(self.offset_to_image_data as u64)?;

        let cluster_size = self.cluster_size as u64;
        let mut offset = self.offset_to_image_data as u64;
        let mut cluster_no = 0u64;
        let mut cur = ClusterRange { used: false, start: 0, size: 0, offset: None };

        loop {
            let Some(cmd) = self.source.read_byte()? else { break };
            offset += 1;
            match cmd {
                0x00 => {
                    let mut count_buf = [0u8; 8];
                    self.source.read_exact(&mut count_buf)?;
                    offset += 8;
                    let count = LittleEndian::read_u64(&count_buf);
                    if cluster_no > 0 {
                        self.index.push(cur);
                    }
                    cur = ClusterRange {
                        used: false,
                        start: cluster_no,
                        size: count,
                        offset: None,
                    };
                    cluster_no += count;
                }
                0x01 => {
                    if cluster_no > self.nr_clusters {
                        return Err(ImageError::DataCorrupt(format!(
                            "Error: Image file corrupted (cluster={cluster_no})."
                        )));
                    }
                    self.source.skip(cluster_size)?;
                    if cur.used {
                        debug_assert_eq!(cluster_no, cur.end());
                        cur.size += 1;
                    } else {
                        if cluster_no > 0 {
                            self.index.push(cur);
                        }
                        cur = ClusterRange {
                            used: true,
                            start: cluster_no,
                            size: 1,
                            offset: Some(offset),
                        };
                    }
                    offset += cluster_size;
                    cluster_no += 1;
                }
                other => {
                    return Err(ImageError::DataCorrupt(format!(
                        "Image file corrupted (sync={other})."
                    )));
                }
            }
        }
        self.index.push(cur);
        Ok(())
    }

    /// File offset of `block_no`'s payload, `None` for unused clusters.
    /// Builds the index on first use.
    ///
    /// `device_size` covers a trailing partial cluster that is not one of
    /// the `nr_clusters` (NTFS keeps its backup boot sector there), so
    /// cluster number `nr_clusters` itself is still addressable and reads
    /// as unused; only numbers beyond it are out of range.
    pub fn block_offset(&mut self, block_no: u64) -> Result<Option<u64>> {
        if block_no > self.nr_clusters {
            return Err(ImageError::OutOfRange { block: block_no });
        }
        self.build_block_index()?;
        Ok(self.index.offset(block_no))
    }

    /// Stream the command records from the current position, invoking
    /// `callback` with the partition byte offset of each stored cluster.
    /// The format carries no checksums, so there is nothing to verify.
    pub fn read_blocks(
        &mut self,
        _verify_crc: bool,
        mut callback: Option<&mut dyn FnMut(u64, &[u8])>,
    ) -> Result<()> {
        let cluster_size = self.cluster_size as usize;
        let mut cluster = 0u64;
        let mut block = vec![0u8; cluster_size];

        loop {
            let Some(cmd) = self.source.read_byte()? else { break };
            match cmd {
                0x00 => {
                    let mut count_buf = [0u8; 8];
                    self.source.read_exact(&mut count_buf)?;
                    cluster += LittleEndian::read_u64(&count_buf);
                }
                0x01 => {
                    if cluster > self.nr_clusters {
                        return Err(ImageError::DataCorrupt(format!(
                            "Image file corrupted (cluster={cluster})."
                        )));
                    }
                    self.source.read_exact(&mut block)?;
                    if let Some(cb) = callback.as_deref_mut() {
                        cb(cluster * cluster_size as u64, &block);
                    }
                    cluster += 1;
                }
                other => {
                    return Err(ImageError::DataCorrupt(format!(
                        "Image file corrupted (sync={other})."
                    )));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for NtfsClone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "NtfsClone Header")?;
        writeln!(f, "================")?;
        writeln!(f, "major_ver           : {}", self.major_ver)?;
        writeln!(f, "minor_ver           : {}", self.minor_ver)?;
        writeln!(f, "cluster_size        : {}", self.cluster_size)?;
        writeln!(
            f,
            "device_size         : {} ({})",
            self.device_size,
            report_size(self.device_size)
        )?;
        writeln!(f, "nr_clusters         : {}", self.nr_clusters)?;
        writeln!(
            f,
            "inuse               : {} ({})",
            self.inuse,
            report_size(self.inuse * self.cluster_size as u64)
        )?;
        write!(f, "offset_to_image_data: {}", self.offset_to_image_data)
    }
}
