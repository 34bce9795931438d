//! Partimage image decoder.
//!
//! A partimage file opens with a 512-byte volume header, then carries a
//! sequence of 16384-byte headers (main, local, zero or more info), each
//! trailed by a 4-byte checksum equal to the sum of its bytes taken as
//! signed 8-bit integers. Segments are announced by ASCII sentinels of
//! the form `MAGIC-BEGIN-<NAME>`:
//!
//! ```text
//! <volume header>                      512 bytes, no sentinel
//! <main header>                        16388 bytes, no sentinel
//! MAGIC-BEGIN-LOCALHEADER <local>      16388 bytes
//! MAGIC-BEGIN-INFO <info>              16388 bytes, per-filesystem layout
//! MAGIC-BEGIN-BITMAP <bitmap>          local.bitmap_size raw bytes
//! MAGIC-BEGIN-DATABLOCKS <blocks...>
//! MAGIC-BEGIN-TAIL <sum u64> <vol u32>
//! ```
//!
//! Data blocks are stored in bitmap order. Every 65536 payload bytes a
//! 16-byte check record is interleaved: `"CHK\0"`, a CRC32 of the payload
//! since the previous check, and the starting block number of the current
//! used run. The run length handed to the reader is capped at
//! `262144 / block_size` so that the recorded run start agrees with the
//! writer's; this cap is part of the format contract, not a tuning knob.
//! A global additive u64 checksum over every byte after the volume header
//! is verified against the tail record.
//!
//! Images larger than one file continue in `<stem>.NNN+1` volumes, each
//! opening with its own volume header carrying the shared identifier.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::crc::crc32_update;
use crate::error::{ImageError, Result};
use crate::image::{nul_terminated, report_size};
use crate::index::{BitmapIndex, IndexLayout};
use crate::probe::{wrong_image, PARTIMAGE_MAGIC};
use crate::source::ByteSource;

const VOLUME_HEADER_SIZE: usize = 512;
/// Main, local, and info headers, including the 4-byte checksum.
const HEADER_SIZE: usize = 16388;
const READ_SIZE: usize = 1024;
const TAIL_SIZE: usize = 28;

const MAGIC_BEGIN: &[u8] = b"MAGIC-BEGIN-";
/// Sentinel plus the longest segment name we must be able to scan.
const THRESHOLD: usize = MAGIC_BEGIN.len() + 16;

/// A check record is expected every `CHECK_FREQUENCY` payload bytes.
const CHECK_FREQUENCY: u64 = 65536;
const CHECK_MAGIC: &[u8] = b"CHK\0";
const CHECK_SIZE: usize = 16;

/// Validate a 16388-byte header: the trailing 4 bytes hold the sum of the
/// other 16384, each taken as a signed 8-bit integer.
fn validate_additive(kind: &str, buffer: &[u8]) -> Result<()> {
    let stored = LittleEndian::read_i32(&buffer[HEADER_SIZE - 4..HEADER_SIZE]);
    let sum: i64 = buffer[..HEADER_SIZE - 4].iter().map(|&b| b as i8 as i64).sum();
    if sum != stored as i64 {
        return Err(ImageError::HeaderCorrupt(format!(
            "{kind} header checksum mismatch ({} bytes): {stored:08x} != \
             {sum:08x}.",
            HEADER_SIZE - 4
        )));
    }
    Ok(())
}

// ── Volume header ───────────────────────────────────────────────────────

/// First 512 bytes of every volume.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    pub version:    String,
    pub volume:     u32,
    pub identifier: u64,
}

impl VolumeHeader {
    pub fn read(source: &mut ByteSource) -> Result<VolumeHeader> {
        let mut buffer = [0u8; VOLUME_HEADER_SIZE];
        source.read_exact(&mut buffer)?;
        if &buffer[..PARTIMAGE_MAGIC.len()] != PARTIMAGE_MAGIC
            || buffer[PARTIMAGE_MAGIC.len()..32].iter().any(|&b| b != 0)
        {
            return Err(wrong_image(
                format!("Not a partimage file: '{}'.", source.path().display()),
                &buffer,
            ));
        }
        let version = nul_terminated(&buffer[32..96]);
        let volume = LittleEndian::read_u32(&buffer[96..100]);
        let identifier = LittleEndian::read_u64(&buffer[100..108]);
        Ok(VolumeHeader { version, volume, identifier })
    }
}

impl fmt::Display for VolumeHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Volume Header")?;
        writeln!(f, "-------------")?;
        writeln!(f, "version    : \"{}\"", self.version)?;
        writeln!(f, "volume     : {}", self.volume)?;
        write!(f, "identifier : 0x{:x}", self.identifier)
    }
}

// ── Main header ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MainHeader {
    pub filesystem:   String,
    pub description:  String,
    pub device:       String,
    pub firstpath:    String,
    pub sysname:      String,
    pub nodename:     String,
    pub release:      String,
    pub machine:      String,
    pub compression:  u32,
    pub flags:        u32,
    pub date_time:    Option<chrono::NaiveDateTime>,
    pub part_size:    u64,
    pub hostname:     String,
    pub version:      String,
    pub mbr_count:    u32,
    pub mbr_size:     u32,
    pub encrypt_algo: u32,
}

impl MainHeader {
    pub fn parse(buffer: &[u8]) -> Result<MainHeader> {
        validate_additive("Main", buffer)?;
        let filesystem  = nul_terminated(&buffer[0..512]);
        let description = nul_terminated(&buffer[512..4608]);
        let device      = nul_terminated(&buffer[4608..5120]);
        let firstpath   = nul_terminated(&buffer[5120..9215]);
        let sysname     = nul_terminated(&buffer[9215..9280]);
        let nodename    = nul_terminated(&buffer[9280..9345]);
        let release     = nul_terminated(&buffer[9345..9410]);
        // An OS version string at 9410..9475 is superseded by the tool
        // version further down; skip it like the original writer does.
        let machine     = nul_terminated(&buffer[9475..9540]);
        let compression = LittleEndian::read_u32(&buffer[9540..9544]);
        let flags       = LittleEndian::read_u32(&buffer[9544..9548]);

        // struct tm layout: sec, min, hour, mday, mon (0-based),
        // year (since 1900), the rest unused.
        let tm: Vec<u32> = (0..11)
            .map(|i| LittleEndian::read_u32(&buffer[9548 + 4 * i..9552 + 4 * i]))
            .collect();
        let date_time = chrono::NaiveDate::from_ymd_opt(
            tm[5] as i32 + 1900,
            tm[4] + 1,
            tm[3],
        )
        .and_then(|d| d.and_hms_opt(tm[2], tm[1], tm[0]));

        let part_size = LittleEndian::read_u64(&buffer[9592..9600]);
        let hostname  = nul_terminated(&buffer[9600..9728]);
        let version   = nul_terminated(&buffer[9728..9792]);
        let mbr_count    = LittleEndian::read_u32(&buffer[9792..9796]);
        let mbr_size     = LittleEndian::read_u32(&buffer[9796..9800]);
        let encrypt_algo = LittleEndian::read_u32(&buffer[9800..9804]);

        Ok(MainHeader {
            filesystem,
            description,
            device,
            firstpath,
            sysname,
            nodename,
            release,
            machine,
            compression,
            flags,
            date_time,
            part_size,
            hostname,
            version,
            mbr_count,
            mbr_size,
            encrypt_algo,
        })
    }
}

impl fmt::Display for MainHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Main Header")?;
        writeln!(f, "-----------")?;
        writeln!(f, "filesystem   : \"{}\"", self.filesystem)?;
        writeln!(f, "description  : \"{}\"", self.description)?;
        writeln!(f, "device       : \"{}\"", self.device)?;
        writeln!(f, "firstpath    : \"{}\"", self.firstpath)?;
        writeln!(f, "sysname      : \"{}\"", self.sysname)?;
        writeln!(f, "nodename     : \"{}\"", self.nodename)?;
        writeln!(f, "release      : \"{}\"", self.release)?;
        writeln!(f, "machine      : \"{}\"", self.machine)?;
        writeln!(f, "compression  : {}", self.compression)?;
        writeln!(f, "flags        : {}", self.flags)?;
        match self.date_time {
            Some(dt) => writeln!(f, "datetime     : {dt}")?,
            None => writeln!(f, "datetime     : invalid")?,
        }
        writeln!(
            f,
            "part_size    : {} ({})",
            self.part_size,
            report_size(self.part_size)
        )?;
        writeln!(f, "hostname     : \"{}\"", self.hostname)?;
        writeln!(f, "version      : \"{}\"", self.version)?;
        writeln!(f, "mbr_count    : {}", self.mbr_count)?;
        writeln!(f, "mbr_size     : {}", self.mbr_size)?;
        write!(f, "encrypt_algo : {}", self.encrypt_algo)
    }
}

// ── Local header ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LocalHeader {
    pub block_size:  u64,
    pub used_blocks: u64,
    pub block_count: u64,
    pub bitmap_size: u64,
    pub bad_blocks:  u64,
    pub label:       String,
}

impl LocalHeader {
    pub fn parse(buffer: &[u8]) -> Result<LocalHeader> {
        validate_additive("Local", buffer)?;
        Ok(LocalHeader {
            block_size:  LittleEndian::read_u64(&buffer[0..8]),
            used_blocks: LittleEndian::read_u64(&buffer[8..16]),
            block_count: LittleEndian::read_u64(&buffer[16..24]),
            bitmap_size: LittleEndian::read_u64(&buffer[24..32]),
            bad_blocks:  LittleEndian::read_u64(&buffer[32..40]),
            label:       nul_terminated(&buffer[40..104]),
        })
    }
}

impl fmt::Display for LocalHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Local Header")?;
        writeln!(f, "------------")?;
        writeln!(f, "block_size  : {}", self.block_size)?;
        writeln!(f, "used_blocks : {}", self.used_blocks)?;
        writeln!(f, "block_count : {}", self.block_count)?;
        writeln!(f, "bitmap_size : {}", self.bitmap_size)?;
        writeln!(f, "bad_blocks  : {}", self.bad_blocks)?;
        write!(f, "label       : \"{}\"", self.label)
    }
}

// ── Info headers ────────────────────────────────────────────────────────

/// Per-filesystem info header. The contents influence display only; an
/// unrecognised filesystem still gets its checksum validated.
#[derive(Debug, Clone)]
pub enum InfoHeader {
    Afs {
        byte_order:        u32,
        block_shift:       u32,
        block_per_group:   u32,
        alloc_grp_shift:   u32,
        alloc_group_count: u32,
        flags:             u32,
        boot_loader_size:  u32,
        bitmap_start:      u64,
    },
    Befs {
        byte_order:        u32,
        block_shift:       u32,
        block_per_group:   u32,
        alloc_grp_shift:   u32,
        alloc_group_count: u32,
        flags:             u32,
        boot_loader_size:  u32,
        bitmap_start:      u64,
    },
    Ext {
        groups_count:       u32,
        total_blocks_count: u32,
        first_block:        u32,
        block_size:         u32,
        logical_per_block:  u32,
        blocks_per_group:   u32,
        feature_compat:     u32,
        feature_incompat:   u32,
        feature_ro_compat:  u32,
        rev_level:          u32,
        uuid:               uuid::Uuid,
        desc_blocks:        u32,
        desc_per_block:     u32,
    },
    Fat {
        total_sectors_count: u32,
        clusters_count:      u32,
        root_dir_sectors:    u32,
        root_entries_count:  u32,
        sectors_per_fat:     u32,
        data_sectors:        u32,
        file_system:         u32,
        used_clusters:       u32,
        damaged_clusters:    u32,
        free_clusters:       u32,
        bytes_per_fat_entry: u32,
        bytes_per_sector:    u16,
        reserved_sectors:    u16,
        root_entries:        u16,
        sectors_per_cluster: u8,
        number_of_fats:      u8,
        fs_info_sector:      u16,
    },
    Hfs {
        alloc_count:          u64,
        bitmap_sect_location: u64,
        free_allocs:          u64,
        first_alloc_block:    u64,
        alloc_size:           u32,
        blocks_per_alloc:     u32,
    },
    Hpfs {
        bitmap_pointer:           u32,
        bitmap_quad_blocks_count: u32,
        hpfs_version:             u8,
    },
    Jfs {
        official_blocks_count:   u64,
        mapped_blocks_by_bitmap: u64,
        alloc_tree_max_level:    u32,
    },
    Ntfs {
        total_sectors_count:    u64,
        lcn_of_mft_data_attrib: u64,
        file_record_size:       u32,
        cluster_size:           u32,
        bytes_per_sector:       u16,
        ntfs_version:           u16,
        sectors_per_cluster:    u8,
    },
    Reiser {
        version:             u32,
        bitmap_blocks_count: u32,
    },
    Ufs {
        cylinder_groups_count: u32,
        fs_fpg:                u32,
        fs_cgoffset:           u32,
        fs_cgmask:             u32,
        fs_cblkno:             u32,
        frags_per_block:       u32,
        cylinder_group_size:   u32,
        basic_block_size:      u32,
        data_frags:            u64,
    },
    Xfs {
        ag_count:        u32,
        ag_blocks_count: u32,
    },
    /// Filesystem without a dedicated layout; checksum was still valid.
    Opaque,
}

impl InfoHeader {
    pub fn parse(filesystem: &str, buffer: &[u8]) -> Result<InfoHeader> {
        let u32_at = |off: usize| LittleEndian::read_u32(&buffer[off..off + 4]);
        let u64_at = |off: usize| LittleEndian::read_u64(&buffer[off..off + 8]);
        let u16_at = |off: usize| LittleEndian::read_u16(&buffer[off..off + 2]);

        Ok(if filesystem == "afs" {
            validate_additive("AFS Info", buffer)?;
            InfoHeader::Afs {
                byte_order:        u32_at(0),
                block_shift:       u32_at(4),
                block_per_group:   u32_at(8),
                alloc_grp_shift:   u32_at(12),
                alloc_group_count: u32_at(16),
                flags:             u32_at(20),
                boot_loader_size:  u32_at(24),
                bitmap_start:      u64_at(28),
            }
        } else if filesystem == "befs" {
            validate_additive("Befs Info", buffer)?;
            InfoHeader::Befs {
                byte_order:        u32_at(0),
                block_shift:       u32_at(4),
                block_per_group:   u32_at(8),
                alloc_grp_shift:   u32_at(12),
                alloc_group_count: u32_at(16),
                flags:             u32_at(20),
                boot_loader_size:  u32_at(24),
                bitmap_start:      u64_at(28),
            }
        } else if filesystem.starts_with("fat") {
            validate_additive("FAT Info", buffer)?;
            InfoHeader::Fat {
                total_sectors_count: u32_at(0),
                clusters_count:      u32_at(4),
                root_dir_sectors:    u32_at(8),
                root_entries_count:  u32_at(12),
                sectors_per_fat:     u32_at(16),
                data_sectors:        u32_at(20),
                file_system:         u32_at(24),
                used_clusters:       u32_at(28),
                damaged_clusters:    u32_at(32),
                free_clusters:       u32_at(36),
                bytes_per_fat_entry: u32_at(40),
                // one unused u32 at 44
                bytes_per_sector:    u16_at(48),
                reserved_sectors:    u16_at(50),
                root_entries:        u16_at(52),
                sectors_per_cluster: buffer[54],
                number_of_fats:      buffer[55],
                fs_info_sector:      u16_at(56),
            }
        } else if filesystem.starts_with("ext") {
            validate_additive("Ext2/3 Info", buffer)?;
            let mut uuid_bytes = [0u8; 16];
            uuid_bytes.copy_from_slice(&buffer[40..56]);
            InfoHeader::Ext {
                groups_count:       u32_at(0),
                total_blocks_count: u32_at(4),
                first_block:        u32_at(8),
                block_size:         u32_at(12),
                logical_per_block:  u32_at(16),
                blocks_per_group:   u32_at(20),
                feature_compat:     u32_at(24),
                feature_incompat:   u32_at(28),
                feature_ro_compat:  u32_at(32),
                rev_level:          u32_at(36),
                uuid:               uuid::Uuid::from_bytes_le(uuid_bytes),
                desc_blocks:        u32_at(56),
                desc_per_block:     u32_at(60),
            }
        } else if filesystem.starts_with("hfs") {
            validate_additive("HFS Info", buffer)?;
            InfoHeader::Hfs {
                alloc_count:          u64_at(0),
                bitmap_sect_location: u64_at(8),
                free_allocs:          u64_at(16),
                first_alloc_block:    u64_at(24),
                alloc_size:           u32_at(32),
                blocks_per_alloc:     u32_at(36),
            }
        } else if filesystem == "hpfs" {
            validate_additive("HPFS Info", buffer)?;
            InfoHeader::Hpfs {
                bitmap_pointer:           u32_at(0),
                bitmap_quad_blocks_count: u32_at(4),
                hpfs_version:             buffer[8],
            }
        } else if filesystem == "jfs" {
            validate_additive("JFS Info", buffer)?;
            InfoHeader::Jfs {
                official_blocks_count:   u64_at(0),
                mapped_blocks_by_bitmap: u64_at(8),
                alloc_tree_max_level:    u32_at(16),
            }
        } else if filesystem == "ntfs" {
            validate_additive("NTFS Info", buffer)?;
            InfoHeader::Ntfs {
                total_sectors_count:    u64_at(0),
                lcn_of_mft_data_attrib: u64_at(8),
                file_record_size:       u32_at(16),
                cluster_size:           u32_at(20),
                bytes_per_sector:       u16_at(24),
                ntfs_version:           u16_at(26),
                sectors_per_cluster:    buffer[28],
            }
        } else if filesystem.starts_with("reiserfs") {
            validate_additive("ReiserFS Info", buffer)?;
            InfoHeader::Reiser {
                version:             u32_at(0),
                bitmap_blocks_count: u32_at(4),
            }
        } else if filesystem == "ufs" {
            validate_additive("UFS Info", buffer)?;
            InfoHeader::Ufs {
                cylinder_groups_count: u32_at(0),
                fs_fpg:                u32_at(4),
                fs_cgoffset:           u32_at(8),
                fs_cgmask:             u32_at(12),
                fs_cblkno:             u32_at(16),
                frags_per_block:       u32_at(20),
                cylinder_group_size:   u32_at(24),
                basic_block_size:      u32_at(28),
                data_frags:            u64_at(32),
            }
        } else if filesystem == "xfs" {
            validate_additive("XFS Info", buffer)?;
            InfoHeader::Xfs {
                ag_count:        u32_at(0),
                ag_blocks_count: u32_at(4),
            }
        } else {
            log::warn!("Info Header for filesystem '{filesystem}' not implemented.");
            validate_additive("Info", buffer)?;
            InfoHeader::Opaque
        })
    }
}

impl fmt::Display for InfoHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InfoHeader::Afs {
                byte_order,
                block_shift,
                block_per_group,
                alloc_grp_shift,
                alloc_group_count,
                flags,
                boot_loader_size,
                bitmap_start,
            }
            | InfoHeader::Befs {
                byte_order,
                block_shift,
                block_per_group,
                alloc_grp_shift,
                alloc_group_count,
                flags,
                boot_loader_size,
                bitmap_start,
            } => {
                let name = if matches!(self, InfoHeader::Afs { .. }) {
                    "AFS Info Header"
                } else {
                    "BEFS Info Header"
                };
                writeln!(f, "{name}")?;
                writeln!(f, "{}", "-".repeat(name.len()))?;
                writeln!(f, "byte_order        : {byte_order}")?;
                writeln!(f, "block_shift       : {block_shift}")?;
                writeln!(f, "block_per_group   : {block_per_group}")?;
                writeln!(f, "alloc_grp_shift   : {alloc_grp_shift}")?;
                writeln!(f, "alloc_group_count : {alloc_group_count}")?;
                writeln!(f, "flags             : 0x{flags:x}")?;
                writeln!(f, "boot_loader_size  : {boot_loader_size}")?;
                write!(f, "bitmap_start      : {bitmap_start}")
            }
            InfoHeader::Ext {
                groups_count,
                total_blocks_count,
                first_block,
                block_size,
                logical_per_block,
                blocks_per_group,
                feature_compat,
                feature_incompat,
                feature_ro_compat,
                rev_level,
                uuid,
                desc_blocks,
                desc_per_block,
            } => {
                writeln!(f, "Ext2/3 Info Header")?;
                writeln!(f, "------------------")?;
                writeln!(f, "groups_count       : {groups_count}")?;
                writeln!(f, "total_blocks_count : {total_blocks_count}")?;
                writeln!(f, "first_block        : {first_block}")?;
                writeln!(f, "block_size         : {block_size}")?;
                writeln!(f, "logical_per_block  : {logical_per_block}")?;
                writeln!(f, "blocks_per_group   : {blocks_per_group}")?;
                writeln!(f, "feature_compat     : 0x{feature_compat:x}")?;
                writeln!(f, "feature_incompat   : 0x{feature_incompat:x}")?;
                writeln!(f, "feature_ro_compat  : 0x{feature_ro_compat:x}")?;
                writeln!(f, "rev_level          : {rev_level}")?;
                writeln!(f, "uuid               : {}", uuid.to_string().to_uppercase())?;
                writeln!(f, "desc_blocks        : {desc_blocks}")?;
                write!(f, "desc_per_block     : {desc_per_block}")
            }
            InfoHeader::Fat {
                total_sectors_count,
                clusters_count,
                root_dir_sectors,
                root_entries_count,
                sectors_per_fat,
                data_sectors,
                file_system,
                used_clusters,
                damaged_clusters,
                free_clusters,
                bytes_per_fat_entry,
                bytes_per_sector,
                reserved_sectors,
                root_entries,
                sectors_per_cluster,
                number_of_fats,
                fs_info_sector,
            } => {
                writeln!(f, "FAT Info Header")?;
                writeln!(f, "---------------")?;
                writeln!(f, "total_sectors_count : {total_sectors_count}")?;
                writeln!(f, "clusters_count      : {clusters_count}")?;
                writeln!(f, "root_dir_sectors    : {root_dir_sectors}")?;
                writeln!(f, "root_entries_count  : {root_entries_count}")?;
                writeln!(f, "sectors_per_fat     : {sectors_per_fat}")?;
                writeln!(f, "data_sectors        : {data_sectors}")?;
                writeln!(f, "file_system         : {file_system}")?;
                writeln!(f, "used_clusters       : {used_clusters}")?;
                writeln!(f, "damaged_clusters    : {damaged_clusters}")?;
                writeln!(f, "free_clusters       : {free_clusters}")?;
                writeln!(f, "bytes_per_fat_entry : {bytes_per_fat_entry}")?;
                writeln!(f, "bytes_per_sector    : {bytes_per_sector}")?;
                writeln!(f, "reserved_sectors    : {reserved_sectors}")?;
                writeln!(f, "root_entries        : {root_entries}")?;
                writeln!(f, "sectors_per_cluster : {sectors_per_cluster}")?;
                writeln!(f, "number_of_fats      : {number_of_fats}")?;
                write!(f, "fs_info_sector      : {fs_info_sector}")
            }
            InfoHeader::Hfs {
                alloc_count,
                bitmap_sect_location,
                free_allocs,
                first_alloc_block,
                alloc_size,
                blocks_per_alloc,
            } => {
                writeln!(f, "HFS Info Header")?;
                writeln!(f, "---------------")?;
                writeln!(f, "alloc_count          : {alloc_count}")?;
                writeln!(f, "bitmap_sect_location : {bitmap_sect_location}")?;
                writeln!(f, "free_allocs          : {free_allocs}")?;
                writeln!(f, "first_alloc_block    : {first_alloc_block}")?;
                writeln!(f, "alloc_size           : {alloc_size}")?;
                write!(f, "blocks_per_alloc     : {blocks_per_alloc}")
            }
            InfoHeader::Hpfs {
                bitmap_pointer,
                bitmap_quad_blocks_count,
                hpfs_version,
            } => {
                writeln!(f, "HPFS Info Header")?;
                writeln!(f, "----------------")?;
                writeln!(f, "bitmap_pointer           : {bitmap_pointer}")?;
                writeln!(f, "bitmap_quad_blocks_count : {bitmap_quad_blocks_count}")?;
                write!(f, "hpfs_version             : {hpfs_version}")
            }
            InfoHeader::Jfs {
                official_blocks_count,
                mapped_blocks_by_bitmap,
                alloc_tree_max_level,
            } => {
                writeln!(f, "JFS Info Header")?;
                writeln!(f, "---------------")?;
                writeln!(f, "official_blocks_count   : {official_blocks_count}")?;
                writeln!(f, "mapped_blocks_by_bitmap : {mapped_blocks_by_bitmap}")?;
                write!(f, "alloc_tree_max_level    : {alloc_tree_max_level}")
            }
            InfoHeader::Ntfs {
                total_sectors_count,
                lcn_of_mft_data_attrib,
                file_record_size,
                cluster_size,
                bytes_per_sector,
                ntfs_version,
                sectors_per_cluster,
            } => {
                writeln!(f, "NTFS Info Header")?;
                writeln!(f, "----------------")?;
                writeln!(f, "total_sectors_count    : {total_sectors_count}")?;
                writeln!(f, "lcn_of_mft_data_attrib : 0x{lcn_of_mft_data_attrib:x}")?;
                writeln!(f, "file_record_size       : {file_record_size}")?;
                writeln!(f, "cluster_size           : {cluster_size}")?;
                writeln!(f, "bytes_per_sector       : {bytes_per_sector}")?;
                writeln!(f, "ntfs_version           : {ntfs_version}")?;
                write!(f, "sectors_per_cluster    : {sectors_per_cluster}")
            }
            InfoHeader::Reiser { version, bitmap_blocks_count } => {
                writeln!(f, "ReiserFS Info Header")?;
                writeln!(f, "--------------------")?;
                writeln!(f, "version             : {version}")?;
                write!(f, "bitmap_blocks_count : {bitmap_blocks_count}")
            }
            InfoHeader::Ufs {
                cylinder_groups_count,
                fs_fpg,
                fs_cgoffset,
                fs_cgmask,
                fs_cblkno,
                frags_per_block,
                cylinder_group_size,
                basic_block_size,
                data_frags,
            } => {
                writeln!(f, "UFS Info Header")?;
                writeln!(f, "---------------")?;
                writeln!(f, "cylinder_groups_count : {cylinder_groups_count}")?;
                writeln!(f, "fs_fpg                : {fs_fpg}")?;
                writeln!(f, "fs_cgoffset           : {fs_cgoffset}")?;
                writeln!(f, "fs_cgmask             : 0x{fs_cgmask:x}")?;
                writeln!(f, "fs_cblkno             : {fs_cblkno}")?;
                writeln!(f, "frags_per_block       : {frags_per_block}")?;
                writeln!(f, "cylinder_group_size   : {cylinder_group_size}")?;
                writeln!(f, "basic_block_size      : {basic_block_size}")?;
                write!(f, "data_frags            : {data_frags}")
            }
            InfoHeader::Xfs { ag_count, ag_blocks_count } => {
                writeln!(f, "XFS Info Header")?;
                writeln!(f, "---------------")?;
                writeln!(f, "ag_count        : {ag_count}")?;
                write!(f, "ag_blocks_count : {ag_blocks_count}")
            }
            InfoHeader::Opaque => {
                writeln!(f, "Info Header")?;
                write!(f, "-----------")
            }
        }
    }
}

// ── PartImage ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PartImage {
    source: ByteSource,

    /// Rolling parse buffer; its front is the byte at `address`.
    buffer:       Vec<u8>,
    /// Absolute position of the buffer front within the (virtual,
    /// cross-volume) image stream.
    address:      u64,
    /// Additive u64 checksum over every byte consumed after the volume
    /// header, verified against the tail record.
    global_cksum: u64,

    pub volume_header: VolumeHeader,
    pub main_header:   MainHeader,
    pub local_header:  LocalHeader,
    pub info_header:   Option<InfoHeader>,

    bitmap:             Vec<u8>,
    data_blocks_offset: u64,
    max_block_range:    u64,
    index:              BitmapIndex,
}

impl PartImage {
    /// Parse the volume and main headers, then walk the sentinel stream
    /// up to `MAGIC-BEGIN-DATABLOCKS`. On return the source is positioned
    /// at the first stored block.
    pub fn open(mut source: ByteSource, index_stride: u32) -> Result<PartImage> {
        let volume_header = VolumeHeader::read(&mut source)?;
        if volume_header.volume != 0 {
            return Err(ImageError::HeaderCorrupt(format!(
                "File '{}' is not the first volume of an image.",
                source.path().display()
            )));
        }

        let mut scan = Scanner {
            source,
            buffer: Vec::new(),
            address: VOLUME_HEADER_SIZE as u64,
            global_cksum: 0,
        };

        scan.fill_to(HEADER_SIZE)?;
        let main_header = MainHeader::parse(&scan.buffer[..HEADER_SIZE])?;
        scan.dispose(HEADER_SIZE)?;

        let mut local_header: Option<LocalHeader> = None;
        let mut info_header: Option<InfoHeader> = None;
        let mut bitmap: Vec<u8> = Vec::new();

        let data_blocks_offset = loop {
            let Some(idx) = find(&scan.buffer, MAGIC_BEGIN) else {
                // Keep a partial sentinel at the buffer tail alive for
                // the next round.
                let keep = scan.buffer.len().min(MAGIC_BEGIN.len() - 1);
                scan.dispose(scan.buffer.len() - keep)?;
                if scan.read_more(READ_SIZE)? == 0 {
                    return Err(ImageError::Truncated { at: scan.address });
                }
                continue;
            };

            if idx + THRESHOLD > scan.buffer.len() {
                // The segment name may extend past the buffer; shift the
                // sentinel to the front and read on.
                scan.dispose(idx)?;
                scan.read_more(READ_SIZE)?;
            }
            let idx = find(&scan.buffer, MAGIC_BEGIN).unwrap_or(0);

            // Consume the longest [0-9A-Z]* run after the sentinel.
            let mut end = idx + MAGIC_BEGIN.len();
            while end < scan.buffer.len()
                && (scan.buffer[end].is_ascii_digit()
                    || scan.buffer[end].is_ascii_uppercase())
            {
                end += 1;
            }
            // A second sentinel inside the consumed token range resets the
            // boundary; kept byte-for-byte compatible with images that
            // embed one.
            if let Some(j) = find(&scan.buffer[idx + MAGIC_BEGIN.len()..end], MAGIC_BEGIN)
            {
                end = idx + MAGIC_BEGIN.len() + j;
            }
            let name =
                String::from_utf8_lossy(&scan.buffer[idx..end]).into_owned();
            scan.dispose(end)?;

            match name.as_str() {
                "MAGIC-BEGIN-BITMAP" => {
                    let local = local_header.as_ref().ok_or_else(|| {
                        ImageError::HeaderCorrupt(
                            "Bitmap segment before local header.".into(),
                        )
                    })?;
                    let bm_size = local.bitmap_size as usize;
                    scan.fill_to(bm_size)?;
                    bitmap = scan.buffer[..bm_size].to_vec();
                    scan.dispose(bm_size)?;
                }
                "MAGIC-BEGIN-LOCALHEADER" => {
                    scan.fill_to(HEADER_SIZE)?;
                    local_header =
                        Some(LocalHeader::parse(&scan.buffer[..HEADER_SIZE])?);
                    scan.dispose(HEADER_SIZE)?;
                }
                "MAGIC-BEGIN-INFO" => {
                    scan.fill_to(HEADER_SIZE)?;
                    info_header = Some(InfoHeader::parse(
                        &main_header.filesystem,
                        &scan.buffer[..HEADER_SIZE],
                    )?);
                    scan.dispose(HEADER_SIZE)?;
                }
                "MAGIC-BEGIN-DATABLOCKS" => break scan.address,
                _ => {}
            }
        };

        let local_header = local_header.ok_or_else(|| {
            ImageError::HeaderCorrupt("Data blocks before local header.".into())
        })?;
        if local_header.block_size == 0 {
            return Err(ImageError::HeaderCorrupt(
                "Local header declares a zero block size.".into(),
            ));
        }

        // Clear stray bits past the last block in the final meaningful
        // byte of the bitmap.
        let block_count = local_header.block_count;
        if block_count % 8 != 0 {
            if let Some(byte) = bitmap.get_mut((block_count / 8) as usize) {
                *byte &= (1u8 << (block_count % 8)) - 1;
            }
        }

        let max_block_range = (1u64 << 18) / local_header.block_size;
        Ok(PartImage {
            source: scan.source,
            buffer: scan.buffer,
            address: scan.address,
            global_cksum: scan.global_cksum,
            volume_header,
            main_header,
            local_header,
            info_header,
            bitmap,
            data_blocks_offset,
            max_block_range,
            index: BitmapIndex::new(index_stride),
        })
    }

    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    pub fn blocks_section_offset(&self) -> u64 {
        self.data_blocks_offset
    }

    /// Blocks per inline check record.
    pub fn checksum_blocks(&self) -> u64 {
        CHECK_FREQUENCY / self.local_header.block_size
    }

    pub fn source(&mut self) -> &mut ByteSource {
        &mut self.source
    }

    pub fn source_ref(&self) -> &ByteSource {
        &self.source
    }

    fn index_layout(&self) -> IndexLayout {
        IndexLayout {
            data_offset: self.data_blocks_offset,
            block_size: self.local_header.block_size,
            checksum_size: CHECK_SIZE as u64,
            checksum_blocks: self.checksum_blocks(),
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

    /// Next run of used blocks at or after `idx`, capped at
    /// `max_block_range` so the run start stays in step with the check
    /// records. `None` once every used block has been passed.
    fn used_blocks_range(&self, idx: u64) -> Option<(u64, u64)> {
        let bitmap = &self.bitmap;
        let cap = self.max_block_range;
        let mut byte_idx = (idx / 8) as usize;
        let bit0 = (idx % 8) as u8;
        if byte_idx >= bitmap.len() {
            return None;
        }

        let mut start = 0u64;
        let mut length = 0u64;

        // Remainder of the byte the search starts in.
        let mut byte = bitmap[byte_idx] & (0xffu8 << bit0);
        if byte != 0 {
            for bit in bit0..8 {
                if byte & (1 << bit) != 0 {
                    if length == 0 {
                        start = byte_idx as u64 * 8 + bit as u64;
                    }
                    length += 1;
                } else if length != 0 {
                    return Some((start, length));
                }
            }
        }
        byte_idx += 1;

        if length == 0 {
            // Skip whole unused bytes, then scan the first non-zero one.
            while byte_idx < bitmap.len() && bitmap[byte_idx] == 0 {
                byte_idx += 1;
            }
            if byte_idx >= bitmap.len() {
                return None;
            }
            byte = bitmap[byte_idx];
            for bit in 0..8 {
                if byte & (1 << bit) != 0 {
                    if length == 0 {
                        start = byte_idx as u64 * 8 + bit as u64;
                    }
                    length += 1;
                } else if length != 0 {
                    return Some((start, length));
                }
            }
            byte_idx += 1;
        }

        // Run continues: eat fully-used bytes up to the cap.
        while byte_idx < bitmap.len() && bitmap[byte_idx] == 0xff {
            length += 8;
            if length >= cap {
                return Some((start, cap));
            }
            byte_idx += 1;
        }
        if byte_idx >= bitmap.len() {
            return if length > 0 { Some((start, length)) } else { None };
        }
        byte = bitmap[byte_idx];
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                length += 1;
            } else {
                break;
            }
        }
        Some((start, length.min(cap)))
    }

    fn fill_to(&mut self, need: usize) -> Result<()> {
        while self.buffer.len() < need {
            let got = self.source.read_up_to(need - self.buffer.len())?;
            if got.is_empty() {
                break;
            }
            self.buffer.extend_from_slice(&got);
        }
        Ok(())
    }

    fn dispose(&mut self, size: usize) -> Result<()> {
        dispose_from(
            &mut self.buffer,
            size,
            &mut self.address,
            &mut self.global_cksum,
        )
    }

    /// Make sure `need` buffered bytes exist, rolling over to the next
    /// volume when the current one ends mid-block or mid-check.
    fn ensure_bytes(&mut self, need: usize) -> Result<()> {
        self.fill_to(need)?;
        if self.buffer.len() < need {
            self.open_next_volume()?;
            self.fill_to(need)?;
            if self.buffer.len() < need {
                return Err(ImageError::Truncated { at: self.source.tell() });
            }
        }
        Ok(())
    }

    /// The current volume ran dry: open `<stem>.<NNN+1>`, validate its
    /// volume header, and continue reading from it.
    fn open_next_volume(&mut self) -> Result<()> {
        let filename = self.source.path().display().to_string();
        let volume_no = self.volume_header.volume;
        let suffix = format!(".{volume_no:03}");
        if filename.ends_with(&suffix) {
            let next = format!(
                "{}{:03}",
                &filename[..filename.len() - 3],
                volume_no + 1
            );
            if Path::new(&next).exists() {
                let file = File::open(&next)?;
                let mut source = ByteSource::from_file(file, PathBuf::from(&next));
                let volume = VolumeHeader::read(&mut source)?;
                if volume.volume == volume_no + 1
                    && volume.identifier == self.volume_header.identifier
                {
                    log::debug!("image continues in volume '{next}'");
                    self.volume_header = volume;
                    self.source = source;
                    return Ok(());
                }
            }
        }
        Err(ImageError::Truncated { at: self.source.tell() })
    }

    /// Stream every used block in bitmap order, validating each inline
    /// check record (magic, run start, CRC) and finally the tail's global
    /// additive checksum. `callback` receives the partition byte offset
    /// and the block contents.
    ///
    /// The check records are always verified; they are consumed either
    /// way, and the CRC is already in hand.
    pub fn read_blocks(
        &mut self,
        _verify_crc: bool,
        mut callback: Option<&mut dyn FnMut(u64, &[u8])>,
    ) -> Result<()> {
        let block_size = self.local_header.block_size;
        let block_count = self.local_header.block_count;

        let mut crc: u32 = 0;
        let mut check_count: u64 = 0;
        let mut no_blocks: u64 = 0;

        let mut block_start = 0u64;
        let mut block_length = 0u64;
        while let Some((start, length)) =
            self.used_blocks_range(block_start + block_length)
        {
            block_start = start;
            block_length = length;

            for block_no in start..start + length {
                if block_no == block_count {
                    break;
                }
                no_blocks += 1;
                check_count += block_size;
                let crc_check = check_count >= CHECK_FREQUENCY;

                self.ensure_bytes(block_size as usize)?;
                crc = crc32_update(&self.buffer[..block_size as usize], crc);
                if let Some(cb) = callback.as_deref_mut() {
                    cb(block_no * block_size, &self.buffer[..block_size as usize]);
                }
                self.dispose(block_size as usize)?;

                if crc_check {
                    self.ensure_bytes(CHECK_SIZE)?;
                    if &self.buffer[..4] != CHECK_MAGIC {
                        return Err(ImageError::DataCorrupt(format!(
                            "Check failed: expected CHK and CRC after block \
                             {block_no}."
                        )));
                    }
                    let check_crc = LittleEndian::read_u32(&self.buffer[4..8]);
                    let check_pos = LittleEndian::read_u64(&self.buffer[8..16]);
                    self.dispose(CHECK_SIZE)?;

                    // The record names the run start, not the block; run
                    // capping exists precisely to keep these in step.
                    if check_pos != block_start {
                        return Err(ImageError::DataCorrupt(format!(
                            "Check failed: expected block {check_pos} \
                             computed {block_start}."
                        )));
                    }
                    if check_crc != crc {
                        return Err(ImageError::DataCorrupt(format!(
                            "Check failed: expected CRC {check_crc:08x} \
                             computed {crc:08x}."
                        )));
                    }
                    check_count = 0;
                    crc = 0;
                }
            }
        }

        if no_blocks != self.local_header.used_blocks {
            return Err(ImageError::DataCorrupt(format!(
                "Internal error: {no_blocks} used in bitmap; {} in header.",
                self.local_header.used_blocks
            )));
        }

        self.fill_to(TAIL_SIZE)?;
        if !self.buffer.starts_with(b"MAGIC-BEGIN-TAIL") {
            return Err(ImageError::DataCorrupt(
                "Expected MAGIC-BEGIN-TAIL.".into(),
            ));
        }
        self.dispose(16)?;
        if self.buffer.len() < 12 {
            return Err(ImageError::Truncated { at: self.address });
        }
        let tail_sum = LittleEndian::read_u64(&self.buffer[..8]);
        let tail_volume = LittleEndian::read_u32(&self.buffer[8..12]);
        if tail_volume != self.volume_header.volume {
            return Err(ImageError::DataCorrupt(format!(
                "Volume mismatch: {tail_volume} != {}.",
                self.volume_header.volume
            )));
        }
        if tail_sum != self.global_cksum {
            return Err(ImageError::DataCorrupt(format!(
                "Global checksum mismatch for volume {tail_volume}: \
                 {tail_sum:016x} != {:016x}.",
                self.global_cksum
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PartImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "PartImage")?;
        writeln!(f, "=========")?;
        writeln!(f, "{}", self.volume_header)?;
        writeln!(f, "{}", self.main_header)?;
        match &self.info_header {
            Some(info) => {
                writeln!(f, "{}", self.local_header)?;
                write!(f, "{info}")
            }
            None => write!(f, "{}", self.local_header),
        }
    }
}

// ── Scanner internals ───────────────────────────────────────────────────

/// Header-phase scanning state, folded into [`PartImage`] once the data
/// section is reached.
struct Scanner {
    source:       ByteSource,
    buffer:       Vec<u8>,
    address:      u64,
    global_cksum: u64,
}

impl Scanner {
    fn fill_to(&mut self, need: usize) -> Result<()> {
        while self.buffer.len() < need {
            let got = self.source.read_up_to(need - self.buffer.len())?;
            if got.is_empty() {
                return Err(ImageError::Truncated {
                    at: self.address + self.buffer.len() as u64,
                });
            }
            self.buffer.extend_from_slice(&got);
        }
        Ok(())
    }

    fn read_more(&mut self, n: usize) -> Result<usize> {
        let got = self.source.read_up_to(n)?;
        self.buffer.extend_from_slice(&got);
        Ok(got.len())
    }

    fn dispose(&mut self, size: usize) -> Result<()> {
        dispose_from(
            &mut self.buffer,
            size,
            &mut self.address,
            &mut self.global_cksum,
        )
    }
}

/// Drop `size` bytes off the buffer front, folding them into the global
/// additive checksum and advancing the stream address.
fn dispose_from(
    buffer: &mut Vec<u8>,
    size: usize,
    address: &mut u64,
    global_cksum: &mut u64,
) -> Result<()> {
    if size > buffer.len() {
        return Err(ImageError::DataCorrupt("Image file is corrupted.".into()));
    }
    *address += size as u64;
    for &b in &buffer[..size] {
        *global_cksum = global_cksum.wrapping_add(b as u64);
    }
    buffer.drain(..size);
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
