//! FUSE presentation of a backup image as a virtual partition.
//!
//! The mountpoint shows a single read-only regular file named after the
//! image (a trailing `.img` is stripped). Reads map straight onto
//! [`BlockIO::read_data`]; unused blocks come back as zeros, so the file
//! is a byte-exact replica of the original partition and can be
//! loop-mounted or fsck'd.

use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};

use crate::blockio::BlockIO;
use crate::error::{ImageError, Result};
use crate::image::Image;

const ROOT_INODE: u64 = 1;
const FILE_INODE: u64 = 2;
const TTL: Duration = Duration::from_secs(1);

struct ImageFs {
    block_io:  BlockIO,
    file_name: OsString,
    dir_perm:  u16,
    file_perm: u16,
    uid:       u32,
    gid:       u32,
    atime:     SystemTime,
    mtime:     SystemTime,
}

impl ImageFs {
    fn new(image: Image) -> Result<ImageFs> {
        let file_name = virtual_file_name(image.source_ref().path());
        let meta = image.metadata()?;
        let atime = meta.accessed().unwrap_or(SystemTime::UNIX_EPOCH);
        let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        // Honor the caller's umask for the virtual file and directory.
        let umask = unsafe {
            let cur = libc::umask(0o0750);
            libc::umask(cur);
            cur
        } as u16;
        Ok(ImageFs {
            block_io: BlockIO::new(image)?,
            file_name,
            dir_perm: 0o555 & (0o777 ^ umask),
            file_perm: 0o444 & (0o777 ^ umask),
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            atime,
            mtime,
        })
    }

    fn attr(&self, inode: u64) -> FileAttr {
        let (kind, perm, nlink, size) = if inode == ROOT_INODE {
            (FileType::Directory, self.dir_perm, 2, 0)
        } else {
            (FileType::RegularFile, self.file_perm, 1, self.block_io.total_size())
        };
        FileAttr {
            ino: inode,
            size,
            blocks: size.div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.mtime,
            crtime: self.mtime,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 4096,
            flags: 0,
        }
    }
}

impl Filesystem for ImageFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        if parent != ROOT_INODE || name != self.file_name.as_os_str() {
            reply.error(libc::ENOENT);
            return;
        }
        reply.entry(&TTL, &self.attr(FILE_INODE), 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match ino {
            ROOT_INODE | FILE_INODE => reply.attr(&TTL, &self.attr(ino)),
            _ => reply.error(libc::ENOENT),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if ino != FILE_INODE {
            reply.error(libc::ENOENT);
        } else if flags & (libc::O_RDWR | libc::O_WRONLY) != 0 {
            reply.error(libc::EROFS);
        } else {
            reply.opened(ino, 0);
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        if ino != FILE_INODE || offset < 0 {
            reply.error(libc::ENOENT);
            return;
        }
        log::debug!("read(offset={offset:#x}, size={size:#x})");
        match self.block_io.read_data(offset as u64, size as usize) {
            Ok(data) => reply.data(&data),
            Err(e) => {
                log::error!("read(offset={offset:#x}, size={size:#x}) failed: {e}");
                reply.error(libc::EIO);
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if data.is_empty() {
            reply.written(0);
        } else {
            reply.error(libc::EROFS);
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        if ino != ROOT_INODE {
            reply.error(libc::ENOENT);
            return;
        }
        // One entry besides the dot entries.
        let entries: [(u64, FileType, &OsStr); 3] = [
            (ROOT_INODE, FileType::Directory, OsStr::new(".")),
            (ROOT_INODE, FileType::Directory, OsStr::new("..")),
            (FILE_INODE, FileType::RegularFile, &self.file_name),
        ];
        for (i, (ino, kind, name)) in
            entries.iter().enumerate().skip(offset as usize)
        {
            if reply.add(*ino, i as i64 + 1, *kind, name) {
                break;
            }
        }
        reply.ok();
    }
}

/// Name of the virtual file: the image file name, with a trailing `.img`
/// (any case) stripped.
pub fn virtual_file_name(image_path: &Path) -> OsString {
    let name = image_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stripped = if name.to_lowercase().ends_with(".img") {
        name[..name.len() - 4].to_string()
    } else {
        name
    };
    OsString::from(stripped)
}

/// Mount type argument for the suggested `mount` command; empty means
/// mount is best called without `-t`.
fn mnt_type(fs_type: &str) -> String {
    if fs_type == "EXFAT" {
        "exfat".to_string()
    } else if fs_type.contains("FAT") {
        "vfat".to_string()
    } else if fs_type == "EXTFS" {
        String::new()
    } else {
        fs_type.to_lowercase()
    }
}

/// Suggested file-system check command for a read-only partition.
fn fsck_cmd(fs_type: &str) -> String {
    match fs_type {
        "NTFS" => "ntfsfix --no-action".to_string(),
        "BTRFS" => "btrfsck --check --readonly".to_string(),
        "EXFAT" => "fsck.exfat -n".to_string(),
        "XFS" => "xfs_repair -f -n".to_string(),
        "EXTFS" => "e2fsck -f -n".to_string(),
        t if t.contains("FAT") => "fsck.fat -n".to_string(),
        t => format!("fsck.{} -n", t.to_lowercase()),
    }
}

/// Check that the image sits on something seekable enough to mount.
pub fn assert_regular_file(image: &Image) -> Result<()> {
    use std::os::unix::fs::FileTypeExt;
    let meta = image.metadata()?;
    let ft = meta.file_type();
    if ft.is_file() || ft.is_block_device() {
        return Ok(());
    }
    let kind = if ft.is_socket() {
        "a socket"
    } else if ft.is_char_device() {
        "a character device"
    } else if ft.is_fifo() {
        "a fifo"
    } else {
        "something else"
    };
    Err(ImageError::NotARegularFile {
        path: image.source_ref().path().to_path_buf(),
        kind,
    })
}

/// Mount `image` under `mountpoint` and serve until unmounted.
///
/// Prints how to check and loop-mount the virtual partition first. Runs
/// in the foreground; `debug` additionally enables FUSE request tracing
/// through the logger.
pub fn run_fuse(image: Image, mountpoint: &Path, debug: bool) -> Result<()> {
    assert_regular_file(&image)?;
    let fs_type = image.fs_type();
    let tool = image.tool();
    let fs = ImageFs::new(image)?;

    let dir_name = mountpoint
        .canonicalize()
        .unwrap_or_else(|_| mountpoint.to_path_buf());
    let file_name = dir_name.join(&fs.file_name);
    println!();
    println!("Virtual partition provided as '{}'.", file_name.display());
    println!();
    println!("The file system of this virtual partition can be checked with this command:");
    println!("   {} {}", fsck_cmd(&fs_type), file_name.display());
    println!();
    println!(
        "This virtual partition can be mounted as a read-only filesystem at \
         '{}' with this command:",
        dir_name.display()
    );
    let mnt = mnt_type(&fs_type);
    let mnt = if mnt.is_empty() { mnt } else { format!("-t {mnt} ") };
    println!(
        "   sudo mount {mnt}{} {} -o loop,ro",
        file_name.display(),
        dir_name.display()
    );
    println!();
    println!(
        "Entering event-loop. When done unmount '{}' to quit it:",
        dir_name.display()
    );
    println!("   sudo umount {0}; umount {0}", dir_name.display());
    println!();

    // allow_other lets root loop-mount the virtual file; it needs
    // user_allow_other in /etc/fuse.conf.
    let options = [
        MountOption::RO,
        MountOption::FSName(format!("v{tool}")),
        MountOption::AllowOther,
    ];
    if debug {
        log::debug!("FUSE request tracing enabled");
    }
    fuser::mount2(fs, mountpoint, &options)?;
    Ok(())
}
