//! Virtual concatenation of split image files.
//!
//! Tools like `split(1)` divide a large image into `<stem>aa`, `<stem>ab`,
//! ... and the parts are commonly kept that way. This module presents the
//! ordered parts as one contiguous read-only byte stream whose length is
//! the sum of the parts.
//!
//! Suffix order follows `split(1)`: two-letter suffixes `aa`..`az`,
//! `ba`..`yz` (650 names; `z` is reserved), then four-letter suffixes
//! `zaaa`, `zaab`, ... Parts are opened lazily. During random access at
//! most [`MAX_OPEN_PARTS`] file handles stay open, evicted
//! least-recently-used; a part whose last byte has been read is closed
//! immediately, which keeps sequential scans at one open handle.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;

/// Upper bound on simultaneously open part handles.
pub const MAX_OPEN_PARTS: usize = 48;

struct Part {
    path:  PathBuf,
    /// Byte offset of this part within the concatenated stream.
    start: u64,
    size:  u64,
}

pub struct SplitSource {
    parts:   Vec<Part>,
    handles: LruCache<usize, File>,
    pos:     u64,
    total:   u64,
}

/// Generate part suffixes in `split(1)` order: `aa`..`yz`, then `zaaa`...
fn suffixes() -> impl Iterator<Item = String> {
    let two = (b'a'..=b'y').flat_map(|a| {
        (b'a'..=b'z').map(move |b| String::from_utf8(vec![a, b]).unwrap())
    });
    let four = (b'a'..=b'z').flat_map(|a| {
        (b'a'..=b'z').flat_map(move |b| {
            (b'a'..=b'z')
                .map(move |c| String::from_utf8(vec![b'z', a, b, c]).unwrap())
        })
    });
    two.chain(four)
}

impl SplitSource {
    /// Does `path` look like the first part of a split image? True when
    /// the name ends in `aa` and a sibling ending in `ab` exists.
    pub fn is_split(path: &Path) -> bool {
        match path.to_str() {
            Some(name) if name.ends_with("aa") => {
                let stem = &name[..name.len() - 2];
                Path::new(&format!("{stem}ab")).exists()
            }
            _ => false,
        }
    }

    /// Enumerate the parts of the split image starting at `path` (the
    /// `aa` part). Enumeration stops at the first missing suffix.
    pub fn open(path: &Path) -> io::Result<SplitSource> {
        let name = path.to_str().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "non-UTF-8 image path")
        })?;
        let stem = &name[..name.len() - 2];

        let mut parts = Vec::new();
        let mut total = 0u64;
        for suffix in suffixes() {
            let part_path = PathBuf::from(format!("{stem}{suffix}"));
            let Ok(meta) = fs::metadata(&part_path) else { break };
            parts.push(Part { path: part_path, start: total, size: meta.len() });
            total += meta.len();
        }
        if parts.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no parts found for split image '{name}'"),
            ));
        }
        log::debug!("split image '{stem}*': {} parts, {total} bytes", parts.len());

        let cap = NonZeroUsize::new(MAX_OPEN_PARTS).unwrap();
        Ok(SplitSource { parts, handles: LruCache::new(cap), pos: 0, total })
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Number of currently open part handles (bounded by the LRU).
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Path of the part containing the current position, for `stat()`.
    pub fn active_part(&self) -> &Path {
        let idx = self.part_index(self.pos.min(self.total.saturating_sub(1)));
        &self.parts[idx].path
    }

    fn part_index(&self, pos: u64) -> usize {
        // Index of the last part starting at or before pos.
        self.parts.partition_point(|p| p.start <= pos).saturating_sub(1)
    }
}

impl Read for SplitSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.total || buf.is_empty() {
            return Ok(0);
        }
        let idx = self.part_index(self.pos);
        let part = &self.parts[idx];
        let within = self.pos - part.start;

        if !self.handles.contains(&idx) {
            self.handles.put(idx, File::open(&part.path)?);
        }
        let file = self.handles.get_mut(&idx).unwrap();

        // Handles are shared across reads at arbitrary offsets; position
        // explicitly every time.
        file.seek(SeekFrom::Start(within))?;
        let want = buf.len().min((part.size - within) as usize);
        let got = file.read(&mut buf[..want])?;
        self.pos += got as u64;

        // Close a part as soon as its last byte has been consumed.
        if self.pos >= part.start + part.size {
            self.handles.pop(&idx);
        }
        Ok(got)
    }
}
