mod common;

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use common::*;
use virtpart::source::{SplitSource, MAX_OPEN_PARTS};
use virtpart::{open_image, BlockIO, ByteSource, Codec, Format, ImageError};

/// Write `bytes` into `dir` as split parts `<stem>aa`, `<stem>ab`, ...
/// of the given sizes (the last part takes the remainder).
fn write_split(dir: &Path, stem: &str, bytes: &[u8], sizes: &[usize]) -> std::path::PathBuf {
    let suffixes = ["aa", "ab", "ac", "ad", "ae", "af", "ag"];
    let mut at = 0;
    for (i, suffix) in suffixes.iter().enumerate() {
        let end = if i < sizes.len() { (at + sizes[i]).min(bytes.len()) } else { bytes.len() };
        fs::write(dir.join(format!("{stem}{suffix}")), &bytes[at..end]).unwrap();
        at = end;
        if at == bytes.len() {
            break;
        }
    }
    assert_eq!(at, bytes.len(), "sizes must cover the image");
    dir.join(format!("{stem}aa"))
}

#[test]
fn split_source_concatenates_parts() {
    let spec = PartcloneSpec::plain(4096, (0..64).map(|k| k % 2 == 0).collect());
    let bytes = build_partclone(&spec);
    let dir = tempfile::tempdir().unwrap();
    let first =
        write_split(dir.path(), "image.", &bytes, &[1000, 3000, 50000, 70000]);

    let source = ByteSource::open(&first, false).unwrap();
    assert_eq!(source.total_size(), Some(bytes.len() as u64));

    // Byte-identical to reading the unsplit file.
    let image = open_image(source, Format::PartClone, 1024).unwrap();
    let mut io = BlockIO::new(image).unwrap();
    let expected = expected_partition(&spec.used, 4096);
    assert_eq!(io.read_data(0, expected.len()).unwrap(), expected);

    // A read spanning several part boundaries.
    assert_eq!(io.read_data(0, 4096).unwrap(), &expected[..4096]);
}

#[test]
fn split_requires_the_ab_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("solo.aa");
    fs::write(&path, b"partclone-imagex").unwrap();
    // Without an `ab` part this is just a file whose name ends in `aa`.
    let source = ByteSource::open(&path, true).unwrap();
    assert_eq!(source.total_size(), Some(16));
}

#[test]
fn split_lru_stays_bounded() {
    let dir = tempfile::tempdir().unwrap();
    // 60 one-byte parts.
    let payload: Vec<u8> = (0..60u8).collect();
    for (i, &b) in payload.iter().enumerate() {
        let suffix = format!(
            "{}{}",
            (b'a' + (i / 26) as u8) as char,
            (b'a' + (i % 26) as u8) as char
        );
        fs::write(dir.path().join(format!("part.{suffix}")), [b]).unwrap();
    }
    let mut split = SplitSource::open(&dir.path().join("part.aa")).unwrap();
    assert_eq!(split.total_size(), 60);

    // Random single-byte reads across every part.
    let mut buf = [0u8; 1];
    for round in 0..3 {
        for i in 0..60u64 {
            let pos = (i * 37 + round) % 60;
            split.seek(pos);
            split.read_exact(&mut buf).unwrap();
            assert_eq!(buf[0], payload[pos as usize]);
            assert!(split.open_handles() <= MAX_OPEN_PARTS);
        }
    }
}

#[test]
fn sequential_split_read_closes_exhausted_parts() {
    let dir = tempfile::tempdir().unwrap();
    for (i, suffix) in ["aa", "ab", "ac"].iter().enumerate() {
        fs::write(dir.path().join(format!("p.{suffix}")), vec![i as u8; 100]).unwrap();
    }
    let mut split = SplitSource::open(&dir.path().join("p.aa")).unwrap();
    let mut out = Vec::new();
    split.read_to_end(&mut out).unwrap();
    assert_eq!(out.len(), 300);
    // Every part has been read past its end and closed again.
    assert_eq!(split.open_handles(), 0);
}

#[test]
fn gzip_image_streams_sequentially() {
    let spec = PartcloneSpec::crc32(4096, (0..64).map(|k| k % 3 == 0).collect(), 16, false);
    let bytes = build_partclone(&spec);

    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&bytes).unwrap();
    let compressed = encoder.finish().unwrap();
    let file = write_temp(&compressed);

    // Sequential use decodes on the fly; the CRC pass succeeds.
    let source = ByteSource::open(file.path(), true).unwrap();
    assert_eq!(source.codec(), Some(Codec::Gzip));
    let mut image = open_image(source, Format::PartClone, 1024).unwrap();
    image.read_blocks(true, None).unwrap();
}

#[test]
fn gzip_image_cannot_be_mounted() {
    let spec = PartcloneSpec::plain(512, vec![true; 8]);
    let bytes = build_partclone(&spec);
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&bytes).unwrap();
    let file = write_temp(&encoder.finish().unwrap());

    let err = ByteSource::open(file.path(), false).unwrap_err();
    match err {
        ImageError::NotSeekable { codec, hint } => {
            assert_eq!(codec, Codec::Gzip);
            assert!(hint.contains("gunzip <"), "{hint}");
        }
        other => panic!("expected NotSeekable, got {other}"),
    }
}

#[test]
fn zstd_and_lz4_streams_decode() {
    let spec = PartcloneSpec::plain(512, (0..32).map(|k| k % 4 == 0).collect());
    let bytes = build_partclone(&spec);

    let compressed = zstd::encode_all(&bytes[..], 3).unwrap();
    let file = write_temp(&compressed);
    let source = ByteSource::open(file.path(), true).unwrap();
    assert_eq!(source.codec(), Some(Codec::Zstd));
    let mut image = open_image(source, Format::PartClone, 1024).unwrap();
    image.read_blocks(true, None).unwrap();

    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder.write_all(&bytes).unwrap();
    let file = write_temp(&encoder.finish().unwrap());
    let source = ByteSource::open(file.path(), true).unwrap();
    assert_eq!(source.codec(), Some(Codec::Lz4));
    let mut image = open_image(source, Format::PartClone, 1024).unwrap();
    image.read_blocks(true, None).unwrap();
}

#[test]
fn peek_does_not_consume() {
    let file = write_temp(b"partclone-image rest of the header");
    let mut source = ByteSource::open(file.path(), true).unwrap();
    assert_eq!(source.peek(15).unwrap(), b"partclone-image");
    assert_eq!(source.peek(15).unwrap(), b"partclone-image");
    assert_eq!(source.tell(), 0);
    let mut buf = [0u8; 15];
    source.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"partclone-image");
    assert_eq!(source.tell(), 15);
}

#[test]
fn compressed_split_parts_compose() {
    // Decompression wraps concatenation: split a gzip stream into parts.
    let spec = PartcloneSpec::plain(4096, (0..32).map(|k| k < 8).collect());
    let bytes = build_partclone(&spec);
    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&bytes).unwrap();
    let compressed = encoder.finish().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let first = write_split(dir.path(), "img.gz.", &compressed, &[777, 1000]);
    let source = ByteSource::open(&first, true).unwrap();
    assert_eq!(source.codec(), Some(Codec::Gzip));
    let mut image = open_image(source, Format::PartClone, 1024).unwrap();
    let mut blocks = 0;
    image.read_blocks(true, Some(&mut |_, _| blocks += 1)).unwrap();
    assert_eq!(blocks, 8);
}
