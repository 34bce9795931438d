mod common;

use common::*;
use virtpart::{open_image, BlockIO, ByteSource, Format, Image, ImageError};

fn open_partclone(bytes: &[u8], stride: u32) -> virtpart::Result<Image> {
    // The temp file is unlinked when `file` drops; the image keeps its
    // already-open descriptor, which is all these tests need.
    let file = write_temp(bytes);
    let source = ByteSource::open(file.path(), false)?;
    open_image(source, Format::PartClone, stride)
}

/// 1 MiB partition, 4096-byte blocks, every even block stored.
fn even_blocks_spec() -> PartcloneSpec {
    let used: Vec<bool> = (0..256).map(|k| k % 2 == 0).collect();
    PartcloneSpec::plain(4096, used)
}

#[test]
fn open_parses_header() {
    let spec = even_blocks_spec();
    let image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    assert_eq!(image.tool(), "partclone");
    assert_eq!(image.fs_type(), "NTFS");
    assert_eq!(image.block_size(), 4096);
    assert_eq!(image.total_blocks(), 256);
    assert_eq!(image.total_size(), 256 * 4096);
    assert_eq!(image.used_blocks(), 128);
    assert_eq!(image.blocks_section_offset(), spec.data_section_offset());
}

#[test]
fn block_offsets_follow_the_packing() {
    let spec = even_blocks_spec();
    let mut image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    let data_start = spec.data_section_offset();
    assert_eq!(image.block_offset(0).unwrap(), Some(data_start));
    assert_eq!(image.block_offset(2).unwrap(), Some(data_start + 4096));
    assert_eq!(image.block_offset(1).unwrap(), None);
    assert_eq!(image.block_offset(254).unwrap(), Some(data_start + 127 * 4096));
    assert!(matches!(
        image.block_offset(256),
        Err(ImageError::OutOfRange { block: 256 })
    ));
}

#[test]
fn read_data_reconstructs_the_partition() {
    let spec = even_blocks_spec();
    let expected = expected_partition(&spec.used, 4096);
    let image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    let mut io = BlockIO::new(image).unwrap();

    assert_eq!(io.total_size(), 1 << 20);
    let all = io.read_data(0, 1 << 20).unwrap();
    assert_eq!(all, expected);

    // Unused blocks come back as zeros.
    assert_eq!(io.read_data(4096, 4096).unwrap(), vec![0u8; 4096]);
    // Unaligned read spanning a stored and an empty block.
    assert_eq!(io.read_data(4000, 200).unwrap(), &expected[4000..4200]);
    // Clamping at the end, empty past the end.
    assert_eq!(io.read_data((1 << 20) - 10, 100).unwrap().len(), 10);
    assert_eq!(io.read_data(1 << 20, 10).unwrap().len(), 0);
}

#[test]
fn index_stride_does_not_change_offsets() {
    let spec = even_blocks_spec();
    let bytes = build_partclone(&spec);
    let mut fine = open_partclone(&bytes, 1024).unwrap();
    let mut coarse = open_partclone(&bytes, 4096).unwrap();
    for block_no in 0..256 {
        assert_eq!(
            fine.block_offset(block_no).unwrap(),
            coarse.block_offset(block_no).unwrap(),
            "block {block_no}"
        );
    }
}

#[test]
fn sequential_reader_visits_used_blocks_in_order() {
    let spec = even_blocks_spec();
    let mut image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    let mut seen: Vec<u64> = Vec::new();
    image
        .read_blocks(
            true,
            Some(&mut |offset, block| {
                assert_eq!(block, block_bytes(offset / 4096, 4096));
                seen.push(offset);
            }),
        )
        .unwrap();
    let expected: Vec<u64> = (0..256).filter(|k| k % 2 == 0).map(|k| k * 4096).collect();
    assert_eq!(seen, expected);
}

#[test]
fn checksummed_image_verifies_and_detects_corruption() {
    // 200 used blocks with a CRC every 64: three full groups plus a
    // final partial CRC over the remaining 8 blocks.
    let used: Vec<bool> = (0..256).map(|k| k < 200).collect();
    let spec = PartcloneSpec::crc32(4096, used, 64, true);
    let bytes = build_partclone(&spec);

    let expected_len = spec.data_section_offset() as usize + 200 * 4096 + 4 * 4;
    assert_eq!(bytes.len(), expected_len);

    let mut image = open_partclone(&bytes, 1024).unwrap();
    let mut blocks = 0u64;
    image
        .read_blocks(true, Some(&mut |_, _| blocks += 1))
        .unwrap();
    assert_eq!(blocks, 200);

    // Flip one bit inside a stored block.
    let mut corrupt = bytes.clone();
    let flip_at = spec.data_section_offset() as usize + 17 * 4096 + 99;
    corrupt[flip_at] ^= 0x10;
    let mut image = open_partclone(&corrupt, 1024).unwrap();
    let err = image.read_blocks(true, None).unwrap_err();
    assert!(matches!(err, ImageError::DataCorrupt(_)), "{err}");
}

#[test]
fn interleaved_checksums_shift_block_offsets() {
    let used: Vec<bool> = (0..256).map(|k| k < 200).collect();
    let spec = PartcloneSpec::crc32(4096, used, 64, false);
    let mut image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    let data_start = spec.data_section_offset();
    // Block 100 sits after 100 stored blocks and one CRC group boundary.
    assert_eq!(
        image.block_offset(100).unwrap(),
        Some(data_start + 100 * 4096 + 4)
    );
    // Block 63 is still inside the first group.
    assert_eq!(image.block_offset(63).unwrap(), Some(data_start + 63 * 4096));
    // Block 128 sits after two full groups.
    assert_eq!(
        image.block_offset(128).unwrap(),
        Some(data_start + 128 * 4096 + 8)
    );
}

#[test]
fn trailing_data_is_rejected() {
    let spec = even_blocks_spec();
    let mut bytes = build_partclone(&spec);
    bytes.push(0xab);
    let mut image = open_partclone(&bytes, 1024).unwrap();
    let err = image.read_blocks(true, None).unwrap_err();
    match err {
        ImageError::DataCorrupt(msg) => assert!(msg.contains("1 byte"), "{msg}"),
        other => panic!("expected DataCorrupt, got {other}"),
    }
}

#[test]
fn corrupted_header_and_bitmap_are_typed_errors() {
    let spec = even_blocks_spec();
    let good = build_partclone(&spec);

    // Header byte flip: CRC catches it.
    let mut bad = good.clone();
    bad[60] ^= 1;
    assert!(matches!(
        open_partclone(&bad, 1024).unwrap_err(),
        ImageError::HeaderCorrupt(_)
    ));

    // Bitmap byte flip: bitmap CRC catches it.
    let mut bad = good.clone();
    bad[120] ^= 1;
    assert!(matches!(
        open_partclone(&bad, 1024).unwrap_err(),
        ImageError::BitmapCorrupt(_)
    ));

    // Unsupported image format version.
    let mut bad = good.clone();
    bad[30..34].copy_from_slice(b"0001");
    let crc = virtpart::crc::crc32(&bad[..106], virtpart::crc::CRC32_SEED);
    bad[106..110].copy_from_slice(&crc.to_le_bytes());
    assert!(matches!(
        open_partclone(&bad, 1024).unwrap_err(),
        ImageError::UnsupportedVersion(_)
    ));

    // Not a partclone image at all.
    let bad = vec![0u8; 256];
    assert!(matches!(
        open_partclone(&bad, 1024).unwrap_err(),
        ImageError::WrongImageFile { .. }
    ));
}

#[test]
fn big_endian_headers_parse() {
    let mut spec = even_blocks_spec();
    spec.big_endian = true;
    let image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    assert_eq!(image.total_blocks(), 256);
    assert_eq!(image.used_blocks(), 128);
    assert_eq!(image.block_size(), 4096);
}

#[test]
fn partial_final_bitmap_byte_is_masked() {
    // 12 blocks: the bitmap's final byte has 4 spare bits.
    let used: Vec<bool> = (0..12).map(|k| k % 3 == 0).collect();
    let spec = PartcloneSpec::plain(512, used.clone());
    let mut image = open_partclone(&build_partclone(&spec), 1024).unwrap();
    assert_eq!(image.used_blocks(), 4);
    for (k, &in_use) in used.iter().enumerate() {
        assert_eq!(image.block_in_use(k as u64).unwrap(), in_use);
    }
    assert!(matches!(
        image.block_offset(16),
        Err(ImageError::OutOfRange { block: 16 })
    ));
}
