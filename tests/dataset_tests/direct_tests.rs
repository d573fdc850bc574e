//! Tests for raw chunk access
//!
//! These tests verify:
//! - write_chunk then read_chunk returns the same bytes and mask on both backends
//! - Raw filtered chunks move between datasets without re-encoding
//! - A dirty cached copy is written back before a raw read
//! - A raw write replaces any cached copy
//! - Unallocated, misaligned, short unfiltered and read-only cases fail cleanly

use std::sync::Arc;

use chunkstore::{
    ChunkCoord, ChunkError, Config, Dataset, DatasetOptions, Dataspace, FilterDescriptor,
    IndexKind, Selection, StorageFile,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn create_file(dir: &TempDir, name: &str, config: &Config) -> Arc<StorageFile> {
    Arc::new(StorageFile::create(&dir.path().join(name), config).unwrap())
}

fn i32_bytes(values: impl IntoIterator<Item = i32>) -> Vec<u8> {
    values.into_iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn to_i32(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// 8x8 i32 in 4x4 chunks
fn create_dataset(file: Arc<StorageFile>, options: DatasetOptions, config: &Config) -> Dataset {
    Dataset::create(file, Dataspace::simple(&[8, 8]), options, config).unwrap()
}

fn read_block(dataset: &mut Dataset, start: [u64; 2]) -> Vec<i32> {
    let block = Selection::block(&start, &[4, 4]).unwrap();
    let mut out = vec![0u8; 64];
    dataset
        .read(&block, &Dataspace::simple(&[16]), &Selection::All, &mut out)
        .unwrap();
    to_i32(&out)
}

fn filtered_options() -> DatasetOptions {
    DatasetOptions::builder(&[4, 4], 4)
        .filter(FilterDescriptor::shuffle())
        .filter(FilterDescriptor::deflate(6))
        .build()
}

// =============================================================================
// Round Trips
// =============================================================================

#[test]
fn test_raw_round_trip_both_backends() {
    for index in [IndexKind::btree(), IndexKind::paged_array()] {
        let dir = setup_temp_dir();
        let config = Config::default();
        let options = DatasetOptions::builder(&[4, 4], 4).index(index).build();
        let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

        let coord = ChunkCoord::new(&[4, 0]);
        let raw: Vec<u8> = (0..64u8).collect();
        dataset.write_chunk(&coord, &raw, 0b101).unwrap();

        assert_eq!(dataset.read_chunk(&coord).unwrap(), (raw, 0b101), "{}", index.name());
        let record = dataset.chunk_info(&coord).unwrap();
        assert_eq!(record.nbytes, 64);
        assert_eq!(record.filter_mask, 0b101);
    }
}

#[test]
fn test_raw_write_is_visible_to_reads() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

    dataset
        .write_chunk(&ChunkCoord::new(&[4, 4]), &i32_bytes(100..116), 0)
        .unwrap();
    assert_eq!(read_block(&mut dataset, [4, 4]), (100..116).collect::<Vec<_>>());
}

#[test]
fn test_raw_rewrite_with_new_length() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), filtered_options(), &config);
    let coord = ChunkCoord::new(&[0, 0]);

    dataset.write_chunk(&coord, &[1u8; 40], 0).unwrap();
    dataset.write_chunk(&coord, &[2u8; 24], 0b10).unwrap();

    let (raw, mask) = dataset.read_chunk(&coord).unwrap();
    assert_eq!(raw, vec![2u8; 24]);
    assert_eq!(mask, 0b10);
}

#[test]
fn test_filtered_chunks_transplant_between_datasets() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut source = create_dataset(create_file(&dir, "src.chk", &config), filtered_options(), &config);
    let mut dest = create_dataset(create_file(&dir, "dst.chk", &config), filtered_options(), &config);

    let values: Vec<i32> = (0..64).map(|v| v / 4).collect();
    source
        .write(&Selection::All, &Dataspace::simple(&[8, 8]), &Selection::All, &i32_bytes(values.iter().copied()))
        .unwrap();

    for record in source.chunk_records().unwrap().collect::<Vec<_>>() {
        let record = record.unwrap();
        let (raw, mask) = source.read_chunk(&record.coord).unwrap();
        assert!(raw.len() < 64);
        dest.write_chunk(&record.coord, &raw, mask).unwrap();
    }

    let mut out = vec![0u8; 256];
    dest.read(&Selection::All, &Dataspace::simple(&[8, 8]), &Selection::All, &mut out)
        .unwrap();
    assert_eq!(to_i32(&out), values);
}

#[test]
fn test_dump_index_lists_raw_chunks() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

    dataset.write_chunk(&ChunkCoord::new(&[4, 0]), &[1u8; 64], 0b101).unwrap();
    dataset.write_chunk(&ChunkCoord::new(&[0, 4]), &[2u8; 64], 0).unwrap();

    let mut out = Vec::new();
    dataset.dump_index(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert!(lines[0].starts_with("# index=btree dims=[8, 8] height="));
    assert_eq!(lines.len(), 3);
    assert!(lines[1].ends_with("nbytes=64 mask=0x0"));
    assert!(lines[2].ends_with("nbytes=64 mask=0x5"));
}

// =============================================================================
// Cache Interaction
// =============================================================================

#[test]
fn test_raw_read_flushes_dirty_cached_copy() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

    let block = Selection::block(&[0, 4], &[4, 4]).unwrap();
    dataset
        .write(&block, &Dataspace::simple(&[16]), &Selection::All, &i32_bytes(0..16))
        .unwrap();
    assert!(dataset.cache_bytes_used() > 0);

    let (raw, mask) = dataset.read_chunk(&ChunkCoord::new(&[0, 4])).unwrap();
    assert_eq!(mask, 0);
    assert_eq!(to_i32(&raw), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_raw_write_replaces_cached_copy() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);
    let coord = ChunkCoord::new(&[0, 0]);

    let block = Selection::block(&[0, 0], &[4, 4]).unwrap();
    dataset
        .write(&block, &Dataspace::simple(&[16]), &Selection::All, &i32_bytes(0..16))
        .unwrap();
    dataset.write_chunk(&coord, &i32_bytes(50..66), 0).unwrap();
    assert_eq!(dataset.cache_bytes_used(), 0);

    // the stale dirty entry must not come back on flush
    dataset.flush().unwrap();
    assert_eq!(read_block(&mut dataset, [0, 0]), (50..66).collect::<Vec<_>>());
    assert_eq!(to_i32(&dataset.read_chunk(&coord).unwrap().0), (50..66).collect::<Vec<_>>());
}

// =============================================================================
// Errors
// =============================================================================

#[test]
fn test_raw_read_of_unwritten_chunk() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

    let err = dataset.read_chunk(&ChunkCoord::new(&[4, 4])).unwrap_err();
    assert!(matches!(err, ChunkError::ChunkNotAllocated));
}

#[test]
fn test_misaligned_or_outside_coordinates_rejected() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).build();
    let mut dataset = create_dataset(create_file(&dir, "a.chk", &config), options, &config);

    for offsets in [[2u64, 0], [8, 0]] {
        let coord = ChunkCoord::new(&offsets);
        assert!(matches!(dataset.read_chunk(&coord), Err(ChunkError::Selection(_))));
        assert!(matches!(
            dataset.write_chunk(&coord, &[0u8; 64], 0),
            Err(ChunkError::Selection(_))
        ));
    }
    assert!(matches!(
        dataset.read_chunk(&ChunkCoord::new(&[0])),
        Err(ChunkError::Selection(_))
    ));
}

#[test]
fn test_short_unfiltered_raw_chunk_rejected() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 1).build();
    let file = create_file(&dir, "a.chk", &config);
    let mut dataset =
        Dataset::create(file, Dataspace::simple(&[8, 8]), options, &config).unwrap();

    let short = dataset.write_chunk(&ChunkCoord::new(&[0, 0]), &[1u8; 4], 0);
    assert!(matches!(short, Err(ChunkError::Selection(_))));
    assert!(!dataset.chunk_info(&ChunkCoord::new(&[0, 0])).unwrap().is_allocated());

    // a whole-chunk write next to a raw neighbour leaves the neighbour alone
    dataset.write_chunk(&ChunkCoord::new(&[0, 4]), &[0xAA; 16], 0).unwrap();
    let block = Selection::block(&[0, 0], &[4, 4]).unwrap();
    dataset
        .write(&block, &Dataspace::simple(&[16]), &Selection::All, &[0x11; 16])
        .unwrap();
    dataset.flush().unwrap();

    assert_eq!(dataset.read_chunk(&ChunkCoord::new(&[0, 4])).unwrap().0, vec![0xAA; 16]);
    assert_eq!(dataset.read_chunk(&ChunkCoord::new(&[0, 0])).unwrap().0, vec![0x11; 16]);
}

#[test]
fn test_raw_write_on_read_only_file() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("a.chk");
    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        let options = DatasetOptions::builder(&[4, 4], 4).build();
        let mut dataset = create_dataset(file, options, &config);
        dataset
            .write_chunk(&ChunkCoord::new(&[0, 0]), &[7u8; 64], 0)
            .unwrap();
        dataset.close().unwrap();
    }

    let file = Arc::new(StorageFile::open_read_only(&path).unwrap());
    let root = file.root().unwrap();
    let mut dataset = Dataset::open(file, root, &config).unwrap();
    assert_eq!(dataset.read_chunk(&ChunkCoord::new(&[0, 0])).unwrap().0, vec![7u8; 64]);

    let err = dataset
        .write_chunk(&ChunkCoord::new(&[0, 0]), &[1u8; 64], 0)
        .unwrap_err();
    assert!(matches!(err, ChunkError::Resource(_)));
}
