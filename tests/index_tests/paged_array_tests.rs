//! Tests for the paged array chunk index
//!
//! These tests verify:
//! - Capacity follows the maximum extent, not the current one
//! - Unpaged and paged layouts both store and find records
//! - Records come back in linear order and skip unwritten pages
//! - Coordinates past the maximum extent and unlimited dimensions are rejected
//! - Reopen and delete

use std::path::PathBuf;

use chunkstore::index::ChunkIndex;
use chunkstore::{ChunkCoord, ChunkError, ChunkLayout, Config, Dataspace, IndexKind, StorageFile};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("paged.chk");
    (temp_dir, path)
}

/// 8x8 now, growable to 64x64; 16x16 chunks of 4x4
fn growable_layout() -> ChunkLayout {
    let space = Dataspace::new(&[8, 8], &[Some(64), Some(64)]).unwrap();
    ChunkLayout::new(&[4, 4], 4, &space).unwrap()
}

fn paged() -> IndexKind {
    IndexKind::PagedArray { page_bits: 4 }
}

// =============================================================================
// Geometry
// =============================================================================

#[test]
fn test_capacity_covers_maximum_extent() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let index = ChunkIndex::create(&file, &growable_layout(), IndexKind::paged_array()).unwrap();

    assert_eq!(index.capacity(), Some(256));
    assert_eq!(index.height(&file).unwrap(), None);
    assert_eq!(index.kind(), IndexKind::paged_array());
    assert!(format!("{index:?}").contains("PagedArray { page_bits: 10 }"));
}

#[test]
fn test_unlimited_dimension_rejected() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let space = Dataspace::new(&[8, 8], &[None, Some(8)]).unwrap();
    let layout = ChunkLayout::new(&[4, 4], 4, &space).unwrap();

    let result = ChunkIndex::create(&file, &layout, IndexKind::paged_array());
    assert!(matches!(result, Err(ChunkError::Config(_))));
}

#[test]
fn test_page_bits_out_of_range_rejected() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();

    for page_bits in [0u8, 33] {
        let result = ChunkIndex::create(&file, &growable_layout(), IndexKind::PagedArray { page_bits });
        assert!(matches!(result, Err(ChunkError::Config(_))), "page_bits {page_bits}");
    }
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_unpaged_insert_and_get() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), IndexKind::paged_array()).unwrap();
    let coord = ChunkCoord::new(&[4, 0]);

    assert!(!index.get(&file, &coord).unwrap().is_allocated());
    let inserted = index.insert_or_resize(&file, &coord, 64, 0b100).unwrap();

    let found = index.get(&file, &ChunkCoord::new(&[4, 0])).unwrap();
    assert_eq!(found, inserted);
    assert!(!index.get(&file, &ChunkCoord::new(&[0, 0])).unwrap().is_allocated());
}

#[test]
fn test_chunk_beyond_current_extent_is_addressable() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();
    let coord = ChunkCoord::new(&[60, 60]);

    index.insert_or_resize(&file, &coord, 64, 0).unwrap();
    assert!(index.get(&file, &coord).unwrap().is_allocated());
}

#[test]
fn test_chunk_beyond_maximum_extent_rejected() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();

    let err = index
        .insert_or_resize(&file, &ChunkCoord::new(&[64, 0]), 64, 0)
        .unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
}

#[test]
fn test_pages_are_independent() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();

    // rows 0 and 2 of the chunk grid land on pages 0 and 2
    let first = ChunkCoord::new(&[0, 12]);
    let second = ChunkCoord::new(&[8, 4]);
    index.insert_or_resize(&file, &first, 10, 0).unwrap();
    index.insert_or_resize(&file, &second, 20, 0).unwrap();

    assert_eq!(index.get(&file, &first).unwrap().nbytes, 10);
    assert_eq!(index.get(&file, &second).unwrap().nbytes, 20);
    // page 1 was never written
    assert!(!index.get(&file, &ChunkCoord::new(&[4, 4])).unwrap().is_allocated());
}

#[test]
fn test_records_in_linear_order() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();

    let written = [[32u64, 8], [0, 4], [60, 0], [0, 0], [12, 60]];
    for offsets in written {
        index.insert_or_resize(&file, &ChunkCoord::new(&offsets), 16, 0).unwrap();
    }

    let listed: Vec<ChunkCoord> = index
        .records(&file)
        .unwrap()
        .map(|r| r.unwrap().coord)
        .collect();
    let mut expected: Vec<ChunkCoord> = written.iter().map(|o| ChunkCoord::new(o)).collect();
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn test_remove_clears_record() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();
    let coord = ChunkCoord::new(&[20, 20]);

    index.insert_or_resize(&file, &coord, 64, 0).unwrap();
    index.remove(&file, &coord).unwrap();

    assert!(!index.get(&file, &coord).unwrap().is_allocated());
    assert_eq!(index.records(&file).unwrap().count(), 0);
    assert!(matches!(
        index.remove(&file, &coord),
        Err(ChunkError::ChunkNotAllocated)
    ));
}

// =============================================================================
// Persistence
// =============================================================================

#[test]
fn test_reopen_sees_written_pages() {
    let (_temp, path) = setup_temp_file();
    let config = Config::default();

    let desc = {
        let file = StorageFile::create(&path, &config).unwrap();
        let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();
        index.insert_or_resize(&file, &ChunkCoord::new(&[0, 0]), 64, 0).unwrap();
        index.insert_or_resize(&file, &ChunkCoord::new(&[44, 28]), 32, 0b1).unwrap();
        file.flush().unwrap();
        index.descriptor()
    };

    let file = StorageFile::open(&path, &config).unwrap();
    let mut index = ChunkIndex::open(&file, &growable_layout(), desc).unwrap();
    let record = index.get(&file, &ChunkCoord::new(&[44, 28])).unwrap();
    assert_eq!(record.nbytes, 32);
    assert_eq!(record.filter_mask, 0b1);
    assert_eq!(index.records(&file).unwrap().count(), 2);
}

#[test]
fn test_reopen_with_other_page_size_fails() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();

    let mut desc = index.descriptor();
    desc.kind = IndexKind::PagedArray { page_bits: 5 };
    let err = ChunkIndex::open(&file, &growable_layout(), desc).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_delete_all_releases_everything() {
    let (_temp, path) = setup_temp_file();
    let file = StorageFile::create(&path, &Config::default()).unwrap();
    let baseline = file.eoa();

    let mut index = ChunkIndex::create(&file, &growable_layout(), paged()).unwrap();
    for row in 0..8u64 {
        index
            .insert_or_resize(&file, &ChunkCoord::new(&[row * 8, row * 4]), 64, 0)
            .unwrap();
    }

    index.delete_all(&file).unwrap();
    assert_eq!(file.eoa(), baseline);
    assert_eq!(file.free_bytes(), 0);
}
