//! Tests for dataset reads and writes
//!
//! These tests verify:
//! - Whole-dataset, hyperslab and point transfers on both index backends
//! - Never-written elements read as fill, or are left alone with `FillTime::Never`
//! - Filtered datasets round-trip through the cache and across reopen
//! - Partial edge chunks can be stored unfiltered
//! - The cache is transparent: same results with it disabled or tiny
//! - Element conversion on the way in and out
//! - Bad selections, buffers and read-only files are rejected
//! - Parallel mode bypasses the cache and synchronizes fill

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chunkstore::convert::IntegerConversion;
use chunkstore::transport::Transport;
use chunkstore::{
    AllocTime, ChunkCoord, ChunkError, Config, Dataset, DatasetOptions, Dataspace, FillTime,
    FilterDescriptor, FilterRegistry, IndexKind, Result, Selection, StorageFile,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

fn create_file(dir: &TempDir, config: &Config) -> Arc<StorageFile> {
    Arc::new(StorageFile::create(&dir.path().join("data.chk"), config).unwrap())
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

/// 10x10 i32 dataset in 4x4 chunks (edge chunks are partial)
fn create_grid(file: Arc<StorageFile>, index: IndexKind, config: &Config) -> Dataset {
    let options = DatasetOptions::builder(&[4, 4], 4).index(index).build();
    Dataset::create(file, Dataspace::simple(&[10, 10]), options, config).unwrap()
}

fn read_all(dataset: &mut Dataset) -> Vec<i32> {
    let space = Dataspace::simple(dataset.dims());
    let mut out = vec![0u8; space.npoints() as usize * 4];
    dataset
        .read(&Selection::All, &space, &Selection::All, &mut out)
        .unwrap();
    to_i32(&out)
}

fn write_all(dataset: &mut Dataset, values: &[i32]) {
    let space = Dataspace::simple(dataset.dims());
    dataset
        .write(&Selection::All, &space, &Selection::All, &i32_bytes(values.iter().copied()))
        .unwrap();
}

/// Parallel transport for a given rank that counts barriers
#[derive(Debug, Default)]
struct CountingTransport {
    rank: usize,
    barriers: AtomicUsize,
}

impl Transport for CountingTransport {
    fn is_parallel(&self) -> bool {
        true
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) -> Result<()> {
        self.barriers.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Round Trips
// =============================================================================

#[test]
fn test_full_round_trip_btree() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let values: Vec<i32> = (0..100).collect();
    write_all(&mut dataset, &values);
    assert_eq!(read_all(&mut dataset), values);
}

#[test]
fn test_full_round_trip_paged_array() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::paged_array(), &config);

    let values: Vec<i32> = (0..100).map(|v| v * 3 - 50).collect();
    write_all(&mut dataset, &values);
    assert_eq!(read_all(&mut dataset), values);
    assert_eq!(dataset.chunk_records().unwrap().count(), 9);
}

#[test]
fn test_round_trip_survives_reopen() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("data.chk");
    let values: Vec<i32> = (0..100).rev().collect();

    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        let mut dataset = create_grid(file, IndexKind::BTree { k: 1 }, &config);
        write_all(&mut dataset, &values);
        dataset.close().unwrap();
    }

    let file = Arc::new(StorageFile::open(&path, &config).unwrap());
    let root = file.root().unwrap();
    let mut dataset = Dataset::open(file, root, &config).unwrap();
    assert_eq!(dataset.dims(), &[10, 10]);
    assert_eq!(dataset.index_kind(), IndexKind::BTree { k: 1 });
    assert_eq!(read_all(&mut dataset), values);
}

#[test]
fn test_hyperslab_into_memory_subset() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    // 2x3 block straddling four chunks, taken from the middle of a 1-D buffer
    let file_sel = Selection::block(&[3, 2], &[2, 3]).unwrap();
    let mem_space = Dataspace::simple(&[10]);
    let mem_sel = Selection::block(&[2], &[6]).unwrap();
    let buf = i32_bytes([0, 0, 1, 2, 3, 4, 5, 6, 0, 0]);
    dataset.write(&file_sel, &mem_space, &mem_sel, &buf).unwrap();

    let all = read_all(&mut dataset);
    assert_eq!(&all[32..35], &[1, 2, 3]);
    assert_eq!(&all[42..45], &[4, 5, 6]);
    assert_eq!(all.iter().filter(|&&v| v != 0).count(), 6);

    let mut out = vec![0u8; 6 * 4];
    dataset
        .read(&file_sel, &Dataspace::simple(&[2, 3]), &Selection::All, &mut out)
        .unwrap();
    assert_eq!(to_i32(&out), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn test_strided_selection() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);
    write_all(&mut dataset, &(0..100).collect::<Vec<_>>());

    // every third column of row 5
    let file_sel = Selection::hyperslab(&[5, 0], Some(&[1, 3]), &[1, 4], None).unwrap();
    let mut out = vec![0u8; 4 * 4];
    dataset
        .read(&file_sel, &Dataspace::simple(&[4]), &Selection::All, &mut out)
        .unwrap();
    assert_eq!(to_i32(&out), vec![50, 53, 56, 59]);
}

#[test]
fn test_points_pair_in_order() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::paged_array(), &config);

    let points = Selection::points(vec![vec![9, 9], vec![0, 0], vec![5, 1]]).unwrap();
    let mem_space = Dataspace::simple(&[3]);
    dataset
        .write(&points, &mem_space, &Selection::All, &i32_bytes([7, 8, 9]))
        .unwrap();

    let all = read_all(&mut dataset);
    assert_eq!(all[99], 7);
    assert_eq!(all[0], 8);
    assert_eq!(all[51], 9);

    let mut out = vec![0u8; 12];
    dataset.read(&points, &mem_space, &Selection::All, &mut out).unwrap();
    assert_eq!(to_i32(&out), vec![7, 8, 9]);
}

#[test]
fn test_single_element_transfer() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let one = Selection::block(&[6, 7], &[1, 1]).unwrap();
    let mem = Dataspace::simple(&[1]);
    dataset.write(&one, &mem, &Selection::All, &i32_bytes([42])).unwrap();

    let mut out = vec![0u8; 4];
    dataset.read(&one, &mem, &Selection::All, &mut out).unwrap();
    assert_eq!(to_i32(&out), vec![42]);
    assert_eq!(dataset.chunk_records().unwrap().count(), 1);
}

#[test]
fn test_empty_selection_is_a_no_op() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let mem = Dataspace::simple(&[1]);
    dataset
        .write(&Selection::None, &mem, &Selection::None, &[0u8; 4])
        .unwrap();
    assert_eq!(dataset.chunk_records().unwrap().count(), 0);
}

// =============================================================================
// Fill Values
// =============================================================================

#[test]
fn test_unwritten_reads_zero_by_default() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    assert_eq!(read_all(&mut dataset), vec![0; 100]);
    assert_eq!(dataset.chunk_records().unwrap().count(), 0);
}

#[test]
fn test_unwritten_reads_user_fill() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4)
        .fill_value((-1i32).to_le_bytes().to_vec())
        .build();
    let mut dataset = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[10, 10]),
        options,
        &config,
    )
    .unwrap();

    // one element written; the rest of its chunk and every other chunk is fill
    let one = Selection::block(&[1, 1], &[1, 1]).unwrap();
    dataset
        .write(&one, &Dataspace::simple(&[1]), &Selection::All, &i32_bytes([5]))
        .unwrap();

    let all = read_all(&mut dataset);
    assert_eq!(all[11], 5);
    assert_eq!(all.iter().filter(|&&v| v == -1).count(), 99);
}

#[test]
fn test_fill_never_leaves_buffer_untouched() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4)
        .fill_time(FillTime::Never)
        .build();
    let mut dataset = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[8, 8]),
        options,
        &config,
    )
    .unwrap();

    let block = Selection::block(&[0, 0], &[4, 4]).unwrap();
    dataset
        .write(&block, &Dataspace::simple(&[16]), &Selection::All, &i32_bytes(1..=16))
        .unwrap();

    let space = Dataspace::simple(&[8, 8]);
    let mut out = i32_bytes(std::iter::repeat(-7).take(64));
    dataset.read(&Selection::All, &space, &Selection::All, &mut out).unwrap();
    let out = to_i32(&out);

    assert_eq!(&out[0..4], &[1, 2, 3, 4]);
    assert_eq!(&out[24..28], &[13, 14, 15, 16]);
    assert_eq!(&out[4..8], &[-7; 4]);
    assert_eq!(&out[32..], &[-7; 32]);
}

#[test]
fn test_fill_value_size_must_match_element() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4, 4], 4).fill_value(vec![1, 2]).build();

    let err = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[8, 8]),
        options,
        &config,
    )
    .unwrap_err();
    assert!(matches!(err, ChunkError::Config(_)));
}

// =============================================================================
// Filters
// =============================================================================

fn create_filtered(file: Arc<StorageFile>, config: &Config) -> Dataset {
    let options = DatasetOptions::builder(&[8, 8], 4)
        .filter(FilterDescriptor::shuffle())
        .filter(FilterDescriptor::deflate(6))
        .filter(FilterDescriptor::checksum())
        .build();
    Dataset::create(file, Dataspace::simple(&[32, 32]), options, config).unwrap()
}

#[test]
fn test_filtered_round_trip_across_reopen() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("data.chk");
    let values: Vec<i32> = (0..1024).map(|i| i % 10).collect();

    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        let mut dataset = create_filtered(file, &config);
        write_all(&mut dataset, &values);
        // compressible data takes less room than the raw 4 KiB
        assert!(dataset.allocated_bytes().unwrap() < 4096);
        dataset.close().unwrap();
    }

    let file = Arc::new(StorageFile::open(&path, &config).unwrap());
    let root = file.root().unwrap();
    let mut dataset = Dataset::open(file, root, &config).unwrap();
    assert_eq!(dataset.filters().len(), 3);
    assert_eq!(read_all(&mut dataset), values);
}

#[test]
fn test_filtered_partial_writes_merge() {
    let dir = setup_temp_dir();
    let config = Config::builder().cache_bytes(0).build();
    let mut dataset = create_filtered(create_file(&dir, &config), &config);

    // two halves of one chunk, written separately with no cache to merge them
    let mem = Dataspace::simple(&[32]);
    let top = Selection::block(&[0, 0], &[4, 8]).unwrap();
    let bottom = Selection::block(&[4, 0], &[4, 8]).unwrap();
    dataset.write(&top, &mem, &Selection::All, &i32_bytes(0..32)).unwrap();
    dataset.write(&bottom, &mem, &Selection::All, &i32_bytes(32..64)).unwrap();

    let mut out = vec![0u8; 64 * 4];
    let chunk = Selection::block(&[0, 0], &[8, 8]).unwrap();
    dataset
        .read(&chunk, &Dataspace::simple(&[64]), &Selection::All, &mut out)
        .unwrap();
    assert_eq!(to_i32(&out), (0..64).collect::<Vec<_>>());
}

#[test]
fn test_partial_edge_chunks_stored_unfiltered() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("data.chk");
    let values = vec![5i32; 100];

    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        let options = DatasetOptions::builder(&[4, 4], 4)
            .filter(FilterDescriptor::deflate(6))
            .filter_partial_edges(false)
            .build();
        let mut dataset = Dataset::create(file, Dataspace::simple(&[10, 10]), options, &config).unwrap();
        write_all(&mut dataset, &values);
        dataset.close().unwrap();
    }

    let file = Arc::new(StorageFile::open(&path, &config).unwrap());
    let root = file.root().unwrap();
    let mut dataset = Dataset::open(file, root, &config).unwrap();
    assert!(!dataset.filter_partial_edges());

    let interior = dataset.chunk_info(&ChunkCoord::new(&[4, 4])).unwrap();
    assert_eq!(interior.filter_mask, 0);
    assert!(interior.nbytes < 64);
    for edge in [[0u64, 8], [8, 0], [8, 8]] {
        let record = dataset.chunk_info(&ChunkCoord::new(&edge)).unwrap();
        assert_eq!(record.filter_mask, 0b1, "{edge:?}");
        assert_eq!(record.nbytes, 64, "{edge:?}");
    }
    assert_eq!(read_all(&mut dataset), values);
}

#[test]
fn test_open_with_unknown_filter_fails() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("data.chk");
    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        create_filtered(file, &config).close().unwrap();
    }

    let bare = Config::builder().filters(Arc::new(FilterRegistry::empty())).build();
    let file = Arc::new(StorageFile::open(&path, &bare).unwrap());
    let root = file.root().unwrap();
    let err = Dataset::open(file, root, &bare).unwrap_err();
    assert!(matches!(err, ChunkError::Filter(_)));
}

// =============================================================================
// Cache Behavior
// =============================================================================

#[test]
fn test_results_match_with_cache_disabled() {
    let values: Vec<i32> = (0..100).map(|v| v * v).collect();
    let mut results = Vec::new();

    for cache_bytes in [0usize, 1024 * 1024] {
        let dir = setup_temp_dir();
        let config = Config::builder().cache_bytes(cache_bytes).build();
        let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

        // row by row so every chunk sees several partial writes
        let mem = Dataspace::simple(&[10]);
        for row in 0..10u64 {
            let sel = Selection::block(&[row, 0], &[1, 10]).unwrap();
            let start = row as usize * 10;
            dataset
                .write(&sel, &mem, &Selection::All, &i32_bytes(values[start..start + 10].iter().copied()))
                .unwrap();
        }
        results.push(read_all(&mut dataset));
    }

    assert_eq!(results[0], values);
    assert_eq!(results[1], values);
}

#[test]
fn test_cache_stays_within_budget() {
    let dir = setup_temp_dir();
    // room for two 4x4 i32 chunks
    let config = Config::builder().cache_bytes(128).build();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let values: Vec<i32> = (0..100).collect();
    write_all(&mut dataset, &values);
    assert!(dataset.cache_bytes_used() <= 128);
    assert!(dataset.cache_stats().evictions > 0);

    assert_eq!(read_all(&mut dataset), values);
    assert!(dataset.cache_bytes_used() <= 128);
}

#[test]
fn test_evicted_dirty_chunk_is_written_back() {
    let dir = setup_temp_dir();
    // exactly one 4x4 i32 chunk fits
    let config = Config::builder().cache_bytes(64).build();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);
    let mem = Dataspace::simple(&[16]);

    let a = Selection::block(&[0, 0], &[4, 4]).unwrap();
    let b = Selection::block(&[4, 4], &[4, 4]).unwrap();
    dataset.write(&a, &mem, &Selection::All, &i32_bytes(0..16)).unwrap();
    dataset.write(&b, &mem, &Selection::All, &i32_bytes(16..32)).unwrap();

    let stats = dataset.cache_stats();
    assert!(stats.evictions >= 1);
    assert!(stats.flushes >= 1);

    let coords: Vec<ChunkCoord> = dataset
        .chunk_records()
        .unwrap()
        .map(|r| r.unwrap().coord)
        .collect();
    assert_eq!(coords, vec![ChunkCoord::new(&[0, 0]), ChunkCoord::new(&[4, 4])]);

    let mut out = vec![0u8; 64];
    dataset.read(&a, &mem, &Selection::All, &mut out).unwrap();
    assert_eq!(to_i32(&out), (0..16).collect::<Vec<_>>());
}

#[test]
fn test_reread_hits_cache() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);
    write_all(&mut dataset, &(0..100).collect::<Vec<_>>());
    dataset.flush().unwrap();

    let before = dataset.cache_stats();
    read_all(&mut dataset);
    let after = dataset.cache_stats();
    assert_eq!(after.hits - before.hits, 9);
    assert_eq!(after.misses, before.misses);
}

#[test]
fn test_chunk_info_sees_cached_write() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let one = Selection::block(&[9, 9], &[1, 1]).unwrap();
    dataset
        .write(&one, &Dataspace::simple(&[1]), &Selection::All, &i32_bytes([1]))
        .unwrap();

    let record = dataset.chunk_info(&ChunkCoord::new(&[8, 8])).unwrap();
    assert!(record.is_allocated());
    assert_eq!(record.nbytes, 64);
}

// =============================================================================
// Conversion
// =============================================================================

#[test]
fn test_write_widening_read_narrowing() {
    let dir = setup_temp_dir();
    let config = Config::default();
    // stored as i64
    let options = DatasetOptions::builder(&[4], 8).build();
    let mut dataset = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[6]),
        options,
        &config,
    )
    .unwrap();
    let mem = Dataspace::simple(&[6]);

    let widen = IntegerConversion::new(4, 8, true).unwrap();
    dataset
        .write_converted(&Selection::All, &mem, &Selection::All, &i32_bytes([-3, -2, -1, 0, 1, i32::MAX]), &widen)
        .unwrap();

    let mut raw = vec![0u8; 48];
    dataset.read(&Selection::All, &mem, &Selection::All, &mut raw).unwrap();
    let stored: Vec<i64> = raw
        .chunks_exact(8)
        .map(|b| i64::from_le_bytes(b.try_into().unwrap()))
        .collect();
    assert_eq!(stored, vec![-3, -2, -1, 0, 1, i32::MAX as i64]);

    let narrow = IntegerConversion::new(8, 4, true).unwrap();
    let mut out = vec![0u8; 24];
    dataset
        .read_converted(&Selection::All, &mem, &Selection::All, &mut out, &narrow)
        .unwrap();
    assert_eq!(to_i32(&out), vec![-3, -2, -1, 0, 1, i32::MAX]);
}

#[test]
fn test_fill_is_converted_on_read() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let options = DatasetOptions::builder(&[4], 8)
        .fill_value((-9i64).to_le_bytes().to_vec())
        .build();
    let mut dataset = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[4]),
        options,
        &config,
    )
    .unwrap();

    let narrow = IntegerConversion::new(8, 4, true).unwrap();
    let mut out = vec![0u8; 16];
    dataset
        .read_converted(&Selection::All, &Dataspace::simple(&[4]), &Selection::All, &mut out, &narrow)
        .unwrap();
    assert_eq!(to_i32(&out), vec![-9; 4]);
}

#[test]
fn test_conversion_size_mismatch_rejected() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let wrong = IntegerConversion::new(2, 8, false).unwrap();
    let space = Dataspace::simple(&[10, 10]);
    let err = dataset
        .write_converted(&Selection::All, &space, &Selection::All, &[0u8; 200], &wrong)
        .unwrap_err();
    assert!(matches!(err, ChunkError::Conversion(_)));
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_mismatched_selection_sizes_touch_nothing() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let file_sel = Selection::block(&[0, 0], &[5, 5]).unwrap();
    let mem = Dataspace::simple(&[24]);
    let err = dataset
        .write(&file_sel, &mem, &Selection::All, &[0u8; 96])
        .unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
    assert_eq!(dataset.chunk_records().unwrap().count(), 0);
}

#[test]
fn test_selection_outside_extent_rejected() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let file_sel = Selection::block(&[8, 8], &[4, 4]).unwrap();
    let mut out = vec![0u8; 64];
    let err = dataset
        .read(&file_sel, &Dataspace::simple(&[16]), &Selection::All, &mut out)
        .unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
}

#[test]
fn test_short_buffer_rejected() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let space = Dataspace::simple(&[10, 10]);
    let mut out = vec![0u8; 399];
    let err = dataset
        .read(&Selection::All, &space, &Selection::All, &mut out)
        .unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
}

#[test]
fn test_read_only_file_rejects_writes() {
    let dir = setup_temp_dir();
    let config = Config::default();
    let path = dir.path().join("data.chk");
    {
        let file = Arc::new(StorageFile::create(&path, &config).unwrap());
        let mut dataset = create_grid(file, IndexKind::btree(), &config);
        write_all(&mut dataset, &(0..100).collect::<Vec<_>>());
        dataset.close().unwrap();
    }

    let file = Arc::new(StorageFile::open_read_only(&path).unwrap());
    let root = file.root().unwrap();
    let mut dataset = Dataset::open(file, root, &config).unwrap();
    assert_eq!(read_all(&mut dataset)[57], 57);

    let space = Dataspace::simple(&[10, 10]);
    let err = dataset
        .write(&Selection::All, &space, &Selection::All, &[0u8; 400])
        .unwrap_err();
    assert!(matches!(err, ChunkError::Resource(_)));
    assert!(matches!(dataset.set_extent(&[5, 5]), Err(ChunkError::Resource(_))));
}

// =============================================================================
// Parallel Mode
// =============================================================================

#[test]
fn test_parallel_unfiltered_writes_bypass_cache() {
    let dir = setup_temp_dir();
    let config = Config::builder()
        .transport(Arc::new(CountingTransport::default()))
        .build();
    let mut dataset = create_grid(create_file(&dir, &config), IndexKind::btree(), &config);

    let values: Vec<i32> = (0..100).map(|v| 1000 - v).collect();
    write_all(&mut dataset, &values);
    assert_eq!(read_all(&mut dataset), values);

    assert_eq!(dataset.cache_bytes_used(), 0);
    let stats = dataset.cache_stats();
    assert_eq!(stats.hits + stats.misses, 0);
}

#[test]
fn test_parallel_partial_write_fills_rest_of_chunk() {
    let dir = setup_temp_dir();
    let config = Config::builder()
        .transport(Arc::new(CountingTransport::default()))
        .build();
    let file = create_file(&dir, &config);
    let options = DatasetOptions::builder(&[4, 4], 4)
        .fill_value(7i32.to_le_bytes().to_vec())
        .build();
    let mut dataset =
        Dataset::create(file.clone(), Dataspace::simple(&[8, 8]), options, &config).unwrap();

    // leave a dirty hole where the first chunk will land
    let hole = file.allocate(64).unwrap();
    file.allocate(64).unwrap();
    file.write_at(hole, &[0x5a; 64]).unwrap();
    file.free(hole, 64).unwrap();

    let two = Selection::block(&[0, 0], &[1, 2]).unwrap();
    dataset
        .write(&two, &Dataspace::simple(&[2]), &Selection::All, &i32_bytes([1, 2]))
        .unwrap();
    assert_eq!(dataset.cache_bytes_used(), 0);

    let block = Selection::block(&[0, 0], &[4, 4]).unwrap();
    let mut out = vec![0u8; 64];
    dataset
        .read(&block, &Dataspace::simple(&[16]), &Selection::All, &mut out)
        .unwrap();
    let mut expected = vec![7; 16];
    expected[0] = 1;
    expected[1] = 2;
    assert_eq!(to_i32(&out), expected);
}

#[test]
fn test_parallel_early_allocation_waits_for_fill() {
    let dir = setup_temp_dir();
    let transport = Arc::new(CountingTransport {
        rank: 1,
        barriers: AtomicUsize::new(0),
    });
    let config = Config::builder().transport(transport.clone()).build();
    let options = DatasetOptions::builder(&[4, 4], 4)
        .fill_value(3i32.to_le_bytes().to_vec())
        .alloc_time(AllocTime::Early)
        .build();

    let mut dataset = Dataset::create(
        create_file(&dir, &config),
        Dataspace::simple(&[8, 8]),
        options,
        &config,
    )
    .unwrap();

    assert_eq!(transport.barriers.load(Ordering::SeqCst), 1);
    assert_eq!(dataset.chunk_records().unwrap().count(), 4);
}
