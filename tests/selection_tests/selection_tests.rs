//! Tests for dataspaces and selections
//!
//! These tests verify:
//! - Extent and max-extent checks
//! - Hyperslab construction (stride, block, merging)
//! - Validation, bounding boxes and clipping
//! - Row-major run iteration with merging

use chunkstore::{ChunkError, Dataspace, Selection};

// =============================================================================
// Dataspace Tests
// =============================================================================

#[test]
fn test_simple_dataspace_is_fixed() {
    let space = Dataspace::simple(&[4, 6]);
    assert_eq!(space.rank(), 2);
    assert_eq!(space.npoints(), 24);
    assert_eq!(space.max_dims(), &[Some(4), Some(6)]);
}

#[test]
fn test_dataspace_rejects_dims_above_max() {
    let err = Dataspace::new(&[10, 2], &[Some(8), None]).unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
}

#[test]
fn test_dataspace_rejects_rank_mismatch() {
    assert!(Dataspace::new(&[10, 2], &[None]).is_err());
}

#[test]
fn test_unlimited_dimension_accepts_any_extent() {
    let space = Dataspace::new(&[1_000_000], &[None]).unwrap();
    assert_eq!(space.npoints(), 1_000_000);
}

// =============================================================================
// Hyperslab Construction
// =============================================================================

#[test]
fn test_block_counts_elements() {
    let space = Dataspace::simple(&[10, 10]);
    let sel = Selection::block(&[2, 3], &[4, 5]).unwrap();
    assert_eq!(sel.npoints(&space), 20);
    assert_eq!(sel.single_block(&space), Some((vec![2, 3], vec![4, 5])));
}

#[test]
fn test_strided_hyperslab() {
    let space = Dataspace::simple(&[10]);
    let sel = Selection::hyperslab(&[1], Some(&[3]), &[3], Some(&[2])).unwrap();
    // elements 1,2  4,5  7,8
    assert_eq!(sel.npoints(&space), 6);
    let runs: Vec<_> = sel.runs(&space).collect();
    assert_eq!(runs, vec![(1, 2), (4, 2), (7, 2)]);
    assert_eq!(sel.single_block(&space), None);
}

#[test]
fn test_touching_blocks_merge() {
    let space = Dataspace::simple(&[10]);
    let sel = Selection::hyperslab(&[0], Some(&[2]), &[4], Some(&[2])).unwrap();
    assert_eq!(sel.single_block(&space), Some((vec![0], vec![8])));
}

#[test]
fn test_stride_smaller_than_block_rejected() {
    let err = Selection::hyperslab(&[0], Some(&[1]), &[2], Some(&[2])).unwrap_err();
    assert!(matches!(err, ChunkError::Selection(_)));
}

#[test]
fn test_zero_count_is_empty() {
    let space = Dataspace::simple(&[5, 5]);
    let sel = Selection::block(&[0, 0], &[0, 3]).unwrap();
    assert_eq!(sel, Selection::None);
    assert_eq!(sel.npoints(&space), 0);
    assert!(sel.bounds(&space).is_none());
}

// =============================================================================
// Validation
// =============================================================================

#[test]
fn test_hyperslab_past_extent_rejected() {
    let space = Dataspace::simple(&[8, 8]);
    let sel = Selection::block(&[6, 0], &[4, 1]).unwrap();
    assert!(matches!(sel.validate(&space), Err(ChunkError::Selection(_))));
}

#[test]
fn test_point_past_extent_rejected() {
    let space = Dataspace::simple(&[8, 8]);
    let sel = Selection::points(vec![vec![1, 1], vec![8, 0]]).unwrap();
    assert!(sel.validate(&space).is_err());
}

#[test]
fn test_points_with_mixed_rank_rejected() {
    assert!(Selection::points(vec![vec![1, 1], vec![2]]).is_err());
}

#[test]
fn test_selection_rank_mismatch_rejected() {
    let space = Dataspace::simple(&[8, 8]);
    let sel = Selection::block(&[0], &[4]).unwrap();
    assert!(sel.validate(&space).is_err());
}

// =============================================================================
// Bounds and Clipping
// =============================================================================

#[test]
fn test_point_bounds() {
    let space = Dataspace::simple(&[10, 10]);
    let sel = Selection::points(vec![vec![3, 7], vec![1, 2], vec![5, 4]]).unwrap();
    assert_eq!(sel.bounds(&space), Some((vec![1, 2], vec![6, 8])));
}

#[test]
fn test_clip_rebases_onto_box() {
    let space = Dataspace::simple(&[8, 8]);
    let sel = Selection::block(&[2, 2], &[4, 4]).unwrap();
    let clipped = sel.clip(&space, &[4, 4], &[8, 8]);

    let chunk = Dataspace::simple(&[4, 4]);
    assert_eq!(clipped.single_block(&chunk), Some((vec![0, 0], vec![2, 2])));
}

#[test]
fn test_clip_outside_is_none() {
    let space = Dataspace::simple(&[8, 8]);
    let sel = Selection::block(&[0, 0], &[2, 2]).unwrap();
    assert_eq!(sel.clip(&space, &[4, 4], &[8, 8]), Selection::None);
}

#[test]
fn test_clip_points_keeps_order() {
    let space = Dataspace::simple(&[8]);
    let sel = Selection::points(vec![vec![6], vec![1], vec![5]]).unwrap();
    let clipped = sel.clip(&space, &[4], &[8]);
    assert_eq!(clipped, Selection::Points(vec![vec![2], vec![1]]));
}

// =============================================================================
// Run Iteration
// =============================================================================

#[test]
fn test_all_is_one_run() {
    let space = Dataspace::simple(&[3, 4]);
    let runs: Vec<_> = Selection::All.runs(&space).collect();
    assert_eq!(runs, vec![(0, 12)]);
}

#[test]
fn test_full_rows_merge_into_one_run() {
    let space = Dataspace::simple(&[4, 5]);
    let sel = Selection::block(&[1, 0], &[2, 5]).unwrap();
    let runs: Vec<_> = sel.runs(&space).collect();
    assert_eq!(runs, vec![(5, 10)]);
}

#[test]
fn test_partial_rows_are_separate_runs() {
    let space = Dataspace::simple(&[4, 5]);
    let sel = Selection::block(&[1, 1], &[2, 3]).unwrap();
    let runs: Vec<_> = sel.runs(&space).collect();
    assert_eq!(runs, vec![(6, 3), (11, 3)]);
}

#[test]
fn test_adjacent_points_merge() {
    let space = Dataspace::simple(&[10]);
    let sel = Selection::points(vec![vec![3], vec![4], vec![9], vec![0]]).unwrap();
    let runs: Vec<_> = sel.runs(&space).collect();
    assert_eq!(runs, vec![(3, 2), (9, 1), (0, 1)]);
}

#[test]
fn test_three_dimensional_runs() {
    let space = Dataspace::simple(&[2, 3, 4]);
    let sel = Selection::block(&[0, 1, 1], &[2, 2, 2]).unwrap();
    let runs: Vec<_> = sel.runs(&space).collect();
    assert_eq!(runs, vec![(5, 2), (9, 2), (17, 2), (21, 2)]);
    assert_eq!(runs.iter().map(|r| r.1).sum::<u64>(), sel.npoints(&space));
}
