#![allow(missing_docs)]

//! Reads over several fragments: the most recent write of a coordinate
//! shadows older ones, uncommitted fragment directories stay invisible, and
//! fragment accessors report the committed list oldest first.

use tessera::{
    ArrayError, ArraySchema, Attribute, Datatype, EngineConfig, Layout, QueryStatus, Result,
    ScalarValue, StorageManager, COORDS_NAME,
};

use tempfile::tempdir;

fn schema() -> ArraySchema {
    ArraySchema::build(Datatype::UInt64)
        .dimension("d1", ScalarValue::UInt(1), ScalarValue::UInt(4))
        .dimension("d2", ScalarValue::UInt(1), ScalarValue::UInt(4))
        .attribute(Attribute::fixed("a", Datatype::Int32))
        .finish()
        .unwrap()
}

fn coords_bytes(cells: &[(u64, u64)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cells.len() * 16);
    for &(r, c) in cells {
        out.extend_from_slice(&r.to_le_bytes());
        out.extend_from_slice(&c.to_le_bytes());
    }
    out
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_i32s(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

fn decode_coords(bytes: &[u8]) -> Vec<(u64, u64)> {
    bytes
        .chunks_exact(16)
        .map(|c| {
            let r = u64::from_le_bytes(c[..8].try_into().unwrap());
            let d = u64::from_le_bytes(c[8..].try_into().unwrap());
            (r, d)
        })
        .collect()
}

fn write(sm: &StorageManager, cells: &[(u64, u64)], values: &[i32]) -> Result<()> {
    let mut q = sm.query_write()?;
    q.set_buffer(COORDS_NAME, coords_bytes(cells))?;
    q.set_buffer("a", i32_bytes(values))?;
    q.init()?;
    q.process()?;
    q.finalize()?;
    Ok(())
}

#[test]
fn newest_fragment_wins_at_equal_coordinates() -> Result<()> {
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write(&sm, &[(1, 1), (2, 2), (3, 3)], &[10, 20, 30])?;
    write(&sm, &[(2, 2), (4, 4)], &[200, 40])?;

    let mut q = sm.query_read()?;
    q.set_layout(Layout::RowMajor)?;
    q.set_buffer(COORDS_NAME, vec![0; 4 * 16])?;
    q.set_buffer("a", vec![0; 4 * 4])?;
    q.init()?;
    assert_eq!(q.fragment_num(), 2);
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);

    assert_eq!(
        decode_coords(q.buffer(COORDS_NAME).unwrap()),
        vec![(1, 1), (2, 2), (3, 3), (4, 4)]
    );
    assert_eq!(decode_i32s(q.buffer("a").unwrap()), vec![10, 200, 30, 40]);
    Ok(())
}

#[test]
fn fragment_accessors_report_oldest_first() -> Result<()> {
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write(&sm, &[(1, 1)], &[1])?;
    write(&sm, &[(2, 2)], &[2])?;
    write(&sm, &[(3, 3)], &[3])?;

    let q = sm.query_read()?;
    assert_eq!(q.fragment_num(), 3);
    let uris = q.fragment_uris();
    assert_eq!(uris.len(), 3);
    assert!(uris.windows(2).all(|w| w[0] < w[1]), "oldest first: {uris:?}");
    assert_eq!(q.last_fragment_uri(), Some(uris[2].as_str()));

    let fragments = sm.list_fragments()?;
    assert_eq!(fragments.len(), 3);
    assert_eq!(fragments[0].cell_num, 1);
    Ok(())
}

#[test]
fn uncommitted_fragment_directories_are_invisible() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("arr");
    let sm = StorageManager::create_array(&path, schema(), EngineConfig::default())?;
    write(&sm, &[(1, 1)], &[1])?;

    // A fragment directory without a metadata footer: a write session that
    // died before finalize.
    std::fs::create_dir(path.join("__0000000000999_00000f_deadbeef"))?;
    std::fs::write(
        path.join("__0000000000999_00000f_deadbeef").join("a.col"),
        b"garbage",
    )?;
    // A stray directory that is not a fragment at all.
    std::fs::create_dir(path.join("scratch"))?;

    assert_eq!(sm.list_fragments()?.len(), 1, "only the committed fragment");
    let q = sm.query_read()?;
    assert_eq!(q.fragment_num(), 1);
    Ok(())
}

#[test]
fn empty_region_reports_no_results() -> Result<()> {
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write(&sm, &[(1, 1), (2, 2)], &[1, 2])?;

    let mut q = sm.query_read()?;
    let raw: Vec<u8> = [4u64, 4, 1, 1]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    q.set_subarray(&raw)?;
    q.set_buffer("a", vec![0; 16])?;
    q.init()?;
    assert!(!q.has_results());
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert!(q.buffer("a").unwrap().is_empty());
    Ok(())
}

#[test]
fn write_outside_the_region_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;

    let mut q = sm.query_write()?;
    let raw: Vec<u8> = [1u64, 2, 1, 2]
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect();
    q.set_subarray(&raw)?;
    q.set_buffer(COORDS_NAME, coords_bytes(&[(1, 1), (3, 3)]))?;
    q.set_buffer("a", i32_bytes(&[1, 2]))?;
    q.init()?;
    let err = q.process().unwrap_err();
    assert!(matches!(err, ArrayError::Subarray(_)), "got: {err}");
    assert_eq!(q.status(), QueryStatus::Failed);
    assert!(sm.list_fragments()?.is_empty());
    Ok(())
}

#[test]
fn overlapping_writes_across_three_fragments() -> Result<()> {
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write(&sm, &[(1, 1), (1, 2)], &[1, 2])?;
    write(&sm, &[(1, 2), (1, 3)], &[20, 30])?;
    write(&sm, &[(1, 3), (1, 4)], &[300, 400])?;

    let mut q = sm.query_read()?;
    q.set_layout(Layout::RowMajor)?;
    q.set_buffer("a", vec![0; 4 * 4])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert_eq!(decode_i32s(q.buffer("a").unwrap()), vec![1, 20, 300, 400]);
    Ok(())
}
