#![allow(missing_docs)]

//! Query state machine coverage: ordering of init/process/finalize, setter
//! validation, and the transitions around completion and failure.

use tessera::{
    ArrayError, ArraySchema, Attribute, Datatype, EngineConfig, QueryStatus, QueryType, Result,
    ScalarValue, StorageManager, COORDS_NAME,
};

use tempfile::tempdir;

fn schema() -> ArraySchema {
    ArraySchema::build(Datatype::Int64)
        .dimension("d", ScalarValue::Int(0), ScalarValue::Int(9))
        .attribute(Attribute::fixed("a", Datatype::Int32))
        .attribute(Attribute::var("s", Datatype::Char))
        .finish()
        .unwrap()
}

fn manager(dir: &std::path::Path) -> Result<StorageManager> {
    StorageManager::create_array(dir.join("arr"), schema(), EngineConfig::default())
}

fn coords_bytes(points: &[i64]) -> Vec<u8> {
    points.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn subarray_bytes(bounds: &[i64]) -> Vec<u8> {
    bounds.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// One committed fragment with cells 0, 3, 7.
fn seed(sm: &StorageManager) -> Result<()> {
    let mut q = sm.query_write()?;
    q.set_buffer(COORDS_NAME, coords_bytes(&[0, 3, 7]))?;
    q.set_buffer("a", i32_bytes(&[10, 20, 30]))?;
    q.set_buffer_var("s", vec![0, 2, 4], b"xxyyzz".to_vec())?;
    q.init()?;
    q.process()?;
    q.finalize()?;
    Ok(())
}

#[test]
fn process_before_init_is_a_state_error() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_read()?;
    assert_eq!(q.status(), QueryStatus::Uninitialized);
    assert_eq!(q.query_type(), QueryType::Read);

    let err = q.process().unwrap_err();
    assert!(matches!(err, ArrayError::State(_)), "got: {err}");
    assert_eq!(
        q.status(),
        QueryStatus::Uninitialized,
        "rejected process leaves the status alone"
    );
    Ok(())
}

#[test]
fn finalize_before_init_is_a_noop() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_write()?;
    q.finalize()?;
    assert_eq!(q.status(), QueryStatus::Uninitialized);
    assert!(sm.list_fragments()?.is_empty(), "nothing was committed");
    Ok(())
}

#[test]
fn init_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    seed(&sm)?;
    let mut q = sm.query_read()?;
    q.set_buffer("a", vec![0; 12])?;
    q.init()?;
    assert_eq!(q.status(), QueryStatus::InProgress);
    q.init()?;
    assert_eq!(q.status(), QueryStatus::InProgress);
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    Ok(())
}

#[test]
fn set_subarray_resets_to_uninitialized() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    seed(&sm)?;
    let mut q = sm.query_read()?;
    q.set_buffer("a", vec![0; 12])?;
    q.init()?;
    assert_eq!(q.status(), QueryStatus::InProgress);

    q.set_subarray(&subarray_bytes(&[2, 9]))?;
    assert_eq!(q.status(), QueryStatus::Uninitialized);

    let err = q.process().unwrap_err();
    assert!(matches!(err, ArrayError::State(_)), "got: {err}");

    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    let produced = q.buffer("a").unwrap();
    assert_eq!(produced.len(), 8, "only cells 3 and 7 lie in [2, 9]");
    Ok(())
}

#[test]
fn invalid_subarray_leaves_the_query_untouched() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    seed(&sm)?;
    let mut q = sm.query_read()?;
    q.set_buffer("a", vec![0; 12])?;
    q.init()?;

    // Wrong buffer length.
    let err = q.set_subarray(&subarray_bytes(&[2])).unwrap_err();
    assert!(matches!(err, ArrayError::Subarray(_)), "got: {err}");
    assert_eq!(q.status(), QueryStatus::InProgress);

    // Inverted bounds.
    let err = q.set_subarray(&subarray_bytes(&[5, 2])).unwrap_err();
    assert!(matches!(err, ArrayError::Subarray(_)), "got: {err}");

    // Outside the domain.
    let err = q.set_subarray(&subarray_bytes(&[0, 10])).unwrap_err();
    assert!(matches!(err, ArrayError::Subarray(_)), "got: {err}");
    assert_eq!(q.status(), QueryStatus::InProgress);

    // The query is still processable with its original (whole) region.
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    Ok(())
}

#[test]
fn buffer_setters_validate_names_and_shapes() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_read()?;

    let err = q.set_buffer("nope", vec![0; 8]).unwrap_err();
    assert!(matches!(err, ArrayError::Buffer(_)), "got: {err}");

    let err = q.set_buffer("s", vec![0; 8]).unwrap_err();
    assert!(matches!(err, ArrayError::Buffer(_)), "var attribute: {err}");

    let err = q.set_buffer_var("a", vec![0; 2], vec![0; 8]).unwrap_err();
    assert!(matches!(err, ArrayError::Buffer(_)), "fixed attribute: {err}");

    // Coordinates always take a fixed buffer.
    q.set_buffer(COORDS_NAME, vec![0; 16])?;
    Ok(())
}

#[test]
fn fragment_uri_is_write_only() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_read()?;
    let err = q.set_fragment_uri("__0000000000001_000001_00000001").unwrap_err();
    assert!(matches!(err, ArrayError::State(_)), "got: {err}");

    let mut w = sm.query_write()?;
    w.set_fragment_uri("__0000000000001_000001_00000001")?;
    Ok(())
}

#[test]
fn non_conforming_fragment_name_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_write()?;
    for name in ["my_fragment", "__", "__abc_def", "__0000000000001"] {
        let err = q.set_fragment_uri(name).unwrap_err();
        assert!(matches!(err, ArrayError::Schema(_)), "'{name}' got: {err}");
    }
    Ok(())
}

#[test]
fn caller_named_fragment_is_discoverable() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_write()?;
    q.set_fragment_uri("__0000000000050_000000_cafe0001")?;
    q.set_buffer(COORDS_NAME, coords_bytes(&[1, 2]))?;
    q.set_buffer("a", i32_bytes(&[1, 2]))?;
    q.set_buffer_var("s", vec![0, 1], b"ab".to_vec())?;
    q.init()?;
    q.process()?;
    q.finalize()?;

    let fragments = sm.list_fragments()?;
    assert_eq!(fragments.len(), 1, "committed fragment is listed");
    assert_eq!(fragments[0].name, "__0000000000050_000000_cafe0001");
    assert_eq!(fragments[0].timestamp, 50);

    let mut r = sm.query_read()?;
    r.set_buffer("a", vec![0; 8])?;
    r.init()?;
    r.process()?;
    assert_eq!(r.status(), QueryStatus::Completed);
    assert_eq!(r.buffer("a").unwrap().len(), 8, "both cells read back");
    Ok(())
}

#[test]
fn completed_write_rejects_reprocess() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_write()?;
    q.set_buffer(COORDS_NAME, coords_bytes(&[1, 2]))?;
    q.set_buffer("a", i32_bytes(&[1, 2]))?;
    q.set_buffer_var("s", vec![0, 1], b"ab".to_vec())?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);

    let err = q.process().unwrap_err();
    assert!(matches!(err, ArrayError::State(_)), "got: {err}");

    q.finalize()?;
    assert_eq!(sm.list_fragments()?.len(), 1);
    Ok(())
}

#[test]
fn write_missing_attribute_buffer_fails_the_query() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    let mut q = sm.query_write()?;
    q.set_buffer(COORDS_NAME, coords_bytes(&[1]))?;
    q.set_buffer("a", i32_bytes(&[1]))?;
    // No buffer for 's'.
    q.init()?;
    let err = q.process().unwrap_err();
    assert!(matches!(err, ArrayError::Buffer(_)), "got: {err}");
    assert_eq!(q.status(), QueryStatus::Failed);

    let err = q.finalize().unwrap_err();
    assert!(matches!(err, ArrayError::State(_)), "got: {err}");
    assert!(sm.list_fragments()?.is_empty(), "nothing was committed");
    Ok(())
}

#[test]
fn completed_read_is_reusable_after_a_new_subarray() -> Result<()> {
    let dir = tempdir()?;
    let sm = manager(dir.path())?;
    seed(&sm)?;
    let mut q = sm.query_read()?;
    q.set_buffer("a", vec![0; 12])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert_eq!(q.buffer("a").unwrap().len(), 12);

    q.set_subarray(&subarray_bytes(&[7, 9]))?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert_eq!(q.buffer("a").unwrap().len(), 4, "only cell 7 remains");
    Ok(())
}
