#![allow(missing_docs)]

//! End-to-end sparse write and read over one array: a 4x4 uint64 domain, a
//! fixed int32 attribute and a variable char attribute, written in global
//! order and read back under several layouts and buffer sizes.

use tessera::{
    ArraySchema, Attribute, Compressor, Datatype, EngineConfig, Layout, QueryStatus, Result,
    ScalarValue, StorageManager, COORDS_NAME,
};

use tempfile::tempdir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn schema() -> ArraySchema {
    ArraySchema::build(Datatype::UInt64)
        .dimension("d1", ScalarValue::UInt(1), ScalarValue::UInt(4))
        .dimension("d2", ScalarValue::UInt(1), ScalarValue::UInt(4))
        .attribute(Attribute::fixed("a1", Datatype::Int32))
        .attribute(Attribute::var("a2", Datatype::Char).with_compressor(Compressor::Snappy))
        .finish()
        .unwrap()
}

/// Cells in the writer's global order.
const CELLS: [(u64, u64); 8] = [
    (1, 1),
    (1, 2),
    (1, 4),
    (2, 3),
    (3, 1),
    (4, 2),
    (3, 3),
    (3, 4),
];

const A2_OFFSETS: [u64; 8] = [0, 1, 3, 6, 10, 11, 13, 16];
const A2_VALUES: &[u8] = b"abbcccddddeffggghhhh";

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

fn subarray_bytes(bounds: &[u64]) -> Vec<u8> {
    bounds.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn write_dataset(sm: &StorageManager) -> Result<()> {
    let mut q = sm.query_write()?;
    q.set_layout(Layout::GlobalOrder)?;
    q.set_buffer(COORDS_NAME, coords_bytes(&CELLS))?;
    q.set_buffer("a1", i32_bytes(&[0, 1, 2, 3, 4, 5, 6, 7]))?;
    q.set_buffer_var("a2", A2_OFFSETS.to_vec(), A2_VALUES.to_vec())?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed, "write pass completes");
    q.finalize()?;
    Ok(())
}

#[test]
fn global_order_read_reproduces_write_order() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write_dataset(&sm)?;

    let mut q = sm.query_read()?;
    q.set_layout(Layout::GlobalOrder)?;
    q.set_buffer(COORDS_NAME, vec![0; 128])?;
    q.set_buffer("a1", vec![0; 32])?;
    q.set_buffer_var("a2", vec![0; 8], vec![0; 32])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert!(q.has_results());

    assert_eq!(decode_coords(q.buffer(COORDS_NAME).unwrap()), CELLS);
    assert_eq!(
        decode_i32s(q.buffer("a1").unwrap()),
        vec![0, 1, 2, 3, 4, 5, 6, 7]
    );
    let (offsets, values) = q.buffer_var("a2").unwrap();
    assert_eq!(offsets, A2_OFFSETS);
    assert_eq!(values, A2_VALUES);
    Ok(())
}

#[test]
fn undersized_buffers_report_incomplete_then_drain() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write_dataset(&sm)?;

    // Every buffer holds exactly four of the eight cells.
    let mut q = sm.query_read()?;
    q.set_layout(Layout::GlobalOrder)?;
    q.set_buffer(COORDS_NAME, vec![0; 64])?;
    q.set_buffer("a1", vec![0; 16])?;
    q.set_buffer_var("a2", vec![0; 4], vec![0; 10])?;
    q.init()?;

    q.process()?;
    assert_eq!(q.status(), QueryStatus::Incomplete, "first pass fills up");
    assert_eq!(decode_coords(q.buffer(COORDS_NAME).unwrap()), CELLS[..4]);
    assert_eq!(decode_i32s(q.buffer("a1").unwrap()), vec![0, 1, 2, 3]);
    let (offsets, values) = q.buffer_var("a2").unwrap();
    assert_eq!(offsets, [0, 1, 3, 6]);
    assert_eq!(values, b"abbcccdddd");

    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed, "second pass drains");
    assert_eq!(decode_coords(q.buffer(COORDS_NAME).unwrap()), CELLS[4..]);
    assert_eq!(decode_i32s(q.buffer("a1").unwrap()), vec![4, 5, 6, 7]);
    let (offsets, values) = q.buffer_var("a2").unwrap();
    assert_eq!(offsets, [0, 1, 3, 6], "offsets restart per pass");
    assert_eq!(values, b"effggghhhh");
    Ok(())
}

#[test]
fn row_major_read_sorts_cells() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write_dataset(&sm)?;

    let mut q = sm.query_read()?;
    q.set_layout(Layout::RowMajor)?;
    q.set_buffer(COORDS_NAME, vec![0; 128])?;
    q.set_buffer("a1", vec![0; 32])?;
    q.set_buffer_var("a2", vec![0; 8], vec![0; 32])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);

    assert_eq!(
        decode_coords(q.buffer(COORDS_NAME).unwrap()),
        vec![
            (1, 1),
            (1, 2),
            (1, 4),
            (2, 3),
            (3, 1),
            (3, 3),
            (3, 4),
            (4, 2),
        ]
    );
    assert_eq!(
        decode_i32s(q.buffer("a1").unwrap()),
        vec![0, 1, 2, 3, 4, 6, 7, 5]
    );
    let (offsets, values) = q.buffer_var("a2").unwrap();
    assert_eq!(offsets, [0, 1, 3, 6, 10, 11, 14, 18]);
    assert_eq!(values, b"abbcccddddeggghhhhff");
    Ok(())
}

#[test]
fn subarray_restricts_results() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let sm = StorageManager::create_array(dir.path().join("arr"), schema(), EngineConfig::default())?;
    write_dataset(&sm)?;

    let mut q = sm.query_read()?;
    q.set_layout(Layout::RowMajor)?;
    q.set_subarray(&subarray_bytes(&[3, 4, 1, 4]))?;
    q.set_buffer(COORDS_NAME, vec![0; 128])?;
    q.set_buffer("a1", vec![0; 32])?;
    q.set_buffer_var("a2", vec![0; 8], vec![0; 32])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);

    assert_eq!(
        decode_coords(q.buffer(COORDS_NAME).unwrap()),
        vec![(3, 1), (3, 3), (3, 4), (4, 2)]
    );
    assert_eq!(decode_i32s(q.buffer("a1").unwrap()), vec![4, 6, 7, 5]);
    Ok(())
}

#[test]
fn reopened_array_serves_the_same_data() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let path = dir.path().join("arr");
    {
        let sm = StorageManager::create_array(&path, schema(), EngineConfig::default())?;
        write_dataset(&sm)?;
    }

    let sm = StorageManager::open(&path, EngineConfig::default())?;
    let mut q = sm.query_read()?;
    q.set_layout(Layout::GlobalOrder)?;
    q.set_buffer("a1", vec![0; 32])?;
    q.init()?;
    q.process()?;
    assert_eq!(q.status(), QueryStatus::Completed);
    assert_eq!(
        decode_i32s(q.buffer("a1").unwrap()),
        vec![0, 1, 2, 3, 4, 5, 6, 7]
    );
    Ok(())
}
