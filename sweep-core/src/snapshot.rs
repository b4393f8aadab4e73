//! Fixed-layout binary codec for background grid snapshots.
//!
//! The cell array is written row-major (`idx = ring * az_bins + az_bin`) into
//! a self-describing little-endian envelope and gzip-compressed. Any change
//! to [`sweep_types::CellState`] must bump `VERSION`.

use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use libflate::gzip::{Decoder, Encoder};

use sweep_types::CellState;

use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"SWBG";
const VERSION: u16 = 1;
/// Serialised size of one cell record.
pub const CELL_RECORD_BYTES: u16 = 42;

/// Serialise and gzip-compress a cell array.
pub fn encode_cells(rings: u16, az_bins: u16, cells: &[CellState]) -> Result<Vec<u8>> {
    assert_eq!(cells.len(), rings as usize * az_bins as usize);

    let mut enc = Encoder::new(Vec::new())?;
    enc.write_all(MAGIC)?;
    enc.write_u16::<LittleEndian>(VERSION)?;
    enc.write_u16::<LittleEndian>(rings)?;
    enc.write_u16::<LittleEndian>(az_bins)?;
    enc.write_u16::<LittleEndian>(CELL_RECORD_BYTES)?;
    enc.write_u32::<LittleEndian>(cells.len() as u32)?;
    for cell in cells {
        enc.write_f32::<LittleEndian>(cell.avg_range_m)?;
        enc.write_f32::<LittleEndian>(cell.spread_m)?;
        enc.write_u32::<LittleEndian>(cell.times_seen)?;
        enc.write_i64::<LittleEndian>(cell.last_update_ns)?;
        enc.write_i64::<LittleEndian>(cell.frozen_until_ns)?;
        enc.write_u16::<LittleEndian>(cell.recent_fg_count)?;
        enc.write_f32::<LittleEndian>(cell.locked_baseline_m)?;
        enc.write_f32::<LittleEndian>(cell.locked_spread_m)?;
        enc.write_u32::<LittleEndian>(cell.locked_at_count)?;
    }
    Ok(enc.finish().into_result()?)
}

/// Decompress and deserialise a snapshot blob. Returns `(rings, az_bins,
/// cells)`.
pub fn decode_cells(blob: &[u8]) -> Result<(u16, u16, Vec<CellState>)> {
    let mut dec = Decoder::new(blob)?;

    let mut magic = [0u8; 4];
    dec.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::snapshot_corrupt("bad magic"));
    }
    let version = dec.read_u16::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::snapshot_corrupt(format!(
            "unsupported version {version}"
        )));
    }
    let rings = dec.read_u16::<LittleEndian>()?;
    let az_bins = dec.read_u16::<LittleEndian>()?;
    let cell_bytes = dec.read_u16::<LittleEndian>()?;
    if cell_bytes != CELL_RECORD_BYTES {
        return Err(Error::snapshot_corrupt(format!(
            "unexpected cell record size {cell_bytes}"
        )));
    }
    let count = dec.read_u32::<LittleEndian>()? as usize;
    if count != rings as usize * az_bins as usize {
        return Err(Error::snapshot_corrupt(format!(
            "cell count {count} does not match {rings}x{az_bins} grid"
        )));
    }

    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        cells.push(CellState {
            avg_range_m: dec.read_f32::<LittleEndian>()?,
            spread_m: dec.read_f32::<LittleEndian>()?,
            times_seen: dec.read_u32::<LittleEndian>()?,
            last_update_ns: dec.read_i64::<LittleEndian>()?,
            frozen_until_ns: dec.read_i64::<LittleEndian>()?,
            recent_fg_count: dec.read_u16::<LittleEndian>()?,
            locked_baseline_m: dec.read_f32::<LittleEndian>()?,
            locked_spread_m: dec.read_f32::<LittleEndian>()?,
            locked_at_count: dec.read_u32::<LittleEndian>()?,
        });
    }
    Ok((rings, az_bins, cells))
}
