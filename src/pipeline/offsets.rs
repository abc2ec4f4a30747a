//! Translation between segment-local and dataset-global sample indices.
//!
//! Event-time tables carry times in row 0, firing tables in row 1. Times are
//! whole sample indices, so both directions are exact. Globalized tables are
//! always stored as `F64`: a global index can outgrow the source element type
//! (`F32` loses integers above 2^24, `I32` stops at `i32::MAX`).

use crate::error::{PipelineError, Result};
use crate::io::mda::{ElementType, MdaTable};
use ndarray::Axis;
use std::path::Path;

/// Time row of an event-time table.
pub const EVENT_TIME_ROW: usize = 0;

/// Time row of a firing table.
pub const FIRING_TIME_ROW: usize = 1;

/// Global index to local index relative to a segment start.
#[inline]
pub fn localize(t: i64, segment_start: i64) -> i64 {
    t - segment_start
}

/// Local index to global index relative to a segment start.
#[inline]
pub fn globalize(t: i64, segment_start: i64) -> i64 {
    t + segment_start
}

fn check_row(table: &MdaTable, row: usize) -> Result<()> {
    if row >= table.rows() {
        return Err(PipelineError::artifact(format!(
            "table has {} rows, no time row {}",
            table.rows(),
            row
        )));
    }
    Ok(())
}

/// Shift every value of `row` from local to global coordinates in place.
///
/// The table is widened to `F64` so the shifted indices are written exactly.
pub fn globalize_row(table: &mut MdaTable, row: usize, segment_start: u64) -> Result<()> {
    check_row(table, row)?;
    let start = segment_start as i64;
    table.element_type = ElementType::F64;
    table
        .data
        .row_mut(row)
        .mapv_inplace(|t| globalize(t as i64, start) as f64);
    Ok(())
}

/// Keep the records whose global time lies in `[t1, t2]`, localized to `t1`.
///
/// Record order is preserved.
pub fn slice_local(table: &MdaTable, t1: u64, t2: u64, row: usize) -> Result<MdaTable> {
    check_row(table, row)?;
    let (lo, hi) = (t1 as i64, t2 as i64);

    let keep: Vec<usize> = table
        .data
        .row(row)
        .iter()
        .enumerate()
        .filter(|&(_, &t)| {
            let t = t as i64;
            t >= lo && t <= hi
        })
        .map(|(i, _)| i)
        .collect();

    let mut data = table.data.select(Axis(1), &keep);
    data.row_mut(row).mapv_inplace(|t| localize(t as i64, lo) as f64);

    Ok(MdaTable {
        element_type: table.element_type,
        data,
        one_dimensional: table.one_dimensional,
    })
}

/// Read `input`, globalize its time row and write the result to `output`.
pub fn globalize_file(input: &Path, output: &Path, row: usize, segment_start: u64) -> Result<usize> {
    let mut table = MdaTable::read(input)?;
    globalize_row(&mut table, row, segment_start)?;
    table.write(output)?;
    Ok(table.records())
}

/// Read `input`, slice it to `[t1, t2]` in local coordinates and write it to `output`.
pub fn slice_local_file(input: &Path, output: &Path, t1: u64, t2: u64, row: usize) -> Result<usize> {
    let sliced = slice_local(&MdaTable::read(input)?, t1, t2, row)?;
    sliced.write(output)?;
    Ok(sliced.records())
}
