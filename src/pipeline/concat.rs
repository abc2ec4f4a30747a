//! Order-preserving merge of per-segment tables.

use crate::error::{PipelineError, Result};
use crate::io::mda::MdaTable;
use ndarray::{concatenate, Array2, ArrayView2, Axis};
use std::path::Path;

/// Concatenate tables along the record axis, first table's records first.
///
/// All tables must share an element type and, unless they hold no records,
/// a row count. Never sorts.
pub fn concat_tables(tables: &[MdaTable]) -> Result<MdaTable> {
    let first = tables
        .first()
        .ok_or_else(|| PipelineError::artifact("nothing to concatenate"))?;

    // Row count comes from the first non-empty table when there is one
    let rows = tables
        .iter()
        .find(|t| t.records() > 0)
        .map_or(first.rows(), |t| t.rows());

    for (i, table) in tables.iter().enumerate() {
        if table.element_type != first.element_type {
            return Err(PipelineError::artifact(format!(
                "input {} has element type {:?}, expected {:?}",
                i, table.element_type, first.element_type
            )));
        }
        if table.records() > 0 && table.rows() != rows {
            return Err(PipelineError::artifact(format!(
                "input {} has {} rows, expected {}",
                i,
                table.rows(),
                rows
            )));
        }
    }

    let views: Vec<ArrayView2<f64>> = tables
        .iter()
        .filter(|t| t.records() > 0)
        .map(|t| t.data.view())
        .collect();

    let data = if views.is_empty() {
        Array2::zeros((rows, 0))
    } else {
        concatenate(Axis(1), &views).map_err(|e| PipelineError::artifact(e.to_string()))?
    };

    Ok(MdaTable {
        element_type: first.element_type,
        data,
        one_dimensional: first.one_dimensional && rows == 1,
    })
}

/// Read every input in order, concatenate, and write `output`.
///
/// Returns the number of records written.
pub fn concat_files<P: AsRef<Path>>(inputs: &[P], output: &Path) -> Result<usize> {
    let tables = inputs
        .iter()
        .map(|p| MdaTable::read(p.as_ref()).map_err(PipelineError::from))
        .collect::<Result<Vec<_>>>()?;

    let merged = concat_tables(&tables)?;
    merged.write(output)?;
    Ok(merged.records())
}
