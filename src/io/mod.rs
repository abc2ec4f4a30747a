//! Artifact container I/O.

mod dataset;
pub mod mda;

pub use dataset::DatasetInfo;
pub use mda::{ElementType, MdaError, MdaHeader, MdaTable};
