//! Read-only queries over a loaded catalog.

use crate::store::KernelCatalog;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;

/// A single field of one record, or the catalog size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Field {
    Size,
    Block,
    Grid,
    Params,
    Options,
    Id,
    Inputs,
    Outputs,
    SpecializedName,
    #[default]
    Source,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InspectError {
    #[error("index {index} out of range for a catalog of {len} kernels")]
    IndexOutOfRange { index: usize, len: usize },
}

pub fn describe(catalog: &KernelCatalog, field: Field, index: usize) -> Result<String, InspectError> {
    if field == Field::Size {
        return Ok(catalog.len().to_string());
    }
    let record = catalog.get(index).ok_or(InspectError::IndexOutOfRange {
        index,
        len: catalog.len(),
    })?;
    let text = match field {
        Field::Size => catalog.len().to_string(),
        Field::Block => record.tight_block.to_string(),
        Field::Grid => record.tight_grid.to_string(),
        Field::Params => record
            .parameters
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(","),
        Field::Options => record.options.to_string(),
        Field::Id => record.id.to_string(),
        Field::Inputs => record.inputs.len().to_string(),
        Field::Outputs => record.outputs.len().to_string(),
        Field::SpecializedName => record.specialized_name.clone(),
        Field::Source => record.kernel_source.clone(),
    };
    Ok(text)
}

pub fn source_digest(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Ids of records sharing identical kernel source, one group per distinct
/// source that occurs more than once, ordered by first appearance.
pub fn duplicate_groups(catalog: &KernelCatalog) -> Vec<Vec<u64>> {
    let mut order = Vec::new();
    let mut groups: HashMap<String, Vec<u64>> = HashMap::new();
    for record in catalog.kernels() {
        let digest = source_digest(&record.kernel_source);
        let ids = groups.entry(digest.clone()).or_default();
        if ids.is_empty() {
            order.push(digest);
        }
        ids.push(record.id);
    }
    order
        .into_iter()
        .filter_map(|digest| groups.remove(&digest))
        .filter(|ids| ids.len() > 1)
        .collect()
}
