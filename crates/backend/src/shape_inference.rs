//! Output-shape inference by fixed-point range propagation.
//!
//! Every index variable of a statement is bounded by its `where` clauses and
//! by each tensor access it appears in. For an access dimension of extent `d`
//! indexed by `i + c + j`, where `c` folds constants and size symbols and `j`
//! is an index with a known extent, `i` is bounded by `d - c - (ext(j) - 1)`.
//! Propagation repeats until no extent shrinks.

use crate::compiler::CompilationError;
use kernelvault_ir::frontend::{Access, Definition, DimSpec, IndexExpr, Statement};
use kernelvault_ir::{parse, ShapeSignature, SizeBindings, TensorDescriptor};
use std::collections::HashMap;

const MAX_PASSES: usize = 64;

/// Extents of one statement's index variables, outputs first.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementExtents {
    pub target: Vec<(String, u64)>,
    pub reductions: Vec<(String, u64)>,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub sizes: SizeBindings,
    pub outputs: Vec<TensorDescriptor>,
    pub statements: Vec<StatementExtents>,
    pub shapes: HashMap<String, Vec<u64>>,
}

pub fn infer_from_source(
    program: &str,
    entry: &str,
    inputs: &ShapeSignature,
) -> Result<Vec<TensorDescriptor>, CompilationError> {
    let program = parse(program)?;
    let def = program
        .definition(entry)
        .ok_or_else(|| CompilationError::UnknownEntryPoint(entry.to_string()))?;
    Ok(analyze(def, inputs.descriptors())?.outputs)
}

pub fn infer_outputs(
    def: &Definition,
    inputs: &[TensorDescriptor],
) -> Result<Vec<TensorDescriptor>, CompilationError> {
    Ok(analyze(def, inputs)?.outputs)
}

pub fn analyze(def: &Definition, inputs: &[TensorDescriptor]) -> Result<Analysis, CompilationError> {
    let sizes = def.bind_sizes(inputs)?;
    let mut shapes: HashMap<String, Vec<u64>> = def
        .params
        .iter()
        .zip(inputs)
        .map(|(param, descriptor)| (param.name.clone(), descriptor.shape.clone()))
        .collect();

    let mut statements = Vec::with_capacity(def.statements.len());
    for stmt in &def.statements {
        let extents = statement_extents(stmt, &sizes, &shapes)?;
        if !shapes.contains_key(&stmt.target.tensor) {
            let shape = extents.target.iter().map(|(_, extent)| *extent).collect();
            shapes.insert(stmt.target.tensor.clone(), shape);
        }
        statements.push(extents);
    }

    let template = inputs.first();
    let outputs = def
        .outputs
        .iter()
        .map(|name| {
            let shape = shapes.get(name).cloned().ok_or_else(|| {
                CompilationError::ShapeInference(format!("output `{name}` is never assigned"))
            })?;
            let descriptor = match template {
                Some(first) => TensorDescriptor::contiguous(first.dtype, shape)
                    .with_alignment(first.alignment),
                None => TensorDescriptor::float32(&shape),
            };
            Ok(descriptor)
        })
        .collect::<Result<Vec<_>, CompilationError>>()?;

    Ok(Analysis {
        sizes,
        outputs,
        statements,
        shapes,
    })
}

fn statement_extents(
    stmt: &Statement,
    sizes: &SizeBindings,
    shapes: &HashMap<String, Vec<u64>>,
) -> Result<StatementExtents, CompilationError> {
    let mut extents: HashMap<String, u64> = HashMap::new();

    for range in &stmt.ranges {
        let resolve = |spec: &DimSpec| {
            spec.resolve(sizes).ok_or_else(|| {
                CompilationError::ShapeInference(format!(
                    "line {}: range bound `{spec}` is not a known size",
                    stmt.line
                ))
            })
        };
        let lo = resolve(&range.lo)?;
        let hi = resolve(&range.hi)?;
        if lo > hi {
            return Err(CompilationError::ShapeInference(format!(
                "line {}: empty range {lo}:{hi} for `{}`",
                stmt.line, range.index
            )));
        }
        tighten(&mut extents, &range.index, hi);
    }

    let mut accesses: Vec<&Access> = stmt.reads.iter().collect();
    if shapes.contains_key(&stmt.target.tensor) {
        accesses.push(&stmt.target);
    }
    for access in &accesses {
        if let Some(shape) = shapes.get(&access.tensor) {
            if shape.len() != access.indices.len() {
                return Err(CompilationError::ShapeInference(format!(
                    "line {}: `{}` has rank {} but is indexed with {} subscripts",
                    stmt.line,
                    access.tensor,
                    shape.len(),
                    access.indices.len()
                )));
            }
        }
    }

    for _ in 0..MAX_PASSES {
        let mut changed = false;
        for access in &accesses {
            let Some(shape) = shapes.get(&access.tensor) else {
                continue;
            };
            for (index, &dim) in access.indices.iter().zip(shape) {
                changed |= bound_from_access(index, dim, sizes, &mut extents);
            }
        }
        if !changed {
            break;
        }
    }

    let mut target = Vec::with_capacity(stmt.target.indices.len());
    for index in &stmt.target.indices {
        let name = index.as_variable().unwrap_or_default();
        match extents.get(name) {
            Some(0) => {
                return Err(CompilationError::ShapeInference(format!(
                    "line {}: index `{name}` of `{}` has an empty range",
                    stmt.line, stmt.target.tensor
                )))
            }
            Some(&extent) => target.push((name.to_string(), extent)),
            None => {
                return Err(CompilationError::ShapeInference(format!(
                    "line {}: index `{name}` of `{}` is unbounded",
                    stmt.line, stmt.target.tensor
                )))
            }
        }
    }

    let mut reductions: Vec<(String, u64)> = Vec::new();
    for access in &stmt.reads {
        for index in &access.indices {
            for symbol in index.symbols() {
                if sizes.contains(symbol)
                    || target.iter().any(|(name, _)| name == symbol)
                    || reductions.iter().any(|(name, _)| name == symbol)
                {
                    continue;
                }
                let extent = extents.get(symbol).copied().ok_or_else(|| {
                    CompilationError::ShapeInference(format!(
                        "line {}: reduction index `{symbol}` is unbounded",
                        stmt.line
                    ))
                })?;
                reductions.push((symbol.to_string(), extent));
            }
        }
    }

    Ok(StatementExtents { target, reductions })
}

fn tighten(extents: &mut HashMap<String, u64>, name: &str, bound: u64) -> bool {
    match extents.get_mut(name) {
        Some(existing) if *existing <= bound => false,
        Some(existing) => {
            *existing = bound;
            true
        }
        None => {
            extents.insert(name.to_string(), bound);
            true
        }
    }
}

fn bound_from_access(
    index: &IndexExpr,
    dim: u64,
    sizes: &SizeBindings,
    extents: &mut HashMap<String, u64>,
) -> bool {
    let IndexExpr::Affine { terms, constant } = index else {
        return false;
    };

    let mut offset = *constant;
    let mut variables: Vec<(&str, i64)> = Vec::new();
    for (name, coefficient) in terms {
        match sizes.get(name) {
            Some(value) => offset += coefficient * value as i64,
            None => variables.push((name.as_str(), *coefficient)),
        }
    }

    let mut changed = false;
    for (position, &(name, coefficient)) in variables.iter().enumerate() {
        if coefficient != 1 {
            continue;
        }
        let mut span = 0i64;
        let mut resolvable = true;
        for (other_position, &(other, other_coefficient)) in variables.iter().enumerate() {
            if other_position == position {
                continue;
            }
            match extents.get(other) {
                Some(&extent) if other_coefficient > 0 => {
                    span += other_coefficient * (extent as i64 - 1).max(0)
                }
                _ => {
                    resolvable = false;
                    break;
                }
            }
        }
        if !resolvable {
            continue;
        }
        let bound = (dim as i64 - offset - span).max(0) as u64;
        changed |= tighten(extents, name, bound);
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_ir::library;

    fn sig(shapes: &[&[u64]]) -> ShapeSignature {
        ShapeSignature::new(shapes.iter().map(|s| TensorDescriptor::float32(s)).collect())
    }

    #[test]
    fn test_group_convolution_output() {
        let inputs = sig(&[&[32, 32, 4, 56, 56], &[32, 4, 4, 3, 3], &[32, 4]]);
        let outputs =
            infer_from_source(library::GROUP_CONVOLUTION, "group_convolution", &inputs).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].shape, vec![32, 32, 4, 54, 54]);
        assert_eq!(outputs[0].strides, vec![32 * 4 * 54 * 54, 4 * 54 * 54, 54 * 54, 54, 1]);
    }

    #[test]
    fn test_group_normalization_outputs() {
        let inputs = sig(&[&[4, 8, 2, 16, 16], &[8, 2], &[8, 2]]);
        let outputs = infer_from_source(
            library::GROUP_NORMALIZATION,
            "group_normalization_single_kernel",
            &inputs,
        )
        .unwrap();
        let shapes: Vec<_> = outputs.iter().map(|o| o.shape.clone()).collect();
        assert_eq!(shapes, vec![vec![4, 8, 2, 16, 16], vec![4, 8], vec![4, 8]]);
    }

    #[test]
    fn test_mlp3_outputs() {
        let inputs = sig(&[&[4, 64], &[32, 64], &[32], &[48, 32], &[48], &[8, 48], &[8]]);
        let outputs = infer_from_source(library::MLP3, "mlp3", &inputs).unwrap();
        let shapes: Vec<_> = outputs.iter().map(|o| o.shape.clone()).collect();
        assert_eq!(shapes, vec![vec![4, 32], vec![4, 48], vec![4, 8]]);
    }

    #[test]
    fn test_wavenet_outputs_use_where_ranges() {
        let inputs = sig(&[
            &[2, 8, 4000],
            &[16, 8, 2],
            &[16],
            &[16, 8, 2],
            &[16],
            &[8, 16],
            &[8],
            &[4, 16],
            &[4],
            &[32],
        ]);
        let outputs = infer_from_source(library::WAVENET, "wavenet1", &inputs).unwrap();
        let shapes: Vec<_> = outputs.iter().map(|o| o.shape.clone()).collect();
        assert_eq!(
            shapes,
            vec![
                vec![2, 16, 4000],
                vec![2, 16, 4000],
                vec![2, 16, 4000],
                vec![2, 8, 4000],
                vec![2, 4, 4000],
            ]
        );
    }

    #[test]
    fn test_kernel_larger_than_input_is_rejected() {
        let inputs = sig(&[&[32, 32, 4, 8, 8], &[32, 4, 4, 9, 9], &[32, 4]]);
        let err = infer_from_source(library::GROUP_CONVOLUTION, "group_convolution", &inputs)
            .unwrap_err();
        assert!(matches!(err, CompilationError::ShapeInference(_)));
    }

    #[test]
    fn test_unknown_entry_point() {
        let inputs = sig(&[&[4, 64]]);
        let err = infer_from_source(library::MLP3, "mlp4", &inputs).unwrap_err();
        assert_eq!(err, CompilationError::UnknownEntryPoint("mlp4".into()));
    }
}
