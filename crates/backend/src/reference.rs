//! Reference backend: specializes a definition for concrete input shapes and
//! emits straightforward CUDA source for it.

use crate::compiler::{BackendCompiler, CompilationError, CompiledKernel};
use crate::shape_inference::{analyze, Analysis};
use kernelvault_ir::frontend::Definition;
use kernelvault_ir::lexer::{tokenize, AssignOp, TokenKind};
use kernelvault_ir::{parse, CudaDim, MappingOptions, ShapeSignature, TensorDescriptor};
use std::fmt::{self, Write as _};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct ReferenceBackend;

impl ReferenceBackend {
    pub fn new() -> Self {
        Self
    }

    /// Compile an already-parsed definition.
    pub fn compile_definition(
        &self,
        def: &Definition,
        inputs: &ShapeSignature,
        options: &MappingOptions,
    ) -> Result<CompiledKernel, CompilationError> {
        options.validate().map_err(CompilationError::InvalidOptions)?;
        let analysis = analyze(def, inputs.descriptors())?;
        let primary = analysis.outputs.first().ok_or_else(|| {
            CompilationError::ShapeInference(format!("`{}` has no outputs", def.name))
        })?;

        let (block, grid) = tighten(&primary.shape, options);
        let parameters: Vec<i64> = analysis.sizes.iter().map(|(_, v)| v as i64).collect();
        let specialized_name = specialize_name(&def.name, &parameters);

        let mut source = String::new();
        emit_kernel(
            &mut source,
            def,
            inputs.descriptors(),
            &analysis,
            options,
            &specialized_name,
            block,
        )
        .map_err(|err| CompilationError::Backend {
            backend: self.name().to_string(),
            message: format!("failed to format kernel source: {err}"),
        })?;

        debug!(
            kernel = %specialized_name,
            block = %block,
            grid = %grid,
            requested_block = %options.block,
            requested_grid = %options.grid,
            "specialized kernel"
        );

        Ok(CompiledKernel {
            source,
            specialized_name,
            parameters,
            grid,
            block,
        })
    }
}

impl BackendCompiler for ReferenceBackend {
    fn name(&self) -> &str {
        "reference-cuda"
    }

    fn compile(
        &self,
        program: &str,
        entry: &str,
        inputs: &ShapeSignature,
        options: &MappingOptions,
    ) -> Result<CompiledKernel, CompilationError> {
        let program = parse(program)?;
        let def = program
            .definition(entry)
            .ok_or_else(|| CompilationError::UnknownEntryPoint(entry.to_string()))?;
        self.compile_definition(def, inputs, options)
    }
}

pub fn specialize_name(entry: &str, parameters: &[i64]) -> String {
    let mut name = entry.to_string();
    for value in parameters {
        let _ = write!(name, "_{value}");
    }
    name
}

/// Per-dimension tile extent; a zero or oversized tile covers the whole dim.
fn tile_extent(shape: &[u64], tile: &[u64], dim: usize) -> u64 {
    let extent = shape[dim];
    match tile.get(dim).copied() {
        Some(0) | None => extent,
        Some(t) if t > extent => extent,
        Some(t) => t,
    }
}

/// Shrink the requested launch to what the primary output can use.
///
/// Threads map innermost dimensions (x on the last dim) and never exceed one
/// tile; blocks map the outermost dimensions (x on the first) and never exceed
/// the number of tiles.
pub fn tighten(shape: &[u64], options: &MappingOptions) -> (CudaDim, CudaDim) {
    let rank = shape.len();
    let requested_block = options.block.as_array();
    let requested_grid = options.grid.as_array();
    let mut block = [1u64; 3];
    let mut grid = [1u64; 3];

    for axis in 0..3 {
        if axis < rank {
            let dim = rank - 1 - axis;
            block[axis] = requested_block[axis].min(tile_extent(shape, &options.tile, dim));

            let tiles = shape[axis].div_ceil(tile_extent(shape, &options.tile, axis).max(1));
            grid[axis] = requested_grid[axis].min(tiles.max(1));
        }
    }

    (
        CudaDim::new(block[0], block[1], block[2]),
        CudaDim::new(grid[0], grid[1], grid[2]),
    )
}

fn array_cast(descriptor: &TensorDescriptor) -> String {
    descriptor
        .shape
        .iter()
        .skip(1)
        .map(|dim| format!("[{dim}]"))
        .collect()
}

/// Rewrite `T(i, j)` tensor accesses into `T[i][j]` array subscripts.
fn subscript(def: &Definition, text: &str) -> String {
    let Ok(tokens) = tokenize(text) else {
        return text.to_string();
    };
    let mut out = String::new();
    let mut depth_stack: Vec<bool> = Vec::new();
    let mut prev: Option<&TokenKind> = None;
    let mut pending_access = false;

    for token in &tokens {
        let glue = matches!(
            (prev, &token.kind),
            (None, _)
                | (_, TokenKind::RParen)
                | (_, TokenKind::Comma)
                | (Some(TokenKind::LParen), _)
                | (Some(TokenKind::Ident(_)), TokenKind::LParen)
        );
        match &token.kind {
            TokenKind::LParen => {
                if pending_access {
                    out.push('[');
                } else {
                    if !glue {
                        out.push(' ');
                    }
                    out.push('(');
                }
                depth_stack.push(pending_access);
                pending_access = false;
            }
            TokenKind::RParen => {
                out.push(if depth_stack.pop().unwrap_or(false) { ']' } else { ')' });
            }
            TokenKind::Comma if depth_stack.last().copied().unwrap_or(false) => {
                out.push_str("][");
            }
            kind => {
                if !glue && !matches!(prev, Some(TokenKind::Comma) if depth_stack.last().copied().unwrap_or(false))
                {
                    out.push(' ');
                }
                let _ = write!(out, "{kind}");
                pending_access = matches!(kind, TokenKind::Ident(name) if def.is_tensor(name));
            }
        }
        if !matches!(token.kind, TokenKind::Ident(_)) {
            pending_access = false;
        }
        prev = Some(&token.kind);
    }
    out
}

fn emit_kernel(
    out: &mut String,
    def: &Definition,
    inputs: &[TensorDescriptor],
    analysis: &Analysis,
    options: &MappingOptions,
    name: &str,
    block: CudaDim,
) -> fmt::Result {
    let signature = inputs
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    writeln!(out, "// {} specialized for {}", def.name, signature)?;
    writeln!(out, "// mapping: {options}")?;

    let scalar = inputs
        .first()
        .map(|d| d.dtype.cuda_type())
        .unwrap_or("float");
    let mut params: Vec<String> = analysis
        .sizes
        .iter()
        .map(|(symbol, _)| format!("int {symbol}"))
        .collect();
    for output in &def.outputs {
        params.push(format!("{scalar}* p{output}"));
    }
    for (param, descriptor) in def.params.iter().zip(inputs) {
        params.push(format!("const {}* p{}", descriptor.dtype.cuda_type(), param.name));
    }

    writeln!(
        out,
        "extern \"C\" __global__ void __launch_bounds__({}) {}({}) {{",
        block.product(),
        name,
        params.join(", ")
    )?;
    writeln!(
        out,
        "  const long tid = ((long)(blockIdx.z * gridDim.y + blockIdx.y) * gridDim.x + blockIdx.x) * (blockDim.x * blockDim.y * blockDim.z)"
    )?;
    writeln!(
        out,
        "      + (threadIdx.z * blockDim.y + threadIdx.y) * blockDim.x + threadIdx.x;"
    )?;
    writeln!(
        out,
        "  const long nthreads = (long)gridDim.x * gridDim.y * gridDim.z * blockDim.x * blockDim.y * blockDim.z;"
    )?;

    for (output, descriptor) in def.outputs.iter().zip(&analysis.outputs) {
        let cast = array_cast(descriptor);
        writeln!(
            out,
            "  {scalar} (*{output}){cast} = reinterpret_cast<{scalar} (*){cast}>(p{output});"
        )?;
    }
    for (param, descriptor) in def.params.iter().zip(inputs) {
        let ty = descriptor.dtype.cuda_type();
        let cast = array_cast(descriptor);
        writeln!(
            out,
            "  const {ty} (*{name}){cast} = reinterpret_cast<const {ty} (*){cast}>(p{name});",
            name = param.name
        )?;
    }

    for (stmt, extents) in def.statements.iter().zip(&analysis.statements) {
        writeln!(out)?;
        let lhs_indices: Vec<&str> = extents.target.iter().map(|(n, _)| n.as_str()).collect();
        writeln!(
            out,
            "  // {}({}) {} {}",
            stmt.target.tensor,
            lhs_indices.join(", "),
            stmt.op.symbol(),
            stmt.rhs
        )?;
        let total: u64 = extents.target.iter().map(|(_, e)| *e).product();
        writeln!(out, "  for (long idx = tid; idx < {total}; idx += nthreads) {{")?;

        let mut stride = 1u64;
        for (index, extent) in extents.target.iter().rev() {
            writeln!(out, "    const int {index} = (idx / {stride}) % {extent};")?;
            stride *= extent;
        }

        let lhs = format!(
            "{}{}",
            stmt.target.tensor,
            lhs_indices
                .iter()
                .map(|i| format!("[{i}]"))
                .collect::<String>()
        );
        let rhs = subscript(def, &stmt.rhs);
        let (init, combine) = match stmt.op {
            AssignOp::Set => (None, "="),
            AssignOp::AddReduce => (Some(format!("{scalar}(0)")), "+="),
            AssignOp::MulReduce => (Some(format!("{scalar}(1)")), "*="),
            AssignOp::AddAccumulate => (Some(lhs.clone()), "+="),
            AssignOp::MulAccumulate => (Some(lhs.clone()), "*="),
        };

        let mut indent = String::from("    ");
        match &init {
            Some(value) => writeln!(out, "{indent}{scalar} acc = {value};")?,
            None if !extents.reductions.is_empty() => writeln!(out, "{indent}{scalar} acc;")?,
            None => {}
        }
        for (index, extent) in &extents.reductions {
            writeln!(
                out,
                "{indent}for (int {index} = 0; {index} < {extent}; ++{index}) {{"
            )?;
            indent.push_str("  ");
        }
        if init.is_some() || !extents.reductions.is_empty() {
            writeln!(out, "{indent}acc {combine} {rhs};")?;
        } else {
            writeln!(out, "{indent}{lhs} = {rhs};")?;
        }
        for _ in &extents.reductions {
            indent.truncate(indent.len() - 2);
            writeln!(out, "{indent}}}")?;
        }
        if init.is_some() || !extents.reductions.is_empty() {
            writeln!(out, "    {lhs} = acc;")?;
        }
        writeln!(out, "  }}")?;
        writeln!(out, "  __syncthreads();")?;
    }

    writeln!(out, "}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelvault_ir::{library, TensorDescriptor};

    fn mlp3_inputs() -> ShapeSignature {
        let shapes: [&[u64]; 7] = [&[4, 64], &[32, 64], &[32], &[48, 32], &[48], &[8, 48], &[8]];
        ShapeSignature::new(shapes.iter().map(|s| TensorDescriptor::float32(s)).collect())
    }

    #[test]
    fn test_compile_mlp3() {
        let backend = ReferenceBackend::new();
        let options = MappingOptions::naive()
            .with_tile(vec![1, 8])
            .with_block(CudaDim::new(64, 4, 1))
            .with_grid(CudaDim::new(128, 128, 1));
        let kernel = backend
            .compile(library::MLP3, "mlp3", &mlp3_inputs(), &options)
            .unwrap();

        assert_eq!(kernel.specialized_name, "mlp3_4_64_32_48_8");
        assert_eq!(kernel.parameters, vec![4, 64, 32, 48, 8]);
        // O2 is 4x32 with 1x8 tiles: threads clamp to one tile, blocks to 4x4 tiles.
        assert_eq!(kernel.block, CudaDim::new(8, 1, 1));
        assert_eq!(kernel.grid, CudaDim::new(4, 4, 1));
        assert!(kernel.source.contains("mlp3_4_64_32_48_8("));
        assert!(kernel.source.contains("acc += I[b][n] * W2[o][n];"));
        assert!(kernel.source.contains("fmax(O2[b][o], 0)"));
    }

    #[test]
    fn test_tighten_never_grows_launch() {
        let options = MappingOptions::naive()
            .with_tile(vec![0, 0, 0])
            .with_block(CudaDim::new(32, 2, 1))
            .with_grid(CudaDim::new(2, 3, 1));
        let (block, grid) = tighten(&[100, 100, 100], &options);
        assert_eq!(block, CudaDim::new(32, 2, 1));
        assert_eq!(grid, CudaDim::new(1, 1, 1));

        let (block, grid) = tighten(&[7], &options.clone().with_tile(vec![2]));
        assert_eq!(block, CudaDim::new(2, 1, 1));
        assert_eq!(grid, CudaDim::new(2, 1, 1));
    }

    #[test]
    fn test_invalid_options_rejected() {
        let backend = ReferenceBackend::new();
        let options = MappingOptions::naive().with_block(CudaDim::new(2048, 1, 1));
        let err = backend
            .compile(library::MLP3, "mlp3", &mlp3_inputs(), &options)
            .unwrap_err();
        assert!(matches!(err, CompilationError::InvalidOptions(_)));
    }

    #[test]
    fn test_subscript_rewrites_nested_accesses() {
        let program = kernelvault_ir::parse(library::GROUP_NORMALIZATION).unwrap();
        let def = program
            .definition("group_normalization_single_kernel")
            .unwrap();
        let text = subscript(def, "rsqrt(sumSquares(n, g) / (D * H * W) + 1)");
        assert_eq!(text, "rsqrt(sumSquares[n][g] / (D * H * W) + 1)");
    }
}
