//! Program frontend: parses tensor-comprehension source into definitions.
//!
//! The parser keeps just enough structure for shape inference and code
//! emission: parameter signatures, statement targets, every tensor access on
//! the right-hand side (with affine index expressions where possible) and
//! `where` range clauses. Right-hand sides are otherwise kept as text.

use crate::dialect::{DataType, TensorDescriptor, TypeCode};
use crate::lexer::{tokenize, AssignOp, Operator, Token, TokenKind};
use std::collections::{HashMap, HashSet};
use std::fmt::{self, Write as _};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum FrontendError {
    #[error("lex error at line {line}: {message}")]
    Lex { line: usize, message: String },
    #[error("parse error at line {line}: {message}")]
    Parse { line: usize, message: String },
    #[error("definition `{0}` appears more than once")]
    DuplicateDefinition(String),
    #[error("`{definition}` takes {expected} inputs, got {actual}")]
    ArityMismatch {
        definition: String,
        expected: usize,
        actual: usize,
    },
    #[error("input `{param}` has rank {expected}, got a rank {actual} tensor")]
    RankMismatch {
        param: String,
        expected: usize,
        actual: usize,
    },
    #[error("input `{param}` has element type {expected}, got {actual}")]
    TypeMismatch {
        param: String,
        expected: String,
        actual: String,
    },
    #[error("input `{param}` dimension {dim} is fixed to {expected}, got {actual}")]
    LiteralMismatch {
        param: String,
        dim: usize,
        expected: u64,
        actual: u64,
    },
    #[error("size `{symbol}` bound to both {first} and {second}")]
    InconsistentSize {
        symbol: String,
        first: u64,
        second: u64,
    },
    #[error("size `{0}` has no value")]
    UnboundSize(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DimSpec {
    Symbol(String),
    Literal(u64),
}

impl DimSpec {
    pub fn resolve(&self, sizes: &SizeBindings) -> Option<u64> {
        match self {
            DimSpec::Symbol(name) => sizes.get(name),
            DimSpec::Literal(value) => Some(*value),
        }
    }
}

impl fmt::Display for DimSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimSpec::Symbol(name) => f.write_str(name),
            DimSpec::Literal(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub elem_type: String,
    pub dims: Vec<DimSpec>,
}

impl Param {
    pub fn data_type(&self) -> Option<DataType> {
        let dtype = match self.elem_type.as_str() {
            "float" | "float32" => DataType::float32(),
            "half" | "float16" => DataType::float16(),
            "double" | "float64" => DataType::new(TypeCode::Float, 64, 1),
            "int" | "int32" => DataType::int32(),
            "long" | "int64" => DataType::new(TypeCode::Int, 64, 1),
            "uint8" => DataType::new(TypeCode::UInt, 8, 1),
            _ => return None,
        };
        Some(dtype)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexExpr {
    /// Sum of `coefficient * symbol` terms plus a constant.
    Affine {
        terms: Vec<(String, i64)>,
        constant: i64,
    },
    Opaque(String),
}

impl IndexExpr {
    /// The bare index variable, if this expression is exactly one.
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            IndexExpr::Affine { terms, constant: 0 } if terms.len() == 1 && terms[0].1 == 1 => {
                Some(terms[0].0.as_str())
            }
            _ => None,
        }
    }

    pub fn symbols(&self) -> Vec<&str> {
        match self {
            IndexExpr::Affine { terms, .. } => terms.iter().map(|(name, _)| name.as_str()).collect(),
            IndexExpr::Opaque(_) => Vec::new(),
        }
    }
}

impl fmt::Display for IndexExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexExpr::Opaque(text) => f.write_str(text),
            IndexExpr::Affine { terms, constant } => {
                let mut first = true;
                for (name, coefficient) in terms {
                    let magnitude = coefficient.unsigned_abs();
                    match (first, *coefficient < 0) {
                        (true, true) => f.write_str("-")?,
                        (false, true) => f.write_str(" - ")?,
                        (false, false) => f.write_str(" + ")?,
                        (true, false) => {}
                    }
                    if magnitude != 1 {
                        write!(f, "{magnitude} * ")?;
                    }
                    f.write_str(name)?;
                    first = false;
                }
                if first {
                    write!(f, "{constant}")?;
                } else if *constant > 0 {
                    write!(f, " + {constant}")?;
                } else if *constant < 0 {
                    write!(f, " - {}", constant.unsigned_abs())?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Access {
    pub tensor: String,
    pub indices: Vec<IndexExpr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeClause {
    pub index: String,
    pub lo: DimSpec,
    pub hi: DimSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: usize,
    pub target: Access,
    pub op: AssignOp,
    pub rhs: String,
    pub reads: Vec<Access>,
    pub ranges: Vec<RangeClause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub name: String,
    pub params: Vec<Param>,
    pub outputs: Vec<String>,
    pub statements: Vec<Statement>,
}

impl Definition {
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|param| param.name == name)
    }

    pub fn is_tensor(&self, name: &str) -> bool {
        self.param(name).is_some() || self.outputs.iter().any(|out| out == name)
    }

    /// Bind every size symbol in the parameter list to the matching dimension
    /// of `inputs`, checking arity, rank, element type and literal dims.
    pub fn bind_sizes(&self, inputs: &[TensorDescriptor]) -> Result<SizeBindings, FrontendError> {
        if inputs.len() != self.params.len() {
            return Err(FrontendError::ArityMismatch {
                definition: self.name.clone(),
                expected: self.params.len(),
                actual: inputs.len(),
            });
        }

        let mut sizes = SizeBindings::default();
        for (param, descriptor) in self.params.iter().zip(inputs) {
            if param.dims.len() != descriptor.rank() {
                return Err(FrontendError::RankMismatch {
                    param: param.name.clone(),
                    expected: param.dims.len(),
                    actual: descriptor.rank(),
                });
            }
            if let Some(dtype) = param.data_type() {
                if dtype != descriptor.dtype {
                    return Err(FrontendError::TypeMismatch {
                        param: param.name.clone(),
                        expected: dtype.element_type(),
                        actual: descriptor.dtype.element_type(),
                    });
                }
            }
            for (dim, (spec, &actual)) in param.dims.iter().zip(&descriptor.shape).enumerate() {
                match spec {
                    DimSpec::Symbol(symbol) => sizes.bind(symbol, actual)?,
                    DimSpec::Literal(expected) if *expected != actual => {
                        return Err(FrontendError::LiteralMismatch {
                            param: param.name.clone(),
                            dim,
                            expected: *expected,
                            actual,
                        })
                    }
                    DimSpec::Literal(_) => {}
                }
            }
        }
        Ok(sizes)
    }

    /// Build contiguous input descriptors from explicit size values.
    pub fn instantiate_inputs(
        &self,
        sizes: &SizeBindings,
    ) -> Result<Vec<TensorDescriptor>, FrontendError> {
        self.params
            .iter()
            .map(|param| {
                let shape = param
                    .dims
                    .iter()
                    .map(|spec| {
                        spec.resolve(sizes)
                            .ok_or_else(|| FrontendError::UnboundSize(spec.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let dtype = param.data_type().unwrap_or_else(DataType::float32);
                Ok(TensorDescriptor::contiguous(dtype, shape))
            })
            .collect()
    }
}

/// Size symbol values, remembered in first-binding order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SizeBindings {
    order: Vec<String>,
    values: HashMap<String, u64>,
}

impl SizeBindings {
    pub fn bind(&mut self, symbol: &str, value: u64) -> Result<(), FrontendError> {
        match self.values.get(symbol) {
            Some(&first) if first != value => Err(FrontendError::InconsistentSize {
                symbol: symbol.to_string(),
                first,
                second: value,
            }),
            Some(_) => Ok(()),
            None => {
                self.order.push(symbol.to_string());
                self.values.insert(symbol.to_string(), value);
                Ok(())
            }
        }
    }

    pub fn get(&self, symbol: &str) -> Option<u64> {
        self.values.get(symbol).copied()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.values.contains_key(symbol)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.order
            .iter()
            .map(move |name| (name.as_str(), self.values[name.as_str()]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub definitions: Vec<Definition>,
}

impl Program {
    pub fn definition(&self, name: &str) -> Option<&Definition> {
        self.definitions.iter().find(|def| def.name == name)
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.definitions.iter().map(|def| def.name.as_str())
    }
}

pub fn parse(text: &str) -> Result<Program, FrontendError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let mut program = Program::default();
    let mut seen = HashSet::new();

    while parser.peek().is_some() {
        let definition = parser.parse_definition()?;
        if !seen.insert(definition.name.clone()) {
            return Err(FrontendError::DuplicateDefinition(definition.name));
        }
        program.definitions.push(definition);
    }
    Ok(program)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> FrontendError {
        FrontendError::Parse {
            line: self.line(),
            message: message.into(),
        }
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), FrontendError> {
        match self.peek() {
            Some(found) if *found == kind => {
                self.pos += 1;
                Ok(())
            }
            Some(found) => Err(self.error(format!("expected `{kind}`, found `{found}`"))),
            None => Err(self.error(format!("expected `{kind}`, found end of input"))),
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, FrontendError> {
        match self.peek() {
            Some(TokenKind::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            Some(found) => Err(self.error(format!("expected {what}, found `{found}`"))),
            None => Err(self.error(format!("expected {what}, found end of input"))),
        }
    }

    fn parse_definition(&mut self) -> Result<Definition, FrontendError> {
        let keyword = self.expect_ident("`def`")?;
        if keyword != "def" {
            return Err(self.error(format!("expected `def`, found `{keyword}`")));
        }
        let name = self.expect_ident("definition name")?;

        self.expect(TokenKind::LParen)?;
        let mut params = Vec::new();
        if self.peek() != Some(&TokenKind::RParen) {
            loop {
                params.push(self.parse_param()?);
                if self.peek() == Some(&TokenKind::Comma) {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen)?;

        self.expect(TokenKind::Arrow)?;
        self.expect(TokenKind::LParen)?;
        let mut outputs = vec![self.expect_ident("output name")?];
        while self.peek() == Some(&TokenKind::Comma) {
            self.pos += 1;
            outputs.push(self.expect_ident("output name")?);
        }
        self.expect(TokenKind::RParen)?;

        let body = self.take_body()?;
        let mut definition = Definition {
            name,
            params,
            outputs,
            statements: Vec::new(),
        };
        definition.statements = parse_statements(&definition, &body)?;
        Ok(definition)
    }

    fn parse_param(&mut self) -> Result<Param, FrontendError> {
        let elem_type = self.expect_ident("element type")?;
        let mut dims = Vec::new();
        if self.peek() == Some(&TokenKind::LParen) {
            self.pos += 1;
            loop {
                match self.advance().map(|t| t.kind) {
                    Some(TokenKind::Ident(symbol)) => dims.push(DimSpec::Symbol(symbol)),
                    Some(TokenKind::Int(value)) if value >= 0 => {
                        dims.push(DimSpec::Literal(value as u64))
                    }
                    _ => return Err(self.error("expected a size symbol or literal")),
                }
                match self.advance().map(|t| t.kind) {
                    Some(TokenKind::Comma) => continue,
                    Some(TokenKind::RParen) => break,
                    _ => return Err(self.error("expected `,` or `)` in tensor type")),
                }
            }
        }
        let name = self.expect_ident("parameter name")?;
        Ok(Param {
            name,
            elem_type,
            dims,
        })
    }

    fn take_body(&mut self) -> Result<Vec<Token>, FrontendError> {
        self.expect(TokenKind::LBrace)?;
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(token) = self.advance() {
            match token.kind {
                TokenKind::LBrace => depth += 1,
                TokenKind::RBrace => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.tokens[start..self.pos - 1].to_vec());
                    }
                }
                _ => {}
            }
        }
        Err(self.error("unterminated definition body"))
    }
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (offset, token) in tokens[open..].iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// `Name(...) <assign-op>` or `Name <assign-op>` at the current position.
fn is_statement_head(tokens: &[Token], at: usize) -> bool {
    match tokens.get(at).map(|t| &t.kind) {
        Some(TokenKind::Ident(name)) if name != "where" && name != "in" => {}
        _ => return false,
    }
    match tokens.get(at + 1).map(|t| &t.kind) {
        Some(TokenKind::Assign(_)) => true,
        Some(TokenKind::LParen) => matching_paren(tokens, at + 1)
            .and_then(|close| tokens.get(close + 1))
            .map(|t| matches!(t.kind, TokenKind::Assign(_)))
            .unwrap_or(false),
        _ => false,
    }
}

fn parse_statements(def: &Definition, body: &[Token]) -> Result<Vec<Statement>, FrontendError> {
    let mut starts = Vec::new();
    let mut depth = 0usize;
    for (at, token) in body.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            _ if depth == 0 && is_statement_head(body, at) => starts.push(at),
            _ => {}
        }
    }

    let line_of = |at: usize| body.get(at).map(|t| t.line).unwrap_or(0);
    match starts.first() {
        None => {
            return Err(FrontendError::Parse {
                line: line_of(0),
                message: format!("`{}` has no statements", def.name),
            })
        }
        Some(&first) if first != 0 => {
            return Err(FrontendError::Parse {
                line: line_of(0),
                message: format!("expected a statement, found `{}`", body[0].kind),
            })
        }
        Some(_) => {}
    }

    let mut statements = Vec::with_capacity(starts.len());
    for (idx, &start) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).copied().unwrap_or(body.len());
        statements.push(parse_statement(def, &body[start..end])?);
    }
    Ok(statements)
}

fn parse_statement(def: &Definition, tokens: &[Token]) -> Result<Statement, FrontendError> {
    let line = tokens.first().map(|t| t.line).unwrap_or(0);
    let fail = |message: String| FrontendError::Parse { line, message };

    let tensor = match &tokens[0].kind {
        TokenKind::Ident(name) => name.clone(),
        other => return Err(fail(format!("expected a tensor name, found `{other}`"))),
    };
    if !def.outputs.contains(&tensor) {
        return Err(fail(format!(
            "`{tensor}` is assigned but not declared as an output of `{}`",
            def.name
        )));
    }

    let (indices, op_at) = if tokens[1].kind == TokenKind::LParen {
        let close = matching_paren(tokens, 1).ok_or_else(|| fail("unbalanced `(`".into()))?;
        let indices = split_args(&tokens[2..close])
            .into_iter()
            .map(parse_index)
            .collect::<Vec<_>>();
        (indices, close + 1)
    } else {
        (Vec::new(), 1)
    };
    for index in &indices {
        if index.as_variable().is_none() {
            return Err(fail(format!("`{tensor}` must be indexed by plain variables, found `{index}`")));
        }
    }
    let op = match tokens.get(op_at).map(|t| &t.kind) {
        Some(TokenKind::Assign(op)) => *op,
        _ => return Err(fail("expected an assignment operator".into())),
    };

    let rest = &tokens[op_at + 1..];
    let mut depth = 0usize;
    let mut where_at = None;
    for (at, token) in rest.iter().enumerate() {
        match &token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Ident(word) if depth == 0 && word == "where" => {
                where_at = Some(at);
                break;
            }
            _ => {}
        }
    }
    let (rhs_tokens, range_tokens) = match where_at {
        Some(at) => (&rest[..at], &rest[at + 1..]),
        None => (rest, &rest[rest.len()..]),
    };
    if rhs_tokens.is_empty() {
        return Err(fail(format!("`{tensor}` has an empty right-hand side")));
    }

    let mut reads = Vec::new();
    collect_accesses(def, rhs_tokens, &mut reads);
    let ranges = if where_at.is_some() {
        parse_ranges(range_tokens).map_err(fail)?
    } else {
        Vec::new()
    };

    Ok(Statement {
        line,
        target: Access { tensor, indices },
        op,
        rhs: render(rhs_tokens),
        reads,
        ranges,
    })
}

fn split_args(tokens: &[Token]) -> Vec<&[Token]> {
    if tokens.is_empty() {
        return Vec::new();
    }
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (at, token) in tokens.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                args.push(&tokens[start..at]);
                start = at + 1;
            }
            _ => {}
        }
    }
    args.push(&tokens[start..]);
    args
}

fn collect_accesses(def: &Definition, tokens: &[Token], out: &mut Vec<Access>) {
    let mut at = 0usize;
    while at < tokens.len() {
        let is_access = matches!(&tokens[at].kind, TokenKind::Ident(name) if def.is_tensor(name))
            && matches!(tokens.get(at + 1).map(|t| &t.kind), Some(TokenKind::LParen));
        if is_access {
            if let (TokenKind::Ident(name), Some(close)) =
                (&tokens[at].kind, matching_paren(tokens, at + 1))
            {
                let args = &tokens[at + 2..close];
                out.push(Access {
                    tensor: name.clone(),
                    indices: split_args(args).into_iter().map(parse_index).collect(),
                });
                collect_accesses(def, args, out);
                at = close + 1;
                continue;
            }
        }
        at += 1;
    }
}

/// Parse `[-] term (+|- term)*` where a term is `x`, `n`, `n * x` or `x * n`.
fn parse_index(tokens: &[Token]) -> IndexExpr {
    let opaque = || IndexExpr::Opaque(render(tokens));
    let mut terms: Vec<(String, i64)> = Vec::new();
    let mut constant = 0i64;
    let mut at = 0usize;
    let mut sign = 1i64;

    if tokens.is_empty() {
        return opaque();
    }
    if tokens[0].kind == TokenKind::Op(Operator::Sub) {
        sign = -1;
        at = 1;
    }

    loop {
        let kind = |offset: usize| tokens.get(at + offset).map(|t| &t.kind);
        let (symbol, coefficient, width) = match (kind(0), kind(1), kind(2)) {
            (
                Some(TokenKind::Int(n)),
                Some(TokenKind::Op(Operator::Mul)),
                Some(TokenKind::Ident(x)),
            )
            | (
                Some(TokenKind::Ident(x)),
                Some(TokenKind::Op(Operator::Mul)),
                Some(TokenKind::Int(n)),
            ) => (Some(x.clone()), *n, 3),
            (Some(TokenKind::Int(n)), _, _) => (None, *n, 1),
            (Some(TokenKind::Ident(x)), _, _) => (Some(x.clone()), 1, 1),
            _ => return opaque(),
        };
        match symbol {
            Some(name) => match terms.iter_mut().find(|(existing, _)| *existing == name) {
                Some(term) => term.1 += sign * coefficient,
                None => terms.push((name, sign * coefficient)),
            },
            None => constant += sign * coefficient,
        }
        at += width;

        match tokens.get(at).map(|t| &t.kind) {
            None => break,
            Some(TokenKind::Op(Operator::Add)) => sign = 1,
            Some(TokenKind::Op(Operator::Sub)) => sign = -1,
            Some(_) => return opaque(),
        }
        at += 1;
    }

    terms.retain(|(_, coefficient)| *coefficient != 0);
    IndexExpr::Affine { terms, constant }
}

fn parse_ranges(tokens: &[Token]) -> Result<Vec<RangeClause>, String> {
    split_args(tokens)
        .into_iter()
        .map(|clause| {
            let bound = |token: Option<&Token>| match token.map(|t| &t.kind) {
                Some(TokenKind::Ident(name)) => Ok(DimSpec::Symbol(name.clone())),
                Some(TokenKind::Int(value)) if *value >= 0 => Ok(DimSpec::Literal(*value as u64)),
                _ => Err(format!("malformed range bound in `{}`", render(clause))),
            };
            let index = match clause.first().map(|t| &t.kind) {
                Some(TokenKind::Ident(name)) => name.clone(),
                _ => return Err(format!("malformed range clause `{}`", render(clause))),
            };
            let is_in = matches!(clause.get(1).map(|t| &t.kind), Some(TokenKind::Ident(w)) if w == "in");
            let has_colon = matches!(clause.get(3).map(|t| &t.kind), Some(TokenKind::Colon));
            if !is_in || !has_colon || clause.len() != 5 {
                return Err(format!("expected `i in lo:hi`, found `{}`", render(clause)));
            }
            Ok(RangeClause {
                index,
                lo: bound(clause.get(2))?,
                hi: bound(clause.get(4))?,
            })
        })
        .collect()
}

fn render(tokens: &[Token]) -> String {
    let mut out = String::new();
    let mut prev: Option<&TokenKind> = None;
    for token in tokens {
        let glue = matches!(
            (prev, &token.kind),
            (None, _)
                | (_, TokenKind::RParen)
                | (_, TokenKind::Comma)
                | (Some(TokenKind::LParen), _)
                | (Some(TokenKind::Ident(_)), TokenKind::LParen)
        );
        if !glue {
            out.push(' ');
        }
        let _ = write!(out, "{}", token.kind);
        prev = Some(&token.kind);
    }
    out
}
