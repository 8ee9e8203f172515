//! Tokenizer for tensor-comprehension programs.

use crate::frontend::FrontendError;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f64),
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Arrow,
    Colon,
    Question,
    Assign(AssignOp),
    Op(Operator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum AssignOp {
    /// `=`
    Set,
    /// `+=`
    AddAccumulate,
    /// `*=`
    MulAccumulate,
    /// `+=!`
    AddReduce,
    /// `*=!`
    MulReduce,
}

impl AssignOp {
    pub fn is_reduction(&self) -> bool {
        !matches!(self, AssignOp::Set)
    }

    /// Reductions spelled with `!` initialize the target before accumulating.
    pub fn initializes(&self) -> bool {
        matches!(self, AssignOp::Set | AssignOp::AddReduce | AssignOp::MulReduce)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            AssignOp::Set => "=",
            AssignOp::AddAccumulate => "+=",
            AssignOp::MulAccumulate => "*=",
            AssignOp::AddReduce => "+=!",
            AssignOp::MulReduce => "*=!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Add,
    Sub,
    Mul,
    Div,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Eq,
    NotEq,
    Not,
}

impl Operator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Add => "+",
            Operator::Sub => "-",
            Operator::Mul => "*",
            Operator::Div => "/",
            Operator::Less => "<",
            Operator::LessEq => "<=",
            Operator::Greater => ">",
            Operator::GreaterEq => ">=",
            Operator::Eq => "==",
            Operator::NotEq => "!=",
            Operator::Not => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(name) => f.write_str(name),
            TokenKind::Int(value) => write!(f, "{value}"),
            TokenKind::Float(value) => write!(f, "{value:?}"),
            TokenKind::LParen => f.write_str("("),
            TokenKind::RParen => f.write_str(")"),
            TokenKind::LBrace => f.write_str("{"),
            TokenKind::RBrace => f.write_str("}"),
            TokenKind::Comma => f.write_str(","),
            TokenKind::Arrow => f.write_str("->"),
            TokenKind::Colon => f.write_str(":"),
            TokenKind::Question => f.write_str("?"),
            TokenKind::Assign(op) => f.write_str(op.symbol()),
            TokenKind::Op(op) => f.write_str(op.symbol()),
        }
    }
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, FrontendError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut index = 0usize;
    let mut line = 1usize;

    while index < bytes.len() {
        let b = bytes[index];
        if b == b'\n' {
            line += 1;
            index += 1;
            continue;
        }
        if b.is_ascii_whitespace() {
            index += 1;
            continue;
        }
        if b == b'#' {
            while index < bytes.len() && bytes[index] != b'\n' {
                index += 1;
            }
            continue;
        }

        let next = bytes.get(index + 1).copied();
        let after = bytes.get(index + 2).copied();
        let (kind, width) = match b {
            b'(' => (TokenKind::LParen, 1),
            b')' => (TokenKind::RParen, 1),
            b'{' => (TokenKind::LBrace, 1),
            b'}' => (TokenKind::RBrace, 1),
            b',' => (TokenKind::Comma, 1),
            b':' => (TokenKind::Colon, 1),
            b'?' => (TokenKind::Question, 1),
            b'+' => match (next, after) {
                (Some(b'='), Some(b'!')) => (TokenKind::Assign(AssignOp::AddReduce), 3),
                (Some(b'='), _) => (TokenKind::Assign(AssignOp::AddAccumulate), 2),
                _ => (TokenKind::Op(Operator::Add), 1),
            },
            b'*' => match (next, after) {
                (Some(b'='), Some(b'!')) => (TokenKind::Assign(AssignOp::MulReduce), 3),
                (Some(b'='), _) => (TokenKind::Assign(AssignOp::MulAccumulate), 2),
                _ => (TokenKind::Op(Operator::Mul), 1),
            },
            b'-' => match next {
                Some(b'>') => (TokenKind::Arrow, 2),
                _ => (TokenKind::Op(Operator::Sub), 1),
            },
            b'/' => (TokenKind::Op(Operator::Div), 1),
            b'=' => match next {
                Some(b'=') => (TokenKind::Op(Operator::Eq), 2),
                _ => (TokenKind::Assign(AssignOp::Set), 1),
            },
            b'<' => match next {
                Some(b'=') => (TokenKind::Op(Operator::LessEq), 2),
                _ => (TokenKind::Op(Operator::Less), 1),
            },
            b'>' => match next {
                Some(b'=') => (TokenKind::Op(Operator::GreaterEq), 2),
                _ => (TokenKind::Op(Operator::Greater), 1),
            },
            b'!' => match next {
                Some(b'=') => (TokenKind::Op(Operator::NotEq), 2),
                _ => (TokenKind::Op(Operator::Not), 1),
            },
            b'0'..=b'9' | b'.' => lex_number(&bytes[index..], line)?,
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = index;
                let mut end = index;
                while end < bytes.len() && (bytes[end].is_ascii_alphanumeric() || bytes[end] == b'_')
                {
                    end += 1;
                }
                (TokenKind::Ident(src[start..end].to_string()), end - start)
            }
            other => {
                return Err(FrontendError::Lex {
                    line,
                    message: format!("unexpected character '{}'", other as char),
                })
            }
        };
        tokens.push(Token { kind, line });
        index += width;
    }

    Ok(tokens)
}

fn lex_number(bytes: &[u8], line: usize) -> Result<(TokenKind, usize), FrontendError> {
    let mut end = 0usize;
    let mut is_float = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        is_float = true;
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
        }
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let digits_start = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > digits_start {
            is_float = true;
            end = exp_end;
        }
    }

    // Only ASCII digits, signs, dots and exponent markers were consumed.
    let text = String::from_utf8_lossy(&bytes[..end]);
    let invalid = || FrontendError::Lex {
        line,
        message: format!("malformed number '{text}'"),
    };
    if is_float {
        let value = text.parse::<f64>().map_err(|_| invalid())?;
        Ok((TokenKind::Float(value), end))
    } else {
        let value = text.parse::<i64>().map_err(|_| invalid())?;
        Ok((TokenKind::Int(value), end))
    }
}
