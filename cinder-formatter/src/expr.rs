//! Expression compiler and stack-machine evaluator.
//!
//! Schema expressions (array lengths, conditions, throw arguments) are
//! compiled once into an RPN token stream stored inside the owning block
//! definition's command list. Evaluation is an explicit stack machine
//! over 64-bit signed integers; identifier lookup goes through a caller
//! supplied resolver, never through the host language.

use crate::DecodeError;
use crate::token::{Token, TokenDictionary};

const KIND_MASK: u32 = 0xE000_0000;
const KIND_IDENT: u32 = 0x8000_0000;
const KIND_LITERAL: u32 = 0x4000_0000;
const KIND_OP: u32 = 0x2000_0000;
const PAYLOAD_MASK: u32 = !KIND_MASK;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum Op {
    Add = 0,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    LogicalAnd,
    LogicalOr,
    Not,
    Negate,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl Op {
    fn from_u32(value: u32) -> Option<Self> {
        if value > Op::Shr as u32 {
            return None;
        }
        Some(unsafe { std::mem::transmute::<u32, Op>(value) })
    }

    fn precedence(self) -> u8 {
        match self {
            Op::Not | Op::Negate => 9,
            Op::Mul | Op::Div | Op::Mod => 8,
            Op::Add | Op::Sub => 7,
            Op::Shl | Op::Shr => 6,
            Op::Lt | Op::Gt | Op::Le | Op::Ge => 5,
            Op::Eq | Op::Ne => 4,
            Op::BitAnd => 3,
            Op::BitXor | Op::BitOr => 2,
            Op::LogicalAnd => 1,
            Op::LogicalOr => 0,
        }
    }

    fn is_unary(self) -> bool {
        matches!(self, Op::Not | Op::Negate)
    }

    fn symbol(self) -> &'static str {
        match self {
            Op::Add => "+",
            Op::Sub => "-",
            Op::Mul => "*",
            Op::Div => "/",
            Op::Mod => "%",
            Op::Eq => "==",
            Op::Ne => "!=",
            Op::Lt => "<",
            Op::Gt => ">",
            Op::Le => "<=",
            Op::Ge => ">=",
            Op::LogicalAnd => "&&",
            Op::LogicalOr => "||",
            Op::Not => "!",
            Op::Negate => "-",
            Op::BitAnd => "&",
            Op::BitOr => "|",
            Op::BitXor => "^",
            Op::Shl => "<<",
            Op::Shr => ">>",
        }
    }
}

/// Helpers over the packed expression token encoding.
pub struct ExpressionTokens;

impl ExpressionTokens {
    pub fn ident(token: Token) -> u32 {
        KIND_IDENT | token
    }

    pub fn is_ident(word: u32) -> bool {
        word & KIND_MASK == KIND_IDENT
    }

    pub fn ident_token(word: u32) -> Token {
        word & PAYLOAD_MASK
    }

    /// Identifier tokens referenced by an expression.
    pub fn referenced_identifiers(tokens: &[u32]) -> impl Iterator<Item = Token> + '_ {
        tokens
            .iter()
            .filter(|&&w| Self::is_ident(w))
            .map(|&w| Self::ident_token(w))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Lexeme {
    Ident(String),
    Number(i64),
    Operator(Op),
    LParen,
    RParen,
}

fn lex(src: &str, line: usize) -> Result<Vec<Lexeme>, DecodeError> {
    let err = |message: String| DecodeError::SchemaParse { line, message };
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
            {
                i += 1;
            }
            out.push(Lexeme::Ident(src[start..i].to_string()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let hex = i + 1 < bytes.len() && bytes[i] == b'0' && (bytes[i + 1] | 0x20) == b'x';
            if hex {
                i += 2;
                while i < bytes.len() && (bytes[i] as char).is_ascii_hexdigit() {
                    i += 1;
                }
                let value = i64::from_str_radix(&src[start + 2..i], 16)
                    .map_err(|e| err(format!("bad hex literal: {e}")))?;
                out.push(Lexeme::Number(value));
            } else {
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
                let value = src[start..i]
                    .parse::<i64>()
                    .map_err(|e| err(format!("bad literal: {e}")))?;
                out.push(Lexeme::Number(value));
            }
            continue;
        }
        let two = if i + 1 < bytes.len() { &src[i..i + 2] } else { "" };
        let (op, advance) = match two {
            "==" => (Some(Op::Eq), 2),
            "!=" => (Some(Op::Ne), 2),
            "<=" => (Some(Op::Le), 2),
            ">=" => (Some(Op::Ge), 2),
            "&&" => (Some(Op::LogicalAnd), 2),
            "||" => (Some(Op::LogicalOr), 2),
            "<<" => (Some(Op::Shl), 2),
            ">>" => (Some(Op::Shr), 2),
            _ => match c {
                '+' => (Some(Op::Add), 1),
                '-' => (Some(Op::Sub), 1),
                '*' => (Some(Op::Mul), 1),
                '/' => (Some(Op::Div), 1),
                '%' => (Some(Op::Mod), 1),
                '<' => (Some(Op::Lt), 1),
                '>' => (Some(Op::Gt), 1),
                '!' => (Some(Op::Not), 1),
                '&' => (Some(Op::BitAnd), 1),
                '|' => (Some(Op::BitOr), 1),
                '^' => (Some(Op::BitXor), 1),
                '(' => {
                    out.push(Lexeme::LParen);
                    i += 1;
                    continue;
                }
                ')' => {
                    out.push(Lexeme::RParen);
                    i += 1;
                    continue;
                }
                other => return Err(err(format!("unexpected character '{other}' in expression"))),
            },
        };
        if let Some(op) = op {
            out.push(Lexeme::Operator(op));
            i += advance;
        }
    }
    Ok(out)
}

/// Compiles an expression into the packed RPN token stream. Literals go
/// into the definition's literal pool; identifiers intern into its token
/// dictionary.
pub fn compile_expression(
    src: &str,
    line: usize,
    dictionary: &mut TokenDictionary,
    literal_pool: &mut Vec<i64>,
) -> Result<Vec<u32>, DecodeError> {
    let err = |message: &str| DecodeError::SchemaParse {
        line,
        message: message.to_string(),
    };
    let lexemes = lex(src, line)?;
    if lexemes.is_empty() {
        return Err(err("empty expression"));
    }

    let mut output: Vec<u32> = Vec::new();
    let mut operators: Vec<Lexeme> = Vec::new();
    let mut prev_was_value = false;

    let mut push_literal = |output: &mut Vec<u32>, value: i64| {
        let index = literal_pool
            .iter()
            .position(|&v| v == value)
            .unwrap_or_else(|| {
                literal_pool.push(value);
                literal_pool.len() - 1
            });
        output.push(KIND_LITERAL | index as u32);
    };

    for lexeme in lexemes {
        match lexeme {
            Lexeme::Number(value) => {
                push_literal(&mut output, value);
                prev_was_value = true;
            }
            Lexeme::Ident(name) => {
                output.push(KIND_IDENT | dictionary.intern(&name));
                prev_was_value = true;
            }
            Lexeme::Operator(mut op) => {
                if !prev_was_value {
                    op = match op {
                        Op::Sub => Op::Negate,
                        Op::Not => Op::Not,
                        _ => return Err(err("operator in value position")),
                    };
                }
                while let Some(Lexeme::Operator(top)) = operators.last() {
                    let pop = if op.is_unary() {
                        false
                    } else {
                        top.precedence() >= op.precedence()
                    };
                    if !pop {
                        break;
                    }
                    output.push(KIND_OP | *top as u32);
                    operators.pop();
                }
                operators.push(Lexeme::Operator(op));
                prev_was_value = false;
            }
            Lexeme::LParen => {
                operators.push(Lexeme::LParen);
                prev_was_value = false;
            }
            Lexeme::RParen => {
                loop {
                    match operators.pop() {
                        Some(Lexeme::Operator(op)) => output.push(KIND_OP | op as u32),
                        Some(Lexeme::LParen) => break,
                        _ => return Err(err("mismatched parenthesis")),
                    }
                }
                prev_was_value = true;
            }
        }
    }
    while let Some(top) = operators.pop() {
        match top {
            Lexeme::Operator(op) => output.push(KIND_OP | op as u32),
            _ => return Err(err("mismatched parenthesis")),
        }
    }
    Ok(output)
}

/// Evaluates a compiled expression. Identifier lookup goes through
/// `resolve`; the result is a 64-bit signed integer.
pub fn evaluate_expression(
    tokens: &[u32],
    literal_pool: &[i64],
    resolve: &mut dyn FnMut(Token) -> Result<i64, String>,
) -> Result<i64, DecodeError> {
    let mut stack: smallvec::SmallVec<[i64; 8]> = smallvec::SmallVec::new();
    for &word in tokens {
        match word & KIND_MASK {
            KIND_IDENT => {
                let value = resolve(word & PAYLOAD_MASK).map_err(DecodeError::Expression)?;
                stack.push(value);
            }
            KIND_LITERAL => {
                let index = (word & PAYLOAD_MASK) as usize;
                let value = *literal_pool
                    .get(index)
                    .ok_or_else(|| DecodeError::Expression("bad literal index".into()))?;
                stack.push(value);
            }
            KIND_OP => {
                let op = Op::from_u32(word & PAYLOAD_MASK)
                    .ok_or_else(|| DecodeError::Expression("unknown operator".into()))?;
                let result = if op.is_unary() {
                    let a = stack
                        .pop()
                        .ok_or_else(|| DecodeError::Expression("stack underflow".into()))?;
                    match op {
                        Op::Not => (a == 0) as i64,
                        _ => a.wrapping_neg(),
                    }
                } else {
                    let b = stack
                        .pop()
                        .ok_or_else(|| DecodeError::Expression("stack underflow".into()))?;
                    let a = stack
                        .pop()
                        .ok_or_else(|| DecodeError::Expression("stack underflow".into()))?;
                    match op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Mul => a.wrapping_mul(b),
                        Op::Div => a
                            .checked_div(b)
                            .ok_or_else(|| DecodeError::Expression("division by zero".into()))?,
                        Op::Mod => a
                            .checked_rem(b)
                            .ok_or_else(|| DecodeError::Expression("division by zero".into()))?,
                        Op::Eq => (a == b) as i64,
                        Op::Ne => (a != b) as i64,
                        Op::Lt => (a < b) as i64,
                        Op::Gt => (a > b) as i64,
                        Op::Le => (a <= b) as i64,
                        Op::Ge => (a >= b) as i64,
                        Op::LogicalAnd => (a != 0 && b != 0) as i64,
                        Op::LogicalOr => (a != 0 || b != 0) as i64,
                        Op::BitAnd => a & b,
                        Op::BitOr => a | b,
                        Op::BitXor => a ^ b,
                        Op::Shl => a.wrapping_shl(b as u32),
                        Op::Shr => a.wrapping_shr(b as u32),
                        Op::Not | Op::Negate => unreachable!(),
                    }
                };
                stack.push(result);
            }
            _ => return Err(DecodeError::Expression("malformed expression token".into())),
        }
    }
    if stack.len() != 1 {
        return Err(DecodeError::Expression(
            "expression did not reduce to a single value".into(),
        ));
    }
    Ok(stack[0])
}

/// Renders a compiled expression back to text, for error messages.
pub fn expression_to_string(
    tokens: &[u32],
    dictionary: &TokenDictionary,
    literal_pool: &[i64],
) -> String {
    let mut parts = Vec::with_capacity(tokens.len());
    for &word in tokens {
        match word & KIND_MASK {
            KIND_IDENT => parts.push(dictionary.as_string(word & PAYLOAD_MASK).to_string()),
            KIND_LITERAL => parts.push(
                literal_pool
                    .get((word & PAYLOAD_MASK) as usize)
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "?".to_string()),
            ),
            KIND_OP => parts.push(
                Op::from_u32(word & PAYLOAD_MASK)
                    .map(|op| op.symbol().to_string())
                    .unwrap_or_else(|| "?".to_string()),
            ),
            _ => parts.push("?".to_string()),
        }
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(src: &str, vars: &[(&str, i64)]) -> i64 {
        let mut dict = TokenDictionary::new();
        let mut pool = Vec::new();
        let tokens = compile_expression(src, 1, &mut dict, &mut pool).unwrap();
        evaluate_expression(&tokens, &pool, &mut |token| {
            let name = dict.as_string(token);
            vars.iter()
                .find(|(n, _)| *n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| format!("unknown identifier {name}"))
        })
        .unwrap()
    }

    #[test]
    fn test_arithmetic_precedence() {
        assert_eq!(eval("1 + 2 * 3", &[]), 7);
        assert_eq!(eval("(1 + 2) * 3", &[]), 9);
        assert_eq!(eval("10 / 2 - 3", &[]), 2);
        assert_eq!(eval("7 % 4", &[]), 3);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval("3 < 5 && 2 == 2", &[]), 1);
        assert_eq!(eval("3 > 5 || 1 != 1", &[]), 0);
        assert_eq!(eval("!0", &[]), 1);
        assert_eq!(eval("!!7", &[]), 1);
    }

    #[test]
    fn test_unary_minus() {
        assert_eq!(eval("-3 + 5", &[]), 2);
        assert_eq!(eval("2 * -4", &[]), -8);
    }

    #[test]
    fn test_identifiers_resolve_through_callback() {
        assert_eq!(eval("count * stride + 4", &[("count", 10), ("stride", 8)]), 84);
    }

    #[test]
    fn test_hex_and_bitops() {
        assert_eq!(eval("0xFF & 0x0F", &[]), 0x0F);
        assert_eq!(eval("1 << 4", &[]), 16);
    }

    #[test]
    fn test_unknown_identifier_is_error() {
        let mut dict = TokenDictionary::new();
        let mut pool = Vec::new();
        let tokens = compile_expression("mystery + 1", 1, &mut dict, &mut pool).unwrap();
        let result = evaluate_expression(&tokens, &pool, &mut |_| Err("unknown".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_referenced_identifiers() {
        let mut dict = TokenDictionary::new();
        let mut pool = Vec::new();
        let tokens = compile_expression("a + b * 2", 1, &mut dict, &mut pool).unwrap();
        let names: Vec<&str> = ExpressionTokens::referenced_identifiers(&tokens)
            .map(|t| dict.as_string(t))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_expression_to_string() {
        let mut dict = TokenDictionary::new();
        let mut pool = Vec::new();
        let tokens = compile_expression("n * 8", 1, &mut dict, &mut pool).unwrap();
        assert_eq!(expression_to_string(&tokens, &dict, &pool), "n 8 *");
    }
}
