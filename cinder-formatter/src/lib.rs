//! Schema-driven binary reading.
//!
//! A [`BinarySchemata`] holds declarative block definitions compiled into
//! small command lists; a [`BinaryFormatter`] walks a byte range guided
//! by those commands, producing a pull-parser token stream
//! ([`Blob`] values) that a consumer reads much like an event parser.
//! An [`EvaluationContext`] memoises resolved types and fixed-size
//! computations so large arrays can be skipped without per-element work.
//!
//! ```text
//! block Item { u32 a; u32 b; }
//! block Outer { u32 n; Item items[n]; }
//! ```

pub mod block_match;
pub mod eval;
pub mod expr;
pub mod formatter;
pub mod schema;
pub mod token;
pub mod types;

pub use block_match::BinaryBlockMatch;
pub use eval::{EvaluatedType, EvaluatedTypeToken, EvaluationContext};
pub use expr::ExpressionTokens;
pub use formatter::{BinaryFormatter, Blob, RawValue};
pub use schema::{BinarySchemata, BlockDefinition, BlockDefinitionId};
pub use token::TokenDictionary;
pub use types::{TypeCat, TypeDesc, TypeHint};

/// A decoding failure. Always fatal for the current parse; carries the
/// block-context string (innermost block first) where one is available.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("schema parse error at line {line}: {message}")]
    SchemaParse { line: usize, message: String },
    #[error("unknown type while looking up ({0})")]
    UnknownType(String),
    #[error("{message}{}", format_context(.context))]
    Decode { message: String, context: String },
    #[error("expression error: {0}")]
    Expression(String),
}

fn format_context(context: &str) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(", while reading block {context}")
    }
}

impl DecodeError {
    pub fn decode(message: impl Into<String>, context: impl Into<String>) -> Self {
        DecodeError::Decode {
            message: message.into(),
            context: context.into(),
        }
    }
}
