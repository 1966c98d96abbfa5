//! Schema text form and its compilation into command lists.
//!
//! A schema declares blocks, aliases and literal tables:
//!
//! ```text
//! alias char = uint8;
//! literals Magic { RIFF = 0x46464952; }
//!
//! block Header {
//!     u32 magic;
//!     if (magic != 0x46464952) { throw "bad magic {}", magic; }
//!     u32 count;
//! }
//!
//! block File(typename Element, version) {
//!     Header header;
//!     Element entries[header.count];
//! }
//! ```
//!
//! Each block definition compiles into a command list of small opcodes
//! interpreted by the formatter and by the fixed-size precomputation.

use crate::DecodeError;
use crate::expr::compile_expression;
use crate::token::{Token, TokenDictionary};

pub type BlockDefinitionId = usize;
pub type AliasId = usize;

pub const CMD_LOOKUP_TYPE: u32 = 0;
pub const CMD_POP_TYPE_STACK: u32 = 1;
pub const CMD_EVALUATE_EXPRESSION: u32 = 2;
pub const CMD_INLINE_INDIVIDUAL_MEMBER: u32 = 3;
pub const CMD_INLINE_ARRAY_MEMBER: u32 = 4;
pub const CMD_IF_FALSE_THEN_JUMP: u32 = 5;
pub const CMD_THROW: u32 = 6;

/// Template parameter kind codes stored after `LookupType`.
pub const TEMPLATE_PARAM_EXPRESSION: u32 = 0;
pub const TEMPLATE_PARAM_TYPENAME: u32 = 1;

/// One compiled block definition.
#[derive(Debug, Clone, Default)]
pub struct BlockDefinition {
    pub name: String,
    pub cmd_list: Vec<u32>,
    pub token_dictionary: TokenDictionary,
    pub literal_pool: Vec<i64>,
    /// Token per template parameter, declaration order.
    pub template_parameter_names: Vec<Token>,
    /// Bit `n` set when parameter `n` is type-kind.
    pub template_parameter_type_field: u32,
}

/// Decoder attached to an alias, for presentation layers.
#[derive(Debug, Clone, PartialEq)]
pub enum AliasDecoder {
    Enum(Vec<(i64, String)>),
    Bitfield(Vec<(u32, String)>),
}

/// A named refinement of an existing type.
#[derive(Debug, Clone)]
pub struct Alias {
    pub name: String,
    pub aliased_type: String,
    pub decoder: Option<AliasDecoder>,
}

/// A collection of block definitions, aliases and literal tables.
///
/// Immutable and shareable once built.
#[derive(Debug, Clone, Default)]
pub struct BinarySchemata {
    blocks: Vec<BlockDefinition>,
    aliases: Vec<Alias>,
    literal_tables: Vec<(String, Vec<(String, i64)>)>,
}

impl BinarySchemata {
    /// Parses and compiles a schema text.
    pub fn parse(src: &str) -> Result<Self, DecodeError> {
        Parser::new(src).parse_schema()
    }

    pub fn find_block_definition(&self, name: &str) -> Option<BlockDefinitionId> {
        self.blocks.iter().position(|b| b.name == name)
    }

    pub fn block_definition(&self, id: BlockDefinitionId) -> &BlockDefinition {
        &self.blocks[id]
    }

    pub fn block_definition_name(&self, id: BlockDefinitionId) -> &str {
        &self.blocks[id].name
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn find_alias(&self, name: &str) -> Option<AliasId> {
        self.aliases.iter().position(|a| a.name == name)
    }

    pub fn alias(&self, id: AliasId) -> &Alias {
        &self.aliases[id]
    }

    pub fn alias_name(&self, id: AliasId) -> &str {
        &self.aliases[id].name
    }

    pub fn literal_table(&self, name: &str) -> Option<&[(String, i64)]> {
        self.literal_tables
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, entries)| entries.as_slice())
    }

    /// Literal-table values visible to expressions (`Table.Name`).
    fn literal_value(&self, qualified: &str) -> Option<i64> {
        let (table, name) = qualified.split_once('.')?;
        self.literal_table(table)?
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Resolves a `Table.Name` identifier used inside an expression.
    pub fn resolve_literal_identifier(&self, qualified: &str) -> Option<i64> {
        self.literal_value(qualified)
    }
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0, line: 1 }
    }

    fn error(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::SchemaParse {
            line: self.line,
            message: message.into(),
        }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn bump(&mut self, len: usize) {
        for c in self.src[self.pos..self.pos + len].chars() {
            if c == '\n' {
                self.line += 1;
            }
        }
        self.pos += len;
    }

    fn skip_trivia(&mut self) {
        loop {
            let rest = self.rest();
            let trimmed = rest.trim_start_matches([' ', '\t', '\r', '\n']);
            let skipped = rest.len() - trimmed.len();
            if skipped > 0 {
                self.bump(skipped);
            }
            if self.rest().starts_with("//") {
                let end = self.rest().find('\n').unwrap_or(self.rest().len());
                self.bump(end);
                continue;
            }
            if self.rest().starts_with("/*") {
                let end = self
                    .rest()
                    .find("*/")
                    .map(|e| e + 2)
                    .unwrap_or(self.rest().len());
                self.bump(end);
                continue;
            }
            break;
        }
    }

    fn at_end(&mut self) -> bool {
        self.skip_trivia();
        self.pos >= self.src.len()
    }

    fn peek_char(&mut self) -> Option<char> {
        self.skip_trivia();
        self.rest().chars().next()
    }

    fn take_char(&mut self, expected: char) -> Result<(), DecodeError> {
        self.skip_trivia();
        if self.rest().starts_with(expected) {
            self.bump(expected.len_utf8());
            Ok(())
        } else {
            Err(self.error(format!("expected '{expected}'")))
        }
    }

    fn try_take_char(&mut self, expected: char) -> bool {
        self.skip_trivia();
        if self.rest().starts_with(expected) {
            self.bump(expected.len_utf8());
            true
        } else {
            false
        }
    }

    fn take_ident(&mut self) -> Result<&'a str, DecodeError> {
        self.skip_trivia();
        let rest = self.rest();
        let mut len = 0;
        for c in rest.chars() {
            if c.is_ascii_alphanumeric() || c == '_' {
                len += c.len_utf8();
            } else {
                break;
            }
        }
        if len == 0 || rest.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            return Err(self.error("expected identifier"));
        }
        let ident = &rest[..len];
        self.bump(len);
        Ok(ident)
    }

    fn try_keyword(&mut self, word: &str) -> bool {
        self.skip_trivia();
        let rest = self.rest();
        if rest.starts_with(word) {
            let after = rest[word.len()..].chars().next();
            if !after.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_') {
                self.bump(word.len());
                return true;
            }
        }
        false
    }

    fn take_string(&mut self) -> Result<String, DecodeError> {
        self.take_char('"')?;
        let rest = self.rest();
        let end = rest
            .find('"')
            .ok_or_else(|| self.error("unterminated string literal"))?;
        let value = rest[..end].to_string();
        self.bump(end + 1);
        Ok(value)
    }

    fn take_integer(&mut self) -> Result<i64, DecodeError> {
        self.skip_trivia();
        let rest = self.rest();
        let negative = rest.starts_with('-');
        let body = if negative { &rest[1..] } else { rest };
        let (digits, radix) = if body.starts_with("0x") || body.starts_with("0X") {
            (&body[2..], 16)
        } else {
            (body, 10)
        };
        let mut len = 0;
        for c in digits.chars() {
            if c.is_ascii_hexdigit() && (radix == 16 || c.is_ascii_digit()) {
                len += 1;
            } else {
                break;
            }
        }
        if len == 0 {
            return Err(self.error("expected integer"));
        }
        let value = i64::from_str_radix(&digits[..len], radix)
            .map_err(|e| self.error(format!("bad integer: {e}")))?;
        let consumed = (negative as usize) + if radix == 16 { 2 } else { 0 } + len;
        self.bump(consumed);
        Ok(if negative { -value } else { value })
    }

    /// Captures balanced content between `open` (already consumed by the
    /// caller taking the char) and `close`, honouring nesting.
    fn capture_balanced(&mut self, open: char, close: char) -> Result<&'a str, DecodeError> {
        self.skip_trivia();
        let start = self.pos;
        let mut depth = 1usize;
        let mut len = 0usize;
        for c in self.rest().chars() {
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    let content = &self.src[start..start + len];
                    self.bump(len + close.len_utf8());
                    return Ok(content);
                }
            }
            len += c.len_utf8();
        }
        Err(self.error(format!("unbalanced '{open}'")))
    }

    fn parse_schema(mut self) -> Result<BinarySchemata, DecodeError> {
        let mut schemata = BinarySchemata::default();
        while !self.at_end() {
            if self.try_keyword("block") {
                let block = self.parse_block(&schemata)?;
                if schemata.find_block_definition(&block.name).is_some() {
                    return Err(self.error(format!("block {} redefined", block.name)));
                }
                schemata.blocks.push(block);
            } else if self.try_keyword("alias") {
                let alias = self.parse_alias()?;
                schemata.aliases.push(alias);
            } else if self.try_keyword("literals") {
                let name = self.take_ident()?.to_string();
                self.take_char('{')?;
                let mut entries = Vec::new();
                while !self.try_take_char('}') {
                    let entry_name = self.take_ident()?.to_string();
                    self.take_char('=')?;
                    let value = self.take_integer()?;
                    self.take_char(';')?;
                    entries.push((entry_name, value));
                }
                schemata.literal_tables.push((name, entries));
            } else {
                return Err(self.error("expected 'block', 'alias' or 'literals'"));
            }
        }
        Ok(schemata)
    }

    fn parse_alias(&mut self) -> Result<Alias, DecodeError> {
        let name = self.take_ident()?.to_string();
        self.take_char('=')?;
        let aliased_type = self.take_ident()?.to_string();

        let decoder = if self.try_keyword("enum") {
            self.take_char('{')?;
            let mut entries = Vec::new();
            while !self.try_take_char('}') {
                let entry_name = self.take_ident()?.to_string();
                self.take_char('=')?;
                let value = self.take_integer()?;
                self.take_char(';')?;
                entries.push((value, entry_name));
            }
            Some(AliasDecoder::Enum(entries))
        } else if self.try_keyword("bitfield") {
            self.take_char('{')?;
            let mut entries = Vec::new();
            while !self.try_take_char('}') {
                let bit = self.take_integer()? as u32;
                self.take_char(':')?;
                let entry_name = self.take_ident()?.to_string();
                self.take_char(';')?;
                entries.push((bit, entry_name));
            }
            Some(AliasDecoder::Bitfield(entries))
        } else {
            None
        };

        self.take_char(';')?;
        Ok(Alias {
            name,
            aliased_type,
            decoder,
        })
    }

    fn parse_block(&mut self, schemata: &BinarySchemata) -> Result<BlockDefinition, DecodeError> {
        let name = self.take_ident()?.to_string();
        let mut definition = BlockDefinition {
            name,
            ..Default::default()
        };

        if self.try_take_char('(') {
            loop {
                let is_typename = self.try_keyword("typename");
                let param = self.take_ident()?;
                let token = definition.token_dictionary.intern(param);
                if is_typename {
                    definition.template_parameter_type_field |=
                        1 << definition.template_parameter_names.len();
                }
                definition.template_parameter_names.push(token);
                if !self.try_take_char(',') {
                    break;
                }
            }
            self.take_char(')')?;
        }

        self.take_char('{')?;
        self.parse_statements(&mut definition, schemata)?;
        Ok(definition)
    }

    /// Parses statements up to and including the closing `}`.
    fn parse_statements(
        &mut self,
        definition: &mut BlockDefinition,
        schemata: &BinarySchemata,
    ) -> Result<(), DecodeError> {
        loop {
            if self.try_take_char('}') {
                return Ok(());
            }
            if self.at_end() {
                return Err(self.error("unterminated block"));
            }

            if self.try_keyword("if") {
                self.take_char('(')?;
                let condition = self.capture_balanced('(', ')')?;
                self.compile_expression_cmd(definition, condition)?;
                definition.cmd_list.push(CMD_IF_FALSE_THEN_JUMP);
                let patch_at = definition.cmd_list.len();
                definition.cmd_list.push(0); // jump target, patched below
                let condition_symbol = definition.token_dictionary.intern(condition.trim());
                definition.cmd_list.push(condition_symbol);
                self.take_char('{')?;
                self.parse_statements(definition, schemata)?;
                definition.cmd_list[patch_at] = definition.cmd_list.len() as u32;
                continue;
            }

            if self.try_keyword("throw") {
                let message = self.take_string()?;
                let mut expr_count = 0u32;
                while self.try_take_char(',') {
                    let expression = self.capture_expression_until(&[',', ';'])?;
                    self.compile_expression_cmd(definition, expression.trim())?;
                    expr_count += 1;
                }
                self.take_char(';')?;
                definition.cmd_list.push(CMD_THROW);
                definition.cmd_list.push(expr_count);
                compile_throw_message(&mut definition.cmd_list, &message, expr_count)
                    .map_err(|m| self.error(m))?;
                continue;
            }

            // member: type-ref name [array] ;
            let type_name = self.take_ident()?.to_string();
            let mut param_codes: Vec<u32> = Vec::new();
            if self.try_take_char('(') {
                let args_src = self.capture_balanced('(', ')')?;
                param_codes = self.compile_template_args(definition, schemata, &type_name, args_src)?;
            }

            let member_name = self.take_ident()?.to_string();
            let member_token = definition.token_dictionary.intern(&member_name);
            let type_token = definition.token_dictionary.intern(&type_name);

            let array_expr = if self.try_take_char('[') {
                Some(self.capture_balanced('[', ']')?)
            } else {
                None
            };
            self.take_char(';')?;

            definition.cmd_list.push(CMD_LOOKUP_TYPE);
            definition.cmd_list.push(type_token);
            definition.cmd_list.push(param_codes.len() as u32);
            definition.cmd_list.extend_from_slice(&param_codes);

            match array_expr {
                Some(expression) => {
                    self.compile_expression_cmd(definition, expression)?;
                    definition.cmd_list.push(CMD_INLINE_ARRAY_MEMBER);
                    definition.cmd_list.push(member_token);
                }
                None => {
                    definition.cmd_list.push(CMD_INLINE_INDIVIDUAL_MEMBER);
                    definition.cmd_list.push(member_token);
                }
            }
            definition.cmd_list.push(CMD_POP_TYPE_STACK);
        }
    }

    /// Captures an expression up to (not consuming) one of `stops` at
    /// depth zero.
    fn capture_expression_until(&mut self, stops: &[char]) -> Result<&'a str, DecodeError> {
        self.skip_trivia();
        let start = self.pos;
        let mut depth = 0usize;
        let mut len = 0usize;
        for c in self.rest().chars() {
            if c == '(' || c == '[' {
                depth += 1;
            } else if c == ')' || c == ']' {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            } else if depth == 0 && stops.contains(&c) {
                break;
            }
            len += c.len_utf8();
        }
        if len == 0 {
            return Err(self.error("expected expression"));
        }
        let content = &self.src[start..start + len];
        self.bump(len);
        Ok(content)
    }

    fn compile_expression_cmd(
        &self,
        definition: &mut BlockDefinition,
        expression: &str,
    ) -> Result<(), DecodeError> {
        let tokens = compile_expression(
            expression,
            self.line,
            &mut definition.token_dictionary,
            &mut definition.literal_pool,
        )?;
        definition.cmd_list.push(CMD_EVALUATE_EXPRESSION);
        definition.cmd_list.push(tokens.len() as u32);
        definition.cmd_list.extend_from_slice(&tokens);
        Ok(())
    }

    /// Compiles template arguments. The invoked block's declaration
    /// decides which arguments are types and which are expressions; type
    /// arguments push the type stack, expression arguments the value
    /// stack. Returned codes are in reverse argument order, matching the
    /// stack pop order at lookup time.
    fn compile_template_args(
        &self,
        definition: &mut BlockDefinition,
        schemata: &BinarySchemata,
        invoked_type: &str,
        args_src: &str,
    ) -> Result<Vec<u32>, DecodeError> {
        let args: Vec<&str> = split_top_level(args_src);
        if args.is_empty() {
            return Ok(Vec::new());
        }

        let target = schemata.find_block_definition(invoked_type).ok_or_else(|| {
            DecodeError::SchemaParse {
                line: self.line,
                message: format!(
                    "templated type {invoked_type} must be declared before use"
                ),
            }
        })?;
        let target_def = schemata.block_definition(target);
        if args.len() != target_def.template_parameter_names.len() {
            return Err(DecodeError::SchemaParse {
                line: self.line,
                message: format!(
                    "{invoked_type} expects {} template arguments, got {}",
                    target_def.template_parameter_names.len(),
                    args.len()
                ),
            });
        }
        let type_field = target_def.template_parameter_type_field;

        let mut codes_in_order = Vec::with_capacity(args.len());
        for (index, arg) in args.iter().enumerate() {
            if type_field & (1 << index) != 0 {
                let arg_type = definition.token_dictionary.intern(arg.trim());
                definition.cmd_list.push(CMD_LOOKUP_TYPE);
                definition.cmd_list.push(arg_type);
                definition.cmd_list.push(0);
                codes_in_order.push(TEMPLATE_PARAM_TYPENAME);
            } else {
                self.compile_expression_cmd(definition, arg.trim())?;
                codes_in_order.push(TEMPLATE_PARAM_EXPRESSION);
            }
        }
        codes_in_order.reverse();
        Ok(codes_in_order)
    }
}

fn split_top_level(src: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, c) in src.char_indices() {
        match c {
            '(' | '[' => depth += 1,
            ')' | ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(src[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }
    let tail = src[start..].trim();
    if !tail.is_empty() {
        parts.push(tail);
    }
    parts
}

/// Encodes a throw message into the command list: alternating runs of
/// packed characters (`len` word + chars, four per word) and negative
/// argument references (`-(index+1)`); a zero word terminates.
fn compile_throw_message(
    cmd_list: &mut Vec<u32>,
    message: &str,
    expr_count: u32,
) -> Result<(), String> {
    let mut rest = message;
    let mut used_placeholders = 0u32;
    while !rest.is_empty() {
        if let Some(stripped) = rest.strip_prefix("{}") {
            if used_placeholders >= expr_count {
                return Err("more {} placeholders than throw arguments".into());
            }
            cmd_list.push(-((used_placeholders + 1) as i32) as u32);
            used_placeholders += 1;
            rest = stripped;
            continue;
        }
        let next_placeholder = rest.find("{}").unwrap_or(rest.len());
        let segment = &rest[..next_placeholder];
        let bytes = segment.as_bytes();
        let word_count = bytes.len().div_ceil(4);
        cmd_list.push(word_count as u32);
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            cmd_list.push(u32::from_le_bytes(word));
        }
        rest = &rest[next_placeholder..];
    }
    cmd_list.push(0);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_blocks() {
        let schemata = BinarySchemata::parse(
            "block Item { uint32 a; uint32 b; }\n\
             block Outer { uint32 n; Item items[n]; }",
        )
        .unwrap();
        assert_eq!(schemata.block_count(), 2);
        let outer = schemata
            .block_definition(schemata.find_block_definition("Outer").unwrap());
        // n member, then items array with its length expression
        assert!(outer.cmd_list.contains(&CMD_INLINE_ARRAY_MEMBER));
        assert!(outer.cmd_list.contains(&CMD_EVALUATE_EXPRESSION));
    }

    #[test]
    fn test_parse_conditional_patches_jump() {
        let schemata =
            BinarySchemata::parse("block Foo { uint32 flag; if (flag) { uint32 payload; } }")
                .unwrap();
        let def = schemata.block_definition(0);
        let jump_pos = def
            .cmd_list
            .iter()
            .position(|&c| c == CMD_IF_FALSE_THEN_JUMP)
            .unwrap();
        let target = def.cmd_list[jump_pos + 1] as usize;
        assert!(target <= def.cmd_list.len());
        // jumping lands exactly at the end of the block body
        assert_eq!(target, def.cmd_list.len());
    }

    #[test]
    fn test_parse_alias_with_enum_decoder() {
        let schemata = BinarySchemata::parse(
            "alias char = uint8;\n\
             alias Kind = uint32 enum { Static = 1; Skinned = 2; };",
        )
        .unwrap();
        assert!(schemata.find_alias("char").is_some());
        let kind = schemata.alias(schemata.find_alias("Kind").unwrap());
        assert_eq!(kind.aliased_type, "uint32");
        assert_eq!(
            kind.decoder,
            Some(AliasDecoder::Enum(vec![
                (1, "Static".to_string()),
                (2, "Skinned".to_string())
            ]))
        );
    }

    #[test]
    fn test_parse_literals_table() {
        let schemata =
            BinarySchemata::parse("literals Magic { RIFF = 0x46464952; WAVE = 3; }").unwrap();
        let table = schemata.literal_table("Magic").unwrap();
        assert_eq!(table[0], ("RIFF".to_string(), 0x46464952));
        assert_eq!(schemata.resolve_literal_identifier("Magic.WAVE"), Some(3));
        assert_eq!(schemata.resolve_literal_identifier("Magic.FLAC"), None);
    }

    #[test]
    fn test_template_parameters() {
        let schemata = BinarySchemata::parse(
            "block Pair(typename T, count) { T values[count]; }\n\
             block Holder { uint32 n; Pair(uint16, 4) data; }",
        )
        .unwrap();
        let pair = schemata.block_definition(0);
        assert_eq!(pair.template_parameter_names.len(), 2);
        assert_eq!(pair.template_parameter_type_field, 0b01);

        let holder = schemata.block_definition(1);
        // the invocation pushes the type arg, evaluates the count
        // expression and then looks up Pair with two params
        assert!(holder.cmd_list.contains(&CMD_EVALUATE_EXPRESSION));
        let lookup_count = holder
            .cmd_list
            .iter()
            .filter(|&&c| c == CMD_LOOKUP_TYPE)
            .count();
        assert_eq!(lookup_count, 3); // u32 n, uint16 arg, Pair itself
    }

    #[test]
    fn test_templated_type_must_be_declared_first() {
        let result = BinarySchemata::parse("block Holder { Later(4) data; }");
        assert!(result.is_err());
    }

    #[test]
    fn test_comments_skipped() {
        let schemata = BinarySchemata::parse(
            "// leading comment\n\
             block A { /* inline */ uint32 x; }\n",
        )
        .unwrap();
        assert_eq!(schemata.block_count(), 1);
    }

    #[test]
    fn test_throw_statement_encoding() {
        let schemata = BinarySchemata::parse(
            "block F { uint32 v; if (v > 100) { throw \"value {} too large\", v; } }",
        )
        .unwrap();
        let def = schemata.block_definition(0);
        let throw_pos = def.cmd_list.iter().position(|&c| c == CMD_THROW).unwrap();
        assert_eq!(def.cmd_list[throw_pos + 1], 1); // one argument
    }
}
