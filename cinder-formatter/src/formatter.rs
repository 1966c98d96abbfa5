//! The binary pull-parser.
//!
//! [`BinaryFormatter`] walks a byte range guided by compiled block
//! definitions, surfacing a stream of [`Blob`] events. All `try_*`
//! methods are speculative: they return `Ok(None)` / `Ok(false)` when
//! the next blob does not match, leaving the formatter state untouched,
//! so a consumer can probe alternatives. Every read is bounds-checked;
//! over-reads raise a decoding error tagged with the block-context
//! string.

use std::sync::Arc;

use crate::DecodeError;
use crate::eval::{EvaluatedTypeToken, EvaluationContext, is_system_symbol};
use crate::expr::evaluate_expression;
use crate::schema::{
    BinarySchemata, BlockDefinitionId, CMD_EVALUATE_EXPRESSION, CMD_IF_FALSE_THEN_JUMP,
    CMD_INLINE_ARRAY_MEMBER, CMD_INLINE_INDIVIDUAL_MEMBER, CMD_LOOKUP_TYPE, CMD_POP_TYPE_STACK,
    CMD_THROW,
};
use crate::token::Token;
use crate::types::{TypeCat, TypeDesc, TypeHint, read_as_i64};

/// The observable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Blob {
    #[default]
    None,
    KeyedItem,
    ValueMember,
    BeginBlock,
    EndBlock,
    BeginArray,
    EndArray,
}

/// A raw POD value surfaced by [`BinaryFormatter::try_raw_value`].
#[derive(Debug, Clone, Copy)]
pub struct RawValue {
    pub offset: usize,
    pub len: usize,
    pub type_desc: TypeDesc,
    pub evaluated_type: EvaluatedTypeToken,
}

impl RawValue {
    pub fn bytes<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        &data[self.offset..self.offset + self.len]
    }

    pub fn as_i64(&self, data: &[u8], reversed_endian: bool) -> Option<i64> {
        read_as_i64(self.bytes(data), self.type_desc.type_cat, reversed_endian)
    }
}

#[derive(Debug, Clone)]
struct LocalValue {
    hash: u64,
    type_desc: TypeDesc,
    offset: usize,
    len: usize,
    reversed_endian: bool,
}

#[derive(Debug)]
struct BlockContext {
    schemata: Arc<BinarySchemata>,
    definition: BlockDefinitionId,
    block_name: String,
    cursor: usize,
    parsing_template_params: Vec<i64>,
    parsing_template_type_field: u32,
    type_stack: Vec<EvaluatedTypeToken>,
    value_stack: Vec<i64>,
    locals: Vec<LocalValue>,
    pending_array_members: u32,
    pending_array_type: EvaluatedTypeToken,
    pending_end_array: bool,
    terminate_with_end_block: bool,
}

/// Bounded scratch for re-parsing string locals as numerics.
const STRING_PARSE_BUDGET: usize = 1024;

/// Schema-guided reader over one byte range.
pub struct BinaryFormatter<'d, 'e> {
    data: &'d [u8],
    cursor: usize,
    eval: &'e mut EvaluationContext,
    block_stack: Vec<BlockContext>,
    queued_next: Blob,
    reversed_endian: bool,
}

impl<'d, 'e> BinaryFormatter<'d, 'e> {
    pub fn new(data: &'d [u8], eval: &'e mut EvaluationContext) -> Self {
        Self {
            data,
            cursor: 0,
            eval,
            block_stack: Vec::new(),
            queued_next: Blob::None,
            reversed_endian: false,
        }
    }

    /// Treat multi-byte locals as reversed endian when read back in
    /// expressions.
    pub fn set_reversed_endian(&mut self, reversed: bool) {
        self.reversed_endian = reversed;
    }

    pub fn evaluation_context(&mut self) -> &mut EvaluationContext {
        self.eval
    }

    /// Enters a block pattern at the current data position.
    pub fn push_pattern(
        &mut self,
        schemata: Arc<BinarySchemata>,
        definition: BlockDefinitionId,
        template_params: &[i64],
        template_type_field: u32,
    ) {
        self.queued_next = Blob::None;
        let block_name = schemata.block_definition_name(definition).to_string();
        self.block_stack.push(BlockContext {
            schemata,
            definition,
            block_name,
            cursor: 0,
            parsing_template_params: template_params.to_vec(),
            parsing_template_type_field: template_type_field,
            type_stack: Vec::new(),
            value_stack: Vec::new(),
            locals: Vec::new(),
            pending_array_members: 0,
            pending_array_type: 0,
            pending_end_array: false,
            terminate_with_end_block: false,
        });
    }

    /// Convenience entry point: looks up `block_name` and pushes it.
    pub fn push_pattern_by_name(
        &mut self,
        schemata: &Arc<BinarySchemata>,
        block_name: &str,
    ) -> Result<(), DecodeError> {
        let definition = schemata
            .find_block_definition(block_name)
            .ok_or_else(|| DecodeError::UnknownType(block_name.to_string()))?;
        self.push_pattern(schemata.clone(), definition, &[], 0);
        Ok(())
    }

    pub fn remaining_data(&self) -> &'d [u8] {
        &self.data[self.cursor..]
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Names of the open blocks, innermost first, joined with ` \ `.
    pub fn block_context_string(&self) -> String {
        self.block_stack
            .iter()
            .rev()
            .map(|b| b.block_name.as_str())
            .collect::<Vec<_>>()
            .join(" \\ ")
    }

    fn decode_error(&self, message: impl Into<String>) -> DecodeError {
        DecodeError::decode(message, self.block_context_string())
    }

    /// Advances through commands until an observable blob is available.
    pub fn peek_next(&mut self) -> Result<Blob, DecodeError> {
        if self.block_stack.is_empty() {
            return Ok(Blob::None);
        }
        if self.queued_next != Blob::None {
            return Ok(self.queued_next);
        }

        loop {
            let top = self.block_stack.last().expect("non-empty stack");
            if top.pending_array_members > 0 {
                let blob = if self.eval.evaluated_type(top.pending_array_type).is_pod() {
                    Blob::ValueMember
                } else {
                    Blob::BeginBlock
                };
                self.queued_next = blob;
                return Ok(blob);
            }
            if top.pending_end_array {
                self.queued_next = Blob::EndArray;
                return Ok(Blob::EndArray);
            }

            let schemata = top.schemata.clone();
            let definition_id = top.definition;
            let cursor = top.cursor;
            let definition = schemata.block_definition(definition_id);

            if cursor >= definition.cmd_list.len() {
                if top.terminate_with_end_block {
                    self.queued_next = Blob::EndBlock;
                    return Ok(Blob::EndBlock);
                }
                self.block_stack.pop();
                if self.block_stack.is_empty() {
                    return Ok(Blob::None);
                }
                continue;
            }

            let cmds = &definition.cmd_list;
            match cmds[cursor] {
                CMD_LOOKUP_TYPE => {
                    let base_name_token = cmds[cursor + 1];
                    let param_count = cmds[cursor + 2] as usize;
                    let codes: Vec<u32> =
                        cmds[cursor + 3..cursor + 3 + param_count].to_vec();
                    let top = self.block_stack.last_mut().expect("non-empty stack");
                    top.cursor += 3 + param_count;
                    let params = std::mem::take(&mut top.parsing_template_params);
                    let type_field = top.parsing_template_type_field;
                    let mut type_stack = std::mem::take(&mut top.type_stack);
                    let mut value_stack = std::mem::take(&mut top.value_stack);
                    let resolved = self.eval.lookup_type(
                        &schemata,
                        definition_id,
                        base_name_token,
                        &codes,
                        &mut type_stack,
                        &mut value_stack,
                        &params,
                        type_field,
                    );
                    let top = self.block_stack.last_mut().expect("non-empty stack");
                    top.parsing_template_params = params;
                    top.type_stack = type_stack;
                    top.value_stack = value_stack;
                    top.type_stack.push(resolved?);
                }
                CMD_POP_TYPE_STACK => {
                    let top = self.block_stack.last_mut().expect("non-empty stack");
                    top.cursor += 1;
                    top.type_stack.pop();
                }
                CMD_EVALUATE_EXPRESSION => {
                    let length = cmds[cursor + 1] as usize;
                    let tokens: Vec<u32> = cmds[cursor + 2..cursor + 2 + length].to_vec();
                    {
                        let top = self.block_stack.last_mut().expect("non-empty stack");
                        top.cursor += 2 + length;
                    }
                    let value = self.evaluate(&tokens, &schemata, definition_id)?;
                    let top = self.block_stack.last_mut().expect("non-empty stack");
                    top.value_stack.push(value);
                }
                CMD_INLINE_INDIVIDUAL_MEMBER | CMD_INLINE_ARRAY_MEMBER => {
                    self.queued_next = Blob::KeyedItem;
                    return Ok(Blob::KeyedItem);
                }
                CMD_IF_FALSE_THEN_JUMP => {
                    let jump_target = cmds[cursor + 1] as usize;
                    if jump_target > cmds.len() {
                        return Err(self.decode_error("jump point in conditional is invalid"));
                    }
                    let top = self.block_stack.last_mut().expect("non-empty stack");
                    let condition = top
                        .value_stack
                        .pop()
                        .ok_or_else(|| DecodeError::Expression("value stack underflow".into()))?;
                    if condition == 0 {
                        top.cursor = jump_target;
                    } else {
                        top.cursor += 3; // skip target + condition symbol
                    }
                }
                CMD_THROW => {
                    return Err(self.interpret_throw(&schemata, definition_id, cursor));
                }
                other => {
                    return Err(self.decode_error(format!(
                        "unexpected opcode {other} in command stream"
                    )));
                }
            }
        }
    }

    fn interpret_throw(
        &mut self,
        schemata: &Arc<BinarySchemata>,
        definition_id: BlockDefinitionId,
        cursor: usize,
    ) -> DecodeError {
        let definition = schemata.block_definition(definition_id);
        let cmds = &definition.cmd_list;
        let expr_count = cmds[cursor + 1] as usize;

        let mut evaled = Vec::with_capacity(expr_count);
        {
            let top = self.block_stack.last_mut().expect("non-empty stack");
            for _ in 0..expr_count {
                evaled.push(top.value_stack.pop().unwrap_or(0));
            }
            evaled.reverse(); // declaration order
        }

        let mut message = String::new();
        let mut at = cursor + 2;
        loop {
            let Some(&word) = cmds.get(at) else { break };
            at += 1;
            if word == 0 {
                break;
            }
            if (word as i32) < 0 {
                let index = (-(word as i32) - 1) as usize;
                if let Some(value) = evaled.get(index) {
                    message.push_str(&value.to_string());
                }
            } else {
                let word_count = word as usize;
                for chunk in &cmds[at..at + word_count] {
                    for byte in chunk.to_le_bytes() {
                        if byte != 0 {
                            message.push(byte as char);
                        }
                    }
                }
                at += word_count;
            }
        }
        self.decode_error(message)
    }

    /// Evaluates an expression against the current formatter state.
    fn evaluate(
        &mut self,
        tokens: &[u32],
        schemata: &Arc<BinarySchemata>,
        definition_id: BlockDefinitionId,
    ) -> Result<i64, DecodeError> {
        let definition = schemata.block_definition(definition_id);
        let data = self.data;
        let cursor = self.cursor;
        let block_stack = &self.block_stack;
        let eval = &*self.eval;
        let mut parse_budget = STRING_PARSE_BUDGET;

        let result = evaluate_expression(tokens, &definition.literal_pool, &mut |token: Token| {
            let name = definition.token_dictionary.as_string(token);
            let hash = definition.token_dictionary.as_hash(token);

            // system symbols, computed from the data cursor
            if is_system_symbol(name) {
                return Ok(match name {
                    "align2" => (cursor & 1) as i64,
                    "align4" => {
                        let rem = cursor & 3;
                        if rem == 0 { 0 } else { (4 - rem) as i64 }
                    }
                    "align8" => {
                        let rem = cursor & 7;
                        if rem == 0 { 0 } else { (8 - rem) as i64 }
                    }
                    "nullterm" => data[cursor..]
                        .iter()
                        .position(|&b| b == 0)
                        .unwrap_or(data.len() - cursor) as i64,
                    _ => (data.len() - cursor) as i64, // remainingbytes
                });
            }

            // previously evaluated members, innermost block first
            for block in block_stack.iter().rev() {
                if let Some(local) = block.locals.iter().find(|l| l.hash == hash) {
                    let bytes = &data[local.offset..local.offset + local.len];
                    if local.type_desc.type_hint == TypeHint::String
                        && matches!(local.type_desc.type_cat, TypeCat::UInt8 | TypeCat::Int8)
                    {
                        // lazily re-parse string content as a numeric,
                        // within the bounded scratch budget
                        if parse_budget < 8 {
                            return Err(
                                "string parsing budget exceeded in expression evaluation".into()
                            );
                        }
                        parse_budget -= 8;
                        let text = std::str::from_utf8(bytes)
                            .map_err(|_| "string local is not UTF-8".to_string())?;
                        let trimmed = text.trim_end_matches('\0').trim();
                        return trimmed
                            .parse::<i64>()
                            .or_else(|_| trimmed.parse::<f64>().map(|f| f as i64))
                            .map_err(|_| format!("cannot parse '{trimmed}' as a numeric"));
                    }
                    return read_as_i64(bytes, local.type_desc.type_cat, local.reversed_endian)
                        .ok_or_else(|| {
                            "value could not be cast to scalar integral".to_string()
                        });
                }

                // template parameters, only for the immediately enclosing
                // block
                if std::ptr::eq(block, block_stack.last().unwrap()) {
                    let block_def = block.schemata.block_definition(block.definition);
                    for (p, &param_name) in
                        block_def.template_parameter_names.iter().enumerate()
                    {
                        if block_def.token_dictionary.as_string(param_name) == name
                            && block.parsing_template_type_field & (1 << p) == 0
                        {
                            return Ok(block.parsing_template_params[p]);
                        }
                    }
                }
            }

            // globals on the evaluation context
            if let Some(value) = eval.global_parameter(hash) {
                return Ok(value);
            }

            // literal tables
            if let Some(value) = schemata.resolve_literal_identifier(name) {
                return Ok(value);
            }

            Err(format!("unknown identifier '{name}'"))
        });

        result.map_err(|e| {
            let rendered = crate::expr::expression_to_string(
                tokens,
                &definition.token_dictionary,
                &definition.literal_pool,
            );
            self.decode_error(format!("{e}, while evaluating [{rendered}]"))
        })
    }

    fn current_member(&self) -> Option<(u32, Token, EvaluatedTypeToken)> {
        let top = self.block_stack.last()?;
        if top.pending_array_members > 0 || top.pending_end_array {
            return None;
        }
        let definition = top.schemata.block_definition(top.definition);
        let cmds = &definition.cmd_list;
        let cmd = *cmds.get(top.cursor)?;
        if cmd != CMD_INLINE_INDIVIDUAL_MEMBER && cmd != CMD_INLINE_ARRAY_MEMBER {
            return None;
        }
        let name_token = cmds[top.cursor + 1];
        let type_token = *top.type_stack.last()?;
        Some((cmd, name_token, type_token))
    }

    /// Char-aliased arrays may compress their count into the value
    /// descriptor; this is the one alias-name-specific exception in the
    /// format.
    fn is_char_alias_compressible(&self, type_token: EvaluatedTypeToken) -> bool {
        let evaluated = self.eval.evaluated_type(type_token);
        if !evaluated.is_pod() || evaluated.value_type_desc.array_count > 1 {
            return false;
        }
        match (evaluated.alias, &evaluated.schemata) {
            (None, _) => true,
            (Some(alias), Some(schemata)) => schemata.alias_name(alias) == "char",
            _ => false,
        }
    }

    fn promote_keyed_item(&mut self) -> Option<Token> {
        let (cmd, name_token, type_token) = self.current_member()?;
        let is_block = !self.eval.evaluated_type(type_token).is_pod();
        self.queued_next = if cmd == CMD_INLINE_INDIVIDUAL_MEMBER {
            if is_block { Blob::BeginBlock } else { Blob::ValueMember }
        } else if self.is_char_alias_compressible(type_token) {
            Blob::ValueMember
        } else {
            Blob::BeginArray
        };
        Some(name_token)
    }

    /// Surfaces the next member name, promoting the queued blob to the
    /// member's value form.
    pub fn try_keyed_item(&mut self) -> Result<Option<String>, DecodeError> {
        if self.peek_next()? != Blob::KeyedItem {
            return Ok(None);
        }
        let Some(name_token) = self.promote_keyed_item() else {
            return Ok(None);
        };
        let top = self.block_stack.last().expect("non-empty stack");
        let definition = top.schemata.block_definition(top.definition);
        Ok(Some(definition.token_dictionary.as_string(name_token).to_string()))
    }

    /// As [`Self::try_keyed_item`], returning the name hash.
    pub fn try_keyed_item_hash(&mut self) -> Result<Option<u64>, DecodeError> {
        if self.peek_next()? != Blob::KeyedItem {
            return Ok(None);
        }
        let Some(name_token) = self.promote_keyed_item() else {
            return Ok(None);
        };
        let top = self.block_stack.last().expect("non-empty stack");
        let definition = top.schemata.block_definition(top.definition);
        Ok(Some(definition.token_dictionary.as_hash(name_token)))
    }

    /// Peeks the member name without consuming the KeyedItem state.
    pub fn try_peek_keyed_item(&mut self) -> Result<Option<String>, DecodeError> {
        let result = self.try_keyed_item()?;
        if result.is_some() {
            self.queued_next = Blob::KeyedItem;
        }
        Ok(result)
    }

    /// Enters a sub-block member, returning its evaluated type.
    pub fn try_begin_block(&mut self) -> Result<Option<EvaluatedTypeToken>, DecodeError> {
        if self.block_stack.is_empty() {
            return Ok(None);
        }
        if self.peek_next()? != Blob::BeginBlock {
            return Ok(None);
        }

        let top = self.block_stack.last().expect("non-empty stack");
        let (type_token, advance_member) = if top.pending_array_members == 0 {
            if top.pending_end_array {
                return Ok(None);
            }
            let Some((cmd, _, type_token)) = self.current_member() else {
                return Ok(None);
            };
            if cmd != CMD_INLINE_INDIVIDUAL_MEMBER {
                return Ok(None);
            }
            (type_token, true)
        } else {
            (top.pending_array_type, false)
        };

        let evaluated = self.eval.evaluated_type(type_token).clone();
        let Some(block_definition) = evaluated.block_definition else {
            return Ok(None);
        };
        let schemata = evaluated.schemata.clone().expect("block types carry schemata");

        {
            let top = self.block_stack.last_mut().expect("non-empty stack");
            if advance_member {
                top.cursor += 2;
            } else {
                top.pending_array_members -= 1;
            }
        }

        let block_name = schemata.block_definition_name(block_definition).to_string();
        self.block_stack.push(BlockContext {
            schemata,
            definition: block_definition,
            block_name,
            cursor: 0,
            parsing_template_params: evaluated.params.clone(),
            parsing_template_type_field: evaluated.param_type_field,
            type_stack: Vec::new(),
            value_stack: Vec::new(),
            locals: Vec::new(),
            pending_array_members: 0,
            pending_array_type: 0,
            pending_end_array: false,
            terminate_with_end_block: true,
        });
        self.queued_next = Blob::None;
        Ok(Some(type_token))
    }

    pub fn try_end_block(&mut self) -> Result<bool, DecodeError> {
        if self.block_stack.len() <= 1 {
            return Ok(false);
        }
        {
            let top = self.block_stack.last().expect("non-empty stack");
            if top.pending_array_members > 0 || top.pending_end_array {
                return Ok(false);
            }
        }
        if self.peek_next()? != Blob::EndBlock {
            return Ok(false);
        }
        self.block_stack.pop();
        self.queued_next = Blob::None;
        Ok(true)
    }

    /// Begins an array member, returning `(element count, element type)`.
    pub fn try_begin_array(&mut self) -> Result<Option<(u32, EvaluatedTypeToken)>, DecodeError> {
        if self.block_stack.is_empty() {
            return Ok(None);
        }
        self.peek_next()?;
        let Some((cmd, name_token, type_token)) = self.current_member() else {
            return Ok(None);
        };
        if cmd != CMD_INLINE_ARRAY_MEMBER {
            return Ok(None);
        }

        let element_desc = self.eval.evaluated_type(type_token).value_type_desc;
        let reversed = self.reversed_endian && element_desc.type_cat.size() > 1;
        let data_cursor = self.cursor;

        let top = self.block_stack.last_mut().expect("non-empty stack");
        let count = *top
            .value_stack
            .last()
            .ok_or_else(|| DecodeError::Expression("value stack underflow".into()))? as u32;
        top.pending_array_members = count;
        top.pending_array_type = type_token;
        top.pending_end_array = true;
        top.cursor += 2;
        top.value_stack.pop();

        if element_desc.type_cat != TypeCat::Void {
            let definition = top.schemata.block_definition(top.definition);
            let hash = definition.token_dictionary.as_hash(name_token);
            top.locals.push(LocalValue {
                hash,
                type_desc: element_desc,
                offset: data_cursor,
                len: element_desc.size().min(self.data.len() - data_cursor),
                reversed_endian: reversed,
            });
        }

        self.queued_next = Blob::None;
        Ok(Some((count, type_token)))
    }

    pub fn try_end_array(&mut self) -> Result<bool, DecodeError> {
        let Some(top) = self.block_stack.last_mut() else {
            return Ok(false);
        };
        if !top.pending_end_array || top.pending_array_members != 0 {
            return Ok(false);
        }
        top.pending_end_array = false;
        self.queued_next = Blob::None;
        Ok(true)
    }

    /// Reads the next POD value, advancing the data cursor.
    pub fn try_raw_value(&mut self) -> Result<Option<RawValue>, DecodeError> {
        if self.block_stack.is_empty() {
            return Ok(None);
        }
        self.peek_next()?;

        let top = self.block_stack.last().expect("non-empty stack");
        if top.pending_array_members == 0 {
            if top.pending_end_array {
                return Ok(None);
            }
            let Some((cmd, name_token, type_token)) = self.current_member() else {
                return Ok(None);
            };
            let evaluated = self.eval.evaluated_type(type_token).clone();
            if !evaluated.is_pod() {
                return Ok(None);
            }

            let mut final_desc = evaluated.value_type_desc;
            let is_array = cmd == CMD_INLINE_ARRAY_MEMBER;
            if is_array {
                if !self.is_char_alias_compressible(type_token) {
                    return Ok(None);
                }
                let count = *self
                    .block_stack
                    .last()
                    .unwrap()
                    .value_stack
                    .last()
                    .ok_or_else(|| DecodeError::Expression("value stack underflow".into()))?;
                final_desc.array_count = count.max(0) as u32;
                if evaluated.alias.is_some() || final_desc.type_hint == TypeHint::String {
                    final_desc.type_hint = TypeHint::String;
                }
            }

            let size = final_desc.size();
            if size > self.data.len() - self.cursor {
                let member = {
                    let top = self.block_stack.last().unwrap();
                    top.schemata
                        .block_definition(top.definition)
                        .token_dictionary
                        .as_string(name_token)
                        .to_string()
                };
                return Err(self.decode_error(format!(
                    "reads past the end of data while reading member: {member}"
                )));
            }

            let offset = self.cursor;
            let reversed = self.reversed_endian && final_desc.type_cat.size() > 1;
            let top = self.block_stack.last_mut().expect("non-empty stack");
            let hash = top
                .schemata
                .block_definition(top.definition)
                .token_dictionary
                .as_hash(name_token);
            top.locals.push(LocalValue {
                hash,
                type_desc: final_desc,
                offset,
                len: size,
                reversed_endian: reversed,
            });
            top.cursor += 2;
            if is_array {
                top.value_stack.pop();
            }
            self.cursor += size;
            self.queued_next = Blob::None;
            Ok(Some(RawValue {
                offset,
                len: size,
                type_desc: final_desc,
                evaluated_type: type_token,
            }))
        } else {
            let type_token = top.pending_array_type;
            let evaluated = self.eval.evaluated_type(type_token).clone();
            if !evaluated.is_pod() {
                return Ok(None);
            }
            let size = evaluated.value_type_desc.size();
            if size > self.data.len() - self.cursor {
                return Err(self.decode_error(
                    "reads past the end of data while reading array element",
                ));
            }
            let offset = self.cursor;
            self.cursor += size;
            let top = self.block_stack.last_mut().expect("non-empty stack");
            top.pending_array_members -= 1;
            self.queued_next = Blob::None;
            Ok(Some(RawValue {
                offset,
                len: size,
                type_desc: evaluated.value_type_desc,
                evaluated_type: type_token,
            }))
        }
    }

    /// Dynamic-local hashes visible at the current point, for fixed-size
    /// queries.
    fn dynamic_local_hashes(&self) -> Vec<u64> {
        self.block_stack
            .iter()
            .flat_map(|b| b.locals.iter().map(|l| l.hash))
            .collect()
    }

    /// Fixed size of a resolved type given the locals in scope.
    pub fn try_calculate_fixed_size(&mut self, type_token: EvaluatedTypeToken) -> Option<usize> {
        let locals = self.dynamic_local_hashes();
        self.eval.try_calculate_fixed_size(type_token, &locals)
    }

    /// Skips `count` elements of the open array, using the fixed-size
    /// fast path when element sizes are statically determinable.
    pub fn skip_array_elements(&mut self, count: u32) -> Result<(usize, usize), DecodeError> {
        let Some(top) = self.block_stack.last() else {
            return Err(self.decode_error("skip_array_elements on an uninitialized formatter"));
        };
        if count > top.pending_array_members {
            return Err(self.decode_error(
                "attempting to skip more array elements than remain",
            ));
        }
        let element_type = top.pending_array_type;

        if let Some(fixed) = self.try_calculate_fixed_size(element_type) {
            let total = fixed * count as usize;
            if total > self.data.len() - self.cursor {
                return Err(self.decode_error(
                    "reads past the end of data while skipping array elements",
                ));
            }
            let start = self.cursor;
            self.cursor += total;
            let top = self.block_stack.last_mut().expect("non-empty stack");
            top.pending_array_members -= count;
            self.queued_next = Blob::None;
            Ok((start, self.cursor))
        } else {
            let start = self.cursor;
            for _ in 0..count {
                self.skip_next_blob()?;
            }
            Ok((start, self.cursor))
        }
    }

    /// Recursively skips whatever blob is next, returning the consumed
    /// byte range.
    pub fn skip_next_blob(&mut self) -> Result<(usize, usize), DecodeError> {
        let start = self.cursor;
        match self.peek_next()? {
            Blob::BeginArray => {
                let (count, _) = self
                    .try_begin_array()?
                    .ok_or_else(|| self.decode_error("expected array"))?;
                self.skip_array_elements(count)?;
                if !self.try_end_array()? {
                    return Err(self.decode_error(
                        "expecting end array after skipping array elements",
                    ));
                }
                Ok((start, self.cursor))
            }
            Blob::BeginBlock => {
                let type_token = self
                    .try_begin_block()?
                    .ok_or_else(|| self.decode_error("expected block"))?;
                if let Some(fixed) = self.try_calculate_fixed_size(type_token) {
                    if fixed > self.data.len() - self.cursor {
                        return Err(self.decode_error(
                            "reads past the end of data while skipping block",
                        ));
                    }
                    self.cursor += fixed;
                    self.block_stack.pop();
                    self.queued_next = Blob::None;
                } else {
                    while self.peek_next()? != Blob::EndBlock {
                        self.skip_next_blob()?;
                    }
                    self.try_end_block()?;
                }
                Ok((start, self.cursor))
            }
            Blob::ValueMember => {
                let value = self
                    .try_raw_value()?
                    .ok_or_else(|| self.decode_error("expected value"))?;
                Ok((value.offset, value.offset + value.len))
            }
            Blob::KeyedItem => {
                self.try_keyed_item()?;
                let (_, end) = self.skip_next_blob()?;
                Ok((start, end))
            }
            _ => Err(self.decode_error("expecting array, block or member while skipping")),
        }
    }

    /// Raw cursor advance, bounds-checked.
    pub fn skip_bytes(&mut self, byte_count: usize) -> Result<&'d [u8], DecodeError> {
        if byte_count > self.data.len() - self.cursor {
            return Err(self.decode_error(
                "attempting to skip past more bytes than remain",
            ));
        }
        let start = self.cursor;
        self.cursor += byte_count;
        Ok(&self.data[start..self.cursor])
    }
}
