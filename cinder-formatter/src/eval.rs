//! Evaluation context: resolved-type interning and size precomputation.
//!
//! Every distinct `(base definition, bound template parameters)` pair
//! resolves to one [`EvaluatedTypeToken`] for the lifetime of the
//! context. The context also owns the process-wide global parameters
//! used during decode and the cached fixed-size table; setting a global
//! invalidates the entire cache.

use std::sync::Arc;

use crate::DecodeError;
use crate::expr::evaluate_expression;
use crate::schema::{
    BinarySchemata, BlockDefinitionId, CMD_EVALUATE_EXPRESSION, CMD_IF_FALSE_THEN_JUMP,
    CMD_INLINE_ARRAY_MEMBER, CMD_INLINE_INDIVIDUAL_MEMBER, CMD_LOOKUP_TYPE, CMD_POP_TYPE_STACK,
    CMD_THROW, TEMPLATE_PARAM_EXPRESSION, TEMPLATE_PARAM_TYPENAME,
};
use crate::token::Token;
use crate::types::{TypeCat, TypeDesc, TypeHint};

/// Interned resolved-type handle.
pub type EvaluatedTypeToken = u32;

/// A resolved type: either a POD value descriptor or a block definition
/// plus bound template parameters.
#[derive(Debug, Clone)]
pub struct EvaluatedType {
    pub block_definition: Option<BlockDefinitionId>,
    pub alias: Option<usize>,
    /// Bound template parameters; type-kind entries hold an
    /// [`EvaluatedTypeToken`].
    pub params: Vec<i64>,
    /// Bit `n` set when `params[n]` is type-kind.
    pub param_type_field: u32,
    pub value_type_desc: TypeDesc,
    pub schemata: Option<Arc<BinarySchemata>>,
}

impl PartialEq for EvaluatedType {
    fn eq(&self, other: &Self) -> bool {
        self.block_definition == other.block_definition
            && self.alias == other.alias
            && self.params == other.params
            && self.param_type_field == other.param_type_field
            && self.value_type_desc == other.value_type_desc
            && match (&self.schemata, &other.schemata) {
                (None, None) => true,
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                _ => false,
            }
    }
}

impl EvaluatedType {
    fn pod(type_desc: TypeDesc) -> Self {
        Self {
            block_definition: None,
            alias: None,
            params: Vec::new(),
            param_type_field: 0,
            value_type_desc: type_desc,
            schemata: None,
        }
    }

    pub fn is_pod(&self) -> bool {
        self.block_definition.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SizeState {
    #[default]
    Uncalculated,
    Fixed(usize),
    Dynamic,
}

/// Memoises resolved types, per-scope lookups and fixed sizes.
///
/// Single-writer: concurrent decodes must each take their own context or
/// serialise access. Pass the context explicitly; it is never hidden in
/// a singleton.
#[derive(Debug, Default)]
pub struct EvaluationContext {
    evaluated_types: Vec<EvaluatedType>,
    /// `(schemata identity, scope)` -> per-token resolved type cache.
    cached_sub_evals: Vec<((usize, BlockDefinitionId), Vec<EvaluatedTypeToken>)>,
    size_states: Vec<SizeState>,
    globals: Vec<(u64, i64, String)>,
}

impl EvaluationContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns a resolved type.
    pub fn intern(&mut self, evaluated: EvaluatedType) -> EvaluatedTypeToken {
        if let Some(existing) = self.evaluated_types.iter().position(|t| *t == evaluated) {
            return existing as EvaluatedTypeToken;
        }
        self.evaluated_types.push(evaluated);
        (self.evaluated_types.len() - 1) as EvaluatedTypeToken
    }

    pub fn evaluated_type(&self, token: EvaluatedTypeToken) -> &EvaluatedType {
        &self.evaluated_types[token as usize]
    }

    /// Resolves a type by name, with bound template parameters.
    pub fn get_evaluated_type(
        &mut self,
        schemata: &Arc<BinarySchemata>,
        base_name: &str,
        params: &[i64],
        param_type_field: u32,
    ) -> Result<EvaluatedTypeToken, DecodeError> {
        if params.is_empty() {
            if let Some(type_cat) = TypeCat::from_name(base_name) {
                return Ok(self.intern(EvaluatedType::pod(TypeDesc::scalar(type_cat))));
            }
            if base_name == "char" {
                return Ok(self.intern(EvaluatedType::pod(TypeDesc {
                    type_cat: TypeCat::UInt8,
                    array_count: 1,
                    type_hint: TypeHint::String,
                })));
            }
        }

        if let Some(alias_id) = schemata.find_alias(base_name) {
            let aliased = schemata.alias(alias_id).aliased_type.clone();
            let aliased_token = self.get_evaluated_type(schemata, &aliased, &[], 0)?;
            let value_type_desc = self.evaluated_types[aliased_token as usize].value_type_desc;
            return Ok(self.intern(EvaluatedType {
                block_definition: None,
                alias: Some(alias_id),
                params: params.to_vec(),
                param_type_field,
                value_type_desc,
                schemata: Some(schemata.clone()),
            }));
        }

        let Some(block) = schemata.find_block_definition(base_name) else {
            return Err(DecodeError::UnknownType(base_name.to_string()));
        };
        Ok(self.intern(EvaluatedType {
            block_definition: Some(block),
            alias: None,
            params: params.to_vec(),
            param_type_field,
            value_type_desc: TypeDesc::default(),
            schemata: Some(schemata.clone()),
        }))
    }

    fn cached_evals_for(
        &mut self,
        schemata: &Arc<BinarySchemata>,
        scope: BlockDefinitionId,
    ) -> usize {
        let key = (Arc::as_ptr(schemata) as usize, scope);
        if let Some(index) = self.cached_sub_evals.iter().position(|(k, _)| *k == key) {
            return index;
        }
        let token_count = schemata.block_definition(scope).token_dictionary.len();
        self.cached_sub_evals
            .push((key, vec![EvaluatedTypeToken::MAX; token_count]));
        self.cached_sub_evals.len() - 1
    }

    /// Resolves the type named by a `LookupType` command, consuming
    /// template arguments from the type/value stacks.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_type(
        &mut self,
        schemata: &Arc<BinarySchemata>,
        scope: BlockDefinitionId,
        base_name_token: Token,
        param_type_codes: &[u32],
        type_stack: &mut Vec<EvaluatedTypeToken>,
        value_stack: &mut Vec<i64>,
        parsing_template_params: &[i64],
        parsing_template_type_field: u32,
    ) -> Result<EvaluatedTypeToken, DecodeError> {
        let definition = schemata.block_definition(scope);

        // template parameters of the enclosing block shadow type names
        for (index, &param_name) in definition.template_parameter_names.iter().enumerate() {
            if param_name == base_name_token
                && definition.template_parameter_type_field & (1 << index) != 0
            {
                if !param_type_codes.is_empty() {
                    return Err(DecodeError::Expression(
                        "using partial templates as template parameters is unsupported".into(),
                    ));
                }
                if parsing_template_type_field & (1 << index) == 0 {
                    return Err(DecodeError::Expression(
                        "type parameter bound to a value".into(),
                    ));
                }
                return Ok(parsing_template_params[index] as EvaluatedTypeToken);
            }
        }

        if !param_type_codes.is_empty() {
            // stack pops arrive in reverse argument order
            let count = param_type_codes.len();
            let mut params = vec![0i64; count];
            let mut type_field = 0u32;
            for (p, &code) in param_type_codes.iter().enumerate() {
                let slot = count - 1 - p;
                match code {
                    TEMPLATE_PARAM_TYPENAME => {
                        let value = type_stack.pop().ok_or_else(|| {
                            DecodeError::Expression("type stack underflow".into())
                        })?;
                        params[slot] = value as i64;
                        type_field |= 1 << slot;
                    }
                    TEMPLATE_PARAM_EXPRESSION => {
                        params[slot] = value_stack.pop().ok_or_else(|| {
                            DecodeError::Expression("value stack underflow".into())
                        })?;
                    }
                    other => {
                        return Err(DecodeError::Expression(format!(
                            "unknown template parameter code {other}"
                        )));
                    }
                }
            }
            let base_name = definition.token_dictionary.as_string(base_name_token).to_string();
            return self.get_evaluated_type(schemata, &base_name, &params, type_field);
        }

        // parameterless lookups hit the per-scope cache
        let cache_index = self.cached_evals_for(schemata, scope);
        if let Some(&cached) = self.cached_sub_evals[cache_index].1.get(base_name_token as usize)
            && cached != EvaluatedTypeToken::MAX
        {
            return Ok(cached);
        }
        let base_name = schemata
            .block_definition(scope)
            .token_dictionary
            .as_string(base_name_token)
            .to_string();
        let resolved = self.get_evaluated_type(schemata, &base_name, &[], 0)?;
        let cache_index = self.cached_evals_for(schemata, scope);
        let slot = &mut self.cached_sub_evals[cache_index].1;
        if (base_name_token as usize) < slot.len() {
            slot[base_name_token as usize] = resolved;
        }
        Ok(resolved)
    }

    /// Sets a process-wide decode parameter. Invalidates the entire
    /// cached-size table.
    pub fn set_global_parameter(&mut self, name: &str, value: i64) {
        let hash = xxhash_rust::xxh3::xxh3_64(name.as_bytes());
        match self.globals.iter_mut().find(|(h, _, _)| *h == hash) {
            Some(entry) => entry.1 = value,
            None => self.globals.push((hash, value, name.to_string())),
        }
        self.size_states.clear();
    }

    pub fn global_parameter(&self, hash: u64) -> Option<i64> {
        self.globals.iter().find(|(h, _, _)| *h == hash).map(|(_, v, _)| *v)
    }

    /// Attempts to compute a fixed byte size for a resolved type.
    ///
    /// Succeeds only when the size does not depend on the decoded data
    /// itself: any reference to a member value, system symbol or a name
    /// in `dynamic_locals` marks the type dynamic. Results are cached
    /// per token; deterministic for a given set of dynamic locals and
    /// globals.
    pub fn try_calculate_fixed_size(
        &mut self,
        token: EvaluatedTypeToken,
        dynamic_locals: &[u64],
    ) -> Option<usize> {
        if self.size_states.len() < self.evaluated_types.len() {
            self.size_states
                .resize(self.evaluated_types.len(), SizeState::Uncalculated);
        }
        match self.size_states[token as usize] {
            SizeState::Fixed(size) => return Some(size),
            SizeState::Dynamic => return None,
            SizeState::Uncalculated => {}
        }

        let result = self.calculate_fixed_size_uncached(token, dynamic_locals);
        if self.size_states.len() < self.evaluated_types.len() {
            self.size_states
                .resize(self.evaluated_types.len(), SizeState::Uncalculated);
        }
        self.size_states[token as usize] = match result {
            Some(size) => SizeState::Fixed(size),
            None => SizeState::Dynamic,
        };
        result
    }

    fn calculate_fixed_size_uncached(
        &mut self,
        token: EvaluatedTypeToken,
        dynamic_locals: &[u64],
    ) -> Option<usize> {
        let evaluated = self.evaluated_types[token as usize].clone();
        let Some(block_id) = evaluated.block_definition else {
            return Some(evaluated.value_type_desc.size());
        };
        let schemata = evaluated.schemata.clone()?;
        let definition = schemata.block_definition(block_id).clone();
        let cmds = &definition.cmd_list;

        let mut type_stack: Vec<EvaluatedTypeToken> = Vec::new();
        let mut value_stack: Vec<i64> = Vec::new();
        let mut local_members: Vec<Token> = Vec::new();
        let mut result_size = 0usize;

        let mut cursor = 0usize;
        while cursor < cmds.len() {
            match cmds[cursor] {
                CMD_LOOKUP_TYPE => {
                    let base_name_token = cmds[cursor + 1];
                    let param_count = cmds[cursor + 2] as usize;
                    let codes = &cmds[cursor + 3..cursor + 3 + param_count];
                    cursor += 3 + param_count;
                    let resolved = self
                        .lookup_type(
                            &schemata,
                            block_id,
                            base_name_token,
                            codes,
                            &mut type_stack,
                            &mut value_stack,
                            &evaluated.params,
                            evaluated.param_type_field,
                        )
                        .ok()?;
                    type_stack.push(resolved);
                }
                CMD_POP_TYPE_STACK => {
                    type_stack.pop();
                    cursor += 1;
                }
                CMD_EVALUATE_EXPRESSION => {
                    let length = cmds[cursor + 1] as usize;
                    let tokens = &cmds[cursor + 2..cursor + 2 + length];
                    cursor += 2 + length;

                    let mut uses_dynamic = false;
                    let value = evaluate_expression(tokens, &definition.literal_pool, &mut |ident| {
                        let name = definition.token_dictionary.as_string(ident);
                        let hash = definition.token_dictionary.as_hash(ident);
                        if is_system_symbol(name) {
                            uses_dynamic = true;
                            return Ok(1); // stand-in
                        }
                        if local_members.contains(&ident) {
                            uses_dynamic = true;
                            return Ok(0);
                        }
                        for (p, &param_name) in
                            definition.template_parameter_names.iter().enumerate()
                        {
                            if param_name == ident
                                && definition.template_parameter_type_field & (1 << p) == 0
                            {
                                return Ok(evaluated.params[p]);
                            }
                        }
                        if dynamic_locals.contains(&hash) {
                            uses_dynamic = true;
                            return Ok(1);
                        }
                        if let Some(value) = self.global_parameter(hash) {
                            return Ok(value);
                        }
                        if let Some(value) = schemata.resolve_literal_identifier(name) {
                            return Ok(value);
                        }
                        // unresolvable here; the full decode path may
                        // still resolve it, so treat as dynamic
                        uses_dynamic = true;
                        Ok(1)
                    })
                    .ok()?;
                    if uses_dynamic {
                        return None;
                    }
                    value_stack.push(value);
                }
                CMD_INLINE_INDIVIDUAL_MEMBER | CMD_INLINE_ARRAY_MEMBER => {
                    let is_array = cmds[cursor] == CMD_INLINE_ARRAY_MEMBER;
                    let member_token = cmds[cursor + 1];
                    cursor += 2;
                    let member_type = *type_stack.last()?;
                    let member_size = self.try_calculate_fixed_size(member_type, dynamic_locals)?;
                    if is_array {
                        let count = value_stack.pop()?;
                        result_size += member_size * count.max(0) as usize;
                    } else {
                        result_size += member_size;
                    }
                    local_members.push(member_token);
                }
                CMD_IF_FALSE_THEN_JUMP => {
                    let condition = value_stack.pop()?;
                    let jump_target = cmds[cursor + 1] as usize;
                    if jump_target > cmds.len() {
                        return None;
                    }
                    if condition == 0 {
                        cursor = jump_target;
                    } else {
                        cursor += 3; // skip target + condition symbol
                    }
                }
                CMD_THROW => {
                    // skip without throwing
                    let _expr_count = cmds[cursor + 1];
                    cursor += 2;
                    loop {
                        let word = *cmds.get(cursor)?;
                        cursor += 1;
                        if word == 0 {
                            break;
                        }
                        if (word as i32) > 0 {
                            cursor += word as usize;
                        }
                    }
                }
                _ => return None,
            }
        }
        Some(result_size)
    }
}

pub(crate) fn is_system_symbol(name: &str) -> bool {
    matches!(
        name,
        "align2" | "align4" | "align8" | "nullterm" | "remainingbytes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schemata(src: &str) -> Arc<BinarySchemata> {
        Arc::new(BinarySchemata::parse(src).unwrap())
    }

    #[test]
    fn test_pod_types_interned_once() {
        let schemata = schemata("block A { uint32 x; }");
        let mut ctx = EvaluationContext::new();
        let a = ctx.get_evaluated_type(&schemata, "uint32", &[], 0).unwrap();
        let b = ctx.get_evaluated_type(&schemata, "uint32", &[], 0).unwrap();
        assert_eq!(a, b);
        let c = ctx.get_evaluated_type(&schemata, "uint16", &[], 0).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_unknown_type_is_error() {
        let schemata = schemata("block A { uint32 x; }");
        let mut ctx = EvaluationContext::new();
        assert!(matches!(
            ctx.get_evaluated_type(&schemata, "Mystery", &[], 0),
            Err(DecodeError::UnknownType(_))
        ));
    }

    #[test]
    fn test_char_builtin_carries_string_hint() {
        let schemata = schemata("block A { uint32 x; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "char", &[], 0).unwrap();
        let evaluated = ctx.evaluated_type(token);
        assert_eq!(evaluated.value_type_desc.type_cat, TypeCat::UInt8);
        assert_eq!(evaluated.value_type_desc.type_hint, TypeHint::String);
    }

    #[test]
    fn test_fixed_size_simple_block() {
        let schemata = schemata("block Item { uint32 a; uint32 b; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "Item", &[], 0).unwrap();
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(8));
        // cached
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(8));
    }

    #[test]
    fn test_fixed_size_static_array() {
        let schemata = schemata("block Packet { uint16 header[4]; uint8 flags; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "Packet", &[], 0).unwrap();
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(9));
    }

    #[test]
    fn test_dynamic_size_when_length_reads_member() {
        let schemata = schemata("block Blob { uint32 n; uint8 data[n]; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "Blob", &[], 0).unwrap();
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), None);
    }

    #[test]
    fn test_template_value_parameter_in_size() {
        let schemata = schemata("block Fixed(count) { uint32 data[count]; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "Fixed", &[6], 0).unwrap();
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(24));
        // a different binding is a different evaluated type
        let other = ctx.get_evaluated_type(&schemata, "Fixed", &[2], 0).unwrap();
        assert_ne!(token, other);
        assert_eq!(ctx.try_calculate_fixed_size(other, &[]), Some(8));
    }

    #[test]
    fn test_global_mutation_invalidates_size_cache() {
        let schemata = schemata("block Conf { uint32 data[page_size]; }");
        let mut ctx = EvaluationContext::new();
        ctx.set_global_parameter("page_size", 4);
        let token = ctx.get_evaluated_type(&schemata, "Conf", &[], 0).unwrap();
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(16));

        ctx.set_global_parameter("page_size", 8);
        assert_eq!(ctx.try_calculate_fixed_size(token, &[]), Some(32));
    }

    #[test]
    fn test_dynamic_local_marks_dynamic() {
        let schemata = schemata("block D { uint32 data[outer_count]; }");
        let mut ctx = EvaluationContext::new();
        let token = ctx.get_evaluated_type(&schemata, "D", &[], 0).unwrap();
        let hash = xxhash_rust::xxh3::xxh3_64(b"outer_count");
        assert_eq!(ctx.try_calculate_fixed_size(token, &[hash]), None);
    }
}
