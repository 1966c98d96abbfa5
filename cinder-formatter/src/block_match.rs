//! Eager DOM-style capture over a formatter.
//!
//! [`BinaryBlockMatch`] drains a formatter into a flat member tree so
//! consumers can look members up by name instead of pulling events in
//! order. Useful for tooling and tests; the streaming API stays the hot
//! path.

use hashbrown::HashMap;

use crate::DecodeError;
use crate::eval::EvaluatedTypeToken;
use crate::formatter::{BinaryFormatter, Blob};
use crate::types::TypeDesc;

/// Index of a member within a match; the root pseudo-member is
/// `ROOT_PARENT`.
pub const ROOT_PARENT: usize = usize::MAX;

/// One captured member.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: String,
    pub parent: usize,
    pub evaluated_type: EvaluatedTypeToken,
    /// Byte range within the source data.
    pub data_start: usize,
    pub data_end: usize,
    /// Set for POD values.
    pub type_desc: Option<TypeDesc>,
    pub is_array: bool,
    pub array_count: u32,
}

/// A fully parsed block, with by-name member lookup.
#[derive(Debug, Default)]
pub struct BinaryBlockMatch {
    members: Vec<Member>,
    by_name: HashMap<(usize, String), usize>,
}

impl BinaryBlockMatch {
    /// Parses everything remaining in the formatter.
    pub fn new(formatter: &mut BinaryFormatter<'_, '_>) -> Result<Self, DecodeError> {
        let mut result = Self::default();
        let started_with_block = formatter.try_begin_block()?.is_some();
        result.parse_block(formatter, ROOT_PARENT)?;
        if started_with_block && !formatter.try_end_block()? {
            return Err(DecodeError::decode(
                "expecting end block",
                formatter.block_context_string(),
            ));
        }
        Ok(result)
    }

    fn parse_block(
        &mut self,
        formatter: &mut BinaryFormatter<'_, '_>,
        parent: usize,
    ) -> Result<(), DecodeError> {
        loop {
            match formatter.peek_next()? {
                Blob::KeyedItem => {
                    let name = formatter
                        .try_keyed_item()?
                        .expect("peeked KeyedItem");
                    self.parse_value(formatter, name, parent)?;
                }
                Blob::EndBlock | Blob::None => return Ok(()),
                other => {
                    return Err(DecodeError::decode(
                        format!("unexpected blob {other:?} in block"),
                        formatter.block_context_string(),
                    ));
                }
            }
        }
    }

    fn parse_value(
        &mut self,
        formatter: &mut BinaryFormatter<'_, '_>,
        name: String,
        parent: usize,
    ) -> Result<(), DecodeError> {
        if let Some(evaluated_type) = formatter.try_begin_block()? {
            let index = self.push_member(Member {
                name,
                parent,
                evaluated_type,
                data_start: formatter.position(),
                data_end: formatter.position(),
                type_desc: None,
                is_array: false,
                array_count: 0,
            });
            self.parse_block(formatter, index)?;
            if !formatter.try_end_block()? {
                return Err(DecodeError::decode(
                    "expected end block",
                    formatter.block_context_string(),
                ));
            }
            self.members[index].data_end = formatter.position();
            return Ok(());
        }

        if let Some(value) = formatter.try_raw_value()? {
            self.push_member(Member {
                name,
                parent,
                evaluated_type: value.evaluated_type,
                data_start: value.offset,
                data_end: value.offset + value.len,
                type_desc: Some(value.type_desc),
                is_array: false,
                array_count: 0,
            });
            return Ok(());
        }

        if let Some((count, evaluated_type)) = formatter.try_begin_array()? {
            let index = self.push_member(Member {
                name,
                parent,
                evaluated_type,
                data_start: formatter.position(),
                data_end: formatter.position(),
                type_desc: None,
                is_array: true,
                array_count: count,
            });
            for element in 0..count {
                self.parse_value(formatter, format!("<Element {element}>"), index)?;
            }
            self.members[index].data_end = formatter.position();
            if !formatter.try_end_array()? {
                return Err(DecodeError::decode(
                    "expected end array",
                    formatter.block_context_string(),
                ));
            }
            return Ok(());
        }

        Err(DecodeError::decode(
            "expected value type blob",
            formatter.block_context_string(),
        ))
    }

    fn push_member(&mut self, member: Member) -> usize {
        let index = self.members.len();
        self.by_name
            .insert((member.parent, member.name.clone()), index);
        self.members.push(member);
        index
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Root-level member by name.
    pub fn find(&self, name: &str) -> Option<&Member> {
        self.find_in(ROOT_PARENT, name)
    }

    /// Child member by name.
    pub fn find_in(&self, parent: usize, name: &str) -> Option<&Member> {
        self.by_name
            .get(&(parent, name.to_string()))
            .map(|&index| &self.members[index])
    }

    pub fn index_of(&self, member: &Member) -> usize {
        self.members
            .iter()
            .position(|m| std::ptr::eq(m, member))
            .expect("member belongs to this match")
    }
}
