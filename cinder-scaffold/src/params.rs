//! Named parameter collections for material machines.
//!
//! A [`ParamBox`] is an ordered set of `(name, value)` pairs keyed by the
//! 64-bit name hash. Material machines serialize parameter boxes into a
//! flat byte form inside `Attach*` records; the resolver also merges
//! boxes when walking material inheritance chains (later wins).

use crate::ScaffoldError;
use crate::hash::hash64;

/// A typed parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f32),
    Float2([f32; 2]),
    Float3([f32; 3]),
    Float4([f32; 4]),
    String(String),
}

impl ParamValue {
    fn type_code(&self) -> u32 {
        match self {
            ParamValue::Bool(_) => 1,
            ParamValue::Int(_) => 2,
            ParamValue::Float(_) => 3,
            ParamValue::Float2(_) => 4,
            ParamValue::Float3(_) => 5,
            ParamValue::Float4(_) => 6,
            ParamValue::String(_) => 7,
        }
    }

    fn payload(&self) -> Vec<u8> {
        match self {
            ParamValue::Bool(v) => vec![*v as u8],
            ParamValue::Int(v) => v.to_le_bytes().to_vec(),
            ParamValue::Float(v) => v.to_le_bytes().to_vec(),
            ParamValue::Float2(v) => bytemuck::cast_slice(v).to_vec(),
            ParamValue::Float3(v) => bytemuck::cast_slice(v).to_vec(),
            ParamValue::Float4(v) => bytemuck::cast_slice(v).to_vec(),
            ParamValue::String(v) => v.as_bytes().to_vec(),
        }
    }

    fn decode(type_code: u32, payload: &[u8]) -> Result<Self, ScaffoldError> {
        let bad = || ScaffoldError::Container("malformed parameter payload".into());
        Ok(match type_code {
            1 => ParamValue::Bool(*payload.first().ok_or_else(bad)? != 0),
            2 => ParamValue::Int(i64::from_le_bytes(payload.try_into().map_err(|_| bad())?)),
            3 => ParamValue::Float(f32::from_le_bytes(payload.try_into().map_err(|_| bad())?)),
            4 => ParamValue::Float2(read_f32s(payload).ok_or_else(bad)?),
            5 => ParamValue::Float3(read_f32s(payload).ok_or_else(bad)?),
            6 => ParamValue::Float4(read_f32s(payload).ok_or_else(bad)?),
            7 => ParamValue::String(
                std::str::from_utf8(payload).map_err(|_| bad())?.to_string(),
            ),
            _ => return Err(bad()),
        })
    }
}

fn read_f32s<const N: usize>(payload: &[u8]) -> Option<[f32; N]> {
    if payload.len() != N * 4 {
        return None;
    }
    let mut out = [0.0f32; N];
    for (i, chunk) in payload.chunks_exact(4).enumerate() {
        out[i] = f32::from_le_bytes(chunk.try_into().unwrap());
    }
    Some(out)
}

/// Ordered parameter collection keyed by name hash.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamBox {
    entries: Vec<(u64, ParamValue)>,
}

impl ParamBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a parameter by name; replaces any existing entry.
    pub fn set(&mut self, name: &str, value: ParamValue) {
        self.set_hashed(hash64(name), value);
    }

    pub fn set_hashed(&mut self, hash: u64, value: ParamValue) {
        match self.entries.iter_mut().find(|(h, _)| *h == hash) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((hash, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.get_hashed(hash64(name))
    }

    pub fn get_hashed(&self, hash: u64) -> Option<&ParamValue> {
        self.entries.iter().find(|(h, _)| *h == hash).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &ParamValue)> {
        self.entries.iter().map(|(h, v)| (*h, v))
    }

    /// Overlays `other` on top of this box; entries in `other` win.
    pub fn merge_from(&mut self, other: &ParamBox) {
        for (hash, value) in &other.entries {
            self.set_hashed(*hash, value.clone());
        }
    }

    /// Flat byte form used inside material machine records:
    /// `u32 count`, then per entry
    /// `{ u64 hash; u32 type_code; u32 byte_len; bytes }`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (hash, value) in &self.entries {
            let payload = value.payload();
            bytes.extend_from_slice(&hash.to_le_bytes());
            bytes.extend_from_slice(&value.type_code().to_le_bytes());
            bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&payload);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScaffoldError> {
        fn take<'a>(
            bytes: &'a [u8],
            cursor: &mut usize,
            n: usize,
        ) -> Result<&'a [u8], ScaffoldError> {
            let slice = bytes
                .get(*cursor..*cursor + n)
                .ok_or_else(|| ScaffoldError::Container("malformed parameter box".into()))?;
            *cursor += n;
            Ok(slice)
        }
        let mut cursor = 0usize;

        let count = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap());
        let mut result = ParamBox::new();
        for _ in 0..count {
            let hash = u64::from_le_bytes(take(bytes, &mut cursor, 8)?.try_into().unwrap());
            let type_code = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap());
            let byte_len =
                u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap()) as usize;
            let payload = take(bytes, &mut cursor, byte_len)?;
            result.entries.push((hash, ParamValue::decode(type_code, payload)?));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_replace() {
        let mut params = ParamBox::new();
        params.set("Brightness", ParamValue::Int(33));
        params.set("Emissive", ParamValue::Float3([2.5, 0.25, 0.15]));
        assert_eq!(params.get("Brightness"), Some(&ParamValue::Int(33)));

        params.set("Brightness", ParamValue::Int(50));
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("Brightness"), Some(&ParamValue::Int(50)));
        assert_eq!(params.get("Absent"), None);
    }

    #[test]
    fn test_merge_later_wins() {
        let mut base = ParamBox::new();
        base.set("OnEverything", ParamValue::Int(75));
        base.set("MaterialDiffuse", ParamValue::Float3([0.1, 0.1, 0.1]));

        let mut derived = ParamBox::new();
        derived.set("MaterialDiffuse", ParamValue::Float3([1.0, 0.0, 0.0]));

        base.merge_from(&derived);
        assert_eq!(base.get("OnEverything"), Some(&ParamValue::Int(75)));
        assert_eq!(
            base.get("MaterialDiffuse"),
            Some(&ParamValue::Float3([1.0, 0.0, 0.0]))
        );
    }

    #[test]
    fn test_byte_round_trip() {
        let mut params = ParamBox::new();
        params.set("Flag", ParamValue::Bool(true));
        params.set("Count", ParamValue::Int(-3));
        params.set("Scale", ParamValue::Float(0.5));
        params.set("Tint", ParamValue::Float4([1.0, 0.5, 0.25, 1.0]));
        params.set("Texture", ParamValue::String("albedo.dds".into()));

        let decoded = ParamBox::from_bytes(&params.to_bytes()).unwrap();
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_truncated_bytes_rejected() {
        let mut params = ParamBox::new();
        params.set("A", ParamValue::Int(1));
        let bytes = params.to_bytes();
        assert!(ParamBox::from_bytes(&bytes[..bytes.len() - 2]).is_err());
    }
}
