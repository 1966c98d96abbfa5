//! POD value descriptors.

/// Scalar category of a POD value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeCat {
    #[default]
    Void,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
}

impl TypeCat {
    pub fn size(self) -> usize {
        match self {
            TypeCat::Void => 0,
            TypeCat::Int8 | TypeCat::UInt8 => 1,
            TypeCat::Int16 | TypeCat::UInt16 => 2,
            TypeCat::Int32 | TypeCat::UInt32 | TypeCat::Float => 4,
            TypeCat::Int64 | TypeCat::UInt64 | TypeCat::Double => 8,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "void" => TypeCat::Void,
            "int8" | "i8" => TypeCat::Int8,
            "uint8" | "u8" => TypeCat::UInt8,
            "int16" | "i16" => TypeCat::Int16,
            "uint16" | "u16" | "float16" | "f16" => TypeCat::UInt16,
            "int32" | "i32" => TypeCat::Int32,
            "uint32" | "u32" => TypeCat::UInt32,
            "int64" | "i64" => TypeCat::Int64,
            "uint64" | "u64" => TypeCat::UInt64,
            "float32" | "f32" => TypeCat::Float,
            "float64" | "f64" => TypeCat::Double,
            _ => return None,
        })
    }
}

/// Presentation hint attached to a value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TypeHint {
    #[default]
    None,
    String,
}

/// A POD value descriptor: category, inline array count and hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeDesc {
    pub type_cat: TypeCat,
    pub array_count: u32,
    pub type_hint: TypeHint,
}

impl Default for TypeDesc {
    fn default() -> Self {
        Self {
            type_cat: TypeCat::Void,
            array_count: 1,
            type_hint: TypeHint::None,
        }
    }
}

impl TypeDesc {
    pub fn scalar(type_cat: TypeCat) -> Self {
        Self {
            type_cat,
            array_count: 1,
            type_hint: TypeHint::None,
        }
    }

    /// Total byte size: scalar size times array count.
    pub fn size(&self) -> usize {
        self.type_cat.size() * self.array_count.max(1) as usize
    }
}

/// Reads a value of the given category from little-endian bytes as i64.
///
/// Returns `None` when the bytes cannot represent the category (size
/// mismatch) - the cast-failure decode error path.
pub fn read_as_i64(bytes: &[u8], type_cat: TypeCat, reversed_endian: bool) -> Option<i64> {
    let mut scratch = [0u8; 8];
    let size = type_cat.size();
    if size == 0 || bytes.len() < size {
        return None;
    }
    scratch[..size].copy_from_slice(&bytes[..size]);
    if reversed_endian && size > 1 {
        scratch[..size].reverse();
    }
    Some(match type_cat {
        TypeCat::Void => return None,
        TypeCat::Int8 => scratch[0] as i8 as i64,
        TypeCat::UInt8 => scratch[0] as i64,
        TypeCat::Int16 => i16::from_le_bytes(scratch[..2].try_into().unwrap()) as i64,
        TypeCat::UInt16 => u16::from_le_bytes(scratch[..2].try_into().unwrap()) as i64,
        TypeCat::Int32 => i32::from_le_bytes(scratch[..4].try_into().unwrap()) as i64,
        TypeCat::UInt32 => u32::from_le_bytes(scratch[..4].try_into().unwrap()) as i64,
        TypeCat::Int64 => i64::from_le_bytes(scratch),
        TypeCat::UInt64 => i64::from_le_bytes(scratch),
        TypeCat::Float => f32::from_le_bytes(scratch[..4].try_into().unwrap()) as i64,
        TypeCat::Double => f64::from_le_bytes(scratch) as i64,
    })
}
