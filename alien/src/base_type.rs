use std::mem::{align_of, size_of};

use libc::{c_long, c_ulong};

use crate::attrs::AttrFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Void,
    SChar,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Struct,
    Pointer,
    /// NUL terminated narrow string in a configurable encoding.
    String,
    /// NUL terminated UTF-32 string.
    UniString,
    /// NUL terminated UTF-16 string.
    WinString,
    /// Opaque byte buffer passed by address.
    Binary,
    Chars,
    UniChars,
    WinChars,
    Bytes,
}

const DIRECTIONS: AttrFlags = AttrFlags::DIRECTION.with(AttrFlags::BYREF);

const INTEGER_ATTRS: AttrFlags = DIRECTIONS
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::REQUIREMENT)
    .with(AttrFlags::ERROR_SOURCE)
    .with(AttrFlags::ENUM)
    .with(AttrFlags::BITMASK)
    .with(AttrFlags::STORE)
    .with(AttrFlags::STRUCTSIZE)
    .with(AttrFlags::DISCARD);

const FLOAT_ATTRS: AttrFlags = DIRECTIONS
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::STORE)
    .with(AttrFlags::DISCARD);

const STRUCT_ATTRS: AttrFlags = DIRECTIONS
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::STORE)
    .with(AttrFlags::DISCARD);

const POINTER_ATTRS: AttrFlags = DIRECTIONS
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::POINTER_SAFETY)
    .with(AttrFlags::REQUIREMENT)
    .with(AttrFlags::ERROR_SOURCE)
    .with(AttrFlags::STORE)
    .with(AttrFlags::DISCARD);

const STRING_ATTRS: AttrFlags = AttrFlags::IN
    .with(AttrFlags::BYREF)
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::NULLIFEMPTY)
    .with(AttrFlags::ERROR_SOURCE)
    .with(AttrFlags::DISCARD);

const BINARY_ATTRS: AttrFlags = AttrFlags::IN
    .with(AttrFlags::BYREF)
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::NULLOK)
    .with(AttrFlags::NULLIFEMPTY);

const CHAR_ARRAY_ATTRS: AttrFlags = DIRECTIONS
    .with(AttrFlags::DEFAULT)
    .with(AttrFlags::STORE);

impl BaseType {
    pub const ALL: [BaseType; 23] = [
        Self::Void,
        Self::SChar,
        Self::UChar,
        Self::Short,
        Self::UShort,
        Self::Int,
        Self::UInt,
        Self::Long,
        Self::ULong,
        Self::LongLong,
        Self::ULongLong,
        Self::Float,
        Self::Double,
        Self::Struct,
        Self::Pointer,
        Self::String,
        Self::UniString,
        Self::WinString,
        Self::Binary,
        Self::Chars,
        Self::UniChars,
        Self::WinChars,
        Self::Bytes,
    ];

    pub fn token(self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::SChar => "schar",
            Self::UChar => "uchar",
            Self::Short => "short",
            Self::UShort => "ushort",
            Self::Int => "int",
            Self::UInt => "uint",
            Self::Long => "long",
            Self::ULong => "ulong",
            Self::LongLong => "longlong",
            Self::ULongLong => "ulonglong",
            Self::Float => "float",
            Self::Double => "double",
            Self::Struct => "struct",
            Self::Pointer => "pointer",
            Self::String => "string",
            Self::UniString => "unistring",
            Self::WinString => "winstring",
            Self::Binary => "binary",
            Self::Chars => "chars",
            Self::UniChars => "unichars",
            Self::WinChars => "winchars",
            Self::Bytes => "bytes",
        }
    }

    pub fn from_token(token: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.token() == token)
    }

    /// Natural size of one element. Zero for `void` and `struct`.
    pub fn size(self) -> usize {
        match self {
            Self::Void | Self::Struct => 0,
            Self::SChar | Self::UChar | Self::Chars | Self::Bytes => 1,
            Self::Short | Self::UShort | Self::WinChars => 2,
            Self::Int | Self::UInt | Self::UniChars => 4,
            Self::Long => size_of::<c_long>(),
            Self::ULong => size_of::<c_ulong>(),
            Self::LongLong | Self::ULongLong => 8,
            Self::Float => 4,
            Self::Double => 8,
            Self::Pointer
            | Self::String
            | Self::UniString
            | Self::WinString
            | Self::Binary => size_of::<*const u8>(),
        }
    }

    pub fn alignment(self) -> usize {
        match self {
            Self::Void | Self::Struct => 1,
            Self::SChar | Self::UChar | Self::Chars | Self::Bytes => 1,
            Self::Short | Self::UShort | Self::WinChars => align_of::<i16>(),
            Self::Int | Self::UInt | Self::UniChars => align_of::<i32>(),
            Self::Long => align_of::<c_long>(),
            Self::ULong => align_of::<c_ulong>(),
            Self::LongLong | Self::ULongLong => align_of::<i64>(),
            Self::Float => align_of::<f32>(),
            Self::Double => align_of::<f64>(),
            Self::Pointer
            | Self::String
            | Self::UniString
            | Self::WinString
            | Self::Binary => align_of::<*const u8>(),
        }
    }

    pub fn is_integer(self) -> bool {
        self.integer_bounds().is_some()
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::SChar | Self::Short | Self::Int | Self::Long | Self::LongLong
        )
    }

    /// Inclusive bounds for integer types.
    pub fn integer_bounds(self) -> Option<(i128, i128)> {
        let signed = |bytes: usize| {
            let bits = bytes * 8;
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        };
        let unsigned = |bytes: usize| (0, (1i128 << (bytes * 8)) - 1);
        match self {
            Self::SChar | Self::Short | Self::Int | Self::Long | Self::LongLong => {
                Some(signed(self.size()))
            }
            Self::UChar
            | Self::UShort
            | Self::UInt
            | Self::ULong
            | Self::ULongLong => Some(unsigned(self.size())),
            _ => None,
        }
    }

    pub fn is_floating(self) -> bool {
        matches!(self, Self::Float | Self::Double)
    }

    /// Fixed size string-like buffers converted as a whole.
    pub fn is_char_array(self) -> bool {
        matches!(
            self,
            Self::Chars | Self::UniChars | Self::WinChars | Self::Bytes
        )
    }

    pub fn is_string(self) -> bool {
        matches!(self, Self::String | Self::UniString | Self::WinString)
    }

    /// Types whose native representation is an address that may be null.
    pub fn is_pointer_like(self) -> bool {
        matches!(self, Self::Pointer) || self.is_string()
    }

    /// Attributes that may ever be applied to this base type.
    pub fn allowed_attrs(self) -> AttrFlags {
        match self {
            Self::Void => AttrFlags::DISCARD,
            Self::SChar
            | Self::UChar
            | Self::Short
            | Self::UShort
            | Self::Int
            | Self::UInt
            | Self::Long
            | Self::ULong
            | Self::LongLong
            | Self::ULongLong => INTEGER_ATTRS,
            Self::Float | Self::Double => FLOAT_ATTRS,
            Self::Struct => STRUCT_ATTRS,
            Self::Pointer => POINTER_ATTRS,
            Self::String | Self::UniString | Self::WinString => STRING_ATTRS,
            Self::Binary => BINARY_ATTRS,
            Self::Chars | Self::UniChars | Self::WinChars | Self::Bytes => {
                CHAR_ARRAY_ATTRS
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_round_trip() {
        for base in BaseType::ALL {
            assert_eq!(BaseType::from_token(base.token()), Some(base));
        }
        assert_eq!(BaseType::from_token("char"), None);
    }

    #[test]
    fn integer_bounds_match_widths() {
        assert_eq!(BaseType::UChar.integer_bounds(), Some((0, 255)));
        assert_eq!(BaseType::SChar.integer_bounds(), Some((-128, 127)));
        assert_eq!(
            BaseType::ULongLong.integer_bounds(),
            Some((0, u64::MAX as i128))
        );
        assert_eq!(
            BaseType::Int.integer_bounds(),
            Some((i32::MIN as i128, i32::MAX as i128))
        );
        assert_eq!(BaseType::Double.integer_bounds(), None);
    }

    #[test]
    fn attribute_legality_by_type() {
        assert!(BaseType::Int.allowed_attrs().contains(AttrFlags::STRUCTSIZE));
        assert!(!BaseType::Double.allowed_attrs().contains(AttrFlags::NONZERO));
        assert!(!BaseType::String.allowed_attrs().contains(AttrFlags::OUT));
        assert!(BaseType::Pointer.allowed_attrs().contains(AttrFlags::DISPOSE));
        assert!(!BaseType::Chars.allowed_attrs().contains(AttrFlags::ENUM));
    }
}
