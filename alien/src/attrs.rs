//! Per-use attribute flags and the attribute legality table.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AttrFlags(pub u32);

impl AttrFlags {
    pub const NONE: Self = Self(0);

    pub const IN: Self = Self(1 << 0);
    pub const OUT: Self = Self(1 << 1);
    pub const INOUT: Self = Self(1 << 2);
    /// Output parameter whose value becomes the call result.
    pub const RETVAL: Self = Self(1 << 3);
    pub const BYREF: Self = Self(1 << 4);
    pub const DEFAULT: Self = Self(1 << 5);
    pub const NULLOK: Self = Self(1 << 6);
    pub const NULLIFEMPTY: Self = Self(1 << 7);

    pub const ZERO: Self = Self(1 << 8);
    pub const NONZERO: Self = Self(1 << 9);
    pub const NONNEGATIVE: Self = Self(1 << 10);
    pub const POSITIVE: Self = Self(1 << 11);

    pub const ERRNO: Self = Self(1 << 12);
    pub const LASTERROR: Self = Self(1 << 13);
    pub const WINERROR: Self = Self(1 << 14);
    pub const ONERROR: Self = Self(1 << 15);

    pub const ENUM: Self = Self(1 << 16);
    pub const BITMASK: Self = Self(1 << 17);

    pub const UNSAFE: Self = Self(1 << 18);
    pub const COUNTED: Self = Self(1 << 19);
    pub const DISPOSE: Self = Self(1 << 20);
    pub const DISPOSEONSUCCESS: Self = Self(1 << 21);

    pub const STOREONERROR: Self = Self(1 << 22);
    pub const STOREALWAYS: Self = Self(1 << 23);
    /// Field filled with the byte size of the enclosing struct.
    pub const STRUCTSIZE: Self = Self(1 << 24);
    pub const DISCARD: Self = Self(1 << 25);

    pub const DIRECTION: Self = Self(
        Self::IN.0 | Self::OUT.0 | Self::INOUT.0 | Self::RETVAL.0,
    );
    pub const OUTPUT: Self =
        Self(Self::OUT.0 | Self::INOUT.0 | Self::RETVAL.0);
    pub const POINTER_SAFETY: Self = Self(
        Self::UNSAFE.0
            | Self::COUNTED.0
            | Self::DISPOSE.0
            | Self::DISPOSEONSUCCESS.0,
    );
    pub const REQUIREMENT: Self = Self(
        Self::ZERO.0 | Self::NONZERO.0 | Self::NONNEGATIVE.0 | Self::POSITIVE.0,
    );
    pub const ERROR_SOURCE: Self = Self(
        Self::ERRNO.0 | Self::LASTERROR.0 | Self::WINERROR.0 | Self::ONERROR.0,
    );
    pub const STORE: Self = Self(Self::STOREONERROR.0 | Self::STOREALWAYS.0);

    /// Groups whose members are mutually exclusive.
    pub const EXCLUSIVE_GROUPS: [Self; 5] = [
        Self::DIRECTION,
        Self::POINTER_SAFETY,
        Self::REQUIREMENT,
        Self::ERROR_SOURCE,
        Self::STORE,
    ];

    #[inline(always)]
    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[inline(always)]
    pub const fn intersects(self, flags: Self) -> bool {
        self.0 & flags.0 != 0
    }

    #[inline(always)]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }

    #[inline(always)]
    pub const fn without(self, flag: Self) -> Self {
        Self(self.0 & !flag.0)
    }

    #[inline(always)]
    pub const fn and(self, mask: Self) -> Self {
        Self(self.0 & mask.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn names(self) -> Vec<&'static str> {
        ATTRIBUTES
            .iter()
            .filter(|def| self.contains(def.flag))
            .map(|def| def.name)
            .collect()
    }
}

impl fmt::Display for AttrFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.names().join(" "))
    }
}

/// Where a type declaration is being parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseMode {
    Param,
    Return,
    Field,
    /// Alias bodies; context rules are applied when the alias is used.
    Any,
}

impl ParseMode {
    const fn bit(self) -> u8 {
        match self {
            Self::Param => PARAM,
            Self::Return => RETURN,
            Self::Field => FIELD,
            Self::Any => PARAM | RETURN | FIELD,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Param => "parameter",
            Self::Return => "return type",
            Self::Field => "struct field",
            Self::Any => "type alias",
        }
    }
}

const PARAM: u8 = 1;
const RETURN: u8 = 2;
const FIELD: u8 = 4;

pub struct AttrDef {
    pub name: &'static str,
    pub flag: AttrFlags,
    /// Number of list elements following the attribute name.
    pub nargs: usize,
    modes: u8,
}

impl AttrDef {
    pub fn legal_in(&self, mode: ParseMode) -> bool {
        mode == ParseMode::Any || self.modes & mode.bit() != 0
    }
}

const fn attr(name: &'static str, flag: AttrFlags, nargs: usize, modes: u8) -> AttrDef {
    AttrDef {
        name,
        flag,
        nargs,
        modes,
    }
}

pub static ATTRIBUTES: &[AttrDef] = &[
    attr("in", AttrFlags::IN, 0, PARAM),
    attr("out", AttrFlags::OUT, 0, PARAM),
    attr("inout", AttrFlags::INOUT, 0, PARAM),
    attr("retval", AttrFlags::RETVAL, 0, PARAM),
    attr("byref", AttrFlags::BYREF, 0, PARAM | RETURN),
    attr("default", AttrFlags::DEFAULT, 1, PARAM | FIELD),
    attr("nullok", AttrFlags::NULLOK, 0, PARAM | RETURN | FIELD),
    attr("nullifempty", AttrFlags::NULLIFEMPTY, 0, PARAM | FIELD),
    attr("zero", AttrFlags::ZERO, 0, RETURN),
    attr("nonzero", AttrFlags::NONZERO, 0, RETURN),
    attr("nonnegative", AttrFlags::NONNEGATIVE, 0, RETURN),
    attr("positive", AttrFlags::POSITIVE, 0, RETURN),
    attr("errno", AttrFlags::ERRNO, 0, RETURN),
    attr("lasterror", AttrFlags::LASTERROR, 0, RETURN),
    attr("winerror", AttrFlags::WINERROR, 0, RETURN),
    attr("onerror", AttrFlags::ONERROR, 1, RETURN),
    attr("enum", AttrFlags::ENUM, 1, PARAM | RETURN | FIELD),
    attr("bitmask", AttrFlags::BITMASK, 0, PARAM | RETURN | FIELD),
    attr("unsafe", AttrFlags::UNSAFE, 0, PARAM | RETURN | FIELD),
    attr("counted", AttrFlags::COUNTED, 0, PARAM | RETURN | FIELD),
    attr("dispose", AttrFlags::DISPOSE, 0, PARAM),
    attr("disposeonsuccess", AttrFlags::DISPOSEONSUCCESS, 0, PARAM),
    attr("storeonerror", AttrFlags::STOREONERROR, 0, PARAM),
    attr("storealways", AttrFlags::STOREALWAYS, 0, PARAM),
    attr("structsize", AttrFlags::STRUCTSIZE, 0, FIELD),
    attr("discard", AttrFlags::DISCARD, 0, RETURN),
];

pub fn lookup_attr(name: &str) -> Option<&'static AttrDef> {
    ATTRIBUTES.iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_attribute_has_a_distinct_flag() {
        let mut seen = AttrFlags::NONE;
        for def in ATTRIBUTES {
            assert_eq!(def.flag.0.count_ones(), 1, "{} is not a single bit", def.name);
            assert!(!seen.intersects(def.flag), "{} reuses a bit", def.name);
            seen = seen.with(def.flag);
        }
    }

    #[test]
    fn mode_legality() {
        let def = lookup_attr("structsize").unwrap();
        assert!(def.legal_in(ParseMode::Field));
        assert!(!def.legal_in(ParseMode::Param));
        assert!(def.legal_in(ParseMode::Any));
        assert!(lookup_attr("bogus").is_none());
    }

    #[test]
    fn names_follow_table_order() {
        let flags = AttrFlags::NONZERO.with(AttrFlags::BYREF);
        assert_eq!(flags.to_string(), "byref nonzero");
    }
}
