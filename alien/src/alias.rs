//! Named type declarations.

use std::{collections::HashMap, sync::Arc};

use libc::c_long;
use parking_lot::RwLock;

use crate::{
    AlienError, Context, Result, Value,
    attrs::ParseMode,
    base_type::BaseType,
    host::{glob_match, qualify},
    types::TypeAndAttrs,
};

struct Alias {
    body: Value,
    parsed: Arc<TypeAndAttrs>,
}

#[derive(Default)]
pub struct AliasTable {
    aliases: RwLock<HashMap<String, Alias>>,
}

impl AliasTable {
    pub fn lookup(&self, name: &str) -> Option<Arc<TypeAndAttrs>> {
        self.aliases
            .read()
            .get(&qualify(name))
            .map(|a| a.parsed.clone())
    }
}

/// Signed integer token with the given byte width.
fn signed_token(bytes: usize) -> &'static str {
    match bytes {
        1 => "schar",
        2 => "short",
        4 => "int",
        _ if size_of::<c_long>() == bytes => "long",
        _ => "longlong",
    }
}

fn unsigned_token(bytes: usize) -> &'static str {
    match bytes {
        1 => "uchar",
        2 => "ushort",
        4 => "uint",
        _ if size_of::<c_long>() == bytes => "ulong",
        _ => "ulonglong",
    }
}

impl Context {
    /// Binds `name` to a declaration. Redefining with the same body is
    /// accepted silently.
    pub fn alias_define(&self, name: &str, decl: &Value) -> Result<()> {
        if BaseType::from_token(name).is_some() || name.contains(['.', '[', ']']) {
            return Err(AlienError::invalid(format!(
                "Invalid alias name \"{name}\"."
            )));
        }
        let parsed = self.parse_type_and_attrs(decl, ParseMode::Any)?;
        let qualified = qualify(name);
        let mut aliases = self.aliases.aliases.write();
        if let Some(existing) = aliases.get(&qualified) {
            if *existing.parsed == parsed {
                return Ok(());
            }
            return Err(AlienError::exists("Alias", &qualified));
        }
        log::debug!("defining alias {qualified} as {}", parsed.describe());
        aliases.insert(
            qualified,
            Alias {
                body: decl.clone(),
                parsed: Arc::new(parsed),
            },
        );
        Ok(())
    }

    pub fn alias_body(&self, name: &str) -> Result<Value> {
        self.aliases
            .aliases
            .read()
            .get(&qualify(name))
            .map(|a| a.body.clone())
            .ok_or_else(|| AlienError::not_found("Alias", name))
    }

    pub fn alias_list(&self, pattern: &str) -> Vec<String> {
        let pattern = qualify(pattern);
        let mut names: Vec<String> = self
            .aliases
            .aliases
            .read()
            .keys()
            .filter(|n| glob_match(&pattern, n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn alias_delete(&self, pattern: &str) -> usize {
        let pattern = qualify(pattern);
        let mut aliases = self.aliases.aliases.write();
        let before = aliases.len();
        aliases.retain(|n, _| !glob_match(&pattern, n));
        before - aliases.len()
    }

    /// Defines the C99 fixed width and POSIX size aliases for the current
    /// target.
    pub fn alias_load_standard(&self) -> Result<()> {
        let standard = [
            ("bool", "int"),
            ("int8_t", "schar"),
            ("uint8_t", "uchar"),
            ("int16_t", "short"),
            ("uint16_t", "ushort"),
            ("int32_t", "int"),
            ("uint32_t", "uint"),
            ("int64_t", signed_token(8)),
            ("uint64_t", unsigned_token(8)),
            ("size_t", unsigned_token(size_of::<usize>())),
            ("ssize_t", signed_token(size_of::<isize>())),
            ("intptr_t", signed_token(size_of::<isize>())),
            ("uintptr_t", unsigned_token(size_of::<usize>())),
            ("ptrdiff_t", signed_token(size_of::<isize>())),
        ];
        for (name, token) in standard {
            self.alias_define(name, &Value::from(token))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ArraySize, AttrFlags, ErrorCode};

    #[test]
    fn aliases_expand_in_declarations() {
        let ctx = Context::default();
        ctx.alias_define("HANDLE", &Value::from("pointer.HANDLE nullok"))
            .unwrap();
        let ta = ctx
            .parse_type_and_attrs(&Value::from("HANDLE"), ParseMode::Param)
            .unwrap();
        assert_eq!(ta.ty.pointer_tag(), Some("HANDLE"));
        assert!(ta.has(AttrFlags::NULLOK) && ta.has(AttrFlags::IN));
        let arr = ctx
            .parse_type_and_attrs(&Value::from("HANDLE[3]"), ParseMode::Field)
            .unwrap();
        assert_eq!(arr.ty.count, ArraySize::Fixed(3));
    }

    #[test]
    fn redefinition_rules() {
        let ctx = Context::default();
        ctx.alias_define("count_t", &Value::from("uint")).unwrap();
        ctx.alias_define("count_t", &Value::from("uint")).unwrap();
        let err = ctx.alias_define("count_t", &Value::from("int")).unwrap_err();
        assert_eq!(err.code, ErrorCode::Exists);
        assert!(ctx.alias_define("int", &Value::from("uint")).is_err());
        assert_eq!(ctx.alias_body("count_t").unwrap(), Value::from("uint"));
        assert_eq!(ctx.alias_delete("count*"), 1);
        assert_eq!(ctx.alias_body("count_t").unwrap_err().code, ErrorCode::NotFound);
    }

    #[test]
    fn alias_attributes_are_checked_where_used() {
        let ctx = Context::default();
        ctx.alias_define("status", &Value::from("int nonzero")).unwrap();
        assert!(
            ctx.parse_type_and_attrs(&Value::from("status"), ParseMode::Return)
                .is_ok()
        );
        assert!(
            ctx.parse_type_and_attrs(&Value::from("status"), ParseMode::Param)
                .is_err(),
            "nonzero is a return attribute"
        );
    }

    #[test]
    fn standard_aliases_have_expected_sizes() {
        let ctx = Context::default();
        ctx.alias_load_standard().unwrap();
        let size = |name: &str| {
            ctx.parse_type_and_attrs(&Value::from(name), ParseMode::Field)
                .unwrap()
                .ty
                .base_size
        };
        assert_eq!(size("uint8_t"), 1);
        assert_eq!(size("int64_t"), 8);
        assert_eq!(size("size_t"), size_of::<usize>());
        assert_eq!(ctx.alias_list("u*").len(), 5);
    }
}
