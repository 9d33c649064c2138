//! Named integer constants used by the `enum` and `bitmask` attributes.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    AlienError, Context, Result, Value,
    host::{glob_match, qualify},
    value::parse_integer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDef {
    pub name: String,
    pub members: Vec<(String, i64)>,
}

impl EnumDef {
    pub fn value_of(&self, member: &str) -> Option<i64> {
        self.members
            .iter()
            .find(|(name, _)| name == member)
            .map(|(_, v)| *v)
    }

    pub fn name_of(&self, value: i64) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(name, _)| name.as_str())
    }

    /// Maps a member name or an integer literal to its value.
    pub fn resolve(&self, item: &Value) -> Result<i64> {
        if let Value::Str(s) = item
            && let Some(v) = self.value_of(s.trim())
        {
            return Ok(v);
        }
        let v = item.as_integer().map_err(|_| {
            AlienError::invalid_value(
                &format!("No such member of enum \"{}\".", self.name),
                item,
            )
        })?;
        i64::try_from(v).map_err(|_| AlienError::range("enum", item))
    }

    /// ORs together a list of member names and integer literals.
    pub fn mask(&self, items: &Value) -> Result<i64> {
        items
            .as_list()?
            .iter()
            .try_fold(0i64, |acc, item| Ok(acc | self.resolve(item)?))
    }

    /// Reverse bitmask mapping. Every member whose bits are all set is
    /// listed in definition order; bits not covered by any listed member
    /// are appended as a trailing integer.
    pub fn unmask(&self, value: i64) -> Vec<Value> {
        if value == 0 {
            return self
                .name_of(0)
                .map(|name| vec![Value::from(name)])
                .unwrap_or_default();
        }
        let mut covered = 0i64;
        let mut names = Vec::new();
        for (name, bits) in &self.members {
            if *bits != 0 && value & bits == *bits {
                names.push(Value::from(name.as_str()));
                covered |= bits;
            }
        }
        let residual = value & !covered;
        if residual != 0 {
            names.push(Value::Int(residual));
        }
        names
    }
}

/// Integer-to-value for the bitmask attribute without an enum.
pub fn mask_literals(items: &Value) -> Result<i64> {
    items.as_list()?.iter().try_fold(0i64, |acc, item| {
        let v = item.as_integer()?;
        let v = i64::try_from(v)
            .or_else(|_| u64::try_from(v).map(|u| u as i64))
            .map_err(|_| AlienError::range("bitmask", item))?;
        Ok(acc | v)
    })
}

#[derive(Default)]
pub struct EnumTable {
    enums: RwLock<HashMap<String, Arc<EnumDef>>>,
}

impl EnumTable {
    pub fn lookup(&self, name: &str) -> Result<Arc<EnumDef>> {
        self.enums
            .read()
            .get(&qualify(name))
            .cloned()
            .ok_or_else(|| AlienError::not_found("Enum", name))
    }

    fn insert(&self, def: EnumDef) -> Result<Arc<EnumDef>> {
        let mut enums = self.enums.write();
        if let Some(existing) = enums.get(&def.name) {
            if **existing == def {
                return Ok(existing.clone());
            }
            return Err(AlienError::exists("Enum", &def.name));
        }
        log::debug!("defining enum {} ({} members)", def.name, def.members.len());
        let def = Arc::new(def);
        enums.insert(def.name.clone(), def.clone());
        Ok(def)
    }
}

fn member_name(value: &Value) -> Result<String> {
    let name = value.to_string();
    if name.is_empty() || parse_integer(&name).is_some() {
        return Err(AlienError::invalid_value("Invalid enum member name.", value));
    }
    Ok(name)
}

impl Context {
    /// Defines an enum from a dict of member names to integer values.
    pub fn define_enum(&self, name: &str, members: &Value) -> Result<Arc<EnumDef>> {
        let mut out: Vec<(String, i64)> = Vec::new();
        for (member, value) in members.as_dict()? {
            let member = member_name(&Value::from(member))?;
            if out.iter().any(|(n, _)| *n == member) {
                return Err(AlienError::invalid(format!(
                    "Duplicate enum member \"{member}\"."
                )));
            }
            let v = value.as_integer()?;
            let v = i64::try_from(v).map_err(|_| AlienError::range("enum", &value))?;
            out.push((member, v));
        }
        self.enums.insert(EnumDef {
            name: qualify(name),
            members: out,
        })
    }

    /// Defines an enum whose members are successive powers of two.
    pub fn define_enum_flags(&self, name: &str, names: &Value) -> Result<Arc<EnumDef>> {
        let names = names.as_list()?;
        if names.len() > 63 {
            return Err(AlienError::invalid("Too many members for a flags enum."));
        }
        let members = names
            .iter()
            .enumerate()
            .map(|(i, n)| Ok((member_name(n)?, 1i64 << i)))
            .collect::<Result<Vec<_>>>()?;
        self.enums.insert(EnumDef {
            name: qualify(name),
            members,
        })
    }

    /// Defines an enum with consecutive values starting at `start`.
    pub fn define_enum_sequence(
        &self,
        name: &str,
        names: &Value,
        start: i64,
    ) -> Result<Arc<EnumDef>> {
        let members = names
            .as_list()?
            .iter()
            .enumerate()
            .map(|(i, n)| Ok((member_name(n)?, start + i as i64)))
            .collect::<Result<Vec<_>>>()?;
        self.enums.insert(EnumDef {
            name: qualify(name),
            members,
        })
    }

    pub fn enum_value(&self, name: &str, member: &str) -> Result<i64> {
        let def = self.enums.lookup(name)?;
        def.value_of(member)
            .ok_or_else(|| AlienError::not_found("Enum member", member))
    }

    /// Reverse lookup; falls back to `default` when given.
    pub fn enum_name(&self, name: &str, value: i64, default: Option<&str>) -> Result<String> {
        let def = self.enums.lookup(name)?;
        match (def.name_of(value), default) {
            (Some(n), _) => Ok(n.to_string()),
            (None, Some(d)) => Ok(d.to_string()),
            (None, None) => Err(AlienError::not_found("Enum value", &value.to_string())),
        }
    }

    pub fn enum_members(&self, name: &str) -> Result<Value> {
        let def = self.enums.lookup(name)?;
        Ok(Value::dict(
            def.members.iter().map(|(n, v)| (n.clone(), Value::Int(*v))),
        ))
    }

    pub fn enum_mask(&self, name: &str, members: &Value) -> Result<i64> {
        self.enums.lookup(name)?.mask(members)
    }

    pub fn enum_unmask(&self, name: &str, value: i64) -> Result<Value> {
        Ok(Value::List(self.enums.lookup(name)?.unmask(value)))
    }

    pub fn enum_list(&self, pattern: &str) -> Vec<String> {
        let pattern = qualify(pattern);
        let mut names: Vec<String> = self
            .enums
            .enums
            .read()
            .keys()
            .filter(|n| glob_match(&pattern, n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn enum_delete(&self, pattern: &str) -> usize {
        let pattern = qualify(pattern);
        let mut enums = self.enums.enums.write();
        let before = enums.len();
        enums.retain(|n, _| !glob_match(&pattern, n));
        before - enums.len()
    }
}
