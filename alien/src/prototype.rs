//! Function prototypes: return type, named parameters and calling
//! convention, cached by qualified name.

use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::RwLock;

use crate::{
    AlienError, Context, Result, Value,
    attrs::{AttrFlags, ParseMode},
    host::{glob_match, qualify},
    types::{ArraySize, TypeAndAttrs},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConvention {
    #[default]
    Default,
    /// Resolves to the default convention where the target has no
    /// distinct stdcall.
    Stdcall,
}

impl CallConvention {
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "" | "default" | "cdecl" | "C" => Ok(Self::Default),
            "stdcall" | "winapi" => Ok(Self::Stdcall),
            other => Err(AlienError::invalid(format!(
                "Invalid calling convention \"{other}\"."
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Stdcall => "stdcall",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ta: TypeAndAttrs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionPrototype {
    pub name: String,
    pub ret: TypeAndAttrs,
    pub params: Vec<Param>,
    pub conv: CallConvention,
    /// Extra arguments beyond `params` are accepted as type/value pairs.
    pub varargs: bool,
}

impl FunctionPrototype {
    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params.iter().position(|p| p.name == name)
    }

    /// Number of arguments the caller supplies: retval parameters are
    /// produced by the call instead.
    pub fn supplied_params(&self) -> impl Iterator<Item = (usize, &Param)> {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.ta.has(AttrFlags::RETVAL))
    }

    pub fn retval_index(&self) -> Option<usize> {
        self.params.iter().position(|p| p.ta.has(AttrFlags::RETVAL))
    }
}

impl fmt::Display for FunctionPrototype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.ret.describe(), self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            let decl = p.ta.describe();
            if decl.contains(' ') {
                write!(f, "{{{decl}}} {}", p.name)?;
            } else {
                write!(f, "{decl} {}", p.name)?;
            }
        }
        if self.varargs {
            f.write_str(if self.params.is_empty() { "..." } else { ", ..." })?;
        }
        f.write_str(")")?;
        if self.conv != CallConvention::Default {
            write!(f, " {}", self.conv.name())?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct PrototypeTable {
    prototypes: RwLock<HashMap<String, Arc<FunctionPrototype>>>,
}

impl PrototypeTable {
    pub fn lookup(&self, name: &str) -> Result<Arc<FunctionPrototype>> {
        self.prototypes
            .read()
            .get(&qualify(name))
            .cloned()
            .ok_or_else(|| AlienError::not_found("Prototype", name))
    }
}

impl Context {
    /// Builds a prototype without caching it. `params` alternates names and
    /// declarations; a trailing `...` marks a variadic function.
    pub fn build_prototype(
        &self,
        name: &str,
        ret: &Value,
        params: &Value,
        conv: CallConvention,
    ) -> Result<FunctionPrototype> {
        let ret = self
            .parse_type_and_attrs(ret, ParseMode::Return)
            .map_err(|e| e.context("Return type:"))?;
        let mut items = params.as_list()?;
        let varargs = items.last().is_some_and(|v| v.to_string() == "...");
        if varargs {
            items.pop();
            if !self.backend.supports_varargs() {
                return Err(AlienError::invalid(
                    "Variadic functions are not supported by this backend.",
                ));
            }
        }
        if items.len() % 2 != 0 {
            return Err(AlienError::invalid(
                "Parameter list must alternate names and declarations.",
            ));
        }
        let mut out: Vec<Param> = Vec::with_capacity(items.len() / 2);
        for pair in items.chunks(2) {
            let pname = pair[0].to_string();
            if pname.is_empty() || out.iter().any(|p| p.name == pname) {
                return Err(AlienError::invalid(format!(
                    "Invalid or duplicate parameter name \"{pname}\"."
                )));
            }
            let ta = self
                .parse_type_and_attrs(&pair[1], ParseMode::Param)
                .map_err(|e| e.context(&format!("Parameter {pname}:")))?;
            out.push(Param { name: pname, ta });
        }
        if out.iter().filter(|p| p.ta.has(AttrFlags::RETVAL)).count() > 1 {
            return Err(AlienError::invalid(
                "At most one parameter may have the retval attribute.",
            ));
        }
        // Dynamic array sizes name a scalar integer sibling.
        for p in &out {
            let ArraySize::Dynamic(count_name) = &p.ta.ty.count else {
                continue;
            };
            let sibling = out.iter().find(|s| s.name == *count_name).ok_or_else(|| {
                AlienError::invalid(format!(
                    "Count parameter \"{count_name}\" for \"{}\" not found.",
                    p.name
                ))
            })?;
            if sibling.ta.ty.count.is_array()
                || !sibling.ta.ty.base.is_integer()
                || sibling.name == p.name
            {
                return Err(AlienError::invalid(format!(
                    "Count parameter \"{count_name}\" must be a scalar integer."
                )));
            }
        }
        Ok(FunctionPrototype {
            name: qualify(name),
            ret,
            params: out,
            conv,
            varargs,
        })
    }

    /// Caches a prototype under its qualified name. Redefinition is accepted
    /// only if identical.
    pub fn define_prototype(
        &self,
        name: &str,
        ret: &Value,
        params: &Value,
        conv: CallConvention,
    ) -> Result<Arc<FunctionPrototype>> {
        let proto = self.build_prototype(name, ret, params, conv)?;
        let mut prototypes = self.prototypes.prototypes.write();
        if let Some(existing) = prototypes.get(&proto.name) {
            if **existing == proto {
                return Ok(existing.clone());
            }
            return Err(AlienError::exists("Prototype", &proto.name));
        }
        log::debug!("defining prototype {proto}");
        let proto = Arc::new(proto);
        prototypes.insert(proto.name.clone(), proto.clone());
        Ok(proto)
    }

    pub fn prototype(&self, name: &str) -> Result<Arc<FunctionPrototype>> {
        self.prototypes.lookup(name)
    }

    pub fn prototype_list(&self, pattern: &str) -> Vec<String> {
        let pattern = qualify(pattern);
        let mut names: Vec<String> = self
            .prototypes
            .prototypes
            .read()
            .keys()
            .filter(|n| glob_match(&pattern, n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn prototype_delete(&self, pattern: &str) -> usize {
        let pattern = qualify(pattern);
        let mut prototypes = self.prototypes.prototypes.write();
        let before = prototypes.len();
        prototypes.retain(|n, _| !glob_match(&pattern, n));
        before - prototypes.len()
    }

    pub fn prototype_describe(&self, name: &str) -> Result<String> {
        Ok(self.prototypes.lookup(name)?.to_string())
    }
}
