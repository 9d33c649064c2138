//! Type descriptors and the declaration parser.
//!
//! A type is written `BASE[.TAG][[N|NAME]]`; a full declaration is a list
//! whose first element is the type (or an alias) followed by attribute
//! sublists such as `{default 5}` or `nonzero`.

use std::{fmt, sync::Arc};

use crate::{
    AlienError, Context, Result, Value,
    attrs::{ATTRIBUTES, AttrFlags, ParseMode, lookup_attr},
    base_type::BaseType,
    encoding::Encoding,
    enums::EnumDef,
    structs::StructDescriptor,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArraySize {
    Scalar,
    Fixed(usize),
    /// Element count read at conversion time from the named sibling
    /// field or parameter.
    Dynamic(String),
}

impl ArraySize {
    pub fn is_array(&self) -> bool {
        !matches!(self, Self::Scalar)
    }
}

/// Exactly one tag kind is meaningful per base type.
#[derive(Debug, Clone)]
pub enum TypeTag {
    None,
    Struct(Arc<StructDescriptor>),
    Pointer(String),
    Encoding(Encoding),
}

impl PartialEq for TypeTag {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Struct(a), Self::Struct(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Pointer(a), Self::Pointer(b)) => a == b,
            (Self::Encoding(a), Self::Encoding(b)) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeDescriptor {
    pub base: BaseType,
    pub count: ArraySize,
    pub tag: TypeTag,
    /// Size of one element.
    pub base_size: usize,
}

impl TypeDescriptor {
    pub fn struct_def(&self) -> Option<&Arc<StructDescriptor>> {
        match &self.tag {
            TypeTag::Struct(sd) => Some(sd),
            _ => None,
        }
    }

    pub fn pointer_tag(&self) -> Option<&str> {
        match &self.tag {
            TypeTag::Pointer(tag) => Some(tag),
            _ => None,
        }
    }

    pub fn encoding(&self) -> Encoding {
        match &self.tag {
            TypeTag::Encoding(e) => *e,
            _ => Encoding::UTF8,
        }
    }

    pub fn element_alignment(&self) -> usize {
        match &self.tag {
            TypeTag::Struct(sd) => sd.alignment,
            _ => self.base.alignment(),
        }
    }

    /// True for types whose size is only known per instance.
    pub fn is_variable_size(&self) -> bool {
        matches!(self.count, ArraySize::Dynamic(_))
            || self.struct_def().is_some_and(|sd| sd.variable_size)
    }

    /// `(size, alignment)` for use as a struct field. Dynamic arrays have
    /// size zero at definition time.
    pub fn layout(&self) -> (usize, usize) {
        let align = self.element_alignment();
        let size = match &self.count {
            ArraySize::Scalar => self.base_size,
            ArraySize::Fixed(n) => self.base_size * n,
            ArraySize::Dynamic(_) => 0,
        };
        (size, align)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.base.token())?;
        match &self.tag {
            TypeTag::None => {}
            TypeTag::Struct(sd) => write!(f, ".{}", sd.name)?,
            TypeTag::Pointer(tag) => write!(f, ".{tag}")?,
            TypeTag::Encoding(e) => {
                if !matches!(self.base, BaseType::String | BaseType::Chars) || *e != Encoding::UTF8 {
                    write!(f, ".{}", e.name())?
                }
            }
        }
        match &self.count {
            ArraySize::Scalar => Ok(()),
            ArraySize::Fixed(n) => write!(f, "[{n}]"),
            ArraySize::Dynamic(name) => write!(f, "[{name}]"),
        }
    }
}

/// Value attached to a declaration depending on where it is used.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ModeValue {
    #[default]
    None,
    /// Default for a parameter or field.
    Default(Value),
    /// Handler command prefix for a return type.
    OnError(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeAndAttrs {
    pub ty: TypeDescriptor,
    pub flags: AttrFlags,
    pub extra: ModeValue,
    pub enum_def: Option<Arc<EnumDef>>,
}

impl TypeAndAttrs {
    pub fn new(ty: TypeDescriptor) -> Self {
        Self {
            ty,
            flags: AttrFlags::NONE,
            extra: ModeValue::None,
            enum_def: None,
        }
    }

    pub fn has(&self, flag: AttrFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn default_value(&self) -> Option<&Value> {
        match &self.extra {
            ModeValue::Default(v) => Some(v),
            _ => None,
        }
    }

    pub fn error_handler(&self) -> Option<&Value> {
        match &self.extra {
            ModeValue::OnError(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_output(&self) -> bool {
        self.flags.intersects(AttrFlags::OUTPUT)
    }

    /// Declaration text equivalent to this descriptor.
    pub fn describe(&self) -> String {
        let mut words = vec![Value::from(self.ty.to_string())];
        for name in self.flags.names() {
            let word = match name {
                "default" => Value::list([
                    Value::from(name),
                    self.default_value().cloned().unwrap_or_default(),
                ]),
                "onerror" => Value::list([
                    Value::from(name),
                    self.error_handler().cloned().unwrap_or_default(),
                ]),
                "enum" => Value::list([
                    Value::from(name),
                    Value::from(
                        self.enum_def.as_ref().map(|e| e.name.as_str()).unwrap_or(""),
                    ),
                ]),
                _ => Value::from(name),
            };
            words.push(word);
        }
        Value::List(words).to_string()
    }
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && !text.starts_with(|c: char| c.is_ascii_digit())
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':' || c == '-')
}

/// Splits `base[dim]` into the base text and its array size.
fn split_array(text: &str) -> Result<(&str, ArraySize)> {
    let Some(open) = text.find('[') else {
        return Ok((text, ArraySize::Scalar));
    };
    let Some(dim) = text[open + 1..].strip_suffix(']') else {
        return Err(AlienError::invalid(format!(
            "Invalid array size in type \"{text}\"."
        )));
    };
    let dim = dim.trim();
    let size = if let Ok(n) = dim.parse::<i64>() {
        if n <= 0 {
            return Err(AlienError::invalid(format!(
                "Array size must be positive in type \"{text}\"."
            )));
        }
        ArraySize::Fixed(n as usize)
    } else if is_identifier(dim) {
        ArraySize::Dynamic(dim.to_string())
    } else {
        return Err(AlienError::invalid(format!(
            "Invalid array size in type \"{text}\"."
        )));
    };
    Ok((&text[..open], size))
}

impl Context {
    /// Parses a bare type, without attributes and without alias lookup.
    pub fn parse_type(&self, text: &str) -> Result<TypeDescriptor> {
        let text = text.trim();
        let (base_text, count) = split_array(text)?;
        let (token, tag) = match base_text.split_once('.') {
            Some((token, tag)) => (token, Some(tag)),
            None => (base_text, None),
        };
        let base = BaseType::from_token(token).ok_or_else(|| {
            AlienError::invalid(format!("Invalid base type \"{token}\"."))
        })?;
        let tag = match (base, tag) {
            (BaseType::Struct, Some(name)) if !name.is_empty() => {
                TypeTag::Struct(self.structs.lookup(name)?)
            }
            (BaseType::Struct, _) => {
                return Err(AlienError::invalid(format!(
                    "Struct name missing in type \"{text}\"."
                )));
            }
            (BaseType::Pointer, Some(tag)) if !tag.is_empty() => {
                if !is_identifier(tag) {
                    return Err(AlienError::invalid(format!(
                        "Invalid pointer tag \"{tag}\"."
                    )));
                }
                TypeTag::Pointer(tag.to_string())
            }
            (BaseType::Pointer, _) => TypeTag::None,
            (BaseType::String | BaseType::Chars, Some(name)) if !name.is_empty() => {
                let enc = Encoding::from_name(name)
                    .ok_or_else(|| AlienError::not_found("Encoding", name))?;
                TypeTag::Encoding(enc)
            }
            (BaseType::String | BaseType::Chars, _) => {
                TypeTag::Encoding(self.info.system_encoding)
            }
            (_, Some(_)) => {
                return Err(AlienError::invalid(format!(
                    "Type \"{token}\" does not take a tag."
                )));
            }
            (_, None) => TypeTag::None,
        };
        if base.is_char_array() && !count.is_array() {
            return Err(AlienError::invalid(format!(
                "Type \"{token}\" requires an array size."
            )));
        }
        if count.is_array() && matches!(base, BaseType::Void | BaseType::Binary) {
            return Err(AlienError::invalid(format!(
                "Arrays of type \"{token}\" are not allowed."
            )));
        }
        if count.is_array()
            && let TypeTag::Struct(sd) = &tag
            && sd.variable_size
        {
            return Err(AlienError::invalid(format!(
                "Arrays of variable size struct \"{}\" are not allowed.",
                sd.name
            )));
        }
        let base_size = match &tag {
            TypeTag::Struct(sd) => sd.size,
            _ => base.size(),
        };
        if let ArraySize::Fixed(n) = &count
            && n.checked_mul(base_size).is_none_or(|size| size > isize::MAX as usize)
        {
            return Err(AlienError::invalid(format!(
                "Array type \"{text}\" is too large."
            )));
        }
        Ok(TypeDescriptor {
            base,
            count,
            tag,
            base_size,
        })
    }

    /// Parses a declaration list: a type or alias followed by attributes.
    pub fn parse_type_and_attrs(&self, decl: &Value, mode: ParseMode) -> Result<TypeAndAttrs> {
        let items = decl.as_list()?;
        let Some((type_item, attrs)) = items.split_first() else {
            return Err(AlienError::invalid("Empty type declaration."));
        };
        let type_text = type_item.to_string();
        let mut ta = self.resolve_type_text(&type_text)?;

        for attr in attrs {
            let words = attr.as_list()?;
            let Some((name, args)) = words.split_first() else {
                continue;
            };
            let name = name.to_string();
            let def = lookup_attr(&name).ok_or_else(|| {
                AlienError::invalid(format!("Unknown attribute \"{name}\"."))
            })?;
            if args.len() != def.nargs {
                return Err(AlienError::invalid(format!(
                    "Attribute \"{name}\" expects {} argument(s).",
                    def.nargs
                )));
            }
            if !def.legal_in(mode) {
                return Err(AlienError::invalid(format!(
                    "Attribute \"{name}\" is not valid for a {}.",
                    mode.describe()
                )));
            }
            if !ta.ty.base.allowed_attrs().contains(def.flag) {
                return Err(AlienError::invalid(format!(
                    "Attribute \"{name}\" is not valid for type \"{}\".",
                    ta.ty.base.token()
                )));
            }
            ta.flags = ta.flags.with(def.flag);
            for group in AttrFlags::EXCLUSIVE_GROUPS {
                if ta.flags.and(group).0.count_ones() > 1 {
                    return Err(AlienError::invalid(format!(
                        "Attribute \"{name}\" conflicts with \"{}\".",
                        ta.flags.and(group).without(def.flag)
                    )));
                }
            }
            match def.flag {
                AttrFlags::DEFAULT => ta.extra = ModeValue::Default(args[0].clone()),
                AttrFlags::ONERROR => ta.extra = ModeValue::OnError(args[0].clone()),
                AttrFlags::ENUM => {
                    ta.enum_def = Some(self.enums.lookup(&args[0].to_string())?);
                }
                _ => {}
            }
        }
        self.validate_type_and_attrs(&mut ta, mode)?;
        Ok(ta)
    }

    /// Resolves an alias, optionally with an array suffix, or parses a
    /// base type.
    fn resolve_type_text(&self, text: &str) -> Result<TypeAndAttrs> {
        if let Some(alias) = self.aliases.lookup(text) {
            return Ok((*alias).clone());
        }
        let (base_text, count) = split_array(text)?;
        if count.is_array()
            && let Some(alias) = self.aliases.lookup(base_text)
        {
            if alias.ty.count.is_array() {
                return Err(AlienError::invalid(format!(
                    "Alias \"{base_text}\" is already an array type."
                )));
            }
            let mut ta = (*alias).clone();
            ta.ty.count = count;
            return Ok(ta);
        }
        Ok(TypeAndAttrs::new(self.parse_type(text)?))
    }

    fn validate_type_and_attrs(&self, ta: &mut TypeAndAttrs, mode: ParseMode) -> Result<()> {
        let base = ta.ty.base;
        let flags = ta.flags;
        let text = ta.describe();
        let fail = |msg: &str| Err(AlienError::invalid(format!("{msg} in \"{text}\".")));

        // Aliases are parsed without a context, so their flags are checked
        // again where they are used.
        if let Some(def) = ATTRIBUTES
            .iter()
            .find(|def| flags.contains(def.flag) && !def.legal_in(mode))
        {
            return Err(AlienError::invalid(format!(
                "Attribute \"{}\" is not valid for a {}.",
                def.name,
                mode.describe()
            )));
        }

        if flags.intersects(AttrFlags::ERROR_SOURCE)
            && !flags.intersects(AttrFlags::REQUIREMENT)
            && !base.is_pointer_like()
        {
            return fail("Error reporting attributes require an error checking attribute");
        }
        if flags.contains(AttrFlags::NULLOK)
            && !base.is_pointer_like()
            && base != BaseType::Binary
            && !flags.contains(AttrFlags::BYREF)
        {
            return fail("The nullok attribute requires a pointer type or byref");
        }
        if flags.contains(AttrFlags::STRUCTSIZE) {
            if flags.contains(AttrFlags::DEFAULT) {
                return fail("The structsize attribute cannot have a default");
            }
            if ta.ty.count.is_array() {
                return fail("The structsize attribute requires a scalar");
            }
        }

        match mode {
            ParseMode::Any => {}
            ParseMode::Param => {
                if base == BaseType::Void {
                    return fail("Parameters cannot be void");
                }
                if flags.intersects(AttrFlags::OUTPUT) {
                    ta.flags = ta.flags.with(AttrFlags::BYREF);
                } else if !flags.contains(AttrFlags::IN) {
                    ta.flags = ta.flags.with(AttrFlags::IN);
                }
                let flags = ta.flags;
                if flags.intersects(AttrFlags::STORE) && !flags.intersects(AttrFlags::OUTPUT) {
                    return fail("Store attributes require an output parameter");
                }
                if flags.contains(AttrFlags::RETVAL) && flags.contains(AttrFlags::DEFAULT) {
                    return fail("A retval parameter cannot have a default");
                }
                if flags.intersects(AttrFlags::DISPOSE.with(AttrFlags::DISPOSEONSUCCESS))
                    && flags.contains(AttrFlags::OUT)
                {
                    return fail("Dispose attributes require an input pointer");
                }
                // Arrays and char buffers always travel as pointers.
                let by_value_aggregate = base == BaseType::Struct && !ta.ty.count.is_array();
                if flags.contains(AttrFlags::IN)
                    && !flags.contains(AttrFlags::BYREF)
                    && by_value_aggregate
                    && !self.backend.supports_struct_byval()
                {
                    return fail("Pass by value aggregates are not supported by this backend");
                }
                if base == BaseType::Struct
                    && ta.ty.is_variable_size()
                    && !flags.contains(AttrFlags::BYREF)
                {
                    return fail("Variable size structs must be passed byref");
                }
            }
            ParseMode::Return => {
                if ta.ty.count.is_array() {
                    return fail("Arrays are not valid return types");
                }
                if base.is_char_array() || base == BaseType::Binary {
                    return fail("Type is not valid as a return type");
                }
                if ta.ty.is_variable_size() {
                    return fail("Variable size types are not valid return types");
                }
                if base == BaseType::Void && flags.intersects(AttrFlags::REQUIREMENT) {
                    return fail("Void functions cannot have error checks");
                }
                if base == BaseType::Struct
                    && !flags.contains(AttrFlags::BYREF)
                    && !self.backend.supports_struct_byval()
                {
                    return fail("Struct return by value is not supported by this backend");
                }
            }
            ParseMode::Field => {
                if matches!(base, BaseType::Void | BaseType::Binary) {
                    return fail("Type is not valid for a struct field");
                }
            }
        }
        Ok(())
    }

    /// Summary of a declaration: size, alignment, element count, base type
    /// and attributes.
    pub fn type_info(&self, decl: &Value, mode: ParseMode) -> Result<Value> {
        let ta = self.parse_type_and_attrs(decl, mode)?;
        let (size, align) = ta.ty.layout();
        let count = match &ta.ty.count {
            ArraySize::Scalar => Value::Int(-1),
            ArraySize::Fixed(n) => Value::from(*n),
            ArraySize::Dynamic(name) => Value::from(name.as_str()),
        };
        let tag = match &ta.ty.tag {
            TypeTag::None => Value::Empty,
            TypeTag::Struct(sd) => Value::from(sd.name.as_str()),
            TypeTag::Pointer(t) => Value::from(t.as_str()),
            TypeTag::Encoding(e) => Value::from(e.name()),
        };
        Ok(Value::dict([
            ("size", Value::from(size)),
            ("alignment", Value::from(align)),
            ("count", count),
            ("basetype", Value::from(ta.ty.base.token())),
            ("tag", tag),
            ("attributes", Value::list(ta.flags.names().into_iter().map(Value::from))),
            ("definition", Value::from(ta.describe())),
        ]))
    }

    /// Integer limits of an integer base type.
    pub fn limits(&self, type_text: &str) -> Result<(i128, i128)> {
        let ta = self.resolve_type_text(type_text)?;
        ta.ty.base.integer_bounds().ok_or_else(|| {
            AlienError::invalid(format!("Type \"{type_text}\" is not an integer type."))
        })
    }
}
