//! Struct and union layout, conversion and native field access.
//!
//! Layout follows the C rules: each field is placed at the next multiple of
//! its alignment (capped by the pack value), the struct alignment is the
//! largest field alignment and the size is rounded up to it. A struct may
//! end in one variable length tail, either an array whose count lives in a
//! sibling integer field or a nested struct that itself has such a tail.

use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    AlienError, ArenaFrame, Context, PointerValue, Result, Value,
    attrs::{AttrFlags, ParseMode},
    codec::{buffer_count, read_int, resolve_count, write_int},
    host::{glob_match, qualify},
    types::{ArraySize, TypeAndAttrs},
    value::lookup,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub ta: TypeAndAttrs,
    pub offset: usize,
    /// Zero for a variable length array.
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDescriptor {
    pub name: String,
    pub fields: Vec<Field>,
    /// Size of an instance, with no tail elements for variable size
    /// structs.
    pub size: usize,
    /// Offset at which the variable tail begins. Equal to `size` for
    /// fixed structs.
    pub fixed_size: usize,
    pub alignment: usize,
    pub pack: usize,
    pub is_union: bool,
    /// Missing fields without a default are zero filled instead of
    /// rejected.
    pub clear: bool,
    pub variable_size: bool,
    /// Field holding the element count of a trailing array.
    pub count_field: Option<usize>,
    /// Field filled with the struct size.
    pub size_field: Option<usize>,
}

const PACK_VALUES: [usize; 6] = [0, 1, 2, 4, 8, 16];

impl StructDescriptor {
    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| AlienError::not_found("Field", name))
    }

    fn tail(&self) -> Option<&Field> {
        self.fields.last().filter(|_| self.variable_size)
    }

    /// Size of an instance whose variable tail holds `count` elements.
    /// Counts whose size does not fit the address space are rejected.
    pub fn size_for_count(&self, count: usize) -> Result<usize> {
        let Some(tail) = self.tail() else {
            return Ok(self.size);
        };
        let end = match tail.ta.ty.struct_def() {
            Some(inner) if inner.variable_size => {
                inner.size_for_count(count)?.checked_add(tail.offset)
            }
            _ => count
                .checked_mul(tail.ta.ty.base_size)
                .and_then(|bytes| bytes.checked_add(tail.offset)),
        };
        end.and_then(|end| end.max(self.fixed_size).checked_next_multiple_of(self.alignment))
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or_else(|| {
                AlienError::invalid(format!(
                    "Struct \"{}\" is too large for {count} tail elements.",
                    self.name
                ))
            })
    }

    /// Tail element count carried by a host value.
    pub fn count_from_value(&self, value: &Value) -> Result<usize> {
        let Some(tail) = self.tail() else {
            return Ok(0);
        };
        let pairs = value.as_dict()?;
        if let Some(inner) = tail.ta.ty.struct_def() {
            return match lookup(&pairs, &tail.name) {
                Some(nested) => inner.count_from_value(nested),
                None => Ok(0),
            };
        }
        let count_field = self.count_field.map(|i| &self.fields[i]);
        if let Some(cf) = count_field
            && let Some(v) = lookup(&pairs, &cf.name)
        {
            let n = v.as_integer()?;
            return usize::try_from(n).map_err(|_| AlienError::range("count", v));
        }
        // Without an explicit count the supplied elements decide.
        match lookup(&pairs, &tail.name) {
            Some(items) if tail.ta.ty.base.is_char_array() => buffer_count(&tail.ta, items),
            Some(items) => Ok(items.as_list()?.len()),
            None => Ok(0),
        }
    }

    /// Tail element count stored in a native instance.
    ///
    /// # Safety
    /// `src` must point to an instance of this struct.
    pub unsafe fn count_from_native(&self, src: *const u8) -> usize {
        let Some(tail) = self.tail() else {
            return 0;
        };
        if let Some(inner) = tail.ta.ty.struct_def() {
            return unsafe { inner.count_from_native(src.add(tail.offset)) };
        }
        let Some(cf) = self.count_field.map(|i| &self.fields[i]) else {
            unreachable!("variable length array without count field")
        };
        let n = unsafe { read_int(cf.ta.ty.base, src.add(cf.offset)) };
        usize::try_from(n).unwrap_or(0)
    }

    pub fn size_for_value(&self, value: &Value) -> Result<usize> {
        self.size_for_count(self.count_from_value(value)?)
    }

    /// # Safety
    /// `src` must point to an instance of this struct.
    pub unsafe fn size_for_native(&self, src: *const u8) -> Result<usize> {
        self.size_for_count(unsafe { self.count_from_native(src) })
    }

    /// Writes `count` into the count field, recursing into a nested tail.
    ///
    /// # Safety
    /// `dest` must point to an instance of this struct.
    unsafe fn store_count(&self, dest: *mut u8, count: usize) {
        let Some(tail) = self.tail() else { return };
        if let Some(inner) = tail.ta.ty.struct_def() {
            unsafe { inner.store_count(dest.add(tail.offset), count) };
        } else if let Some(cf) = self.count_field.map(|i| &self.fields[i]) {
            unsafe { write_int(cf.ta.ty.base, dest.add(cf.offset), count as i128) };
        }
    }

    /// Element count of field `index` in a native instance.
    unsafe fn field_count(&self, index: usize, src: *const u8) -> Result<Option<usize>> {
        let field = &self.fields[index];
        let dynamic = match field.ta.ty.count {
            ArraySize::Dynamic(_) => Some(unsafe { self.count_from_native(src) }),
            _ => None,
        };
        resolve_count(&field.ta, dynamic)
    }
}

#[derive(Default)]
pub struct StructTable {
    structs: RwLock<HashMap<String, Arc<StructDescriptor>>>,
}

impl StructTable {
    pub fn lookup(&self, name: &str) -> Result<Arc<StructDescriptor>> {
        self.structs
            .read()
            .get(&qualify(name))
            .cloned()
            .ok_or_else(|| AlienError::not_found("Struct", name))
    }

    fn insert(&self, sd: StructDescriptor) -> Result<Arc<StructDescriptor>> {
        let mut structs = self.structs.write();
        if let Some(existing) = structs.get(&sd.name) {
            if **existing == sd {
                return Ok(existing.clone());
            }
            return Err(AlienError::exists("Struct", &sd.name));
        }
        log::debug!(
            "defining {} {} size {} align {}",
            if sd.is_union { "union" } else { "struct" },
            sd.name,
            sd.size,
            sd.alignment
        );
        let sd = Arc::new(sd);
        structs.insert(sd.name.clone(), sd.clone());
        Ok(sd)
    }
}

/// Options for struct and union definitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructOptions {
    pub pack: usize,
    pub clear: bool,
}

impl Context {
    fn parse_fields(&self, fields: &Value) -> Result<Vec<(String, TypeAndAttrs)>> {
        let items = fields.as_list()?;
        if items.is_empty() || items.len() % 2 != 0 {
            return Err(AlienError::invalid(
                "Field list must be a non-empty list of name and type pairs.",
            ));
        }
        let mut out: Vec<(String, TypeAndAttrs)> = Vec::with_capacity(items.len() / 2);
        for pair in items.chunks(2) {
            let name = pair[0].to_string();
            if name.is_empty() || out.iter().any(|(n, _)| *n == name) {
                return Err(AlienError::invalid(format!(
                    "Invalid or duplicate field name \"{name}\"."
                )));
            }
            let ta = self
                .parse_type_and_attrs(&pair[1], ParseMode::Field)
                .map_err(|e| e.context(&format!("Field {name}:")))?;
            out.push((name, ta));
        }
        Ok(out)
    }

    fn layout(
        &self,
        name: &str,
        parsed: Vec<(String, TypeAndAttrs)>,
        options: StructOptions,
        is_union: bool,
    ) -> Result<StructDescriptor> {
        if !PACK_VALUES.contains(&options.pack) {
            return Err(AlienError::invalid(format!(
                "Invalid pack value {}.",
                options.pack
            )));
        }
        let last = parsed.len() - 1;
        let mut fields = Vec::with_capacity(parsed.len());
        let mut offset = 0usize;
        let mut alignment = 1usize;
        let mut size_field = None;
        let mut count_field = None;
        let mut variable_size = false;

        for (index, (fname, ta)) in parsed.iter().enumerate() {
            let (size, mut align) = ta.ty.layout();
            if options.pack > 0 {
                align = align.min(options.pack);
            }
            alignment = alignment.max(align);

            if ta.ty.is_variable_size() {
                if is_union {
                    return Err(AlienError::invalid(format!(
                        "Union field \"{fname}\" cannot be variable size."
                    )));
                }
                if index != last {
                    return Err(AlienError::invalid(format!(
                        "Variable size field \"{fname}\" must be the last field."
                    )));
                }
                if index == 0 {
                    return Err(AlienError::invalid(format!(
                        "Variable size field \"{fname}\" cannot be the only field."
                    )));
                }
                variable_size = true;
                if let ArraySize::Dynamic(count_name) = &ta.ty.count {
                    let ci = parsed[..last]
                        .iter()
                        .position(|(n, _)| n == count_name)
                        .ok_or_else(|| {
                            AlienError::invalid(format!(
                                "Count field \"{count_name}\" for \"{fname}\" not found."
                            ))
                        })?;
                    let count_ta = &parsed[ci].1;
                    if !count_ta.ty.base.is_integer() || count_ta.ty.count.is_array() {
                        return Err(AlienError::invalid(format!(
                            "Count field \"{count_name}\" must be a scalar integer."
                        )));
                    }
                    count_field = Some(ci);
                }
            }
            if ta.has(AttrFlags::STRUCTSIZE) {
                if size_field.is_some() {
                    return Err(AlienError::invalid(
                        "Only one field may have the structsize attribute.",
                    ));
                }
                size_field = Some(index);
            }

            let field_offset = if is_union {
                0
            } else {
                offset.next_multiple_of(align)
            };
            if is_union {
                offset = offset.max(size);
            } else if size > 0 {
                offset = field_offset + size;
            } else {
                offset = field_offset;
            }
            fields.push(Field {
                name: fname.clone(),
                ta: ta.clone(),
                offset: field_offset,
                size,
            });
        }
        if variable_size && size_field.is_some() {
            return Err(AlienError::invalid(
                "A variable size struct cannot have a structsize field.",
            ));
        }
        Ok(StructDescriptor {
            name: qualify(name),
            fields,
            size: offset.next_multiple_of(alignment),
            fixed_size: offset,
            alignment,
            pack: options.pack,
            is_union,
            clear: options.clear,
            variable_size,
            count_field,
            size_field,
        })
    }

    /// Defines a struct from alternating field names and declarations.
    /// Redefinition is accepted only if the layout is identical.
    pub fn define_struct(
        &self,
        name: &str,
        fields: &Value,
        options: StructOptions,
    ) -> Result<Arc<StructDescriptor>> {
        let parsed = self.parse_fields(fields)?;
        let sd = self.layout(name, parsed, options, false)?;
        self.structs.insert(sd)
    }

    pub fn define_union(
        &self,
        name: &str,
        fields: &Value,
        options: StructOptions,
    ) -> Result<Arc<StructDescriptor>> {
        let parsed = self.parse_fields(fields)?;
        let sd = self.layout(name, parsed, options, true)?;
        self.structs.insert(sd)
    }

    pub fn struct_descriptor(&self, name: &str) -> Result<Arc<StructDescriptor>> {
        self.structs.lookup(name)
    }

    pub fn struct_list(&self, pattern: &str) -> Vec<String> {
        let pattern = qualify(pattern);
        let mut names: Vec<String> = self
            .structs
            .structs
            .read()
            .keys()
            .filter(|n| glob_match(&pattern, n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Removes definitions from the table. Types and prototypes already
    /// referring to them keep their descriptor alive.
    pub fn struct_delete(&self, pattern: &str) -> usize {
        let pattern = qualify(pattern);
        let mut structs = self.structs.structs.write();
        let before = structs.len();
        structs.retain(|n, _| !glob_match(&pattern, n));
        before - structs.len()
    }

    /// # Safety
    /// `dest` must be valid for `sd.size_for_value(value)` bytes.
    pub(crate) unsafe fn struct_to_native(
        &self,
        sd: &StructDescriptor,
        value: &Value,
        dest: *mut u8,
        frame: Option<&ArenaFrame>,
    ) -> Result<()> {
        if sd.is_union {
            let bytes = value.as_bytes();
            if bytes.len() != sd.size {
                return Err(AlienError::invalid(format!(
                    "Union \"{}\" requires a binary value of {} bytes.",
                    sd.name, sd.size
                )));
            }
            unsafe { dest.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
            return Ok(());
        }
        let pairs = value.as_dict()?;
        let count = sd.count_from_value(value)?;
        if sd.clear {
            let size = sd.size_for_count(count)?;
            unsafe { dest.write_bytes(0, size) };
        }
        for (index, field) in sd.fields.iter().enumerate() {
            let at = unsafe { dest.add(field.offset) };
            if Some(index) == sd.size_field {
                unsafe { write_int(field.ta.ty.base, at, sd.size as i128) };
                continue;
            }
            if Some(index) == sd.count_field {
                let (_, hi) = field.ta.ty.base.integer_bounds().unwrap_or((0, 0));
                if count as i128 > hi {
                    return Err(AlienError::range(field.ta.ty.base.token(), &Value::from(count)));
                }
                unsafe { write_int(field.ta.ty.base, at, count as i128) };
                continue;
            }
            let supplied = lookup(&pairs, &field.name).or(field.ta.default_value());
            let Some(field_value) = supplied else {
                if sd.clear {
                    continue;
                }
                return Err(AlienError::invalid(format!(
                    "Field \"{}\" not specified and has no default.",
                    field.name
                )));
            };
            let dynamic = matches!(field.ta.ty.count, ArraySize::Dynamic(_)).then_some(count);
            let n = resolve_count(&field.ta, dynamic)?;
            unsafe {
                self.value_to_native(&field.ta, field_value, at, n, frame)
                    .map_err(|e| e.context(&format!("Field {}:", field.name)))?
            };
        }
        Ok(())
    }

    /// # Safety
    /// `src` must point to a complete instance of `sd`.
    pub(crate) unsafe fn struct_from_native(
        &self,
        sd: &StructDescriptor,
        src: *const u8,
    ) -> Result<Value> {
        if sd.is_union {
            let bytes = unsafe { std::slice::from_raw_parts(src, sd.size) };
            return Ok(Value::Bytes(bytes.to_vec()));
        }
        let mut pairs = Vec::with_capacity(sd.fields.len());
        for (index, field) in sd.fields.iter().enumerate() {
            let n = unsafe { sd.field_count(index, src)? };
            let v = unsafe { self.value_from_native(&field.ta, src.add(field.offset), n)? };
            pairs.push((field.name.clone(), v));
        }
        Ok(Value::Dict(pairs))
    }

    /// Validates a pointer to an instance of `sd`.
    fn struct_pointer(&self, sd: &StructDescriptor, ptr: &Value) -> Result<*mut u8> {
        let ptr = ptr.as_pointer()?;
        if ptr.is_null() {
            return Err(AlienError::null_not_allowed());
        }
        if !self.pointers.tag_compatible(ptr.tag.as_deref(), Some(&sd.name)) {
            return Err(AlienError::tag_mismatch(&sd.name, &Value::Pointer(ptr)));
        }
        self.pointers.check(&ptr)?;
        Ok(ptr.as_ptr())
    }

    fn allocate_instance(&self, sd: &StructDescriptor, size: usize) -> Result<PointerValue> {
        // SAFETY: calloc with a non-zero size
        let raw = unsafe { libc::calloc(1, size.max(1)) } as usize;
        if raw == 0 {
            return Err(AlienError::allocation(format!(
                "Could not allocate {size} bytes for struct \"{}\".",
                sd.name
            )));
        }
        let ptr = PointerValue::new(raw, Some(&sd.name));
        self.pointers.register(&ptr, false)?;
        Ok(ptr)
    }

    /// Allocates a native instance initialised from `value`.
    pub fn struct_new(&self, name: &str, value: &Value) -> Result<PointerValue> {
        let sd = self.structs.lookup(name)?;
        let ptr = self.allocate_instance(&sd, sd.size_for_value(value)?)?;
        if let Err(err) = unsafe { self.struct_to_native(&sd, value, ptr.as_ptr(), None) } {
            self.pointers.unregister(&ptr)?;
            // SAFETY: allocated above and never handed out
            unsafe { libc::free(ptr.as_ptr().cast()) };
            return Err(err);
        }
        Ok(ptr)
    }

    /// Allocates zeroed storage. For variable size structs `count` is the
    /// tail element count and is written to the count field; otherwise it
    /// is the number of consecutive instances.
    pub fn struct_allocate(&self, name: &str, count: usize) -> Result<PointerValue> {
        let sd = self.structs.lookup(name)?;
        if sd.variable_size {
            let ptr = self.allocate_instance(&sd, sd.size_for_count(count)?)?;
            unsafe { sd.store_count(ptr.as_ptr(), count) };
            Ok(ptr)
        } else {
            let size = sd
                .size
                .checked_mul(count.max(1))
                .filter(|&size| size <= isize::MAX as usize)
                .ok_or_else(|| {
                    AlienError::allocation(format!(
                        "Cannot allocate {count} instances of struct \"{}\".",
                        sd.name
                    ))
                })?;
            self.allocate_instance(&sd, size)
        }
    }

    pub fn struct_free(&self, ptr: &Value) -> Result<()> {
        let p = ptr.as_pointer()?;
        if p.is_null() {
            return Ok(());
        }
        self.pointers.unregister(&p)?;
        // SAFETY: registered pointers to struct instances come from calloc
        unsafe { libc::free(p.as_ptr().cast()) };
        Ok(())
    }

    pub fn struct_to_native_at(&self, name: &str, ptr: &Value, value: &Value) -> Result<()> {
        let sd = self.structs.lookup(name)?;
        let dest = self.struct_pointer(&sd, ptr)?;
        unsafe { self.struct_to_native(&sd, value, dest, None) }
    }

    pub fn struct_from_native_at(&self, name: &str, ptr: &Value) -> Result<Value> {
        let sd = self.structs.lookup(name)?;
        let src = self.struct_pointer(&sd, ptr)?;
        unsafe { self.struct_from_native(&sd, src) }
    }

    /// Reads one field, or one element of an array field.
    pub fn struct_get(
        &self,
        name: &str,
        ptr: &Value,
        field: &str,
        index: Option<usize>,
    ) -> Result<Value> {
        let sd = self.structs.lookup(name)?;
        let base = self.struct_pointer(&sd, ptr)?;
        let fi = sd.field_index(field)?;
        let f = &sd.fields[fi];
        let n = unsafe { sd.field_count(fi, base)? };
        let at = unsafe { base.add(f.offset) };
        match (index, n) {
            (None, n) => unsafe { self.value_from_native(&f.ta, at, n) },
            (Some(i), Some(n)) if !f.ta.ty.base.is_char_array() => {
                if i >= n {
                    return Err(AlienError::invalid(format!(
                        "Index {i} out of bounds for field \"{field}\"."
                    )));
                }
                unsafe { self.scalar_from_native(&f.ta, at.add(i * f.ta.ty.base_size)) }
            }
            (Some(_), _) => Err(AlienError::invalid(format!(
                "Field \"{field}\" is not an array."
            ))),
        }
    }

    /// Writes one field, or one element of an array field. The count and
    /// structsize fields are derived and cannot be set directly.
    pub fn struct_set(
        &self,
        name: &str,
        ptr: &Value,
        field: &str,
        value: &Value,
        index: Option<usize>,
    ) -> Result<()> {
        let sd = self.structs.lookup(name)?;
        let base = self.struct_pointer(&sd, ptr)?;
        let fi = sd.field_index(field)?;
        if Some(fi) == sd.count_field || Some(fi) == sd.size_field {
            return Err(AlienError::invalid(format!(
                "Field \"{field}\" is derived and cannot be set."
            )));
        }
        let f = &sd.fields[fi];
        if f.ta.ty.struct_def().is_some_and(|inner| inner.variable_size) {
            return Err(AlienError::invalid(format!(
                "Variable size field \"{field}\" cannot be set as a whole."
            )));
        }
        let n = unsafe { sd.field_count(fi, base)? };
        let at = unsafe { base.add(f.offset) };
        match (index, n) {
            (None, n) => unsafe { self.value_to_native(&f.ta, value, at, n, None) },
            (Some(i), Some(n)) if !f.ta.ty.base.is_char_array() => {
                if i >= n {
                    return Err(AlienError::invalid(format!(
                        "Index {i} out of bounds for field \"{field}\"."
                    )));
                }
                unsafe {
                    self.scalar_to_native(&f.ta, value, at.add(i * f.ta.ty.base_size), None)
                }
            }
            (Some(_), _) => Err(AlienError::invalid(format!(
                "Field \"{field}\" is not an array."
            ))),
        }
    }

    /// Unregistered pointer to a field of an instance.
    pub fn struct_field_pointer(
        &self,
        name: &str,
        ptr: &Value,
        field: &str,
        tag: Option<&str>,
    ) -> Result<PointerValue> {
        let sd = self.structs.lookup(name)?;
        let base = self.struct_pointer(&sd, ptr)?;
        let f = &sd.fields[sd.field_index(field)?];
        Ok(PointerValue::new(base as usize + f.offset, tag))
    }

    /// Serializes `value` into the exact native layout of the struct.
    pub fn struct_to_binary(&self, name: &str, value: &Value) -> Result<Vec<u8>> {
        let sd = self.structs.lookup(name)?;
        let size = sd.size_for_value(value)?;
        let mut buf = AlignedBuf::new(size)?;
        unsafe { self.struct_to_native(&sd, value, buf.as_mut_ptr(), None)? };
        Ok(buf.into_bytes(size))
    }

    pub fn struct_from_binary(&self, name: &str, bytes: &[u8]) -> Result<Value> {
        let sd = self.structs.lookup(name)?;
        let short = || {
            AlienError::invalid(format!(
                "Binary value of {} bytes is too short for struct \"{}\".",
                bytes.len(),
                sd.name
            ))
        };
        if bytes.len() < sd.size {
            return Err(short());
        }
        let mut buf = AlignedBuf::new(bytes.len())?;
        unsafe { buf.as_mut_ptr().copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        if unsafe { sd.size_for_native(buf.as_mut_ptr()) }? > bytes.len() {
            return Err(short());
        }
        unsafe { self.struct_from_native(&sd, buf.as_mut_ptr()) }
    }

    pub fn struct_size_for_count(&self, name: &str, count: usize) -> Result<usize> {
        self.structs.lookup(name)?.size_for_count(count)
    }

    pub fn struct_field_names(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .structs
            .lookup(name)?
            .fields
            .iter()
            .map(|f| f.name.clone())
            .collect())
    }

    pub fn struct_info(&self, name: &str) -> Result<Value> {
        let sd = self.structs.lookup(name)?;
        let fields = sd.fields.iter().map(|f| {
            (
                f.name.clone(),
                Value::dict([
                    ("offset", Value::from(f.offset)),
                    ("size", Value::from(f.size)),
                    ("definition", Value::from(f.ta.describe())),
                ]),
            )
        });
        Ok(Value::dict([
            ("size", Value::from(sd.size)),
            ("alignment", Value::from(sd.alignment)),
            ("pack", Value::from(sd.pack)),
            ("union", Value::from(sd.is_union as i64)),
            ("vla", Value::from(sd.variable_size as i64)),
            ("fields", Value::dict(fields)),
        ]))
    }
}

/// Heap buffer aligned for any scalar field.
struct AlignedBuf(Vec<u64>);

impl AlignedBuf {
    fn new(size: usize) -> Result<Self> {
        let words = size.div_ceil(8).max(1);
        let mut buf = Vec::new();
        buf.try_reserve_exact(words)
            .map_err(|_| AlienError::allocation(format!("Could not allocate {size} bytes.")))?;
        buf.resize(words, 0u64);
        Ok(Self(buf))
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr().cast()
    }

    fn into_bytes(self, size: usize) -> Vec<u8> {
        self.0.iter().flat_map(|w| w.to_ne_bytes()).take(size).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorCode;

    fn define(ctx: &Context, name: &str, fields: &str) -> Arc<StructDescriptor> {
        ctx.define_struct(name, &Value::from(fields), StructOptions::default())
            .unwrap()
    }

    #[test]
    fn natural_layout() {
        let ctx = Context::default();
        let sd = define(&ctx, "Mixed", "a uchar b int c short d double");
        let offsets: Vec<usize> = sd.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!(sd.size, 24);
        assert_eq!(sd.alignment, 8);
        let again = define(&ctx, "Mixed", "a uchar b int c short d double");
        assert!(Arc::ptr_eq(&sd, &again), "identical redefinition reuses descriptor");
        let err = ctx
            .define_struct("Mixed", &Value::from("a int"), StructOptions::default())
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Exists);
    }

    #[test]
    fn packed_layout() {
        let ctx = Context::default();
        let sd = ctx
            .define_struct(
                "Packed",
                &Value::from("a uchar b int c short"),
                StructOptions { pack: 1, clear: false },
            )
            .unwrap();
        let offsets: Vec<usize> = sd.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 1, 5]);
        assert_eq!(sd.size, 7);
        let bad = ctx.define_struct("P3", &Value::from("a int"), StructOptions { pack: 3, clear: false });
        assert!(bad.is_err());
    }

    #[test]
    fn union_layout() {
        let ctx = Context::default();
        let sd = ctx
            .define_union("U", &Value::from("i int d double c chars[12]"), StructOptions::default())
            .unwrap();
        assert!(sd.fields.iter().all(|f| f.offset == 0));
        assert_eq!(sd.size, 16);
        assert!(ctx.define_union("V", &Value::from("n int a int[n]"), StructOptions::default()).is_err());
    }

    #[test]
    fn vla_size_formula() {
        let ctx = Context::default();
        let sd = define(&ctx, "Counted", "count ushort values int[count]");
        assert!(sd.variable_size);
        assert_eq!(sd.fixed_size, 4);
        for n in [0, 1, 5] {
            assert_eq!(sd.size_for_count(n).unwrap(), sd.fixed_size + n * 4);
        }
        let value = Value::from("count 3 values {1 2 3}");
        assert_eq!(sd.size_for_value(&value).unwrap(), 16);
        let bytes = ctx.struct_to_binary("Counted", &value).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(unsafe { sd.size_for_native(bytes.as_ptr()) }.unwrap(), 16);
        let back = ctx.struct_from_binary("Counted", &bytes).unwrap();
        assert_eq!(back.to_string(), "count 3 values {1 2 3}");
    }

    #[test]
    fn oversized_tails_are_rejected() {
        let ctx = Context::default();
        let sd = define(&ctx, "Huge", "n ulonglong v int[n]");
        let count = 4_611_686_018_427_387_905usize;
        assert_eq!(sd.size_for_count(count).unwrap_err().code, ErrorCode::InvalidValue);
        let value = Value::from(format!("n {count} v {{}}"));
        assert!(ctx.struct_to_binary("Huge", &value).is_err());

        let mut bytes = vec![0u8; 16];
        bytes[..8].copy_from_slice(&(count as u64).to_ne_bytes());
        assert!(ctx.struct_from_binary("Huge", &bytes).is_err());
        bytes[..8].copy_from_slice(&3u64.to_ne_bytes());
        assert!(ctx.struct_from_binary("Huge", &bytes).is_err(), "too short for three");

        define(&ctx, "Pair", "a int b int");
        let err = ctx.struct_allocate("Pair", usize::MAX / 4).unwrap_err();
        assert_eq!(err.code, ErrorCode::Allocation);
        assert!(ctx.struct_allocate("Huge", count).is_err());
    }

    #[test]
    fn nested_vla_size_formula() {
        let ctx = Context::default();
        let inner = define(&ctx, "InnerVLA", "n uint data double[n]");
        let outer = define(&ctx, "Outer", "shrt ushort nested struct.InnerVLA");
        assert!(outer.variable_size);
        for n in [0usize, 2, 7] {
            // by hand: nested starts at 8, inner is 8 + 8n, outer aligned to 8
            let by_hand = 8 + 8 + 8 * n;
            assert_eq!(outer.size_for_count(n).unwrap(), by_hand);
            let formula = outer.fixed_size + inner.size_for_count(n).unwrap() - inner.fixed_size;
            assert_eq!(formula.next_multiple_of(outer.alignment), by_hand);
        }
        let value = Value::from("shrt 1 nested {n 2 data {1.5 2.5}}");
        assert_eq!(outer.size_for_value(&value).unwrap(), 32);
        let bytes = ctx.struct_to_binary("Outer", &value).unwrap();
        let back = ctx.struct_from_binary("Outer", &bytes).unwrap();
        assert_eq!(back.get("nested").unwrap().get("data").unwrap().to_string(), "1.5 2.5");
    }

    #[test]
    fn variable_size_rules() {
        let ctx = Context::default();
        let opts = StructOptions::default();
        assert!(ctx.define_struct("A", &Value::from("v int[n] n int"), opts).is_err());
        assert!(ctx.define_struct("B", &Value::from("n double v int[n]"), opts).is_err());
        assert!(ctx.define_struct("C", &Value::from("v int[v]"), opts).is_err());
        assert!(
            ctx.define_struct("D", &Value::from("s {uint structsize} n int v int[n]"), opts)
                .is_err()
        );
        define(&ctx, "Tail", "n int v int[n]");
        assert!(ctx.define_struct("E", &Value::from("t struct.Tail x int"), opts).is_err());
        assert!(ctx.define_struct("F", &Value::from("t struct.Tail[2]"), opts).is_err());
    }

    #[test]
    fn buffer_tails_count_their_own_units() {
        let ctx = Context::default();
        define(&ctx, "Blob", "n int d bytes[n]");
        let value = Value::dict([("d", Value::Bytes(vec![1, 2, 3]))]);
        let bytes = ctx.struct_to_binary("Blob", &value).unwrap();
        let back = ctx.struct_from_binary("Blob", &bytes).unwrap();
        assert_eq!(back.get("n"), Some(Value::Int(3)));
        assert_eq!(back.get("d"), Some(Value::Bytes(vec![1, 2, 3])));

        define(&ctx, "Wide", "n int w winchars[n]");
        let text = "h\u{e9}\u{1f600}";
        let value = Value::dict([("w", Value::from(text))]);
        let bytes = ctx.struct_to_binary("Wide", &value).unwrap();
        let back = ctx.struct_from_binary("Wide", &bytes).unwrap();
        assert_eq!(back.get("n"), Some(Value::Int(5)), "four UTF-16 units and a NUL");
        assert_eq!(back.get("w"), Some(Value::from(text)));

        define(&ctx, "Sjis", "n int s chars.shift_jis[n]");
        let value = Value::dict([("s", Value::from("\u{65e5}\u{672c}"))]);
        let back = ctx
            .struct_from_binary("Sjis", &ctx.struct_to_binary("Sjis", &value).unwrap())
            .unwrap();
        assert_eq!(back.get("n"), Some(Value::Int(5)));
        assert_eq!(back.get("s"), Some(Value::from("\u{65e5}\u{672c}")));
    }

    #[test]
    fn defaults_clear_and_structsize() {
        let ctx = Context::default();
        define(&ctx, "Hdr", "size {uint structsize} kind {int {default 7}} flags int");
        let bytes = ctx
            .struct_to_binary("Hdr", &Value::from("flags 1"))
            .unwrap();
        let back = ctx.struct_from_binary("Hdr", &bytes).unwrap();
        assert_eq!(back.to_string(), "size 12 kind 7 flags 1");
        assert!(ctx.struct_to_binary("Hdr", &Value::from("kind 1")).is_err());
        ctx.define_struct("Loose", &Value::from("a int b int"), StructOptions { pack: 0, clear: true })
            .unwrap();
        let back = ctx
            .struct_from_binary("Loose", &ctx.struct_to_binary("Loose", &Value::from("b 2")).unwrap())
            .unwrap();
        assert_eq!(back.to_string(), "a 0 b 2");
    }

    #[test]
    fn native_instances_and_field_access() {
        let ctx = Context::default();
        define(&ctx, "Vec", "n ushort items int[n]");
        let ptr = Value::Pointer(ctx.struct_allocate("Vec", 3).unwrap());
        assert_eq!(ctx.struct_get("Vec", &ptr, "n", None).unwrap(), Value::Int(3));
        ctx.struct_set("Vec", &ptr, "items", &Value::from(9), Some(2)).unwrap();
        assert_eq!(ctx.struct_get("Vec", &ptr, "items", None).unwrap().to_string(), "0 0 9");
        let err = ctx.struct_set("Vec", &ptr, "n", &Value::from(4), None).unwrap_err();
        assert!(err.message.contains("derived"), "{}", err.message);
        assert!(ctx.struct_get("Vec", &ptr, "items", Some(3)).is_err());
        ctx.struct_free(&ptr).unwrap();
        assert!(ctx.struct_get("Vec", &ptr, "n", None).is_err(), "freed pointer is rejected");
    }

    #[test]
    fn new_and_read_back() {
        let ctx = Context::default();
        define(&ctx, "Point", "x int y int");
        let p = ctx.struct_new("Point", &Value::from("x 3 y 4")).unwrap();
        assert_eq!(p.tag.as_deref(), Some("::Point"));
        let v = ctx.struct_from_native_at("Point", &Value::Pointer(p.clone())).unwrap();
        assert_eq!(v.to_string(), "x 3 y 4");
        let other = ctx.struct_new("Point", &Value::from("x 1")).unwrap_err();
        assert_eq!(other.code, ErrorCode::InvalidValue);
        ctx.struct_free(&Value::Pointer(p)).unwrap();
    }
}
