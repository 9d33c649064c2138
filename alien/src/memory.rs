//! Raw native memory exposed to the interpreter through safe pointers.

use crate::{
    AlienError, Context, PointerValue, Result, Value,
    attrs::ParseMode,
    codec::{resolve_count, terminated_len},
    encoding::Encoding,
    types::TypeAndAttrs,
};

/// Native size of a memory declaration. Variable size structs are sized
/// from `value`, or from the instance at `native` when reading.
fn declared_size(ta: &TypeAndAttrs, value: Option<&Value>, native: Option<*const u8>) -> Result<usize> {
    let count = resolve_count(ta, None)?;
    if let Some(sd) = ta.ty.struct_def()
        && sd.variable_size
    {
        if count.is_some() {
            return Err(AlienError::invalid(format!(
                "Arrays of variable size struct \"{}\" are not supported.",
                sd.name
            )));
        }
        return match (value, native) {
            (Some(v), _) => sd.size_for_value(v),
            (None, Some(src)) => unsafe { sd.size_for_native(src) },
            (None, None) => Ok(sd.size),
        };
    }
    Ok(ta.ty.layout().0)
}

fn malloc(size: usize) -> Result<*mut u8> {
    // SAFETY: malloc with a non-zero size
    let raw = unsafe { libc::malloc(size.max(1)) }.cast::<u8>();
    if raw.is_null() {
        return Err(AlienError::allocation(format!("Could not allocate {size} bytes.")));
    }
    Ok(raw)
}

impl Context {
    fn memory_decl(&self, decl: &Value) -> Result<(TypeAndAttrs, Option<usize>)> {
        let ta = self.parse_type_and_attrs(decl, ParseMode::Field)?;
        let count = resolve_count(&ta, None)?;
        Ok((ta, count))
    }

    /// Tag given to typed allocations so struct accessors accept them.
    fn memory_tag(ta: &TypeAndAttrs) -> Option<&str> {
        ta.ty.struct_def().map(|sd| sd.name.as_str())
    }

    fn memory_encoding(&self, name: &str) -> Result<Encoding> {
        if name.is_empty() {
            return Ok(self.info.system_encoding);
        }
        Encoding::from_name(name).ok_or_else(|| AlienError::encoding(name))
    }

    /// Registered, non-null address of `ptr` advanced by `offset`.
    fn memory_address(&self, ptr: &Value, offset: usize) -> Result<*mut u8> {
        let p = ptr.as_pointer()?;
        if p.is_null() {
            return Err(AlienError::null_not_allowed());
        }
        self.pointers.check(&p)?;
        Ok(unsafe { p.as_ptr().add(offset) })
    }

    /// Allocates `size` uninitialised bytes.
    pub fn memory_allocate(&self, size: usize, tag: Option<&str>) -> Result<PointerValue> {
        let ptr = PointerValue::new(malloc(size)? as usize, tag);
        if let Err(err) = self.pointers.register(&ptr, false) {
            // SAFETY: allocated above and never handed out
            unsafe { libc::free(ptr.as_ptr().cast()) };
            return Err(err);
        }
        log::trace!("allocated {size} bytes at {ptr}");
        Ok(ptr)
    }

    /// Frees memory from `memory_allocate`, `memory_new`,
    /// `memory_from_binary` or `memory_from_string`. Null is a no-op.
    pub fn memory_free(&self, ptr: &Value) -> Result<()> {
        let p = ptr.as_pointer()?;
        if p.is_null() {
            return Ok(());
        }
        self.pointers.unregister(&p)?;
        // SAFETY: the pointer was registered by one of the allocators above
        unsafe { libc::free(p.as_ptr().cast()) };
        Ok(())
    }

    /// Allocates memory for `decl` initialised from `value`.
    pub fn memory_new(&self, decl: &Value, value: &Value) -> Result<PointerValue> {
        let (ta, count) = self.memory_decl(decl)?;
        let size = declared_size(&ta, Some(value), None)?;
        let ptr = self.memory_allocate(size, Self::memory_tag(&ta))?;
        let converted = unsafe {
            ptr.as_ptr().write_bytes(0, size);
            self.value_to_native(&ta, value, ptr.as_ptr(), count, None)
        };
        if let Err(err) = converted {
            self.memory_free(&Value::Pointer(ptr))?;
            return Err(err);
        }
        Ok(ptr)
    }

    /// Reads a value of type `decl` at `offset` bytes past `ptr`.
    pub fn memory_get(&self, ptr: &Value, decl: &Value, offset: usize) -> Result<Value> {
        let (ta, count) = self.memory_decl(decl)?;
        let src = self.memory_address(ptr, offset)?;
        unsafe { self.value_from_native(&ta, src, count) }
    }

    pub fn memory_set(&self, ptr: &Value, decl: &Value, value: &Value, offset: usize) -> Result<()> {
        let (ta, count) = self.memory_decl(decl)?;
        let dest = self.memory_address(ptr, offset)?;
        unsafe { self.value_to_native(&ta, value, dest, count, None) }
    }

    pub fn memory_to_binary(&self, ptr: &Value, size: usize, offset: usize) -> Result<Vec<u8>> {
        let src = self.memory_address(ptr, offset)?;
        Ok(unsafe { std::slice::from_raw_parts(src, size) }.to_vec())
    }

    /// Copies `bytes` into a new allocation.
    pub fn memory_from_binary(&self, bytes: &[u8], tag: Option<&str>) -> Result<PointerValue> {
        let ptr = self.memory_allocate(bytes.len(), tag)?;
        unsafe { ptr.as_ptr().copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        Ok(ptr)
    }

    /// Decodes a terminated string at `ptr`.
    pub fn memory_to_string(&self, ptr: &Value, encoding: &str, offset: usize) -> Result<String> {
        let enc = self.memory_encoding(encoding)?;
        let src = self.memory_address(ptr, offset)?;
        let unit = enc.unit_size();
        let bytes = unsafe {
            let len = terminated_len(src, unit, None);
            std::slice::from_raw_parts(src, len * unit)
        };
        enc.decode(bytes, self.encoding_policy())
    }

    /// Encodes `text` with a terminator into a new allocation.
    pub fn memory_from_string(&self, text: &str, encoding: &str) -> Result<PointerValue> {
        let enc = self.memory_encoding(encoding)?;
        let mut bytes = enc.encode(text, self.encoding_policy())?;
        bytes.extend(std::iter::repeat_n(0, enc.unit_size()));
        self.memory_from_binary(&bytes, None)
    }

    pub fn memory_fill(&self, ptr: &Value, byte: u8, count: usize, offset: usize) -> Result<()> {
        let dest = self.memory_address(ptr, offset)?;
        unsafe { dest.write_bytes(byte, count) };
        Ok(())
    }

    /// Native size of `decl`, sized from `value` for variable size structs.
    pub fn memory_size(&self, decl: &Value, value: Option<&Value>) -> Result<usize> {
        let (ta, _) = self.memory_decl(decl)?;
        declared_size(&ta, value, None)
    }

    /// Allocates `decl` in the innermost arena frame initialised from
    /// `value`. The pointer is released when the frame pops.
    pub fn arena_new(&self, decl: &Value, value: &Value) -> Result<PointerValue> {
        let (ta, count) = self.memory_decl(decl)?;
        let size = declared_size(&ta, Some(value), None)?;
        let ptr = self.arena_allocate(size, Self::memory_tag(&ta))?;
        unsafe { self.value_to_native(&ta, value, ptr.as_ptr(), count, None)? };
        Ok(ptr)
    }

    /// Size of the struct instance at `ptr`, following its count fields.
    pub fn memory_instance_size(&self, ptr: &Value, decl: &Value) -> Result<usize> {
        let (ta, _) = self.memory_decl(decl)?;
        let src = self.memory_address(ptr, 0)?;
        declared_size(&ta, None, Some(src))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ErrorCode, StructOptions};

    #[test]
    fn typed_reads_and_writes() {
        let ctx = Context::default();
        let p = Value::Pointer(ctx.memory_new(&"int[4]".into(), &"1 2 3 4".into()).unwrap());
        assert_eq!(ctx.memory_get(&p, &"int".into(), 8).unwrap(), Value::Int(3));
        ctx.memory_set(&p, &"int".into(), &Value::from(-9), 4).unwrap();
        assert_eq!(ctx.memory_get(&p, &"int[4]".into(), 0).unwrap().to_string(), "1 -9 3 4");
        ctx.memory_fill(&p, 0, 8, 8).unwrap();
        assert_eq!(ctx.memory_to_binary(&p, 4, 12).unwrap(), vec![0; 4]);
        ctx.memory_free(&p).unwrap();
        assert_eq!(
            ctx.memory_get(&p, &"int".into(), 0).unwrap_err().code,
            ErrorCode::PointerRegistration,
            "freed memory is no longer accessible"
        );
    }

    #[test]
    fn strings_round_trip_through_encodings() {
        let ctx = Context::default();
        let p = Value::Pointer(ctx.memory_from_string("h\u{e9}llo", "iso8859-1").unwrap());
        assert_eq!(ctx.memory_to_binary(&p, 6, 0).unwrap(), b"h\xe9llo\0");
        assert_eq!(ctx.memory_to_string(&p, "iso8859-1", 0).unwrap(), "h\u{e9}llo");
        assert_eq!(ctx.memory_to_string(&p, "", 1).unwrap_err().code, ErrorCode::InvalidValue);
        assert!(ctx.memory_from_string("x", "ebcdic").is_err());
        ctx.memory_free(&p).unwrap();
    }

    #[test]
    fn typed_structs_are_tagged() {
        let ctx = Context::default();
        ctx.define_struct("Pair", &"a int b int".into(), StructOptions::default())
            .unwrap();
        let p = Value::Pointer(ctx.memory_new(&"struct.Pair".into(), &"a 1 b 2".into()).unwrap());
        assert_eq!(ctx.struct_get("Pair", &p, "b", None).unwrap(), Value::Int(2));
        assert_eq!(ctx.memory_size(&"struct.Pair".into(), None).unwrap(), 8);
        ctx.memory_free(&p).unwrap();
    }

    #[test]
    fn arena_values_die_with_their_frame() {
        let ctx = Context::default();
        ctx.arena_push().unwrap();
        let p = Value::Pointer(ctx.arena_new(&"double".into(), &Value::from(2.5)).unwrap());
        assert_eq!(ctx.memory_get(&p, &"double".into(), 0).unwrap(), Value::Double(2.5));
        ctx.arena_pop().unwrap();
        assert!(!ctx.pointer_is_valid(&p));
    }
}
