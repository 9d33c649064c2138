//! Conversion of single values and arrays between host values and native
//! memory.
//!
//! All functions taking raw addresses are `unsafe`: the caller guarantees
//! the memory is valid for the full size of the type being converted.

use std::ptr::{read_unaligned, write_unaligned};

use crate::{
    AlienError, ArenaFrame, Context, PointerValue, Result, Value,
    attrs::AttrFlags,
    base_type::BaseType,
    encoding::{EncodingPolicy, decode_utf16, decode_utf32, encode_utf16, encode_utf32},
    enums::mask_literals,
    types::{ArraySize, TypeAndAttrs, TypeTag},
};

/// Reads an integer of `base`'s width and signedness.
///
/// # Safety
/// `src` must be valid for reads of `base.size()` bytes.
pub(crate) unsafe fn read_int(base: BaseType, src: *const u8) -> i128 {
    unsafe {
        match (base.size(), base.is_signed()) {
            (1, true) => read_unaligned(src as *const i8) as i128,
            (1, false) => read_unaligned(src) as i128,
            (2, true) => read_unaligned(src as *const i16) as i128,
            (2, false) => read_unaligned(src as *const u16) as i128,
            (4, true) => read_unaligned(src as *const i32) as i128,
            (4, false) => read_unaligned(src as *const u32) as i128,
            (8, true) => read_unaligned(src as *const i64) as i128,
            (8, false) => read_unaligned(src as *const u64) as i128,
            (size, _) => unreachable!("no integer type of size {size}"),
        }
    }
}

/// Writes `value`, which must already be range checked for `base`.
///
/// # Safety
/// `dest` must be valid for writes of `base.size()` bytes.
pub(crate) unsafe fn write_int(base: BaseType, dest: *mut u8, value: i128) {
    unsafe {
        match base.size() {
            1 => write_unaligned(dest, value as u8),
            2 => write_unaligned(dest as *mut u16, value as u16),
            4 => write_unaligned(dest as *mut u32, value as u32),
            8 => write_unaligned(dest as *mut u64, value as u64),
            size => unreachable!("no integer type of size {size}"),
        }
    }
}

pub(crate) unsafe fn read_address(src: *const u8) -> usize {
    unsafe { read_unaligned(src as *const usize) }
}

pub(crate) unsafe fn write_address(dest: *mut u8, address: usize) {
    unsafe { write_unaligned(dest as *mut usize, address) }
}

/// Counts code units of `unit` bytes up to the first zero unit.
pub(crate) unsafe fn terminated_len(src: *const u8, unit: usize, limit: Option<usize>) -> usize {
    let mut n = 0;
    loop {
        if limit.is_some_and(|l| n >= l) {
            return n;
        }
        let zero = unsafe {
            std::slice::from_raw_parts(src.add(n * unit), unit)
                .iter()
                .all(|&b| b == 0)
        };
        if zero {
            return n;
        }
        n += 1;
    }
}

fn no_arena() -> AlienError {
    AlienError::allocation("Conversion requires an active arena frame.")
}

/// Resolves the element count of `ta`, using `dynamic` for variable
/// length arrays.
pub(crate) fn resolve_count(ta: &TypeAndAttrs, dynamic: Option<usize>) -> Result<Option<usize>> {
    match &ta.ty.count {
        ArraySize::Scalar => Ok(None),
        ArraySize::Fixed(n) => Ok(Some(*n)),
        ArraySize::Dynamic(name) => {
            let n = dynamic.ok_or_else(|| {
                AlienError::invalid(format!(
                    "Element count \"{name}\" cannot be determined."
                ))
            })?;
            array_bytes(ta, n)?;
            Ok(Some(n))
        }
    }
}

/// Native size of `count` elements of `ta`, rejecting sizes past the
/// address space.
pub(crate) fn array_bytes(ta: &TypeAndAttrs, count: usize) -> Result<usize> {
    count
        .checked_mul(ta.ty.base_size)
        .filter(|&size| size <= isize::MAX as usize)
        .ok_or_else(|| {
            AlienError::invalid(format!(
                "Array of {count} elements of type \"{}\" is too large.",
                ta.ty.base.token()
            ))
        })
}

/// Elements a fixed buffer of `ta` needs to hold `value`: the raw length
/// for `bytes`, the encoded text and its terminator otherwise.
pub(crate) fn buffer_count(ta: &TypeAndAttrs, value: &Value) -> Result<usize> {
    let bytes = match ta.ty.base {
        BaseType::Bytes => return Ok(value.as_bytes().len()),
        BaseType::UniChars => (value.to_string().chars().count() + 1) * 4,
        BaseType::WinChars => (value.to_string().encode_utf16().count() + 1) * 2,
        _ => {
            // Lossy encoding has the same length whenever strict succeeds.
            let enc = ta.ty.encoding();
            enc.encode(&value.to_string(), EncodingPolicy::Lossy)?.len() + enc.unit_size()
        }
    };
    Ok(bytes.div_ceil(ta.ty.base_size))
}

impl Context {
    /// Native bytes of `text` for a string type, including the terminator.
    pub(crate) fn encode_text(&self, ta: &TypeAndAttrs, text: &str) -> Result<Vec<u8>> {
        let (mut bytes, unit) = match ta.ty.base {
            BaseType::UniString | BaseType::UniChars => (encode_utf32(text), 4),
            BaseType::WinString | BaseType::WinChars => (encode_utf16(text), 2),
            _ => {
                let enc = ta.ty.encoding();
                (enc.encode(text, self.encoding_policy())?, enc.unit_size())
            }
        };
        bytes.extend(std::iter::repeat_n(0, unit));
        Ok(bytes)
    }

    fn decode_text(&self, ta: &TypeAndAttrs, bytes: &[u8]) -> Result<String> {
        let policy = self.encoding_policy();
        match ta.ty.base {
            BaseType::UniString | BaseType::UniChars => decode_utf32(bytes, policy),
            BaseType::WinString | BaseType::WinChars => decode_utf16(bytes, policy),
            _ => ta.ty.encoding().decode(bytes, policy),
        }
    }

    fn text_unit(ta: &TypeAndAttrs) -> usize {
        match ta.ty.base {
            BaseType::UniString | BaseType::UniChars => 4,
            BaseType::WinString | BaseType::WinChars => 2,
            _ => ta.ty.encoding().unit_size(),
        }
    }

    /// Integer value for an integer typed declaration, applying enum and
    /// bitmask mappings and the range of the target width.
    pub(crate) fn integer_from_value(&self, ta: &TypeAndAttrs, value: &Value) -> Result<i128> {
        let base = ta.ty.base;
        let raw = if ta.has(AttrFlags::BITMASK) {
            let bits = match &ta.enum_def {
                Some(def) => def.mask(value)?,
                None => mask_literals(value)?,
            };
            if !base.is_signed() && bits < 0 {
                bits as u64 as i128
            } else {
                bits as i128
            }
        } else if let Some(def) = ta.enum_def.as_ref().filter(|_| ta.has(AttrFlags::ENUM)) {
            def.resolve(value)? as i128
        } else {
            value.as_integer()?
        };
        let Some((lo, hi)) = base.integer_bounds() else {
            unreachable!("{} is not an integer type", base.token())
        };
        if raw < lo || raw > hi {
            return Err(AlienError::range(base.token(), value));
        }
        Ok(raw)
    }

    fn integer_to_value(&self, ta: &TypeAndAttrs, raw: i128) -> Value {
        let Some(def) = &ta.enum_def else {
            return Value::from_i128(raw);
        };
        if ta.has(AttrFlags::BITMASK) {
            let names = def.unmask(raw as i64);
            if names.is_empty() {
                Value::from_i128(raw)
            } else {
                Value::List(names)
            }
        } else {
            def.name_of(raw as i64)
                .map(Value::from)
                .unwrap_or_else(|| Value::from_i128(raw))
        }
    }

    /// Address for a pointer typed declaration after null, tag and
    /// registration checks.
    pub(crate) fn pointer_from_value(&self, ta: &TypeAndAttrs, value: &Value) -> Result<usize> {
        let ptr = if value.is_empty_string() {
            PointerValue::null(None)
        } else {
            value.as_pointer()?
        };
        if ptr.is_null() {
            return if ta.has(AttrFlags::NULLOK) {
                Ok(0)
            } else {
                Err(AlienError::null_not_allowed())
            };
        }
        if !ta.has(AttrFlags::UNSAFE) {
            let want = ta.ty.pointer_tag();
            if !self.pointers.tag_compatible(ptr.tag.as_deref(), want) {
                return Err(AlienError::tag_mismatch(
                    want.unwrap_or(""),
                    &Value::Pointer(ptr),
                ));
            }
            self.pointers.check(&ptr)?;
        }
        Ok(ptr.address)
    }

    /// Wraps a native address, registering it unless declared unsafe.
    pub(crate) fn wrap_pointer(&self, ta: &TypeAndAttrs, address: usize) -> Result<Value> {
        let ptr = PointerValue::new(address, ta.ty.pointer_tag());
        if !ptr.is_null() && !ta.has(AttrFlags::UNSAFE) {
            self.pointers.register(&ptr, ta.has(AttrFlags::COUNTED))?;
        }
        Ok(Value::Pointer(ptr))
    }

    fn buffer_to_arena(&self, bytes: &[u8], frame: Option<&ArenaFrame>) -> Result<usize> {
        let frame = frame.ok_or_else(no_arena)?;
        let dest = frame.allocate(bytes.len())?;
        // SAFETY: freshly allocated block of bytes.len() bytes
        unsafe { dest.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len()) };
        Ok(dest as usize)
    }

    /// Converts one element.
    ///
    /// # Safety
    /// `dest` must be valid for writes of `ta.ty.base_size` bytes.
    pub(crate) unsafe fn scalar_to_native(
        &self,
        ta: &TypeAndAttrs,
        value: &Value,
        dest: *mut u8,
        frame: Option<&ArenaFrame>,
    ) -> Result<()> {
        let base = ta.ty.base;
        match base {
            BaseType::Void => {
                return Err(AlienError::invalid("Cannot convert a value to void."));
            }
            BaseType::SChar
            | BaseType::UChar
            | BaseType::Short
            | BaseType::UShort
            | BaseType::Int
            | BaseType::UInt
            | BaseType::Long
            | BaseType::ULong
            | BaseType::LongLong
            | BaseType::ULongLong => {
                let v = self.integer_from_value(ta, value)?;
                unsafe { write_int(base, dest, v) };
            }
            BaseType::Float => {
                let v = value.as_double()?;
                if v.is_finite() && v.abs() > f32::MAX as f64 {
                    return Err(AlienError::range("float", value));
                }
                unsafe { write_unaligned(dest as *mut f32, v as f32) };
            }
            BaseType::Double => unsafe { write_unaligned(dest as *mut f64, value.as_double()?) },
            BaseType::Pointer => {
                let address = self.pointer_from_value(ta, value)?;
                unsafe { write_address(dest, address) };
            }
            BaseType::String | BaseType::UniString | BaseType::WinString => {
                let text = value.to_string();
                let address = if text.is_empty() && ta.has(AttrFlags::NULLIFEMPTY) {
                    0
                } else {
                    self.buffer_to_arena(&self.encode_text(ta, &text)?, frame)?
                };
                unsafe { write_address(dest, address) };
            }
            BaseType::Binary => {
                let bytes = value.as_bytes();
                let address = if bytes.is_empty() && ta.has(AttrFlags::NULLIFEMPTY) {
                    0
                } else {
                    self.buffer_to_arena(&bytes, frame)?
                };
                unsafe { write_address(dest, address) };
            }
            BaseType::Struct => {
                let TypeTag::Struct(sd) = &ta.ty.tag else {
                    unreachable!("struct type without descriptor")
                };
                unsafe { self.struct_to_native(sd, value, dest, frame)? };
            }
            BaseType::Chars | BaseType::UniChars | BaseType::WinChars | BaseType::Bytes => {
                let count = resolve_count(ta, None)?.unwrap_or(1);
                unsafe { self.chars_to_native(ta, value, dest, count)? };
            }
        }
        Ok(())
    }

    /// # Safety
    /// `src` must be valid for reads of `ta.ty.base_size` bytes.
    pub(crate) unsafe fn scalar_from_native(&self, ta: &TypeAndAttrs, src: *const u8) -> Result<Value> {
        let base = ta.ty.base;
        match base {
            BaseType::Void => Ok(Value::Empty),
            BaseType::SChar
            | BaseType::UChar
            | BaseType::Short
            | BaseType::UShort
            | BaseType::Int
            | BaseType::UInt
            | BaseType::Long
            | BaseType::ULong
            | BaseType::LongLong
            | BaseType::ULongLong => Ok(self.integer_to_value(ta, unsafe { read_int(base, src) })),
            BaseType::Float => Ok(Value::Double(unsafe { read_unaligned(src as *const f32) } as f64)),
            BaseType::Double => Ok(Value::Double(unsafe { read_unaligned(src as *const f64) })),
            BaseType::Pointer => self.wrap_pointer(ta, unsafe { read_address(src) }),
            BaseType::String | BaseType::UniString | BaseType::WinString => {
                let address = unsafe { read_address(src) };
                if address == 0 {
                    return Ok(Value::Str(String::new()));
                }
                let unit = Self::text_unit(ta);
                let text = address as *const u8;
                let len = unsafe { terminated_len(text, unit, None) };
                let bytes = unsafe { std::slice::from_raw_parts(text, len * unit) };
                Ok(Value::Str(self.decode_text(ta, bytes)?))
            }
            BaseType::Binary => Err(AlienError::invalid(
                "Binary values cannot be converted from native memory.",
            )),
            BaseType::Struct => {
                let TypeTag::Struct(sd) = &ta.ty.tag else {
                    unreachable!("struct type without descriptor")
                };
                unsafe { self.struct_from_native(sd, src) }
            }
            BaseType::Chars | BaseType::UniChars | BaseType::WinChars | BaseType::Bytes => {
                let count = resolve_count(ta, None)?.unwrap_or(1);
                unsafe { self.chars_from_native(ta, src, count) }
            }
        }
    }

    /// Fixed buffers are converted whole. `count` is in elements of the
    /// buffer's unit.
    unsafe fn chars_to_native(
        &self,
        ta: &TypeAndAttrs,
        value: &Value,
        dest: *mut u8,
        count: usize,
    ) -> Result<()> {
        let capacity = array_bytes(ta, count)?;
        let bytes = match ta.ty.base {
            BaseType::Bytes => {
                let bytes = value.as_bytes();
                if bytes.len() > capacity {
                    return Err(AlienError::invalid(format!(
                        "Byte array of length {} does not fit in {capacity} bytes.",
                        bytes.len()
                    )));
                }
                bytes
            }
            _ => {
                let bytes = self.encode_text(ta, &value.to_string())?;
                if bytes.len() > capacity {
                    return Err(AlienError::invalid_value(
                        &format!("String does not fit in {count} characters."),
                        value,
                    ));
                }
                bytes
            }
        };
        unsafe {
            dest.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            dest.add(bytes.len()).write_bytes(0, capacity - bytes.len());
        }
        Ok(())
    }

    unsafe fn chars_from_native(&self, ta: &TypeAndAttrs, src: *const u8, count: usize) -> Result<Value> {
        let capacity = array_bytes(ta, count)?;
        if ta.ty.base == BaseType::Bytes {
            let bytes = unsafe { std::slice::from_raw_parts(src, capacity) };
            return Ok(Value::Bytes(bytes.to_vec()));
        }
        let unit = Self::text_unit(ta);
        let len = unsafe { terminated_len(src, unit, Some(capacity / unit)) };
        let bytes = unsafe { std::slice::from_raw_parts(src, len * unit) };
        Ok(Value::Str(self.decode_text(ta, bytes)?))
    }

    /// # Safety
    /// `dest` must be valid for `count` elements.
    pub(crate) unsafe fn array_to_native(
        &self,
        ta: &TypeAndAttrs,
        value: &Value,
        dest: *mut u8,
        count: usize,
        frame: Option<&ArenaFrame>,
    ) -> Result<()> {
        if ta.ty.base.is_char_array() {
            return unsafe { self.chars_to_native(ta, value, dest, count) };
        }
        let items = value.as_list()?;
        if items.len() > count {
            return Err(AlienError::invalid(format!(
                "Array has {} elements but only {count} are allowed.",
                items.len()
            )));
        }
        let elem = ta.ty.base_size;
        for (i, item) in items.iter().enumerate() {
            unsafe { self.scalar_to_native(ta, item, dest.add(i * elem), frame)? };
        }
        // Unspecified trailing elements are zeroed.
        unsafe {
            dest.add(items.len() * elem)
                .write_bytes(0, (count - items.len()) * elem)
        };
        Ok(())
    }

    /// # Safety
    /// `src` must be valid for `count` elements.
    pub(crate) unsafe fn array_from_native(
        &self,
        ta: &TypeAndAttrs,
        src: *const u8,
        count: usize,
    ) -> Result<Value> {
        if ta.ty.base.is_char_array() {
            return unsafe { self.chars_from_native(ta, src, count) };
        }
        let elem = ta.ty.base_size;
        (0..count)
            .map(|i| unsafe { self.scalar_from_native(ta, src.add(i * elem)) })
            .collect::<Result<Vec<_>>>()
            .map(Value::List)
    }

    /// Converts a scalar or an array, `count` being the resolved element
    /// count for arrays.
    ///
    /// # Safety
    /// `dest` must be valid for the whole converted size.
    pub(crate) unsafe fn value_to_native(
        &self,
        ta: &TypeAndAttrs,
        value: &Value,
        dest: *mut u8,
        count: Option<usize>,
        frame: Option<&ArenaFrame>,
    ) -> Result<()> {
        match count {
            Some(n) => unsafe { self.array_to_native(ta, value, dest, n, frame) },
            None => unsafe { self.scalar_to_native(ta, value, dest, frame) },
        }
    }

    /// # Safety
    /// `src` must be valid for the whole converted size.
    pub(crate) unsafe fn value_from_native(
        &self,
        ta: &TypeAndAttrs,
        src: *const u8,
        count: Option<usize>,
    ) -> Result<Value> {
        match count {
            Some(n) => unsafe { self.array_from_native(ta, src, n) },
            None => unsafe { self.scalar_from_native(ta, src) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContextCreateInfo, EncodingPolicy, ErrorCode, ParseMode};

    fn field(ctx: &Context, decl: &str) -> TypeAndAttrs {
        ctx.parse_type_and_attrs(&Value::from(decl), ParseMode::Field)
            .unwrap()
    }

    fn to_native(ctx: &Context, decl: &str, value: Value) -> Result<[u8; 64]> {
        let ta = field(ctx, decl);
        let mut buf = [0u8; 64];
        let frame = ctx.arena_frame(0)?;
        let count = resolve_count(&ta, None)?;
        unsafe { ctx.value_to_native(&ta, &value, buf.as_mut_ptr(), count, Some(&frame))? };
        Ok(buf)
    }

    #[test]
    fn integer_ranges_are_enforced() {
        let ctx = Context::default();
        assert_eq!(to_native(&ctx, "uchar", Value::from(255)).unwrap()[0], 255);
        let err = to_native(&ctx, "uchar", Value::from(256)).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidValue);
        assert!(err.message.contains("out of range"), "{}", err.message);
        assert!(to_native(&ctx, "uint", Value::from(-1)).is_err());
        assert!(to_native(&ctx, "schar", Value::from(-128)).is_ok());
        assert!(to_native(&ctx, "schar", Value::from(-129)).is_err());
        assert!(to_native(&ctx, "ulonglong", Value::Wide(u64::MAX)).is_ok());
        assert!(to_native(&ctx, "int", Value::from("abc")).is_err());
    }

    #[test]
    fn scalars_round_trip() {
        let ctx = Context::default();
        let cases = [
            ("short", Value::from(-1234)),
            ("ulonglong", Value::Wide(u64::MAX)),
            ("double", Value::Double(2.5)),
            ("float", Value::Double(0.25)),
            ("int[3]", Value::list([Value::from(1), Value::from(2), Value::from(3)])),
            ("chars[8]", Value::from("abc")),
            ("winchars[4]", Value::from("h\u{e9}")),
        ];
        for (decl, value) in cases {
            let ta = field(&ctx, decl);
            let count = resolve_count(&ta, None).unwrap();
            let buf = to_native(&ctx, decl, value.clone()).unwrap();
            let back = unsafe { ctx.value_from_native(&ta, buf.as_ptr(), count) }.unwrap();
            assert_eq!(back, value, "{decl}");
        }
    }

    #[test]
    fn short_arrays_are_zero_filled() {
        let ctx = Context::default();
        let buf = to_native(&ctx, "uchar[4]", Value::from("7")).unwrap();
        assert_eq!(&buf[..4], &[7, 0, 0, 0]);
        assert!(to_native(&ctx, "uchar[2]", Value::from("1 2 3")).is_err());
        assert!(to_native(&ctx, "chars[3]", Value::from("abc")).is_err(), "no room for NUL");
        assert!(to_native(&ctx, "bytes[3]", Value::Bytes(vec![1, 2, 3])).is_ok());
    }

    #[test]
    fn enum_and_bitmask_mapping() {
        let ctx = Context::default();
        ctx.define_enum_flags("Mode", &Value::from("r w x")).unwrap();
        let buf = to_native(&ctx, "int {enum Mode} bitmask", Value::from("r x")).unwrap();
        assert_eq!(i32::from_ne_bytes(buf[..4].try_into().unwrap()), 5);
        let ta = field(&ctx, "int {enum Mode} bitmask");
        let bits = (5i32 | 64).to_ne_bytes();
        let back = unsafe { ctx.scalar_from_native(&ta, bits.as_ptr()) }.unwrap();
        assert_eq!(back.to_string(), "r x 64", "residual bits survive");
        let zero = 0i32.to_ne_bytes();
        let back = unsafe { ctx.scalar_from_native(&ta, zero.as_ptr()) }.unwrap();
        assert_eq!(back, Value::Int(0));

        let ta = field(&ctx, "int {enum Mode}");
        let two = 2i32.to_ne_bytes();
        let back = unsafe { ctx.scalar_from_native(&ta, two.as_ptr()) }.unwrap();
        assert_eq!(back, Value::from("w"));
        let three = 3i32.to_ne_bytes();
        let back = unsafe { ctx.scalar_from_native(&ta, three.as_ptr()) }.unwrap();
        assert_eq!(back, Value::Int(3), "unmapped values come back raw");
    }

    #[test]
    fn bitmasks_wider_than_the_field_are_rejected() {
        let ctx = Context::default();
        ctx.define_enum_flags("Bits", &Value::from("b0 b1 b2 b3 b4 b5 b6 b7 b8"))
            .unwrap();
        let decl = "uchar {enum Bits} bitmask";
        assert_eq!(to_native(&ctx, decl, Value::from("b0 b7")).unwrap()[0], 0x81);
        for value in [Value::from("b8"), Value::from("b0 b8"), Value::from(256)] {
            let err = to_native(&ctx, decl, value.clone()).unwrap_err();
            assert_eq!(err.code, ErrorCode::InvalidValue, "{value}");
        }
        assert!(to_native(&ctx, "uchar bitmask", Value::from("1 256")).is_err());
        assert_eq!(
            to_native(&ctx, "ulonglong bitmask", Value::from(-1)).unwrap()[..8],
            [0xff; 8],
            "negative masks fill the unsigned width"
        );
    }

    #[test]
    fn strings_need_an_arena() {
        let ctx = Context::default();
        let ta = field(&ctx, "string");
        let mut slot = [0u8; 8];
        let err = unsafe { ctx.scalar_to_native(&ta, &Value::from("hi"), slot.as_mut_ptr(), None) }
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Allocation);
        let frame = ctx.arena_frame(0).unwrap();
        unsafe {
            ctx.scalar_to_native(&ta, &Value::from("hi"), slot.as_mut_ptr(), Some(&frame))
                .unwrap();
            assert_eq!(ctx.scalar_from_native(&ta, slot.as_ptr()).unwrap(), Value::from("hi"));
        }
        let ta = field(&ctx, "unistring nullifempty");
        unsafe {
            ctx.scalar_to_native(&ta, &Value::from(""), slot.as_mut_ptr(), Some(&frame))
                .unwrap();
        }
        assert_eq!(usize::from_ne_bytes(slot), 0);
    }

    #[test]
    fn encoding_policy_is_configurable() {
        let strict = Context::default();
        let err = to_native(&strict, "chars.ascii[8]", Value::from("caf\u{e9}")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidValue);

        let lossy = Context::new(ContextCreateInfo {
            encoding_policy: EncodingPolicy::Lossy,
            ..Default::default()
        });
        let buf = to_native(&lossy, "chars.ascii[8]", Value::from("caf\u{e9}")).unwrap();
        assert_eq!(&buf[..5], b"caf?\0");
        let buf = to_native(&lossy, "chars.cp1252[8]", Value::from("\u{3b1}\u{20ac}")).unwrap();
        assert_eq!(&buf[..3], b"?\x80\0");
    }

    #[test]
    fn labelled_encodings_convert_through_fixed_buffers() {
        let ctx = Context::default();
        let text = Value::from("\u{65e5}\u{672c}");
        let buf = to_native(&ctx, "chars.shift_jis[8]", text.clone()).unwrap();
        assert_eq!(&buf[..5], &[0x93, 0xfa, 0x96, 0x7b, 0]);
        let ta = field(&ctx, "chars.shift_jis[8]");
        let back = unsafe { ctx.value_from_native(&ta, buf.as_ptr(), Some(8)) }.unwrap();
        assert_eq!(back, text);
        assert!(to_native(&ctx, "chars.shift_jis[4]", text).is_err(), "no room for NUL");
        let err = to_native(&ctx, "chars.koi8-r[8]", Value::from("\u{e9}")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidValue);
    }

    #[test]
    fn pointer_checks() {
        let ctx = Context::default();
        let p = ctx.pointer_safe(0x5000, Some("T")).unwrap();
        let ta = field(&ctx, "pointer.T");
        assert_eq!(ctx.pointer_from_value(&ta, &Value::Pointer(p.clone())).unwrap(), 0x5000);
        let err = ctx.pointer_from_value(&ta, &Value::from(0)).unwrap_err();
        assert!(err.message.contains("Null"), "{}", err.message);
        let other = PointerValue::new(0x6000, Some("U"));
        let err = ctx.pointer_from_value(&ta, &Value::Pointer(other.clone())).unwrap_err();
        assert_eq!(err.code, ErrorCode::PointerRegistration);
        let unregistered = PointerValue::new(0x7000, Some("T"));
        assert!(ctx.pointer_from_value(&ta, &Value::Pointer(unregistered.clone())).is_err());
        let unsafe_ta = field(&ctx, "pointer.T unsafe");
        assert!(ctx.pointer_from_value(&unsafe_ta, &Value::Pointer(unregistered)).is_ok());
        let nullok = field(&ctx, "pointer.T nullok");
        assert_eq!(ctx.pointer_from_value(&nullok, &Value::Empty).unwrap(), 0);
    }

    #[test]
    fn returned_pointers_are_registered() {
        let ctx = Context::default();
        let ta = field(&ctx, "pointer.Buf counted");
        let raw = 0x9000usize.to_ne_bytes();
        let a = unsafe { ctx.scalar_from_native(&ta, raw.as_ptr()) }.unwrap();
        let _b = unsafe { ctx.scalar_from_native(&ta, raw.as_ptr()) }.unwrap();
        ctx.pointer_dispose(&a).unwrap();
        assert!(ctx.pointer_is_valid(&a), "second reference still holds");
        ctx.pointer_dispose(&a).unwrap();
        assert!(!ctx.pointer_is_valid(&a));
    }
}
